//! Account and identity service boundary.

use std::collections::BTreeMap;
use std::path::Path;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{NotifyError, NotifyResult};

/// An account (project/tenant) that owns workloads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub id: String,
    pub name: String,
    #[serde(default = "enabled_by_default")]
    pub enabled: bool,
    /// The account's own primary contact address, if it has one.
    #[serde(default)]
    pub contact_email: Option<String>,
}

/// A person who can hold roles on accounts and own workloads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default = "enabled_by_default")]
    pub enabled: bool,
    #[serde(default)]
    pub full_name: Option<String>,
}

fn enabled_by_default() -> bool {
    true
}

/// Abstraction over the identity/account service.
///
/// Lookups return `Ok(None)` for "does not exist"; `Err` is reserved for
/// the service itself failing.
#[async_trait]
pub trait IdentityService: Send + Sync {
    /// Find an account by id, falling back to name.
    async fn resolve_account(&self, id_or_name: &str) -> NotifyResult<Option<Account>>;

    /// Users holding `role` on `account`.
    async fn list_role_holders(&self, account: &Account, role: &str) -> NotifyResult<Vec<User>>;

    /// Find a user by id.
    async fn resolve_user(&self, id: &str) -> NotifyResult<Option<User>>;
}

#[derive(Debug, Clone, Deserialize)]
struct AccountRecord {
    #[serde(flatten)]
    account: Account,
    /// Role name -> user ids.
    #[serde(default)]
    roles: BTreeMap<String, Vec<String>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct IdentitySnapshot {
    #[serde(default)]
    accounts: Vec<AccountRecord>,
    #[serde(default)]
    users: Vec<User>,
}

/// Identity service backed by a JSON export of accounts, role assignments and users.
///
/// ```json
/// {
///   "accounts": [{"id": "p1", "name": "proj", "contact_email": "pi@uni.edu",
///                 "roles": {"TenantManager": ["u1"]}}],
///   "users": [{"id": "u1", "name": "jo", "email": "jo@uni.edu"}]
/// }
/// ```
#[derive(Debug, Default)]
pub struct SnapshotIdentity {
    snapshot: IdentitySnapshot,
}

impl SnapshotIdentity {
    /// Load from a JSON file.
    pub fn from_file(path: &Path) -> NotifyResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            NotifyError::config(format!("failed to read identity snapshot {}: {e}", path.display()))
        })?;
        Self::from_json(&content)
    }

    /// Parse from JSON text.
    pub fn from_json(content: &str) -> NotifyResult<Self> {
        Ok(Self {
            snapshot: serde_json::from_str(content)?,
        })
    }

    /// Start an empty snapshot; populate with `with_account`, `with_role` and `with_user`.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an account with no role assignments.
    pub fn with_account(mut self, account: Account) -> Self {
        self.snapshot.accounts.push(AccountRecord {
            account,
            roles: BTreeMap::new(),
        });
        self
    }

    /// Assign `role` on an already added account to the given user ids.
    pub fn with_role(mut self, account_id: &str, role: &str, user_ids: &[&str]) -> Self {
        if let Some(record) = self
            .snapshot
            .accounts
            .iter_mut()
            .find(|r| r.account.id == account_id)
        {
            record
                .roles
                .entry(role.to_string())
                .or_default()
                .extend(user_ids.iter().map(|s| s.to_string()));
        }
        self
    }

    /// Add a user.
    pub fn with_user(mut self, user: User) -> Self {
        self.snapshot.users.push(user);
        self
    }
}

#[async_trait]
impl IdentityService for SnapshotIdentity {
    async fn resolve_account(&self, id_or_name: &str) -> NotifyResult<Option<Account>> {
        let accounts = &self.snapshot.accounts;
        Ok(accounts
            .iter()
            .find(|r| r.account.id == id_or_name)
            .or_else(|| accounts.iter().find(|r| r.account.name == id_or_name))
            .map(|r| r.account.clone()))
    }

    async fn list_role_holders(&self, account: &Account, role: &str) -> NotifyResult<Vec<User>> {
        let Some(record) = self
            .snapshot
            .accounts
            .iter()
            .find(|r| r.account.id == account.id)
        else {
            return Ok(Vec::new());
        };

        Ok(record
            .roles
            .get(role)
            .into_iter()
            .flatten()
            .filter_map(|uid| self.snapshot.users.iter().find(|u| u.id == *uid))
            .cloned()
            .collect())
    }

    async fn resolve_user(&self, id: &str) -> NotifyResult<Option<User>> {
        Ok(self.snapshot.users.iter().find(|u| u.id == id).cloned())
    }
}
