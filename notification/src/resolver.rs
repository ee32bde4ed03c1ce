//! Recipient resolution: workload -> owning account -> contactable addresses.
//!
//! Lookups are memoised in a `ResolutionCache` that the caller owns and passes
//! in for the duration of one run. Nothing here is process-global.

use std::collections::HashMap;
use std::sync::LazyLock;

use regex::Regex;
use tracing::{debug, warn};

use crate::config::RecipientConfig;
use crate::identity::{Account, IdentityService, User};
use crate::workload::Workload;

static ADDRESS_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").expect("ADDRESS_RE must compile")
});

/// Whether `addr` looks like a deliverable mail address.
pub fn is_contactable(addr: &str) -> bool {
    ADDRESS_RE.is_match(addr.trim())
}

/// Append `addr` unless an equal address (ignoring case) is already present.
pub(crate) fn push_unique(list: &mut Vec<String>, addr: &str) {
    let addr = addr.trim();
    if !list.iter().any(|a| a.eq_ignore_ascii_case(addr)) {
        list.push(addr.to_string());
    }
}

/// An account together with the addresses responsible for it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountContacts {
    pub account: Account,
    /// Primary contact first, then role holders in configured role order.
    pub recipients: Vec<String>,
}

/// Outcome of resolving one workload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// The owning account exists and is enabled. `recipients` may still be empty.
    Resolved {
        account: Account,
        recipients: Vec<String>,
    },
    /// The owning account cannot be used; the workload is excluded from the run.
    Unresolved { reason: String },
}

/// Run-scoped memo of account and user lookups.
///
/// Negative results are cached too so a missing account is looked up once.
#[derive(Debug, Default)]
pub struct ResolutionCache {
    accounts: HashMap<String, Result<AccountContacts, String>>,
    users: HashMap<String, Option<User>>,
    hits: usize,
    misses: usize,
}

impl ResolutionCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of account lookups served from the cache.
    pub fn hits(&self) -> usize {
        self.hits
    }

    /// Number of account lookups that went to the identity service.
    pub fn misses(&self) -> usize {
        self.misses
    }

    /// Distinct accounts seen this run.
    pub fn account_count(&self) -> usize {
        self.accounts.len()
    }
}

/// Maps a workload to the ordered, deduplicated list of people to notify.
pub struct RecipientResolver<'a, I: IdentityService + ?Sized> {
    identity: &'a I,
    config: RecipientConfig,
}

impl<'a, I: IdentityService + ?Sized> RecipientResolver<'a, I> {
    pub fn new(identity: &'a I, config: RecipientConfig) -> Self {
        Self { identity, config }
    }

    /// Resolve the recipients for one workload.
    pub async fn resolve(&self, workload: &Workload, cache: &mut ResolutionCache) -> Resolution {
        let contacts = match self.account_contacts(&workload.account_id, cache).await {
            Ok(contacts) => contacts,
            Err(reason) => return Resolution::Unresolved { reason },
        };

        let mut recipients = contacts.recipients;
        if self.config.include_owners {
            if let Some(addr) = self.owner_address(&workload.owner_id, cache).await {
                push_unique(&mut recipients, &addr);
            }
        }

        Resolution::Resolved {
            account: contacts.account,
            recipients,
        }
    }

    async fn account_contacts(
        &self,
        account_id: &str,
        cache: &mut ResolutionCache,
    ) -> Result<AccountContacts, String> {
        if let Some(cached) = cache.accounts.get(account_id) {
            cache.hits += 1;
            return cached.clone();
        }
        cache.misses += 1;

        let resolved = self.lookup_account(account_id).await;
        if let Err(reason) = &resolved {
            warn!(account = %account_id, %reason, "account unresolvable, its workloads are excluded");
        }
        cache
            .accounts
            .insert(account_id.to_string(), resolved.clone());
        resolved
    }

    async fn lookup_account(&self, account_id: &str) -> Result<AccountContacts, String> {
        let account = match self.identity.resolve_account(account_id).await {
            Ok(Some(account)) => account,
            Ok(None) => return Err("account not found".to_string()),
            Err(e) => return Err(format!("identity service error: {e}")),
        };
        if !account.enabled {
            return Err("account disabled".to_string());
        }

        let mut recipients = Vec::new();
        if let Some(addr) = account.contact_email.as_deref() {
            if is_contactable(addr) {
                push_unique(&mut recipients, addr);
            }
        }

        for role in &self.config.roles {
            let holders = match self.identity.list_role_holders(&account, role).await {
                Ok(holders) => holders,
                Err(e) => {
                    warn!(account = %account.id, role = %role, error = %e, "listing role holders failed");
                    continue;
                }
            };
            for user in holders {
                match contact_of(&user) {
                    Some(addr) => push_unique(&mut recipients, addr),
                    None => debug!(user = %user.id, role = %role, "role holder not contactable"),
                }
            }
        }

        Ok(AccountContacts {
            account,
            recipients,
        })
    }

    async fn owner_address(&self, owner_id: &str, cache: &mut ResolutionCache) -> Option<String> {
        if !cache.users.contains_key(owner_id) {
            let user = match self.identity.resolve_user(owner_id).await {
                Ok(user) => user,
                Err(e) => {
                    warn!(user = %owner_id, error = %e, "owner lookup failed");
                    None
                }
            };
            cache.users.insert(owner_id.to_string(), user);
        }

        cache
            .users
            .get(owner_id)
            .and_then(Option::as_ref)
            .and_then(contact_of)
            .map(str::to_string)
    }
}

/// A user's address, if the user is enabled and the address is deliverable.
fn contact_of(user: &User) -> Option<&str> {
    if !user.enabled {
        return None;
    }
    user.email.as_deref().filter(|e| is_contactable(e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::SnapshotIdentity;
    use crate::workload::workload;

    fn account(id: &str, contact: Option<&str>) -> Account {
        Account {
            id: id.to_string(),
            name: format!("{id}-name"),
            enabled: true,
            contact_email: contact.map(str::to_string),
        }
    }

    fn user(id: &str, email: Option<&str>, enabled: bool) -> User {
        User {
            id: id.to_string(),
            name: id.to_string(),
            email: email.map(str::to_string),
            enabled,
            full_name: None,
        }
    }

    fn identity() -> SnapshotIdentity {
        SnapshotIdentity::new()
            .with_account(account("p1", Some("pi@uni.edu")))
            .with_role("p1", "TenantManager", &["m1", "m2", "m3"])
            .with_role("p1", "Member", &["o1"])
            .with_account(Account {
                enabled: false,
                ..account("p2", Some("old@uni.edu"))
            })
            .with_user(user("m1", Some("PI@uni.edu"), true))
            .with_user(user("m2", Some("mgr@uni.edu"), true))
            .with_user(user("m3", Some("not-an-address"), true))
            .with_user(user("o1", Some("owner@uni.edu"), true))
            .with_user(user("o2", Some("gone@uni.edu"), false))
    }

    #[test]
    fn test_is_contactable() {
        assert!(is_contactable("jane.doe@uni.edu.au"));
        assert!(!is_contactable("jane"));
        assert!(!is_contactable("jane@localhost"));
        assert!(!is_contactable(""));
    }

    #[tokio::test]
    async fn test_primary_then_roles_then_owner_deduplicated() {
        let identity = identity();
        let resolver = RecipientResolver::new(&identity, RecipientConfig::default());
        let mut cache = ResolutionCache::new();

        let resolution = resolver.resolve(&workload("w1", "p1", "o1"), &mut cache).await;
        let Resolution::Resolved { account, recipients } = resolution else {
            panic!("expected resolved");
        };
        assert_eq!(account.id, "p1");
        // m1 duplicates the primary contact; m3 has no valid address.
        assert_eq!(recipients, vec!["pi@uni.edu", "mgr@uni.edu", "owner@uni.edu"]);
    }

    #[tokio::test]
    async fn test_disabled_owner_is_excluded() {
        let identity = identity();
        let resolver = RecipientResolver::new(&identity, RecipientConfig::default());
        let mut cache = ResolutionCache::new();

        let Resolution::Resolved { recipients, .. } =
            resolver.resolve(&workload("w1", "p1", "o2"), &mut cache).await
        else {
            panic!("expected resolved");
        };
        assert!(!recipients.iter().any(|r| r == "gone@uni.edu"));
    }

    #[tokio::test]
    async fn test_missing_and_disabled_accounts_are_unresolved() {
        let identity = identity();
        let resolver = RecipientResolver::new(&identity, RecipientConfig::default());
        let mut cache = ResolutionCache::new();

        assert_eq!(
            resolver.resolve(&workload("w1", "nope", "o1"), &mut cache).await,
            Resolution::Unresolved {
                reason: "account not found".to_string()
            }
        );
        assert_eq!(
            resolver.resolve(&workload("w2", "p2", "o1"), &mut cache).await,
            Resolution::Unresolved {
                reason: "account disabled".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_cache_serves_repeat_lookups() {
        let identity = identity();
        let resolver = RecipientResolver::new(&identity, RecipientConfig::default());
        let mut cache = ResolutionCache::new();

        for id in ["w1", "w2", "w3"] {
            resolver.resolve(&workload(id, "p1", "o1"), &mut cache).await;
        }
        resolver.resolve(&workload("w4", "nope", "o1"), &mut cache).await;
        resolver.resolve(&workload("w5", "nope", "o1"), &mut cache).await;

        assert_eq!(cache.misses(), 2);
        assert_eq!(cache.hits(), 3);
        assert_eq!(cache.account_count(), 2);
    }
}
