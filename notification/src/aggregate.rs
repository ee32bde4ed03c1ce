//! Groups affected workloads by owning account and attaches recipients.
//!
//! Every input workload ends up in exactly one place: the bundle of its
//! account, or the grouping log with the reason it was dropped.

use std::collections::BTreeMap;
use std::fmt;

use tracing::{info, warn};

use crate::identity::{Account, IdentityService};
use crate::resolver::{push_unique, RecipientResolver, Resolution, ResolutionCache};
use crate::workload::Workload;

/// All affected workloads and the contacts for one account within a run.
///
/// `recipients` is never empty for a bundle that leaves the aggregator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountBundle {
    pub account: Account,
    pub workloads: Vec<Workload>,
    /// Element 0 is the primary ("To") recipient, the rest are "Cc".
    pub recipients: Vec<String>,
}

impl AccountBundle {
    pub fn primary(&self) -> Option<&str> {
        self.recipients.first().map(String::as_str)
    }

    pub fn cc(&self) -> &[String] {
        self.recipients.get(1..).unwrap_or(&[])
    }
}

/// Why a workload was left out of the run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DropReason {
    /// The owning account could not be resolved or is disabled.
    Unresolved(String),
    /// The account resolved but nobody on it is contactable.
    NoRecipients,
}

impl fmt::Display for DropReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unresolved(reason) => write!(f, "unresolved account ({reason})"),
            Self::NoRecipients => write!(f, "no contactable recipients"),
        }
    }
}

/// Keep/drop decision for one workload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Kept,
    Dropped(DropReason),
}

/// One line of the grouping log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupingEntry {
    pub workload_id: String,
    pub workload_name: String,
    pub account_id: String,
    pub decision: Decision,
}

/// Result of grouping one run's workloads.
#[derive(Debug, Clone, Default)]
pub struct Aggregation {
    /// Account id -> bundle, in account id order.
    pub bundles: BTreeMap<String, AccountBundle>,
    /// One entry per input workload, in input order.
    pub entries: Vec<GroupingEntry>,
}

impl Aggregation {
    pub fn is_empty(&self) -> bool {
        self.bundles.is_empty()
    }

    /// Workloads that made it into a bundle.
    pub fn kept_count(&self) -> usize {
        self.entries
            .iter()
            .filter(|e| e.decision == Decision::Kept)
            .count()
    }

    /// Workloads left out of the run.
    pub fn dropped_count(&self) -> usize {
        self.entries.len() - self.kept_count()
    }
}

/// Groups workloads by account using a shared resolver and cache.
pub struct Aggregator<'a, I: IdentityService + ?Sized> {
    resolver: RecipientResolver<'a, I>,
}

impl<'a, I: IdentityService + ?Sized> Aggregator<'a, I> {
    pub fn new(resolver: RecipientResolver<'a, I>) -> Self {
        Self { resolver }
    }

    /// Group `workloads` into per-account bundles.
    pub async fn aggregate(
        &self,
        workloads: Vec<Workload>,
        cache: &mut ResolutionCache,
    ) -> Aggregation {
        let mut bundles: BTreeMap<String, AccountBundle> = BTreeMap::new();
        let mut entries = Vec::with_capacity(workloads.len());

        for workload in workloads {
            let mut entry = GroupingEntry {
                workload_id: workload.id.clone(),
                workload_name: workload.name.clone(),
                account_id: workload.account_id.clone(),
                decision: Decision::Kept,
            };

            match self.resolver.resolve(&workload, cache).await {
                Resolution::Unresolved { reason } => {
                    entry.decision = Decision::Dropped(DropReason::Unresolved(reason));
                }
                Resolution::Resolved {
                    account,
                    recipients,
                } => {
                    entry.account_id = account.id.clone();
                    let bundle = bundles
                        .entry(account.id.clone())
                        .or_insert_with(|| AccountBundle {
                            account,
                            workloads: Vec::new(),
                            recipients: Vec::new(),
                        });
                    for addr in &recipients {
                        push_unique(&mut bundle.recipients, addr);
                    }
                    bundle.workloads.push(workload);
                }
            }
            entries.push(entry);
        }

        bundles.retain(|account_id, bundle| {
            if !bundle.recipients.is_empty() {
                return true;
            }
            warn!(
                account = %account_id,
                workloads = bundle.workloads.len(),
                "no contactable recipients, dropping account"
            );
            for entry in entries.iter_mut().filter(|e| {
                e.account_id == *account_id && e.decision == Decision::Kept
            }) {
                entry.decision = Decision::Dropped(DropReason::NoRecipients);
            }
            false
        });

        let aggregation = Aggregation { bundles, entries };
        info!(
            accounts = aggregation.bundles.len(),
            kept = aggregation.kept_count(),
            dropped = aggregation.dropped_count(),
            "grouped affected workloads"
        );
        aggregation
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RecipientConfig;
    use crate::identity::{SnapshotIdentity, User};
    use crate::workload::workload;

    fn account(id: &str) -> Account {
        Account {
            id: id.to_string(),
            name: id.to_uppercase(),
            enabled: true,
            contact_email: None,
        }
    }

    fn user(id: &str, email: Option<&str>) -> User {
        User {
            id: id.to_string(),
            name: id.to_string(),
            email: email.map(str::to_string),
            enabled: true,
            full_name: None,
        }
    }

    async fn run(identity: &SnapshotIdentity, workloads: Vec<Workload>) -> Aggregation {
        let config = RecipientConfig {
            roles: vec!["TenantManager".to_string()],
            include_owners: true,
        };
        let aggregator = Aggregator::new(RecipientResolver::new(identity, config));
        let mut cache = ResolutionCache::new();
        aggregator.aggregate(workloads, &mut cache).await
    }

    #[tokio::test]
    async fn test_two_accounts_with_partial_contacts() {
        // X: two workloads owned by people with addresses, one by someone without.
        // Y: one owner with an address, one without.
        let identity = SnapshotIdentity::new()
            .with_account(account("x"))
            .with_account(account("y"))
            .with_user(user("u1", Some("one@uni.edu")))
            .with_user(user("u2", Some("two@uni.edu")))
            .with_user(user("u3", None))
            .with_user(user("u4", Some("four@uni.edu")))
            .with_user(user("u5", None));

        let aggregation = run(
            &identity,
            vec![
                workload("w1", "x", "u1"),
                workload("w2", "x", "u2"),
                workload("w3", "x", "u3"),
                workload("w4", "y", "u4"),
                workload("w5", "y", "u5"),
            ],
        )
        .await;

        assert_eq!(aggregation.bundles.len(), 2);
        assert_eq!(aggregation.dropped_count(), 0);
        let x = &aggregation.bundles["x"];
        let y = &aggregation.bundles["y"];
        assert_eq!(x.workloads.len(), 3);
        assert_eq!(y.workloads.len(), 2);
        assert_eq!(x.recipients, vec!["one@uni.edu", "two@uni.edu"]);
        assert_eq!(x.primary(), Some("one@uni.edu"));
        assert_eq!(x.cc(), ["two@uni.edu".to_string()]);
        assert_eq!(y.recipients, vec!["four@uni.edu"]);
        assert!(y.cc().is_empty());
    }

    #[tokio::test]
    async fn test_every_workload_accounted_for() {
        let identity = SnapshotIdentity::new()
            .with_account(account("x"))
            .with_account(account("silent"))
            .with_user(user("u1", Some("one@uni.edu")))
            .with_user(user("u2", None));

        let aggregation = run(
            &identity,
            vec![
                workload("w1", "x", "u1"),
                workload("w2", "ghost", "u1"),
                workload("w3", "silent", "u2"),
                workload("w4", "silent", "u2"),
            ],
        )
        .await;

        assert_eq!(aggregation.entries.len(), 4);
        assert_eq!(aggregation.kept_count(), 1);
        assert_eq!(aggregation.dropped_count(), 3);
        assert!(!aggregation.bundles.contains_key("ghost"));
        assert!(!aggregation.bundles.contains_key("silent"));

        let in_bundles: usize = aggregation.bundles.values().map(|b| b.workloads.len()).sum();
        assert_eq!(in_bundles, aggregation.kept_count());

        assert_eq!(
            aggregation.entries[1].decision,
            Decision::Dropped(DropReason::Unresolved("account not found".to_string()))
        );
        assert_eq!(
            aggregation.entries[3].decision,
            Decision::Dropped(DropReason::NoRecipients)
        );
        for bundle in aggregation.bundles.values() {
            assert!(!bundle.recipients.is_empty());
        }
    }
}
