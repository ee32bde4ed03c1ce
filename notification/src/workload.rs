//! Workload directory boundary.
//!
//! Discovery of affected workloads belongs to the cloud; the pipeline only
//! needs `list`, `get` and `set_metadata`. `SnapshotDirectory` serves those
//! from a JSON export so runs can be reviewed and reproduced offline.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{NotifyError, NotifyResult};

/// Immutable snapshot of one workload for the duration of a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Workload {
    pub id: String,
    pub name: String,
    pub status: String,
    pub host: String,
    pub zone: String,
    pub account_id: String,
    pub owner_id: String,
    #[serde(default)]
    pub image_id: Option<String>,
    #[serde(default)]
    pub addresses: Vec<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, String>,
}

/// Selection criteria for `WorkloadDirectory::list`.
///
/// Empty fields do not constrain the selection.
#[derive(Debug, Clone, Default)]
pub struct WorkloadFilter {
    pub zone: Option<String>,
    pub hosts: Vec<String>,
    /// `None` or `ALL` matches any status.
    pub status: Option<String>,
    pub image_id: Option<String>,
    pub account_id: Option<String>,
    pub owner_id: Option<String>,
    pub address: Option<String>,
    /// Restrict to these ids, in this order.
    pub ids: Vec<String>,
}

impl WorkloadFilter {
    /// Whether `w` satisfies every non-empty criterion except `ids`.
    pub fn matches(&self, w: &Workload) -> bool {
        let status_ok = match self.status.as_deref() {
            None => true,
            Some(s) if s.eq_ignore_ascii_case("ALL") => true,
            Some(s) => w.status.eq_ignore_ascii_case(s),
        };

        status_ok
            && self.zone.as_deref().map_or(true, |z| w.zone == z)
            && (self.hosts.is_empty() || self.hosts.iter().any(|h| *h == w.host))
            && self
                .image_id
                .as_deref()
                .map_or(true, |i| w.image_id.as_deref() == Some(i))
            && self.account_id.as_deref().map_or(true, |a| w.account_id == a)
            && self.owner_id.as_deref().map_or(true, |o| w.owner_id == o)
            && self
                .address
                .as_deref()
                .map_or(true, |ip| w.addresses.iter().any(|a| a == ip))
    }
}

/// Abstraction over the cloud's workload inventory.
///
/// `SnapshotDirectory` implements this for JSON exports.
/// Tests can provide their own implementation.
#[async_trait]
pub trait WorkloadDirectory: Send + Sync {
    /// List workloads matching the filter.
    async fn list(&self, filter: &WorkloadFilter) -> NotifyResult<Vec<Workload>>;

    /// Fetch a single workload by id.
    async fn get(&self, id: &str) -> NotifyResult<Option<Workload>>;

    /// Attach a metadata key/value to a workload.
    async fn set_metadata(&self, id: &str, key: &str, value: &str) -> NotifyResult<()>;
}

/// Workload directory backed by a JSON array of `Workload` records.
pub struct SnapshotDirectory {
    path: Option<PathBuf>,
    workloads: Mutex<Vec<Workload>>,
}

impl SnapshotDirectory {
    /// Create an in-memory directory.
    pub fn new(workloads: Vec<Workload>) -> Self {
        Self {
            path: None,
            workloads: Mutex::new(workloads),
        }
    }

    /// Load a directory from a JSON file; metadata writes go back to it.
    pub fn from_file(path: &Path) -> NotifyResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            NotifyError::config(format!("failed to read workload snapshot {}: {e}", path.display()))
        })?;
        let workloads: Vec<Workload> = serde_json::from_str(&content)?;
        Ok(Self {
            path: Some(path.to_path_buf()),
            workloads: Mutex::new(workloads),
        })
    }

    /// Snapshot of the current records.
    pub fn workloads(&self) -> Vec<Workload> {
        self.lock().clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<Workload>> {
        // A poisoned lock still holds consistent records: writers never panic mid-update.
        self.workloads
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl WorkloadDirectory for SnapshotDirectory {
    async fn list(&self, filter: &WorkloadFilter) -> NotifyResult<Vec<Workload>> {
        let workloads = self.lock();

        if filter.ids.is_empty() {
            return Ok(workloads
                .iter()
                .filter(|w| filter.matches(w))
                .cloned()
                .collect());
        }

        let mut selected = Vec::with_capacity(filter.ids.len());
        for id in &filter.ids {
            match workloads.iter().find(|w| w.id == *id) {
                Some(w) if filter.matches(w) => selected.push(w.clone()),
                Some(_) => debug!(workload = %id, "listed workload filtered out"),
                None => warn!(workload = %id, "listed workload not found in directory"),
            }
        }
        Ok(selected)
    }

    async fn get(&self, id: &str) -> NotifyResult<Option<Workload>> {
        Ok(self.lock().iter().find(|w| w.id == id).cloned())
    }

    async fn set_metadata(&self, id: &str, key: &str, value: &str) -> NotifyResult<()> {
        let mut workloads = self.lock();
        let workload = workloads
            .iter_mut()
            .find(|w| w.id == id)
            .ok_or_else(|| NotifyError::resolution("workload", id, "not found"))?;
        workload.metadata.insert(key.to_string(), value.to_string());

        if let Some(path) = &self.path {
            let json = serde_json::to_string_pretty(&*workloads)?;
            std::fs::write(path, json)?;
        }
        Ok(())
    }
}

/// Read a newline-delimited list of workload ids.
///
/// Only the first whitespace-separated token of each line is used, so a
/// staging manifest can be passed back in. Blank lines and `#` comments are
/// skipped.
pub fn read_id_list(path: &Path) -> NotifyResult<Vec<String>> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| NotifyError::config(format!("failed to read {}: {e}", path.display())))?;
    Ok(content
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .filter_map(|l| l.split_whitespace().next())
        .map(str::to_string)
        .collect())
}

#[cfg(test)]
pub(crate) fn workload(id: &str, account_id: &str, owner_id: &str) -> Workload {
    Workload {
        id: id.to_string(),
        name: format!("vm-{id}"),
        status: "ACTIVE".to_string(),
        host: "cc01".to_string(),
        zone: "melbourne-qh2".to_string(),
        account_id: account_id.to_string(),
        owner_id: owner_id.to_string(),
        image_id: None,
        addresses: vec![],
        metadata: BTreeMap::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_filter_by_zone_host_and_status() {
        let mut a = workload("a", "p1", "u1");
        a.host = "cc02".to_string();
        let mut b = workload("b", "p1", "u1");
        b.status = "SHUTOFF".to_string();
        let mut c = workload("c", "p2", "u2");
        c.zone = "monash-01".to_string();
        let dir = SnapshotDirectory::new(vec![a, b, c]);

        let filter = WorkloadFilter {
            zone: Some("melbourne-qh2".to_string()),
            status: Some("ACTIVE".to_string()),
            ..Default::default()
        };
        let ids: Vec<_> = dir.list(&filter).await.unwrap().into_iter().map(|w| w.id).collect();
        assert_eq!(ids, vec!["a"]);

        let filter = WorkloadFilter {
            status: Some("ALL".to_string()),
            hosts: vec!["cc01".to_string()],
            ..Default::default()
        };
        let ids: Vec<_> = dir.list(&filter).await.unwrap().into_iter().map(|w| w.id).collect();
        assert_eq!(ids, vec!["b", "c"]);
    }

    #[tokio::test]
    async fn test_id_list_keeps_order_and_skips_unknown() {
        let dir = SnapshotDirectory::new(vec![
            workload("a", "p1", "u1"),
            workload("b", "p1", "u1"),
        ]);
        let filter = WorkloadFilter {
            ids: vec!["b".to_string(), "zzz".to_string(), "a".to_string()],
            ..Default::default()
        };
        let ids: Vec<_> = dir.list(&filter).await.unwrap().into_iter().map(|w| w.id).collect();
        assert_eq!(ids, vec!["b", "a"]);
    }

    #[tokio::test]
    async fn test_set_metadata_persists_to_file() {
        let tmp = tempdir().unwrap();
        let path = tmp.path().join("workloads.json");
        std::fs::write(
            &path,
            serde_json::to_string(&vec![workload("a", "p1", "u1")]).unwrap(),
        )
        .unwrap();

        let dir = SnapshotDirectory::from_file(&path).unwrap();
        dir.set_metadata("a", "notification_ticket", "https://helpdesk/tickets/7")
            .await
            .unwrap();

        let reloaded = SnapshotDirectory::from_file(&path).unwrap();
        let a = reloaded.get("a").await.unwrap().unwrap();
        assert_eq!(
            a.metadata.get("notification_ticket").map(String::as_str),
            Some("https://helpdesk/tickets/7")
        );
        assert!(dir.set_metadata("missing", "k", "v").await.is_err());
    }

    #[test]
    fn test_read_id_list_accepts_manifest_lines() {
        let tmp = tempdir().unwrap();
        let path = tmp.path().join("ids.txt");
        std::fs::write(&path, "# outage\nw-1\tp1\n\n  w-2  \n").unwrap();
        assert_eq!(read_id_list(&path).unwrap(), vec!["w-1", "w-2"]);
    }
}
