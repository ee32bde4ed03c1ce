//! Staging directory ("outbox"): the hand-off between generate and dispatch.
//!
//! Layout of one run:
//!
//! ```text
//! <root>/20150625-090000/
//!   <encoded-account-id>.toml   one artifact per account
//!   manifest.txt                workload_id<TAB>account_id per kept workload
//!   grouping.log                keep/drop decisions for review
//! ```
//!
//! The manifest and log are written last, so their presence marks a
//! completed generate run.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use chrono::NaiveDateTime;
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::aggregate::{AccountBundle, Aggregation, Decision};
use crate::error::{NotifyError, NotifyResult};
use crate::render::{Bodies, RenderedMessage};

pub const MANIFEST_FILE: &str = "manifest.txt";
pub const GROUPING_LOG_FILE: &str = "grouping.log";
pub const ARTIFACT_EXTENSION: &str = "toml";

/// One dispatch-ready message for one account, as persisted on disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    pub account_id: String,
    pub account_name: String,
    /// Element 0 is "To", the rest are "Cc".
    pub recipients: Vec<String>,
    pub workload_ids: Vec<String>,
    pub subject: String,
    pub plain_body: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub html_body: Option<String>,
}

impl Artifact {
    pub fn from_bundle(bundle: &AccountBundle, message: &RenderedMessage) -> Self {
        Self {
            account_id: bundle.account.id.clone(),
            account_name: bundle.account.name.clone(),
            recipients: bundle.recipients.clone(),
            workload_ids: bundle.workloads.iter().map(|w| w.id.clone()).collect(),
            subject: message.subject.clone(),
            plain_body: message.bodies.plain().to_string(),
            html_body: message.bodies.html().map(str::to_string),
        }
    }

    pub fn primary(&self) -> Option<&str> {
        self.recipients.first().map(String::as_str)
    }

    pub fn cc(&self) -> &[String] {
        self.recipients.get(1..).unwrap_or(&[])
    }

    pub fn bodies(&self) -> Bodies {
        match &self.html_body {
            Some(html) => Bodies::PlainAndHtml {
                plain: self.plain_body.clone(),
                html: html.clone(),
            },
            None => Bodies::PlainOnly {
                plain: self.plain_body.clone(),
            },
        }
    }
}

const FILE_NAME_SET: &AsciiSet = &NON_ALPHANUMERIC.remove(b'-').remove(b'_').remove(b'.');

/// Path-safe file name for an account's artifact.
///
/// `[A-Za-z0-9_-]` and non-leading `.` pass through; every other byte is
/// percent-encoded, which keeps the mapping one-to-one.
pub fn artifact_file_name(account_id: &str) -> NotifyResult<String> {
    if account_id.is_empty() {
        return Err(NotifyError::UnsafeAccountId {
            account_id: account_id.to_string(),
        });
    }

    let encoded = utf8_percent_encode(account_id, FILE_NAME_SET).to_string();
    // A leading `.` would make a hidden or relative name.
    let encoded = match encoded.strip_prefix('.') {
        Some(rest) => format!("%2E{rest}"),
        None => encoded,
    };
    Ok(format!("{encoded}.{ARTIFACT_EXTENSION}"))
}

/// One manifest line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestEntry {
    pub workload_id: String,
    pub account_id: String,
}

/// Handle to one run's staging directory.
///
/// Returned by generate and required by dispatch; consumed by the archiver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagingDir {
    path: PathBuf,
}

impl StagingDir {
    /// Create a fresh, uniquely named directory under `root`.
    pub fn create(root: &Path, now: NaiveDateTime) -> NotifyResult<Self> {
        std::fs::create_dir_all(root)
            .map_err(|e| NotifyError::staging(root, format!("cannot create staging root: {e}")))?;

        let stamp = now.format("%Y%m%d-%H%M%S").to_string();
        for attempt in 0..100u32 {
            let name = if attempt == 0 {
                stamp.clone()
            } else {
                format!("{stamp}-{attempt}")
            };
            let path = root.join(name);
            match std::fs::create_dir(&path) {
                Ok(()) => {
                    info!(path = %path.display(), "created staging directory");
                    return Ok(Self { path });
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => continue,
                Err(e) => {
                    return Err(NotifyError::staging(
                        &path,
                        format!("cannot create staging directory: {e}"),
                    ))
                }
            }
        }
        Err(NotifyError::staging(
            root,
            format!("no free staging directory name for {stamp}"),
        ))
    }

    /// Open an existing staging directory for dispatch.
    pub fn open(path: impl Into<PathBuf>) -> NotifyResult<Self> {
        let path = path.into();
        if !path.is_dir() {
            return Err(NotifyError::staging(&path, "not a staging directory"));
        }
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn into_path(self) -> PathBuf {
        self.path
    }

    /// Persist one artifact; returns its path.
    pub fn write_artifact(&self, artifact: &Artifact) -> NotifyResult<PathBuf> {
        let path = self.path.join(artifact_file_name(&artifact.account_id)?);
        let text = toml::to_string_pretty(artifact)
            .map_err(|e| NotifyError::staging(&path, format!("cannot encode artifact: {e}")))?;
        std::fs::write(&path, text)
            .map_err(|e| NotifyError::staging(&path, format!("cannot write artifact: {e}")))?;
        Ok(path)
    }

    pub fn write_manifest(&self, entries: &[ManifestEntry]) -> NotifyResult<()> {
        let mut text = String::new();
        for e in entries {
            let _ = writeln!(text, "{}\t{}", e.workload_id, e.account_id);
        }
        self.write_file(MANIFEST_FILE, &text)
    }

    pub fn write_grouping_log(&self, text: &str) -> NotifyResult<()> {
        self.write_file(GROUPING_LOG_FILE, text)
    }

    fn write_file(&self, name: &str, text: &str) -> NotifyResult<()> {
        let path = self.path.join(name);
        std::fs::write(&path, text)
            .map_err(|e| NotifyError::staging(&path, format!("cannot write: {e}")))
    }

    /// Artifact files present, in stable (file name) order.
    pub fn artifact_paths(&self) -> NotifyResult<Vec<PathBuf>> {
        let read = std::fs::read_dir(&self.path)
            .map_err(|e| NotifyError::staging(&self.path, format!("cannot list: {e}")))?;

        let mut paths = Vec::new();
        for entry in read {
            let path = entry?.path();
            if path.is_file()
                && path.extension().and_then(|e| e.to_str()) == Some(ARTIFACT_EXTENSION)
            {
                paths.push(path);
            }
        }
        paths.sort();
        Ok(paths)
    }

    /// Read every artifact, failing on the first one that cannot be parsed.
    pub fn load_artifacts(&self) -> NotifyResult<Vec<Artifact>> {
        self.artifact_paths()?
            .iter()
            .map(|path| {
                let text = std::fs::read_to_string(path)
                    .map_err(|e| NotifyError::staging(path, format!("cannot read: {e}")))?;
                let artifact: Artifact = toml::from_str(&text)
                    .map_err(|e| NotifyError::staging(path, format!("invalid artifact: {e}")))?;
                if artifact.recipients.is_empty() {
                    return Err(NotifyError::staging(path, "artifact has no recipients"));
                }
                Ok(artifact)
            })
            .collect()
    }

    /// Manifest lines, or `None` when the manifest was never written.
    pub fn read_manifest(&self) -> NotifyResult<Option<Vec<ManifestEntry>>> {
        let path = self.path.join(MANIFEST_FILE);
        if !path.exists() {
            return Ok(None);
        }
        let text = std::fs::read_to_string(&path)?;
        Ok(Some(
            text.lines()
                .filter_map(|line| {
                    let (workload_id, account_id) = line.split_once('\t')?;
                    Some(ManifestEntry {
                        workload_id: workload_id.to_string(),
                        account_id: account_id.to_string(),
                    })
                })
                .collect(),
        ))
    }

    /// Compare the manifest with the artifacts present and describe any mismatch.
    ///
    /// Dispatch still proceeds over the artifacts present; this only feeds warnings.
    pub fn consistency_warnings(&self, artifacts: &[Artifact]) -> NotifyResult<Vec<String>> {
        let Some(manifest) = self.read_manifest()? else {
            return Ok(vec![format!(
                "{} missing: generate did not finish, prefer a fresh generate run",
                MANIFEST_FILE
            )]);
        };

        let listed: BTreeSet<&str> = manifest.iter().map(|e| e.account_id.as_str()).collect();
        let present: BTreeSet<&str> = artifacts.iter().map(|a| a.account_id.as_str()).collect();

        let mut warnings = Vec::new();
        for missing in listed.difference(&present) {
            warnings.push(format!("account {missing} is in the manifest but has no artifact"));
        }
        for extra in present.difference(&listed) {
            warnings.push(format!("artifact for account {extra} is not in the manifest"));
        }
        Ok(warnings)
    }
}

/// Writes one generate run into a new staging directory.
pub struct StagingWriter {
    root: PathBuf,
}

impl StagingWriter {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Stage every bundle's message plus the manifest and grouping log.
    ///
    /// `messages` must hold a rendered message for every bundle; all
    /// artifact names are checked before the directory is created.
    pub fn write_run(
        &self,
        aggregation: &Aggregation,
        messages: &BTreeMap<String, RenderedMessage>,
        now: NaiveDateTime,
    ) -> NotifyResult<StagingDir> {
        let mut artifacts = Vec::with_capacity(aggregation.bundles.len());
        for (account_id, bundle) in &aggregation.bundles {
            artifact_file_name(account_id)?;
            let message = messages.get(account_id).ok_or_else(|| {
                NotifyError::render(account_id.clone(), "no rendered message for account")
            })?;
            artifacts.push(Artifact::from_bundle(bundle, message));
        }

        let staging = StagingDir::create(&self.root, now)?;
        for artifact in &artifacts {
            staging.write_artifact(artifact)?;
        }

        let manifest: Vec<ManifestEntry> = aggregation
            .bundles
            .values()
            .flat_map(|b| {
                b.workloads.iter().map(|w| ManifestEntry {
                    workload_id: w.id.clone(),
                    account_id: b.account.id.clone(),
                })
            })
            .collect();
        staging.write_manifest(&manifest)?;
        staging.write_grouping_log(&grouping_log(aggregation, now))?;

        info!(
            path = %staging.path().display(),
            artifacts = artifacts.len(),
            workloads = manifest.len(),
            "staged notifications for review"
        );
        if aggregation.dropped_count() > 0 {
            warn!(
                dropped = aggregation.dropped_count(),
                "some workloads were dropped, see {GROUPING_LOG_FILE}"
            );
        }
        Ok(staging)
    }
}

/// Human-readable account of every keep/drop decision.
pub fn grouping_log(aggregation: &Aggregation, now: NaiveDateTime) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "# Notification grouping log");
    let _ = writeln!(out, "# generated {}", now.format("%Y-%m-%d %H:%M:%S"));
    let _ = writeln!(
        out,
        "# workloads considered: {}, kept: {}, dropped: {}, accounts: {}",
        aggregation.entries.len(),
        aggregation.kept_count(),
        aggregation.dropped_count(),
        aggregation.bundles.len()
    );
    out.push('\n');

    for entry in &aggregation.entries {
        let _ = match &entry.decision {
            Decision::Kept => writeln!(
                out,
                "KEEP   {} ({}) account={}",
                entry.workload_id, entry.workload_name, entry.account_id
            ),
            Decision::Dropped(reason) => writeln!(
                out,
                "DROP   {} ({}) account={} reason: {reason}",
                entry.workload_id, entry.workload_name, entry.account_id
            ),
        };
    }

    for (account_id, bundle) in &aggregation.bundles {
        let _ = writeln!(out, "\n[{} ({})]", account_id, bundle.account.name);
        let _ = writeln!(out, "  to: {}", bundle.primary().unwrap_or("-"));
        if !bundle.cc().is_empty() {
            let _ = writeln!(out, "  cc: {}", bundle.cc().join(", "));
        }
        for w in &bundle.workloads {
            let _ = writeln!(out, "  - {} {} host={} zone={}", w.id, w.name, w.host, w.zone);
        }
    }
    out
}
