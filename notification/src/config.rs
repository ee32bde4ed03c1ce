//! Pipeline configuration.
//!
//! Loaded from a TOML file (path from `NOTIFY_CONFIG` or the CLI) with
//! `NOTIFY_*` environment overrides applied on top. Transports are only
//! validated when a dispatch actually needs them, so `generate` works without
//! mail or helpdesk credentials.

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::{NotifyError, NotifyResult};

/// Default number of messages sent over one SMTP session before it is cycled.
pub const DEFAULT_MSGS_PER_SESSION: usize = 100;

/// Default pause between ticket creation calls.
pub const DEFAULT_TICKET_DELAY_MS: u64 = 1000;

/// SMTP settings for the direct mail driver.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SmtpConfig {
    pub server: Option<String>,
    pub port: u16,
    /// Envelope and header sender, e.g. `Research Cloud <bounces@example.org>`.
    pub from: String,
    pub reply_to: Option<String>,
    /// Name sent in EHLO.
    pub hello_name: String,
    pub msgs_per_session: usize,
    pub timeout_secs: u64,
}

impl Default for SmtpConfig {
    fn default() -> Self {
        Self {
            server: None,
            port: 25,
            from: "Research Cloud <bounces@localhost>".to_string(),
            reply_to: None,
            hello_name: "localhost".to_string(),
            msgs_per_session: DEFAULT_MSGS_PER_SESSION,
            timeout_secs: 60,
        }
    }
}

/// Helpdesk settings for the ticketing driver.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TicketingConfig {
    /// API host, e.g. `example.freshdesk.com`.
    pub domain: String,
    /// Host used in ticket URLs shown to people, when it differs from `domain`.
    pub portal_domain: Option<String>,
    pub api_key: Option<String>,
    /// Outbound mailbox the ticket email is sent from.
    pub email_config_id: Option<u64>,
    pub group_id: Option<u64>,
    pub delay_ms: u64,
    pub tags: Vec<String>,
    pub subject_prefix: String,
    /// Workload metadata key that receives the ticket URL.
    pub metadata_key: String,
    /// Attach a private note listing the affected workloads to each ticket.
    /// The note is a second API call per ticket and is paced by `delay_ms` too.
    pub workload_note: bool,
}

impl Default for TicketingConfig {
    fn default() -> Self {
        Self {
            domain: "localhost".to_string(),
            portal_domain: None,
            api_key: None,
            email_config_id: None,
            group_id: None,
            delay_ms: DEFAULT_TICKET_DELAY_MS,
            tags: vec!["notification".to_string()],
            subject_prefix: "[Notice]".to_string(),
            metadata_key: "notification_ticket".to_string(),
            workload_note: false,
        }
    }
}

/// Where staging directories are created.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StagingConfig {
    pub root: PathBuf,
}

impl Default for StagingConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("/tmp/outbox"),
        }
    }
}

/// Who besides the account's own contact receives a notice.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RecipientConfig {
    /// Role names whose holders are added, in this order.
    pub roles: Vec<String>,
    /// Add the owner user of each affected workload.
    pub include_owners: bool,
}

impl Default for RecipientConfig {
    fn default() -> Self {
        Self {
            roles: vec!["TenantManager".to_string()],
            include_owners: true,
        }
    }
}

/// Top-level notification configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct NotifyConfig {
    pub smtp: SmtpConfig,
    pub ticketing: TicketingConfig,
    pub staging: StagingConfig,
    pub recipients: RecipientConfig,
}

impl NotifyConfig {
    /// Load the configuration from a TOML file.
    pub fn from_file(path: &Path) -> NotifyResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            NotifyError::config(format!("failed to read {}: {e}", path.display()))
        })?;
        Self::from_toml(&content)
    }

    /// Parse the configuration from TOML text.
    pub fn from_toml(content: &str) -> NotifyResult<Self> {
        toml::from_str(content)
            .map_err(|e| NotifyError::config(format!("failed to parse config TOML: {e}")))
    }

    /// Load from `path`, or `NOTIFY_CONFIG`, or fall back to defaults; then
    /// apply environment overrides.
    pub fn load(path: Option<&Path>) -> NotifyResult<Self> {
        let from_env = std::env::var("NOTIFY_CONFIG").ok().map(PathBuf::from);
        let mut config = match path.map(Path::to_path_buf).or(from_env) {
            Some(p) => Self::from_file(&p)?,
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Apply `NOTIFY_*` overrides using the given lookup.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(server) = lookup("NOTIFY_SMTP_SERVER") {
            self.smtp.server = Some(server);
        }
        if let Some(key) = lookup("NOTIFY_TICKETING_API_KEY") {
            self.ticketing.api_key = Some(key);
        }
        if let Some(domain) = lookup("NOTIFY_TICKETING_DOMAIN") {
            self.ticketing.domain = domain;
        }
        if let Some(root) = lookup("NOTIFY_OUTBOX") {
            self.staging.root = PathBuf::from(root);
        }
    }

    /// Validate settings needed by the direct mail driver.
    pub fn require_smtp(&self) -> NotifyResult<&SmtpConfig> {
        match self.smtp.server.as_deref() {
            None | Some("") => Err(NotifyError::config(
                "no SMTP server configured: set [smtp] server or NOTIFY_SMTP_SERVER",
            )),
            Some(_) if self.smtp.msgs_per_session == 0 => Err(NotifyError::config(
                "[smtp] msgs_per_session must be at least 1",
            )),
            Some(_) => Ok(&self.smtp),
        }
    }

    /// Validate settings needed by the ticketing driver.
    pub fn require_ticketing(&self) -> NotifyResult<&TicketingConfig> {
        let t = &self.ticketing;
        if t.api_key.as_deref().unwrap_or("").is_empty() {
            return Err(NotifyError::config(
                "no helpdesk API key configured: set [ticketing] api_key or \
                 NOTIFY_TICKETING_API_KEY",
            ));
        }
        if t.email_config_id.is_none() {
            return Err(NotifyError::config(
                "[ticketing] email_config_id is required for outbound tickets",
            ));
        }
        Ok(t)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = NotifyConfig::default();
        assert_eq!(config.smtp.msgs_per_session, 100);
        assert_eq!(config.ticketing.delay_ms, 1000);
        assert_eq!(config.staging.root, PathBuf::from("/tmp/outbox"));
        assert_eq!(config.recipients.roles, vec!["TenantManager"]);
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = NotifyConfig::from_toml(
            r#"
            [smtp]
            server = "smtp.example.org"
            msgs_per_session = 20

            [ticketing]
            api_key = "secret"
            email_config_id = 42
            tags = ["outage", "notification"]
            "#,
        )
        .unwrap();

        assert_eq!(config.smtp.server.as_deref(), Some("smtp.example.org"));
        assert_eq!(config.smtp.msgs_per_session, 20);
        assert_eq!(config.smtp.port, 25);
        assert_eq!(config.ticketing.tags, vec!["outage", "notification"]);
        assert_eq!(config.ticketing.delay_ms, 1000);
        assert!(config.require_smtp().is_ok());
        assert!(config.require_ticketing().is_ok());
    }

    #[test]
    fn test_missing_transport_settings_are_config_errors() {
        let config = NotifyConfig::default();
        let err = config.require_smtp().unwrap_err();
        assert!(matches!(err, NotifyError::Config { .. }));
        let err = config.require_ticketing().unwrap_err();
        assert!(matches!(err, NotifyError::Config { .. }));
    }

    #[test]
    fn test_env_overrides() {
        let mut config = NotifyConfig::default();
        config.apply_env(|key| match key {
            "NOTIFY_SMTP_SERVER" => Some("mail.internal".to_string()),
            "NOTIFY_OUTBOX" => Some("/var/spool/outbox".to_string()),
            _ => None,
        });
        assert_eq!(config.smtp.server.as_deref(), Some("mail.internal"));
        assert_eq!(config.staging.root, PathBuf::from("/var/spool/outbox"));
    }

    #[test]
    fn test_invalid_toml() {
        let err = NotifyConfig::from_toml("[smtp\nserver=").unwrap_err();
        assert!(err.to_string().contains("failed to parse config TOML"));
    }

    #[test]
    fn test_example_config_parses() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("../notify.example.toml");
        let config = NotifyConfig::from_file(&path).unwrap();
        assert_eq!(config.ticketing.email_config_id, Some(6000071234));
        assert_eq!(config.ticketing.subject_prefix, "[Cloud Notice]");
        assert!(config.require_smtp().is_ok());
    }
}
