//! Notification pipeline error types
//!
//! Every failure in the generate and dispatch phases is represented here.
//! Callers query `class()` / `is_fatal()` instead of string matching.
//!
//! ## Error classes
//!
//! | Class         | Fatal | Policy                                            |
//! |---------------|-------|---------------------------------------------------|
//! | Configuration | yes   | detected before any side effect                   |
//! | Resolution    | no    | workload excluded and logged, run continues       |
//! | Rendering     | yes   | nothing is staged for the run                     |
//! | Staging       | yes   | a fresh generate run is the recovery              |
//! | Transport     | yes   | session assumed broken, remainder of run aborted  |
//! | Ticketing     | no    | logged for manual follow-up, next artifact tried  |
//! | Archive       | yes   | staging directory left in place                   |
//! | Aborted       | yes   | operator declined the confirmation gate           |

use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

/// Result type alias for pipeline operations
pub type NotifyResult<T> = Result<T, NotifyError>;

/// Classification used by the drivers and the CLI to decide whether to continue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Missing endpoint, template or credentials.
    Configuration,
    /// Account or user could not be resolved.
    Resolution,
    /// Template failed to render against a valid context.
    Rendering,
    /// Staging directory could not be created, written or read.
    Staging,
    /// Connection or session level mail transport failure.
    Transport,
    /// A single ticket creation or update failed.
    Ticketing,
    /// Compressing or retiring a staging directory failed.
    Archive,
    /// Operator declined to proceed.
    Aborted,
}

impl ErrorClass {
    /// Whether an error of this class ends the current run.
    pub fn is_fatal(self) -> bool {
        !matches!(self, Self::Resolution | Self::Ticketing)
    }
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Configuration => write!(f, "configuration"),
            Self::Resolution => write!(f, "resolution"),
            Self::Rendering => write!(f, "rendering"),
            Self::Staging => write!(f, "staging"),
            Self::Transport => write!(f, "transport"),
            Self::Ticketing => write!(f, "ticketing"),
            Self::Archive => write!(f, "archive"),
            Self::Aborted => write!(f, "aborted"),
        }
    }
}

/// Errors that can occur while generating or dispatching notifications
#[derive(Error, Debug)]
pub enum NotifyError {
    /// Required configuration is missing or invalid
    #[error("Configuration error: {message}")]
    Config { message: String },

    /// Plain-text template file does not exist
    #[error("Template not found: {path}")]
    TemplateNotFound { path: PathBuf },

    /// Template is malformed or failed to render
    #[error("Failed to render template '{template}': {message}")]
    Render { template: String, message: String },

    /// Account or user lookup failed
    #[error("Could not resolve {what} '{id}': {message}")]
    Resolution {
        what: String,
        id: String,
        message: String,
    },

    /// Account id cannot be turned into an artifact file name
    #[error("Account id {account_id:?} cannot be used as an artifact name")]
    UnsafeAccountId { account_id: String },

    /// Staging directory operation failed
    #[error("Staging error at {path}: {message}")]
    Staging { path: PathBuf, message: String },

    /// Mail session is broken; remaining artifacts were not attempted
    #[error("Mail transport failed after {sent} sent message(s): {message}")]
    Transport { sent: usize, message: String },

    /// Ticketing API call failed
    #[error("Ticketing error: {message}")]
    Ticketing { message: String },

    /// Archive could not be written
    #[error("Archive error at {path}: {message}")]
    Archive { path: PathBuf, message: String },

    /// Operator did not confirm the dispatch
    #[error("Dispatch aborted by operator")]
    Aborted,

    /// IO error wrapper
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl NotifyError {
    /// Create a config error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Create a render error
    pub fn render(template: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Render {
            template: template.into(),
            message: message.into(),
        }
    }

    /// Create a resolution error
    pub fn resolution(
        what: impl Into<String>,
        id: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::Resolution {
            what: what.into(),
            id: id.into(),
            message: message.into(),
        }
    }

    /// Create a staging error
    pub fn staging(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self::Staging {
            path: path.into(),
            message: message.into(),
        }
    }

    /// Create a transport error
    pub fn transport(sent: usize, message: impl Into<String>) -> Self {
        Self::Transport {
            sent,
            message: message.into(),
        }
    }

    /// Create a ticketing error
    pub fn ticketing(message: impl Into<String>) -> Self {
        Self::Ticketing {
            message: message.into(),
        }
    }

    /// Create an archive error
    pub fn archive(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self::Archive {
            path: path.into(),
            message: message.into(),
        }
    }

    /// Classify this error for the continue/abort decision
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Config { .. } | Self::TemplateNotFound { .. } => ErrorClass::Configuration,
            Self::Render { .. } => ErrorClass::Rendering,
            Self::Resolution { .. } => ErrorClass::Resolution,
            Self::UnsafeAccountId { .. } | Self::Staging { .. } | Self::Io(_) | Self::Json(_) => {
                ErrorClass::Staging
            }
            Self::Transport { .. } => ErrorClass::Transport,
            Self::Ticketing { .. } => ErrorClass::Ticketing,
            Self::Archive { .. } => ErrorClass::Archive,
            Self::Aborted => ErrorClass::Aborted,
        }
    }

    /// Whether this error ends the current run
    pub fn is_fatal(&self) -> bool {
        self.class().is_fatal()
    }

    /// Get recovery suggestion for this error
    pub fn recovery_suggestion(&self) -> Option<&'static str> {
        match self {
            Self::Config { .. } => Some(
                "Set the missing value in the config file (NOTIFY_CONFIG) or the matching \
                 NOTIFY_* environment variable, then re-run.",
            ),
            Self::TemplateNotFound { .. } => Some(
                "Check the --template path. The plain-text variant <name>.tmpl must exist; \
                 <name>.html.tmpl is optional.",
            ),
            Self::Render { .. } => Some(
                "Fix the template syntax and run generate again. Nothing was staged.",
            ),
            Self::Staging { .. } | Self::UnsafeAccountId { .. } => Some(
                "Run generate again to produce a fresh staging directory. Do not resume a \
                 partially written one.",
            ),
            Self::Transport { .. } => Some(
                "Fix the mail server problem, then dispatch the same staging directory again. \
                 Artifacts already delivered will be sent a second time.",
            ),
            Self::Aborted => Some("Review the staging directory and re-run when ready."),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolution_and_ticketing_are_recoverable() {
        assert!(!NotifyError::resolution("account", "p1", "not found").is_fatal());
        assert!(!NotifyError::ticketing("HTTP 500").is_fatal());
    }

    #[test]
    fn test_configuration_rendering_and_transport_are_fatal() {
        assert!(NotifyError::config("no smtp server").is_fatal());
        assert_eq!(
            NotifyError::TemplateNotFound {
                path: PathBuf::from("x.tmpl")
            }
            .class(),
            ErrorClass::Configuration
        );
        assert!(NotifyError::render("outage", "unclosed block").is_fatal());
        assert!(NotifyError::transport(3, "connection reset").is_fatal());
        assert!(NotifyError::Aborted.is_fatal());
    }

    #[test]
    fn test_transport_message_reports_progress() {
        let err = NotifyError::transport(4, "421 service closing");
        assert_eq!(
            err.to_string(),
            "Mail transport failed after 4 sent message(s): 421 service closing"
        );
        assert!(err.recovery_suggestion().is_some());
    }
}
