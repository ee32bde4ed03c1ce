//! Types shared by both dispatch transports: the operator confirmation gate
//! and the per-run report.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

/// Which transport a dispatch run goes through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    Mail,
    Tickets,
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Mail => write!(f, "email"),
            Self::Tickets => write!(f, "helpdesk ticket"),
        }
    }
}

/// What the operator is asked to approve. Counts only, never content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchSummary {
    pub channel: Channel,
    pub staging: PathBuf,
    pub messages: usize,
    /// Lower bound on wall-clock time, when the transport is rate limited.
    pub estimated: Option<Duration>,
}

impl fmt::Display for DispatchSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "About to send {} {}(s) from {}",
            self.messages,
            self.channel,
            self.staging.display()
        )?;
        if let Some(estimated) = self.estimated {
            write!(f, ", taking at least {}s", estimated.as_secs())?;
        }
        Ok(())
    }
}

/// Operator confirmation gate consulted once before any message leaves.
pub trait Confirm {
    fn confirm(&self, summary: &DispatchSummary) -> bool;
}

impl<F> Confirm for F
where
    F: Fn(&DispatchSummary) -> bool,
{
    fn confirm(&self, summary: &DispatchSummary) -> bool {
        self(summary)
    }
}

/// An artifact that could not be delivered, with what a person needs to follow up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchFailure {
    pub account_id: String,
    pub recipients: Vec<String>,
    pub reason: String,
}

/// Outcome of one dispatch run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchReport {
    pub attempted: usize,
    pub sent: usize,
    pub failures: Vec<DispatchFailure>,
    /// Mail sessions opened; always zero for tickets.
    pub sessions_opened: usize,
    /// Set once the staging directory has been archived.
    pub archive: Option<PathBuf>,
}

impl DispatchReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

impl fmt::Display for DispatchReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} of {} sent, {} failed",
            self.sent,
            self.attempted,
            self.failures.len()
        )?;
        if let Some(archive) = &self.archive {
            write!(f, ", archived to {}", archive.display())?;
        }
        Ok(())
    }
}
