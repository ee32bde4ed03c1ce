//! Direct mail driver.
//!
//! ```text
//! Closed --open--> Open{sent} --(threshold sends)--> close --> Closed --open--> ...
//! ```
//!
//! No session exists before the first send. Every attempt counts toward the
//! per-session budget; once the budget is spent the session is closed and a
//! fresh one opened before the next message. A recipient rejection skips one
//! artifact, a session failure ends the run.

use tracing::{debug, info, warn};

use crate::config::SmtpConfig;
use crate::dispatch::{Channel, Confirm, DispatchFailure, DispatchReport, DispatchSummary};
use crate::error::{NotifyError, NotifyResult};
use crate::mail::{MailTransport, OutgoingMail, TransportError};
use crate::staging::StagingDir;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Session {
    Closed,
    Open { sent: usize },
}

/// Sends staged artifacts through a `MailTransport`, cycling sessions.
pub struct MailDriver<T: MailTransport> {
    transport: T,
    from: String,
    reply_to: Option<String>,
    threshold: usize,
    session: Session,
    sessions_opened: usize,
}

impl<T: MailTransport> MailDriver<T> {
    pub fn new(transport: T, config: &SmtpConfig) -> Self {
        Self {
            transport,
            from: config.from.clone(),
            reply_to: config.reply_to.clone(),
            threshold: config.msgs_per_session.max(1),
            session: Session::Closed,
            sessions_opened: 0,
        }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Sessions opened over this driver's lifetime.
    pub fn sessions_opened(&self) -> usize {
        self.sessions_opened
    }

    /// Send every artifact in `staging` to its own recipients.
    ///
    /// Asks `confirm` once with the message count before anything is sent.
    /// Returns `Err` only when the run could not finish: declined, unreadable
    /// staging, or a broken session.
    pub fn dispatch(
        &mut self,
        staging: &StagingDir,
        confirm: &dyn Confirm,
    ) -> NotifyResult<DispatchReport> {
        let artifacts = staging.load_artifacts()?;
        for warning in staging.consistency_warnings(&artifacts)? {
            warn!(staging = %staging.path().display(), "{warning}");
        }

        let summary = DispatchSummary {
            channel: Channel::Mail,
            staging: staging.path().to_path_buf(),
            messages: artifacts.len(),
            estimated: None,
        };
        if !confirm.confirm(&summary) {
            info!("mailout declined by operator");
            return Err(NotifyError::Aborted);
        }

        let mut report = DispatchReport::default();
        let opened_before = self.sessions_opened;

        for artifact in &artifacts {
            let mail = OutgoingMail::from_artifact(artifact, &self.from, self.reply_to.as_deref());
            report.attempted += 1;

            match self.send_one(&mail) {
                Ok(()) => {
                    report.sent += 1;
                    info!(
                        account = %artifact.account_id,
                        to = %mail.to,
                        cc = mail.cc.len(),
                        "sent notification"
                    );
                }
                Err(TransportError::RecipientRejected(reason)) => {
                    warn!(
                        account = %artifact.account_id,
                        recipients = ?mail.recipients(),
                        %reason,
                        "recipient rejected, continuing"
                    );
                    report.failures.push(DispatchFailure {
                        account_id: artifact.account_id.clone(),
                        recipients: mail.recipients(),
                        reason,
                    });
                }
                Err(TransportError::Session(reason)) => {
                    warn!(
                        account = %artifact.account_id,
                        sent = report.sent,
                        remaining = artifacts.len() - report.attempted,
                        %reason,
                        "mail session failed, aborting run"
                    );
                    return Err(NotifyError::transport(report.sent, reason));
                }
            }
        }

        self.end_session();
        report.sessions_opened = self.sessions_opened - opened_before;
        info!(
            sent = report.sent,
            failed = report.failures.len(),
            sessions = report.sessions_opened,
            "mailout finished"
        );
        Ok(report)
    }

    /// Send the first staged artifact to a single test address ahead of a bulk run.
    ///
    /// `test_address` defaults to the artifact's own primary recipient. Uses
    /// its own session and never archives.
    pub fn verify(
        &mut self,
        staging: &StagingDir,
        test_address: Option<&str>,
        confirm: &dyn Confirm,
    ) -> NotifyResult<DispatchReport> {
        let artifacts = staging.load_artifacts()?;
        let Some(artifact) = artifacts.first() else {
            return Err(NotifyError::staging(staging.path(), "no artifacts to verify"));
        };
        let test_address = test_address
            .or_else(|| artifact.primary())
            .unwrap_or_default()
            .to_string();

        let summary = DispatchSummary {
            channel: Channel::Mail,
            staging: staging.path().to_path_buf(),
            messages: 1,
            estimated: None,
        };
        if !confirm.confirm(&summary) {
            return Err(NotifyError::Aborted);
        }

        let mail = OutgoingMail::from_artifact(artifact, &self.from, self.reply_to.as_deref())
            .redirected(&test_address);
        let opened_before = self.sessions_opened;
        let mut report = DispatchReport {
            attempted: 1,
            ..Default::default()
        };

        let outcome = self.send_one(&mail);
        self.end_session();
        report.sessions_opened = self.sessions_opened - opened_before;

        match outcome {
            Ok(()) => {
                info!(account = %artifact.account_id, to = %test_address, "verification message sent");
                report.sent = 1;
                Ok(report)
            }
            Err(TransportError::RecipientRejected(reason)) => {
                warn!(to = %test_address, %reason, "verification address rejected");
                report.failures.push(DispatchFailure {
                    account_id: artifact.account_id.clone(),
                    recipients: mail.recipients(),
                    reason,
                });
                Ok(report)
            }
            Err(TransportError::Session(reason)) => Err(NotifyError::transport(0, reason)),
        }
    }

    fn send_one(&mut self, mail: &OutgoingMail) -> Result<(), TransportError> {
        if let Session::Open { sent } = self.session {
            if sent >= self.threshold {
                debug!(sent, threshold = self.threshold, "session budget spent, reconnecting");
                self.end_session();
            }
        }

        if self.session == Session::Closed {
            self.transport.open()?;
            self.sessions_opened += 1;
            self.session = Session::Open { sent: 0 };
            debug!(session = self.sessions_opened, "mail session opened");
        }

        if let Session::Open { sent } = &mut self.session {
            *sent += 1;
        }

        match self.transport.send(mail) {
            Err(TransportError::Session(reason)) => {
                self.session = Session::Closed;
                Err(TransportError::Session(reason))
            }
            Err(TransportError::RecipientRejected(reason)) => {
                if !self.transport.is_open() {
                    debug!("transport dropped the session after a rejection, reopening next send");
                    self.session = Session::Closed;
                }
                Err(TransportError::RecipientRejected(reason))
            }
            Ok(()) => Ok(()),
        }
    }

    fn end_session(&mut self) {
        if self.session == Session::Closed {
            return;
        }
        self.session = Session::Closed;
        if let Err(e) = self.transport.close() {
            warn!(error = %e, "closing mail session failed");
        }
    }
}
