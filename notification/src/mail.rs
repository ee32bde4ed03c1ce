//! Mail transport boundary and its SMTP implementation.
//!
//! The transport is deliberately synchronous: one connection, one message at
//! a time, driven by `MailDriver` which owns the session lifecycle.

use std::time::Duration;

use lettre::message::{Mailbox, MultiPart, SinglePart};
use lettre::transport::smtp::client::SmtpConnection;
use lettre::address::Envelope;
use lettre::transport::smtp::commands::{Data, Mail, Rcpt, Rset};
use lettre::transport::smtp::Error as SmtpError;
use lettre::transport::smtp::extension::ClientId;
use lettre::Message;
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::SmtpConfig;
use crate::error::{NotifyError, NotifyResult};
use crate::render::Bodies;
use crate::staging::Artifact;

/// Transport-level failure, split by whether the run can go on.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// The server refused this message's recipients; the session is still usable.
    #[error("recipient rejected: {0}")]
    RecipientRejected(String),
    /// Connection or protocol failure; the session must not be reused.
    #[error("session failure: {0}")]
    Session(String),
}

/// A fully addressed message ready for a transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingMail {
    pub from: String,
    pub reply_to: Option<String>,
    pub to: String,
    pub cc: Vec<String>,
    pub subject: String,
    pub bodies: Bodies,
}

impl OutgoingMail {
    /// Address an artifact to its own recipients.
    pub fn from_artifact(artifact: &Artifact, from: &str, reply_to: Option<&str>) -> Self {
        Self {
            from: from.to_string(),
            reply_to: reply_to.map(str::to_string),
            to: artifact.primary().unwrap_or_default().to_string(),
            cc: artifact.cc().to_vec(),
            subject: artifact.subject.clone(),
            bodies: artifact.bodies(),
        }
    }

    /// Same message, delivered only to `address`.
    pub fn redirected(mut self, address: &str) -> Self {
        self.to = address.to_string();
        self.cc.clear();
        self
    }

    /// Every envelope recipient, To first.
    pub fn recipients(&self) -> Vec<String> {
        std::iter::once(self.to.clone())
            .chain(self.cc.iter().cloned())
            .collect()
    }
}

/// Anything that can deliver `OutgoingMail` over an explicitly opened session.
pub trait MailTransport {
    fn open(&mut self) -> Result<(), TransportError>;
    fn send(&mut self, mail: &OutgoingMail) -> Result<(), TransportError>;
    fn close(&mut self) -> Result<(), TransportError>;

    /// Whether the session opened last is still usable. A transport may drop
    /// it on its own after a rejection.
    fn is_open(&self) -> bool {
        true
    }
}

/// SMTP transport over a single plain connection.
pub struct SmtpMailer {
    server: String,
    port: u16,
    hello: ClientId,
    timeout: Duration,
    conn: Option<SmtpConnection>,
}

impl SmtpMailer {
    /// Build from config. Fails with a configuration error when no server is
    /// set or the sender addresses do not parse.
    pub fn new(config: &SmtpConfig) -> NotifyResult<Self> {
        let server = config
            .server
            .clone()
            .filter(|s| !s.is_empty())
            .ok_or_else(|| NotifyError::config("no SMTP server configured"))?;
        parse_mailbox(&config.from)
            .map_err(|e| NotifyError::config(format!("smtp.from: {e}")))?;
        if let Some(reply_to) = &config.reply_to {
            parse_mailbox(reply_to)
                .map_err(|e| NotifyError::config(format!("smtp.reply_to: {e}")))?;
        }

        Ok(Self {
            server,
            port: config.port,
            hello: ClientId::Domain(config.hello_name.clone()),
            timeout: Duration::from_secs(config.timeout_secs),
            conn: None,
        })
    }
}

impl MailTransport for SmtpMailer {
    fn open(&mut self) -> Result<(), TransportError> {
        let conn = SmtpConnection::connect(
            (self.server.as_str(), self.port),
            Some(self.timeout),
            &self.hello,
            None,
            None,
        )
        .map_err(|e| TransportError::Session(format!("connect {}:{}: {e}", self.server, self.port)))?;
        debug!(server = %self.server, port = self.port, "smtp session opened");
        self.conn = Some(conn);
        Ok(())
    }

    fn send(&mut self, mail: &OutgoingMail) -> Result<(), TransportError> {
        let message = build_message(mail)?;
        let conn = self
            .conn
            .as_mut()
            .ok_or_else(|| TransportError::Session("no open session".to_string()))?;

        match transaction(conn, message.envelope(), &message.formatted()) {
            Ok(()) => Ok(()),
            Err(TransportError::RecipientRejected(reason)) => {
                // Clear the half-finished transaction so the session can carry the next message.
                if let Err(reset) = conn.command(Rset) {
                    warn!(error = %reset, "RSET after rejection failed, dropping session");
                    conn.abort();
                    self.conn = None;
                }
                Err(TransportError::RecipientRejected(reason))
            }
            Err(e) => {
                conn.abort();
                self.conn = None;
                Err(e)
            }
        }
    }

    fn is_open(&self) -> bool {
        self.conn.is_some()
    }

    fn close(&mut self) -> Result<(), TransportError> {
        let Some(mut conn) = self.conn.take() else {
            return Ok(());
        };
        conn.quit()
            .map(|_| ())
            .map_err(|e| TransportError::Session(format!("quit: {e}")))
    }
}

/// Run one MAIL/RCPT/DATA exchange on an open connection.
///
/// Only a permanent reply to RCPT counts as a rejection, and only when every
/// recipient is refused; the message still goes to whoever was accepted.
/// Any other failure, including a refused sender or a refused body, is a
/// session failure.
fn transaction(
    conn: &mut SmtpConnection,
    envelope: &Envelope,
    body: &[u8],
) -> Result<(), TransportError> {
    let session = |stage: &str, e: SmtpError| TransportError::Session(format!("{stage}: {e}"));

    conn.command(Mail::new(envelope.from().cloned(), vec![]))
        .map_err(|e| session("MAIL FROM", e))?;

    let mut accepted = 0;
    let mut refused = Vec::new();
    for rcpt in envelope.to() {
        match conn.command(Rcpt::new(rcpt.clone(), vec![])) {
            Ok(_) => accepted += 1,
            Err(e) if e.is_permanent() => refused.push(format!("{rcpt}: {e}")),
            Err(e) => return Err(session("RCPT TO", e)),
        }
    }
    if accepted == 0 {
        return Err(TransportError::RecipientRejected(refused.join("; ")));
    }
    if !refused.is_empty() {
        warn!(?refused, accepted, "some recipients refused, delivering to the rest");
    }

    conn.command(Data).map_err(|e| session("DATA", e))?;
    conn.message(body).map_err(|e| session("message body", e))?;
    Ok(())
}

fn parse_mailbox(addr: &str) -> Result<Mailbox, lettre::address::AddressError> {
    addr.trim().parse()
}

/// Render `mail` into a MIME message: multipart/alternative when an HTML body
/// was staged, plain text otherwise.
fn build_message(mail: &OutgoingMail) -> Result<Message, TransportError> {
    let rejected = |addr: &str, e: lettre::address::AddressError| {
        TransportError::RecipientRejected(format!("invalid address {addr:?}: {e}"))
    };

    let from = parse_mailbox(&mail.from).map_err(|e| TransportError::Session(e.to_string()))?;
    let mut builder = Message::builder()
        .from(from)
        .to(parse_mailbox(&mail.to).map_err(|e| rejected(&mail.to, e))?)
        .subject(mail.subject.as_str());
    if let Some(reply_to) = &mail.reply_to {
        builder = builder
            .reply_to(parse_mailbox(reply_to).map_err(|e| TransportError::Session(e.to_string()))?);
    }
    for cc in &mail.cc {
        builder = builder.cc(parse_mailbox(cc).map_err(|e| rejected(cc, e))?);
    }

    let built = match &mail.bodies {
        Bodies::PlainOnly { plain } => builder.singlepart(SinglePart::plain(plain.clone())),
        Bodies::PlainAndHtml { plain, html } => {
            builder.multipart(MultiPart::alternative_plain_html(plain.clone(), html.clone()))
        }
    };
    built.map_err(|e| TransportError::RecipientRejected(format!("cannot build message: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mail(bodies: Bodies) -> OutgoingMail {
        OutgoingMail {
            from: "Research Cloud <bounces@cloud.org>".to_string(),
            reply_to: Some("support@cloud.org".to_string()),
            to: "pi@uni.edu".to_string(),
            cc: vec!["mgr@uni.edu".to_string()],
            subject: "Outage".to_string(),
            bodies,
        }
    }

    #[test]
    fn test_plain_message_headers() {
        let message = build_message(&mail(Bodies::PlainOnly {
            plain: "hello".to_string(),
        }))
        .unwrap();
        let text = String::from_utf8(message.formatted()).unwrap();
        assert!(text.contains("To: pi@uni.edu"));
        assert!(text.contains("Cc: mgr@uni.edu"));
        assert!(text.contains("Reply-To: support@cloud.org"));
        assert!(text.contains("Content-Type: text/plain"));
        assert_eq!(message.envelope().to().len(), 2);
    }

    #[test]
    fn test_html_message_is_alternative() {
        let message = build_message(&mail(Bodies::PlainAndHtml {
            plain: "hello".to_string(),
            html: "<p>hello</p>".to_string(),
        }))
        .unwrap();
        let text = String::from_utf8(message.formatted()).unwrap();
        assert!(text.contains("multipart/alternative"));
        assert!(text.contains("text/html"));
    }

    #[test]
    fn test_malformed_recipient_is_a_rejection() {
        let mut bad = mail(Bodies::PlainOnly {
            plain: "x".to_string(),
        });
        bad.cc.push("not an address".to_string());
        assert!(matches!(
            build_message(&bad),
            Err(TransportError::RecipientRejected(_))
        ));
    }

    #[test]
    fn test_redirected_drops_cc() {
        let m = mail(Bodies::PlainOnly {
            plain: "x".to_string(),
        })
        .redirected("test@cloud.org");
        assert_eq!(m.recipients(), vec!["test@cloud.org"]);
    }

    #[test]
    fn test_mailer_requires_server() {
        let err = SmtpMailer::new(&SmtpConfig::default()).err().unwrap();
        assert!(!err.to_string().is_empty());
        let ok = SmtpMailer::new(&SmtpConfig {
            server: Some("smtp.cloud.org".to_string()),
            ..Default::default()
        });
        assert!(ok.is_ok());
    }
}
