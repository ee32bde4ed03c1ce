//! Outage and security notification pipeline
//!
//! This library provides:
//! - Selection of affected workloads and resolution of the people responsible for them
//! - Per-account grouping and template rendering
//! - A reviewable on-disk staging directory between generate and dispatch
//! - Dispatch by direct SMTP mail or helpdesk outbound tickets
//! - Archiving of a staging directory once dispatched
//!
//! # Phases
//!
//! ## Generate
//! `Generator::generate` lists workloads from a `WorkloadDirectory`, resolves
//! recipients through an `IdentityService` (memoised in a run-scoped
//! `ResolutionCache`), groups them per account, renders every message and
//! writes one artifact per account plus `manifest.txt` and `grouping.log`.
//! It returns the `StagingDir` handle.
//!
//! ## Dispatch
//! `pipeline::mailout` (direct mail, session cycling every N messages) or
//! `pipeline::ticket_mailout` (one ticket per account, fixed delay between
//! calls). Both ask a `Confirm` gate with the message count first and archive
//! the directory when the loop completes.
//!
//! # Usage
//!
//! ```bash
//! notify generate --template templates/outage.tmpl --workloads vms.json \
//!     --identity identity.json --zone melbourne-qh2 --subject "Outage"
//! notify verify /tmp/outbox/20150625-090000 --mailto ops@example.org
//! notify mailout /tmp/outbox/20150625-090000
//! ```

#![allow(clippy::uninlined_format_args)]

pub mod aggregate;
pub mod archive;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod identity;
pub mod mail;
pub mod mailout;
pub mod pipeline;
pub mod render;
pub mod resolver;
pub mod staging;
pub mod ticketing;
pub mod workload;

pub use aggregate::{AccountBundle, Aggregation, Aggregator, Decision, DropReason, GroupingEntry};
pub use archive::archive;
pub use config::{NotifyConfig, RecipientConfig, SmtpConfig, StagingConfig, TicketingConfig};
pub use dispatch::{Channel, Confirm, DispatchFailure, DispatchReport, DispatchSummary};
pub use error::{ErrorClass, NotifyError, NotifyResult};
pub use identity::{Account, IdentityService, SnapshotIdentity, User};
pub use mail::{MailTransport, OutgoingMail, SmtpMailer, TransportError};
pub use mailout::MailDriver;
pub use pipeline::{mailout, ticket_mailout, GenerateOutcome, Generator};
pub use render::{Bodies, MessageRenderer, RenderedMessage, RunParameters, TemplateError, TemplateStore};
pub use resolver::{RecipientResolver, Resolution, ResolutionCache};
pub use staging::{grouping_log, Artifact, StagingDir, StagingWriter};
pub use ticketing::{
    FreshdeskClient, OutboundTicket, Ticket, TicketDriver, TicketPriority, TicketStatus,
    TicketingService,
};
pub use workload::{read_id_list, SnapshotDirectory, Workload, WorkloadDirectory, WorkloadFilter};
