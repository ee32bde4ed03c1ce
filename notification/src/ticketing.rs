//! Helpdesk ticketing transport.
//!
//! Each staged artifact becomes one outbound-email ticket. Tickets start
//! closed so they stay out of the agents' queue until a customer replies.
//! The only rate limiting is a fixed pause after every creation call.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::TicketingConfig;
use crate::dispatch::{Channel, Confirm, DispatchFailure, DispatchReport, DispatchSummary};
use crate::error::{NotifyError, NotifyResult};
use crate::staging::{Artifact, StagingDir};
use crate::workload::WorkloadDirectory;

/// Helpdesk ticket status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TicketStatus {
    Open,
    Pending,
    Resolved,
    Closed,
    WaitingOnCustomer,
}

impl TicketStatus {
    /// Numeric code used by the helpdesk API.
    pub fn code(self) -> u8 {
        match self {
            Self::Open => 2,
            Self::Pending => 3,
            Self::Resolved => 4,
            Self::Closed => 5,
            Self::WaitingOnCustomer => 6,
        }
    }
}

/// Helpdesk ticket priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TicketPriority {
    Low,
    Medium,
    High,
    Urgent,
}

impl TicketPriority {
    pub fn code(self) -> u8 {
        match self {
            Self::Low => 1,
            Self::Medium => 2,
            Self::High => 3,
            Self::Urgent => 4,
        }
    }
}

/// A ticket to be opened by emailing `email` (To) and `cc_emails`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundTicket {
    pub requester_name: String,
    pub email: String,
    pub cc_emails: Vec<String>,
    pub subject: String,
    /// HTML body.
    pub description: String,
    pub tags: Vec<String>,
    pub status: TicketStatus,
    pub priority: TicketPriority,
}

/// A created ticket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ticket {
    pub id: u64,
    pub url: String,
}

/// Ticketing service boundary.
#[async_trait]
pub trait TicketingService: Send + Sync {
    /// Open a ticket by sending an outbound email from the helpdesk.
    async fn create_outbound(&self, ticket: &OutboundTicket) -> NotifyResult<Ticket>;

    async fn update_status(
        &self,
        id: u64,
        status: TicketStatus,
        priority: TicketPriority,
    ) -> NotifyResult<()>;

    /// Attach a private (agent-only) note.
    async fn add_note(&self, id: u64, body: &str) -> NotifyResult<()>;
}

/// Ticket id from a `.../helpdesk/tickets/<id>` URL.
pub fn ticket_id_from_url(url: &str) -> Option<u64> {
    url.trim_end_matches('/').rsplit('/').next()?.parse().ok()
}

/// Requester display name from an address: `jane.doe@uni.edu` -> `JANE DOE`.
pub fn requester_name(email: &str) -> String {
    let local = email.split('@').next().unwrap_or_default();
    local.split('.').collect::<Vec<_>>().join(" ").to_uppercase()
}

/// `<prefix> <SUBJECT>@<account name>`
pub fn ticket_subject(prefix: &str, subject: &str, account_name: &str) -> String {
    let subject = format!("{}@{}", subject.to_uppercase(), account_name);
    if prefix.is_empty() {
        subject
    } else {
        format!("{prefix} {subject}")
    }
}

#[derive(Serialize)]
struct OutboundEmailRequest<'a> {
    name: &'a str,
    email: &'a str,
    cc_emails: &'a [String],
    subject: &'a str,
    description: &'a str,
    email_config_id: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    group_id: Option<u64>,
    priority: u8,
    status: u8,
    tags: &'a [String],
}

#[derive(Deserialize)]
struct TicketResponse {
    id: u64,
}

/// Freshdesk v2 API client.
pub struct FreshdeskClient {
    http: reqwest::Client,
    api_base: String,
    portal_domain: String,
    api_key: String,
    email_config_id: u64,
    group_id: Option<u64>,
}

impl FreshdeskClient {
    /// Build a client; fails with a configuration error if credentials are missing.
    pub fn new(config: &TicketingConfig) -> NotifyResult<Self> {
        let api_key = config
            .api_key
            .clone()
            .filter(|k| !k.is_empty())
            .ok_or_else(|| NotifyError::config("no helpdesk API key configured"))?;
        let email_config_id = config
            .email_config_id
            .ok_or_else(|| NotifyError::config("[ticketing] email_config_id is required"))?;

        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| NotifyError::config(format!("failed to create HTTP client: {e}")))?;

        Ok(Self {
            http,
            api_base: format!("https://{}/api/v2", config.domain),
            portal_domain: config
                .portal_domain
                .clone()
                .unwrap_or_else(|| config.domain.clone()),
            api_key,
            email_config_id,
            group_id: config.group_id,
        })
    }

    /// Link to a ticket as people see it.
    pub fn ticket_url(&self, id: u64) -> String {
        format!("https://{}/helpdesk/tickets/{}", self.portal_domain, id)
    }

    async fn check(response: reqwest::Response, what: &str) -> NotifyResult<reqwest::Response> {
        if response.status().is_success() {
            return Ok(response);
        }
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        Err(NotifyError::ticketing(format!(
            "{what} failed ({status}): {body}"
        )))
    }
}

#[async_trait]
impl TicketingService for FreshdeskClient {
    async fn create_outbound(&self, ticket: &OutboundTicket) -> NotifyResult<Ticket> {
        let request = OutboundEmailRequest {
            name: &ticket.requester_name,
            email: &ticket.email,
            cc_emails: &ticket.cc_emails,
            subject: &ticket.subject,
            description: &ticket.description,
            email_config_id: self.email_config_id,
            group_id: self.group_id,
            priority: ticket.priority.code(),
            status: ticket.status.code(),
            tags: &ticket.tags,
        };

        let response = self
            .http
            .post(format!("{}/tickets/outbound_email", self.api_base))
            .basic_auth(&self.api_key, Some("X"))
            .json(&request)
            .send()
            .await
            .map_err(|e| NotifyError::ticketing(format!("create ticket: {e}")))?;
        let created: TicketResponse = Self::check(response, "create ticket")
            .await?
            .json()
            .await
            .map_err(|e| NotifyError::ticketing(format!("create ticket response: {e}")))?;

        Ok(Ticket {
            id: created.id,
            url: self.ticket_url(created.id),
        })
    }

    async fn update_status(
        &self,
        id: u64,
        status: TicketStatus,
        priority: TicketPriority,
    ) -> NotifyResult<()> {
        let body = serde_json::json!({
            "status": status.code(),
            "priority": priority.code(),
        });
        let response = self
            .http
            .put(format!("{}/tickets/{}", self.api_base, id))
            .basic_auth(&self.api_key, Some("X"))
            .json(&body)
            .send()
            .await
            .map_err(|e| NotifyError::ticketing(format!("update ticket {id}: {e}")))?;
        Self::check(response, "update ticket").await?;
        Ok(())
    }

    async fn add_note(&self, id: u64, body: &str) -> NotifyResult<()> {
        let note = serde_json::json!({ "body": body, "private": true });
        let response = self
            .http
            .post(format!("{}/tickets/{}/notes", self.api_base, id))
            .basic_auth(&self.api_key, Some("X"))
            .json(&note)
            .send()
            .await
            .map_err(|e| NotifyError::ticketing(format!("add note to ticket {id}: {e}")))?;
        Self::check(response, "add note").await?;
        Ok(())
    }
}

/// Creates one ticket per staged artifact, pausing between calls.
pub struct TicketDriver<'a, S: TicketingService + ?Sized> {
    service: &'a S,
    config: TicketingConfig,
    write_back: Option<&'a dyn WorkloadDirectory>,
}

impl<'a, S: TicketingService + ?Sized> TicketDriver<'a, S> {
    pub fn new(service: &'a S, config: &TicketingConfig) -> Self {
        Self {
            service,
            config: config.clone(),
            write_back: None,
        }
    }

    /// Record each ticket URL on the contributing workloads.
    pub fn with_write_back(mut self, directory: &'a dyn WorkloadDirectory) -> Self {
        self.write_back = Some(directory);
        self
    }

    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.config.delay_ms)
    }

    /// Helpdesk API calls made for each successfully created ticket.
    fn calls_per_ticket(&self) -> usize {
        if self.config.workload_note {
            2
        } else {
            1
        }
    }

    /// The ticket an artifact turns into.
    pub fn outbound_ticket(&self, artifact: &Artifact) -> OutboundTicket {
        let email = artifact.primary().unwrap_or_default().to_string();
        OutboundTicket {
            requester_name: requester_name(&email),
            cc_emails: artifact.cc().to_vec(),
            subject: ticket_subject(
                &self.config.subject_prefix,
                &artifact.subject,
                &artifact.account_name,
            ),
            description: artifact.bodies().html_or_fallback().into_owned(),
            tags: self.config.tags.clone(),
            status: TicketStatus::Closed,
            priority: TicketPriority::Medium,
            email,
        }
    }

    /// Create a ticket for every artifact in `staging`.
    ///
    /// A failed creation is recorded in the report and the run moves on.
    pub async fn dispatch(
        &self,
        staging: &StagingDir,
        confirm: &dyn Confirm,
    ) -> NotifyResult<DispatchReport> {
        let artifacts = staging.load_artifacts()?;
        for warning in staging.consistency_warnings(&artifacts)? {
            warn!(staging = %staging.path().display(), "{warning}");
        }

        let summary = DispatchSummary {
            channel: Channel::Tickets,
            staging: staging.path().to_path_buf(),
            messages: artifacts.len(),
            estimated: Some(self.delay() * (artifacts.len() * self.calls_per_ticket()) as u32),
        };
        if !confirm.confirm(&summary) {
            info!("ticket mailout declined by operator");
            return Err(NotifyError::Aborted);
        }

        let mut report = DispatchReport::default();
        for artifact in &artifacts {
            let ticket = self.outbound_ticket(artifact);
            report.attempted += 1;

            match self.service.create_outbound(&ticket).await {
                Ok(created) => {
                    report.sent += 1;
                    info!(
                        account = %artifact.account_id,
                        ticket = created.id,
                        url = %created.url,
                        "ticket created"
                    );
                    self.after_create(artifact, &created).await;
                }
                Err(e) => {
                    warn!(
                        account = %artifact.account_id,
                        to = %ticket.email,
                        cc = ?ticket.cc_emails,
                        error = %e,
                        "ticket creation failed, follow up manually"
                    );
                    report.failures.push(DispatchFailure {
                        account_id: artifact.account_id.clone(),
                        recipients: artifact.recipients.clone(),
                        reason: e.to_string(),
                    });
                }
            }

            tokio::time::sleep(self.delay()).await;
        }

        info!(
            created = report.sent,
            failed = report.failures.len(),
            "ticket mailout finished"
        );
        Ok(report)
    }

    async fn after_create(&self, artifact: &Artifact, ticket: &Ticket) {
        if self.config.workload_note {
            // The note is a second API call; it gets its own pause.
            tokio::time::sleep(self.delay()).await;
            let note = format!("Affected workloads: {}", artifact.workload_ids.join(", "));
            if let Err(e) = self.service.add_note(ticket.id, &note).await {
                warn!(ticket = ticket.id, error = %e, "adding workload note failed");
            }
        }

        let Some(directory) = self.write_back else {
            return;
        };
        for workload_id in &artifact.workload_ids {
            match directory
                .set_metadata(workload_id, &self.config.metadata_key, &ticket.url)
                .await
            {
                Ok(()) => debug!(workload = %workload_id, url = %ticket.url, "recorded ticket on workload"),
                Err(e) => warn!(workload = %workload_id, error = %e, "recording ticket on workload failed"),
            }
        }
    }

    /// Reopen the ticket recorded on a workload as waiting-on-customer and urgent.
    ///
    /// Returns the ticket id.
    pub async fn escalate(
        &self,
        directory: &dyn WorkloadDirectory,
        workload_id: &str,
    ) -> NotifyResult<u64> {
        let workload = directory
            .get(workload_id)
            .await?
            .ok_or_else(|| NotifyError::resolution("workload", workload_id, "not found"))?;
        let url = workload
            .metadata
            .get(&self.config.metadata_key)
            .ok_or_else(|| {
                NotifyError::ticketing(format!(
                    "workload {workload_id} has no {} metadata",
                    self.config.metadata_key
                ))
            })?;
        let id = ticket_id_from_url(url)
            .ok_or_else(|| NotifyError::ticketing(format!("cannot parse ticket id from {url}")))?;

        self.service
            .update_status(id, TicketStatus::WaitingOnCustomer, TicketPriority::Urgent)
            .await?;
        info!(workload = %workload_id, ticket = id, "ticket escalated");
        Ok(id)
    }
}

#[cfg(test)]
pub(crate) mod fake {
    use std::sync::Mutex;

    use async_trait::async_trait;

    use super::{OutboundTicket, Ticket, TicketPriority, TicketStatus, TicketingService};
    use crate::error::{NotifyError, NotifyResult};

    /// Records calls; creation fails for any primary address listed in `reject`.
    #[derive(Default)]
    pub struct RecordingHelpdesk {
        pub created: Mutex<Vec<OutboundTicket>>,
        pub updates: Mutex<Vec<(u64, TicketStatus, TicketPriority)>>,
        pub notes: Mutex<Vec<(u64, String)>>,
        pub reject: Vec<String>,
    }

    #[async_trait]
    impl TicketingService for RecordingHelpdesk {
        async fn create_outbound(&self, ticket: &OutboundTicket) -> NotifyResult<Ticket> {
            if self.reject.contains(&ticket.email) {
                return Err(NotifyError::ticketing("422 invalid requester"));
            }
            let mut created = self.created.lock().unwrap();
            created.push(ticket.clone());
            let id = 1000 + created.len() as u64;
            Ok(Ticket {
                id,
                url: format!("https://support.test/helpdesk/tickets/{id}"),
            })
        }

        async fn update_status(
            &self,
            id: u64,
            status: TicketStatus,
            priority: TicketPriority,
        ) -> NotifyResult<()> {
            self.updates.lock().unwrap().push((id, status, priority));
            Ok(())
        }

        async fn add_note(&self, id: u64, body: &str) -> NotifyResult<()> {
            self.notes.lock().unwrap().push((id, body.to_string()));
            Ok(())
        }
    }
}
