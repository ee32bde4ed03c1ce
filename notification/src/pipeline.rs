//! Glue for the two phases.
//!
//! `generate` ends with a `StagingDir` handle for review; the dispatch
//! functions take that handle, send through one transport and archive the
//! directory once the loop has run to completion.

use std::collections::BTreeMap;

use chrono::NaiveDateTime;
use tracing::{info, warn};

use crate::aggregate::{Aggregation, Aggregator, Decision};
use crate::archive::archive;
use crate::config::NotifyConfig;
use crate::dispatch::{Confirm, DispatchReport};
use crate::error::NotifyResult;
use crate::identity::IdentityService;
use crate::mail::MailTransport;
use crate::mailout::MailDriver;
use crate::render::{MessageRenderer, RunParameters};
use crate::resolver::{RecipientResolver, ResolutionCache};
use crate::staging::{StagingDir, StagingWriter};
use crate::ticketing::{TicketDriver, TicketingService};
use crate::workload::{WorkloadDirectory, WorkloadFilter};

/// What a generate run produced.
#[derive(Debug)]
pub struct GenerateOutcome {
    /// `None` when nothing needed notifying; no directory is created then and
    /// `aggregation.entries` is the only record of the drop decisions.
    pub staging: Option<StagingDir>,
    pub aggregation: Aggregation,
    pub cache_hits: usize,
    pub cache_misses: usize,
}

/// Collaborators for the generate phase.
pub struct Generator<'a> {
    pub directory: &'a dyn WorkloadDirectory,
    pub identity: &'a dyn IdentityService,
    pub config: &'a NotifyConfig,
}

impl<'a> Generator<'a> {
    pub fn new(
        directory: &'a dyn WorkloadDirectory,
        identity: &'a dyn IdentityService,
        config: &'a NotifyConfig,
    ) -> Self {
        Self {
            directory,
            identity,
            config,
        }
    }

    /// Select, group, render and stage.
    ///
    /// Every message is rendered before the staging directory is created, so
    /// a template failure leaves nothing on disk.
    pub async fn generate(
        &self,
        filter: &WorkloadFilter,
        renderer: &MessageRenderer,
        mut params: RunParameters,
        now: NaiveDateTime,
    ) -> NotifyResult<GenerateOutcome> {
        let workloads = self.directory.list(filter).await?;
        info!(count = workloads.len(), "selected affected workloads");

        let mut cache = ResolutionCache::new();
        let resolver = RecipientResolver::new(self.identity, self.config.recipients.clone());
        let aggregation = Aggregator::new(resolver)
            .aggregate(workloads, &mut cache)
            .await;
        info!(
            hits = cache.hits(),
            misses = cache.misses(),
            "account lookups"
        );

        let mut outcome = GenerateOutcome {
            staging: None,
            aggregation,
            cache_hits: cache.hits(),
            cache_misses: cache.misses(),
        };
        if outcome.aggregation.is_empty() {
            for entry in &outcome.aggregation.entries {
                if let Decision::Dropped(reason) = &entry.decision {
                    warn!(
                        workload = %entry.workload_id,
                        account = %entry.account_id,
                        %reason,
                        "workload dropped"
                    );
                }
            }
            warn!(
                dropped = outcome.aggregation.dropped_count(),
                "no account needs notifying, nothing staged"
            );
            return Ok(outcome);
        }

        params.affected = outcome.aggregation.bundles.len();
        let mut messages = BTreeMap::new();
        for (account_id, bundle) in &outcome.aggregation.bundles {
            messages.insert(account_id.clone(), renderer.render(bundle, &params)?);
        }

        let staging = StagingWriter::new(&self.config.staging.root).write_run(
            &outcome.aggregation,
            &messages,
            now,
        )?;
        outcome.staging = Some(staging);
        Ok(outcome)
    }
}

/// Send every artifact by mail, then archive the directory.
pub fn mailout<T: MailTransport>(
    driver: &mut MailDriver<T>,
    staging: StagingDir,
    confirm: &dyn Confirm,
) -> NotifyResult<DispatchReport> {
    let mut report = driver.dispatch(&staging, confirm)?;
    report.archive = Some(archive(staging)?);
    Ok(report)
}

/// Open a ticket for every artifact, then archive the directory.
pub async fn ticket_mailout<S: TicketingService + ?Sized>(
    driver: &TicketDriver<'_, S>,
    staging: StagingDir,
    confirm: &dyn Confirm,
) -> NotifyResult<DispatchReport> {
    let mut report = driver.dispatch(&staging, confirm).await?;
    report.archive = Some(archive(staging)?);
    Ok(report)
}
