mod cli;
mod confirm;

use anyhow::{bail, Context, Result};
use clap::Parser;
use cli::{Cli, Command, GenerateArgs};
use confirm::StdinConfirm;
use notification::{
    grouping_log, mailout, read_id_list, ticket_mailout, FreshdeskClient, Generator, MailDriver,
    MessageRenderer, NotifyConfig, NotifyError, RunParameters, SmtpMailer, SnapshotDirectory,
    SnapshotIdentity, StagingDir, TemplateStore, TicketDriver,
};
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = NotifyConfig::load(cli.config.as_deref()).context("loading configuration")?;

    if let Err(e) = run(cli.command, config).await {
        if let Some(notify) = e.downcast_ref::<NotifyError>() {
            error!(class = %notify.class(), "{e:#}");
            if let Some(hint) = notify.recovery_suggestion() {
                eprintln!("hint: {hint}");
            }
            std::process::exit(1);
        }
        return Err(e);
    }
    Ok(())
}

async fn run(command: Command, config: NotifyConfig) -> Result<()> {
    match command {
        Command::Generate(args) => generate(args, &config).await,
        Command::Mailout { dir } => {
            let smtp = config.require_smtp()?.clone();
            let staging = StagingDir::open(dir)?;
            let report = tokio::task::spawn_blocking(move || {
                let mut driver = MailDriver::new(SmtpMailer::new(&smtp)?, &smtp);
                mailout(&mut driver, staging, &StdinConfirm)
            })
            .await
            .context("mailout task panicked")??;
            info!(%report, "mailout complete");
            Ok(())
        }
        Command::Verify { dir, mailto } => {
            let smtp = config.require_smtp()?.clone();
            let staging = StagingDir::open(dir)?;
            let report = tokio::task::spawn_blocking(move || {
                let mut driver = MailDriver::new(SmtpMailer::new(&smtp)?, &smtp);
                driver.verify(&staging, mailto.as_deref(), &StdinConfirm)
            })
            .await
            .context("verify task panicked")??;
            info!(%report, "verification complete");
            Ok(())
        }
        Command::Tickets {
            dir,
            write_back,
            workloads,
        } => {
            let ticketing = config.require_ticketing()?;
            let client = FreshdeskClient::new(ticketing)?;
            let staging = StagingDir::open(dir)?;
            let directory = match workloads {
                Some(path) if write_back => Some(SnapshotDirectory::from_file(&path)?),
                _ => None,
            };

            let mut driver = TicketDriver::new(&client, ticketing);
            if let Some(directory) = &directory {
                driver = driver.with_write_back(directory);
            }
            let report = ticket_mailout(&driver, staging, &StdinConfirm).await?;
            info!(%report, "ticket mailout complete");
            for failure in &report.failures {
                eprintln!(
                    "not created: account {} ({}): {}",
                    failure.account_id,
                    failure.recipients.join(", "),
                    failure.reason
                );
            }
            Ok(())
        }
        Command::Escalate {
            workload_id,
            workloads,
        } => {
            let ticketing = config.require_ticketing()?;
            let client = FreshdeskClient::new(ticketing)?;
            let directory = SnapshotDirectory::from_file(&workloads)?;
            let id = TicketDriver::new(&client, ticketing)
                .escalate(&directory, &workload_id)
                .await?;
            println!("{}", client.ticket_url(id));
            Ok(())
        }
    }
}

async fn generate(args: GenerateArgs, config: &NotifyConfig) -> Result<()> {
    if !args.is_targeted() {
        bail!("refusing to notify every workload: give --zone, --host, --image, --account, --owner, --ip or --instances-file");
    }

    let store = TemplateStore::from_path(&args.template).map_err(NotifyError::from)?;
    let subject = args.subject.clone().unwrap_or_else(|| store.name().to_string());
    let renderer = MessageRenderer::new(store, &subject)?;

    let params = RunParameters {
        start: args
            .start_time
            .as_deref()
            .map(RunParameters::parse_start)
            .transpose()?,
        duration_hours: args.duration,
        timezone: args.timezone.clone(),
        zone: args.zone.clone(),
        nodes: args.hosts.clone(),
        affected: 0,
    };

    let mut filter = args.filter();
    if let Some(path) = &args.instances_file {
        filter.ids = read_id_list(path)?;
        info!(count = filter.ids.len(), file = %path.display(), "read instances file");
    }

    let directory = SnapshotDirectory::from_file(&args.workloads)?;
    let identity = SnapshotIdentity::from_file(&args.identity)?;
    let now = chrono::Local::now().naive_local();

    let outcome = Generator::new(&directory, &identity, config)
        .generate(&filter, &renderer, params, now)
        .await?;

    let Some(staging) = outcome.staging else {
        println!("No notification needed.");
        if !outcome.aggregation.entries.is_empty() {
            println!();
            print!("{}", grouping_log(&outcome.aggregation, now));
        }
        return Ok(());
    };
    println!(
        "Staged {} notice(s) covering {} workload(s); {} workload(s) dropped.",
        outcome.aggregation.bundles.len(),
        outcome.aggregation.kept_count(),
        outcome.aggregation.dropped_count()
    );
    println!("Review {} then run:", staging.path().display());
    println!("  notify verify {}", staging.path().display());
    println!("  notify mailout {}", staging.path().display());
    println!("  notify tickets {}", staging.path().display());
    Ok(())
}
