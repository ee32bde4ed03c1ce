use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use notification::WorkloadFilter;

/// Generate, review and dispatch outage and security notices
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Pipeline config file (overrides NOTIFY_CONFIG)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Select affected workloads, render notices and stage them for review
    Generate(GenerateArgs),

    /// Send a staged directory by email, then archive it
    Mailout {
        /// Staging directory printed by `generate`
        dir: PathBuf,
    },

    /// Send the first staged notice to a test address
    Verify {
        dir: PathBuf,

        /// Test recipient (defaults to the notice's own primary recipient)
        #[arg(long)]
        mailto: Option<String>,
    },

    /// Open one helpdesk ticket per staged notice, then archive the directory
    Tickets {
        dir: PathBuf,

        /// Record each ticket URL on the affected workloads
        #[arg(long, default_value_t = false, requires = "workloads")]
        write_back: bool,

        /// Workload snapshot (JSON) to write ticket URLs into
        #[arg(long)]
        workloads: Option<PathBuf>,
    },

    /// Reopen the ticket recorded on a workload as waiting-on-customer/urgent
    Escalate {
        workload_id: String,

        /// Workload snapshot (JSON) holding the ticket URL
        #[arg(long)]
        workloads: PathBuf,
    },
}

#[derive(Args, Debug)]
pub struct GenerateArgs {
    /// Plain-text template, e.g. templates/outage.tmpl (outage.html.tmpl is picked up if present)
    #[arg(long)]
    pub template: PathBuf,

    /// Workload snapshot (JSON)
    #[arg(long)]
    pub workloads: PathBuf,

    /// Identity snapshot (JSON): accounts, role assignments and users
    #[arg(long)]
    pub identity: PathBuf,

    /// Subject line, may reference template variables (defaults to the template name)
    #[arg(long)]
    pub subject: Option<String>,

    /// Outage start, e.g. "09:00 25-06-2015"
    #[arg(long)]
    pub start_time: Option<String>,

    /// Outage duration in hours
    #[arg(long, requires = "start_time")]
    pub duration: Option<u32>,

    #[arg(long, default_value = "AEST")]
    pub timezone: String,

    /// Availability zone
    #[arg(long)]
    pub zone: Option<String>,

    /// Compute host; repeat for several
    #[arg(long = "host")]
    pub hosts: Vec<String>,

    /// Workload status to match; ALL matches any
    #[arg(long, default_value = "ACTIVE")]
    pub status: String,

    #[arg(long)]
    pub image: Option<String>,

    /// Owning account id
    #[arg(long)]
    pub account: Option<String>,

    /// Owner user id
    #[arg(long)]
    pub owner: Option<String>,

    /// IP address
    #[arg(long)]
    pub ip: Option<String>,

    /// File of workload ids, one per line (a staging manifest works)
    #[arg(long)]
    pub instances_file: Option<PathBuf>,
}

impl GenerateArgs {
    /// Selection filter; `ids` is filled in separately from the instances file.
    pub fn filter(&self) -> WorkloadFilter {
        WorkloadFilter {
            zone: self.zone.clone(),
            hosts: self.hosts.clone(),
            status: Some(self.status.clone()),
            image_id: self.image.clone(),
            account_id: self.account.clone(),
            owner_id: self.owner.clone(),
            address: self.ip.clone(),
            ids: Vec::new(),
        }
    }

    /// Whether any criterion narrows the selection beyond status.
    pub fn is_targeted(&self) -> bool {
        self.zone.is_some()
            || !self.hosts.is_empty()
            || self.image.is_some()
            || self.account.is_some()
            || self.owner.is_some()
            || self.ip.is_some()
            || self.instances_file.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_args() {
        let cli = Cli::parse_from([
            "notify",
            "generate",
            "--template",
            "templates/outage.tmpl",
            "--workloads",
            "vms.json",
            "--identity",
            "id.json",
            "--host",
            "cc01",
            "--host",
            "cc02",
            "--start-time",
            "09:00 25-06-2015",
            "--duration",
            "4",
        ]);
        let Command::Generate(args) = cli.command else {
            panic!("expected generate");
        };
        assert!(args.is_targeted());
        let filter = args.filter();
        assert_eq!(filter.hosts, vec!["cc01", "cc02"]);
        assert_eq!(filter.status.as_deref(), Some("ACTIVE"));
        assert_eq!(args.duration, Some(4));
    }

    #[test]
    fn test_write_back_needs_workloads() {
        assert!(Cli::try_parse_from(["notify", "tickets", "/tmp/x", "--write-back"]).is_err());
        assert!(Cli::try_parse_from([
            "notify",
            "tickets",
            "/tmp/x",
            "--write-back",
            "--workloads",
            "vms.json"
        ])
        .is_ok());
    }

    #[test]
    fn test_verify_global_config() {
        let cli = Cli::parse_from(["notify", "verify", "/tmp/x", "--config", "notify.toml"]);
        assert_eq!(cli.config, Some(PathBuf::from("notify.toml")));
        assert!(matches!(cli.command, Command::Verify { mailto: None, .. }));
    }
}
