use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use uuid::Uuid;
use xpanel_core::{DAY_MS, InboundId, now_millis};
use xpanel_provision::ClientTemplate;
use xpanel_storage::ClientFilter;

#[derive(Parser)]
#[command(name = "xpanel")]
#[command(about = "Bulk client provisioning for x-ui panels")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Configuration file (overrides XPANEL_CONFIG)
    #[arg(short, long, global = true)]
    pub config: Option<String>,

    /// Use in-memory storage and skip reconciliation
    #[arg(long, global = true)]
    pub dry_run: bool,

    /// Output format
    #[arg(short, long, global = true)]
    pub format: Option<OutputFormat>,
}

#[derive(Clone, Copy, ValueEnum, Default)]
pub enum OutputFormat {
    #[default]
    Table,
    Json,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Create numbered clients in one or more inbounds
    Provision(ProvisionArgs),
    /// List client rows
    Clients(ClientsArgs),
    /// Apply single-client operations from a JSON file
    Apply(ApplyArgs),
    /// Inspect and manage jobs
    Jobs(JobsArgs),
    /// Check relational rows against embedded documents
    Audit(TargetArgs),
    /// Fix what `audit` reports
    Repair(TargetArgs),
    /// Purge finished jobs past the retention window
    Cleanup,
    /// Show the effective configuration
    Config(ConfigArgs),
}

#[derive(clap::Args)]
pub struct ProvisionArgs {
    /// Target inbound ids
    #[arg(short, long = "inbound", required = true, num_args = 1..)]
    pub inbounds: Vec<InboundId>,
    /// Clients per inbound
    #[arg(short = 'n', long)]
    pub count: usize,
    /// Email prefix; clients are named <prefix>_0001, <prefix>_0002, ...
    #[arg(long, default_value = "user")]
    pub prefix: String,
    /// Traffic quota in GiB, 0 = unlimited
    #[arg(long, default_value_t = 0.0)]
    pub total_gb: f64,
    /// Days until expiry, 0 = never
    #[arg(long, default_value_t = 0)]
    pub expiry_days: i64,
    #[arg(long, default_value_t = 0)]
    pub limit_ip: i64,
    /// VLESS flow
    #[arg(long)]
    pub flow: Option<String>,
    /// Shadowsocks cipher
    #[arg(long)]
    pub method: Option<String>,
    /// Shared secret for Trojan/Shadowsocks clients (generated when absent)
    #[arg(long)]
    pub password: Option<String>,
}

impl ProvisionArgs {
    pub fn template(&self) -> ClientTemplate {
        ClientTemplate {
            prefix: self.prefix.clone(),
            total: (self.total_gb.max(0.0) * 1024.0 * 1024.0 * 1024.0) as i64,
            expiry_time: if self.expiry_days > 0 {
                now_millis() + self.expiry_days * DAY_MS
            } else {
                0
            },
            limit_ip: self.limit_ip,
            flow: self.flow.clone(),
            method: self.method.clone(),
            password: self.password.clone(),
        }
    }
}

#[derive(clap::Args)]
pub struct ClientsArgs {
    #[arg(short, long)]
    pub inbound: Option<InboundId>,
    #[arg(short, long)]
    pub email: Option<String>,
    /// Only clients whose expiry has passed
    #[arg(long)]
    pub expired: bool,
    /// Only disabled clients
    #[arg(long)]
    pub disabled: bool,
}

impl ClientsArgs {
    pub fn filter(&self) -> ClientFilter {
        let mut filter = ClientFilter::new();
        if let Some(inbound) = self.inbound {
            filter = filter.inbound(inbound);
        }
        if let Some(email) = &self.email {
            filter = filter.email(email.clone());
        }
        if self.expired {
            filter = filter.expired_before(now_millis());
        }
        if self.disabled {
            filter = filter.disabled();
        }
        filter
    }
}

#[derive(clap::Args)]
pub struct ApplyArgs {
    /// JSON array of operations, e.g. [{"op":"set_quota","client_id":3,"total":0}]
    pub file: PathBuf,
    /// Skip the reconciliation after the batch
    #[arg(long)]
    pub no_reconcile: bool,
}

#[derive(clap::Args)]
pub struct TargetArgs {
    /// Limit to one inbound
    #[arg(short, long)]
    pub inbound: Option<InboundId>,
}

#[derive(clap::Args)]
pub struct JobsArgs {
    #[command(subcommand)]
    pub command: JobsCommands,
}

#[derive(Subcommand)]
pub enum JobsCommands {
    /// List jobs, newest first
    List {
        /// Only jobs with this status
        #[arg(long)]
        status: Option<String>,
    },
    /// Show one job with its results and errors
    Show { id: Uuid },
    /// Cancel a pending or processing job
    Cancel { id: Uuid },
    /// Delete a job that is not processing
    Delete { id: Uuid },
}

#[derive(clap::Args)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub command: ConfigCommands,
}

#[derive(Subcommand)]
pub enum ConfigCommands {
    /// Print the merged configuration as TOML
    Show,
}
