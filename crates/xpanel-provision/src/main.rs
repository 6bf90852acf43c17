mod cli;
mod output;

use std::env;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use colored::Colorize;
use xpanel_provision::config::loader::{DEFAULT_CONFIG_FILE, load_config};
use xpanel_provision::config::AppConfig;
use xpanel_provision::{
    ClientOp, JobId, JobStatus, JobStore, NoopReconciler, Provisioner, ProvisionerBuilder,
    StorageBackend,
};

use cli::{Cli, Commands, ConfigCommands, JobsCommands, OutputFormat};
use output::{print_error, print_success, print_warning};

const POLL_INTERVAL: Duration = Duration::from_millis(500);

/// How the configuration path was determined.
#[derive(Debug, Clone, Copy)]
enum ConfigSource {
    /// From --config CLI argument
    CliArgument,
    /// From XPANEL_CONFIG environment variable
    EnvironmentVariable,
    /// Default path (xpanel.toml)
    Default,
}

impl std::fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::CliArgument => write!(f, "CLI argument (--config)"),
            Self::EnvironmentVariable => write!(f, "environment variable (XPANEL_CONFIG)"),
            Self::Default => write!(f, "default"),
        }
    }
}

#[tokio::main]
async fn main() {
    // Load .env file if present (before anything else)
    if let Err(e) = dotenvy::dotenv() {
        if !matches!(e, dotenvy::Error::Io(ref io_err) if io_err.kind() == std::io::ErrorKind::NotFound) {
            eprintln!("Warning: Failed to load .env file: {e}");
        }
    }

    xpanel_provision::observability::init_tracing();

    if let Err(e) = run(Cli::parse()).await {
        print_error(&format!("{e:#}"));
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    let (config_path, source) = resolve_config_path(cli.config.as_deref());
    let mut cfg = match load_config(Some(&config_path)) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Configuration error: {e}");
            std::process::exit(2);
        }
    };
    tracing::info!(path = %config_path, source = %source, "Configuration loaded");
    xpanel_provision::observability::apply_logging_level(&cfg.logging.level);

    let format = cli.format.unwrap_or_default();

    if let Commands::Config(args) = &cli.command {
        match args.command {
            ConfigCommands::Show => {
                println!("{}: {} ({})", "Source".cyan(), config_path, source);
                println!("{}", toml::to_string_pretty(&cfg)?);
            }
        }
        return Ok(());
    }

    if cli.dry_run {
        cfg.storage.backend = StorageBackend::Memory;
        cfg.reconcile.enabled = false;
    }
    let app = build(cfg, cli.dry_run).await?;

    match cli.command {
        Commands::Provision(args) => {
            let jobs = app
                .planner()
                .plan_multi_target(&args.template(), args.count, &args.inbounds)
                .await?;
            print_success(&format!(
                "{} jobs queued for {} inbound(s)",
                jobs.len(),
                args.inbounds.len()
            ));
            let ids: Vec<JobId> = jobs.iter().map(|job| job.id).collect();
            cancel_on_interrupt(Arc::clone(app.jobs()), ids.clone());
            let cleanup = app.start_cleanup_task();
            wait_all(&app, &ids, format).await?;
            cleanup.abort();
        }
        Commands::Clients(args) => {
            let clients = app.engine().select_clients(&args.filter()).await?;
            output::print_clients(&clients, format)?;
        }
        Commands::Apply(args) => {
            let raw = tokio::fs::read_to_string(&args.file)
                .await
                .with_context(|| format!("reading {}", args.file.display()))?;
            let ops: Vec<ClientOp> = serde_json::from_str(&raw)
                .with_context(|| format!("parsing {}", args.file.display()))?;
            let result = app.mutator().apply_batch(&ops, !args.no_reconcile).await;
            output::print_batch(&result, format)?;
        }
        Commands::Jobs(args) => match args.command {
            JobsCommands::List { status } => {
                let status = status
                    .map(|s| s.parse::<JobStatus>())
                    .transpose()
                    .map_err(anyhow::Error::msg)?;
                output::print_jobs(&app.jobs().list(status).await, format)?;
            }
            JobsCommands::Show { id } => {
                let job = app
                    .jobs()
                    .get(id)
                    .await
                    .with_context(|| format!("job {id} not found"))?;
                output::print_job(&job, format)?;
            }
            JobsCommands::Cancel { id } => {
                app.jobs().cancel(id).await?;
                print_success(&format!("Job {id} cancelled"));
            }
            JobsCommands::Delete { id } => {
                app.jobs().delete(id).await?;
                print_success(&format!("Job {id} deleted"));
            }
        },
        Commands::Audit(args) => {
            let report = app.auditor().audit(args.inbound).await?;
            output::print_audit(&report, format)?;
        }
        Commands::Repair(args) => {
            let job = app.planner().submit_repair(args.inbound).await?;
            cancel_on_interrupt(Arc::clone(app.jobs()), vec![job.id]);
            wait_all(&app, &[job.id], format).await?;
        }
        Commands::Cleanup => {
            let retention = chrono::Duration::hours(app.config().jobs.retention_hours as i64);
            let purged = app
                .jobs()
                .purge_finished_before(chrono::Utc::now() - retention)
                .await?;
            print_success(&format!("Purged {purged} finished jobs"));
        }
        Commands::Config(_) => {}
    }

    Ok(())
}

async fn build(cfg: AppConfig, dry_run: bool) -> Result<Provisioner> {
    let mut builder = ProvisionerBuilder::new();
    if dry_run {
        builder = builder
            .with_job_store(Arc::new(JobStore::in_memory()))
            .with_reconciler(Arc::new(NoopReconciler));
    }
    let app = builder
        .with_config(cfg)
        .build()
        .await
        .context("failed to initialise provisioner")?;
    Ok(app)
}

/// Waits for every job, printing each as it finishes.
async fn wait_all(app: &Provisioner, ids: &[JobId], format: OutputFormat) -> Result<()> {
    let mut failed = 0usize;
    for &id in ids {
        let Some(job) = app.runner().wait(id, POLL_INTERVAL).await else {
            print_warning(&format!("Job {id} disappeared"));
            continue;
        };
        failed += job.progress.failed;
        match format {
            OutputFormat::Json => output::print_json(&job)?,
            OutputFormat::Table => println!(
                "{} {} {}: {} created, {} failed",
                "•".cyan(),
                job.id,
                job.status,
                job.progress.completed,
                job.progress.failed
            ),
        }
    }
    if failed > 0 {
        print_warning(&format!(
            "{failed} items failed; see `xpanel jobs show <id>` for details"
        ));
    }
    Ok(())
}

/// Cancels the given jobs when Ctrl-C is received.
fn cancel_on_interrupt(store: Arc<JobStore>, ids: Vec<JobId>) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_err() {
            return;
        }
        for id in ids {
            if let Err(e) = store.cancel(id).await {
                tracing::debug!(job_id = %id, error = %e, "Job not cancelled");
            }
        }
        tracing::warn!("Interrupted, running jobs cancelled");
    });
}

/// Resolve the configuration file path.
///
/// Priority order:
/// 1. CLI argument: --config <path>
/// 2. Environment variable: XPANEL_CONFIG
/// 3. Default: xpanel.toml
fn resolve_config_path(cli_path: Option<&str>) -> (String, ConfigSource) {
    if let Some(path) = cli_path {
        return (path.to_string(), ConfigSource::CliArgument);
    }

    if let Ok(path) = env::var("XPANEL_CONFIG") {
        if !path.is_empty() {
            return (path, ConfigSource::EnvironmentVariable);
        }
    }

    (DEFAULT_CONFIG_FILE.to_string(), ConfigSource::Default)
}
