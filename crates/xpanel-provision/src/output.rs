use colored::Colorize;
use serde::Serialize;
use tabled::builder::Builder;
use tabled::settings::Style;
use xpanel_core::ClientRecord;
use xpanel_provision::{AuditReport, BatchResult, Job, JobStatus, ReconcileOutcome, RepairReport};

use crate::cli::OutputFormat;

pub fn print_success(msg: &str) {
    println!("{} {}", "✓".green(), msg);
}

pub fn print_warning(msg: &str) {
    println!("{} {}", "!".yellow(), msg);
}

pub fn print_error(msg: &str) {
    eprintln!("{} {}", "✗".red(), msg);
}

pub fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn status_cell(status: JobStatus) -> String {
    match status {
        JobStatus::Pending => status.to_string().dimmed().to_string(),
        JobStatus::Processing => status.to_string().cyan().to_string(),
        JobStatus::Completed => status.to_string().green().to_string(),
        JobStatus::Failed => status.to_string().red().to_string(),
        JobStatus::Cancelled => status.to_string().yellow().to_string(),
    }
}

pub fn print_jobs(jobs: &[Job], format: OutputFormat) -> anyhow::Result<()> {
    if let OutputFormat::Json = format {
        return print_json(&jobs);
    }
    if jobs.is_empty() {
        println!("No jobs found.");
        return Ok(());
    }
    let mut builder = Builder::default();
    builder.push_record([
        "ID", "Type", "Status", "Inbound", "Start", "Done", "Failed", "Total", "Created",
    ]);
    for job in jobs {
        builder.push_record([
            job.id.to_string(),
            job.kind.to_string(),
            status_cell(job.status),
            job.params
                .inbound_id
                .map_or_else(|| "all".to_string(), |id| id.to_string()),
            job.params.start_index.to_string(),
            job.progress.completed.to_string(),
            job.progress.failed.to_string(),
            job.progress.total.to_string(),
            job.created_at.format("%Y-%m-%d %H:%M:%S").to_string(),
        ]);
    }
    println!("{}", builder.build().with(Style::rounded()));
    println!("Total: {}", jobs.len());
    Ok(())
}

pub fn print_job(job: &Job, format: OutputFormat) -> anyhow::Result<()> {
    if let OutputFormat::Json = format {
        return print_json(job);
    }
    let progress = &job.progress;
    println!("{}: {}", "Job".cyan(), job.id);
    println!("{}: {}", "Type".cyan(), job.kind);
    println!("{}: {}", "Status".cyan(), status_cell(job.status));
    println!(
        "{}: {}/{} ({:.1}%), {} failed, batch {}/{}",
        "Progress".cyan(),
        progress.completed,
        progress.total,
        progress.percent(),
        progress.failed,
        progress.current_batch,
        progress.total_batches
    );
    if let Some(started) = job.started_at {
        println!("{}: {started}", "Started".cyan());
    }
    if let Some(completed) = job.completed_at {
        println!("{}: {completed}", "Finished".cyan());
    }

    if !job.results.is_empty() {
        let mut builder = Builder::default();
        builder.push_record(["Client", "Email", "Inbound", "Action"]);
        for result in &job.results {
            builder.push_record([
                result
                    .client_id
                    .map_or_else(|| "-".to_string(), |id| id.to_string()),
                result.email.clone(),
                result.inbound_id.to_string(),
                result.action.clone().unwrap_or_else(|| "created".into()),
            ]);
        }
        println!("{}", builder.build().with(Style::rounded()));
    }
    for error in &job.errors {
        print_error(error);
    }
    Ok(())
}

pub fn print_clients(clients: &[ClientRecord], format: OutputFormat) -> anyhow::Result<()> {
    if let OutputFormat::Json = format {
        return print_json(&clients);
    }
    if clients.is_empty() {
        println!("No clients found.");
        return Ok(());
    }
    let mut builder = Builder::default();
    builder.push_record(["ID", "Inbound", "Email", "Enabled", "Used", "Total", "Expiry"]);
    for client in clients {
        let expiry = if client.expiry_time == 0 {
            "never".to_string()
        } else {
            chrono::DateTime::from_timestamp_millis(client.expiry_time).map_or_else(
                || client.expiry_time.to_string(),
                |t| t.format("%Y-%m-%d %H:%M").to_string(),
            )
        };
        builder.push_record([
            client.id.to_string(),
            client.inbound_id.to_string(),
            client.email.clone(),
            if client.enable {
                "yes".green().to_string()
            } else {
                "no".red().to_string()
            },
            client.used().to_string(),
            if client.total == 0 {
                "unlimited".to_string()
            } else {
                client.total.to_string()
            },
            expiry,
        ]);
    }
    println!("{}", builder.build().with(Style::rounded()));
    println!("Total: {}", clients.len());
    Ok(())
}

pub fn print_batch(result: &BatchResult, format: OutputFormat) -> anyhow::Result<()> {
    if let OutputFormat::Json = format {
        return print_json(result);
    }
    print_success(&format!(
        "{} applied, {} failed, {} without embedded document",
        result.succeeded, result.failed, result.warnings
    ));
    for error in &result.errors {
        print_error(error);
    }
    match &result.reconcile {
        ReconcileOutcome::Skipped => {}
        ReconcileOutcome::Succeeded => print_success("Reconciled"),
        ReconcileOutcome::Failed { message } => print_warning(&format!("Reconcile failed: {message}")),
    }
    Ok(())
}

pub fn print_audit(report: &AuditReport, format: OutputFormat) -> anyhow::Result<()> {
    if let OutputFormat::Json = format {
        return print_json(report);
    }
    if report.is_clean() {
        print_success(&format!(
            "{} inbounds, {} clients, no findings",
            report.inbounds_checked, report.clients_checked
        ));
        return Ok(());
    }
    let mut builder = Builder::default();
    builder.push_record(["Inbound", "Kind", "Detail", "Repairable"]);
    for finding in &report.findings {
        builder.push_record([
            finding.inbound_id().to_string(),
            finding.label().to_string(),
            finding.to_string(),
            if finding.is_repairable() { "yes" } else { "no" }.to_string(),
        ]);
    }
    println!("{}", builder.build().with(Style::rounded()));
    print_warning(&format!(
        "{} findings in {} inbounds ({} clients)",
        report.findings.len(),
        report.inbounds_checked,
        report.clients_checked
    ));
    Ok(())
}

pub fn print_repair(report: &RepairReport, format: OutputFormat) -> anyhow::Result<()> {
    if let OutputFormat::Json = format {
        return print_json(report);
    }
    for action in &report.actions {
        print_success(&format!(
            "inbound {} {}: {}",
            action.inbound_id, action.email, action.action
        ));
    }
    for problem in &report.unresolved {
        print_warning(problem);
    }
    if report.actions.is_empty() && report.unresolved.is_empty() {
        print_success("Nothing to repair");
    }
    Ok(())
}
