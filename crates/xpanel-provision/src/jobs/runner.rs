use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};

use super::{Job, JobError, JobId, JobKind, JobResult, JobStatus, JobStore, Progress};
use crate::audit::Auditor;
use crate::batch::{BatchMutator, ClientOp, ItemOutcome, client_email};
use crate::config::JobsConfig;

#[derive(Debug, Clone)]
pub struct RunnerSettings {
    pub batch_size: usize,
    pub batch_pause: Duration,
    pub max_concurrent_jobs: usize,
    /// Where repair jobs copy the database before changing it.
    pub repair_backup_dir: Option<PathBuf>,
}

impl RunnerSettings {
    pub fn from_config(cfg: &JobsConfig) -> Self {
        Self {
            batch_size: cfg.batch_size.max(1),
            batch_pause: cfg.batch_pause(),
            max_concurrent_jobs: cfg.max_concurrent_jobs.max(1),
            repair_backup_dir: cfg.repair_backup_dir.as_ref().map(PathBuf::from),
        }
    }
}

impl Default for RunnerSettings {
    fn default() -> Self {
        Self::from_config(&JobsConfig::default())
    }
}

/// Executes jobs on background tasks, at most `max_concurrent_jobs` at once.
pub struct JobRunner {
    store: Arc<JobStore>,
    mutator: Arc<BatchMutator>,
    auditor: Arc<Auditor>,
    permits: Arc<Semaphore>,
    settings: RunnerSettings,
}

impl JobRunner {
    pub fn new(
        store: Arc<JobStore>,
        mutator: Arc<BatchMutator>,
        auditor: Arc<Auditor>,
        settings: RunnerSettings,
    ) -> Self {
        Self {
            store,
            mutator,
            auditor,
            permits: Arc::new(Semaphore::new(settings.max_concurrent_jobs)),
            settings,
        }
    }

    pub fn store(&self) -> &Arc<JobStore> {
        &self.store
    }

    pub fn settings(&self) -> &RunnerSettings {
        &self.settings
    }

    /// Marks a pending job as processing and runs it in the background.
    ///
    /// Returns false when the job is not pending.
    pub async fn start(self: &Arc<Self>, id: JobId) -> Result<bool, JobError> {
        if !self.store.begin(id).await? {
            debug!(job_id = %id, "Job not pending, not started");
            return Ok(false);
        }

        let runner = Arc::clone(self);
        tokio::spawn(async move {
            runner.execute(id).await;
        });
        Ok(true)
    }

    /// Polls until the job reaches a terminal status.
    pub async fn wait(&self, id: JobId, poll: Duration) -> Option<Job> {
        loop {
            let job = self.store.get(id).await?;
            if job.status.is_terminal() {
                return Some(job);
            }
            tokio::time::sleep(poll).await;
        }
    }

    async fn execute(&self, id: JobId) {
        let Ok(_permit) = Arc::clone(&self.permits).acquire_owned().await else {
            error!(job_id = %id, "Job semaphore closed");
            return;
        };

        let Some(job) = self.store.get(id).await else {
            return;
        };
        if job.status != JobStatus::Processing {
            info!(job_id = %id, status = %job.status, "Job left processing before it ran");
            return;
        }

        info!(job_id = %id, kind = %job.kind, "Job started");
        let outcome = match job.kind {
            JobKind::BulkCreate => self.run_bulk_create(&job).await,
            JobKind::Repair => self.run_repair(&job).await,
        };

        match outcome {
            Ok(()) => match self.store.set_status(id, JobStatus::Completed).await {
                Ok(job) => info!(
                    job_id = %id,
                    completed = job.progress.completed,
                    failed = job.progress.failed,
                    "Job completed"
                ),
                Err(JobError::InvalidStatusTransition { from, .. }) => {
                    info!(job_id = %id, status = %from, "Job stopped early");
                }
                Err(e) => error!(job_id = %id, error = %e, "Failed to complete job"),
            },
            Err(e) => {
                error!(job_id = %id, error = %e, "Job failed");
                if let Err(e) = self.store.push_error(id, e.to_string()).await {
                    warn!(job_id = %id, error = %e, "Failed to record job error");
                }
                if let Err(e) = self.store.set_status(id, JobStatus::Failed).await {
                    warn!(job_id = %id, error = %e, "Failed to mark job failed");
                }
            }
        }
    }

    async fn is_active(&self, id: JobId) -> bool {
        self.store.status(id).await == Some(JobStatus::Processing)
    }

    async fn run_bulk_create(&self, job: &Job) -> Result<(), JobError> {
        let params = &job.params;
        let inbound_id = params
            .inbound_id
            .ok_or_else(|| JobError::InvalidParams("bulk create needs an inbound".into()))?;
        let protocol_params = params.template.protocol_params();
        let batch_size = self.settings.batch_size;
        let total_batches = params.count.div_ceil(batch_size);
        self.store.set_total_batches(job.id, total_batches).await?;

        let mut progress = Progress {
            total: params.count,
            total_batches,
            ..Progress::default()
        };

        for batch in 0..total_batches {
            if !self.is_active(job.id).await {
                return Ok(());
            }
            progress.current_batch = batch + 1;

            let start = batch * batch_size;
            let end = (start + batch_size).min(params.count);
            let mut changed = false;
            for index in start..end {
                if !self.is_active(job.id).await {
                    return Ok(());
                }
                let email = client_email(&params.template.prefix, params.start_index, index);
                let op = ClientOp::Create {
                    inbound_id,
                    email: email.clone(),
                    total: params.template.total,
                    expiry_time: params.template.expiry_time,
                    params: protocol_params.clone(),
                };
                let item = match self.mutator.apply(&op).await {
                    Ok(ItemOutcome::Created { record }) => {
                        changed = true;
                        progress.completed += 1;
                        Ok(JobResult::created(&record))
                    }
                    Ok(_) => {
                        progress.completed += 1;
                        Ok(JobResult {
                            client_id: None,
                            email,
                            inbound_id,
                            action: None,
                        })
                    }
                    Err(e) => {
                        progress.failed += 1;
                        debug!(job_id = %job.id, email = %email, error = %e, "Client creation failed");
                        Err(format!("{email}: {e}"))
                    }
                };
                if !self.store.record_item(job.id, progress, item).await? {
                    return Ok(());
                }
            }

            if changed {
                if let Err(e) = self.mutator.reconcile().await {
                    let message = format!("reconciliation after batch {} failed: {e}", batch + 1);
                    warn!(job_id = %job.id, batch = batch + 1, error = %e, "Reconciliation failed, continuing");
                    self.store.push_error(job.id, message).await?;
                }
            }

            debug!(
                job_id = %job.id,
                batch = batch + 1,
                total_batches,
                completed = progress.completed,
                failed = progress.failed,
                "Batch finished"
            );

            if batch + 1 < total_batches && !self.settings.batch_pause.is_zero() {
                tokio::time::sleep(self.settings.batch_pause).await;
            }
        }
        Ok(())
    }

    async fn run_repair(&self, job: &Job) -> Result<(), JobError> {
        if let Some(dir) = &self.settings.repair_backup_dir {
            self.backup_before_repair(job.id, dir).await?;
        }

        let report = self
            .auditor
            .repair(job.params.inbound_id)
            .await
            .map_err(|e| JobError::ExecutionFailed(e.to_string()))?;

        let total = report.actions.len() + report.unresolved.len();
        self.store.set_total(job.id, total).await?;
        self.store.set_total_batches(job.id, 1).await?;

        if !self.is_active(job.id).await {
            warn!(
                job_id = %job.id,
                fixes = report.actions.len(),
                "Repair pass finished after the job was cancelled"
            );
            return Ok(());
        }
        for action in &report.actions {
            let result = JobResult {
                client_id: action.client_id,
                email: action.email.clone(),
                inbound_id: action.inbound_id,
                action: Some(action.action.clone()),
            };
            self.store.push_result(job.id, result).await?;
        }
        for problem in &report.unresolved {
            self.store.push_error(job.id, problem.clone()).await?;
        }
        self.store
            .update_progress(job.id, report.actions.len(), report.unresolved.len(), 1)
            .await?;

        if !report.actions.is_empty() {
            if let Err(e) = self.mutator.reconcile().await {
                self.store
                    .push_error(job.id, format!("reconciliation after repair failed: {e}"))
                    .await?;
            }
        }
        Ok(())
    }

    async fn backup_before_repair(&self, id: JobId, dir: &std::path::Path) -> Result<(), JobError> {
        tokio::fs::create_dir_all(dir)
            .await
            .map_err(|e| JobError::ExecutionFailed(format!("backup dir {}: {e}", dir.display())))?;
        let path = dir.join(format!(
            "x-ui-{}-{}.db",
            chrono::Utc::now().format("%Y%m%d-%H%M%S"),
            id.simple()
        ));
        let copied = self
            .mutator
            .engine()
            .storage()
            .backup(&path)
            .await
            .map_err(|e| JobError::ExecutionFailed(format!("backup before repair failed: {e}")))?;
        if copied {
            info!(job_id = %id, path = %path.display(), "Database backed up before repair");
        } else {
            debug!(job_id = %id, "Storage has no durable copy, repair runs without backup");
        }
        Ok(())
    }
}
