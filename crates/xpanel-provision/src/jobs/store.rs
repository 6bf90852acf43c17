use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashSet;
use tokio::sync::Mutex;

use super::{Job, JobError, JobId, JobKind, JobParams, JobResult, JobStatus, Progress};
use crate::batch::push_capped;

const RESTART_ERROR: &str = "interrupted by process restart";

/// Job table with optional JSON file persistence.
///
/// Every mutating call rewrites the whole file (temp file + rename) while the
/// table lock is held, so concurrent writers never interleave.
pub struct JobStore {
    jobs: Mutex<HashMap<JobId, Job>>,
    path: Option<PathBuf>,
    /// Cancelled jobs that already took the item in flight at cancellation.
    settled: DashSet<JobId>,
}

impl JobStore {
    /// Store that lives only in memory.
    pub fn in_memory() -> Self {
        Self {
            jobs: Mutex::new(HashMap::new()),
            path: None,
            settled: DashSet::new(),
        }
    }

    /// Loads the table from `path`, creating an empty one if the file is absent.
    ///
    /// Jobs a previous process left in `processing` are marked failed.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, JobError> {
        let path = path.as_ref().to_path_buf();
        let mut jobs = HashMap::new();

        match tokio::fs::read(&path).await {
            Ok(bytes) => {
                let stored: Vec<Job> = serde_json::from_slice(&bytes)
                    .map_err(|e| JobError::Load(format!("{}: {e}", path.display())))?;
                jobs.extend(stored.into_iter().map(|job| (job.id, job)));
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(JobError::Load(format!("{}: {e}", path.display()))),
        }

        let mut interrupted = 0usize;
        for job in jobs.values_mut() {
            if job.status == JobStatus::Processing {
                job.status = JobStatus::Failed;
                job.completed_at = Some(Utc::now());
                push_capped(&mut job.errors, RESTART_ERROR.to_string());
                interrupted += 1;
            }
        }

        tracing::info!(
            path = %path.display(),
            jobs = jobs.len(),
            interrupted,
            "Job store opened"
        );

        let store = Self {
            jobs: Mutex::new(jobs),
            path: Some(path),
            settled: DashSet::new(),
        };
        if interrupted > 0 {
            let jobs = store.jobs.lock().await;
            store.persist(&jobs).await?;
        }
        Ok(store)
    }

    pub async fn create(&self, kind: JobKind, params: JobParams) -> Result<Job, JobError> {
        let job = Job::new(kind, params);
        let mut jobs = self.jobs.lock().await;
        jobs.insert(job.id, job.clone());
        self.persist(&jobs).await?;

        tracing::info!(job_id = %job.id, kind = %kind, count = job.params.count, "Job created");
        Ok(job)
    }

    pub async fn get(&self, id: JobId) -> Option<Job> {
        self.jobs.lock().await.get(&id).cloned()
    }

    pub async fn status(&self, id: JobId) -> Option<JobStatus> {
        self.jobs.lock().await.get(&id).map(|job| job.status)
    }

    /// Jobs newest first, optionally only those with `status`.
    pub async fn list(&self, status: Option<JobStatus>) -> Vec<Job> {
        let jobs = self.jobs.lock().await;
        let mut listed: Vec<Job> = jobs
            .values()
            .filter(|job| status.is_none_or(|s| job.status == s))
            .cloned()
            .collect();
        listed.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        listed
    }

    /// Moves a job to `to`, stamping start and completion times.
    pub async fn set_status(&self, id: JobId, to: JobStatus) -> Result<Job, JobError> {
        self.mutate(id, |job| {
            if !job.status.can_transition_to(to) {
                return Err(JobError::InvalidStatusTransition {
                    from: job.status,
                    to,
                });
            }
            job.status = to;
            if to == JobStatus::Processing {
                job.started_at = Some(Utc::now());
            }
            if to.is_terminal() {
                job.completed_at = Some(Utc::now());
            }
            tracing::debug!(job_id = %id, status = %to, "Job status updated");
            Ok(job.clone())
        })
        .await
    }

    /// Moves a pending job to processing. Returns false if it was not pending.
    pub async fn begin(&self, id: JobId) -> Result<bool, JobError> {
        self.mutate(id, |job| {
            if job.status != JobStatus::Pending {
                return Ok(false);
            }
            job.status = JobStatus::Processing;
            job.started_at = Some(Utc::now());
            Ok(true)
        })
        .await
    }

    pub async fn set_total_batches(&self, id: JobId, total_batches: usize) -> Result<bool, JobError> {
        self.mutate_active(id, |job| job.progress.total_batches = total_batches)
            .await
    }

    pub async fn set_total(&self, id: JobId, total: usize) -> Result<bool, JobError> {
        self.mutate_active(id, |job| job.progress.total = total)
            .await
    }

    /// Overwrites the counters of an active job. Returns false once the job is
    /// terminal; its progress is then frozen.
    pub async fn update_progress(
        &self,
        id: JobId,
        completed: usize,
        failed: usize,
        current_batch: usize,
    ) -> Result<bool, JobError> {
        self.mutate_active(id, |job| {
            job.progress.completed = completed;
            job.progress.failed = failed;
            job.progress.current_batch = current_batch;
        })
        .await
    }

    pub async fn push_result(&self, id: JobId, result: JobResult) -> Result<bool, JobError> {
        self.mutate_active(id, |job| job.results.push(result)).await
    }

    /// Appends an error, dropping the oldest beyond the cap.
    pub async fn push_error(&self, id: JobId, message: String) -> Result<bool, JobError> {
        self.mutate_active(id, |job| push_capped(&mut job.errors, message))
            .await
    }

    /// Records one processed item and its counters with a single write.
    ///
    /// Returns false once the job is no longer processing. The one item that was
    /// already started when the job got cancelled is still recorded.
    pub async fn record_item(
        &self,
        id: JobId,
        progress: Progress,
        item: Result<JobResult, String>,
    ) -> Result<bool, JobError> {
        let mut jobs = self.jobs.lock().await;
        let job = jobs.get_mut(&id).ok_or(JobError::NotFound(id))?;
        let active = match job.status {
            JobStatus::Processing => true,
            JobStatus::Cancelled
                if job.progress.processed() + 1 == progress.processed()
                    && self.settled.insert(id) =>
            {
                tracing::debug!(job_id = %id, "Recording item in flight at cancellation");
                false
            }
            _ => return Ok(false),
        };
        job.progress.completed = progress.completed;
        job.progress.failed = progress.failed;
        job.progress.current_batch = progress.current_batch;
        match item {
            Ok(result) => job.results.push(result),
            Err(message) => push_capped(&mut job.errors, message),
        }
        self.persist(&jobs).await?;
        Ok(active)
    }

    /// Cancels a pending or processing job.
    pub async fn cancel(&self, id: JobId) -> Result<Job, JobError> {
        let job = self.set_status(id, JobStatus::Cancelled).await?;
        tracing::info!(job_id = %id, "Job cancelled");
        Ok(job)
    }

    /// Removes a job that is not processing.
    pub async fn delete(&self, id: JobId) -> Result<Job, JobError> {
        let mut jobs = self.jobs.lock().await;
        match jobs.get(&id).map(|job| job.status) {
            None => return Err(JobError::NotFound(id)),
            Some(JobStatus::Processing) => return Err(JobError::Busy(id)),
            Some(_) => {}
        }
        let removed = jobs.remove(&id).ok_or(JobError::NotFound(id))?;
        self.settled.remove(&id);
        self.persist(&jobs).await?;
        tracing::info!(job_id = %id, "Job deleted");
        Ok(removed)
    }

    /// Deletes terminal jobs that finished before `cutoff`.
    pub async fn purge_finished_before(&self, cutoff: DateTime<Utc>) -> Result<usize, JobError> {
        let mut jobs = self.jobs.lock().await;
        let before = jobs.len();
        jobs.retain(|_, job| {
            let finished = job.completed_at.unwrap_or(job.created_at);
            !(job.status.is_terminal() && finished < cutoff)
        });
        self.settled.retain(|id| jobs.contains_key(id));
        let purged = before - jobs.len();
        if purged > 0 {
            self.persist(&jobs).await?;
            tracing::info!(purged, "Purged finished jobs");
        }
        Ok(purged)
    }

    /// Start background cleanup task
    pub fn start_cleanup_task(
        self: Arc<Self>,
        retention: Duration,
        interval: Duration,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(interval);

            loop {
                interval.tick().await;

                let retention = chrono::Duration::from_std(retention)
                    .unwrap_or_else(|_| chrono::Duration::days(36500));
                let cutoff = Utc::now() - retention;
                match self.purge_finished_before(cutoff).await {
                    Ok(purged) if purged > 0 => {
                        tracing::debug!(purged, "Job cleanup completed");
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "Job cleanup failed");
                    }
                    _ => {}
                }
            }
        })
    }

    async fn mutate<T>(
        &self,
        id: JobId,
        f: impl FnOnce(&mut Job) -> Result<T, JobError>,
    ) -> Result<T, JobError> {
        let mut jobs = self.jobs.lock().await;
        let job = jobs.get_mut(&id).ok_or(JobError::NotFound(id))?;
        let value = f(job)?;
        self.persist(&jobs).await?;
        Ok(value)
    }

    /// Applies `f` only while the job is processing.
    async fn mutate_active(&self, id: JobId, f: impl FnOnce(&mut Job)) -> Result<bool, JobError> {
        let mut jobs = self.jobs.lock().await;
        let job = jobs.get_mut(&id).ok_or(JobError::NotFound(id))?;
        if job.status != JobStatus::Processing {
            return Ok(false);
        }
        f(job);
        self.persist(&jobs).await?;
        Ok(true)
    }

    async fn persist(&self, jobs: &HashMap<JobId, Job>) -> Result<(), JobError> {
        let Some(path) = &self.path else {
            return Ok(());
        };

        let mut ordered: Vec<&Job> = jobs.values().collect();
        ordered.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        let bytes =
            serde_json::to_vec_pretty(&ordered).map_err(|e| JobError::Persist(e.to_string()))?;

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| JobError::Persist(format!("{}: {e}", parent.display())))?;
        }
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, &bytes)
            .await
            .map_err(|e| JobError::Persist(format!("{}: {e}", tmp.display())))?;
        tokio::fs::rename(&tmp, path)
            .await
            .map_err(|e| JobError::Persist(format!("{}: {e}", path.display())))?;
        Ok(())
    }
}
