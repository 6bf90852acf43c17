use std::sync::Arc;

use tracing::info;
use xpanel_core::InboundId;

use super::{ClientTemplate, Job, JobKind, JobParams, JobRunner};
use crate::config::JobsConfig;
use crate::consistency::ConsistencyEngine;
use crate::error::{ProvisionError, ProvisionResult};

/// Clients per job when a request is split.
pub const JOB_CHUNK_SIZE: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlannerLimits {
    /// Most clients one request may create across all targets
    pub max_operations: usize,
    pub max_targets: usize,
}

impl PlannerLimits {
    pub fn from_config(cfg: &JobsConfig) -> Self {
        Self {
            max_operations: cfg.max_operations,
            max_targets: cfg.max_targets,
        }
    }
}

impl Default for PlannerLimits {
    fn default() -> Self {
        Self::from_config(&JobsConfig::default())
    }
}

/// Turns provisioning requests into started jobs.
pub struct FanOutPlanner {
    engine: Arc<ConsistencyEngine>,
    runner: Arc<JobRunner>,
    limits: PlannerLimits,
}

impl FanOutPlanner {
    pub fn new(engine: Arc<ConsistencyEngine>, runner: Arc<JobRunner>, limits: PlannerLimits) -> Self {
        Self {
            engine,
            runner,
            limits,
        }
    }

    pub fn limits(&self) -> PlannerLimits {
        self.limits
    }

    /// Creates `count` clients in each of `targets`.
    ///
    /// Every target gets `ceil(count / JOB_CHUNK_SIZE)` jobs whose numbering
    /// continues where the previous chunk stopped, so each target ends up with
    /// `prefix_0001 ..= prefix_{count}`. Nothing is created unless every target
    /// exists and the request fits the limits.
    pub async fn plan_multi_target(
        &self,
        template: &ClientTemplate,
        count: usize,
        targets: &[InboundId],
    ) -> ProvisionResult<Vec<Job>> {
        let targets = self.check(count, targets)?;
        for &target in &targets {
            self.engine.require_inbound(target).await?;
        }

        let mut jobs = Vec::new();
        for &target in &targets {
            let mut start_index = 0;
            while start_index < count {
                let chunk = JOB_CHUNK_SIZE.min(count - start_index);
                let params = JobParams {
                    template: template.clone(),
                    count: chunk,
                    inbound_id: Some(target),
                    start_index,
                };
                jobs.push(self.runner.store().create(JobKind::BulkCreate, params).await?);
                start_index += chunk;
            }
        }

        for job in &jobs {
            self.runner.start(job.id).await?;
        }
        info!(
            targets = targets.len(),
            count,
            jobs = jobs.len(),
            "Provisioning request planned"
        );
        Ok(jobs)
    }

    /// Single bulk-create job for one inbound, without chunking.
    pub async fn submit_bulk_create(
        &self,
        template: &ClientTemplate,
        count: usize,
        inbound_id: InboundId,
    ) -> ProvisionResult<Job> {
        self.check(count, &[inbound_id])?;
        self.engine.require_inbound(inbound_id).await?;
        let params = JobParams {
            template: template.clone(),
            count,
            inbound_id: Some(inbound_id),
            start_index: 0,
        };
        let job = self.runner.store().create(JobKind::BulkCreate, params).await?;
        self.runner.start(job.id).await?;
        Ok(job)
    }

    /// Repair job for one inbound, or every inbound when `None`.
    pub async fn submit_repair(&self, inbound_id: Option<InboundId>) -> ProvisionResult<Job> {
        if let Some(id) = inbound_id {
            self.engine.require_inbound(id).await?;
        }
        let params = JobParams {
            inbound_id,
            ..JobParams::default()
        };
        let job = self.runner.store().create(JobKind::Repair, params).await?;
        self.runner.start(job.id).await?;
        Ok(job)
    }

    /// Validates the request shape and returns the targets without duplicates.
    fn check(&self, count: usize, targets: &[InboundId]) -> ProvisionResult<Vec<InboundId>> {
        if count == 0 {
            return Err(ProvisionError::quota_exceeded("count must be at least 1"));
        }
        let mut unique = Vec::with_capacity(targets.len());
        for &target in targets {
            if !unique.contains(&target) {
                unique.push(target);
            }
        }
        if unique.is_empty() {
            return Err(ProvisionError::quota_exceeded("no target inbounds given"));
        }
        if unique.len() > self.limits.max_targets {
            return Err(ProvisionError::quota_exceeded(format!(
                "{} targets exceed the limit of {}",
                unique.len(),
                self.limits.max_targets
            )));
        }
        let total = count
            .checked_mul(unique.len())
            .filter(|total| *total <= self.limits.max_operations)
            .ok_or_else(|| {
                ProvisionError::quota_exceeded(format!(
                    "{count} clients x {} targets exceed the limit of {} operations",
                    unique.len(),
                    self.limits.max_operations
                ))
            })?;
        info!(total, "Provisioning request accepted");
        Ok(unique)
    }
}
