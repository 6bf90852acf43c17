//! Background provisioning jobs.
//!
//! A job is one unit of bulk work with a lifecycle, progress counters and a
//! bounded error list:
//!
//! - [`JobStore`] holds every job and persists the table as JSON
//! - [`JobRunner`] executes one job per background task
//! - [`FanOutPlanner`] splits a large request into bounded jobs
//!
//! ## Lifecycle
//!
//! `pending -> processing -> completed | failed | cancelled`, and
//! `pending -> cancelled`. Terminal states never change again.

mod planner;
mod runner;
mod store;

pub use planner::{FanOutPlanner, JOB_CHUNK_SIZE, PlannerLimits};
pub use runner::{JobRunner, RunnerSettings};
pub use store::JobStore;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;
use xpanel_core::{ClientId, ClientRecord, InboundId, ProtocolParams};

pub use crate::batch::MAX_ERRORS as MAX_JOB_ERRORS;

pub type JobId = Uuid;

/// Errors that can occur during job bookkeeping
#[derive(Debug, Error)]
pub enum JobError {
    #[error("Job not found: {0}")]
    NotFound(JobId),

    #[error("Invalid job status transition from {from} to {to}")]
    InvalidStatusTransition { from: JobStatus, to: JobStatus },

    #[error("Job {0} is processing and cannot be deleted")]
    Busy(JobId),

    #[error("Invalid job parameters: {0}")]
    InvalidParams(String),

    #[error("Job execution failed: {0}")]
    ExecutionFailed(String),

    #[error("Failed to persist job store: {0}")]
    Persist(String),

    #[error("Failed to load job store: {0}")]
    Load(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    pub fn can_transition_to(self, next: JobStatus) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Processing)
                | (Self::Pending, Self::Cancelled)
                | (Self::Processing, Self::Completed)
                | (Self::Processing, Self::Failed)
                | (Self::Processing, Self::Cancelled)
        )
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobStatus::Pending => write!(f, "pending"),
            JobStatus::Processing => write!(f, "processing"),
            JobStatus::Completed => write!(f, "completed"),
            JobStatus::Failed => write!(f, "failed"),
            JobStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl std::str::FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pending" => Ok(Self::Pending),
            "processing" => Ok(Self::Processing),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(format!("unknown job status {other:?}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    BulkCreate,
    Repair,
}

impl std::fmt::Display for JobKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobKind::BulkCreate => write!(f, "bulk_create"),
            JobKind::Repair => write!(f, "repair"),
        }
    }
}

/// Shape of the clients a bulk-create job produces.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientTemplate {
    #[serde(default = "default_prefix")]
    pub prefix: String,
    /// Quota in bytes, 0 = unlimited
    #[serde(default)]
    pub total: i64,
    /// Expiry in epoch ms, 0 = never
    #[serde(default)]
    pub expiry_time: i64,
    #[serde(default)]
    pub limit_ip: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flow: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

fn default_prefix() -> String {
    "user".into()
}

impl Default for ClientTemplate {
    fn default() -> Self {
        Self {
            prefix: default_prefix(),
            total: 0,
            expiry_time: 0,
            limit_ip: 0,
            flow: None,
            method: None,
            password: None,
        }
    }
}

impl ClientTemplate {
    pub fn protocol_params(&self) -> ProtocolParams {
        ProtocolParams {
            identifier: None,
            password: self.password.clone(),
            method: self.method.clone(),
            flow: self.flow.clone(),
            limit_ip: self.limit_ip,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobParams {
    #[serde(default)]
    pub template: ClientTemplate,
    #[serde(default)]
    pub count: usize,
    /// Target inbound; for repair jobs `None` means every inbound.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inbound_id: Option<InboundId>,
    /// Offset of this job's first client in the overall request
    #[serde(default)]
    pub start_index: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Progress {
    pub total: usize,
    pub completed: usize,
    pub failed: usize,
    pub current_batch: usize,
    pub total_batches: usize,
}

impl Progress {
    pub fn processed(&self) -> usize {
        self.completed + self.failed
    }

    pub fn percent(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        self.processed() as f64 * 100.0 / self.total as f64
    }
}

/// One created client, or one repair action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobResult {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<ClientId>,
    pub email: String,
    pub inbound_id: InboundId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
}

impl JobResult {
    pub fn created(record: &ClientRecord) -> Self {
        Self {
            client_id: Some(record.id),
            email: record.email.clone(),
            inbound_id: record.inbound_id,
            action: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    #[serde(rename = "type")]
    pub kind: JobKind,
    pub status: JobStatus,
    pub params: JobParams,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub progress: Progress,
    #[serde(default)]
    pub results: Vec<JobResult>,
    /// Latest error messages, at most [`MAX_JOB_ERRORS`].
    #[serde(default)]
    pub errors: Vec<String>,
}

impl Job {
    pub fn new(kind: JobKind, params: JobParams) -> Self {
        let progress = Progress {
            total: params.count,
            ..Progress::default()
        };
        Self {
            id: Uuid::new_v4(),
            kind,
            status: JobStatus::Pending,
            params,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            progress,
            results: Vec::new(),
            errors: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_status_serialization() {
        let status = JobStatus::Processing;
        let serialized = serde_json::to_string(&status).unwrap();
        assert_eq!(serialized, "\"processing\"");

        let deserialized: JobStatus = serde_json::from_str(&serialized).unwrap();
        assert_eq!(deserialized, status);
        assert_eq!("Cancelled".parse::<JobStatus>().unwrap(), JobStatus::Cancelled);
    }

    #[test]
    fn test_transitions() {
        use JobStatus::*;
        assert!(Pending.can_transition_to(Processing));
        assert!(Pending.can_transition_to(Cancelled));
        assert!(Processing.can_transition_to(Failed));
        assert!(!Pending.can_transition_to(Completed));
        for terminal in [Completed, Failed, Cancelled] {
            assert!(terminal.is_terminal());
            for next in [Pending, Processing, Completed, Failed, Cancelled] {
                assert!(!terminal.can_transition_to(next));
            }
        }
    }

    #[test]
    fn test_job_record_shape() {
        let job = Job::new(
            JobKind::BulkCreate,
            JobParams {
                count: 3,
                inbound_id: Some(1),
                ..JobParams::default()
            },
        );
        let value = serde_json::to_value(&job).unwrap();
        assert_eq!(value["type"], "bulk_create");
        assert_eq!(value["status"], "pending");
        assert_eq!(value["params"]["template"]["prefix"], "user");
        assert_eq!(value["progress"]["total"], 3);
        assert!(value["errors"].as_array().unwrap().is_empty());
    }
}
