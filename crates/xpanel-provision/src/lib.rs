pub mod app;
pub mod audit;
pub mod batch;
pub mod config;
pub mod consistency;
pub mod error;
pub mod jobs;
pub mod observability;
pub mod reconcile;

pub use app::{Provisioner, ProvisionerBuilder};
pub use audit::{AuditReport, Auditor, Finding, RepairAction, RepairReport};
pub use batch::{BatchMutator, BatchResult, ClientOp, ItemOutcome, ReconcileOutcome};
pub use config::{AppConfig, JobsConfig, ReconcileConfig, StorageBackend, StorageConfig};
pub use consistency::{ConsistencyEngine, SyncOutcome};
pub use error::{ProvisionError, ProvisionResult};
pub use jobs::{
    ClientTemplate, FanOutPlanner, Job, JobError, JobId, JobKind, JobParams, JobRunner,
    JobStatus, JobStore,
};
pub use observability::init_tracing;
pub use reconcile::{CommandReconciler, NoopReconciler, ReconcileError, Reconciler};

use std::sync::Arc;

use xpanel_storage::{DynStorage, StorageError};

/// Create the panel storage backend selected by configuration.
///
/// ## Backends
///
/// - **sqlite**: opens the panel database at `storage.sqlite.path`; the file
///   must already exist, it is never created here
/// - **memory**: empty in-process tables, for dry runs
pub async fn create_storage(config: &StorageConfig) -> Result<DynStorage, StorageError> {
    match config.backend {
        StorageBackend::Sqlite => {
            let path = config.sqlite.path.clone();
            tracing::info!(path = %path, "Opening panel database");
            let storage = tokio::task::spawn_blocking(move || {
                xpanel_db_sqlite::SqliteStorage::open(&path)
            })
            .await
            .map_err(|e| StorageError::backend(e.to_string()))??;
            Ok(Arc::new(storage))
        }
        StorageBackend::Memory => {
            tracing::info!("Using in-memory panel storage");
            Ok(xpanel_db_memory::create_panel_storage())
        }
    }
}
