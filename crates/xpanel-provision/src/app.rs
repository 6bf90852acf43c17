//! Wiring of storage, engine, reconciler and job machinery into one handle.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use xpanel_storage::DynStorage;

use crate::audit::Auditor;
use crate::batch::BatchMutator;
use crate::config::AppConfig;
use crate::consistency::ConsistencyEngine;
use crate::create_storage;
use crate::error::ProvisionResult;
use crate::jobs::{FanOutPlanner, JobRunner, JobStore, PlannerLimits, RunnerSettings};
use crate::reconcile::{self, Reconciler, SerializedReconciler};

/// Everything a command or test needs, sharing one storage handle.
pub struct Provisioner {
    config: AppConfig,
    engine: Arc<ConsistencyEngine>,
    reconciler: Arc<SerializedReconciler>,
    mutator: Arc<BatchMutator>,
    auditor: Arc<Auditor>,
    runner: Arc<JobRunner>,
    planner: FanOutPlanner,
}

impl Provisioner {
    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn engine(&self) -> &Arc<ConsistencyEngine> {
        &self.engine
    }

    pub fn reconciler(&self) -> &Arc<SerializedReconciler> {
        &self.reconciler
    }

    pub fn mutator(&self) -> &Arc<BatchMutator> {
        &self.mutator
    }

    pub fn auditor(&self) -> &Arc<Auditor> {
        &self.auditor
    }

    pub fn runner(&self) -> &Arc<JobRunner> {
        &self.runner
    }

    pub fn jobs(&self) -> &Arc<JobStore> {
        self.runner.store()
    }

    pub fn planner(&self) -> &FanOutPlanner {
        &self.planner
    }

    /// Periodically purges finished jobs older than the retention window.
    pub fn start_cleanup_task(&self) -> JoinHandle<()> {
        let jobs = &self.config.jobs;
        Arc::clone(self.jobs()).start_cleanup_task(
            Duration::from_secs(jobs.retention_hours * 3600),
            Duration::from_secs(jobs.cleanup_interval_seconds),
        )
    }
}

#[derive(Default)]
pub struct ProvisionerBuilder {
    config: AppConfig,
    storage: Option<DynStorage>,
    reconciler: Option<Arc<dyn Reconciler>>,
    job_store: Option<Arc<JobStore>>,
}

impl ProvisionerBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(mut self, cfg: AppConfig) -> Self {
        self.config = cfg;
        self
    }

    /// Uses `storage` instead of the configured backend.
    pub fn with_storage(mut self, storage: DynStorage) -> Self {
        self.storage = Some(storage);
        self
    }

    /// Uses `reconciler` instead of the configured command.
    pub fn with_reconciler(mut self, reconciler: Arc<dyn Reconciler>) -> Self {
        self.reconciler = Some(reconciler);
        self
    }

    /// Uses `store` instead of the file at `jobs.store_path`.
    pub fn with_job_store(mut self, store: Arc<JobStore>) -> Self {
        self.job_store = Some(store);
        self
    }

    pub async fn build(self) -> ProvisionResult<Provisioner> {
        let config = self.config;
        let storage = match self.storage {
            Some(storage) => storage,
            None => create_storage(&config.storage).await?,
        };
        let store = match self.job_store {
            Some(store) => store,
            None => Arc::new(JobStore::open(&config.jobs.store_path).await?),
        };
        let reconciler = match self.reconciler {
            Some(inner) => Arc::new(SerializedReconciler::new(inner)),
            None => reconcile::from_config(&config.reconcile),
        };

        let engine = Arc::new(ConsistencyEngine::new(storage, config.secret_defaults()));
        let mutator = Arc::new(BatchMutator::new(engine.clone(), reconciler.clone()));
        let auditor = Arc::new(Auditor::new(engine.clone()));
        let runner = Arc::new(JobRunner::new(
            store,
            mutator.clone(),
            auditor.clone(),
            RunnerSettings::from_config(&config.jobs),
        ));
        let planner = FanOutPlanner::new(
            engine.clone(),
            runner.clone(),
            PlannerLimits::from_config(&config.jobs),
        );

        tracing::info!(
            backend = ?config.storage.backend,
            batch_size = config.jobs.batch_size,
            max_concurrent_jobs = config.jobs.max_concurrent_jobs,
            reconcile = config.reconcile.enabled,
            "Provisioner ready"
        );

        Ok(Provisioner {
            config,
            engine,
            reconciler,
            mutator,
            auditor,
            runner,
            planner,
        })
    }
}
