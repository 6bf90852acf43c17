#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use xpanel_core::{ClientId, ClientRecord, InboundId, InboundRecord, NewClient, Protocol};
use xpanel_db_memory::InMemoryStorage;
use xpanel_provision::config::AppConfig;
use xpanel_provision::{
    Job, JobId, JobStore, Provisioner, ProvisionerBuilder, ReconcileError, Reconciler,
};
use xpanel_storage::{ClientFilter, PanelStorage, StorageError};

/// In-memory storage whose writes can be made to fail on demand.
#[derive(Default)]
pub struct FlakyStorage {
    pub inner: InMemoryStorage,
    fail_inserts: AtomicBool,
    fail_settings_writes: AtomicBool,
    fail_deletes: AtomicBool,
    insert_delay_ms: AtomicU64,
}

impl FlakyStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_inserts(&self, on: bool) {
        self.fail_inserts.store(on, Ordering::SeqCst);
    }

    pub fn fail_settings_writes(&self, on: bool) {
        self.fail_settings_writes.store(on, Ordering::SeqCst);
    }

    pub fn fail_deletes(&self, on: bool) {
        self.fail_deletes.store(on, Ordering::SeqCst);
    }

    /// Makes every insert take at least `delay`.
    pub fn slow_inserts(&self, delay: Duration) {
        self.insert_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn add_inbound(&self, protocol: Protocol) -> InboundId {
        self.inner.insert_inbound(protocol, 443, "test", r#"{"clients":[]}"#).id
    }

    fn injected(flag: &AtomicBool, what: &str) -> Result<(), StorageError> {
        if flag.load(Ordering::SeqCst) {
            return Err(StorageError::backend(format!("injected {what} failure")));
        }
        Ok(())
    }
}

#[async_trait]
impl PanelStorage for FlakyStorage {
    async fn inbound(&self, id: InboundId) -> Result<Option<InboundRecord>, StorageError> {
        self.inner.inbound(id).await
    }

    async fn inbounds(&self) -> Result<Vec<InboundRecord>, StorageError> {
        self.inner.inbounds().await
    }

    async fn write_settings(&self, id: InboundId, settings: &str) -> Result<(), StorageError> {
        Self::injected(&self.fail_settings_writes, "settings write")?;
        self.inner.write_settings(id, settings).await
    }

    async fn insert_client(&self, client: &NewClient) -> Result<ClientRecord, StorageError> {
        Self::injected(&self.fail_inserts, "insert")?;
        let delay = self.insert_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        self.inner.insert_client(client).await
    }

    async fn client(&self, id: ClientId) -> Result<Option<ClientRecord>, StorageError> {
        self.inner.client(id).await
    }

    async fn update_client(&self, client: &ClientRecord) -> Result<(), StorageError> {
        self.inner.update_client(client).await
    }

    async fn delete_client(&self, id: ClientId) -> Result<Option<ClientRecord>, StorageError> {
        Self::injected(&self.fail_deletes, "delete")?;
        self.inner.delete_client(id).await
    }

    async fn clients(&self, filter: &ClientFilter) -> Result<Vec<ClientRecord>, StorageError> {
        self.inner.clients(filter).await
    }
}

/// Reconciler that always fails.
pub struct FailingReconciler;

#[async_trait]
impl Reconciler for FailingReconciler {
    async fn reconcile(&self) -> Result<(), ReconcileError> {
        Err(ReconcileError::Failed {
            command: "x-ui migrate".into(),
            message: "exit status: 1".into(),
        })
    }
}

pub struct Harness {
    pub storage: Arc<FlakyStorage>,
    pub app: Provisioner,
}

pub fn test_config(batch_size: usize, batch_pause_ms: u64) -> AppConfig {
    let mut cfg = AppConfig::default();
    cfg.jobs.batch_size = batch_size;
    cfg.jobs.batch_pause_ms = batch_pause_ms;
    cfg
}

pub async fn harness(cfg: AppConfig) -> Harness {
    harness_with(cfg, Arc::new(xpanel_provision::NoopReconciler)).await
}

pub async fn harness_with(cfg: AppConfig, reconciler: Arc<dyn Reconciler>) -> Harness {
    let storage = Arc::new(FlakyStorage::new());
    let app = ProvisionerBuilder::new()
        .with_config(cfg)
        .with_storage(storage.clone())
        .with_reconciler(reconciler)
        .with_job_store(Arc::new(JobStore::in_memory()))
        .build()
        .await
        .expect("provisioner");
    Harness { storage, app }
}

impl Harness {
    pub async fn wait(&self, id: JobId) -> Job {
        tokio::time::timeout(
            Duration::from_secs(60),
            self.app.runner().wait(id, Duration::from_millis(5)),
        )
        .await
        .expect("job did not finish in time")
        .expect("job exists")
    }

    pub async fn rows(&self, inbound_id: InboundId) -> Vec<ClientRecord> {
        self.storage
            .clients(&ClientFilter::new().inbound(inbound_id))
            .await
            .unwrap()
    }

    pub async fn documents(&self, inbound_id: InboundId) -> Vec<Value> {
        let inbound = self
            .storage
            .inbound(inbound_id)
            .await
            .unwrap()
            .unwrap();
        inbound.parse_settings().unwrap().clients().to_vec()
    }

    pub async fn document(&self, inbound_id: InboundId, email: &str) -> Option<Value> {
        self.documents(inbound_id)
            .await
            .into_iter()
            .find(|doc| doc["email"] == email)
    }
}
