//! Single-client operations that keep the relational row and the embedded
//! document of an inbound in agreement.
//!
//! Every read-modify-write of an inbound's `settings` blob runs under a per-inbound
//! async mutex, so two jobs targeting the same inbound cannot lose each other's
//! appends. None of these operations notifies the live proxy engine; that is the
//! batch layer's job.

use std::sync::Arc;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, error, warn};
use xpanel_core::settings::new_client_document;
use xpanel_core::{
    ClientId, ClientRecord, DAY_MS, InboundId, InboundRecord, InboundSettings, NewClient,
    ProtocolParams, SecretDefaults, now_millis,
};
use xpanel_storage::{ClientFilter, DynStorage};

use crate::error::{ProvisionError, ProvisionResult};

/// How the embedded side of an update went.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncOutcome {
    /// The embedded document was found and rewritten.
    Synced,
    /// The row was updated but no embedded document matched it.
    MissingDocument,
}

pub struct ConsistencyEngine {
    storage: DynStorage,
    defaults: SecretDefaults,
    locks: DashMap<InboundId, Arc<Mutex<()>>>,
}

impl ConsistencyEngine {
    pub fn new(storage: DynStorage, defaults: SecretDefaults) -> Self {
        Self {
            storage,
            defaults,
            locks: DashMap::new(),
        }
    }

    pub fn storage(&self) -> &DynStorage {
        &self.storage
    }

    pub fn secret_defaults(&self) -> &SecretDefaults {
        &self.defaults
    }

    /// Acquires the settings lock of one inbound.
    pub(crate) async fn lock_inbound(&self, inbound_id: InboundId) -> OwnedMutexGuard<()> {
        let lock = self
            .locks
            .entry(inbound_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        lock.lock_owned().await
    }

    /// Creates a client in both stores.
    ///
    /// If the embedded write fails the relational row is removed again; when that
    /// removal also fails the error is `OrphanedRecord`.
    pub async fn create_client(
        &self,
        inbound_id: InboundId,
        email: &str,
        total: i64,
        expiry_time: i64,
        params: &ProtocolParams,
    ) -> ProvisionResult<ClientRecord> {
        let new = NewClient::new(inbound_id, email, total, expiry_time)?;
        let _guard = self.lock_inbound(inbound_id).await;

        let inbound = self.require_inbound(inbound_id).await?;
        let mut settings = inbound.parse_settings()?;

        let duplicate = settings.contains_email(&new.email)
            || !self
                .storage
                .clients(&ClientFilter::new().inbound(inbound_id).email(&new.email))
                .await?
                .is_empty();
        if duplicate {
            return Err(duplicate_email(inbound_id, &new.email));
        }

        let record = match self.storage.insert_client(&new).await {
            Ok(record) => record,
            Err(e) if e.is_already_exists() => return Err(duplicate_email(inbound_id, &new.email)),
            Err(e) => return Err(e.into()),
        };

        let document = new_client_document(&record, &inbound.protocol, params, &self.defaults);
        settings.push_client(document);

        if let Err(cause) = self.write_settings(inbound_id, &settings).await {
            warn!(
                client_id = record.id,
                inbound_id,
                email = %record.email,
                error = %cause,
                "Embedded write failed, removing relational row"
            );
            return match self.storage.delete_client(record.id).await {
                Ok(_) => Err(cause),
                Err(compensation) => {
                    error!(
                        client_id = record.id,
                        inbound_id,
                        email = %record.email,
                        error = %compensation,
                        "Compensation failed, relational row left without document"
                    );
                    Err(ProvisionError::OrphanedRecord {
                        client_id: record.id,
                        inbound_id,
                        email: record.email,
                        cause: format!("{cause}; compensation failed: {compensation}"),
                    })
                }
            };
        }

        debug!(
            client_id = record.id,
            inbound_id,
            email = %record.email,
            protocol = %inbound.protocol,
            "Client created"
        );
        Ok(record)
    }

    /// Deletes the relational row and every embedded document matching it by
    /// email or by identifier.
    ///
    /// The embedded side goes first, so an unreadable or unwritable `settings`
    /// blob leaves both stores untouched. If the row cannot be removed after its
    /// documents are gone the error is `OrphanedRecord`.
    pub async fn delete_client(&self, client_id: ClientId) -> ProvisionResult<ClientRecord> {
        let record = self.require_client(client_id).await?;
        let _guard = self.lock_inbound(record.inbound_id).await;

        match self.storage.inbound(record.inbound_id).await? {
            Some(inbound) => {
                let mut settings = inbound.parse_settings()?;
                let removed = settings.remove_client(&record.email, record.id);
                if removed > 0 {
                    self.write_settings(record.inbound_id, &settings).await?;
                } else {
                    warn!(
                        client_id,
                        inbound_id = record.inbound_id,
                        email = %record.email,
                        "No embedded document to remove"
                    );
                }
            }
            None => warn!(
                client_id,
                inbound_id = record.inbound_id,
                "Inbound of client no longer exists"
            ),
        }

        let record = match self.storage.delete_client(client_id).await {
            Ok(Some(record)) => record,
            Ok(None) => return Err(ProvisionError::NotFound(client_id)),
            Err(cause) => {
                error!(
                    client_id,
                    inbound_id = record.inbound_id,
                    email = %record.email,
                    error = %cause,
                    "Embedded documents removed but relational row remains"
                );
                return Err(ProvisionError::OrphanedRecord {
                    client_id,
                    inbound_id: record.inbound_id,
                    email: record.email,
                    cause: format!("row delete failed: {cause}"),
                });
            }
        };

        debug!(client_id, email = %record.email, "Client deleted");
        Ok(record)
    }

    pub async fn set_enabled(&self, client_id: ClientId, enable: bool) -> ProvisionResult<SyncOutcome> {
        self.mutate(client_id, |record| record.enable = enable).await
    }

    pub async fn set_quota(&self, client_id: ClientId, total: i64) -> ProvisionResult<SyncOutcome> {
        self.mutate(client_id, |record| record.total = total.max(0))
            .await
    }

    pub async fn set_expiry(&self, client_id: ClientId, expiry_time: i64) -> ProvisionResult<SyncOutcome> {
        self.mutate(client_id, |record| record.expiry_time = expiry_time.max(0))
            .await
    }

    /// Adds `delta` bytes to the quota; the result never drops below zero.
    pub async fn add_quota(&self, client_id: ClientId, delta: i64) -> ProvisionResult<SyncOutcome> {
        self.mutate(client_id, |record| {
            record.total = record.total.saturating_add(delta).max(0);
        })
        .await
    }

    /// Pushes expiry forward by `days`, counting from now when the client has no
    /// expiry or has already expired.
    pub async fn extend_expiry(&self, client_id: ClientId, days: i64) -> ProvisionResult<SyncOutcome> {
        let now = now_millis();
        self.mutate(client_id, |record| {
            let base = if record.expiry_time == 0 || record.expiry_time < now {
                now
            } else {
                record.expiry_time
            };
            record.expiry_time = base.saturating_add(days.saturating_mul(DAY_MS));
        })
        .await
    }

    /// Zeroes the traffic counters and sets a new quota.
    pub async fn reset_traffic(&self, client_id: ClientId, total: i64) -> ProvisionResult<SyncOutcome> {
        self.mutate(client_id, |record| {
            record.up = 0;
            record.down = 0;
            record.total = total.max(0);
        })
        .await
    }

    pub async fn select_clients(&self, filter: &ClientFilter) -> ProvisionResult<Vec<ClientRecord>> {
        Ok(self.storage.clients(filter).await?)
    }

    async fn mutate<F>(&self, client_id: ClientId, apply: F) -> ProvisionResult<SyncOutcome>
    where
        F: FnOnce(&mut ClientRecord),
    {
        let inbound_id = self.require_client(client_id).await?.inbound_id;
        let _guard = self.lock_inbound(inbound_id).await;

        // Re-read under the lock so concurrent updates of the same row compose.
        let mut record = self.require_client(client_id).await?;
        apply(&mut record);
        self.storage.update_client(&record).await?;

        let outcome = self.mirror(&record).await?;
        if outcome == SyncOutcome::MissingDocument {
            warn!(
                client_id,
                inbound_id,
                email = %record.email,
                "Embedded document not found, only the relational row was updated"
            );
        }
        Ok(outcome)
    }

    /// Rewrites the mirrored fields of the record's embedded document. Caller holds
    /// the inbound lock.
    pub(crate) async fn mirror(&self, record: &ClientRecord) -> ProvisionResult<SyncOutcome> {
        let Some(inbound) = self.storage.inbound(record.inbound_id).await? else {
            return Ok(SyncOutcome::MissingDocument);
        };
        let mut settings = inbound.parse_settings()?;
        let Some(index) = settings.position(&record.email, record.id) else {
            return Ok(SyncOutcome::MissingDocument);
        };
        if !settings.mirror_at(index, record, now_millis()) {
            return Ok(SyncOutcome::MissingDocument);
        }
        self.write_settings(record.inbound_id, &settings).await?;
        Ok(SyncOutcome::Synced)
    }

    pub(crate) async fn write_settings(
        &self,
        inbound_id: InboundId,
        settings: &InboundSettings,
    ) -> ProvisionResult<()> {
        let raw = settings.to_json_string()?;
        self.storage.write_settings(inbound_id, &raw).await?;
        Ok(())
    }

    pub(crate) async fn require_inbound(&self, inbound_id: InboundId) -> ProvisionResult<InboundRecord> {
        self.storage
            .inbound(inbound_id)
            .await?
            .ok_or(ProvisionError::TargetNotFound(inbound_id))
    }

    async fn require_client(&self, client_id: ClientId) -> ProvisionResult<ClientRecord> {
        self.storage
            .client(client_id)
            .await?
            .ok_or(ProvisionError::NotFound(client_id))
    }
}

fn duplicate_email(inbound_id: InboundId, email: &str) -> ProvisionError {
    ProvisionError::DuplicateEmail {
        inbound_id,
        email: email.to_string(),
    }
}
