//! Applying many single-client operations with one reconciliation per batch.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use xpanel_core::{ClientId, ClientRecord, InboundId, ProtocolParams};

use crate::consistency::{ConsistencyEngine, SyncOutcome};
use crate::error::ProvisionResult;
use crate::reconcile::Reconciler;

/// Most error messages kept for one batch or job; older ones are dropped first.
pub const MAX_ERRORS: usize = 50;

/// Appends `message`, evicting the oldest entries beyond [`MAX_ERRORS`].
pub fn push_capped(errors: &mut Vec<String>, message: String) {
    errors.push(message);
    if errors.len() > MAX_ERRORS {
        let excess = errors.len() - MAX_ERRORS;
        errors.drain(..excess);
    }
}

/// Email for the client at `local_index` of a chunk starting at `start_index`.
///
/// Numbers are 1-based and zero-padded to four digits; wider numbers keep all
/// their digits.
pub fn client_email(prefix: &str, start_index: usize, local_index: usize) -> String {
    format!("{prefix}_{:04}", start_index + local_index + 1)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ClientOp {
    Create {
        inbound_id: InboundId,
        email: String,
        #[serde(default)]
        total: i64,
        #[serde(default)]
        expiry_time: i64,
        #[serde(default)]
        params: ProtocolParams,
    },
    Delete {
        client_id: ClientId,
    },
    SetEnabled {
        client_id: ClientId,
        enable: bool,
    },
    SetQuota {
        client_id: ClientId,
        total: i64,
    },
    SetExpiry {
        client_id: ClientId,
        expiry_time: i64,
    },
    AddQuota {
        client_id: ClientId,
        delta: i64,
    },
    ExtendExpiry {
        client_id: ClientId,
        days: i64,
    },
    ResetTraffic {
        client_id: ClientId,
        total: i64,
    },
}

impl ClientOp {
    /// Short label used in error messages.
    pub fn subject(&self) -> String {
        match self {
            Self::Create { email, .. } => email.clone(),
            Self::Delete { client_id }
            | Self::SetEnabled { client_id, .. }
            | Self::SetQuota { client_id, .. }
            | Self::SetExpiry { client_id, .. }
            | Self::AddQuota { client_id, .. }
            | Self::ExtendExpiry { client_id, .. }
            | Self::ResetTraffic { client_id, .. } => format!("client {client_id}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ItemOutcome {
    Created { record: ClientRecord },
    Deleted { record: ClientRecord },
    Updated { client_id: ClientId, sync: SyncOutcome },
}

impl ItemOutcome {
    pub fn is_warning(&self) -> bool {
        matches!(
            self,
            Self::Updated {
                sync: SyncOutcome::MissingDocument,
                ..
            }
        )
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ReconcileOutcome {
    /// Not requested, or nothing changed.
    #[default]
    Skipped,
    Succeeded,
    Failed { message: String },
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BatchResult {
    pub succeeded: usize,
    pub failed: usize,
    pub warnings: usize,
    pub outcomes: Vec<ItemOutcome>,
    /// Latest error messages, at most [`MAX_ERRORS`].
    pub errors: Vec<String>,
    pub reconcile: ReconcileOutcome,
}

impl BatchResult {
    pub fn changed(&self) -> bool {
        self.succeeded > 0
    }
}

pub struct BatchMutator {
    engine: Arc<ConsistencyEngine>,
    reconciler: Arc<dyn Reconciler>,
}

impl BatchMutator {
    pub fn new(engine: Arc<ConsistencyEngine>, reconciler: Arc<dyn Reconciler>) -> Self {
        Self { engine, reconciler }
    }

    pub fn engine(&self) -> &Arc<ConsistencyEngine> {
        &self.engine
    }

    /// Applies one operation through the consistency engine.
    pub async fn apply(&self, op: &ClientOp) -> ProvisionResult<ItemOutcome> {
        let engine = &self.engine;
        let updated = |client_id: ClientId, sync: SyncOutcome| ItemOutcome::Updated { client_id, sync };
        Ok(match op {
            ClientOp::Create {
                inbound_id,
                email,
                total,
                expiry_time,
                params,
            } => ItemOutcome::Created {
                record: engine
                    .create_client(*inbound_id, email, *total, *expiry_time, params)
                    .await?,
            },
            ClientOp::Delete { client_id } => ItemOutcome::Deleted {
                record: engine.delete_client(*client_id).await?,
            },
            ClientOp::SetEnabled { client_id, enable } => {
                updated(*client_id, engine.set_enabled(*client_id, *enable).await?)
            }
            ClientOp::SetQuota { client_id, total } => {
                updated(*client_id, engine.set_quota(*client_id, *total).await?)
            }
            ClientOp::SetExpiry {
                client_id,
                expiry_time,
            } => updated(*client_id, engine.set_expiry(*client_id, *expiry_time).await?),
            ClientOp::AddQuota { client_id, delta } => {
                updated(*client_id, engine.add_quota(*client_id, *delta).await?)
            }
            ClientOp::ExtendExpiry { client_id, days } => {
                updated(*client_id, engine.extend_expiry(*client_id, *days).await?)
            }
            ClientOp::ResetTraffic { client_id, total } => {
                updated(*client_id, engine.reset_traffic(*client_id, *total).await?)
            }
        })
    }

    /// Runs the reconciler once.
    pub async fn reconcile(&self) -> ProvisionResult<()> {
        Ok(self.reconciler.reconcile().await?)
    }

    /// Applies every operation in order, collecting per-item failures, then
    /// reconciles once if asked to and anything changed.
    pub async fn apply_batch(&self, ops: &[ClientOp], reconcile_after: bool) -> BatchResult {
        let mut result = BatchResult::default();
        for op in ops {
            match self.apply(op).await {
                Ok(outcome) => {
                    result.succeeded += 1;
                    if outcome.is_warning() {
                        result.warnings += 1;
                    }
                    result.outcomes.push(outcome);
                }
                Err(e) => {
                    result.failed += 1;
                    push_capped(&mut result.errors, format!("{}: {e}", op.subject()));
                }
            }
        }

        if reconcile_after && result.changed() {
            result.reconcile = match self.reconcile().await {
                Ok(()) => ReconcileOutcome::Succeeded,
                Err(e) => {
                    warn!(error = %e, "Batch applied but reconciliation failed");
                    ReconcileOutcome::Failed {
                        message: e.to_string(),
                    }
                }
            };
        }

        info!(
            succeeded = result.succeeded,
            failed = result.failed,
            warnings = result.warnings,
            "Batch applied"
        );
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reconcile::{NoopReconciler, SerializedReconciler};
    use xpanel_core::{Protocol, SecretDefaults};
    use xpanel_db_memory::InMemoryStorage;

    fn mutator() -> (Arc<InMemoryStorage>, Arc<SerializedReconciler>, BatchMutator) {
        let storage = Arc::new(InMemoryStorage::new());
        let engine = Arc::new(ConsistencyEngine::new(
            storage.clone(),
            SecretDefaults::default(),
        ));
        let reconciler = Arc::new(SerializedReconciler::new(Arc::new(NoopReconciler)));
        let mutator = BatchMutator::new(engine, reconciler.clone());
        (storage, reconciler, mutator)
    }

    fn create(inbound_id: InboundId, email: &str) -> ClientOp {
        ClientOp::Create {
            inbound_id,
            email: email.into(),
            total: 0,
            expiry_time: 0,
            params: ProtocolParams::default(),
        }
    }

    #[test]
    fn test_client_email_numbering() {
        assert_eq!(client_email("user", 0, 0), "user_0001");
        assert_eq!(client_email("user", 100, 4), "user_0105");
        assert_eq!(client_email("vip", 9999, 0), "vip_10000");
    }

    #[test]
    fn test_push_capped_keeps_latest() {
        let mut errors = Vec::new();
        for n in 0..120 {
            push_capped(&mut errors, format!("e{n}"));
        }
        assert_eq!(errors.len(), MAX_ERRORS);
        assert_eq!(errors.first().map(String::as_str), Some("e70"));
        assert_eq!(errors.last().map(String::as_str), Some("e119"));
    }

    #[tokio::test]
    async fn test_batch_continues_after_failures_and_reconciles_once() {
        let (storage, reconciler, mutator) = mutator();
        let inbound = storage.insert_inbound(Protocol::Vless, 443, "v", "{}");

        let ops = vec![
            create(inbound.id, "a"),
            create(inbound.id, "a"),
            create(999, "b"),
            create(inbound.id, "c"),
            ClientOp::SetEnabled {
                client_id: 12345,
                enable: false,
            },
        ];
        let result = mutator.apply_batch(&ops, true).await;
        assert_eq!(result.succeeded, 2);
        assert_eq!(result.failed, 3);
        assert_eq!(result.errors.len(), 3);
        assert_eq!(result.reconcile, ReconcileOutcome::Succeeded);
        assert_eq!(reconciler.calls(), 1);
    }

    #[tokio::test]
    async fn test_unchanged_batch_skips_reconcile() {
        let (_storage, reconciler, mutator) = mutator();
        let result = mutator
            .apply_batch(&[ClientOp::Delete { client_id: 1 }], true)
            .await;
        assert_eq!(result.failed, 1);
        assert_eq!(result.reconcile, ReconcileOutcome::Skipped);
        assert_eq!(reconciler.calls(), 0);
    }

    #[tokio::test]
    async fn test_update_ops_report_missing_document_as_warning() {
        let (storage, _reconciler, mutator) = mutator();
        let inbound = storage.insert_inbound(Protocol::Trojan, 443, "t", "{}");
        let created = mutator.apply(&create(inbound.id, "x")).await.unwrap();
        let ItemOutcome::Created { record } = created else {
            panic!("expected a created outcome");
        };
        use xpanel_storage::PanelStorage;
        storage.write_settings(inbound.id, "{}").await.unwrap();

        let result = mutator
            .apply_batch(
                &[
                    ClientOp::AddQuota {
                        client_id: record.id,
                        delta: 10,
                    },
                    ClientOp::ExtendExpiry {
                        client_id: record.id,
                        days: 1,
                    },
                ],
                false,
            )
            .await;
        assert_eq!(result.succeeded, 2);
        assert_eq!(result.warnings, 2);
        assert_eq!(result.reconcile, ReconcileOutcome::Skipped);
    }

    #[test]
    fn test_client_op_json_shape() {
        let op: ClientOp =
            serde_json::from_str(r#"{"op":"set_quota","client_id":3,"total":100}"#).unwrap();
        assert_eq!(
            op,
            ClientOp::SetQuota {
                client_id: 3,
                total: 100
            }
        );
    }
}
