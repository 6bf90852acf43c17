//! Error taxonomy of the provisioning engine.

use thiserror::Error;
use xpanel_core::{ClientId, CoreError, DocumentField, InboundId};
use xpanel_storage::StorageError;

use crate::jobs::JobError;
use crate::reconcile::ReconcileError;

pub type ProvisionResult<T> = Result<T, ProvisionError>;

#[derive(Debug, Error)]
pub enum ProvisionError {
    #[error("Inbound {0} not found")]
    TargetNotFound(InboundId),

    #[error("Request exceeds limits: {reason}")]
    QuotaExceeded { reason: String },

    #[error("Malformed client document {email:?} in inbound {inbound_id}: missing {missing:?}, forbidden {forbidden:?}")]
    MalformedDocument {
        inbound_id: InboundId,
        email: String,
        missing: Vec<DocumentField>,
        forbidden: Vec<DocumentField>,
    },

    #[error(transparent)]
    ReconciliationFailed(#[from] ReconcileError),

    #[error("Client {0} not found")]
    NotFound(ClientId),

    #[error("Client {email:?} already exists in inbound {inbound_id}")]
    DuplicateEmail { inbound_id: InboundId, email: String },

    /// The relational row exists without its embedded document and could not be
    /// removed. The repair job restores the document.
    #[error("Client {client_id} ({email:?}) in inbound {inbound_id} has no embedded document: {cause}")]
    OrphanedRecord {
        client_id: ClientId,
        inbound_id: InboundId,
        email: String,
        cause: String,
    },

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Core(#[from] CoreError),

    #[error(transparent)]
    Job(#[from] JobError),
}

impl ProvisionError {
    pub fn quota_exceeded(reason: impl Into<String>) -> Self {
        Self::QuotaExceeded {
            reason: reason.into(),
        }
    }

    /// True for errors caused by the request rather than the environment.
    pub fn is_client_error(&self) -> bool {
        match self {
            Self::TargetNotFound(_)
            | Self::QuotaExceeded { .. }
            | Self::NotFound(_)
            | Self::DuplicateEmail { .. } => true,
            Self::Core(e) => e.is_client_error(),
            _ => false,
        }
    }
}
