//! Storage traits for the panel storage abstraction layer.

use std::path::Path;

use async_trait::async_trait;
use xpanel_core::{ClientId, ClientRecord, InboundId, InboundRecord, NewClient};

use crate::error::StorageError;
use crate::types::ClientFilter;

/// The persistence contract every backend implements.
///
/// Operations are point reads and writes with no isolation across calls.
/// Implementations must be thread-safe (`Send + Sync`).
///
/// # Example
///
/// ```ignore
/// use xpanel_storage::{PanelStorage, StorageError};
///
/// async fn protocol_of(storage: &dyn PanelStorage, id: i64) -> Result<String, StorageError> {
///     storage
///         .inbound(id)
///         .await?
///         .map(|inbound| inbound.protocol.to_string())
///         .ok_or_else(|| StorageError::not_found("inbounds", id))
/// }
/// ```
#[async_trait]
pub trait PanelStorage: Send + Sync {
    // ==================== Inbounds ====================

    /// Reads one inbound, `None` when it does not exist.
    async fn inbound(&self, id: InboundId) -> Result<Option<InboundRecord>, StorageError>;

    /// Lists every inbound ordered by id.
    async fn inbounds(&self) -> Result<Vec<InboundRecord>, StorageError>;

    /// Replaces the raw `settings` blob of an inbound.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::NotFound` if the inbound does not exist.
    async fn write_settings(&self, id: InboundId, settings: &str) -> Result<(), StorageError>;

    // ==================== Client rows ====================

    /// Inserts a relational client row with zeroed traffic counters and returns it
    /// with its assigned id.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::AlreadyExists` if the backend rejects the email as a
    /// duplicate.
    async fn insert_client(&self, client: &NewClient) -> Result<ClientRecord, StorageError>;

    /// Reads one client row, `None` when it does not exist.
    async fn client(&self, id: ClientId) -> Result<Option<ClientRecord>, StorageError>;

    /// Overwrites every column of an existing client row.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::NotFound` if the row does not exist.
    async fn update_client(&self, client: &ClientRecord) -> Result<(), StorageError>;

    /// Deletes a client row, returning it, or `None` if it was already gone.
    async fn delete_client(&self, id: ClientId) -> Result<Option<ClientRecord>, StorageError>;

    /// Lists client rows matching the filter, ordered by id.
    async fn clients(&self, filter: &ClientFilter) -> Result<Vec<ClientRecord>, StorageError>;

    // ==================== Maintenance ====================

    /// Writes a consistent copy of the whole database to `path`.
    ///
    /// Returns `false` for backends with nothing durable to copy.
    async fn backup(&self, _path: &Path) -> Result<bool, StorageError> {
        Ok(false)
    }
}
