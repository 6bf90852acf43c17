//! In-memory panel storage backend for xpanel.
//!
//! This crate provides an in-memory implementation of the `PanelStorage` trait
//! from `xpanel-storage`, using papaya lock-free HashMaps for concurrent access.
//! It backs the test suites and `--dry-run` invocations of the CLI.
//!
//! # Example
//!
//! ```ignore
//! use xpanel_core::Protocol;
//! use xpanel_db_memory::InMemoryStorage;
//! use xpanel_storage::PanelStorage;
//!
//! let storage = InMemoryStorage::new();
//! let inbound = storage.insert_inbound(Protocol::Vless, 443, "main", r#"{"clients":[]}"#);
//! assert!(storage.inbound(inbound.id).await?.is_some());
//! ```

mod panel_impl;
pub mod storage;

// Re-export the PanelStorage trait for convenience
pub use xpanel_storage::{PanelStorage, StorageError};

pub use storage::InMemoryStorage;

/// Type alias for a shareable PanelStorage instance.
pub type DynPanelStorage = std::sync::Arc<dyn PanelStorage>;

/// Creates a new empty in-memory PanelStorage instance.
pub fn create_panel_storage() -> DynPanelStorage {
    std::sync::Arc::new(InMemoryStorage::new())
}
