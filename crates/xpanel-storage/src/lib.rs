//! # xpanel-storage
//!
//! Storage abstraction layer for xpanel.
//!
//! This crate defines the contract every persistence backend implements. It holds
//! no implementation itself; see `xpanel-db-memory` and `xpanel-db-sqlite`.
//!
//! ## Overview
//!
//! The main trait is [`PanelStorage`], which covers:
//! - point reads of inbounds and their raw `settings` blob
//! - whole-blob rewrites of an inbound's `settings`
//! - insert/read/update/delete of relational client rows
//! - filtered client listing
//!
//! Backends give no multi-writer isolation. Callers that read-modify-write an
//! inbound's `settings` must serialize those writes themselves.
//!
//! ## Example
//!
//! ```ignore
//! use xpanel_storage::{ClientFilter, PanelStorage, StorageError};
//!
//! async fn expired(storage: &dyn PanelStorage, now_ms: i64) -> Result<usize, StorageError> {
//!     let filter = ClientFilter::new().expired_before(now_ms);
//!     Ok(storage.clients(&filter).await?.len())
//! }
//! ```

mod error;
mod traits;
mod types;

pub use error::{ErrorCategory, StorageError};
pub use traits::PanelStorage;
pub use types::ClientFilter;

/// Type alias for a storage result.
pub type StorageResult<T> = Result<T, StorageError>;

/// Type alias for a shareable storage trait object.
pub type DynStorage = std::sync::Arc<dyn PanelStorage>;
