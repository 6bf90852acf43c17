//! SQLite panel storage backend for xpanel.
//!
//! Operates directly on the database file of an x-ui panel
//! (usually `/etc/x-ui/x-ui.db`). Only two tables are touched:
//!
//! - `inbounds`: `id`, `remark`, `enable`, `port`, `protocol`, `settings`
//! - `client_traffics`: `id`, `inbound_id`, `enable`, `email`, `up`, `down`,
//!   `expiry_time`, `total`, plus the optional `reset`, `all_time` and
//!   `last_online` columns present in newer panel versions
//!
//! Optional columns are detected once when the database is opened and are only
//! written when present.

mod panel_impl;
pub mod storage;

pub use storage::{ClientColumns, SqliteStorage, create_schema};
pub use xpanel_storage::{PanelStorage, StorageError};
