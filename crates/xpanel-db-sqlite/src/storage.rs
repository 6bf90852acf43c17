use std::path::Path;
use std::sync::{Arc, Mutex};

use rusqlite::{Connection, OpenFlags};
use tracing::{debug, info};
use xpanel_storage::StorageError;

/// Optional `client_traffics` columns found in the opened database.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClientColumns {
    pub reset: bool,
    pub all_time: bool,
    pub last_online: bool,
}

impl ClientColumns {
    fn detect(conn: &Connection) -> rusqlite::Result<Self> {
        let mut stmt = conn.prepare("PRAGMA table_info(client_traffics)")?;
        let names = stmt
            .query_map([], |row| row.get::<_, String>(1))?
            .collect::<rusqlite::Result<Vec<String>>>()?;
        let has = |column: &str| names.iter().any(|name| name == column);
        Ok(Self {
            reset: has("reset"),
            all_time: has("all_time"),
            last_online: has("last_online"),
        })
    }
}

/// Panel storage backed by an x-ui `SQLite` file.
///
/// The connection is shared behind a mutex; every trait call runs its
/// statements on the blocking pool while holding it.
#[derive(Debug, Clone)]
pub struct SqliteStorage {
    conn: Arc<Mutex<Connection>>,
    columns: ClientColumns,
}

impl SqliteStorage {
    /// Opens an existing panel database. The file must already contain the
    /// panel schema.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let path = path.as_ref();
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .map_err(|e| StorageError::backend(format!("failed to open {}: {e}", path.display())))?;
        conn.busy_timeout(std::time::Duration::from_secs(5))
            .map_err(backend)?;
        let storage = Self::from_connection(conn)?;
        info!(path = %path.display(), columns = ?storage.columns, "opened panel database");
        Ok(storage)
    }

    /// Wraps an already opened connection.
    pub fn from_connection(conn: Connection) -> Result<Self, StorageError> {
        let columns = ClientColumns::detect(&conn).map_err(backend)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            columns,
        })
    }

    /// Opens a fresh in-memory database with the panel schema.
    pub fn open_in_memory() -> Result<Self, StorageError> {
        let conn = Connection::open_in_memory().map_err(backend)?;
        create_schema(&conn).map_err(backend)?;
        Self::from_connection(conn)
    }

    pub fn columns(&self) -> ClientColumns {
        self.columns
    }

    /// Inserts an inbound row and returns its id.
    pub async fn insert_inbound(
        &self,
        protocol: &str,
        port: u16,
        remark: &str,
        settings: &str,
    ) -> Result<i64, StorageError> {
        let (protocol, remark, settings) =
            (protocol.to_string(), remark.to_string(), settings.to_string());
        self.with_conn(move |conn, _| {
            conn.execute(
                "INSERT INTO inbounds (remark, enable, port, protocol, settings) VALUES (?1, 1, ?2, ?3, ?4)",
                rusqlite::params![remark, i64::from(port), protocol, settings],
            )
            .map_err(backend)?;
            Ok(conn.last_insert_rowid())
        })
        .await
    }

    /// Runs `f` on the blocking pool with the locked connection.
    pub(crate) async fn with_conn<T, F>(&self, f: F) -> Result<T, StorageError>
    where
        T: Send + 'static,
        F: FnOnce(&Connection, ClientColumns) -> Result<T, StorageError> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        let columns = self.columns;
        tokio::task::spawn_blocking(move || {
            let guard = conn
                .lock()
                .map_err(|_| StorageError::backend("connection lock poisoned"))?;
            f(&guard, columns)
        })
        .await
        .map_err(|e| StorageError::backend(format!("blocking task failed: {e}")))?
    }
}

/// Creates the subset of the x-ui schema this crate reads and writes.
pub fn create_schema(conn: &Connection) -> rusqlite::Result<()> {
    debug!("creating panel schema");
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS inbounds (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            remark TEXT NOT NULL DEFAULT '',
            enable INTEGER NOT NULL DEFAULT 1,
            port INTEGER NOT NULL,
            protocol TEXT NOT NULL,
            settings TEXT NOT NULL DEFAULT ''
        );
        CREATE TABLE IF NOT EXISTS client_traffics (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            inbound_id INTEGER NOT NULL,
            enable INTEGER NOT NULL DEFAULT 1,
            email TEXT NOT NULL,
            up INTEGER NOT NULL DEFAULT 0,
            down INTEGER NOT NULL DEFAULT 0,
            expiry_time INTEGER NOT NULL DEFAULT 0,
            total INTEGER NOT NULL DEFAULT 0,
            reset INTEGER NOT NULL DEFAULT 0,
            all_time INTEGER NOT NULL DEFAULT 0,
            last_online INTEGER NOT NULL DEFAULT 0,
            UNIQUE (inbound_id, email)
        );",
    )
}

pub(crate) fn backend(err: rusqlite::Error) -> StorageError {
    StorageError::backend(err.to_string())
}

pub(crate) fn is_unique_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _) if e.code == rusqlite::ErrorCode::ConstraintViolation
    )
}
