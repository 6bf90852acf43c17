//! Implementation of the PanelStorage trait for SqliteStorage.

use std::path::Path;

use async_trait::async_trait;
use rusqlite::types::Value;
use rusqlite::{Connection, OptionalExtension, Row, params, params_from_iter};
use xpanel_core::{ClientId, ClientRecord, InboundId, InboundRecord, NewClient, Protocol};
use xpanel_storage::{ClientFilter, PanelStorage, StorageError};

use crate::storage::{ClientColumns, SqliteStorage, backend, is_unique_violation};

const INBOUNDS: &str = "inbounds";
const CLIENTS: &str = "client_traffics";

const INBOUND_COLUMNS: &str = "id, protocol, port, remark, enable, settings";

fn client_select(columns: ClientColumns) -> String {
    let reset = if columns.reset { "reset" } else { "0" };
    format!(
        "SELECT id, inbound_id, email, enable, up, down, total, expiry_time, {reset} FROM client_traffics"
    )
}

fn row_to_client(row: &Row<'_>) -> rusqlite::Result<ClientRecord> {
    Ok(ClientRecord {
        id: row.get(0)?,
        inbound_id: row.get(1)?,
        email: row.get(2)?,
        enable: row.get(3)?,
        up: row.get(4)?,
        down: row.get(5)?,
        total: row.get(6)?,
        expiry_time: row.get(7)?,
        reset: row.get(8)?,
    })
}

fn row_to_inbound(row: &Row<'_>) -> rusqlite::Result<(InboundId, String, i64, String, bool, Option<String>)> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
    ))
}

fn build_inbound(
    raw: (InboundId, String, i64, String, bool, Option<String>),
) -> Result<InboundRecord, StorageError> {
    let (id, protocol, port, remark, enable, settings) = raw;
    let port = u16::try_from(port)
        .map_err(|_| StorageError::invalid_data(format!("inbound {id} has invalid port {port}")))?;
    Ok(InboundRecord {
        id,
        protocol: Protocol::from(protocol.as_str()),
        port,
        remark,
        enable,
        settings: settings.unwrap_or_default(),
    })
}

fn read_client(conn: &Connection, columns: ClientColumns, id: ClientId) -> Result<Option<ClientRecord>, StorageError> {
    conn.query_row(
        &format!("{} WHERE id = ?1", client_select(columns)),
        params![id],
        row_to_client,
    )
    .optional()
    .map_err(backend)
}

#[async_trait]
impl PanelStorage for SqliteStorage {
    async fn inbound(&self, id: InboundId) -> Result<Option<InboundRecord>, StorageError> {
        self.with_conn(move |conn, _| {
            let raw = conn
                .query_row(
                    &format!("SELECT {INBOUND_COLUMNS} FROM inbounds WHERE id = ?1"),
                    params![id],
                    row_to_inbound,
                )
                .optional()
                .map_err(backend)?;
            raw.map(build_inbound).transpose()
        })
        .await
    }

    async fn inbounds(&self) -> Result<Vec<InboundRecord>, StorageError> {
        self.with_conn(|conn, _| {
            let mut stmt = conn
                .prepare(&format!("SELECT {INBOUND_COLUMNS} FROM inbounds ORDER BY id"))
                .map_err(backend)?;
            let rows = stmt
                .query_map([], row_to_inbound)
                .map_err(backend)?
                .collect::<rusqlite::Result<Vec<_>>>()
                .map_err(backend)?;
            rows.into_iter().map(build_inbound).collect()
        })
        .await
    }

    async fn write_settings(&self, id: InboundId, settings: &str) -> Result<(), StorageError> {
        let settings = settings.to_string();
        self.with_conn(move |conn, _| {
            let changed = conn
                .execute(
                    "UPDATE inbounds SET settings = ?1 WHERE id = ?2",
                    params![settings, id],
                )
                .map_err(backend)?;
            if changed == 0 {
                return Err(StorageError::not_found(INBOUNDS, id));
            }
            Ok(())
        })
        .await
    }

    async fn insert_client(&self, client: &NewClient) -> Result<ClientRecord, StorageError> {
        let client = client.clone();
        self.with_conn(move |conn, columns| {
            let duplicate = conn
                .query_row(
                    "SELECT 1 FROM client_traffics WHERE inbound_id = ?1 AND email = ?2",
                    params![client.inbound_id, client.email],
                    |_| Ok(()),
                )
                .optional()
                .map_err(backend)?
                .is_some();
            if duplicate {
                return Err(StorageError::already_exists(CLIENTS, &client.email));
            }

            let mut names = vec!["inbound_id", "enable", "email", "up", "down", "expiry_time", "total"];
            let mut values: Vec<Value> = vec![
                Value::Integer(client.inbound_id),
                Value::Integer(i64::from(client.enable)),
                Value::Text(client.email.clone()),
                Value::Integer(0),
                Value::Integer(0),
                Value::Integer(client.expiry_time),
                Value::Integer(client.total),
            ];
            for (present, name) in [
                (columns.reset, "reset"),
                (columns.all_time, "all_time"),
                (columns.last_online, "last_online"),
            ] {
                if present {
                    names.push(name);
                    values.push(Value::Integer(0));
                }
            }
            let placeholders = vec!["?"; names.len()].join(", ");
            let sql = format!(
                "INSERT INTO client_traffics ({}) VALUES ({placeholders})",
                names.join(", ")
            );
            conn.execute(&sql, params_from_iter(values)).map_err(|e| {
                if is_unique_violation(&e) {
                    StorageError::already_exists(CLIENTS, &client.email)
                } else {
                    backend(e)
                }
            })?;

            let id = conn.last_insert_rowid();
            read_client(conn, columns, id)?.ok_or_else(|| StorageError::not_found(CLIENTS, id))
        })
        .await
    }

    async fn client(&self, id: ClientId) -> Result<Option<ClientRecord>, StorageError> {
        self.with_conn(move |conn, columns| read_client(conn, columns, id))
            .await
    }

    async fn update_client(&self, client: &ClientRecord) -> Result<(), StorageError> {
        let client = client.clone();
        self.with_conn(move |conn, columns| {
            let changed = if columns.reset {
                conn.execute(
                    "UPDATE client_traffics SET inbound_id = ?1, enable = ?2, email = ?3, up = ?4,
                     down = ?5, total = ?6, expiry_time = ?7, reset = ?8 WHERE id = ?9",
                    params![
                        client.inbound_id,
                        client.enable,
                        client.email,
                        client.up,
                        client.down,
                        client.total,
                        client.expiry_time,
                        client.reset,
                        client.id
                    ],
                )
            } else {
                conn.execute(
                    "UPDATE client_traffics SET inbound_id = ?1, enable = ?2, email = ?3, up = ?4,
                     down = ?5, total = ?6, expiry_time = ?7 WHERE id = ?8",
                    params![
                        client.inbound_id,
                        client.enable,
                        client.email,
                        client.up,
                        client.down,
                        client.total,
                        client.expiry_time,
                        client.id
                    ],
                )
            }
            .map_err(backend)?;
            if changed == 0 {
                return Err(StorageError::not_found(CLIENTS, client.id));
            }
            Ok(())
        })
        .await
    }

    async fn delete_client(&self, id: ClientId) -> Result<Option<ClientRecord>, StorageError> {
        self.with_conn(move |conn, columns| {
            let existing = read_client(conn, columns, id)?;
            if existing.is_some() {
                conn.execute("DELETE FROM client_traffics WHERE id = ?1", params![id])
                    .map_err(backend)?;
            }
            Ok(existing)
        })
        .await
    }

    async fn clients(&self, filter: &ClientFilter) -> Result<Vec<ClientRecord>, StorageError> {
        let filter = filter.clone();
        self.with_conn(move |conn, columns| {
            let mut conditions: Vec<&str> = Vec::new();
            let mut values: Vec<Value> = Vec::new();
            if let Some(inbound_id) = filter.inbound_id {
                conditions.push("inbound_id = ?");
                values.push(Value::Integer(inbound_id));
            }
            if let Some(email) = &filter.email {
                conditions.push("email = ?");
                values.push(Value::Text(email.clone()));
            }
            if let Some(now) = filter.expired_before {
                conditions.push("expiry_time > 0 AND expiry_time < ?");
                values.push(Value::Integer(now));
            }
            if filter.disabled {
                conditions.push("enable = 0");
            }
            if filter.no_traffic {
                conditions.push("up + down = 0");
            }

            let mut sql = client_select(columns);
            if !conditions.is_empty() {
                sql.push_str(" WHERE ");
                sql.push_str(&conditions.join(" AND "));
            }
            sql.push_str(" ORDER BY id");

            let mut stmt = conn.prepare(&sql).map_err(backend)?;
            stmt.query_map(params_from_iter(values), row_to_client)
                .map_err(backend)?
                .collect::<rusqlite::Result<Vec<_>>>()
                .map_err(backend)
        })
        .await
    }

    async fn backup(&self, path: &Path) -> Result<bool, StorageError> {
        if path.exists() {
            return Err(StorageError::already_exists("backup", path.display()));
        }
        let target = path.to_string_lossy().into_owned();
        self.with_conn(move |conn, _| {
            conn.execute("VACUUM INTO ?1", params![target])
                .map_err(backend)?;
            Ok(true)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::create_schema;

    async fn storage_with_inbound() -> (SqliteStorage, InboundId) {
        let storage = SqliteStorage::open_in_memory().unwrap();
        let id = storage
            .insert_inbound("vless", 443, "main", r#"{"clients":[]}"#)
            .await
            .unwrap();
        (storage, id)
    }

    #[tokio::test]
    async fn test_reads_inbound() {
        let (storage, id) = storage_with_inbound().await;
        let inbound = storage.inbound(id).await.unwrap().unwrap();
        assert_eq!(inbound.protocol, Protocol::Vless);
        assert_eq!(inbound.port, 443);
        assert!(storage.inbound(id + 1).await.unwrap().is_none());
        assert_eq!(storage.inbounds().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_insert_update_delete_client() {
        let (storage, id) = storage_with_inbound().await;
        let mut created = storage
            .insert_client(&NewClient::new(id, "user_0001", 100, 5).unwrap())
            .await
            .unwrap();
        assert_eq!(created.total, 100);
        assert_eq!(created.expiry_time, 5);
        assert!(created.enable);

        let dup = storage
            .insert_client(&NewClient::new(id, "user_0001", 0, 0).unwrap())
            .await
            .unwrap_err();
        assert!(dup.is_already_exists());

        // The same email may live in another inbound
        let other = storage.insert_inbound("vless", 8443, "other", "{}").await.unwrap();
        storage
            .insert_client(&NewClient::new(other, "user_0001", 0, 0).unwrap())
            .await
            .unwrap();

        created.enable = false;
        created.reset = 30;
        storage.update_client(&created).await.unwrap();
        let read = storage.client(created.id).await.unwrap().unwrap();
        assert_eq!(read, created);

        let removed = storage.delete_client(created.id).await.unwrap();
        assert!(removed.is_some());
        assert!(storage.client(created.id).await.unwrap().is_none());
        assert!(storage.update_client(&created).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_filters_translate_to_sql() {
        let (storage, id) = storage_with_inbound().await;
        for (email, expiry) in [("a", 10), ("b", 0), ("c", 500)] {
            storage
                .insert_client(&NewClient::new(id, email, 0, expiry).unwrap())
                .await
                .unwrap();
        }
        let expired = storage
            .clients(&ClientFilter::new().inbound(id).expired_before(100))
            .await
            .unwrap();
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].email, "a");

        let all = storage.clients(&ClientFilter::new().no_traffic()).await.unwrap();
        assert_eq!(
            all.iter().map(|c| c.email.as_str()).collect::<Vec<_>>(),
            vec!["a", "b", "c"]
        );
    }

    #[tokio::test]
    async fn test_write_settings_missing_inbound() {
        let (storage, id) = storage_with_inbound().await;
        storage.write_settings(id, "{}").await.unwrap();
        assert!(storage.write_settings(id + 10, "{}").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_legacy_schema_without_optional_columns() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE inbounds (id INTEGER PRIMARY KEY AUTOINCREMENT, remark TEXT, enable INTEGER,
                port INTEGER, protocol TEXT, settings TEXT);
             CREATE TABLE client_traffics (id INTEGER PRIMARY KEY AUTOINCREMENT, inbound_id INTEGER,
                enable INTEGER, email TEXT UNIQUE, up INTEGER, down INTEGER, expiry_time INTEGER,
                total INTEGER);",
        )
        .unwrap();
        let storage = SqliteStorage::from_connection(conn).unwrap();
        assert_eq!(storage.columns(), ClientColumns::default());

        let id = storage.insert_inbound("trojan", 443, "t", "{}").await.unwrap();
        let created = storage
            .insert_client(&NewClient::new(id, "legacy", 0, 0).unwrap())
            .await
            .unwrap();
        assert_eq!(created.reset, 0);
    }

    #[tokio::test]
    async fn test_backup_copies_database() {
        let (storage, id) = storage_with_inbound().await;
        storage
            .insert_client(&NewClient::new(id, "kept", 0, 0).unwrap())
            .await
            .unwrap();

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("copy.db");
        assert!(storage.backup(&path).await.unwrap());
        assert!(storage.backup(&path).await.is_err());

        let copy = SqliteStorage::open(&path).unwrap();
        let clients = copy.clients(&ClientFilter::new()).await.unwrap();
        assert_eq!(clients.len(), 1);
        assert_eq!(clients[0].email, "kept");
    }

    #[tokio::test]
    async fn test_open_file_database() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("x-ui.db");
        {
            let conn = Connection::open(&path).unwrap();
            create_schema(&conn).unwrap();
        }
        let storage = SqliteStorage::open(&path).unwrap();
        assert!(storage.columns().reset);
        assert!(storage.inbounds().await.unwrap().is_empty());
    }
}
