//! Implementation of the PanelStorage trait for InMemoryStorage.

use async_trait::async_trait;
use xpanel_core::{ClientId, ClientRecord, InboundId, InboundRecord, NewClient};
use xpanel_storage::{ClientFilter, PanelStorage, StorageError};

use crate::storage::InMemoryStorage;

const INBOUNDS: &str = "inbounds";
const CLIENTS: &str = "client_traffics";

#[async_trait]
impl PanelStorage for InMemoryStorage {
    async fn inbound(&self, id: InboundId) -> Result<Option<InboundRecord>, StorageError> {
        Ok(self.inbounds.pin().get(&id).cloned())
    }

    async fn inbounds(&self) -> Result<Vec<InboundRecord>, StorageError> {
        let mut all: Vec<InboundRecord> = self
            .inbounds
            .pin()
            .iter()
            .map(|(_, inbound)| inbound.clone())
            .collect();
        all.sort_by_key(|inbound| inbound.id);
        Ok(all)
    }

    async fn write_settings(&self, id: InboundId, settings: &str) -> Result<(), StorageError> {
        let guard = self.inbounds.pin();
        let mut inbound = guard
            .get(&id)
            .cloned()
            .ok_or_else(|| StorageError::not_found(INBOUNDS, id))?;
        inbound.settings = settings.to_string();
        guard.insert(id, inbound);
        Ok(())
    }

    async fn insert_client(&self, client: &NewClient) -> Result<ClientRecord, StorageError> {
        let _insert = self.insert_lock.lock().await;

        // Use block scope to ensure guard is dropped before returning across awaits
        let record = {
            let guard = self.clients.pin();
            let duplicate = guard.iter().any(|(_, existing)| {
                existing.inbound_id == client.inbound_id && existing.email == client.email
            });
            if duplicate {
                return Err(StorageError::already_exists(CLIENTS, &client.email));
            }

            let record = ClientRecord {
                id: self.next_client_id(),
                inbound_id: client.inbound_id,
                email: client.email.clone(),
                enable: client.enable,
                up: 0,
                down: 0,
                total: client.total,
                expiry_time: client.expiry_time,
                reset: 0,
            };
            guard.insert(record.id, record.clone());
            record
        };
        Ok(record)
    }

    async fn client(&self, id: ClientId) -> Result<Option<ClientRecord>, StorageError> {
        Ok(self.clients.pin().get(&id).cloned())
    }

    async fn update_client(&self, client: &ClientRecord) -> Result<(), StorageError> {
        let guard = self.clients.pin();
        if guard.get(&client.id).is_none() {
            return Err(StorageError::not_found(CLIENTS, client.id));
        }
        guard.insert(client.id, client.clone());
        Ok(())
    }

    async fn delete_client(&self, id: ClientId) -> Result<Option<ClientRecord>, StorageError> {
        Ok(self.clients.pin().remove(&id).cloned())
    }

    async fn clients(&self, filter: &ClientFilter) -> Result<Vec<ClientRecord>, StorageError> {
        let mut matching: Vec<ClientRecord> = self
            .clients
            .pin()
            .iter()
            .filter(|(_, record)| filter.matches(record))
            .map(|(_, record)| record.clone())
            .collect();
        matching.sort_by_key(|record| record.id);
        Ok(matching)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use xpanel_core::Protocol;

    #[tokio::test]
    async fn test_insert_and_read_client() {
        let storage = InMemoryStorage::new();
        let inbound = storage.insert_inbound(Protocol::Trojan, 443, "main", "{}");

        let new = NewClient::new(inbound.id, "user_0001", 1024, 0).unwrap();
        let created = storage.insert_client(&new).await.unwrap();
        assert_eq!(created.email, "user_0001");
        assert_eq!(created.up, 0);

        let read = storage.client(created.id).await.unwrap().unwrap();
        assert_eq!(read, created);
    }

    #[tokio::test]
    async fn test_duplicate_email_is_scoped_to_inbound() {
        let storage = InMemoryStorage::new();
        let a = storage.insert_inbound(Protocol::Vless, 443, "a", "{}");
        let b = storage.insert_inbound(Protocol::Vless, 8443, "b", "{}");

        storage
            .insert_client(&NewClient::new(a.id, "same", 0, 0).unwrap())
            .await
            .unwrap();
        let err = storage
            .insert_client(&NewClient::new(a.id, "same", 0, 0).unwrap())
            .await
            .unwrap_err();
        assert!(err.is_already_exists());

        storage
            .insert_client(&NewClient::new(b.id, "same", 0, 0).unwrap())
            .await
            .unwrap();
        assert_eq!(storage.client_count(), 2);
    }

    #[tokio::test]
    async fn test_write_settings_requires_inbound() {
        let storage = InMemoryStorage::new();
        let err = storage.write_settings(99, "{}").await.unwrap_err();
        assert!(err.is_not_found());

        let inbound = storage.insert_inbound(Protocol::Vmess, 80, "ws", "{}");
        storage
            .write_settings(inbound.id, r#"{"clients":[]}"#)
            .await
            .unwrap();
        let read = storage.inbound(inbound.id).await.unwrap().unwrap();
        assert_eq!(read.settings, r#"{"clients":[]}"#);
    }

    #[tokio::test]
    async fn test_update_delete_and_filter() {
        let storage = InMemoryStorage::new();
        let inbound = storage.insert_inbound(Protocol::Shadowsocks, 8388, "ss", "{}");
        let mut record = storage
            .insert_client(&NewClient::new(inbound.id, "a", 0, 0).unwrap())
            .await
            .unwrap();
        storage
            .insert_client(&NewClient::new(inbound.id, "b", 0, 0).unwrap())
            .await
            .unwrap();

        record.enable = false;
        storage.update_client(&record).await.unwrap();
        let disabled = storage
            .clients(&ClientFilter::new().disabled())
            .await
            .unwrap();
        assert_eq!(disabled.len(), 1);
        assert_eq!(disabled[0].email, "a");

        let removed = storage.delete_client(record.id).await.unwrap();
        assert_eq!(removed.map(|r| r.email), Some("a".to_string()));
        assert!(storage.delete_client(record.id).await.unwrap().is_none());
        assert!(storage.update_client(&record).await.unwrap_err().is_not_found());
    }
}
