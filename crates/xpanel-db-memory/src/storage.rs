use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};

use papaya::HashMap as PapayaHashMap;
use tokio::sync::Mutex;
use xpanel_core::{ClientId, ClientRecord, InboundId, InboundRecord, Protocol};

/// In-memory panel storage using papaya lock-free HashMaps.
///
/// Mirrors the two tables of an x-ui database:
/// - `inbounds` keyed by inbound id, settings kept as the raw blob
/// - `client_traffics` keyed by client id
///
/// Client emails are unique per inbound; the check and the insert run under
/// `insert_lock` so concurrent inserts cannot both pass the check.
#[derive(Debug)]
pub struct InMemoryStorage {
    pub(crate) inbounds: Arc<PapayaHashMap<InboundId, InboundRecord>>,
    pub(crate) clients: Arc<PapayaHashMap<ClientId, ClientRecord>>,
    next_inbound_id: AtomicI64,
    next_client_id: AtomicI64,
    pub(crate) insert_lock: Mutex<()>,
}

impl InMemoryStorage {
    /// Creates a new empty storage.
    pub fn new() -> Self {
        Self {
            inbounds: Arc::new(PapayaHashMap::new()),
            clients: Arc::new(PapayaHashMap::new()),
            next_inbound_id: AtomicI64::new(1),
            next_client_id: AtomicI64::new(1),
            insert_lock: Mutex::new(()),
        }
    }

    /// Adds an inbound with the next free id.
    pub fn insert_inbound(
        &self,
        protocol: Protocol,
        port: u16,
        remark: impl Into<String>,
        settings: impl Into<String>,
    ) -> InboundRecord {
        let id = self.next_inbound_id.fetch_add(1, Ordering::SeqCst);
        let record = InboundRecord {
            id,
            protocol,
            port,
            remark: remark.into(),
            enable: true,
            settings: settings.into(),
        };
        self.inbounds.pin().insert(id, record.clone());
        record
    }

    /// Inserts or replaces an inbound under its own id.
    pub fn put_inbound(&self, record: InboundRecord) {
        self.next_inbound_id
            .fetch_max(record.id + 1, Ordering::SeqCst);
        self.inbounds.pin().insert(record.id, record);
    }

    /// Inserts or replaces a client row under its own id, bypassing the email check.
    /// Used to seed fixtures such as rows whose embedded document went missing.
    pub fn put_client(&self, record: ClientRecord) {
        self.next_client_id
            .fetch_max(record.id + 1, Ordering::SeqCst);
        self.clients.pin().insert(record.id, record);
    }

    pub(crate) fn next_client_id(&self) -> ClientId {
        self.next_client_id.fetch_add(1, Ordering::SeqCst)
    }

    pub fn inbound_count(&self) -> usize {
        self.inbounds.pin().len()
    }

    pub fn client_count(&self) -> usize {
        self.clients.pin().len()
    }
}

impl Default for InMemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}
