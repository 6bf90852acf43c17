use serde::{Deserialize, Serialize};

use crate::error::{CoreError, Result};
use crate::id::{ClientId, InboundId};
use crate::protocol::Protocol;
use crate::settings::InboundSettings;

/// Relational row of one client (`client_traffics`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientRecord {
    pub id: ClientId,
    pub inbound_id: InboundId,
    pub email: String,
    pub enable: bool,
    /// Cumulative uplink bytes.
    pub up: i64,
    /// Cumulative downlink bytes.
    pub down: i64,
    /// Byte quota, 0 means unlimited.
    pub total: i64,
    /// Expiry in epoch milliseconds, 0 means never.
    pub expiry_time: i64,
    /// Auto-reset period in days, mirrored into the embedded document.
    #[serde(default)]
    pub reset: i64,
}

impl ClientRecord {
    pub fn used(&self) -> i64 {
        self.up.saturating_add(self.down)
    }

    pub fn is_expired(&self, now_ms: i64) -> bool {
        self.expiry_time > 0 && self.expiry_time < now_ms
    }
}

/// Input for inserting a new relational row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewClient {
    pub inbound_id: InboundId,
    pub email: String,
    pub enable: bool,
    pub total: i64,
    pub expiry_time: i64,
}

impl NewClient {
    pub fn new(inbound_id: InboundId, email: impl Into<String>, total: i64, expiry_time: i64) -> Result<Self> {
        let email = email.into();
        if email.trim().is_empty() || email.chars().any(char::is_whitespace) {
            return Err(CoreError::invalid_email(email));
        }
        Ok(Self {
            inbound_id,
            email,
            enable: true,
            total: total.max(0),
            expiry_time: expiry_time.max(0),
        })
    }
}

/// Inbound listener row (`inbounds`).
///
/// `settings` is kept as the raw serialized document so a corrupt blob can still be
/// listed and reported by the auditor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InboundRecord {
    pub id: InboundId,
    pub protocol: Protocol,
    pub port: u16,
    pub remark: String,
    pub enable: bool,
    pub settings: String,
}

impl InboundRecord {
    pub fn parse_settings(&self) -> Result<InboundSettings> {
        InboundSettings::parse(&self.settings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_client_rejects_blank_email() {
        assert!(NewClient::new(1, "", 0, 0).is_err());
        assert!(NewClient::new(1, "two words", 0, 0).is_err());

        let client = NewClient::new(1, "user_0001", -5, 0).unwrap();
        assert!(client.enable);
        assert_eq!(client.total, 0);
    }

    #[test]
    fn test_expiry() {
        let mut record = ClientRecord {
            id: 1,
            inbound_id: 1,
            email: "a".into(),
            enable: true,
            up: 10,
            down: 5,
            total: 0,
            expiry_time: 0,
            reset: 0,
        };
        assert!(!record.is_expired(1_000));
        record.expiry_time = 500;
        assert!(record.is_expired(1_000));
        assert_eq!(record.used(), 15);
    }
}
