//! The inbound `settings` document and its embedded `clients` array.
//!
//! Embedded documents are kept as raw JSON objects so that keys this crate does not
//! know about survive every rewrite. Matching follows the panel's legacy rules: the
//! email is the join key, and the identifier may hold the numeric row id on
//! documents written before that convention settled.

use serde_json::{Map, Value, json};

use crate::error::{CoreError, Result};
use crate::id::ClientId;
use crate::model::ClientRecord;
use crate::protocol::{Protocol, ProtocolParams, SecretDefaults};

/// JSON keys of an embedded client document.
pub mod doc_keys {
    pub const CLIENTS: &str = "clients";
    pub const EMAIL: &str = "email";
    pub const ENABLE: &str = "enable";
    pub const TOTAL: &str = "totalGB";
    pub const EXPIRY: &str = "expiryTime";
    pub const LIMIT_IP: &str = "limitIp";
    pub const RESET: &str = "reset";
    pub const UPDATED_AT: &str = "updated_at";
    pub const IDENTIFIER: &str = "id";
}

/// Parsed `settings` document of one inbound.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundSettings {
    root: Map<String, Value>,
}

impl InboundSettings {
    /// Parses the raw blob. An empty string is treated as `{}`.
    pub fn parse(raw: &str) -> Result<Self> {
        if raw.trim().is_empty() {
            return Ok(Self { root: Map::new() });
        }
        match serde_json::from_str::<Value>(raw)? {
            Value::Object(root) => {
                if let Some(clients) = root.get(doc_keys::CLIENTS) {
                    if !clients.is_array() && !clients.is_null() {
                        return Err(CoreError::invalid_settings("clients is not an array"));
                    }
                }
                Ok(Self { root })
            }
            other => Err(CoreError::invalid_settings(format!(
                "expected a JSON object, found {}",
                json_kind(&other)
            ))),
        }
    }

    pub fn to_json_string(&self) -> Result<String> {
        Ok(serde_json::to_string(&self.root)?)
    }

    /// Embedded documents; a missing or null `clients` key reads as empty.
    pub fn clients(&self) -> &[Value] {
        self.root
            .get(doc_keys::CLIENTS)
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Mutable access to the array, creating it when missing.
    pub fn clients_mut(&mut self) -> &mut Vec<Value> {
        let slot = self
            .root
            .entry(doc_keys::CLIENTS)
            .or_insert_with(|| Value::Array(Vec::new()));
        if !slot.is_array() {
            *slot = Value::Array(Vec::new());
        }
        match slot {
            Value::Array(items) => items,
            _ => unreachable!("clients slot was just normalized to an array"),
        }
    }

    pub fn push_client(&mut self, doc: Map<String, Value>) {
        self.clients_mut().push(Value::Object(doc));
    }

    /// Index of the document for `email`, falling back to an identifier equal to
    /// the row id.
    pub fn position(&self, email: &str, client_id: ClientId) -> Option<usize> {
        let clients = self.clients();
        clients
            .iter()
            .position(|doc| email_matches(doc, email))
            .or_else(|| clients.iter().position(|doc| identifier_matches(doc, client_id)))
    }

    pub fn contains_email(&self, email: &str) -> bool {
        self.clients().iter().any(|doc| email_matches(doc, email))
    }

    /// Removes every document matching by email or by identifier, returning how
    /// many were dropped.
    pub fn remove_client(&mut self, email: &str, client_id: ClientId) -> usize {
        let clients = self.clients_mut();
        let before = clients.len();
        clients.retain(|doc| !email_matches(doc, email) && !identifier_matches(doc, client_id));
        before - clients.len()
    }

    /// Overwrites the mirrored fields of the document at `index`, leaving secrets
    /// alone. Returns false when the index does not hold an object.
    pub fn mirror_at(&mut self, index: usize, record: &ClientRecord, now_ms: i64) -> bool {
        match self.clients_mut().get_mut(index).and_then(Value::as_object_mut) {
            Some(doc) => {
                write_mirror(doc, record);
                doc.insert(doc_keys::UPDATED_AT.into(), json!(now_ms));
                true
            }
            None => false,
        }
    }
}

/// Builds a complete embedded document for a freshly inserted row.
pub fn new_client_document(
    record: &ClientRecord,
    protocol: &Protocol,
    params: &ProtocolParams,
    defaults: &SecretDefaults,
) -> Map<String, Value> {
    let mut doc = Map::new();
    doc.insert(doc_keys::EMAIL.into(), json!(record.email));
    doc.insert(doc_keys::LIMIT_IP.into(), json!(params.limit_ip));
    write_mirror(&mut doc, record);
    doc.extend(protocol.build_secrets(params, defaults));
    doc
}

/// True when enable, quota and expiry agree with the relational row.
pub fn mirror_matches(doc: &Value, record: &ClientRecord) -> bool {
    let enable = doc.get(doc_keys::ENABLE).and_then(Value::as_bool).unwrap_or(false);
    let total = doc.get(doc_keys::TOTAL).and_then(Value::as_i64).unwrap_or(0);
    let expiry = doc.get(doc_keys::EXPIRY).and_then(Value::as_i64).unwrap_or(0);
    enable == record.enable && total == record.total && expiry == record.expiry_time
}

pub fn document_email(doc: &Value) -> Option<&str> {
    doc.get(doc_keys::EMAIL).and_then(Value::as_str)
}

fn write_mirror(doc: &mut Map<String, Value>, record: &ClientRecord) {
    doc.insert(doc_keys::ENABLE.into(), json!(record.enable));
    doc.insert(doc_keys::TOTAL.into(), json!(record.total));
    doc.insert(doc_keys::EXPIRY.into(), json!(record.expiry_time));
    doc.insert(doc_keys::RESET.into(), json!(record.reset));
}

fn email_matches(doc: &Value, email: &str) -> bool {
    document_email(doc) == Some(email)
}

fn identifier_matches(doc: &Value, client_id: ClientId) -> bool {
    match doc.get(doc_keys::IDENTIFIER) {
        Some(Value::Number(n)) => n.as_i64() == Some(client_id),
        Some(Value::String(s)) => s.parse::<i64>().ok() == Some(client_id),
        _ => false,
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: ClientId, email: &str) -> ClientRecord {
        ClientRecord {
            id,
            inbound_id: 1,
            email: email.into(),
            enable: true,
            up: 0,
            down: 0,
            total: 1024,
            expiry_time: 0,
            reset: 0,
        }
    }

    #[test]
    fn test_parse_tolerates_missing_clients() {
        let settings = InboundSettings::parse(r#"{"decryption":"none"}"#).unwrap();
        assert!(settings.clients().is_empty());

        let settings = InboundSettings::parse("").unwrap();
        assert!(settings.clients().is_empty());

        let settings = InboundSettings::parse(r#"{"clients":null}"#).unwrap();
        assert!(settings.clients().is_empty());

        assert!(InboundSettings::parse("[1,2]").is_err());
        assert!(InboundSettings::parse(r#"{"clients":"x"}"#).is_err());
    }

    #[test]
    fn test_unknown_keys_survive_rewrite() {
        let mut settings =
            InboundSettings::parse(r#"{"decryption":"none","fallbacks":[],"clients":[]}"#).unwrap();
        let rec = record(7, "user_0001");
        let doc = new_client_document(
            &rec,
            &Protocol::Vless,
            &ProtocolParams::default(),
            &SecretDefaults::default(),
        );
        settings.push_client(doc);

        let raw = settings.to_json_string().unwrap();
        let reparsed: Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(reparsed["decryption"], "none");
        assert_eq!(reparsed["clients"][0]["email"], "user_0001");
        assert_eq!(reparsed["clients"][0]["totalGB"], 1024);
    }

    #[test]
    fn test_position_falls_back_to_numeric_identifier() {
        let settings = InboundSettings::parse(
            r#"{"clients":[{"email":"other","id":"abc"},{"email":"renamed","id":42}]}"#,
        )
        .unwrap();
        assert_eq!(settings.position("other", 1), Some(0));
        assert_eq!(settings.position("missing", 42), Some(1));
        assert_eq!(settings.position("missing", 43), None);
    }

    #[test]
    fn test_remove_matches_email_or_identifier() {
        let mut settings = InboundSettings::parse(
            r#"{"clients":[{"email":"a"},{"email":"legacy","id":"5"},{"email":"b"}]}"#,
        )
        .unwrap();
        assert_eq!(settings.remove_client("a", 5), 2);
        assert_eq!(settings.clients().len(), 1);
        assert_eq!(document_email(&settings.clients()[0]), Some("b"));
    }

    #[test]
    fn test_mirror_keeps_secrets() {
        let mut settings = InboundSettings::parse(
            r#"{"clients":[{"email":"a","password":"secret","enable":true,"totalGB":0,"expiryTime":0}]}"#,
        )
        .unwrap();
        let mut rec = record(1, "a");
        rec.enable = false;
        rec.expiry_time = 99;
        assert!(settings.mirror_at(0, &rec, 1234));

        let doc = &settings.clients()[0];
        assert_eq!(doc["password"], "secret");
        assert_eq!(doc["enable"], false);
        assert_eq!(doc["expiryTime"], 99);
        assert_eq!(doc["updated_at"], 1234);
        assert!(mirror_matches(doc, &rec));
    }
}
