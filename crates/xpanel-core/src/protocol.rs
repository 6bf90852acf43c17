//! Inbound protocols and the field shape of their embedded client documents.
//!
//! Each supported protocol carries a fixed set of required and forbidden secret
//! fields. New documents are built from these rules, and the auditor checks
//! existing documents against them.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

use crate::id::{generate_identifier, generate_password};

/// Protocol tag of an inbound listener.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Protocol {
    /// Identity + flow (VLESS).
    Vless,
    /// Identity only (VMess).
    Vmess,
    /// Secret only (Trojan).
    Trojan,
    /// Secret + cipher method (Shadowsocks).
    Shadowsocks,
    /// Any tag outside the closed set (socks, http, dokodemo-door, ...).
    Other(String),
}

impl Protocol {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Vless => "vless",
            Self::Vmess => "vmess",
            Self::Trojan => "trojan",
            Self::Shadowsocks => "shadowsocks",
            Self::Other(tag) => tag,
        }
    }

    /// Field rules for the protocol, `None` for protocols without client secrets.
    pub fn field_rules(&self) -> Option<FieldRules> {
        use DocumentField::*;
        match self {
            Self::Vless => Some(FieldRules {
                required: &[Identifier, Flow],
                forbidden: &[Password, Method],
            }),
            Self::Vmess => Some(FieldRules {
                required: &[Identifier, AlterId],
                forbidden: &[Password, Method, Flow],
            }),
            Self::Trojan => Some(FieldRules {
                required: &[Password],
                forbidden: &[Identifier, Method, Flow],
            }),
            Self::Shadowsocks => Some(FieldRules {
                required: &[Password, Method],
                forbidden: &[Identifier, Flow],
            }),
            Self::Other(_) => None,
        }
    }

    /// Builds the secret fields for a new embedded document.
    ///
    /// Caller-supplied values in `params` win; anything missing is generated or
    /// taken from `defaults`. Protocols outside the closed set get a random
    /// identifier.
    pub fn build_secrets(&self, params: &ProtocolParams, defaults: &SecretDefaults) -> Map<String, Value> {
        let mut secrets = Map::new();
        let identifier = || {
            params
                .identifier
                .clone()
                .unwrap_or_else(generate_identifier)
        };
        let password = || {
            params
                .password
                .clone()
                .unwrap_or_else(|| generate_password(defaults.password_length))
        };

        match self {
            Self::Vless => {
                secrets.insert(DocumentField::Identifier.key().into(), json!(identifier()));
                let flow = params.flow.clone().unwrap_or_else(|| defaults.vless_flow.clone());
                secrets.insert(DocumentField::Flow.key().into(), json!(flow));
            }
            Self::Vmess => {
                secrets.insert(DocumentField::Identifier.key().into(), json!(identifier()));
                secrets.insert(DocumentField::AlterId.key().into(), json!(0));
            }
            Self::Trojan => {
                secrets.insert(DocumentField::Password.key().into(), json!(password()));
            }
            Self::Shadowsocks => {
                secrets.insert(DocumentField::Password.key().into(), json!(password()));
                let method = params
                    .method
                    .clone()
                    .unwrap_or_else(|| defaults.shadowsocks_method.clone());
                secrets.insert(DocumentField::Method.key().into(), json!(method));
            }
            Self::Other(tag) => {
                tracing::warn!(protocol = %tag, "Unknown protocol, generating identifier");
                secrets.insert(DocumentField::Identifier.key().into(), json!(identifier()));
            }
        }
        secrets
    }
}

impl From<&str> for Protocol {
    fn from(tag: &str) -> Self {
        match tag.to_ascii_lowercase().as_str() {
            "vless" => Self::Vless,
            "vmess" => Self::Vmess,
            "trojan" => Self::Trojan,
            "shadowsocks" => Self::Shadowsocks,
            _ => Self::Other(tag.to_string()),
        }
    }
}

impl From<String> for Protocol {
    fn from(tag: String) -> Self {
        Self::from(tag.as_str())
    }
}

impl From<Protocol> for String {
    fn from(protocol: Protocol) -> Self {
        protocol.as_str().to_string()
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Protocol-specific secret field of an embedded client document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentField {
    Identifier,
    Flow,
    AlterId,
    Password,
    Method,
}

impl DocumentField {
    /// JSON key the proxy engine reads for this field.
    pub fn key(&self) -> &'static str {
        match self {
            Self::Identifier => "id",
            Self::Flow => "flow",
            Self::AlterId => "alterId",
            Self::Password => "password",
            Self::Method => "method",
        }
    }
}

impl fmt::Display for DocumentField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

/// Required and forbidden secret fields for one protocol.
#[derive(Debug, Clone, Copy)]
pub struct FieldRules {
    pub required: &'static [DocumentField],
    pub forbidden: &'static [DocumentField],
}

impl FieldRules {
    /// Required fields absent from the document.
    pub fn missing(&self, doc: &Map<String, Value>) -> Vec<DocumentField> {
        self.required
            .iter()
            .filter(|field| !doc.contains_key(field.key()))
            .copied()
            .collect()
    }

    /// Forbidden fields present in the document.
    pub fn present_forbidden(&self, doc: &Map<String, Value>) -> Vec<DocumentField> {
        self.forbidden
            .iter()
            .filter(|field| doc.contains_key(field.key()))
            .copied()
            .collect()
    }
}

/// Secret material supplied by the caller; `None` fields are generated.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtocolParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identifier: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flow: Option<String>,
    #[serde(default)]
    pub limit_ip: i64,
}

/// Fallback values for generated secrets.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecretDefaults {
    pub shadowsocks_method: String,
    pub vless_flow: String,
    pub password_length: usize,
}

impl Default for SecretDefaults {
    fn default() -> Self {
        Self {
            shadowsocks_method: "chacha20-ietf-poly1305".into(),
            vless_flow: "xtls-rprx-vision".into(),
            password_length: 16,
        }
    }
}
