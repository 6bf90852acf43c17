//! Detection and repair of dual-store drift and malformed client documents.
//!
//! Findings:
//! - a relational row whose inbound holds no document with its email
//! - several documents for one row
//! - a document whose enable/quota/expiry disagree with its row
//! - a document violating its protocol's required/forbidden fields
//! - a document with no row behind it (reported, never removed automatically)
//! - a `settings` blob that cannot be parsed

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{info, warn};
use xpanel_core::settings::{document_email, mirror_matches, new_client_document};
use xpanel_core::{
    ClientId, ClientRecord, DocumentField, InboundId, InboundRecord, InboundSettings,
    ProtocolParams, now_millis,
};
use xpanel_storage::ClientFilter;

use crate::consistency::ConsistencyEngine;
use crate::error::{ProvisionError, ProvisionResult};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Finding {
    MissingDocument {
        inbound_id: InboundId,
        client_id: ClientId,
        email: String,
    },
    DuplicateDocument {
        inbound_id: InboundId,
        email: String,
        count: usize,
    },
    FieldDrift {
        inbound_id: InboundId,
        client_id: ClientId,
        email: String,
    },
    MalformedDocument {
        inbound_id: InboundId,
        email: String,
        missing: Vec<DocumentField>,
        forbidden: Vec<DocumentField>,
    },
    StrayDocument {
        inbound_id: InboundId,
        email: String,
    },
    UnreadableSettings {
        inbound_id: InboundId,
        message: String,
    },
}

impl Finding {
    pub fn inbound_id(&self) -> InboundId {
        match self {
            Self::MissingDocument { inbound_id, .. }
            | Self::DuplicateDocument { inbound_id, .. }
            | Self::FieldDrift { inbound_id, .. }
            | Self::MalformedDocument { inbound_id, .. }
            | Self::StrayDocument { inbound_id, .. }
            | Self::UnreadableSettings { inbound_id, .. } => *inbound_id,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::MissingDocument { .. } => "missing_document",
            Self::DuplicateDocument { .. } => "duplicate_document",
            Self::FieldDrift { .. } => "field_drift",
            Self::MalformedDocument { .. } => "malformed_document",
            Self::StrayDocument { .. } => "stray_document",
            Self::UnreadableSettings { .. } => "unreadable_settings",
        }
    }

    /// The engine error for findings that have one.
    pub fn into_error(self) -> Option<ProvisionError> {
        match self {
            Self::MalformedDocument {
                inbound_id,
                email,
                missing,
                forbidden,
            } => Some(ProvisionError::MalformedDocument {
                inbound_id,
                email,
                missing,
                forbidden,
            }),
            _ => None,
        }
    }

    /// Whether the repair pass fixes this finding.
    pub fn is_repairable(&self) -> bool {
        !matches!(
            self,
            Self::StrayDocument { .. } | Self::UnreadableSettings { .. }
        )
    }
}

impl fmt::Display for Finding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingDocument {
                inbound_id,
                client_id,
                email,
            } => write!(
                f,
                "client {client_id} ({email}) has no document in inbound {inbound_id}"
            ),
            Self::DuplicateDocument {
                inbound_id,
                email,
                count,
            } => write!(f, "{count} documents for {email} in inbound {inbound_id}"),
            Self::FieldDrift {
                inbound_id,
                client_id,
                email,
            } => write!(
                f,
                "document for client {client_id} ({email}) in inbound {inbound_id} disagrees with its row"
            ),
            Self::MalformedDocument {
                inbound_id,
                email,
                missing,
                forbidden,
            } => write!(
                f,
                "document {email:?} in inbound {inbound_id} is malformed: missing {missing:?}, forbidden {forbidden:?}"
            ),
            Self::StrayDocument { inbound_id, email } => {
                write!(f, "document {email:?} in inbound {inbound_id} has no client row")
            }
            Self::UnreadableSettings {
                inbound_id,
                message,
            } => write!(f, "settings of inbound {inbound_id} unreadable: {message}"),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuditReport {
    pub inbounds_checked: usize,
    pub clients_checked: usize,
    pub findings: Vec<Finding>,
}

impl AuditReport {
    pub fn is_clean(&self) -> bool {
        self.findings.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepairAction {
    pub inbound_id: InboundId,
    pub email: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<ClientId>,
    pub action: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RepairReport {
    pub actions: Vec<RepairAction>,
    /// Findings the repair pass leaves for an operator.
    pub unresolved: Vec<String>,
}

pub struct Auditor {
    engine: Arc<ConsistencyEngine>,
}

impl Auditor {
    pub fn new(engine: Arc<ConsistencyEngine>) -> Self {
        Self { engine }
    }

    /// Checks one inbound, or all of them.
    pub async fn audit(&self, inbound_id: Option<InboundId>) -> ProvisionResult<AuditReport> {
        let mut report = AuditReport::default();
        for inbound in self.targets(inbound_id).await? {
            let rows = self.rows(inbound.id).await?;
            report.inbounds_checked += 1;
            report.clients_checked += rows.len();
            report.findings.extend(inspect(&inbound, &rows));
        }
        info!(
            inbounds = report.inbounds_checked,
            clients = report.clients_checked,
            findings = report.findings.len(),
            "Audit finished"
        );
        Ok(report)
    }

    /// Fixes every repairable finding, one inbound at a time under its lock.
    pub async fn repair(&self, inbound_id: Option<InboundId>) -> ProvisionResult<RepairReport> {
        let mut report = RepairReport::default();
        for target in self.targets(inbound_id).await? {
            let _guard = self.engine.lock_inbound(target.id).await;

            // Re-read under the lock; a job may have written since listing.
            let Some(inbound) = self.engine.storage().inbound(target.id).await? else {
                continue;
            };
            let rows = self.rows(inbound.id).await?;
            let findings = inspect(&inbound, &rows);
            if findings.is_empty() {
                continue;
            }

            let mut settings = match inbound.parse_settings() {
                Ok(settings) => settings,
                Err(e) => {
                    report.unresolved.push(
                        Finding::UnreadableSettings {
                            inbound_id: inbound.id,
                            message: e.to_string(),
                        }
                        .to_string(),
                    );
                    continue;
                }
            };

            let before = report.actions.len();
            for finding in findings {
                match self.fix(&inbound, &rows, &mut settings, &finding) {
                    Some(action) => report.actions.push(action),
                    None => report.unresolved.push(finding.to_string()),
                }
            }
            if report.actions.len() > before {
                self.engine.write_settings(inbound.id, &settings).await?;
                info!(
                    inbound_id = inbound.id,
                    fixed = report.actions.len() - before,
                    "Inbound repaired"
                );
            }
        }
        Ok(report)
    }

    fn fix(
        &self,
        inbound: &InboundRecord,
        rows: &[ClientRecord],
        settings: &mut InboundSettings,
        finding: &Finding,
    ) -> Option<RepairAction> {
        let action = |email: &str, client_id: Option<ClientId>, action: &str| RepairAction {
            inbound_id: inbound.id,
            email: email.to_string(),
            client_id,
            action: action.to_string(),
        };

        match finding {
            Finding::MissingDocument {
                client_id, email, ..
            } => {
                let record = rows.iter().find(|row| row.id == *client_id)?;
                let document = new_client_document(
                    record,
                    &inbound.protocol,
                    &ProtocolParams::default(),
                    self.engine.secret_defaults(),
                );
                settings.push_client(document);
                Some(action(email, Some(*client_id), "restored_document"))
            }
            Finding::DuplicateDocument { email, .. } => {
                let mut seen = false;
                settings.clients_mut().retain(|doc| {
                    if document_email(doc) != Some(email.as_str()) {
                        return true;
                    }
                    !std::mem::replace(&mut seen, true)
                });
                Some(action(email, None, "removed_duplicates"))
            }
            Finding::FieldDrift {
                client_id, email, ..
            } => {
                let record = rows.iter().find(|row| row.id == *client_id)?;
                let index = settings
                    .clients()
                    .iter()
                    .position(|doc| document_email(doc) == Some(email.as_str()))?;
                settings
                    .mirror_at(index, record, now_millis())
                    .then(|| action(email, Some(*client_id), "synced_fields"))
            }
            Finding::MalformedDocument {
                email,
                missing,
                forbidden,
                ..
            } => {
                let secrets = inbound
                    .protocol
                    .build_secrets(&ProtocolParams::default(), self.engine.secret_defaults());
                let doc = settings
                    .clients_mut()
                    .iter_mut()
                    .find(|doc| document_email(doc) == Some(email.as_str()))
                    .and_then(Value::as_object_mut)?;
                if !fix_fields(doc, missing, forbidden, &secrets) {
                    return None;
                }
                let client_id = rows.iter().find(|row| &row.email == email).map(|row| row.id);
                Some(action(email, client_id, "fixed_fields"))
            }
            Finding::StrayDocument { .. } | Finding::UnreadableSettings { .. } => None,
        }
    }

    async fn targets(&self, inbound_id: Option<InboundId>) -> ProvisionResult<Vec<InboundRecord>> {
        match inbound_id {
            Some(id) => Ok(vec![self.engine.require_inbound(id).await?]),
            None => Ok(self.engine.storage().inbounds().await?),
        }
    }

    async fn rows(&self, inbound_id: InboundId) -> ProvisionResult<Vec<ClientRecord>> {
        Ok(self
            .engine
            .storage()
            .clients(&ClientFilter::new().inbound(inbound_id))
            .await?)
    }
}

/// Drops forbidden fields and fills missing ones from `secrets`.
///
/// Leaves `doc` untouched and returns false when a missing field has no value.
fn fix_fields(
    doc: &mut Map<String, Value>,
    missing: &[DocumentField],
    forbidden: &[DocumentField],
    secrets: &Map<String, Value>,
) -> bool {
    let Some(fills) = missing
        .iter()
        .map(|field| secrets.get(field.key()).map(|value| (field.key(), value.clone())))
        .collect::<Option<Vec<_>>>()
    else {
        return false;
    };
    for field in forbidden {
        doc.remove(field.key());
    }
    for (key, value) in fills {
        doc.insert(key.to_string(), value);
    }
    true
}

/// Compares one inbound's documents with its rows.
fn inspect(inbound: &InboundRecord, rows: &[ClientRecord]) -> Vec<Finding> {
    let settings = match inbound.parse_settings() {
        Ok(settings) => settings,
        Err(e) => {
            return vec![Finding::UnreadableSettings {
                inbound_id: inbound.id,
                message: e.to_string(),
            }];
        }
    };

    let mut findings = Vec::new();
    let mut by_email: HashMap<&str, Vec<&Value>> = HashMap::new();
    for doc in settings.clients() {
        by_email.entry(document_email(doc).unwrap_or("")).or_default().push(doc);
    }

    if let Some(rules) = inbound.protocol.field_rules() {
        for doc in settings.clients() {
            let Some(object) = doc.as_object() else {
                continue;
            };
            let missing = rules.missing(object);
            let forbidden = rules.present_forbidden(object);
            if !missing.is_empty() || !forbidden.is_empty() {
                findings.push(Finding::MalformedDocument {
                    inbound_id: inbound.id,
                    email: document_email(doc).unwrap_or_default().to_string(),
                    missing,
                    forbidden,
                });
            }
        }
    }

    for row in rows {
        match by_email.get(row.email.as_str()).map(Vec::as_slice) {
            None | Some([]) => findings.push(Finding::MissingDocument {
                inbound_id: inbound.id,
                client_id: row.id,
                email: row.email.clone(),
            }),
            Some([doc]) => {
                if !mirror_matches(doc, row) {
                    findings.push(Finding::FieldDrift {
                        inbound_id: inbound.id,
                        client_id: row.id,
                        email: row.email.clone(),
                    });
                }
            }
            Some(docs) => findings.push(Finding::DuplicateDocument {
                inbound_id: inbound.id,
                email: row.email.clone(),
                count: docs.len(),
            }),
        }
    }

    for email in by_email.keys() {
        if !rows.iter().any(|row| row.email == *email) {
            warn!(inbound_id = inbound.id, email, "Document without client row");
            findings.push(Finding::StrayDocument {
                inbound_id: inbound.id,
                email: email.to_string(),
            });
        }
    }

    findings
}
