//! Query types shared by storage backends.

use serde::{Deserialize, Serialize};
use xpanel_core::{ClientRecord, InboundId};

/// Filter for listing client rows. All set conditions must hold.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientFilter {
    /// Restrict to one inbound.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inbound_id: Option<InboundId>,
    /// Exact email match.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    /// Only rows with `0 < expiry_time < value`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expired_before: Option<i64>,
    /// Only disabled rows.
    #[serde(default)]
    pub disabled: bool,
    /// Only rows with `up + down == 0`.
    #[serde(default)]
    pub no_traffic: bool,
}

impl ClientFilter {
    /// Creates a filter matching every row.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn inbound(mut self, inbound_id: InboundId) -> Self {
        self.inbound_id = Some(inbound_id);
        self
    }

    #[must_use]
    pub fn email(mut self, email: impl Into<String>) -> Self {
        self.email = Some(email.into());
        self
    }

    #[must_use]
    pub fn expired_before(mut self, now_ms: i64) -> Self {
        self.expired_before = Some(now_ms);
        self
    }

    #[must_use]
    pub fn disabled(mut self) -> Self {
        self.disabled = true;
        self
    }

    #[must_use]
    pub fn no_traffic(mut self) -> Self {
        self.no_traffic = true;
        self
    }

    /// Evaluates the filter in memory.
    pub fn matches(&self, record: &ClientRecord) -> bool {
        if self.inbound_id.is_some_and(|id| id != record.inbound_id) {
            return false;
        }
        if self.email.as_deref().is_some_and(|email| email != record.email) {
            return false;
        }
        if self.expired_before.is_some_and(|now| !record.is_expired(now)) {
            return false;
        }
        if self.disabled && record.enable {
            return false;
        }
        if self.no_traffic && record.used() != 0 {
            return false;
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> ClientRecord {
        ClientRecord {
            id: 1,
            inbound_id: 3,
            email: "user_0001".into(),
            enable: true,
            up: 0,
            down: 0,
            total: 0,
            expiry_time: 100,
            reset: 0,
        }
    }

    #[test]
    fn test_filter_matches() {
        let rec = record();
        assert!(ClientFilter::new().matches(&rec));
        assert!(ClientFilter::new().inbound(3).no_traffic().matches(&rec));
        assert!(!ClientFilter::new().inbound(4).matches(&rec));
        assert!(ClientFilter::new().expired_before(200).matches(&rec));
        assert!(!ClientFilter::new().expired_before(50).matches(&rec));
        assert!(!ClientFilter::new().disabled().matches(&rec));
        assert!(ClientFilter::new().email("user_0001").matches(&rec));
    }
}
