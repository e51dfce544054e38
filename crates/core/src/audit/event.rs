use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEventKind {
    AuthAttempted,
    PolicyEvaluated,
    BackendsFetched,
    Filtered,
    Delivered,
    Denied,
    Failed,
    Compensation,
    Administrative,
}

impl AuditEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AuthAttempted => "auth_attempted",
            Self::PolicyEvaluated => "policy_evaluated",
            Self::BackendsFetched => "backends_fetched",
            Self::Filtered => "filtered",
            Self::Delivered => "delivered",
            Self::Denied => "denied",
            Self::Failed => "failed",
            Self::Compensation => "compensation",
            Self::Administrative => "administrative",
        }
    }

    pub fn outcome(&self) -> AuditOutcome {
        match self {
            Self::Denied => AuditOutcome::Rejected,
            Self::Failed => AuditOutcome::Failed,
            _ => AuditOutcome::Success,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditOutcome {
    Success,
    Rejected,
    Failed,
}

/// What gets recorded. The log wraps it into a chained [`super::AuditRecord`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditPayload {
    pub kind: AuditEventKind,
    pub request_id: String,
    pub actor: String,
    pub outcome: AuditOutcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub references: Option<u64>,
    pub metadata: BTreeMap<String, String>,
    pub occurred_at: DateTime<Utc>,
}

impl AuditPayload {
    pub fn new(
        kind: AuditEventKind,
        request_id: impl Into<String>,
        actor: impl Into<String>,
        outcome: AuditOutcome,
    ) -> Self {
        Self {
            kind,
            request_id: request_id.into(),
            actor: actor.into(),
            outcome,
            references: None,
            metadata: BTreeMap::new(),
            occurred_at: Utc::now(),
        }
    }

    /// A correction that points back at an already committed record.
    pub fn compensation(
        original_sequence: u64,
        actor: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        let mut payload = Self::new(
            AuditEventKind::Compensation,
            format!("compensation-{original_sequence}"),
            actor,
            AuditOutcome::Success,
        )
        .with_metadata("reason", reason);
        payload.references = Some(original_sequence);
        payload
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Stable JSON text: struct fields serialize in declaration order and
    /// metadata is a sorted map.
    pub fn to_canonical_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

#[cfg(test)]
mod tests {
    use super::{AuditEventKind, AuditOutcome, AuditPayload};

    #[test]
    fn payload_records_correlation_fields() {
        let payload = AuditPayload::new(
            AuditEventKind::Denied,
            "req-123",
            "agent-103",
            AuditOutcome::Rejected,
        )
        .with_metadata("stage", "policy")
        .with_metadata("reason_code", "policy.action_not_permitted");

        let json = payload.to_canonical_json().expect("json");
        assert!(json.contains("\"request_id\":\"req-123\""));
        assert!(json.contains("\"kind\":\"denied\""));
        assert!(!json.contains("references"));
        assert_eq!(payload.metadata.get("stage").map(String::as_str), Some("policy"));
    }

    #[test]
    fn canonical_json_is_stable_across_metadata_insert_order() {
        let first = AuditPayload::new(AuditEventKind::Filtered, "r", "a", AuditOutcome::Success)
            .with_metadata("b", "2")
            .with_metadata("a", "1");
        let mut second = first.clone();
        second.metadata.clear();
        second = second.with_metadata("a", "1").with_metadata("b", "2");

        assert_eq!(first.to_canonical_json().ok(), second.to_canonical_json().ok());
    }

    #[test]
    fn compensation_references_the_original_sequence() {
        let payload = AuditPayload::compensation(42, "operator", "wrong agent recorded");
        assert_eq!(payload.kind, AuditEventKind::Compensation);
        assert_eq!(payload.references, Some(42));
        assert_eq!(AuditEventKind::Failed.outcome(), AuditOutcome::Failed);
    }
}
