use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::domain::backend::BackendId;
use crate::domain::identity::{Action, Sensitivity};
use crate::domain::request::Intent;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionOutcome {
    Allowed,
    Denied,
}

/// The part of a policy decision the caller may see.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecisionSummary {
    pub intent: Intent,
    pub outcome: DecisionOutcome,
    pub allowed_fields: Vec<String>,
    pub allowed_actions: Vec<Action>,
}

impl DecisionSummary {
    pub fn denied(intent: Intent) -> Self {
        Self {
            intent,
            outcome: DecisionOutcome::Denied,
            allowed_fields: Vec::new(),
            allowed_actions: Vec::new(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvenanceEntry {
    pub field: String,
    pub source_backend: BackendId,
    pub retrieved_at: DateTime<Utc>,
    pub transform: Option<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvelopeStatus {
    Delivered,
    Denied,
    Failed,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rejection {
    pub code: String,
    pub message: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvelopeConstraints {
    pub ttl_secs: u64,
    pub expires_at: DateTime<Utc>,
    pub permitted_actions: Vec<Action>,
    pub data_classification: Sensitivity,
    pub redacted_fields: usize,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ContextEnvelope {
    pub request_id: String,
    pub status: EnvelopeStatus,
    pub fields: BTreeMap<String, Value>,
    pub provenance: Vec<ProvenanceEntry>,
    pub decision: DecisionSummary,
    pub constraints: Option<EnvelopeConstraints>,
    pub reason: Option<Rejection>,
    pub timestamp: DateTime<Utc>,
}

impl ContextEnvelope {
    /// An envelope carrying no data, only the outcome and a generic reason.
    pub fn rejected(
        request_id: impl Into<String>,
        status: EnvelopeStatus,
        intent: Intent,
        reason: Rejection,
    ) -> Self {
        Self {
            request_id: request_id.into(),
            status,
            fields: BTreeMap::new(),
            provenance: Vec::new(),
            decision: DecisionSummary::denied(intent),
            constraints: None,
            reason: Some(reason),
            timestamp: Utc::now(),
        }
    }

    pub fn is_delivered(&self) -> bool {
        self.status == EnvelopeStatus::Delivered
    }

    /// True when every field present is one the decision allowed.
    pub fn fields_within_decision(&self) -> bool {
        self.fields.keys().all(|field| self.decision.allowed_fields.contains(field))
    }
}
