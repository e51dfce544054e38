use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};
use tracing::debug;

use crate::domain::envelope::{
    ContextEnvelope, EnvelopeConstraints, EnvelopeStatus, ProvenanceEntry,
};
use crate::orchestrator::AggregatedResult;
use crate::policy::PolicyDecision;

#[derive(Clone, Copy, Debug, Default)]
pub struct DataMinimizer;

impl DataMinimizer {
    /// Reduces the aggregate to exactly the approved fields. The aggregate is
    /// consumed; values outside the decision are dropped, not kept aside.
    pub fn filter(
        &self,
        request_id: &str,
        aggregated: AggregatedResult,
        decision: &PolicyDecision,
        now: DateTime<Utc>,
    ) -> ContextEnvelope {
        let mut fields = BTreeMap::new();
        let mut provenance = Vec::new();
        let mut redacted = 0_usize;

        if decision.is_allowed() {
            for sourced in aggregated.values {
                let Some(allowed) = decision.field_for(&sourced.source, &sourced.field) else {
                    redacted += 1;
                    continue;
                };
                let output_name = allowed.output_name().to_owned();
                if fields.contains_key(&output_name) {
                    redacted += 1;
                    continue;
                }
                let value = match &allowed.transform {
                    Some(transform) => match transform.apply(sourced.value) {
                        Some(value) => value,
                        None => {
                            redacted += 1;
                            continue;
                        }
                    },
                    None => sourced.value,
                };
                provenance.push(ProvenanceEntry {
                    field: output_name.clone(),
                    source_backend: sourced.source,
                    retrieved_at: sourced.retrieved_at,
                    transform: allowed.transform.as_ref().map(|t| t.name().to_owned()),
                });
                fields.insert(output_name, value);
            }
        } else {
            redacted = aggregated.values.len();
        }

        debug!(
            correlation_id = request_id,
            released = fields.len(),
            redacted,
            "aggregate minimized"
        );

        let ttl = i64::try_from(decision.ttl_secs).unwrap_or(i64::MAX / 1000);
        let constraints = decision.is_allowed().then(|| EnvelopeConstraints {
            ttl_secs: decision.ttl_secs,
            expires_at: now + Duration::seconds(ttl),
            permitted_actions: decision.allowed_actions.clone(),
            data_classification: decision.classification,
            redacted_fields: redacted,
        });

        ContextEnvelope {
            request_id: request_id.to_owned(),
            status: if decision.is_allowed() {
                EnvelopeStatus::Delivered
            } else {
                EnvelopeStatus::Denied
            },
            fields,
            provenance,
            decision: decision.summary(),
            constraints,
            reason: None,
            timestamp: now,
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use serde_json::json;

    use super::DataMinimizer;
    use crate::domain::backend::BackendId;
    use crate::domain::envelope::{DecisionOutcome, EnvelopeStatus};
    use crate::domain::identity::{Action, Sensitivity};
    use crate::domain::request::Intent;
    use crate::orchestrator::{AggregatedResult, SourcedValue};
    use crate::policy::{AllowedField, FieldTransform, PolicyDecision};

    fn sourced(source: &str, field: &str, value: serde_json::Value) -> SourcedValue {
        SourcedValue {
            field: field.to_owned(),
            source: BackendId(source.to_owned()),
            value,
            retrieved_at: Utc::now(),
        }
    }

    fn decision(outcome: DecisionOutcome) -> PolicyDecision {
        PolicyDecision {
            intent: Intent("loan_assessment".to_owned()),
            outcome,
            reason: None,
            allowed_fields: vec![
                AllowedField {
                    name: "transactions".to_owned(),
                    alias: Some("transaction_count".to_owned()),
                    source: BackendId("account".to_owned()),
                    sensitivity: Sensitivity::Confidential,
                    transform: Some(FieldTransform::Count),
                },
                AllowedField {
                    name: "account_number".to_owned(),
                    alias: None,
                    source: BackendId("account".to_owned()),
                    sensitivity: Sensitivity::Confidential,
                    transform: Some(FieldTransform::MaskLast4),
                },
            ],
            allowed_actions: vec![Action::Assess],
            classification: Sensitivity::Confidential,
            ttl_secs: 300,
            policy_version: 1,
        }
    }

    fn aggregate() -> AggregatedResult {
        AggregatedResult {
            values: vec![
                sourced("account", "transactions", json!([{"amount": 1}, {"amount": 2}])),
                sourced("account", "account_number", json!("ACC-12345678")),
                sourced("account", "routing_number", json!("021000021")),
                sourced("customer", "account_number", json!("SPOOFED-0000")),
            ],
            succeeded: vec![BackendId("account".to_owned())],
            failed: Vec::new(),
            deadline_expired: false,
        }
    }

    #[test]
    fn only_approved_fields_survive_with_provenance() {
        let envelope = DataMinimizer.filter(
            "req-1",
            aggregate(),
            &decision(DecisionOutcome::Allowed),
            Utc::now(),
        );

        assert_eq!(envelope.status, EnvelopeStatus::Delivered);
        assert_eq!(envelope.fields.get("transaction_count"), Some(&json!(2)));
        assert_eq!(envelope.fields.get("account_number"), Some(&json!("********5678")));
        assert!(!envelope.fields.contains_key("routing_number"));
        assert!(!envelope.fields.contains_key("transactions"));
        assert!(envelope.fields_within_decision());

        assert_eq!(envelope.provenance.len(), 2);
        assert!(envelope
            .provenance
            .iter()
            .all(|entry| entry.source_backend == BackendId("account".to_owned())));
        let constraints = envelope.constraints.expect("constraints");
        assert_eq!(constraints.redacted_fields, 2);
        assert_eq!(constraints.permitted_actions, vec![Action::Assess]);
    }

    #[test]
    fn transform_that_cannot_apply_drops_the_field() {
        let mut aggregate = aggregate();
        aggregate.values[0] = sourced("account", "transactions", json!("not a list"));

        let envelope = DataMinimizer.filter(
            "req-2",
            aggregate,
            &decision(DecisionOutcome::Allowed),
            Utc::now(),
        );
        assert!(!envelope.fields.contains_key("transaction_count"));
        assert_eq!(envelope.constraints.map(|c| c.redacted_fields), Some(3));
    }

    #[test]
    fn denied_decision_yields_empty_envelope() {
        let envelope = DataMinimizer.filter(
            "req-3",
            aggregate(),
            &decision(DecisionOutcome::Denied),
            Utc::now(),
        );
        assert_eq!(envelope.status, EnvelopeStatus::Denied);
        assert!(envelope.fields.is_empty());
        assert!(envelope.provenance.is_empty());
        assert!(envelope.constraints.is_none());
    }
}
