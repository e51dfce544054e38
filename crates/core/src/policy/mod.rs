//! Deny-by-default policy evaluation.
//!
//! [`evaluate`] is a pure function of the compiled table and its inputs. The
//! [`PolicyEngine`] only adds snapshot publication on top of it.

pub mod rate_limit;
pub mod table;
pub mod transform;

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwap;
use serde::Serialize;
use tracing::info;

use crate::domain::backend::BackendId;
use crate::domain::envelope::{DecisionOutcome, DecisionSummary};
use crate::domain::identity::{Action, AgentIdentity, Sensitivity};
use crate::domain::request::{Intent, ResourceDescriptor};
use crate::errors::PolicyDenial;

pub use rate_limit::RateLimiter;
pub use table::{AllowedField, EnterpriseOverrides, Grant, PolicyTable, ResourcePattern};
pub use transform::{BandThreshold, FieldTransform};

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct PolicyDecision {
    pub intent: Intent,
    pub outcome: DecisionOutcome,
    pub reason: Option<PolicyDenial>,
    pub allowed_fields: Vec<AllowedField>,
    pub allowed_actions: Vec<Action>,
    pub classification: Sensitivity,
    pub ttl_secs: u64,
    pub policy_version: u64,
}

impl PolicyDecision {
    fn denied(intent: &Intent, reason: PolicyDenial, policy_version: u64) -> Self {
        Self {
            intent: intent.clone(),
            outcome: DecisionOutcome::Denied,
            reason: Some(reason),
            allowed_fields: Vec::new(),
            allowed_actions: Vec::new(),
            classification: Sensitivity::Public,
            ttl_secs: 0,
            policy_version,
        }
    }

    pub fn is_allowed(&self) -> bool {
        self.outcome == DecisionOutcome::Allowed
    }

    pub fn denial(&self) -> Option<PolicyDenial> {
        self.reason
    }

    /// Backends the decision needs, each with the source fields to request.
    pub fn required_backends(&self) -> BTreeMap<BackendId, Vec<String>> {
        let mut required: BTreeMap<BackendId, Vec<String>> = BTreeMap::new();
        for field in &self.allowed_fields {
            let fields = required.entry(field.source.clone()).or_default();
            if !fields.contains(&field.name) {
                fields.push(field.name.clone());
            }
        }
        required
    }

    pub fn field_for(&self, source: &BackendId, name: &str) -> Option<&AllowedField> {
        self.allowed_fields.iter().find(|field| &field.source == source && field.name == name)
    }

    pub fn summary(&self) -> DecisionSummary {
        DecisionSummary {
            intent: self.intent.clone(),
            outcome: self.outcome,
            allowed_fields: self
                .allowed_fields
                .iter()
                .map(|field| field.output_name().to_owned())
                .collect(),
            allowed_actions: self.allowed_actions.clone(),
        }
    }
}

/// Computes the minimal field and action set for one request.
pub fn evaluate(
    table: &PolicyTable,
    identity: &AgentIdentity,
    intent: &Intent,
    resource: &ResourceDescriptor,
) -> PolicyDecision {
    let version = table.version();
    let Some(grant) = table.grant(identity.role(), intent) else {
        return PolicyDecision::denied(intent, PolicyDenial::PolicyNotFound, version);
    };

    if !identity.has_intent(intent.as_str()) {
        return PolicyDecision::denied(intent, PolicyDenial::ScopeViolation, version);
    }

    let allowed_actions: Vec<Action> =
        grant.actions.iter().copied().filter(|action| identity.permits_action(*action)).collect();
    if !allowed_actions.contains(&resource.action) {
        return PolicyDecision::denied(intent, PolicyDenial::ActionNotPermitted, version);
    }

    if table.overrides().restricts(identity.agent_id(), resource) {
        return PolicyDecision::denied(intent, PolicyDenial::RestrictedResource, version);
    }

    if !identity.permits_visibility(resource.visibility) {
        return PolicyDecision::denied(intent, PolicyDenial::ScopeViolation, version);
    }

    let allowed_fields = grant
        .fields
        .iter()
        .filter(|field| field.sensitivity <= identity.clearance())
        .cloned()
        .collect();

    PolicyDecision {
        intent: intent.clone(),
        outcome: DecisionOutcome::Allowed,
        reason: None,
        allowed_fields,
        allowed_actions,
        classification: grant.classification,
        ttl_secs: grant.ttl_secs,
        policy_version: version,
    }
}

pub struct PolicyEngine {
    table: ArcSwap<PolicyTable>,
    next_version: AtomicU64,
}

impl PolicyEngine {
    pub fn new(mut table: PolicyTable) -> Self {
        table.version = 1;
        Self { table: ArcSwap::from_pointee(table), next_version: AtomicU64::new(2) }
    }

    /// Evaluates against the snapshot current at call time. Later swaps do not
    /// affect the returned decision.
    pub fn evaluate(
        &self,
        identity: &AgentIdentity,
        intent: &Intent,
        resource: &ResourceDescriptor,
    ) -> PolicyDecision {
        let table = self.table.load_full();
        evaluate(&table, identity, intent, resource)
    }

    /// Publishes a new table and returns its version.
    pub fn replace(&self, mut table: PolicyTable) -> u64 {
        let version = self.next_version.fetch_add(1, Ordering::SeqCst);
        table.version = version;
        let grants = table.grant_count();
        self.table.store(Arc::new(table));
        info!(
            event_name = "policy.table.replaced",
            correlation_id = "policy-reload",
            version,
            grants,
            "policy table replaced"
        );
        version
    }

    pub fn snapshot(&self) -> Arc<PolicyTable> {
        self.table.load_full()
    }
}
