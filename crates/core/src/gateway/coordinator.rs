use std::collections::BTreeMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use chrono::Utc;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::audit::{AuditError, AuditLog, AuditPayload};
use crate::config::{GatewayConfig, OrchestratorConfig};
use crate::domain::envelope::ContextEnvelope;
use crate::domain::request::{ContextRequest, Intent};
use crate::errors::GatewayError;
use crate::identity::{IdentityDirectory, IdentityVerifier};
use crate::minimizer::DataMinimizer;
use crate::orchestrator::{BackendRegistry, Orchestrator};
use crate::policy::{self, PolicyEngine, PolicyTable, RateLimiter};

use super::engine::GatewayFlow;
use super::states::{GatewayEvent, GatewayState};

/// Per-request bookkeeping. Never shared between requests.
struct RequestRun {
    request_id: String,
    actor: String,
    state: GatewayState,
    stage: &'static str,
    notes: BTreeMap<String, String>,
}

impl RequestRun {
    fn note(&mut self, key: &str, value: impl ToString) {
        self.notes.insert(key.to_owned(), value.to_string());
    }
}

/// Drives requests through authentication, admission, policy, fan-out and
/// minimization, committing an audit record for every transition.
pub struct Gateway {
    verifier: Arc<IdentityVerifier>,
    policy: Arc<PolicyEngine>,
    limiter: RateLimiter,
    orchestrator: Orchestrator,
    backends: BackendRegistry,
    minimizer: DataMinimizer,
    audit: AuditLog,
    flow: GatewayFlow,
    request_deadline: Duration,
    /// Held exclusively while a reload swaps both snapshots; requests take it
    /// shared only to read the pair.
    publication: RwLock<()>,
}

/// Identity directory and policy table read as one consistent pair.
struct GovernanceView {
    directory: Arc<IdentityDirectory>,
    table: Arc<PolicyTable>,
}

impl Gateway {
    pub fn new(
        verifier: Arc<IdentityVerifier>,
        policy: Arc<PolicyEngine>,
        backends: BackendRegistry,
        audit: AuditLog,
        gateway: &GatewayConfig,
        orchestrator: &OrchestratorConfig,
    ) -> Self {
        Self {
            verifier,
            policy,
            limiter: RateLimiter::new(Duration::from_secs(gateway.rate_limit_window_secs)),
            orchestrator: Orchestrator::new(orchestrator),
            backends,
            minimizer: DataMinimizer,
            audit,
            flow: GatewayFlow,
            request_deadline: Duration::from_millis(gateway.request_deadline_ms),
            publication: RwLock::new(()),
        }
    }

    /// Publishes a reloaded directory and table together. A request sees
    /// either both old snapshots or both new ones. Returns the policy version.
    pub fn replace_governance(&self, directory: IdentityDirectory, table: PolicyTable) -> u64 {
        let _publishing = self.publication.write().unwrap_or_else(PoisonError::into_inner);
        let version = self.policy.replace(table);
        self.verifier.replace_directory(directory);
        version
    }

    fn governance_view(&self) -> GovernanceView {
        let _reading = self.publication.read().unwrap_or_else(PoisonError::into_inner);
        GovernanceView { directory: self.verifier.snapshot(), table: self.policy.snapshot() }
    }

    pub fn verifier(&self) -> &Arc<IdentityVerifier> {
        &self.verifier
    }

    pub fn policy(&self) -> &Arc<PolicyEngine> {
        &self.policy
    }

    pub fn audit(&self) -> &AuditLog {
        &self.audit
    }

    pub fn backends(&self) -> &BackendRegistry {
        &self.backends
    }

    /// Always answers with an envelope. Denied and failed requests carry no
    /// fields, only the outcome and a caller-safe reason.
    pub async fn handle(&self, request: ContextRequest) -> ContextEnvelope {
        let request_id = Uuid::new_v4().to_string();
        let intent = request.intent.clone();

        if self.audit.is_sealed() {
            let refusal = GatewayError::from(AuditError::Sealed);
            warn!(
                event_name = "gateway.request.refused_sealed",
                correlation_id = %request_id,
                "audit log sealed; refusing request"
            );
            return ContextEnvelope::rejected(
                request_id,
                refusal.status(),
                intent,
                refusal.rejection(),
            );
        }

        let mut run = RequestRun {
            request_id,
            actor: format!("unverified:{}", request.credential.agent_id),
            state: self.flow.initial_state(),
            stage: "authentication",
            notes: BTreeMap::from([("intent".to_owned(), intent.to_string())]),
        };
        let deadline = Instant::now() + self.request_deadline;

        match self.process(&mut run, request, deadline).await {
            Ok(envelope) => envelope,
            Err(failure) => self.reject(&mut run, intent, failure).await,
        }
    }

    async fn process(
        &self,
        run: &mut RequestRun,
        request: ContextRequest,
        deadline: Instant,
    ) -> Result<ContextEnvelope, GatewayError> {
        let governance = self.governance_view();
        let identity =
            self.verifier.authenticate_in(&governance.directory, &request.credential, Utc::now())?;
        run.actor = identity.agent_id().to_string();
        run.note("role", identity.role());
        self.advance(
            run,
            GatewayEvent::CredentialAccepted,
            [("credential_ref", identity.credential_ref().to_owned())],
        )
        .await?;

        run.stage = "admission";
        let limit =
            governance.directory.role(identity.role()).map_or(0, |role| role.requests_per_minute);
        self.limiter.check(identity.agent_id(), limit).await?;

        run.stage = "policy";
        let descriptor = request.resource_hints.descriptor();
        let decision =
            policy::evaluate(&governance.table, &identity, &request.intent, &descriptor);
        run.note("policy_version", decision.policy_version);
        run.note("action", descriptor.action.as_str());
        if let Some(denial) = decision.denial() {
            return Err(denial.into());
        }
        self.advance(
            run,
            GatewayEvent::PolicyAllowed,
            [
                ("allowed_fields", decision.allowed_fields.len().to_string()),
                (
                    "allowed_actions",
                    decision
                        .allowed_actions
                        .iter()
                        .map(|action| action.as_str())
                        .collect::<Vec<_>>()
                        .join(","),
                ),
            ],
        )
        .await?;

        run.stage = "backends";
        let aggregated = self
            .orchestrator
            .fetch(
                &run.request_id,
                &decision,
                &self.backends,
                &request.resource_hints.params,
                deadline,
            )
            .await;
        if let Some(failure) = aggregated.failure() {
            run.note(
                "failed_backends",
                aggregated
                    .failed
                    .iter()
                    .map(|failed| failed.backend.as_str())
                    .collect::<Vec<_>>()
                    .join(","),
            );
            return Err(failure.into());
        }
        self.advance(
            run,
            GatewayEvent::BackendsSucceeded,
            [
                (
                    "backends",
                    aggregated
                        .succeeded
                        .iter()
                        .map(|backend| backend.as_str())
                        .collect::<Vec<_>>()
                        .join(","),
                ),
                ("values", aggregated.values.len().to_string()),
            ],
        )
        .await?;

        run.stage = "minimizer";
        let envelope = self.minimizer.filter(&run.request_id, aggregated, &decision, Utc::now());
        if !envelope.fields_within_decision() {
            return Err(GatewayError::Invariant("envelope field outside decision".to_owned()));
        }
        let redacted = envelope.constraints.as_ref().map_or(0, |c| c.redacted_fields);
        self.advance(
            run,
            GatewayEvent::EnvelopeFiltered,
            [
                ("released", envelope.fields.len().to_string()),
                ("redacted", redacted.to_string()),
            ],
        )
        .await?;

        run.stage = "delivery";
        self.advance(
            run,
            GatewayEvent::DeliveryRecorded,
            [
                ("fields", envelope.fields.keys().cloned().collect::<Vec<_>>().join(",")),
                ("provenance", envelope.provenance.len().to_string()),
            ],
        )
        .await?;
        self.advance(run, GatewayEvent::EnvelopeReleased, []).await?;

        info!(
            event_name = "gateway.request.delivered",
            correlation_id = %run.request_id,
            agent_id = %run.actor,
            intent = %decision.intent,
            fields = envelope.fields.len(),
            "context envelope delivered"
        );
        Ok(envelope)
    }

    async fn advance<const N: usize>(
        &self,
        run: &mut RequestRun,
        event: GatewayEvent,
        metadata: [(&'static str, String); N],
    ) -> Result<(), GatewayError> {
        let outcome = self.flow.apply(&run.state, &event)?;
        if let Some(kind) = outcome.audit {
            let mut payload = AuditPayload::new(kind, &run.request_id, &run.actor, kind.outcome())
                .with_metadata("from", outcome.from.as_str())
                .with_metadata("to", outcome.to.as_str());
            for (key, value) in &run.notes {
                payload = payload.with_metadata(key.clone(), value.clone());
            }
            for (key, value) in metadata {
                payload = payload.with_metadata(key, value);
            }
            let record = self.audit.append(payload).await?;
            debug!(
                correlation_id = %run.request_id,
                sequence = record.sequence,
                kind = kind.as_str(),
                "transition recorded"
            );
        }
        run.state = outcome.to;
        Ok(())
    }

    async fn reject(
        &self,
        run: &mut RequestRun,
        intent: Intent,
        failure: GatewayError,
    ) -> ContextEnvelope {
        let event = terminal_event(run.state, &failure);
        let mut outcome = failure;

        if !run.state.is_terminal() {
            let metadata = [
                ("stage", run.stage.to_owned()),
                ("reason_code", outcome.code().to_owned()),
                ("detail", outcome.to_string()),
            ];
            let recorded = self.advance(run, event, metadata).await;
            if let Err(audit_failure) = recorded {
                error!(
                    event_name = "gateway.audit.write_failed",
                    correlation_id = %run.request_id,
                    stage = run.stage,
                    error = %audit_failure,
                    "could not record terminal transition"
                );
                outcome = audit_failure;
            }
        }

        warn!(
            event_name = "gateway.request.rejected",
            correlation_id = %run.request_id,
            agent_id = %run.actor,
            stage = run.stage,
            reason_code = outcome.code(),
            "request did not complete"
        );
        ContextEnvelope::rejected(
            run.request_id.clone(),
            outcome.status(),
            intent,
            outcome.rejection(),
        )
    }
}

fn terminal_event(state: GatewayState, failure: &GatewayError) -> GatewayEvent {
    match (state, failure) {
        (GatewayState::Received, GatewayError::Auth(_)) => GatewayEvent::CredentialRejected,
        (GatewayState::IdentityVerified, GatewayError::Admission(_)) => {
            GatewayEvent::AdmissionRefused
        }
        (GatewayState::IdentityVerified, GatewayError::Denied(_)) => GatewayEvent::PolicyDenied,
        (GatewayState::PolicyEvaluated, GatewayError::Backend(_)) => GatewayEvent::BackendsFailed,
        _ => GatewayEvent::Aborted,
    }
}
