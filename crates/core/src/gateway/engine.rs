use thiserror::Error;

use crate::audit::AuditEventKind;
use crate::gateway::states::{GatewayEvent, GatewayState, TransitionOutcome};

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum TransitionError {
    #[error("invalid transition from {state:?} using event {event:?}")]
    InvalidTransition { state: GatewayState, event: GatewayEvent },
}

#[derive(Clone, Copy, Debug, Default)]
pub struct GatewayFlow;

impl GatewayFlow {
    pub fn initial_state(&self) -> GatewayState {
        GatewayState::Received
    }

    pub fn apply(
        &self,
        current: &GatewayState,
        event: &GatewayEvent,
    ) -> Result<TransitionOutcome, TransitionError> {
        transition(current, event)
    }
}

fn transition(
    current: &GatewayState,
    event: &GatewayEvent,
) -> Result<TransitionOutcome, TransitionError> {
    use AuditEventKind as Audit;
    use GatewayEvent::{
        Aborted, AdmissionRefused, BackendsFailed, BackendsSucceeded, CredentialAccepted,
        CredentialRejected, DeliveryRecorded, EnvelopeFiltered, EnvelopeReleased, PolicyAllowed,
        PolicyDenied,
    };
    use GatewayState::{
        Audited, BackendsFetched, Delivered, Denied, Failed, Filtered, IdentityVerified,
        PolicyEvaluated, Received,
    };

    let (to, audit) = match (current, event) {
        (Received, CredentialAccepted) => (IdentityVerified, Some(Audit::AuthAttempted)),
        (Received, CredentialRejected) => (Denied, Some(Audit::Denied)),
        (IdentityVerified, AdmissionRefused) => (Denied, Some(Audit::Denied)),
        (IdentityVerified, PolicyAllowed) => (PolicyEvaluated, Some(Audit::PolicyEvaluated)),
        (IdentityVerified, PolicyDenied) => (Denied, Some(Audit::Denied)),
        (PolicyEvaluated, BackendsSucceeded) => (BackendsFetched, Some(Audit::BackendsFetched)),
        (PolicyEvaluated, BackendsFailed) => (Failed, Some(Audit::Failed)),
        (BackendsFetched, EnvelopeFiltered) => (Filtered, Some(Audit::Filtered)),
        (Filtered, DeliveryRecorded) => (Audited, Some(Audit::Delivered)),
        (Audited, EnvelopeReleased) => (Delivered, None),
        (state, Aborted) if !state.is_terminal() => (Failed, Some(Audit::Failed)),
        _ => {
            return Err(TransitionError::InvalidTransition { state: *current, event: *event });
        }
    };

    Ok(TransitionOutcome { from: *current, to, event: *event, audit })
}

#[cfg(test)]
mod tests {
    use crate::audit::AuditEventKind;
    use crate::gateway::engine::{GatewayFlow, TransitionError};
    use crate::gateway::states::{GatewayEvent, GatewayState};

    #[test]
    fn happy_path_emits_one_record_per_audited_step() {
        let flow = GatewayFlow;
        let mut state = flow.initial_state();
        let mut records = Vec::new();

        for event in [
            GatewayEvent::CredentialAccepted,
            GatewayEvent::PolicyAllowed,
            GatewayEvent::BackendsSucceeded,
            GatewayEvent::EnvelopeFiltered,
            GatewayEvent::DeliveryRecorded,
            GatewayEvent::EnvelopeReleased,
        ] {
            let outcome = flow.apply(&state, &event).expect("valid transition");
            records.extend(outcome.audit);
            state = outcome.to;
        }

        assert_eq!(state, GatewayState::Delivered);
        assert_eq!(
            records,
            vec![
                AuditEventKind::AuthAttempted,
                AuditEventKind::PolicyEvaluated,
                AuditEventKind::BackendsFetched,
                AuditEventKind::Filtered,
                AuditEventKind::Delivered,
            ]
        );
    }

    #[test]
    fn denials_are_terminal_and_audited_once() {
        let flow = GatewayFlow;
        let denied = flow
            .apply(&GatewayState::IdentityVerified, &GatewayEvent::PolicyDenied)
            .expect("policy denial");
        assert_eq!(denied.to, GatewayState::Denied);
        assert_eq!(denied.audit, Some(AuditEventKind::Denied));

        let after = flow.apply(&GatewayState::Denied, &GatewayEvent::Aborted);
        assert!(matches!(after, Err(TransitionError::InvalidTransition { .. })));
    }

    #[test]
    fn skipping_a_gate_is_rejected() {
        let flow = GatewayFlow;
        let result = flow.apply(&GatewayState::Received, &GatewayEvent::EnvelopeFiltered);
        assert_eq!(
            result,
            Err(TransitionError::InvalidTransition {
                state: GatewayState::Received,
                event: GatewayEvent::EnvelopeFiltered,
            })
        );
        let aborted = flow
            .apply(&GatewayState::BackendsFetched, &GatewayEvent::Aborted)
            .expect("abort");
        assert_eq!(aborted.to, GatewayState::Failed);
    }
}
