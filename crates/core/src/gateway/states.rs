use serde::{Deserialize, Serialize};

use crate::audit::AuditEventKind;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum GatewayState {
    Received,
    IdentityVerified,
    PolicyEvaluated,
    BackendsFetched,
    Filtered,
    Audited,
    Delivered,
    Denied,
    Failed,
}

impl GatewayState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Delivered | Self::Denied | Self::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Received => "received",
            Self::IdentityVerified => "identity_verified",
            Self::PolicyEvaluated => "policy_evaluated",
            Self::BackendsFetched => "backends_fetched",
            Self::Filtered => "filtered",
            Self::Audited => "audited",
            Self::Delivered => "delivered",
            Self::Denied => "denied",
            Self::Failed => "failed",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum GatewayEvent {
    CredentialAccepted,
    CredentialRejected,
    AdmissionRefused,
    PolicyAllowed,
    PolicyDenied,
    BackendsSucceeded,
    BackendsFailed,
    EnvelopeFiltered,
    DeliveryRecorded,
    EnvelopeReleased,
    Aborted,
}

/// Result of one step. `audit` names the record the step must commit, if any.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransitionOutcome {
    pub from: GatewayState,
    pub to: GatewayState,
    pub event: GatewayEvent,
    pub audit: Option<AuditEventKind>,
}
