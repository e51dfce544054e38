use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    audit::AuditError,
    domain::{
        backend::BackendId,
        envelope::{EnvelopeStatus, Rejection},
    },
    gateway::TransitionError,
};

#[derive(Clone, Copy, Debug, Error, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuthError {
    #[error("credential is invalid")]
    InvalidCredential,
    #[error("credential has expired")]
    Expired,
    #[error("agent has been revoked")]
    RevokedAgent,
}

impl AuthError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidCredential => "auth.invalid_credential",
            Self::Expired => "auth.expired",
            Self::RevokedAgent => "auth.revoked",
        }
    }
}

#[derive(Clone, Copy, Debug, Error, PartialEq, Eq, Serialize, Deserialize)]
pub enum PolicyDenial {
    #[error("identity is not scoped for the intent or resource")]
    ScopeViolation,
    #[error("resource is restricted by an enterprise override")]
    RestrictedResource,
    #[error("requested action is not permitted")]
    ActionNotPermitted,
    #[error("no policy covers the intent for this role")]
    PolicyNotFound,
}

impl PolicyDenial {
    pub fn code(&self) -> &'static str {
        match self {
            Self::ScopeViolation => "policy.scope_violation",
            Self::RestrictedResource => "policy.restricted_resource",
            Self::ActionNotPermitted => "policy.action_not_permitted",
            Self::PolicyNotFound => "policy.not_found",
        }
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum BackendError {
    #[error("backend `{backend}` timed out")]
    Timeout { backend: BackendId },
    #[error("backend `{backend}` unavailable: {message}")]
    Unavailable { backend: BackendId, message: String },
    #[error("required backends failed: {failed:?}")]
    PartialFailure { failed: Vec<BackendId> },
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum IntegrityError {
    #[error("audit chain mismatch at index {index} (sequence {sequence}): {reason}")]
    ChainMismatch { index: usize, sequence: u64, reason: String },
}

#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
pub enum AdmissionError {
    #[error("rate limit exceeded; retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },
}

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error(transparent)]
    Auth(#[from] AuthError),
    #[error(transparent)]
    Denied(#[from] PolicyDenial),
    #[error(transparent)]
    Admission(#[from] AdmissionError),
    #[error(transparent)]
    Backend(#[from] BackendError),
    #[error(transparent)]
    Integrity(#[from] IntegrityError),
    #[error(transparent)]
    Audit(#[from] AuditError),
    #[error(transparent)]
    Transition(#[from] TransitionError),
    #[error("gateway invariant violation: {0}")]
    Invariant(String),
}

impl GatewayError {
    pub fn status(&self) -> EnvelopeStatus {
        match self {
            Self::Auth(_) | Self::Denied(_) | Self::Admission(_) => EnvelopeStatus::Denied,
            _ => EnvelopeStatus::Failed,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            Self::Auth(error) => error.code(),
            Self::Denied(denial) => denial.code(),
            Self::Admission(AdmissionError::RateLimited { .. }) => "admission.rate_limited",
            Self::Backend(BackendError::Timeout { .. }) => "backend.timeout",
            Self::Backend(_) => "backend.unavailable",
            Self::Integrity(_) | Self::Audit(_) => "audit.unavailable",
            Self::Transition(_) | Self::Invariant(_) => "internal",
        }
    }

    /// Message safe to return to the caller. Never names backends, roles or
    /// policy rules.
    pub fn user_message(&self) -> String {
        match self {
            Self::Auth(AuthError::InvalidCredential) => {
                "The agent credential could not be verified. Obtain a fresh credential and retry."
                    .to_owned()
            }
            Self::Auth(AuthError::Expired) => {
                "The agent credential has expired. Obtain a fresh credential and retry.".to_owned()
            }
            Self::Auth(AuthError::RevokedAgent) => {
                "This agent may not use the gateway. Contact the platform operator.".to_owned()
            }
            Self::Denied(PolicyDenial::ScopeViolation) => {
                "The agent is not scoped for this intent or resource.".to_owned()
            }
            Self::Denied(PolicyDenial::RestrictedResource) => {
                "The requested resource is restricted.".to_owned()
            }
            Self::Denied(PolicyDenial::ActionNotPermitted) => {
                "The requested action is not permitted for this agent.".to_owned()
            }
            Self::Denied(PolicyDenial::PolicyNotFound) => {
                "No policy permits this intent for the agent.".to_owned()
            }
            Self::Admission(AdmissionError::RateLimited { retry_after_secs }) => {
                format!("Request rate limit exceeded. Retry after {retry_after_secs} seconds.")
            }
            Self::Backend(BackendError::Timeout { .. }) => {
                "Upstream data could not be retrieved in time. Please retry shortly.".to_owned()
            }
            Self::Backend(_) => {
                "Required upstream data is temporarily unavailable. Please retry shortly."
                    .to_owned()
            }
            Self::Integrity(_) | Self::Audit(_) => {
                "The gateway is not accepting requests right now. Please retry later.".to_owned()
            }
            Self::Transition(_) | Self::Invariant(_) => {
                "An unexpected internal error occurred.".to_owned()
            }
        }
    }

    pub fn rejection(&self) -> Rejection {
        Rejection { code: self.code().to_owned(), message: self.user_message() }
    }
}
