//! HTTP surface: agent context requests, plus operator routes for audit access
//! and governance changes behind the admin bearer token.

use std::sync::Arc;

use axum::{
    extract::{Query, Request, State},
    http::{header::AUTHORIZATION, StatusCode},
    middleware::{self, Next},
    response::Response,
    routing::{get, post},
    Json, Router,
};
use gatehouse_core::audit::{AuditEventKind, AuditOutcome, AuditPayload, ChainVerification};
use gatehouse_core::config::LoadOptions;
use gatehouse_core::digest::sha256_hex;
use gatehouse_core::{
    AgentId, AuditError, AuditRecord, ContextEnvelope, ContextRequest, EnvelopeStatus, Gateway,
};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::bootstrap::{reload_governance, ReloadError};

/// Largest span `GET /v1/audit/events` returns in one response.
pub const MAX_AUDIT_RANGE: u64 = 500;

const OPERATOR: &str = "operator";

#[derive(Clone)]
pub struct ApiState {
    gateway: Arc<Gateway>,
    reload_options: Arc<LoadOptions>,
    admin_token: Option<SecretString>,
}

impl ApiState {
    pub fn new(
        gateway: Arc<Gateway>,
        reload_options: LoadOptions,
        admin_token: Option<SecretString>,
    ) -> Self {
        Self { gateway, reload_options: Arc::new(reload_options), admin_token }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiError {
    pub code: String,
    pub message: String,
}

type ApiResult<T> = Result<Json<T>, (StatusCode, Json<ApiError>)>;

fn api_error(
    status: StatusCode,
    code: &str,
    message: impl Into<String>,
) -> (StatusCode, Json<ApiError>) {
    (status, Json(ApiError { code: code.to_owned(), message: message.into() }))
}

pub fn router(state: ApiState) -> Router {
    let mut router = Router::new().route("/v1/context", post(request_context));

    // Audit payloads name backends, roles and other agents: operator-only.
    if state.admin_token.is_some() {
        let admin = Router::new()
            .route("/v1/audit/verify", get(verify_audit))
            .route("/v1/audit/events", get(audit_events))
            .route("/v1/admin/revocations", post(revoke_agent))
            .route("/v1/admin/policy/reload", post(reload_policy))
            .route("/v1/admin/audit/reopen", post(reopen_audit))
            .route("/v1/admin/audit/compensations", post(compensate_record))
            .route_layer(middleware::from_fn_with_state(state.clone(), require_admin));
        router = router.merge(admin);
    }

    router.with_state(state)
}

/// HTTP status for an envelope. Only the stable reason code is consulted.
pub fn status_for(envelope: &ContextEnvelope) -> StatusCode {
    let code = envelope.reason.as_ref().map(|reason| reason.code.as_str()).unwrap_or_default();
    match envelope.status {
        EnvelopeStatus::Delivered => StatusCode::OK,
        EnvelopeStatus::Denied if code == "admission.rate_limited" => StatusCode::TOO_MANY_REQUESTS,
        EnvelopeStatus::Denied => StatusCode::FORBIDDEN,
        EnvelopeStatus::Failed => match code {
            "backend.timeout" => StatusCode::GATEWAY_TIMEOUT,
            "backend.unavailable" => StatusCode::BAD_GATEWAY,
            "audit.unavailable" => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        },
    }
}

async fn request_context(
    State(state): State<ApiState>,
    Json(request): Json<ContextRequest>,
) -> (StatusCode, Json<ContextEnvelope>) {
    let envelope = state.gateway.handle(request).await;
    (status_for(&envelope), Json(envelope))
}

async fn verify_audit(State(state): State<ApiState>) -> ApiResult<ChainVerification> {
    state.gateway.audit().verify_chain().await.map(Json).map_err(audit_failure)
}

#[derive(Debug, Deserialize)]
pub struct RangeQuery {
    pub from: u64,
    pub to: Option<u64>,
}

async fn audit_events(
    State(state): State<ApiState>,
    Query(query): Query<RangeQuery>,
) -> ApiResult<Vec<AuditRecord>> {
    if query.from == 0 {
        return Err(api_error(StatusCode::BAD_REQUEST, "audit.invalid_range", "`from` starts at 1"));
    }
    let ceiling = query.from.saturating_add(MAX_AUDIT_RANGE - 1);
    let to = query.to.unwrap_or(ceiling);
    if to < query.from {
        return Err(api_error(
            StatusCode::BAD_REQUEST,
            "audit.invalid_range",
            "`to` must not be smaller than `from`",
        ));
    }

    state.gateway.audit().range(query.from, to.min(ceiling)).await.map(Json).map_err(audit_failure)
}

async fn require_admin(
    State(state): State<ApiState>,
    request: Request,
    next: Next,
) -> Result<Response, (StatusCode, Json<ApiError>)> {
    let presented = request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "));

    let authorized = match (presented, &state.admin_token) {
        // Digests are compared so the match time does not depend on the token prefix.
        (Some(presented), Some(expected)) => {
            sha256_hex(presented.as_bytes()) == sha256_hex(expected.expose_secret().as_bytes())
        }
        _ => false,
    };

    if !authorized {
        warn!(
            event_name = "admin.request.unauthorized",
            correlation_id = "admin",
            path = %request.uri().path(),
            "admin request rejected"
        );
        return Err(api_error(
            StatusCode::UNAUTHORIZED,
            "admin.unauthorized",
            "a valid admin bearer token is required",
        ));
    }
    Ok(next.run(request).await)
}

#[derive(Debug, Deserialize)]
pub struct RevocationRequest {
    pub agent_id: String,
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevocationResponse {
    pub agent_id: String,
    pub newly_revoked: bool,
    pub audit_sequence: u64,
}

async fn revoke_agent(
    State(state): State<ApiState>,
    Json(body): Json<RevocationRequest>,
) -> ApiResult<RevocationResponse> {
    let agent_id = AgentId(body.agent_id.trim().to_owned());
    if agent_id.0.is_empty() {
        return Err(api_error(
            StatusCode::BAD_REQUEST,
            "admin.invalid_agent",
            "agent_id is required",
        ));
    }

    // Revocation takes effect before it is recorded; a failed append must not
    // leave the agent active.
    let newly_revoked = state.gateway.verifier().revoke(&agent_id);
    info!(
        event_name = "admin.agent.revoked",
        correlation_id = "admin",
        agent_id = %agent_id,
        newly_revoked,
        "agent revoked"
    );

    let mut payload = admin_payload("revoke_agent").with_metadata("agent_id", agent_id.as_str());
    if let Some(reason) = body.reason {
        payload = payload.with_metadata("reason", reason);
    }
    let record = state.gateway.audit().append(payload).await.map_err(audit_failure)?;

    Ok(Json(RevocationResponse {
        agent_id: agent_id.0,
        newly_revoked,
        audit_sequence: record.sequence,
    }))
}

#[derive(Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReloadResponse {
    pub policy_version: u64,
    pub grants: usize,
    pub audit_sequence: u64,
}

async fn reload_policy(State(state): State<ApiState>) -> ApiResult<ReloadResponse> {
    let policy_version =
        reload_governance(&state.gateway, &state.reload_options).map_err(|error| {
            warn!(
                event_name = "admin.policy.reload_rejected",
                correlation_id = "admin",
                error = %error,
                "policy reload rejected; previous tables stay active"
            );
            let code = match error {
                ReloadError::BackendsChanged(_) => "admin.backends_changed",
                ReloadError::Config(_) | ReloadError::Governance(_) => "admin.invalid_governance",
            };
            api_error(StatusCode::UNPROCESSABLE_ENTITY, code, error.to_string())
        })?;
    let grants = state.gateway.policy().snapshot().grant_count();

    let record = state
        .gateway
        .audit()
        .append(
            admin_payload("reload_policy")
                .with_metadata("policy_version", policy_version.to_string()),
        )
        .await
        .map_err(audit_failure)?;

    Ok(Json(ReloadResponse { policy_version, grants, audit_sequence: record.sequence }))
}

async fn reopen_audit(State(state): State<ApiState>) -> ApiResult<ChainVerification> {
    let verification = state.gateway.audit().reopen().await.map_err(audit_failure)?;
    if !verification.valid {
        error!(
            event_name = "admin.audit.reopen_refused",
            correlation_id = "admin",
            reason = verification.failure_reason.as_deref().unwrap_or("unknown"),
            "audit chain still fails verification; log stays sealed"
        );
    }
    Ok(Json(verification))
}

#[derive(Debug, Deserialize)]
pub struct CompensationRequest {
    pub sequence: u64,
    pub reason: String,
}

async fn compensate_record(
    State(state): State<ApiState>,
    Json(body): Json<CompensationRequest>,
) -> Result<(StatusCode, Json<AuditRecord>), (StatusCode, Json<ApiError>)> {
    if body.reason.trim().is_empty() {
        return Err(api_error(
            StatusCode::BAD_REQUEST,
            "admin.invalid_compensation",
            "a reason is required",
        ));
    }
    let record = state
        .gateway
        .audit()
        .compensate(body.sequence, OPERATOR, body.reason)
        .await
        .map_err(audit_failure)?;
    Ok((StatusCode::CREATED, Json(record)))
}

fn admin_payload(operation: &str) -> AuditPayload {
    AuditPayload::new(
        AuditEventKind::Administrative,
        format!("admin-{}", Uuid::new_v4()),
        OPERATOR,
        AuditOutcome::Success,
    )
    .with_metadata("operation", operation)
}

fn audit_failure(error: AuditError) -> (StatusCode, Json<ApiError>) {
    match error {
        AuditError::UnknownSequence(sequence) => api_error(
            StatusCode::NOT_FOUND,
            "audit.unknown_sequence",
            format!("no audit record with sequence {sequence}"),
        ),
        other => {
            error!(
                event_name = "audit.request.failed",
                correlation_id = "api",
                error = %other,
                "audit operation failed"
            );
            api_error(
                StatusCode::SERVICE_UNAVAILABLE,
                "audit.unavailable",
                "The audit log is not available right now. Please retry later.",
            )
        }
    }
}
