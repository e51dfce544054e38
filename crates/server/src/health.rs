use axum::{extract::State, http::StatusCode, routing::get, Json, Router};
use chrono::Utc;
use gatehouse_core::AuditLog;
use gatehouse_db::DbPool;
use serde::Serialize;

#[derive(Clone)]
pub struct HealthState {
    db_pool: DbPool,
    audit: AuditLog,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct HealthCheck {
    pub status: &'static str,
    pub detail: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub service: HealthCheck,
    pub database: HealthCheck,
    pub audit: HealthCheck,
    pub checked_at: String,
}

pub fn router(db_pool: DbPool, audit: AuditLog) -> Router {
    Router::new().route("/health", get(health)).with_state(HealthState { db_pool, audit })
}

pub async fn health(State(state): State<HealthState>) -> (StatusCode, Json<HealthResponse>) {
    let database = database_check(&state.db_pool).await;
    let audit = audit_check(&state.audit);
    let ready = database.status == "ready" && audit.status == "ready";

    let payload = HealthResponse {
        status: if ready { "ready" } else { "degraded" },
        service: HealthCheck {
            status: "ready",
            detail: "gatehouse-server runtime initialized".to_string(),
        },
        database,
        audit,
        checked_at: Utc::now().to_rfc3339(),
    };

    let status_code = if ready { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };
    (status_code, Json(payload))
}

async fn database_check(pool: &DbPool) -> HealthCheck {
    match sqlx::query_scalar::<_, i64>("SELECT 1").fetch_one(pool).await {
        Ok(_) => HealthCheck { status: "ready", detail: "database query succeeded".to_string() },
        Err(error) => {
            HealthCheck { status: "degraded", detail: format!("database query failed: {error}") }
        }
    }
}

fn audit_check(audit: &AuditLog) -> HealthCheck {
    if audit.is_sealed() {
        HealthCheck {
            status: "sealed",
            detail: "audit chain failed verification; requests are refused".to_string(),
        }
    } else {
        HealthCheck { status: "ready", detail: "audit chain verified".to_string() }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::{extract::State, http::StatusCode, Json};
    use gatehouse_core::audit::{AuditLogOptions, AuditSigner, AuditStore};
    use gatehouse_core::AuditLog;
    use gatehouse_db::{connect_with_settings, migrations, SqlAuditStore};
    use secrecy::SecretString;

    use crate::health::{health, HealthState};

    async fn state() -> HealthState {
        let pool =
            connect_with_settings("sqlite::memory:", 1, 5).await.expect("pool should connect");
        migrations::run_pending(&pool).await.expect("migrations");
        let store: Arc<dyn AuditStore> = Arc::new(SqlAuditStore::new(pool.clone()));
        let signer =
            AuditSigner::new(SecretString::from("health-audit-signing-key-0123456789".to_owned()));
        let (audit, _writer) =
            AuditLog::open(store, signer, AuditLogOptions::default()).await.expect("audit opens");
        HealthState { db_pool: pool, audit }
    }

    #[tokio::test]
    async fn health_returns_ready_when_database_and_audit_are_healthy() {
        let state = state().await;
        let pool = state.db_pool.clone();

        let (status, Json(payload)) = health(State(state)).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(payload.status, "ready");
        assert_eq!(payload.database.status, "ready");
        assert_eq!(payload.audit.status, "ready");
        assert_eq!(payload.service.status, "ready");

        pool.close().await;
    }

    #[tokio::test]
    async fn health_returns_service_unavailable_when_database_is_unavailable() {
        let state = state().await;
        state.db_pool.close().await;

        let (status, Json(payload)) = health(State(state)).await;

        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(payload.status, "degraded");
        assert_eq!(payload.database.status, "degraded");
        assert_eq!(payload.service.status, "ready");
    }
}
