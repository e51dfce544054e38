use std::sync::Arc;

use gatehouse_core::audit::{AuditError, AuditLog, AuditLogOptions, AuditSigner, AuditStore};
use gatehouse_core::config::{AppConfig, ConfigError, LoadOptions};
use gatehouse_core::governance::{CompiledGovernance, GovernanceError};
use gatehouse_core::identity::IdentityVerifier;
use gatehouse_core::policy::PolicyEngine;
use gatehouse_core::{BackendRegistry, Gateway};
use gatehouse_db::{connect_with_config, migrations, DbPool, SqlAuditStore};
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::info;

use crate::backends::registry_from_config;

pub struct Application {
    pub config: AppConfig,
    pub db_pool: DbPool,
    pub gateway: Arc<Gateway>,
    pub audit_writer: JoinHandle<()>,
}

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error("governance tables are invalid: {0}")]
    Governance(#[from] GovernanceError),
    #[error("database connection failed: {0}")]
    DatabaseConnect(#[source] sqlx::Error),
    #[error("database migration failed: {0}")]
    Migration(#[source] sqlx::migrate::MigrateError),
    #[error("audit log could not be opened: {0}")]
    Audit(#[from] AuditError),
    #[error("backend client could not be built: {0}")]
    Backends(#[source] reqwest::Error),
}

#[derive(Debug, Error)]
pub enum ReloadError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("governance tables are invalid: {0}")]
    Governance(#[from] GovernanceError),
    #[error("backend set changed; restart required to register: {0:?}")]
    BackendsChanged(Vec<String>),
}

pub async fn bootstrap_with_config(config: AppConfig) -> Result<Application, BootstrapError> {
    info!(
        event_name = "system.bootstrap.start",
        correlation_id = "bootstrap",
        backends = config.backends.len(),
        "starting gateway bootstrap"
    );

    let db_pool =
        connect_with_config(&config.database).await.map_err(BootstrapError::DatabaseConnect)?;
    info!(
        event_name = "system.bootstrap.database_connected",
        correlation_id = "bootstrap",
        "database connection established"
    );

    migrations::run_pending(&db_pool).await.map_err(BootstrapError::Migration)?;
    info!(
        event_name = "system.bootstrap.migrations_applied",
        correlation_id = "bootstrap",
        "database migrations applied"
    );

    let backends = registry_from_config(&config.backends).map_err(BootstrapError::Backends)?;
    let store: Arc<dyn AuditStore> = Arc::new(SqlAuditStore::new(db_pool.clone()));
    let (gateway, audit_writer) = assemble_gateway(&config, store, backends).await?;

    Ok(Application { config, db_pool, gateway: Arc::new(gateway), audit_writer })
}

/// Compiles governance, opens the audit log over `store` and wires the
/// coordinator. Separate from [`bootstrap_with_config`] so callers can supply
/// their own store and backends.
pub async fn assemble_gateway(
    config: &AppConfig,
    store: Arc<dyn AuditStore>,
    backends: BackendRegistry,
) -> Result<(Gateway, JoinHandle<()>), BootstrapError> {
    let CompiledGovernance { directory, table } = config.compile_governance()?;
    let grants = table.grant_count();

    let signer = AuditSigner::new(config.audit.signing_key.clone());
    let (audit, writer) =
        AuditLog::open(store, signer, AuditLogOptions::from(&config.audit)).await?;

    let verifier = Arc::new(IdentityVerifier::new(directory, &config.identity));
    let policy = Arc::new(PolicyEngine::new(table));
    let gateway =
        Gateway::new(verifier, policy, backends, audit, &config.gateway, &config.orchestrator);

    info!(
        event_name = "system.bootstrap.gateway_ready",
        correlation_id = "bootstrap",
        grants,
        audit_sealed = gateway.audit().is_sealed(),
        "gateway assembled"
    );
    Ok((gateway, writer))
}

/// Re-reads governance from `options` and swaps the identity directory and
/// policy table in place. Returns the new policy version.
pub fn reload_governance(gateway: &Gateway, options: &LoadOptions) -> Result<u64, ReloadError> {
    let config = AppConfig::load(options.clone())?;

    let registered = gateway.backends().ids();
    let unregistered: Vec<String> = config
        .backend_ids()
        .into_iter()
        .filter(|id| !registered.contains(id))
        .map(|id| id.0)
        .collect();
    if !unregistered.is_empty() {
        return Err(ReloadError::BackendsChanged(unregistered));
    }

    let CompiledGovernance { directory, table } = config.compile_governance()?;
    Ok(gateway.replace_governance(directory, table))
}

#[cfg(test)]
mod tests {
    use gatehouse_core::config::{AppConfig, ConfigOverrides, LoadOptions};

    use crate::bootstrap::{bootstrap_with_config, BootstrapError};

    const SIGNING_KEY: &str = "bootstrap-audit-signing-key-0123456789";

    fn config(database_url: &str) -> AppConfig {
        AppConfig::load(LoadOptions {
            overrides: ConfigOverrides {
                database_url: Some(database_url.to_string()),
                audit_signing_key: Some(SIGNING_KEY.to_string()),
                ..ConfigOverrides::default()
            },
            ..LoadOptions::default()
        })
        .expect("config should load with valid overrides")
    }

    #[tokio::test]
    async fn bootstrap_fails_when_database_is_unreachable() {
        let result =
            bootstrap_with_config(config("sqlite:///gatehouse-missing-dir/nested/audit.db")).await;

        assert!(matches!(result, Err(BootstrapError::DatabaseConnect(_))));
    }

    #[tokio::test]
    async fn bootstrap_migrates_and_opens_unsealed_log() {
        let app = bootstrap_with_config(config("sqlite::memory:"))
            .await
            .expect("bootstrap should succeed with valid overrides");

        let (table_count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = 'audit_record'",
        )
        .fetch_one(&app.db_pool)
        .await
        .expect("audit table should exist after bootstrap");
        assert_eq!(table_count, 1);

        assert!(!app.gateway.audit().is_sealed());
        let verification = app.gateway.audit().verify_chain().await.expect("verify");
        assert!(verification.valid);
        assert_eq!(verification.verified_records, 0);

        app.db_pool.close().await;
    }
}
