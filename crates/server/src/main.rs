mod api;
mod backends;
mod bootstrap;
mod health;

use std::time::Duration;

use anyhow::Result;
use gatehouse_core::config::{AppConfig, LoadOptions};
use tracing_subscriber::EnvFilter;

fn init_logging(config: &AppConfig) {
    use gatehouse_core::config::LogFormat::*;

    let filter =
        EnvFilter::try_new(&config.logging.level).unwrap_or_else(|_| EnvFilter::new("info"));

    match config.logging.format {
        Compact => {
            tracing_subscriber::fmt().with_target(false).with_env_filter(filter).compact().init();
        }
        Pretty => {
            tracing_subscriber::fmt().with_target(false).with_env_filter(filter).pretty().init();
        }
        Json => {
            tracing_subscriber::fmt().with_target(false).with_env_filter(filter).json().init();
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    run().await
}

pub async fn run() -> Result<()> {
    let options = LoadOptions::default();
    let config = AppConfig::load(options.clone())?;
    init_logging(&config);

    let app = bootstrap::bootstrap_with_config(config).await?;
    let address = format!("{}:{}", app.config.server.bind_address, app.config.server.port);
    let shutdown_grace = Duration::from_secs(app.config.server.graceful_shutdown_secs);

    let router = api::router(api::ApiState::new(
        app.gateway.clone(),
        options,
        app.config.server.admin_token.clone(),
    ))
    .merge(health::router(app.db_pool.clone(), app.gateway.audit().clone()));

    let listener = tokio::net::TcpListener::bind(&address).await?;
    tracing::info!(
        event_name = "system.server.started",
        correlation_id = "bootstrap",
        bind_address = %address,
        admin_routes = app.config.server.admin_token.is_some(),
        audit_sealed = app.gateway.audit().is_sealed(),
        "gatehouse-server listening"
    );

    axum::serve(listener, router).with_graceful_shutdown(wait_for_shutdown()).await?;
    tracing::info!(
        event_name = "system.server.stopping",
        correlation_id = "shutdown",
        "gatehouse-server stopping"
    );

    // The writer drains queued appends once every handle to the log is gone.
    drop(app.gateway);
    if tokio::time::timeout(shutdown_grace, app.audit_writer).await.is_err() {
        tracing::warn!(
            event_name = "system.server.audit_drain_timeout",
            correlation_id = "shutdown",
            grace_secs = shutdown_grace.as_secs(),
            "audit writer did not drain before the shutdown grace period"
        );
    }
    app.db_pool.close().await;

    Ok(())
}

async fn wait_for_shutdown() {
    if let Err(error) = tokio::signal::ctrl_c().await {
        tracing::error!(
            event_name = "system.server.signal_error",
            correlation_id = "shutdown",
            error = %error,
            "could not listen for shutdown signal"
        );
        std::future::pending::<()>().await;
    }
}
