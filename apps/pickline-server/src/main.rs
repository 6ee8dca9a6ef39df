use anyhow::{Context, Result};
use clap::Parser;
use metrics_exporter_prometheus::PrometheusHandle;
use pickline_server::{
    build_router,
    collaborators::Collaborators,
    pairing::{build_pairing_store, PairingService},
    telemetry::Telemetry,
    AppState, Cli, ServerConfig,
};
use tokio::signal;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = ServerConfig::try_from(cli)?;
    let telemetry = Telemetry::init(&config.log_filter)?;

    info!(
        listen_addr = %config.listen_addr,
        redis = config.redis_url.is_some(),
        pairing_ttl_secs = config.pairing_ttl.as_secs(),
        "starting pickline-server"
    );

    run(config, telemetry.metrics_handle()).await
}

async fn run(config: ServerConfig, metrics: PrometheusHandle) -> Result<()> {
    let pairing_store = build_pairing_store(config.redis_url.as_deref()).await;
    let pairing = PairingService::new(
        pairing_store,
        config.pairing_ttl,
        config.public_base_url.clone(),
    );
    let collaborators = Collaborators::build(&config)?;
    let state = AppState::with_retention(
        pairing,
        collaborators,
        Some(metrics),
        config.session_retention,
    );
    let router = build_router(state);

    let listener = tokio::net::TcpListener::bind(config.listen_addr)
        .await
        .context("failed to bind listener")?;
    info!("pickline-server listening on {}", config.listen_addr);

    let graceful = axum::serve(listener, router).with_graceful_shutdown(shutdown_signal());
    graceful.await.context("server shutdown with error")?;

    info!(
        grace_seconds = config.shutdown_grace.as_secs(),
        "shutdown signal received; sleeping for graceful period"
    );
    tokio::time::sleep(config.shutdown_grace).await;
    info!("graceful shutdown complete");

    Ok(())
}

async fn shutdown_signal() {
    let _ = signal::ctrl_c().await;
}
