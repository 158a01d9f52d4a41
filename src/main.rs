use std::sync::Arc;

use anyhow::Context;

use compliance_advisor::channels::WhatsAppChannel;
use compliance_advisor::config::AppConfig;
use compliance_advisor::dispatcher;
use compliance_advisor::metrics::init_prometheus;
use compliance_advisor::session::spawn_sweep_task;
use compliance_advisor::state::{AppState, spawn_maintenance_task};
use compliance_advisor::store::{Database, LibSqlBackend};
use compliance_advisor::webhook;
use compliance_advisor::workflow::OrchestrateClient;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let config = AppConfig::from_env().context("loading configuration")?;
    let port = config.port;

    eprintln!("📋 Compliance Advisor v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Webhook: http://0.0.0.0:{}/webhook/whatsapp", port);
    eprintln!("   Database: {}", config.database_path.display());

    // ── Database ─────────────────────────────────────────────────────────
    if let Some(parent) = config.database_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating {}", parent.display()))?;
    }
    let db: Arc<dyn Database> = Arc::new(
        LibSqlBackend::new_local(&config.database_path)
            .await
            .with_context(|| format!("opening database at {}", config.database_path.display()))?,
    );

    // ── Components ───────────────────────────────────────────────────────
    let stage_client = Arc::new(OrchestrateClient::new(config.orchestrate.clone()));
    let channel = Arc::new(WhatsAppChannel::new(config.whatsapp.clone()));
    let (state, rx) = AppState::new(config, stage_client, channel, Some(db), init_prometheus());

    let sweep_handle = spawn_sweep_task(Arc::clone(&state.sessions));
    let maintenance_handle = spawn_maintenance_task(state.clone());
    let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
    let dispatcher_handle = dispatcher::spawn(state.clone(), rx, async {
        stop_rx.await.ok();
    });

    // ── HTTP server ──────────────────────────────────────────────────────
    let app = webhook::router(state.clone());
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port))
        .await
        .with_context(|| format!("binding port {port}"))?;
    tracing::info!(port, "HTTP server started");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("HTTP server failed")?;

    // ── Shutdown ─────────────────────────────────────────────────────────
    sweep_handle.abort();
    maintenance_handle.abort();
    stop_tx.send(()).ok();
    if let Err(e) = dispatcher_handle.await {
        tracing::warn!(error = %e, "Dispatcher task ended abnormally");
    }
    state.shutdown().await;
    tracing::info!("Shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %e, "Failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}
