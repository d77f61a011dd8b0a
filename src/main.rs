// =============================================================================
// JetTrade — Main Entry Point
// =============================================================================
//
// Wires the engine together and hands every long-running task to the
// scheduler: the HTTP server, the intake -> pipeline consumer, one
// user-event stream per broker account, the token refresher, the reconciler,
// and the event-log subscriber. Ctrl+C drains everything with a bounded
// grace period.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod api;
mod app_state;
mod broker;
mod bus;
mod config;
mod directory;
mod error;
mod exits;
mod intake;
mod pipeline;
mod reconcile;
mod risk_gate;
mod scheduler;
mod store;
mod tracker;
mod types;

use std::sync::Arc;

use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::app_state::AppState;
use crate::config::EngineConfig;
use crate::directory::FileDirectory;
use crate::store::TradeStore;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("JetTrade execution engine starting");

    let mut config = EngineConfig::load("engine_config.json").unwrap_or_else(|e| {
        warn!(error = %e, "failed to load config, using defaults");
        EngineConfig::default()
    });
    config.apply_env_overrides();

    info!(
        bind_addr = %config.bind_addr,
        api_rpm_limit = config.api_rpm_limit,
        reconcile_interval_s = config.reconcile_interval_s,
        "engine configuration resolved"
    );

    // ── 2. Load collaborator directory & persistent store ────────────────
    let directory = Arc::new(FileDirectory::load(&config.directory_path).unwrap_or_else(|e| {
        warn!(error = %e, "directory missing — starting with no recorders");
        FileDirectory::empty(&config.directory_path)
    }));
    let store = Arc::new(TradeStore::open(&config.store_path)?);

    // ── 3. Build shared state ────────────────────────────────────────────
    let (state, pipeline_rx) = AppState::build(config.clone(), directory, store)?;

    // ── 4. Event-log subscriber ──────────────────────────────────────────
    state
        .scheduler
        .spawn("event-log", bus::run_log_subscriber(state.bus.clone()));

    // ── 5. Token refresher ───────────────────────────────────────────────
    state.scheduler.spawn(
        "token-refresher",
        broker::token::run_refresher(
            state.tokens.clone(),
            config.clone(),
            state.scheduler.shutdown_signal(),
        ),
    );

    // ── 6. Broker user-event streams, one per account ────────────────────
    let (stream_tx, mut stream_rx) = tokio::sync::mpsc::channel(1024);
    for account in state.directory.all_accounts() {
        let task_name = format!("user-stream-{}", account.id);
        state.scheduler.spawn(
            task_name,
            broker::ws::run_user_stream(
                account,
                state.tokens.clone(),
                config.clone(),
                stream_tx.clone(),
                state.scheduler.shutdown_signal(),
            ),
        );
    }
    drop(stream_tx);

    // Stream consumer: fills and order updates feed the pipeline.
    let stream_pipeline = state.pipeline.clone();
    state.scheduler.spawn("stream-consumer", async move {
        while let Some((account_id, event)) = stream_rx.recv().await {
            stream_pipeline.clone().handle_stream_event(account_id, event);
        }
    });

    // ── 7. Execution pipeline ────────────────────────────────────────────
    state.scheduler.spawn(
        "pipeline",
        state
            .pipeline
            .clone()
            .run(pipeline_rx, state.scheduler.shutdown_signal()),
    );

    // ── 8. Reconciler ────────────────────────────────────────────────────
    state.scheduler.spawn(
        "reconciler",
        state
            .reconciler
            .clone()
            .run(state.scheduler.shutdown_signal()),
    );

    // ── 9. HTTP server ───────────────────────────────────────────────────
    let app = api::rest::router(state.clone());
    let listener = tokio::net::TcpListener::bind(&config.bind_addr).await?;
    info!(addr = %config.bind_addr, "HTTP server listening");

    let mut server_shutdown = state.scheduler.shutdown_signal();
    state.scheduler.spawn("http-server", async move {
        let result = axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = server_shutdown.recv().await;
            })
            .await;
        if let Err(e) = result {
            error!(error = %e, "HTTP server failed");
        }
    });

    info!("all subsystems running — Ctrl+C to stop");

    // ── 10. Graceful shutdown ────────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    warn!("shutdown signal received — stopping gracefully");
    state.scheduler.shutdown().await;
    info!("JetTrade shut down complete");
    Ok(())
}
