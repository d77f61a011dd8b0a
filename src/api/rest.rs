// =============================================================================
// HTTP surface — webhook intake and admin control endpoints
// =============================================================================
//
// Public:  POST /webhook/{token}   (the token IS the credential)
//          GET  /health
// Admin:   POST /internal/reconcile
//          POST /internal/kill/{trader_id}/{ticker}
//
// The webhook always answers promptly; trading outcomes surface on the event
// stream, never in this response.
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};

use crate::api::auth::AdminBearer;
use crate::app_state::AppState;
use crate::exits::ExitContext;
use crate::intake::WebhookReply;
use crate::types::{ExitReason, PositionKey, Side};

/// Build the full router with CORS middleware and shared state.
pub fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        // ── Public ──────────────────────────────────────────────────
        .route("/health", get(health))
        .route("/webhook/{token}", post(webhook))
        // ── Admin ───────────────────────────────────────────────────
        .route("/internal/reconcile", post(force_reconcile))
        .route("/internal/kill/{trader_id}/{ticker}", post(kill_switch))
        // ── Middleware & State ──────────────────────────────────────
        .layer(cors)
        .with_state(state)
}

// =============================================================================
// Health (public)
// =============================================================================

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    uptime_s: u64,
    open_positions: usize,
    server_time: i64,
}

async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok",
        uptime_s: state.start_time.elapsed().as_secs(),
        open_positions: state.tracker.open_positions().len(),
        server_time: chrono::Utc::now().timestamp_millis(),
    })
}

// =============================================================================
// Webhook (public; the path token authenticates)
// =============================================================================

async fn webhook(
    State(state): State<Arc<AppState>>,
    Path(token): Path<String>,
    body: String,
) -> impl IntoResponse {
    let reply = state.intake.handle_webhook(&token, &body).await;
    match reply {
        WebhookReply::Accepted { signal_id } => (
            StatusCode::OK,
            Json(serde_json::json!({ "status": "accepted", "signal_id": signal_id })),
        ),
        WebhookReply::Duplicate => (
            StatusCode::OK,
            Json(serde_json::json!({ "status": "duplicate" })),
        ),
        WebhookReply::Rejected { kind, reason } => (
            StatusCode::OK,
            Json(serde_json::json!({ "status": "rejected", "kind": kind, "reason": reason })),
        ),
        WebhookReply::InvalidToken => (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({ "error": "invalid-token" })),
        ),
        WebhookReply::Unparseable { reason } => (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({ "error": "unparseable", "reason": reason })),
        ),
    }
}

// =============================================================================
// Control endpoints (admin)
// =============================================================================

async fn force_reconcile(
    _auth: AdminBearer,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    info!("reconcile sweep forced via API");
    state.reconciler.clone().sweep_open_positions();
    Json(serde_json::json!({ "status": "sweep_queued" }))
}

async fn kill_switch(
    _auth: AdminBearer,
    State(state): State<Arc<AppState>>,
    Path((trader_id, ticker)): Path<(String, String)>,
) -> Result<impl IntoResponse, (StatusCode, Json<serde_json::Value>)> {
    let Some(trader) = state.directory.trader_by_id(&trader_id) else {
        return Err((
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({ "error": format!("unknown trader '{trader_id}'") })),
        ));
    };
    let Some(account) = state.directory.account(&trader.account_id) else {
        return Err((
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({ "error": "trader's account not found" })),
        ));
    };

    let key = PositionKey::new(trader.recorder_id.clone(), ticker.clone());
    let (side, qty) = state
        .tracker
        .get(&key)
        .map(|p| (p.side, p.total_qty))
        .unwrap_or((Side::Flat, 0.0));

    warn!(trader_id = %trader_id, ticker = %ticker, "kill switch triggered via API");

    let ctx = ExitContext {
        trader_id,
        account,
        recorder_id: trader.recorder_id,
        ticker,
        side,
        qty,
        reason: ExitReason::KillSwitch,
    };
    let exits = state.exits.clone();
    state.serializer.submit(key, async move {
        let _ = exits.kill(&ctx).await;
    });

    Ok(Json(serde_json::json!({ "status": "kill_queued" })))
}
