//! # routes::monitor
//!
//! ## Endpoints
//!
//! | Method    | Path                                   | Description                          |
//! |-----------|----------------------------------------|--------------------------------------|
//! | GET (WS)  | `/ws/monitor`                          | real-time notification stream        |
//! | GET       | `/api/monitor/classifier`              | gating counters                      |
//! | GET       | `/api/monitor/positions`               | every open position                  |
//! | GET       | `/api/monitor/executions/:signal_id`   | signal + its execution records       |
//! | GET       | `/health`                              | liveness, uptime                     |

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    response::IntoResponse,
    Json,
};
use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use tracing::{debug, info};
use uuid::Uuid;

use crate::{error::AppError, state::SharedState};

// ─── WebSocket Handler ────────────────────────────────────────────────────────

/// Upgrade to WebSocket and forward every [`crate::events::Notification`]
/// as a JSON text frame.
pub async fn ws_monitor(
    ws: WebSocketUpgrade,
    State(state): State<SharedState>,
) -> impl IntoResponse {
    ws.on_upgrade(|socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: SharedState) {
    let mut rx = state.notifier.subscribe();
    let (mut sender, mut receiver) = socket.split();

    info!("🔌 WebSocket client connected");

    // ── Snapshot on connect ───────────────────────────────────────────────────
    let snapshot = {
        let stats = state.pipeline.classifier().metrics();
        let open = state.store.list_open_positions().await.map(|p| p.len()).unwrap_or_default();
        let context = state.market.snapshot().await;

        json!({
            "event":          "SNAPSHOT",
            "classifier":     stats,
            "open_positions": open,
            "market_context": context,
        })
        .to_string()
    };

    if sender.send(Message::Text(snapshot.into())).await.is_err() {
        return;
    }

    // ── Event Loop ────────────────────────────────────────────────────────────
    loop {
        tokio::select! {
            result = rx.recv() => {
                match result {
                    Ok(json_str) => {
                        if sender.send(Message::Text(json_str.into())).await.is_err() {
                            break;
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        debug!("WS client lagged, skipped {n} events");
                    }
                    Err(_) => break,
                }
            }

            result = receiver.next() => {
                match result {
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(Message::Ping(data))) => {
                        let _ = sender.send(Message::Pong(data)).await;
                    }
                    _ => {}
                }
            }
        }
    }

    info!("🔌 WebSocket client disconnected");
}

// ─── REST Monitoring Endpoints ────────────────────────────────────────────────

/// GET /api/monitor/classifier
pub async fn get_classifier_stats(State(state): State<SharedState>) -> impl IntoResponse {
    let stats = state.pipeline.classifier().metrics();
    Json(json!({ "ok": true, "classifier": stats }))
}

/// GET /api/monitor/positions
pub async fn get_open_positions(
    State(state): State<SharedState>,
) -> Result<impl IntoResponse, AppError> {
    let positions = state.store.list_open_positions().await?;
    Ok(Json(json!({
        "ok":        true,
        "count":     positions.len(),
        "positions": positions,
    })))
}

/// GET /api/monitor/executions/:signal_id
pub async fn get_executions(
    State(state): State<SharedState>,
    Path(signal_id): Path<Uuid>,
) -> Result<impl IntoResponse, AppError> {
    let signal = state
        .store
        .get_signal(signal_id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("signal {signal_id}")))?;
    let records = state.store.executions_for_signal(signal_id).await?;
    Ok(Json(json!({
        "ok":      true,
        "signal":  signal,
        "count":   records.len(),
        "records": records,
    })))
}

/// GET /health
pub async fn health_check(State(state): State<SharedState>) -> impl IntoResponse {
    let uptime = (Utc::now() - state.started_at).num_seconds();
    Json(json!({
        "ok":          true,
        "service":     "signal-relay",
        "uptime_secs": uptime,
    }))
}
