//! # routes::signals
//!
//! Inbound alert ingress.
//!
//! | Method | Path                    | Description                          |
//! |--------|-------------------------|--------------------------------------|
//! | POST   | `/api/signals/webhook`  | raw JSON alert → full pipeline       |
//!
//! Charting platforms often post JSON as `text/plain`, so the body is read
//! as bytes and parsed here rather than through the `Json` extractor.

use axum::{
    body::Bytes,
    extract::{Query, State},
    response::IntoResponse,
    Json,
};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::{error::AppError, state::SharedState};

#[derive(Debug, Deserialize)]
pub struct WebhookQuery {
    /// Alert source tag stored on the signal, e.g. `tradingview`.
    pub source: Option<String>,
}

/// POST /api/signals/webhook
pub async fn receive_signal(
    State(state): State<SharedState>,
    Query(query): Query<WebhookQuery>,
    body: Bytes,
) -> Result<impl IntoResponse, AppError> {
    let raw: Value = serde_json::from_slice(&body)
        .map_err(|e| AppError::BadRequest(format!("payload is not JSON: {e}")))?;
    if !raw.is_object() {
        return Err(AppError::BadRequest("payload must be a JSON object".into()));
    }

    let source = query.source.as_deref().unwrap_or("webhook");
    let outcome = state.pipeline.process(source, raw).await?;

    Ok(Json(json!({
        "ok":      true,
        "outcome": outcome,
    })))
}
