//! # routes::market
//!
//! Market-context feed boundary. The collaborator that computes sentiment,
//! trend and dominance pushes snapshots here; the decision engine only reads.

use axum::{extract::State, response::IntoResponse, Json};
use serde_json::json;
use tracing::info;

use crate::{error::AppError, models::MarketContext, state::SharedState};

/// POST /api/market/context
pub async fn publish_context(
    State(state): State<SharedState>,
    Json(context): Json<MarketContext>,
) -> Result<impl IntoResponse, AppError> {
    if !(0.0..=100.0).contains(&context.sentiment_index) {
        return Err(AppError::BadRequest(format!(
            "sentiment_index must be within 0..=100, got {}",
            context.sentiment_index
        )));
    }
    if !(0.0..=100.0).contains(&context.dominant_share_pct) {
        return Err(AppError::BadRequest(format!(
            "dominant_share_pct must be within 0..=100, got {}",
            context.dominant_share_pct
        )));
    }

    info!(
        sentiment = context.sentiment_index,
        trend = ?context.trend,
        dominance = context.dominant_share_pct,
        "🌐 Market context updated"
    );
    state.market.publish(context).await;
    Ok(Json(json!({ "ok": true })))
}

/// GET /api/market/context
pub async fn get_context(State(state): State<SharedState>) -> impl IntoResponse {
    let context = state.market.snapshot().await;
    Json(json!({ "ok": true, "context": context }))
}
