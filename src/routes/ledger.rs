//! # routes::ledger
//!
//! Payment collaborator boundary: a confirmed recharge arrives here and is
//! applied to outstanding debt before it reaches the balance.

use axum::{extract::State, response::IntoResponse, Json};
use serde::Deserialize;
use serde_json::json;
use uuid::Uuid;

use crate::{error::AppError, state::SharedState};

#[derive(Debug, Deserialize)]
pub struct TopUpBody {
    pub account_id: Uuid,
    pub amount: f64,
    pub currency: String,
}

/// POST /api/ledger/topup
pub async fn top_up(
    State(state): State<SharedState>,
    Json(body): Json<TopUpBody>,
) -> Result<impl IntoResponse, AppError> {
    let receipt = state.ledger.top_up(body.account_id, body.amount, &body.currency).await?;
    Ok(Json(json!({ "ok": true, "receipt": receipt })))
}
