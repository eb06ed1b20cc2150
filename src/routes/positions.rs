//! # routes::positions
//!
//! | Method | Path                                      | Description                         |
//! |--------|-------------------------------------------|-------------------------------------|
//! | POST   | `/api/positions/mark`                     | market data pushes `{symbol, price}`|
//! | POST   | `/api/positions/reconcile/:account_id`    | close rows the venue no longer has  |

use axum::{
    extract::{Path, State},
    response::IntoResponse,
    Json,
};
use serde::Deserialize;
use serde_json::json;
use uuid::Uuid;

use crate::{error::AppError, state::SharedState};

#[derive(Debug, Deserialize)]
pub struct MarkBody {
    pub symbol: String,
    pub price: f64,
}

/// POST /api/positions/mark
pub async fn push_mark(
    State(state): State<SharedState>,
    Json(body): Json<MarkBody>,
) -> Result<impl IntoResponse, AppError> {
    if body.price <= 0.0 || !body.price.is_finite() {
        return Err(AppError::BadRequest(format!("price must be positive, got {}", body.price)));
    }
    let symbol = body.symbol.trim().to_uppercase();
    let updated = state.tracker.apply_mark(&symbol, body.price).await?;
    Ok(Json(json!({ "ok": true, "symbol": symbol, "updated": updated })))
}

/// POST /api/positions/reconcile/:account_id
pub async fn reconcile(
    State(state): State<SharedState>,
    Path(account_id): Path<Uuid>,
) -> Result<impl IntoResponse, AppError> {
    if state.store.get_account(account_id).await?.is_none() {
        return Err(AppError::NotFound(format!("account {account_id}")));
    }
    let report = state.tracker.reconcile_account(account_id).await?;
    Ok(Json(json!({ "ok": true, "report": report })))
}
