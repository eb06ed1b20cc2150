//! # error
//!
//! Centralised error types.
//!
//! HTTP handlers return `Result<_, AppError>`; Axum's `IntoResponse` impl
//! turns these into `{ "ok": false, "error": ... }` bodies so the webhook
//! sender and the collaborators always get a machine-readable response.
//! The domain errors below never cross an account boundary: a failure inside
//! one fan-out task ends up as a failed `ExecutionRecord`, not as an `Err`.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

// ─── HTTP surface ─────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum AppError {
    /// The request payload was syntactically correct but semantically invalid.
    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Not found: {0}")]
    NotFound(String),

    /// A pipeline stage failed and the signal was abandoned.
    #[error("Pipeline error: {0}")]
    Pipeline(#[from] PipelineError),

    #[error("Ledger error: {0}")]
    Ledger(#[from] LedgerError),

    #[error("Position error: {0}")]
    Tracker(#[from] TrackerError),

    /// Catch-all for unexpected failures.
    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl From<StoreError> for AppError {
    fn from(err: StoreError) -> Self {
        AppError::Internal(anyhow::Error::new(err))
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg.clone()),
            AppError::Pipeline(err) => (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()),
            AppError::Ledger(err @ LedgerError::UnknownAccount(_)) => {
                (StatusCode::NOT_FOUND, err.to_string())
            }
            AppError::Ledger(err @ LedgerError::Store(_)) => {
                (StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
            }
            AppError::Ledger(err) => (StatusCode::UNPROCESSABLE_ENTITY, err.to_string()),
            AppError::Tracker(err @ TrackerError::AlreadyClosed(_)) => {
                (StatusCode::CONFLICT, err.to_string())
            }
            AppError::Tracker(err) => (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()),
            AppError::Internal(err) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Internal error: {err}"),
            ),
        };

        let body = Json(json!({
            "ok":    false,
            "error": message,
        }));

        (status, body).into_response()
    }
}

// ─── Persistence ──────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum StoreError {
    /// A uniqueness rule was violated (open position key, signal/account pair).
    #[error("duplicate {0}")]
    Duplicate(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error("store backend failure: {0}")]
    Backend(#[from] anyhow::Error),
}

// ─── Decision Engine ──────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum DecisionError {
    #[error("judgment call timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("reasoning service unavailable: {0}")]
    Unavailable(String),

    #[error("reasoning service returned a malformed verdict: {0}")]
    Malformed(String),
}

// ─── Ledger ───────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("amount must be positive, got {0}")]
    NonPositiveAmount(f64),

    #[error("unknown account {0}")]
    UnknownAccount(uuid::Uuid),

    #[error("currency mismatch: account settles in {expected}, got {got}")]
    CurrencyMismatch { expected: String, got: String },

    #[error(transparent)]
    Store(#[from] StoreError),
}

// ─── Position Tracker ─────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum TrackerError {
    #[error("position {0} is already closed")]
    AlreadyClosed(uuid::Uuid),

    #[error(transparent)]
    Store(#[from] StoreError),

    /// Position closed, but the commission could not be settled.
    #[error("commission settlement failed: {0}")]
    Ledger(#[from] LedgerError),
}

// ─── Pipeline ─────────────────────────────────────────────────────────────────

/// Stage-level failures. These abort the signal; per-account failures never do.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("signal could not be persisted: {0}")]
    Ingest(#[source] StoreError),

    #[error("classification failed: {0}")]
    Classify(#[source] StoreError),

    #[error("eligibility resolution failed: {0}")]
    Resolve(#[source] StoreError),

    #[error("store failure: {0}")]
    Store(#[from] StoreError),
}
