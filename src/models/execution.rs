//! # models::execution
//!
//! [`OrderParams`] computed per account and the append-only
//! [`ExecutionRecord`] written for every dispatch attempt, success or not.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::{Side, Venue};

/// Order parameters computed from account state and policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderParams {
    pub symbol: String,
    pub side: Side,
    pub reference_price: f64,
    /// Position value in quote currency (margin × leverage).
    pub notional: f64,
    /// Base-asset quantity.
    pub quantity: f64,
    pub leverage: u32,
    pub stop_loss: f64,
    pub take_profit: f64,
    /// Closing orders may only reduce exposure.
    pub reduce_only: bool,
}

/// Audit row for one (signal, account) dispatch. Never updated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub id: Uuid,
    pub signal_id: Uuid,
    pub account_id: Uuid,
    pub venue: Option<Venue>,
    pub params: Option<OrderParams>,
    pub order_id: Option<String>,
    pub fill_price: Option<f64>,
    pub fill_quantity: Option<f64>,
    pub success: bool,
    /// Stable machine code for failures, e.g. `exchange_rejected`.
    pub reason_code: Option<String>,
    pub failure_reason: Option<String>,
    /// Venue response exactly as received, for diagnosis.
    pub raw_response: Option<serde_json::Value>,
    /// Venue-side state is unknown; an operator must check the venue.
    pub needs_reconciliation: bool,
    pub latency_ms: u64,
    pub created_at: DateTime<Utc>,
}

impl ExecutionRecord {
    pub fn pending(signal_id: Uuid, account_id: Uuid) -> Self {
        Self {
            id: Uuid::new_v4(),
            signal_id,
            account_id,
            venue: None,
            params: None,
            order_id: None,
            fill_price: None,
            fill_quantity: None,
            success: false,
            reason_code: None,
            failure_reason: None,
            raw_response: None,
            needs_reconciliation: false,
            latency_ms: 0,
            created_at: Utc::now(),
        }
    }

    pub fn fail(mut self, reason_code: &str, reason: impl Into<String>) -> Self {
        self.success = false;
        self.reason_code = Some(reason_code.to_string());
        self.failure_reason = Some(reason.into());
        self
    }
}
