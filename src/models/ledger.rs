//! # models::ledger
//!
//! Debt entries and the persisted decision audit row.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::market::Trend;

/// A commission shortfall. `amount` is what is still owed; it only ever
/// decreases, and reaches zero exactly when `compensated` flips.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DebtEntry {
    pub id: Uuid,
    pub account_id: Uuid,
    pub currency: String,
    pub amount: f64,
    pub original_amount: f64,
    pub origin_execution_id: Option<Uuid>,
    pub compensated: bool,
    pub compensated_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl DebtEntry {
    pub fn new(account_id: Uuid, currency: &str, amount: f64, origin: Option<Uuid>) -> Self {
        Self {
            id: Uuid::new_v4(),
            account_id,
            currency: currency.to_string(),
            amount,
            original_amount: amount,
            origin_execution_id: origin,
            compensated: false,
            compensated_at: None,
            created_at: Utc::now(),
        }
    }

    pub fn is_outstanding(&self) -> bool {
        !self.compensated && self.amount > 0.0
    }
}

/// The decision engine's verdict plus the market snapshot it was made on.
/// Persisted for audit, never recomputed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionRecord {
    pub signal_id: Uuid,
    pub approved: bool,
    pub confidence: f64,
    pub reason_text: String,
    /// Classifier reason code that routed the signal here.
    pub reason_code: String,
    pub sentiment_index: Option<f64>,
    pub trend: Option<Trend>,
    pub dominant_share_pct: Option<f64>,
    pub decided_at: DateTime<Utc>,
}
