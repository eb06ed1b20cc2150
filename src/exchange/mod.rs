//! # exchange
//!
//! Uniform capability surface over execution venues. The fan-out engine only
//! sees [`ExchangeAdapter`]; adding a venue means implementing the trait and
//! registering it in [`ExchangeRegistry`], never branching on venue name.
//!
//! ## Failure contract
//! - A non-success venue code is a failure, never success by omission.
//! - Reads (balance / position) are retried per the adapter's read policy.
//! - Submissions are retried at most once, and only when the adapter knows
//!   the first attempt never left the process ([`ExchangeError::NotSent`]).

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::credentials::ApiCredentials;
use crate::models::{OrderParams, Side, Venue};

pub mod binance;
pub mod okx;
pub mod paper;
pub mod retry;
pub mod signing;

// ─── Requests / Results ───────────────────────────────────────────────────────

/// One order as handed to a venue adapter.
#[derive(Debug, Clone, Serialize)]
pub struct OrderRequest {
    /// Idempotency key forwarded to the venue where supported.
    pub client_order_id: String,
    pub symbol: String,
    pub side: Side,
    pub quantity: f64,
    pub leverage: u32,
    pub reference_price: f64,
    pub stop_loss: Option<f64>,
    pub take_profit: Option<f64>,
    pub reduce_only: bool,
}

impl OrderRequest {
    /// Venue order direction: opening a long or closing a short buys.
    pub fn is_buy(&self) -> bool {
        matches!(
            (self.side, self.reduce_only),
            (Side::Long, false) | (Side::Short, true)
        )
    }

    pub fn from_params(client_order_id: String, params: &OrderParams) -> Self {
        let protective = !params.reduce_only;
        Self {
            client_order_id,
            symbol: params.symbol.clone(),
            side: params.side,
            quantity: params.quantity,
            leverage: params.leverage,
            reference_price: params.reference_price,
            stop_loss: protective.then_some(params.stop_loss),
            take_profit: protective.then_some(params.take_profit),
            reduce_only: params.reduce_only,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderResult {
    pub order_id: String,
    pub fill_price: Option<f64>,
    pub fill_quantity: Option<f64>,
    /// Venue response body(ies), kept verbatim for the execution record.
    pub raw: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BalanceSnapshot {
    pub currency: String,
    pub total: f64,
    pub available: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionSnapshot {
    pub symbol: String,
    pub side: Side,
    pub quantity: f64,
    pub entry_price: f64,
    pub mark_price: Option<f64>,
    pub unrealized_pnl: Option<f64>,
}

// ─── Errors ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Error)]
pub enum ExchangeError {
    /// The request never left this process (e.g. connection refused).
    #[error("venue unreachable before send: {0}")]
    NotSent(String),

    /// Failed after the request may have reached the venue. State unknown.
    #[error("transport failure after send: {0}")]
    Ambiguous(String),

    /// The venue answered with a business error.
    #[error("venue rejected request (code {code}): {message}")]
    Rejected { code: String, message: String },

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("rate limited: {0}")]
    RateLimited(String),

    #[error("unexpected venue response: {0}")]
    Decode(String),
}

impl ExchangeError {
    /// Classify a transport error from `reqwest`. Connect failures happen
    /// before any request bytes are written.
    pub fn from_transport(err: &reqwest::Error) -> Self {
        if err.is_connect() {
            ExchangeError::NotSent(err.to_string())
        } else {
            ExchangeError::Ambiguous(err.to_string())
        }
    }

    /// Worth retrying for idempotent reads.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ExchangeError::NotSent(_) | ExchangeError::Ambiguous(_) | ExchangeError::RateLimited(_)
        )
    }

    /// Safe to retry a non-idempotent submission.
    pub fn is_not_sent(&self) -> bool {
        matches!(self, ExchangeError::NotSent(_))
    }

    /// Venue-side state is unknown and needs a human to check.
    pub fn needs_reconciliation(&self) -> bool {
        matches!(self, ExchangeError::Ambiguous(_) | ExchangeError::Decode(_))
    }

    pub fn reason_code(&self) -> &'static str {
        match self {
            ExchangeError::NotSent(_)       => "venue_unreachable",
            ExchangeError::Ambiguous(_)     => "ambiguous_submission",
            ExchangeError::Rejected { .. }  => "exchange_rejected",
            ExchangeError::Auth(_)          => "auth_failed",
            ExchangeError::RateLimited(_)   => "rate_limited",
            ExchangeError::Decode(_)        => "decode_error",
        }
    }
}

// ─── Capability Interface ─────────────────────────────────────────────────────

#[async_trait]
pub trait ExchangeAdapter: Send + Sync {
    fn venue(&self) -> Venue;

    async fn submit_order(
        &self,
        creds: &ApiCredentials,
        order: &OrderRequest,
    ) -> Result<OrderResult, ExchangeError>;

    async fn query_balance(&self, creds: &ApiCredentials) -> Result<BalanceSnapshot, ExchangeError>;

    async fn query_position(
        &self,
        creds: &ApiCredentials,
        symbol: &str,
    ) -> Result<Option<PositionSnapshot>, ExchangeError>;
}

// ─── Registry ─────────────────────────────────────────────────────────────────

/// Venue → adapter lookup, built once at startup.
#[derive(Default, Clone)]
pub struct ExchangeRegistry {
    adapters: HashMap<Venue, Arc<dyn ExchangeAdapter>>,
}

impl ExchangeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, adapter: Arc<dyn ExchangeAdapter>) {
        self.adapters.insert(adapter.venue(), adapter);
    }

    pub fn with(mut self, adapter: Arc<dyn ExchangeAdapter>) -> Self {
        self.register(adapter);
        self
    }

    pub fn get(&self, venue: Venue) -> Option<Arc<dyn ExchangeAdapter>> {
        self.adapters.get(&venue).cloned()
    }

    pub fn venues(&self) -> impl Iterator<Item = Venue> + '_ {
        self.adapters.keys().copied()
    }
}

/// Reads a number that venues may send either as a JSON number or a string.
pub(crate) fn json_f64(value: &serde_json::Value, key: &str) -> Option<f64> {
    match value.get(key)? {
        serde_json::Value::Number(n) => n.as_f64(),
        serde_json::Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

/// Price decimals by magnitude, coarse enough for the venues' tick sizes.
pub(crate) fn price_decimals(price: f64) -> usize {
    match price {
        p if p >= 1_000.0 => 1,
        p if p >= 10.0 => 2,
        p if p >= 1.0 => 3,
        _ => 5,
    }
}

/// Quantity decimals by price magnitude.
pub(crate) fn quantity_decimals(price: f64) -> usize {
    match price {
        p if p >= 100.0 => 3,
        p if p >= 1.0 => 1,
        _ => 0,
    }
}

/// Quantity formatting shared by the HTTP venues (no exponent, trimmed zeros).
pub(crate) fn format_decimal(value: f64, max_decimals: usize) -> String {
    let s = format!("{value:.max_decimals$}");
    if s.contains('.') {
        s.trim_end_matches('0').trim_end_matches('.').to_string()
    } else {
        s
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn submission_retry_only_when_not_sent() {
        assert!(ExchangeError::NotSent("refused".into()).is_not_sent());
        assert!(!ExchangeError::Ambiguous("reset".into()).is_not_sent());
        assert!(ExchangeError::Ambiguous("reset".into()).needs_reconciliation());
        assert!(!ExchangeError::Rejected { code: "-2019".into(), message: "margin".into() }
            .is_transient());
    }

    #[test]
    fn closing_a_long_sells() {
        let mut order = OrderRequest {
            client_order_id: "x".into(),
            symbol: "BTCUSDT".into(),
            side: Side::Long,
            quantity: 1.0,
            leverage: 5,
            reference_price: 100.0,
            stop_loss: None,
            take_profit: None,
            reduce_only: false,
        };
        assert!(order.is_buy());
        order.reduce_only = true;
        assert!(!order.is_buy());
        order.side = Side::Short;
        assert!(order.is_buy());
    }

    #[test]
    fn numbers_parse_from_strings_or_numbers() {
        let v = serde_json::json!({ "a": "1.5", "b": 2.5, "c": true });
        assert_eq!(json_f64(&v, "a"), Some(1.5));
        assert_eq!(json_f64(&v, "b"), Some(2.5));
        assert_eq!(json_f64(&v, "c"), None);
    }

    #[test]
    fn decimals_are_trimmed() {
        assert_eq!(format_decimal(0.0125, 6), "0.0125");
        assert_eq!(format_decimal(2.0, 6), "2");
        assert_eq!(format_decimal(45000.123456789, 2), "45000.12");
    }
}
