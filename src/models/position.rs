//! # models::position
//!
//! Defines structs for tracking **live positions**.
//!
//! One open row per (account, symbol, side). A second open on the same key
//! is rejected by the store, never queued.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::{Side, Venue};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PositionStatus {
    Open,
    Closed,
}

/// Why a position was closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CloseReason {
    /// An opposing close signal passed the full pipeline.
    Signal,
    /// The venue closed it (liquidation, SL/TP hit, manual close on the venue).
    External,
}

/// Uniqueness key for open positions.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PositionKey {
    pub account_id: Uuid,
    pub symbol: String,
    pub side: Side,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub id: Uuid,
    pub account_id: Uuid,
    pub symbol: String,
    pub side: Side,
    pub venue: Venue,
    pub entry_price: f64,
    pub quantity: f64,
    pub leverage: u32,
    pub stop_loss: f64,
    pub take_profit: f64,
    pub status: PositionStatus,
    /// Last mark price pushed by the market-data collaborator.
    pub mark_price: Option<f64>,
    pub unrealized_pnl: f64,
    pub realized_pnl: Option<f64>,
    /// Commission charged on closure, in the ledger currency.
    pub commission: Option<f64>,
    pub opening_signal_id: Uuid,
    pub closing_signal_id: Option<Uuid>,
    pub exchange_order_id: Option<String>,
    pub close_reason: Option<CloseReason>,
    pub opened_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
}

impl Position {
    pub fn key(&self) -> PositionKey {
        PositionKey {
            account_id: self.account_id,
            symbol: self.symbol.clone(),
            side: self.side,
        }
    }

    pub fn is_open(&self) -> bool {
        self.status == PositionStatus::Open
    }

    /// P&L in quote currency if the position were closed at `price`.
    pub fn pnl_at(&self, price: f64) -> f64 {
        match self.side {
            Side::Long  => (price - self.entry_price) * self.quantity,
            Side::Short => (self.entry_price - price) * self.quantity,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn position(side: Side) -> Position {
        Position {
            id: Uuid::new_v4(),
            account_id: Uuid::new_v4(),
            symbol: "BTCUSDT".into(),
            side,
            venue: Venue::Paper,
            entry_price: 100.0,
            quantity: 2.0,
            leverage: 5,
            stop_loss: 98.0,
            take_profit: 103.0,
            status: PositionStatus::Open,
            mark_price: None,
            unrealized_pnl: 0.0,
            realized_pnl: None,
            commission: None,
            opening_signal_id: Uuid::new_v4(),
            closing_signal_id: None,
            exchange_order_id: None,
            close_reason: None,
            opened_at: Utc::now(),
            closed_at: None,
        }
    }

    #[test]
    fn pnl_follows_side() {
        assert_eq!(position(Side::Long).pnl_at(110.0), 20.0);
        assert_eq!(position(Side::Short).pnl_at(110.0), -20.0);
        assert_eq!(position(Side::Short).pnl_at(95.0), 10.0);
    }
}
