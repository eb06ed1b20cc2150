//! # exchange::paper
//!
//! Simulated venue for paper signals. Fills immediately at the order's
//! reference price and keeps balances and positions in memory, keyed by the
//! account's (synthetic) API key.

use std::collections::HashMap;

use async_trait::async_trait;
use serde_json::json;
use tokio::sync::Mutex;
use tracing::info;
use uuid::Uuid;

use crate::credentials::ApiCredentials;
use crate::exchange::{
    BalanceSnapshot, ExchangeAdapter, ExchangeError, OrderRequest, OrderResult, PositionSnapshot,
};
use crate::models::{Side, Venue};

#[derive(Default)]
struct Book {
    balances:  HashMap<String, f64>,
    positions: HashMap<(String, String), PositionSnapshot>,
    /// client_order_id → first result, so repeats do not double-fill.
    fills:     HashMap<String, OrderResult>,
}

pub struct PaperAdapter {
    starting_balance: f64,
    book: Mutex<Book>,
}

impl PaperAdapter {
    pub fn new(starting_balance: f64) -> Self {
        Self { starting_balance, book: Mutex::new(Book::default()) }
    }
}

fn direction(side: Side) -> f64 {
    match side {
        Side::Long => 1.0,
        Side::Short => -1.0,
    }
}

#[async_trait]
impl ExchangeAdapter for PaperAdapter {
    fn venue(&self) -> Venue {
        Venue::Paper
    }

    async fn submit_order(
        &self,
        creds: &ApiCredentials,
        order: &OrderRequest,
    ) -> Result<OrderResult, ExchangeError> {
        if order.reference_price <= 0.0 || order.quantity <= 0.0 {
            return Err(ExchangeError::Rejected {
                code: "invalid_order".into(),
                message: format!("price {} qty {}", order.reference_price, order.quantity),
            });
        }

        let mut book = self.book.lock().await;
        if let Some(previous) = book.fills.get(&order.client_order_id) {
            return Ok(previous.clone());
        }

        let key = (creds.api_key.clone(), order.symbol.to_uppercase());
        let price = order.reference_price;
        let mut realized = None;

        if order.reduce_only {
            let open = book
                .positions
                .remove(&key)
                .filter(|p| p.side == order.side)
                .ok_or_else(|| ExchangeError::Rejected {
                    code: "no_position".into(),
                    message: format!("no {} {} position to reduce", order.symbol, order.side.as_str()),
                })?;
            let pnl = (price - open.entry_price) * open.quantity * direction(open.side);
            let balance = book.balances.entry(creds.api_key.clone()).or_insert(self.starting_balance);
            *balance += pnl;
            realized = Some(pnl);
        } else {
            let entry = book.positions.entry(key).or_insert(PositionSnapshot {
                symbol: order.symbol.to_uppercase(),
                side: order.side,
                quantity: 0.0,
                entry_price: price,
                mark_price: Some(price),
                unrealized_pnl: Some(0.0),
            });
            if entry.side != order.side {
                return Err(ExchangeError::Rejected {
                    code: "opposite_position".into(),
                    message: format!("{} already open on the other side", order.symbol),
                });
            }
            let total = entry.quantity + order.quantity;
            entry.entry_price = (entry.entry_price * entry.quantity + price * order.quantity) / total;
            entry.quantity = total;
        }

        let result = OrderResult {
            order_id: format!("paper-{}", Uuid::new_v4().simple()),
            fill_price: Some(price),
            fill_quantity: Some(order.quantity),
            raw: json!({
                "venue": "paper",
                "clientOrderId": order.client_order_id,
                "reduceOnly": order.reduce_only,
                "realizedPnl": realized,
            }),
        };
        book.fills.insert(order.client_order_id.clone(), result.clone());
        info!(symbol = %order.symbol, side = order.side.as_str(), qty = order.quantity, price, "📝 Paper fill");
        Ok(result)
    }

    async fn query_balance(&self, creds: &ApiCredentials) -> Result<BalanceSnapshot, ExchangeError> {
        let book = self.book.lock().await;
        let total = book.balances.get(&creds.api_key).copied().unwrap_or(self.starting_balance);
        Ok(BalanceSnapshot { currency: "USDT".into(), total, available: total })
    }

    async fn query_position(
        &self,
        creds: &ApiCredentials,
        symbol: &str,
    ) -> Result<Option<PositionSnapshot>, ExchangeError> {
        let book = self.book.lock().await;
        Ok(book.positions.get(&(creds.api_key.clone(), symbol.to_uppercase())).cloned())
    }
}
