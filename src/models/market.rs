//! # models::market
//!
//! Read-only market context consumed by the decision engine. The feed that
//! refreshes it lives outside this core; it publishes snapshots through
//! [`MarketContextFeed::publish`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Trend {
    Bullish,
    Bearish,
    Neutral,
}

/// Snapshot of the broad market at refresh time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketContext {
    /// Fear & greed style sentiment index, 0–100.
    pub sentiment_index: f64,
    pub trend: Trend,
    /// Dominant-asset share of total market cap, percent.
    pub dominant_share_pct: f64,
    pub refreshed_at: DateTime<Utc>,
}

/// Latest published [`MarketContext`], shared between the ingest route and
/// every pipeline instance. Readers clone the snapshot and drop the lock.
#[derive(Debug, Default)]
pub struct MarketContextFeed {
    current: RwLock<Option<MarketContext>>,
}

impl MarketContextFeed {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn publish(&self, context: MarketContext) {
        let mut guard = self.current.write().await;
        *guard = Some(context);
    }

    pub async fn snapshot(&self) -> Option<MarketContext> {
        self.current.read().await.clone()
    }
}
