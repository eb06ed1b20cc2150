//! # engine::classifier
//!
//! **AI-Gating Classifier** — decides whether a signal needs the expensive
//! judgment call or can be settled by rule.
//!
//! ## Rules (first match wins)
//!
//! | Strength  | Condition                         | Route      |
//! |-----------|-----------------------------------|------------|
//! | strong    | —                                 | judgment   |
//! | close     | no open position on symbol + side | skip       |
//! | close     | at least one matching position    | judgment   |
//! | normal    | —                                 | proceed    |
//! | unknown   | —                                 | judgment   |
//!
//! Counters live behind [`ClassifierMetrics`] so tests can inject a sink.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tracing::debug;

use crate::config::ClassifierConfig;
use crate::error::StoreError;
use crate::models::{Signal, Strength};
use crate::store::Store;

// ─── Outcome ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Route {
    /// Ask the decision engine.
    Judgment,
    /// Pre-approved by policy, go straight to fan-out.
    Proceed,
    /// Nothing to do; stop here.
    Skip,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReasonCode {
    StrongSignal,
    CloseWithExposure,
    CloseWithoutExposure,
    NormalPreApproved,
    UnknownStrength,
}

impl ReasonCode {
    pub fn as_str(self) -> &'static str {
        match self {
            ReasonCode::StrongSignal         => "strong_signal",
            ReasonCode::CloseWithExposure    => "close_with_exposure",
            ReasonCode::CloseWithoutExposure => "close_without_exposure",
            ReasonCode::NormalPreApproved    => "normal_pre_approved",
            ReasonCode::UnknownStrength      => "unknown_strength",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    Normal,
    High,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Classification {
    pub route:              Route,
    pub reason_code:        ReasonCode,
    pub suggested_priority: Priority,
}

impl Classification {
    pub fn needs_judgment(&self) -> bool {
        self.route == Route::Judgment
    }

    fn new(route: Route, reason_code: ReasonCode, suggested_priority: Priority) -> Self {
        Self { route, reason_code, suggested_priority }
    }
}

// ─── Metrics ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ClassifierStats {
    pub seen:                      u64,
    pub routed_to_judgment:        u64,
    pub settled_deterministically: u64,
    pub estimated_cost_avoided:    f64,
}

pub trait ClassifierMetrics: Send + Sync {
    fn record_seen(&self);
    fn record_judgment(&self);
    fn record_settled(&self, cost_avoided: f64);
    fn snapshot(&self) -> ClassifierStats;
}

/// Process-lifetime counters. Cost is accumulated in millionths.
#[derive(Debug, Default)]
pub struct AtomicClassifierMetrics {
    seen:         AtomicU64,
    judgment:     AtomicU64,
    settled:      AtomicU64,
    cost_micros:  AtomicU64,
}

impl AtomicClassifierMetrics {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ClassifierMetrics for AtomicClassifierMetrics {
    fn record_seen(&self) {
        self.seen.fetch_add(1, Ordering::Relaxed);
    }

    fn record_judgment(&self) {
        self.judgment.fetch_add(1, Ordering::Relaxed);
    }

    fn record_settled(&self, cost_avoided: f64) {
        self.settled.fetch_add(1, Ordering::Relaxed);
        let micros = (cost_avoided.max(0.0) * 1_000_000.0).round() as u64;
        self.cost_micros.fetch_add(micros, Ordering::Relaxed);
    }

    fn snapshot(&self) -> ClassifierStats {
        ClassifierStats {
            seen:                      self.seen.load(Ordering::Relaxed),
            routed_to_judgment:        self.judgment.load(Ordering::Relaxed),
            settled_deterministically: self.settled.load(Ordering::Relaxed),
            estimated_cost_avoided:    self.cost_micros.load(Ordering::Relaxed) as f64 / 1_000_000.0,
        }
    }
}

// ─── Classifier ───────────────────────────────────────────────────────────────

pub struct SignalClassifier {
    store:   Arc<dyn Store>,
    metrics: Arc<dyn ClassifierMetrics>,
    config:  ClassifierConfig,
}

impl SignalClassifier {
    pub fn new(
        store: Arc<dyn Store>,
        metrics: Arc<dyn ClassifierMetrics>,
        config: ClassifierConfig,
    ) -> Self {
        Self { store, metrics, config }
    }

    pub fn metrics(&self) -> ClassifierStats {
        self.metrics.snapshot()
    }

    pub async fn classify(&self, signal: &Signal) -> Result<Classification, StoreError> {
        let outcome = match (signal.strength, signal.side) {
            (Strength::Strong, _) => {
                Classification::new(Route::Judgment, ReasonCode::StrongSignal, Priority::High)
            }
            (Strength::Close, Some(side)) => {
                let exposed = self
                    .store
                    .open_positions_for_symbol(&signal.symbol, Some(side))
                    .await?;
                if exposed.is_empty() {
                    Classification::new(Route::Skip, ReasonCode::CloseWithoutExposure, Priority::Low)
                } else {
                    Classification::new(Route::Judgment, ReasonCode::CloseWithExposure, Priority::High)
                }
            }
            (Strength::Normal, Some(_)) => {
                Classification::new(Route::Proceed, ReasonCode::NormalPreApproved, Priority::Normal)
            }
            _ => Classification::new(Route::Judgment, ReasonCode::UnknownStrength, Priority::Normal),
        };

        self.metrics.record_seen();
        if outcome.needs_judgment() {
            self.metrics.record_judgment();
        } else {
            self.metrics.record_settled(self.config.estimated_call_cost);
        }

        debug!(
            signal_id = %signal.id,
            route = ?outcome.route,
            reason = outcome.reason_code.as_str(),
            "🧭 Signal classified"
        );
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use chrono::Utc;
    use serde_json::json;
    use uuid::Uuid;

    use crate::engine::normalizer::normalize;
    use crate::models::{Position, PositionStatus, Side, Venue};
    use crate::store::MemoryStore;

    #[derive(Default)]
    struct RecordingMetrics {
        events: Mutex<Vec<&'static str>>,
    }

    impl ClassifierMetrics for RecordingMetrics {
        fn record_seen(&self) {
            self.events.lock().unwrap().push("seen");
        }
        fn record_judgment(&self) {
            self.events.lock().unwrap().push("judgment");
        }
        fn record_settled(&self, _cost_avoided: f64) {
            self.events.lock().unwrap().push("settled");
        }
        fn snapshot(&self) -> ClassifierStats {
            ClassifierStats::default()
        }
    }

    fn classifier(store: Arc<MemoryStore>, metrics: Arc<RecordingMetrics>) -> SignalClassifier {
        SignalClassifier::new(store, metrics, ClassifierConfig::default())
    }

    fn open_long(symbol: &str) -> Position {
        Position {
            id: Uuid::new_v4(),
            account_id: Uuid::new_v4(),
            symbol: symbol.into(),
            side: Side::Long,
            venue: Venue::Paper,
            entry_price: 100.0,
            quantity: 1.0,
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

    #[tokio::test]
    async fn strong_signals_always_need_judgment() {
        let metrics = Arc::new(RecordingMetrics::default());
        let c = classifier(Arc::new(MemoryStore::new()), metrics.clone());
        let signal = normalize("tv", json!({ "ticker": "BTCUSDT", "signal": "SINAL LONG FORTE" }), Utc::now());

        let outcome = c.classify(&signal).await.unwrap();
        assert_eq!(outcome.route, Route::Judgment);
        assert_eq!(outcome.reason_code, ReasonCode::StrongSignal);
        assert_eq!(*metrics.events.lock().unwrap(), vec!["seen", "judgment"]);
    }

    #[tokio::test]
    async fn close_without_exposure_is_skipped() {
        let metrics = Arc::new(RecordingMetrics::default());
        let c = classifier(Arc::new(MemoryStore::new()), metrics.clone());
        let signal = normalize("tv", json!({ "ticker": "BTCUSDT", "signal": "FECHAR LONG" }), Utc::now());

        let outcome = c.classify(&signal).await.unwrap();
        assert_eq!(outcome.route, Route::Skip);
        assert_eq!(*metrics.events.lock().unwrap(), vec!["seen", "settled"]);
    }

    #[tokio::test]
    async fn close_with_matching_exposure_needs_judgment() {
        let store = Arc::new(MemoryStore::new());
        store.insert_position(&open_long("BTCUSDT")).await.unwrap();
        let c = classifier(store, Arc::new(RecordingMetrics::default()));

        let long_close = normalize("tv", json!({ "ticker": "BTCUSDT", "signal": "CLOSE LONG" }), Utc::now());
        assert_eq!(c.classify(&long_close).await.unwrap().reason_code, ReasonCode::CloseWithExposure);

        // Exposure on the other side does not count.
        let short_close = normalize("tv", json!({ "ticker": "BTCUSDT", "signal": "CLOSE SHORT" }), Utc::now());
        assert_eq!(c.classify(&short_close).await.unwrap().route, Route::Skip);
    }

    #[tokio::test]
    async fn normal_proceeds_and_unknown_fails_safe() {
        let c = classifier(Arc::new(MemoryStore::new()), Arc::new(RecordingMetrics::default()));
        let normal = normalize("tv", json!({ "ticker": "ETHUSDT", "action": "SELL" }), Utc::now());
        assert_eq!(c.classify(&normal).await.unwrap().route, Route::Proceed);

        let odd = normalize("tv", json!({ "ticker": "ETHUSDT", "action": "HODL" }), Utc::now());
        let outcome = c.classify(&odd).await.unwrap();
        assert_eq!(outcome.route, Route::Judgment);
        assert_eq!(outcome.reason_code, ReasonCode::UnknownStrength);
    }

    #[test]
    fn atomic_metrics_accumulate_cost_avoided() {
        let m = AtomicClassifierMetrics::new();
        m.record_seen();
        m.record_seen();
        m.record_settled(0.01);
        m.record_judgment();
        let stats = m.snapshot();
        assert_eq!(stats.seen, 2);
        assert_eq!(stats.routed_to_judgment, 1);
        assert_eq!(stats.settled_deterministically, 1);
        assert!((stats.estimated_cost_avoided - 0.01).abs() < 1e-9);
    }
}
