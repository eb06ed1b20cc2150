//! # engine::decision
//!
//! **Market Context Decision Engine** — invoked only for signals the
//! classifier routes to judgment.
//!
//! The verdict itself comes from an external reasoning service behind
//! [`JudgmentService`]. This engine owns the contract around it:
//!
//! - the call runs under a hard timeout;
//! - timeout, transport error, malformed verdict or a missing market snapshot
//!   all fail **closed** (never approved);
//! - the verdict and the market snapshot it was made on are persisted as a
//!   [`DecisionRecord`] before the engine returns.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::engine::classifier::Classification;
use crate::error::{DecisionError, StoreError};
use crate::models::{DecisionRecord, MarketContext, MarketContextFeed, Side, Signal, Strength};
use crate::store::Store;

// ─── Reasoning service contract ───────────────────────────────────────────────

/// Structured prompt input: the signal plus the context it is judged in.
#[derive(Debug, Clone, Serialize)]
pub struct JudgmentRequest {
    pub signal_id:       Uuid,
    pub symbol:          String,
    pub action:          String,
    pub side:            Option<Side>,
    pub strength:        Strength,
    pub reference_price: f64,
    /// Why the classifier asked for judgment.
    pub reason_code:     String,
    pub context:         MarketContext,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Verdict {
    pub approved: bool,
    /// 0.0–1.0
    #[serde(default)]
    pub confidence: f64,
    #[serde(default)]
    pub reason: String,
}

#[async_trait]
pub trait JudgmentService: Send + Sync {
    async fn judge(&self, request: &JudgmentRequest) -> Result<Verdict, DecisionError>;
}

// ─── Outcome ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Decision {
    pub record: DecisionRecord,
    /// Set when the verdict could not be obtained; the record is then a
    /// fail-closed rejection.
    pub unavailable: Option<String>,
}

impl Decision {
    pub fn approved(&self) -> bool {
        self.unavailable.is_none() && self.record.approved
    }
}

// ─── Engine ───────────────────────────────────────────────────────────────────

pub struct DecisionEngine {
    service: Arc<dyn JudgmentService>,
    feed:    Arc<MarketContextFeed>,
    store:   Arc<dyn Store>,
    timeout: Duration,
}

impl DecisionEngine {
    pub fn new(
        service: Arc<dyn JudgmentService>,
        feed: Arc<MarketContextFeed>,
        store: Arc<dyn Store>,
        timeout: Duration,
    ) -> Self {
        Self { service, feed, store, timeout }
    }

    pub async fn decide(
        &self,
        signal: &Signal,
        classification: &Classification,
    ) -> Result<Decision, StoreError> {
        let snapshot = self.feed.snapshot().await;
        let verdict = match &snapshot {
            None => Err(DecisionError::Unavailable("no market context published yet".into())),
            Some(context) => {
                let request = JudgmentRequest {
                    signal_id:       signal.id,
                    symbol:          signal.symbol.clone(),
                    action:          signal.action.clone(),
                    side:            signal.side,
                    strength:        signal.strength,
                    reference_price: signal.reference_price,
                    reason_code:     classification.reason_code.as_str().to_string(),
                    context:         context.clone(),
                };
                match tokio::time::timeout(self.timeout, self.service.judge(&request)).await {
                    Ok(result) => result,
                    Err(_) => Err(DecisionError::Timeout(self.timeout)),
                }
            }
        };

        let (approved, confidence, reason_text, unavailable) = match verdict {
            Ok(v) => (v.approved, v.confidence.clamp(0.0, 1.0), v.reason, None),
            Err(e) => (false, 0.0, format!("fail-closed: {e}"), Some(e.to_string())),
        };

        let record = DecisionRecord {
            signal_id: signal.id,
            approved,
            confidence,
            reason_text,
            reason_code: classification.reason_code.as_str().to_string(),
            sentiment_index:    snapshot.as_ref().map(|c| c.sentiment_index),
            trend:              snapshot.as_ref().map(|c| c.trend),
            dominant_share_pct: snapshot.as_ref().map(|c| c.dominant_share_pct),
            decided_at: Utc::now(),
        };
        self.store.insert_decision(&record).await?;

        match &unavailable {
            Some(err) => warn!(signal_id = %signal.id, error = %err, "⛔ Judgment unavailable — rejecting (fail-closed)"),
            None => info!(
                signal_id = %signal.id,
                approved,
                confidence,
                reason = %record.reason_text,
                "🧠 Judgment received"
            ),
        }
        Ok(Decision { record, unavailable })
    }
}
