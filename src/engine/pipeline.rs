//! # engine::pipeline
//!
//! One run per inbound signal:
//!
//! ```text
//! normalize ─► classify ─► (stale?) ─► [decide] ─► resolve ─► fan out
//!     │            │           │           │
//!     ▼            ▼           ▼           ▼
//! rejected:    skipped:    rejected:   rejected:judgment /
//! unparseable  no-exposure stale       rejected:decision-unavailable
//! ```
//!
//! Stage failures (a store error while normalizing, classifying, deciding or
//! resolving) abort this signal only. Per-account failures inside the fan-out
//! never do. Nothing here is shared between signals apart from the stores
//! and venue limits, so a slow judgment call stalls only its own signal.

use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::PipelineConfig;
use crate::engine::classifier::{Classification, Route, SignalClassifier};
use crate::engine::decision::DecisionEngine;
use crate::engine::eligibility::EligibilityResolver;
use crate::engine::fanout::{AccountResult, FanoutEngine, FanoutSummary};
use crate::engine::normalizer::{Ingested, SignalNormalizer};
use crate::error::PipelineError;
use crate::events::{Notification, Notifier};
use crate::models::{DecisionRecord, Signal, SignalStatus};
use crate::store::Store;

/// What happened to one signal.
#[derive(Debug, Clone, Serialize)]
pub struct SignalOutcome {
    pub signal_id: Uuid,
    pub status: SignalStatus,
    pub result: Option<String>,
    pub classification: Option<Classification>,
    pub decision: Option<DecisionRecord>,
    /// Accounts filtered out by the resolver.
    pub excluded: usize,
    pub attempted: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub skipped_duplicates: usize,
    pub results: Vec<AccountResult>,
    /// The alert's upstream id was already stored; nothing was re-run.
    pub redelivered: bool,
}

impl SignalOutcome {
    fn new(signal: &Signal) -> Self {
        Self {
            signal_id: signal.id,
            status: signal.status,
            result: signal.result.clone(),
            classification: None,
            decision: None,
            excluded: 0,
            attempted: 0,
            succeeded: 0,
            failed: 0,
            skipped_duplicates: 0,
            results: Vec::new(),
            redelivered: false,
        }
    }

    fn absorb(&mut self, summary: FanoutSummary) {
        self.attempted = summary.attempted;
        self.succeeded = summary.succeeded;
        self.failed = summary.failed;
        self.skipped_duplicates = summary.skipped_duplicates;
        self.results = summary.results;
    }
}

pub struct SignalPipeline {
    normalizer: SignalNormalizer,
    classifier: Arc<SignalClassifier>,
    decision:   DecisionEngine,
    resolver:   EligibilityResolver,
    fanout:     Arc<FanoutEngine>,
    store:      Arc<dyn Store>,
    notifier:   Notifier,
    config:     PipelineConfig,
}

impl SignalPipeline {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        normalizer: SignalNormalizer,
        classifier: Arc<SignalClassifier>,
        decision: DecisionEngine,
        resolver: EligibilityResolver,
        fanout: Arc<FanoutEngine>,
        store: Arc<dyn Store>,
        notifier: Notifier,
        config: PipelineConfig,
    ) -> Self {
        Self { normalizer, classifier, decision, resolver, fanout, store, notifier, config }
    }

    pub fn classifier(&self) -> &SignalClassifier {
        &self.classifier
    }

    pub fn fanout(&self) -> &FanoutEngine {
        &self.fanout
    }

    pub async fn process(&self, source: &str, raw: Value) -> Result<SignalOutcome, PipelineError> {
        let signal = match self.normalizer.ingest(source, raw).await.map_err(PipelineError::Ingest)? {
            Ingested::New(signal) => signal,
            Ingested::Redelivered(stored) => return self.replay(&stored).await,
        };
        let mut outcome = SignalOutcome::new(&signal);
        if signal.is_unparseable() {
            self.reject(&signal, &mut outcome, SignalStatus::RejectedUnparseable, "symbol could not be resolved")
                .await?;
            return Ok(outcome);
        }

        // ── Classify ─────────────────────────────────────────────────────────
        let classification = self.classifier.classify(&signal).await.map_err(PipelineError::Classify)?;
        outcome.classification = Some(classification);
        self.advance(&signal, &mut outcome, SignalStatus::Classified, None).await?;

        if classification.route == Route::Skip {
            self.advance(
                &signal,
                &mut outcome,
                SignalStatus::SkippedNoExposure,
                Some("skip: no matching exposure".into()),
            )
            .await?;
            info!(signal_id = %signal.id, symbol = %signal.symbol, "⏭️ Close signal with no exposure — skipped");
            return Ok(outcome);
        }

        // ── Freshness ────────────────────────────────────────────────────────
        if signal.is_stale(Utc::now(), self.config.max_signal_age) {
            let age = signal.age_at(Utc::now()).num_seconds();
            self.reject(&signal, &mut outcome, SignalStatus::RejectedStale, &format!("signal is {age}s old"))
                .await?;
            return Ok(outcome);
        }

        // ── Decide ───────────────────────────────────────────────────────────
        if classification.needs_judgment() {
            let decision = self.decision.decide(&signal, &classification).await?;
            let approved = decision.approved();
            let unavailable = decision.unavailable.clone();
            let reason = decision.record.reason_text.clone();
            outcome.decision = Some(decision.record);

            if let Some(err) = unavailable {
                self.reject(&signal, &mut outcome, SignalStatus::RejectedDecisionUnavailable, &err).await?;
                return Ok(outcome);
            }
            if !approved {
                self.reject(&signal, &mut outcome, SignalStatus::RejectedByJudgment, &reason).await?;
                return Ok(outcome);
            }
        }
        self.advance(&signal, &mut outcome, SignalStatus::Decided, None).await?;

        // ── Resolve + fan out ────────────────────────────────────────────────
        let resolution = self.resolver.resolve(&signal).await.map_err(PipelineError::Resolve)?;
        outcome.excluded = resolution.excluded.len();
        self.advance(&signal, &mut outcome, SignalStatus::FannedOut, None).await?;

        let summary = self.fanout.execute(&signal, resolution.eligible).await;
        outcome.absorb(summary);

        let status = if outcome.attempted > 0 && outcome.failed == outcome.attempted {
            SignalStatus::Failed
        } else {
            SignalStatus::Completed
        };
        let note = format!(
            "{} succeeded, {} failed, {} duplicate, {} excluded",
            outcome.succeeded, outcome.failed, outcome.skipped_duplicates, outcome.excluded
        );
        self.advance(&signal, &mut outcome, status, Some(note)).await?;
        Ok(outcome)
    }

    /// Outcome for an alert seen before: stored status plus the execution
    /// records written the first time.
    async fn replay(&self, signal: &Signal) -> Result<SignalOutcome, PipelineError> {
        let mut outcome = SignalOutcome::new(signal);
        outcome.redelivered = true;
        let records = self.store.executions_for_signal(signal.id).await?;
        outcome.attempted = records.len();
        outcome.succeeded = records.iter().filter(|r| r.success).count();
        outcome.failed = records.iter().filter(|r| !r.success && r.reason_code.is_some()).count();
        Ok(outcome)
    }

    async fn advance(
        &self,
        signal: &Signal,
        outcome: &mut SignalOutcome,
        status: SignalStatus,
        result: Option<String>,
    ) -> Result<(), PipelineError> {
        self.store.update_signal_status(signal.id, status, result.clone()).await?;
        outcome.status = status;
        if result.is_some() {
            outcome.result = result;
        }
        Ok(())
    }

    async fn reject(
        &self,
        signal: &Signal,
        outcome: &mut SignalOutcome,
        status: SignalStatus,
        reason: &str,
    ) -> Result<(), PipelineError> {
        warn!(signal_id = %signal.id, status = status.as_str(), reason, "🚫 Signal rejected");
        self.advance(signal, outcome, status, Some(reason.to_string())).await?;
        self.notifier.send(Notification::SignalRejected {
            signal_id: signal.id,
            status,
            reason: reason.to_string(),
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ClassifierConfig, CommissionPolicy, FanoutConfig, OrderPolicy};
    use crate::credentials::StaticCredentialResolver;
    use crate::engine::classifier::AtomicClassifierMetrics;
    use crate::engine::decision::{JudgmentRequest, JudgmentService, Verdict};
    use crate::engine::tracker::PositionTracker;
    use crate::error::DecisionError;
    use crate::exchange::paper::PaperAdapter;
    use crate::exchange::ExchangeRegistry;
    use crate::ledger::{AccountLocks, Ledger};
    use crate::models::{Account, CredentialRef, MarketContext, MarketContextFeed, PlanTier, Trend, Venue};
    use crate::store::MemoryStore;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct CountingJudge {
        approve: bool,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl JudgmentService for CountingJudge {
        async fn judge(&self, _request: &JudgmentRequest) -> Result<Verdict, DecisionError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(Verdict { approved: self.approve, confidence: 0.9, reason: "test verdict".into() })
        }
    }

    async fn pipeline(approve: bool) -> (Arc<MemoryStore>, Arc<CountingJudge>, SignalPipeline, Account) {
        let store = Arc::new(MemoryStore::new());
        let notifier = Notifier::default();
        let judge = Arc::new(CountingJudge { approve, calls: AtomicUsize::new(0) });
        let feed = Arc::new(MarketContextFeed::new());
        feed.publish(MarketContext {
            sentiment_index: 60.0,
            trend: Trend::Bullish,
            dominant_share_pct: 52.0,
            refreshed_at: Utc::now(),
        })
        .await;

        let registry = ExchangeRegistry::new().with(Arc::new(PaperAdapter::new(1_000.0)));
        let creds = Arc::new(StaticCredentialResolver::new());
        let locks = Arc::new(AccountLocks::new());
        let ledger = Arc::new(Ledger::new(store.clone(), locks.clone(), notifier.clone()));
        let tracker = Arc::new(PositionTracker::new(
            store.clone(),
            locks,
            ledger,
            registry.clone(),
            creds.clone(),
            CommissionPolicy::default(),
            notifier.clone(),
        ));
        let fanout = Arc::new(FanoutEngine::new(
            store.clone(),
            registry,
            creds,
            tracker,
            notifier.clone(),
            OrderPolicy::default(),
            FanoutConfig::default(),
        ));
        let pipeline = SignalPipeline::new(
            SignalNormalizer::new(store.clone()),
            Arc::new(SignalClassifier::new(
                store.clone(),
                Arc::new(AtomicClassifierMetrics::default()),
                ClassifierConfig::default(),
            )),
            DecisionEngine::new(judge.clone(), feed, store.clone(), Duration::from_secs(1)),
            EligibilityResolver::new(store.clone(), "BRL"),
            fanout,
            store.clone(),
            notifier,
            PipelineConfig::default(),
        );

        let mut account = Account::new(PlanTier::Paper, "BRL");
        account.credentials.push(CredentialRef {
            venue: Venue::Paper,
            key_id: "paper".into(),
            expires_at: None,
            valid: true,
        });
        store.save_account(&account).await.unwrap();
        (store, judge, pipeline, account)
    }

    #[tokio::test]
    async fn normal_paper_signal_opens_without_judgment() {
        let (store, judge, pipeline, account) = pipeline(false).await;
        let outcome = pipeline
            .process("tv", json!({ "ticker": "ETHUSDT", "signal": "LONG", "close": 2800, "paper": true }))
            .await
            .unwrap();

        assert_eq!(outcome.status, SignalStatus::Completed);
        assert_eq!(outcome.succeeded, 1);
        assert_eq!(judge.calls.load(Ordering::SeqCst), 0);
        assert_eq!(store.open_positions_for_account(account.id).await.unwrap().len(), 1);
        assert_eq!(store.get_signal(outcome.signal_id).await.unwrap().unwrap().status, SignalStatus::Completed);
    }

    #[tokio::test]
    async fn unknown_symbol_stops_at_normalization() {
        let (_, judge, pipeline, _) = pipeline(true).await;
        let outcome = pipeline.process("tv", json!({ "signal": "LONG FORTE", "close": 1 })).await.unwrap();
        assert_eq!(outcome.status, SignalStatus::RejectedUnparseable);
        assert!(outcome.classification.is_none());
        assert_eq!(judge.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn rejected_strong_signal_never_fans_out() {
        let (store, judge, pipeline, account) = pipeline(false).await;
        let outcome = pipeline
            .process("tv", json!({ "ticker": "BTCUSDT", "signal": "LONG FORTE", "close": 45000, "paper": true }))
            .await
            .unwrap();
        assert_eq!(outcome.status, SignalStatus::RejectedByJudgment);
        assert_eq!(judge.calls.load(Ordering::SeqCst), 1);
        assert_eq!(outcome.attempted, 0);
        assert!(store.open_positions_for_account(account.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn stale_signal_is_abandoned_after_classification() {
        let (_, judge, pipeline, _) = pipeline(true).await;
        let old = (Utc::now() - chrono::Duration::minutes(10)).timestamp();
        let outcome = pipeline
            .process("tv", json!({ "ticker": "BTCUSDT", "signal": "LONG", "close": 1, "time": old }))
            .await
            .unwrap();
        assert_eq!(outcome.status, SignalStatus::RejectedStale);
        assert!(outcome.classification.is_some());
        assert_eq!(judge.calls.load(Ordering::SeqCst), 0);
    }
}
