//! # engine::fanout
//!
//! **Fan-Out Execution Engine** — dispatches one approved signal to every
//! eligible account concurrently.
//!
//! Each account runs as its own task inside a `buffer_unordered` stream,
//! bounded by `FANOUT_MAX_PARALLEL`, and every venue call additionally holds
//! a permit from that venue's semaphore (`FANOUT_PER_VENUE_PARALLEL`) shared
//! across signals. A task never returns `Err`: whatever happens becomes an
//! [`AccountResult`] plus exactly one [`ExecutionRecord`].
//!
//! ## Idempotency
//! A (signal, account) pair is dispatched at most once:
//! 1. an in-process claim stops two concurrent runs of the same pair;
//! 2. an existing execution record turns a re-run into a skip;
//! 3. the store's uniqueness rule on execution records backs both.
//!
//! The venue also sees a deterministic client order id, so a duplicate that
//! slips through all three is rejected or deduplicated venue-side.

use std::collections::{HashMap, HashSet};
use std::hash::Hash;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use futures_util::{stream, StreamExt};
use serde::Serialize;
use serde_json::json;
use tokio::sync::{Semaphore, SemaphorePermit};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::{FanoutConfig, OrderPolicy};
use crate::credentials::CredentialResolver;
use crate::engine::eligibility::EligibleAccount;
use crate::engine::sizing;
use crate::engine::tracker::PositionTracker;
use crate::events::{Notification, Notifier};
use crate::exchange::{ExchangeAdapter, ExchangeError, ExchangeRegistry, OrderRequest, OrderResult};
use crate::models::{CloseReason, ExecutionRecord, OrderParams, Signal, Venue};
use crate::store::Store;

// ─── Results ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchStatus {
    Succeeded,
    Failed,
    /// Already dispatched for this signal; nothing was sent.
    SkippedDuplicate,
}

#[derive(Debug, Clone, Serialize)]
pub struct AccountResult {
    pub account_id:  Uuid,
    pub venue:       Venue,
    pub status:      DispatchStatus,
    pub reason_code: Option<String>,
    pub message:     Option<String>,
    pub execution_id: Option<Uuid>,
    pub position_id: Option<Uuid>,
    pub needs_reconciliation: bool,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct FanoutSummary {
    pub attempted:          usize,
    pub succeeded:          usize,
    pub failed:             usize,
    pub skipped_duplicates: usize,
    pub results:            Vec<AccountResult>,
}

impl FanoutSummary {
    fn from_results(results: Vec<AccountResult>) -> Self {
        let count = |status: DispatchStatus| results.iter().filter(|r| r.status == status).count();
        Self {
            attempted:          results.len(),
            succeeded:          count(DispatchStatus::Succeeded),
            failed:             count(DispatchStatus::Failed),
            skipped_duplicates: count(DispatchStatus::SkippedDuplicate),
            results,
        }
    }
}

/// Deterministic per-(signal, account) order id: 32 hex chars, within every
/// supported venue's client-id limit.
pub fn client_order_id(signal_id: Uuid, account_id: Uuid) -> String {
    let signal = signal_id.simple().to_string();
    let account = account_id.simple().to_string();
    format!("{}{}", &signal[..16], &account[..16])
}

// ─── Claims ───────────────────────────────────────────────────────────────────

/// Membership in a claim set, released on drop.
struct Claim<'a, K: Eq + Hash> {
    set: &'a Mutex<HashSet<K>>,
    key: Option<K>,
}

impl<'a, K: Eq + Hash + Clone> Claim<'a, K> {
    fn take(set: &'a Mutex<HashSet<K>>, key: K) -> Option<Self> {
        let mut held = set.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        held.insert(key.clone()).then(|| Claim { set, key: Some(key) })
    }
}

impl<K: Eq + Hash> Drop for Claim<'_, K> {
    fn drop(&mut self) {
        if let Some(key) = self.key.take() {
            let mut held = self.set.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            held.remove(&key);
        }
    }
}

/// Why one account's dispatch failed.
struct Failure {
    reason_code: &'static str,
    message: String,
    needs_reconciliation: bool,
}

impl Failure {
    fn new(reason_code: &'static str, message: impl Into<String>) -> Self {
        Self { reason_code, message: message.into(), needs_reconciliation: false }
    }
}

impl From<ExchangeError> for Failure {
    fn from(err: ExchangeError) -> Self {
        Self {
            reason_code: err.reason_code(),
            needs_reconciliation: err.needs_reconciliation(),
            message: err.to_string(),
        }
    }
}

// ─── Engine ───────────────────────────────────────────────────────────────────

pub struct FanoutEngine {
    store:       Arc<dyn Store>,
    registry:    ExchangeRegistry,
    credentials: Arc<dyn CredentialResolver>,
    tracker:     Arc<PositionTracker>,
    notifier:    Notifier,
    policy:      OrderPolicy,
    config:      FanoutConfig,
    venue_limits: HashMap<Venue, Semaphore>,
    /// (signal, account) pairs currently being dispatched.
    in_flight:   Mutex<HashSet<(Uuid, Uuid)>>,
    /// (account, symbol) keys with an order in flight.
    busy_symbols: Mutex<HashSet<(Uuid, String)>>,
}

impl FanoutEngine {
    pub fn new(
        store: Arc<dyn Store>,
        registry: ExchangeRegistry,
        credentials: Arc<dyn CredentialResolver>,
        tracker: Arc<PositionTracker>,
        notifier: Notifier,
        policy: OrderPolicy,
        config: FanoutConfig,
    ) -> Self {
        let venue_limits = registry
            .venues()
            .map(|venue| (venue, Semaphore::new(config.per_venue_parallel.max(1))))
            .collect();
        Self {
            store,
            registry,
            credentials,
            tracker,
            notifier,
            policy,
            config,
            venue_limits,
            in_flight: Mutex::new(HashSet::new()),
            busy_symbols: Mutex::new(HashSet::new()),
        }
    }

    /// Dispatch `signal` to every target. Targets are started in the given
    /// order; completion order is whatever the venues make it.
    pub async fn execute(&self, signal: &Signal, targets: Vec<EligibleAccount>) -> FanoutSummary {
        let results: Vec<AccountResult> = stream::iter(targets)
            .map(|target| self.dispatch(signal, target))
            .buffer_unordered(self.config.max_parallel.max(1))
            .collect()
            .await;

        let summary = FanoutSummary::from_results(results);
        info!(
            signal_id = %signal.id,
            attempted = summary.attempted,
            succeeded = summary.succeeded,
            failed = summary.failed,
            skipped = summary.skipped_duplicates,
            "📣 Fan-out finished"
        );
        summary
    }

    async fn venue_permit(&self, venue: Venue) -> Option<SemaphorePermit<'_>> {
        match self.venue_limits.get(&venue) {
            Some(limit) => limit.acquire().await.ok(),
            None => None,
        }
    }

    async fn dispatch(&self, signal: &Signal, target: EligibleAccount) -> AccountResult {
        let account_id = target.account.id;
        let venue = target.venue;
        let skipped = |execution_id| AccountResult {
            account_id,
            venue,
            status: DispatchStatus::SkippedDuplicate,
            reason_code: None,
            message: None,
            execution_id,
            position_id: None,
            needs_reconciliation: false,
        };

        let Some(_claim) = Claim::take(&self.in_flight, (signal.id, account_id)) else {
            return skipped(None);
        };
        match self.store.find_execution(signal.id, account_id).await {
            Ok(Some(existing)) => {
                info!(signal_id = %signal.id, account_id = %account_id, "⏭️ Already dispatched — skipping");
                return skipped(Some(existing.id));
            }
            Ok(None) => {}
            Err(e) => {
                error!(signal_id = %signal.id, account_id = %account_id, error = %e, "❌ Execution lookup failed");
                return AccountResult {
                    account_id,
                    venue,
                    status: DispatchStatus::Failed,
                    reason_code: Some("store_error".into()),
                    message: Some(e.to_string()),
                    execution_id: None,
                    position_id: None,
                    needs_reconciliation: false,
                };
            }
        }

        let started = Instant::now();
        let mut record = ExecutionRecord::pending(signal.id, account_id);
        record.venue = Some(venue);

        let outcome = self.attempt(signal, &target, &mut record).await;
        record.latency_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

        let (status, position_id, message) = match outcome {
            Ok(position_id) => {
                record.success = true;
                (DispatchStatus::Succeeded, position_id, record.failure_reason.clone())
            }
            Err(failure) => {
                record = record.fail(failure.reason_code, failure.message.clone());
                record.needs_reconciliation = failure.needs_reconciliation;
                warn!(
                    signal_id = %signal.id,
                    account_id = %account_id,
                    venue = %venue,
                    reason_code = failure.reason_code,
                    error = %failure.message,
                    "⚠️ Dispatch failed"
                );
                self.notifier.send(Notification::ExecutionFailed {
                    account_id,
                    signal_id: signal.id,
                    reason_code: failure.reason_code.to_string(),
                    message: failure.message.clone(),
                    needs_reconciliation: failure.needs_reconciliation,
                });
                (DispatchStatus::Failed, None, Some(failure.message))
            }
        };

        if let Err(e) = self.store.insert_execution(&record).await {
            error!(signal_id = %signal.id, account_id = %account_id, error = %e, "❌ Execution record not persisted");
        }

        AccountResult {
            account_id,
            venue,
            status,
            reason_code: record.reason_code.clone(),
            message,
            execution_id: Some(record.id),
            position_id,
            needs_reconciliation: record.needs_reconciliation,
        }
    }

    /// Everything between "not yet dispatched" and "order handed to the
    /// tracker". Fills `record` as it learns things.
    async fn attempt(
        &self,
        signal: &Signal,
        target: &EligibleAccount,
        record: &mut ExecutionRecord,
    ) -> Result<Option<Uuid>, Failure> {
        let account = &target.account;
        let adapter = self
            .registry
            .get(target.venue)
            .ok_or_else(|| Failure::new("venue_unsupported", format!("no adapter for {}", target.venue)))?;
        let creds = self
            .credentials
            .resolve(account.id, target.venue)
            .await
            .map_err(|e| Failure::new("credentials_unavailable", format!("{e:#}")))?;

        let symbol_key = (account.id, signal.symbol.to_uppercase());
        let _busy = Claim::take(&self.busy_symbols, symbol_key)
            .ok_or_else(|| Failure::new("position_busy", format!("order already in flight on {}", signal.symbol)))?;

        let params = match &target.closing {
            Some(position) => sizing::close_params(position, signal.reference_price),
            None => self.open_params(signal, target, adapter.as_ref(), &creds).await?,
        };
        record.params = Some(params.clone());

        let order = OrderRequest::from_params(client_order_id(signal.id, account.id), &params);
        let fill = {
            let _permit = self.venue_permit(target.venue).await;
            adapter.submit_order(&creds, &order).await
        }
        .map_err(|e| {
            record.raw_response = Some(json!({ "error": e.to_string() }));
            Failure::from(e)
        })?;

        record.order_id = Some(fill.order_id.clone());
        record.fill_price = fill.fill_price;
        record.fill_quantity = fill.fill_quantity;
        record.raw_response = Some(fill.raw.clone());
        info!(
            signal_id = %signal.id,
            account_id = %account.id,
            venue = %target.venue,
            symbol = %params.symbol,
            order_id = %fill.order_id,
            reduce_only = params.reduce_only,
            "✅ Order accepted"
        );

        Ok(self.hand_off(signal, target, &params, &fill, record).await)
    }

    async fn open_params(
        &self,
        signal: &Signal,
        target: &EligibleAccount,
        adapter: &dyn ExchangeAdapter,
        creds: &crate::credentials::ApiCredentials,
    ) -> Result<OrderParams, Failure> {
        let account = &target.account;
        let side = signal
            .side
            .ok_or_else(|| Failure::new("invalid_order_params", "signal carries no side"))?;

        // Eligibility ran before any sibling filled; re-check under the claim.
        let open = self
            .store
            .open_positions_for_account(account.id)
            .await
            .map_err(|e| Failure::new("store_error", e.to_string()))?;
        if open.iter().any(|p| p.symbol.eq_ignore_ascii_case(&signal.symbol)) {
            return Err(Failure::new("conflicting_position", format!("{} already open", signal.symbol)));
        }

        let balance = {
            let _permit = self.venue_permit(target.venue).await;
            adapter.query_balance(creds).await?
        };
        sizing::open_params(&self.policy, account, &signal.symbol, side, signal.reference_price, balance.available)
            .map_err(|e| Failure::new(e.reason_code(), e.to_string()))
    }

    /// Record the fill with the tracker. The venue order already exists, so a
    /// tracker failure leaves the attempt successful but flagged.
    async fn hand_off(
        &self,
        signal: &Signal,
        target: &EligibleAccount,
        params: &OrderParams,
        fill: &OrderResult,
        record: &mut ExecutionRecord,
    ) -> Option<Uuid> {
        let tracked = match &target.closing {
            Some(position) => {
                let exit = fill.fill_price.unwrap_or(params.reference_price);
                self.tracker
                    .close_position(position.id, exit, CloseReason::Signal, Some(signal.id), Some(record.id))
                    .await
                    .map(|closed| closed.position.id)
                    .map_err(|e| e.to_string())
            }
            None => self
                .tracker
                .open_position(target.account.id, target.venue, signal.id, params, fill)
                .await
                .map(|position| position.id)
                .map_err(|e| e.to_string()),
        };

        match tracked {
            Ok(id) => Some(id),
            Err(message) => {
                error!(
                    signal_id = %signal.id,
                    account_id = %target.account.id,
                    error = %message,
                    "❌ Fill not tracked — needs reconciliation"
                );
                record.needs_reconciliation = true;
                record.reason_code = Some("store_error".into());
                record.failure_reason = Some(message);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CommissionPolicy;
    use crate::credentials::{ApiCredentials, StaticCredentialResolver};
    use crate::engine::normalizer::normalize;
    use crate::exchange::{BalanceSnapshot, PositionSnapshot};
    use crate::ledger::{AccountLocks, Ledger};
    use crate::models::{Account, PlanTier, Position};
    use crate::store::MemoryStore;
    use async_trait::async_trait;
    use chrono::Utc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Binance stand-in whose reply depends on the api key.
    #[derive(Default)]
    struct ScriptedVenue {
        failures: HashMap<String, ExchangeError>,
        submitted: AtomicUsize,
        /// How long each order stays on the wire.
        hold: Duration,
        open_orders: AtomicUsize,
        peak_orders: AtomicUsize,
    }

    #[async_trait]
    impl ExchangeAdapter for ScriptedVenue {
        fn venue(&self) -> Venue {
            Venue::Binance
        }

        async fn submit_order(
            &self,
            creds: &ApiCredentials,
            order: &OrderRequest,
        ) -> Result<OrderResult, ExchangeError> {
            self.submitted.fetch_add(1, Ordering::SeqCst);
            let now = self.open_orders.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak_orders.fetch_max(now, Ordering::SeqCst);
            if !self.hold.is_zero() {
                tokio::time::sleep(self.hold).await;
            }
            self.open_orders.fetch_sub(1, Ordering::SeqCst);
            if let Some(err) = self.failures.get(&creds.api_key) {
                return Err(err.clone());
            }
            Ok(OrderResult {
                order_id: format!("bn-{}", order.client_order_id),
                fill_price: Some(order.reference_price),
                fill_quantity: Some(order.quantity),
                raw: json!({ "status": "FILLED" }),
            })
        }

        async fn query_balance(&self, _creds: &ApiCredentials) -> Result<BalanceSnapshot, ExchangeError> {
            Ok(BalanceSnapshot { currency: "USDT".into(), total: 500.0, available: 500.0 })
        }

        async fn query_position(
            &self,
            _creds: &ApiCredentials,
            _symbol: &str,
        ) -> Result<Option<PositionSnapshot>, ExchangeError> {
            Ok(None)
        }
    }

    struct Harness {
        store:    Arc<MemoryStore>,
        venue:    Arc<ScriptedVenue>,
        engine:   FanoutEngine,
        notifier: Notifier,
        creds:    Arc<StaticCredentialResolver>,
    }

    fn harness(failures: HashMap<String, ExchangeError>) -> Harness {
        harness_with(ScriptedVenue { failures, ..Default::default() }, FanoutConfig::default())
    }

    fn harness_with(venue: ScriptedVenue, config: FanoutConfig) -> Harness {
        let store = Arc::new(MemoryStore::new());
        let venue = Arc::new(venue);
        let registry = ExchangeRegistry::new().with(venue.clone());
        let creds = Arc::new(StaticCredentialResolver::new());
        let notifier = Notifier::default();
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
        let engine = FanoutEngine::new(
            store.clone(),
            registry,
            creds.clone(),
            tracker,
            notifier.clone(),
            OrderPolicy::default(),
            config,
        );
        Harness { store, venue, engine, notifier, creds }
    }

    async fn account(h: &Harness, key: &str) -> EligibleAccount {
        let account = Account::new(PlanTier::Basic, "BRL");
        h.store.save_account(&account).await.unwrap();
        h.creds
            .insert(account.id, Venue::Binance, ApiCredentials {
                api_key: key.into(),
                api_secret: "s".into(),
                passphrase: None,
            })
            .await;
        EligibleAccount { account, venue: Venue::Binance, closing: None }
    }

    fn long_signal() -> Signal {
        normalize("tv", json!({ "ticker": "BTCUSDT", "signal": "LONG", "close": 100 }), Utc::now())
    }

    #[test]
    fn client_order_ids_are_stable() {
        let (s, a) = (Uuid::new_v4(), Uuid::new_v4());
        assert_eq!(client_order_id(s, a), client_order_id(s, a));
        assert_eq!(client_order_id(s, a).len(), 32);
        assert_ne!(client_order_id(s, a), client_order_id(s, Uuid::new_v4()));
    }

    #[tokio::test]
    async fn one_rejection_does_not_stop_siblings() {
        let failures = HashMap::from([(
            "bad".to_string(),
            ExchangeError::Rejected { code: "-2019".into(), message: "Margin is insufficient".into() },
        )]);
        let h = harness(failures);
        let mut events = h.notifier.subscribe();
        let targets = vec![account(&h, "a").await, account(&h, "bad").await, account(&h, "c").await];
        let bad_id = targets[1].account.id;
        let signal = long_signal();

        let summary = h.engine.execute(&signal, targets).await;
        assert_eq!((summary.attempted, summary.succeeded, summary.failed), (3, 2, 1));

        let records = h.store.executions_for_signal(signal.id).await.unwrap();
        assert_eq!(records.len(), 3);
        let failed = records.iter().find(|r| r.account_id == bad_id).unwrap();
        assert!(!failed.success);
        assert_eq!(failed.reason_code.as_deref(), Some("exchange_rejected"));
        assert_eq!(h.store.list_open_positions().await.unwrap().len(), 2);

        let mut saw_failure = false;
        while let Ok(event) = events.try_recv() {
            saw_failure |= event.contains("EXECUTION_FAILED") && event.contains("exchange_rejected");
        }
        assert!(saw_failure);
    }

    async fn peak_orders_for(config: FanoutConfig, accounts: usize) -> (usize, FanoutSummary) {
        let venue = ScriptedVenue { hold: Duration::from_millis(20), ..Default::default() };
        let h = harness_with(venue, config);
        let mut targets = Vec::new();
        for i in 0..accounts {
            targets.push(account(&h, &format!("k{i}")).await);
        }
        let summary = h.engine.execute(&long_signal(), targets).await;
        assert_eq!(h.venue.submitted.load(Ordering::SeqCst), accounts);
        (h.venue.peak_orders.load(Ordering::SeqCst), summary)
    }

    #[tokio::test]
    async fn venue_cap_bounds_in_flight_orders() {
        let config = FanoutConfig { max_parallel: 16, per_venue_parallel: 2 };
        let (peak, summary) = peak_orders_for(config, 6).await;
        assert_eq!(peak, 2);
        assert_eq!(summary.succeeded, 6);
    }

    #[tokio::test]
    async fn global_cap_bounds_concurrent_accounts() {
        let config = FanoutConfig { max_parallel: 3, per_venue_parallel: 8 };
        let (peak, summary) = peak_orders_for(config, 7).await;
        assert_eq!(peak, 3);
        assert_eq!(summary.succeeded, 7);
    }

    #[tokio::test]
    async fn rerun_for_same_signal_is_skipped() {
        let h = harness(HashMap::new());
        let target = account(&h, "a").await;
        let signal = long_signal();

        let first = h.engine.execute(&signal, vec![target.clone()]).await;
        assert_eq!(first.succeeded, 1);
        let second = h.engine.execute(&signal, vec![target]).await;
        assert_eq!(second.skipped_duplicates, 1);
        assert_eq!(second.results[0].execution_id, first.results[0].execution_id);

        assert_eq!(h.venue.submitted.load(Ordering::SeqCst), 1);
        assert_eq!(h.store.executions_for_signal(signal.id).await.unwrap().len(), 1);
        assert_eq!(h.store.list_open_positions().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn ambiguous_submission_is_flagged() {
        let failures = HashMap::from([("a".to_string(), ExchangeError::Ambiguous("reset by peer".into()))]);
        let h = harness(failures);
        let signal = long_signal();
        let summary = h.engine.execute(&signal, vec![account(&h, "a").await]).await;

        let result = &summary.results[0];
        assert_eq!(result.status, DispatchStatus::Failed);
        assert_eq!(result.reason_code.as_deref(), Some("ambiguous_submission"));
        assert!(result.needs_reconciliation);
        assert!(h.store.executions_for_signal(signal.id).await.unwrap()[0].needs_reconciliation);
        assert!(h.store.list_open_positions().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn missing_adapter_or_credentials_are_recorded() {
        let h = harness(HashMap::new());
        let mut okx = account(&h, "a").await;
        okx.venue = Venue::Okx;
        let no_creds = EligibleAccount {
            account: Account::new(PlanTier::Basic, "BRL"),
            venue: Venue::Binance,
            closing: None,
        };
        let signal = long_signal();

        let summary = h.engine.execute(&signal, vec![okx, no_creds]).await;
        let mut codes: Vec<_> = summary.results.iter().filter_map(|r| r.reason_code.clone()).collect();
        codes.sort();
        assert_eq!(codes, vec!["credentials_unavailable", "venue_unsupported"]);
        assert_eq!(h.store.executions_for_signal(signal.id).await.unwrap().len(), 2);
        assert_eq!(h.venue.submitted.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn close_fill_closes_the_tracked_position() {
        let h = harness(HashMap::new());
        let mut target = account(&h, "a").await;
        let open = h.engine.execute(&long_signal(), vec![target.clone()]).await;
        let position_id = open.results[0].position_id.unwrap();
        let position: Position = h.store.get_position(position_id).await.unwrap().unwrap();

        let close = normalize("tv", json!({ "ticker": "BTCUSDT", "signal": "CLOSE LONG", "close": 90 }), Utc::now());
        target.closing = Some(position);
        let summary = h.engine.execute(&close, vec![target]).await;
        assert_eq!(summary.succeeded, 1);

        let closed = h.store.get_position(position_id).await.unwrap().unwrap();
        assert!(!closed.is_open());
        assert_eq!(closed.closing_signal_id, Some(close.id));
        let record = &h.store.executions_for_signal(close.id).await.unwrap()[0];
        assert!(record.params.as_ref().unwrap().reduce_only);
    }
}
