//! # engine::tracker
//!
//! **Position Tracker** — one row per open (account, symbol, side).
//!
//! - [`PositionTracker::open_position`] on a confirmed fill.
//! - [`PositionTracker::apply_mark`] when the market-data collaborator pushes
//!   a price; refreshes mark and unrealized P&L.
//! - [`PositionTracker::close_position`] on a close-signal fill or an
//!   exchange-side closure; hands realized P&L and commission to the ledger.
//! - [`PositionTracker::reconcile_account`] asks each position's venue
//!   whether it still exists and closes the ones that do not.
//!
//! Position writes take the account lock. The ledger takes the same lock
//! itself, so settlement happens after the position update is released.

use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::CommissionPolicy;
use crate::credentials::CredentialResolver;
use crate::error::{StoreError, TrackerError};
use crate::events::{Notification, Notifier};
use crate::exchange::{ExchangeRegistry, OrderResult};
use crate::ledger::{AccountLocks, CommissionPosting, Ledger};
use crate::models::{CloseReason, OrderParams, Position, PositionStatus, Venue};
use crate::store::Store;

#[derive(Debug, Clone, Serialize)]
pub struct ClosedPosition {
    pub position: Position,
    pub posting:  CommissionPosting,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ReconcileReport {
    pub account_id: Uuid,
    pub checked:    usize,
    /// Positions closed because the venue no longer holds them.
    pub closed:     Vec<Uuid>,
    pub errors:     Vec<String>,
}

pub struct PositionTracker {
    store:       Arc<dyn Store>,
    locks:       Arc<AccountLocks>,
    ledger:      Arc<Ledger>,
    registry:    ExchangeRegistry,
    credentials: Arc<dyn CredentialResolver>,
    commission:  CommissionPolicy,
    notifier:    Notifier,
}

impl PositionTracker {
    pub fn new(
        store: Arc<dyn Store>,
        locks: Arc<AccountLocks>,
        ledger: Arc<Ledger>,
        registry: ExchangeRegistry,
        credentials: Arc<dyn CredentialResolver>,
        commission: CommissionPolicy,
        notifier: Notifier,
    ) -> Self {
        Self { store, locks, ledger, registry, credentials, commission, notifier }
    }

    /// Record a fill as a new open position. A second open on the same
    /// (account, symbol, side) is rejected by the store.
    pub async fn open_position(
        &self,
        account_id: Uuid,
        venue: Venue,
        signal_id: Uuid,
        params: &OrderParams,
        fill: &OrderResult,
    ) -> Result<Position, StoreError> {
        let entry_price = fill.fill_price.unwrap_or(params.reference_price);
        let position = Position {
            id: Uuid::new_v4(),
            account_id,
            symbol: params.symbol.clone(),
            side: params.side,
            venue,
            entry_price,
            quantity: fill.fill_quantity.unwrap_or(params.quantity),
            leverage: params.leverage,
            stop_loss: params.stop_loss,
            take_profit: params.take_profit,
            status: PositionStatus::Open,
            mark_price: Some(entry_price),
            unrealized_pnl: 0.0,
            realized_pnl: None,
            commission: None,
            opening_signal_id: signal_id,
            closing_signal_id: None,
            exchange_order_id: Some(fill.order_id.clone()),
            close_reason: None,
            opened_at: Utc::now(),
            closed_at: None,
        };

        {
            let _guard = self.locks.lock(account_id).await;
            self.store.insert_position(&position).await?;
        }

        info!(
            account_id = %account_id,
            position_id = %position.id,
            symbol = %position.symbol,
            side = position.side.as_str(),
            entry = position.entry_price,
            qty = position.quantity,
            "📈 Position opened"
        );
        self.notifier.send(Notification::PositionOpened { position: Box::new(position.clone()) });
        Ok(position)
    }

    /// Refresh mark price and unrealized P&L for every open row on `symbol`.
    pub async fn apply_mark(&self, symbol: &str, price: f64) -> Result<usize, StoreError> {
        if price <= 0.0 || !price.is_finite() {
            return Ok(0);
        }
        let mut updated = 0;
        for stale in self.store.open_positions_for_symbol(symbol, None).await? {
            let _guard = self.locks.lock(stale.account_id).await;
            // Re-read under the lock; a concurrent close must win.
            let Some(mut position) = self.store.get_position(stale.id).await? else { continue };
            if !position.is_open() {
                continue;
            }
            position.mark_price = Some(price);
            position.unrealized_pnl = position.pnl_at(price);
            self.store.update_position(&position).await?;
            updated += 1;
        }
        Ok(updated)
    }

    /// Close at `exit_price`, then settle commission through the ledger.
    pub async fn close_position(
        &self,
        position_id: Uuid,
        exit_price: f64,
        reason: CloseReason,
        closing_signal_id: Option<Uuid>,
        execution_id: Option<Uuid>,
    ) -> Result<ClosedPosition, TrackerError> {
        let stored = self
            .store
            .get_position(position_id)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("position {position_id}")))?;

        let (position, commission) = {
            let _guard = self.locks.lock(stored.account_id).await;
            let Some(mut position) = self.store.get_position(position_id).await? else {
                return Err(StoreError::NotFound(format!("position {position_id}")).into());
            };
            if !position.is_open() {
                return Err(TrackerError::AlreadyClosed(position_id));
            }

            let realized = position.pnl_at(exit_price);
            let commission = self.commission.commission_for(realized);
            position.status = PositionStatus::Closed;
            position.mark_price = Some(exit_price);
            position.unrealized_pnl = 0.0;
            position.realized_pnl = Some(realized);
            position.commission = Some(commission);
            position.close_reason = Some(reason);
            position.closing_signal_id = closing_signal_id;
            position.closed_at = Some(Utc::now());
            self.store.update_position(&position).await?;
            (position, commission)
        };

        info!(
            account_id = %position.account_id,
            position_id = %position.id,
            symbol = %position.symbol,
            exit = exit_price,
            realized = position.realized_pnl.unwrap_or_default(),
            commission,
            reason = ?reason,
            "📉 Position closed"
        );
        self.notifier.send(Notification::PositionClosed {
            position: Box::new(position.clone()),
            commission,
        });

        let posting = self
            .ledger
            .post_commission(position.account_id, commission, execution_id)
            .await
            .map_err(|e| {
                error!(position_id = %position.id, error = %e, "❌ Commission settlement failed");
                e
            })?;
        Ok(ClosedPosition { position, posting })
    }

    /// Close every open row the venue no longer reports (liquidation, SL/TP
    /// hit, manual close on the venue). Exit is the last known mark.
    pub async fn reconcile_account(&self, account_id: Uuid) -> Result<ReconcileReport, TrackerError> {
        let mut report = ReconcileReport { account_id, ..Default::default() };

        for position in self.store.open_positions_for_account(account_id).await? {
            report.checked += 1;
            let Some(adapter) = self.registry.get(position.venue) else {
                report.errors.push(format!("{}: no adapter for {}", position.id, position.venue));
                continue;
            };
            let creds = match self.credentials.resolve(account_id, position.venue).await {
                Ok(creds) => creds,
                Err(e) => {
                    report.errors.push(format!("{}: credentials unavailable: {e:#}", position.id));
                    continue;
                }
            };

            let still_open = match adapter.query_position(&creds, &position.symbol).await {
                Ok(Some(snapshot)) => snapshot.side == position.side && snapshot.quantity > 0.0,
                Ok(None) => false,
                Err(e) => {
                    warn!(position_id = %position.id, error = %e, "Reconcile query failed");
                    report.errors.push(format!("{}: {e}", position.id));
                    continue;
                }
            };
            if still_open {
                continue;
            }

            let exit = position.mark_price.unwrap_or(position.entry_price);
            match self.close_position(position.id, exit, CloseReason::External, None, None).await {
                Ok(_) | Err(TrackerError::AlreadyClosed(_)) => report.closed.push(position.id),
                Err(e) => report.errors.push(format!("{}: {e}", position.id)),
            }
        }

        if !report.closed.is_empty() {
            info!(account_id = %account_id, closed = report.closed.len(), "🔄 External closures reconciled");
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::StaticCredentialResolver;
    use crate::exchange::paper::PaperAdapter;
    use crate::models::{Account, PlanTier, Side};
    use crate::store::MemoryStore;
    use serde_json::json;

    struct Fixture {
        store:   Arc<MemoryStore>,
        tracker: PositionTracker,
        account: Account,
    }

    async fn fixture(real_balance: f64) -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let mut account = Account::new(PlanTier::Basic, "BRL");
        account.real_balance = real_balance;
        store.save_account(&account).await.unwrap();

        let locks = Arc::new(AccountLocks::new());
        let notifier = Notifier::default();
        let ledger = Arc::new(Ledger::new(store.clone(), locks.clone(), notifier.clone()));
        let registry = ExchangeRegistry::new().with(Arc::new(PaperAdapter::new(1_000.0)));
        let tracker = PositionTracker::new(
            store.clone(),
            locks,
            ledger,
            registry,
            Arc::new(StaticCredentialResolver::new()),
            CommissionPolicy::default(),
            notifier,
        );
        Fixture { store, tracker, account }
    }

    fn params(side: Side) -> OrderParams {
        OrderParams {
            symbol: "BTCUSDT".into(),
            side,
            reference_price: 100.0,
            notional: 1_000.0,
            quantity: 10.0,
            leverage: 5,
            stop_loss: 98.0,
            take_profit: 103.0,
            reduce_only: false,
        }
    }

    fn fill(price: f64) -> OrderResult {
        OrderResult { order_id: "o-1".into(), fill_price: Some(price), fill_quantity: None, raw: json!({}) }
    }

    #[tokio::test]
    async fn duplicate_open_is_rejected() {
        let f = fixture(0.0).await;
        f.tracker.open_position(f.account.id, Venue::Paper, Uuid::new_v4(), &params(Side::Long), &fill(100.0)).await.unwrap();
        let err = f.tracker
            .open_position(f.account.id, Venue::Paper, Uuid::new_v4(), &params(Side::Long), &fill(101.0))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Duplicate(_)));
    }

    #[tokio::test]
    async fn marks_refresh_unrealized_pnl() {
        let f = fixture(0.0).await;
        let p = f.tracker.open_position(f.account.id, Venue::Paper, Uuid::new_v4(), &params(Side::Short), &fill(100.0)).await.unwrap();
        assert_eq!(f.tracker.apply_mark("BTCUSDT", 95.0).await.unwrap(), 1);
        let stored = f.store.get_position(p.id).await.unwrap().unwrap();
        assert_eq!(stored.unrealized_pnl, 50.0);
        assert_eq!(stored.mark_price, Some(95.0));
    }

    #[tokio::test]
    async fn profitable_close_charges_commission_into_debt() {
        let f = fixture(0.0).await;
        let p = f.tracker.open_position(f.account.id, Venue::Paper, Uuid::new_v4(), &params(Side::Long), &fill(100.0)).await.unwrap();

        // +10 × 10 = 100 profit, 20% share = 20 commission, nothing to pay it with.
        let closed = f.tracker.close_position(p.id, 110.0, CloseReason::Signal, None, None).await.unwrap();
        assert_eq!(closed.position.realized_pnl, Some(100.0));
        assert_eq!(closed.position.commission, Some(20.0));
        assert!(closed.posting.blocked);

        let account = f.store.get_account(f.account.id).await.unwrap().unwrap();
        assert!(account.operations_blocked);
        assert!(matches!(
            f.tracker.close_position(p.id, 110.0, CloseReason::Signal, None, None).await,
            Err(TrackerError::AlreadyClosed(_))
        ));
    }

    #[tokio::test]
    async fn reconcile_closes_positions_missing_on_the_venue() {
        let f = fixture(100.0).await;
        let p = f.tracker.open_position(f.account.id, Venue::Paper, Uuid::new_v4(), &params(Side::Long), &fill(100.0)).await.unwrap();
        f.tracker.apply_mark("BTCUSDT", 90.0).await.unwrap();

        // The paper venue never saw this order, so it reports no position.
        let report = f.tracker.reconcile_account(f.account.id).await.unwrap();
        assert_eq!(report.checked, 1);
        assert_eq!(report.closed, vec![p.id]);

        let stored = f.store.get_position(p.id).await.unwrap().unwrap();
        assert_eq!(stored.close_reason, Some(CloseReason::External));
        assert_eq!(stored.realized_pnl, Some(-100.0));
        assert_eq!(stored.commission, Some(0.0));
    }
}
