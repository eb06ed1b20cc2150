//! # engine::eligibility
//!
//! **Eligible-User Resolver** — which accounts an approved signal fans out to.
//!
//! Every rule is a pure check in [`check`]; the resolver only loads the
//! state those checks need. Exclusion is never an error: excluded accounts
//! are logged with their [`Exclusion`] and skipped.
//!
//! Ordering is by available balance (highest first), then account id, so a
//! partial outage during a burst hits the smallest accounts last. Ordering
//! never changes who is included.

use std::cmp::Ordering;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::debug;
use uuid::Uuid;

use crate::error::StoreError;
use crate::models::{Account, Position, Signal, Venue};
use crate::store::Store;

const DEBT_EPSILON: f64 = 1e-9;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Exclusion {
    Inactive,
    TradingDisabled,
    SubscriptionExpired,
    /// Paper-only tier on a live signal.
    PaperOnlyTier,
    OperationsBlocked,
    OutstandingDebt,
    NoUsableCredentials,
    /// Already holds a position on this symbol (either side).
    ConflictingPosition,
    MaxOpenPositions,
    /// Close signal, but the account holds nothing to close.
    NoPositionToClose,
    /// The signal carries no side to trade.
    NoSide,
}

#[derive(Debug, Clone)]
pub struct EligibleAccount {
    pub account: Account,
    pub venue:   Venue,
    /// For close signals: the open position being closed.
    pub closing: Option<Position>,
}

#[derive(Debug, Default)]
pub struct Resolution {
    pub eligible: Vec<EligibleAccount>,
    pub excluded: Vec<(Uuid, Exclusion)>,
}

/// All readiness rules for one account against one signal.
///
/// `open_positions` are the account's open rows; `debt` is its uncompensated
/// debt in the execution currency.
pub fn check(
    account: &Account,
    signal: &Signal,
    open_positions: &[Position],
    debt: f64,
    now: DateTime<Utc>,
) -> Result<(Venue, Option<Position>), Exclusion> {
    if !account.active {
        return Err(Exclusion::Inactive);
    }
    if !account.trading_enabled {
        return Err(Exclusion::TradingDisabled);
    }
    if !account.subscription_active(now) {
        return Err(Exclusion::SubscriptionExpired);
    }
    if !signal.paper && !account.tier.allows_live() {
        return Err(Exclusion::PaperOnlyTier);
    }
    if account.operations_blocked {
        return Err(Exclusion::OperationsBlocked);
    }
    if debt > DEBT_EPSILON {
        return Err(Exclusion::OutstandingDebt);
    }
    let side = signal.side.ok_or(Exclusion::NoSide)?;
    let on_symbol = |p: &&Position| p.symbol.eq_ignore_ascii_case(&signal.symbol);

    if signal.is_close() {
        let position = open_positions
            .iter()
            .filter(on_symbol)
            .find(|p| p.side == side)
            .ok_or(Exclusion::NoPositionToClose)?;
        let usable = account
            .credential_for(position.venue)
            .is_some_and(|c| c.is_usable(now));
        if !usable {
            return Err(Exclusion::NoUsableCredentials);
        }
        return Ok((position.venue, Some(position.clone())));
    }

    let venue = account
        .usable_venue(now, signal.paper)
        .ok_or(Exclusion::NoUsableCredentials)?;
    if open_positions.iter().any(|p| on_symbol(&p)) {
        return Err(Exclusion::ConflictingPosition);
    }
    if open_positions.len() >= account.limits.max_open_positions as usize {
        return Err(Exclusion::MaxOpenPositions);
    }
    Ok((venue, None))
}

fn by_priority(a: &EligibleAccount, b: &EligibleAccount) -> Ordering {
    b.account
        .available_balance()
        .partial_cmp(&a.account.available_balance())
        .unwrap_or(Ordering::Equal)
        .then_with(|| a.account.id.cmp(&b.account.id))
}

// ─── Resolver ─────────────────────────────────────────────────────────────────

pub struct EligibilityResolver {
    store:    Arc<dyn Store>,
    /// Execution currency for the debt rule.
    currency: String,
}

impl EligibilityResolver {
    pub fn new(store: Arc<dyn Store>, currency: &str) -> Self {
        Self { store, currency: currency.to_string() }
    }

    pub async fn resolve(&self, signal: &Signal) -> Result<Resolution, StoreError> {
        let now = Utc::now();
        let mut resolution = Resolution::default();

        for account in self.store.list_active_accounts().await? {
            let open = self.store.open_positions_for_account(account.id).await?;
            let debt = self
                .store
                .outstanding_debt(account.id, Some(&self.currency))
                .await?;

            match check(&account, signal, &open, debt, now) {
                Ok((venue, closing)) => {
                    resolution.eligible.push(EligibleAccount { account, venue, closing })
                }
                Err(reason) => {
                    debug!(signal_id = %signal.id, account_id = %account.id, ?reason, "Account excluded");
                    resolution.excluded.push((account.id, reason));
                }
            }
        }

        resolution.eligible.sort_by(by_priority);
        debug!(
            signal_id = %signal.id,
            eligible = resolution.eligible.len(),
            excluded = resolution.excluded.len(),
            "👥 Eligible accounts resolved"
        );
        Ok(resolution)
    }
}
