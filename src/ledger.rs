//! # ledger — Debt & Balance Ledger
//!
//! Sole writer of account balance fields and debt entries.
//!
//! ## Rules
//! 1. Commission draws the bonus balance first, then the real balance.
//! 2. A shortfall is never an error: it becomes a [`DebtEntry`] and the
//!    account is blocked from every future fan-out.
//! 3. A top-up pays outstanding debt oldest-first, then credits the real
//!    balance with whatever is left.
//! 4. The block clears once the account owes nothing in any currency.
//!
//! Every read-modify-write runs under the account's lock in
//! [`AccountLocks`], so concurrent top-ups and postings for one account
//! serialize while different accounts proceed in parallel. Each step's
//! debt rows and account balances land through one
//! [`Store::commit_ledger`] call, so a failed write changes nothing.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use serde::Serialize;
use tokio::sync::OwnedMutexGuard;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::LedgerError;
use crate::events::{Notification, Notifier};
use crate::models::DebtEntry;
use crate::store::Store;

/// Amounts below this are treated as settled.
const EPSILON: f64 = 1e-9;

// ─── Per-account locks ────────────────────────────────────────────────────────

/// Lazily created async mutex per account id.
#[derive(Default)]
pub struct AccountLocks {
    locks: Mutex<HashMap<Uuid, Arc<tokio::sync::Mutex<()>>>>,
}

impl AccountLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn lock(&self, account_id: Uuid) -> OwnedMutexGuard<()> {
        let lock = {
            let mut map = self.locks.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            map.entry(account_id).or_default().clone()
        };
        lock.lock_owned().await
    }
}

// ─── Results ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CommissionPosting {
    pub account_id:      Uuid,
    pub commission:      f64,
    pub paid_from_bonus: f64,
    pub paid_from_real:  f64,
    pub debt:            Option<DebtEntry>,
    pub blocked:         bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TopUpReceipt {
    pub account_id:      Uuid,
    pub amount:          f64,
    pub applied_to_debt: f64,
    pub credited:        f64,
    /// Debt entries fully paid by this top-up, oldest first.
    pub compensated:     Vec<Uuid>,
    pub remaining_debt:  f64,
    pub blocked:         bool,
    pub available_balance: f64,
}

// ─── Ledger ───────────────────────────────────────────────────────────────────

pub struct Ledger {
    store:    Arc<dyn Store>,
    locks:    Arc<AccountLocks>,
    notifier: Notifier,
}

impl Ledger {
    pub fn new(store: Arc<dyn Store>, locks: Arc<AccountLocks>, notifier: Notifier) -> Self {
        Self { store, locks, notifier }
    }

    /// Charge a closure's commission. Zero commission posts nothing.
    pub async fn post_commission(
        &self,
        account_id: Uuid,
        commission: f64,
        origin_execution_id: Option<Uuid>,
    ) -> Result<CommissionPosting, LedgerError> {
        if commission < 0.0 || !commission.is_finite() {
            return Err(LedgerError::NonPositiveAmount(commission));
        }

        let _guard = self.locks.lock(account_id).await;
        let mut account = self
            .store
            .get_account(account_id)
            .await?
            .ok_or(LedgerError::UnknownAccount(account_id))?;

        if commission <= EPSILON {
            return Ok(CommissionPosting {
                account_id,
                commission: 0.0,
                paid_from_bonus: 0.0,
                paid_from_real: 0.0,
                debt: None,
                blocked: account.operations_blocked,
            });
        }

        let from_bonus = account.bonus_balance.max(0.0).min(commission);
        let rest = commission - from_bonus;
        let from_real = account.real_balance.max(0.0).min(rest);
        let shortfall = rest - from_real;

        account.bonus_balance -= from_bonus;
        account.real_balance -= from_real;

        let debt = if shortfall > EPSILON {
            account.operations_blocked = true;
            Some(DebtEntry::new(account_id, &account.currency, shortfall, origin_execution_id))
        } else {
            None
        };
        self.store.commit_ledger(&account, debt.as_slice()).await?;

        if let Some(debt) = &debt {
            warn!(
                account_id = %account_id,
                commission,
                shortfall = debt.amount,
                currency = %debt.currency,
                "🧾 Commission exceeds balance — debt recorded, account blocked"
            );
            self.notifier.send(Notification::DebtCreated {
                account_id,
                amount: debt.amount,
                currency: debt.currency.clone(),
                blocked: true,
            });
        } else {
            info!(account_id = %account_id, commission, from_bonus, from_real, "💸 Commission charged");
        }

        Ok(CommissionPosting {
            account_id,
            commission,
            paid_from_bonus: from_bonus,
            paid_from_real: from_real,
            debt,
            blocked: account.operations_blocked,
        })
    }

    /// Apply a recharge: debts oldest-first, remainder to the real balance.
    pub async fn top_up(
        &self,
        account_id: Uuid,
        amount: f64,
        currency: &str,
    ) -> Result<TopUpReceipt, LedgerError> {
        if amount <= 0.0 || !amount.is_finite() {
            return Err(LedgerError::NonPositiveAmount(amount));
        }

        let _guard = self.locks.lock(account_id).await;
        let mut account = self
            .store
            .get_account(account_id)
            .await?
            .ok_or(LedgerError::UnknownAccount(account_id))?;

        if !account.currency.eq_ignore_ascii_case(currency) {
            return Err(LedgerError::CurrencyMismatch {
                expected: account.currency.clone(),
                got: currency.to_string(),
            });
        }

        let outstanding = self.store.outstanding_debt(account_id, None).await?;
        let mut remaining = amount;
        let mut compensated = Vec::new();
        let mut touched = Vec::new();
        for mut debt in self.store.open_debts(account_id, Some(&account.currency)).await? {
            if remaining <= EPSILON {
                break;
            }
            let pay = remaining.min(debt.amount);
            debt.amount -= pay;
            remaining -= pay;
            if debt.amount <= EPSILON {
                debt.amount = 0.0;
                debt.compensated = true;
                debt.compensated_at = Some(Utc::now());
                compensated.push(debt.id);
            }
            touched.push(debt);
        }

        let applied = amount - remaining;
        account.real_balance += remaining;

        let remaining_debt = (outstanding - applied).max(0.0);
        let was_blocked = account.operations_blocked;
        if remaining_debt <= EPSILON {
            account.operations_blocked = false;
        }
        self.store.commit_ledger(&account, &touched).await?;

        info!(
            account_id = %account_id,
            amount,
            applied_to_debt = applied,
            credited = remaining,
            remaining_debt,
            "💰 Top-up applied"
        );
        if applied > EPSILON {
            self.notifier.send(Notification::DebtCompensated {
                account_id,
                applied,
                remaining: remaining_debt,
                unblocked: was_blocked && !account.operations_blocked,
            });
        }

        Ok(TopUpReceipt {
            account_id,
            amount,
            applied_to_debt: applied,
            credited: remaining,
            compensated,
            remaining_debt,
            blocked: account.operations_blocked,
            available_balance: account.available_balance(),
        })
    }
}
