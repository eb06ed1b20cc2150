//! # store — Persistence Layer
//!
//! Every persisted record (signals, decisions, accounts, positions,
//! execution records, debt entries) goes through [`Store`].
//!
//! - [`memory::MemoryStore`]: default; process-local, used by tests and dev.
//! - `postgres::PgStore`: `--features postgres`; schema in `migrations/001_init.sql`.
//!
//! Both enforce the two uniqueness rules the fan-out engine relies on:
//! one open position per (account, symbol, side), and one execution record
//! per (signal, account). Violations surface as [`StoreError::Duplicate`].

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::StoreError;
use crate::models::{
    Account, DebtEntry, DecisionRecord, ExecutionRecord, Position, Side, Signal, SignalStatus,
};

pub mod memory;
#[cfg(feature = "postgres")]
pub mod postgres;

pub use memory::MemoryStore;

#[async_trait]
pub trait Store: Send + Sync {
    // ── Signals ───────────────────────────────────────────────────────────────
    async fn insert_signal(&self, signal: &Signal) -> Result<(), StoreError>;
    async fn update_signal_status(
        &self,
        id: Uuid,
        status: SignalStatus,
        result: Option<String>,
    ) -> Result<(), StoreError>;
    async fn get_signal(&self, id: Uuid) -> Result<Option<Signal>, StoreError>;

    // ── Decisions ─────────────────────────────────────────────────────────────
    async fn insert_decision(&self, decision: &DecisionRecord) -> Result<(), StoreError>;

    // ── Accounts ──────────────────────────────────────────────────────────────
    /// Active (not deactivated) accounts.
    async fn list_active_accounts(&self) -> Result<Vec<Account>, StoreError>;
    async fn get_account(&self, id: Uuid) -> Result<Option<Account>, StoreError>;
    /// Insert or replace.
    async fn save_account(&self, account: &Account) -> Result<(), StoreError>;

    // ── Positions ─────────────────────────────────────────────────────────────
    /// Fails with `Duplicate` if an open position already holds the key.
    async fn insert_position(&self, position: &Position) -> Result<(), StoreError>;
    async fn update_position(&self, position: &Position) -> Result<(), StoreError>;
    async fn get_position(&self, id: Uuid) -> Result<Option<Position>, StoreError>;
    async fn open_positions_for_account(&self, account_id: Uuid) -> Result<Vec<Position>, StoreError>;
    /// Open positions on `symbol`, optionally restricted to one side.
    async fn open_positions_for_symbol(
        &self,
        symbol: &str,
        side: Option<Side>,
    ) -> Result<Vec<Position>, StoreError>;
    async fn list_open_positions(&self) -> Result<Vec<Position>, StoreError>;

    // ── Execution records ─────────────────────────────────────────────────────
    /// Fails with `Duplicate` if a record already exists for (signal, account).
    async fn insert_execution(&self, record: &ExecutionRecord) -> Result<(), StoreError>;
    async fn find_execution(
        &self,
        signal_id: Uuid,
        account_id: Uuid,
    ) -> Result<Option<ExecutionRecord>, StoreError>;
    async fn executions_for_signal(&self, signal_id: Uuid) -> Result<Vec<ExecutionRecord>, StoreError>;

    // ── Debt ──────────────────────────────────────────────────────────────────
    async fn insert_debt(&self, debt: &DebtEntry) -> Result<(), StoreError>;
    /// Write `debts` (insert or overwrite by id) and `account` as one unit:
    /// either every row lands or none does.
    async fn commit_ledger(&self, account: &Account, debts: &[DebtEntry]) -> Result<(), StoreError>;
    /// Uncompensated entries, oldest first. `None` = every currency.
    async fn open_debts(
        &self,
        account_id: Uuid,
        currency: Option<&str>,
    ) -> Result<Vec<DebtEntry>, StoreError>;

    async fn outstanding_debt(
        &self,
        account_id: Uuid,
        currency: Option<&str>,
    ) -> Result<f64, StoreError> {
        Ok(self
            .open_debts(account_id, currency)
            .await?
            .iter()
            .map(|d| d.amount)
            .sum())
    }
}
