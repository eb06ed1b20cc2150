//! # store::memory
//!
//! Process-local [`Store`]. One `RwLock` guards all tables so the
//! uniqueness checks and the inserts they protect happen under the same
//! write guard.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::StoreError;
use crate::models::{
    Account, DebtEntry, DecisionRecord, ExecutionRecord, Position, Side, Signal, SignalStatus,
};
use crate::store::Store;

#[derive(Debug, Default)]
struct Tables {
    signals:    HashMap<Uuid, Signal>,
    decisions:  Vec<DecisionRecord>,
    accounts:   HashMap<Uuid, Account>,
    positions:  HashMap<Uuid, Position>,
    executions: HashMap<(Uuid, Uuid), ExecutionRecord>,
    debts:      Vec<DebtEntry>,
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every persisted decision, in insertion order.
    pub async fn decisions(&self) -> Vec<DecisionRecord> {
        self.tables.read().await.decisions.clone()
    }

    pub async fn all_debts(&self, account_id: Uuid) -> Vec<DebtEntry> {
        self.tables
            .read()
            .await
            .debts
            .iter()
            .filter(|d| d.account_id == account_id)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn insert_signal(&self, signal: &Signal) -> Result<(), StoreError> {
        let mut t = self.tables.write().await;
        if t.signals.contains_key(&signal.id) {
            return Err(StoreError::Duplicate(format!("signal {}", signal.id)));
        }
        t.signals.insert(signal.id, signal.clone());
        Ok(())
    }

    async fn update_signal_status(
        &self,
        id: Uuid,
        status: SignalStatus,
        result: Option<String>,
    ) -> Result<(), StoreError> {
        let mut t = self.tables.write().await;
        let signal = t
            .signals
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(format!("signal {id}")))?;
        signal.status = status;
        if result.is_some() {
            signal.result = result;
        }
        Ok(())
    }

    async fn get_signal(&self, id: Uuid) -> Result<Option<Signal>, StoreError> {
        Ok(self.tables.read().await.signals.get(&id).cloned())
    }

    async fn insert_decision(&self, decision: &DecisionRecord) -> Result<(), StoreError> {
        self.tables.write().await.decisions.push(decision.clone());
        Ok(())
    }

    async fn list_active_accounts(&self) -> Result<Vec<Account>, StoreError> {
        Ok(self
            .tables
            .read()
            .await
            .accounts
            .values()
            .filter(|a| a.active)
            .cloned()
            .collect())
    }

    async fn get_account(&self, id: Uuid) -> Result<Option<Account>, StoreError> {
        Ok(self.tables.read().await.accounts.get(&id).cloned())
    }

    async fn save_account(&self, account: &Account) -> Result<(), StoreError> {
        self.tables.write().await.accounts.insert(account.id, account.clone());
        Ok(())
    }

    async fn insert_position(&self, position: &Position) -> Result<(), StoreError> {
        let mut t = self.tables.write().await;
        let key = position.key();
        let taken = t.positions.values().any(|p| {
            p.is_open()
                && p.account_id == key.account_id
                && p.side == key.side
                && p.symbol.eq_ignore_ascii_case(&key.symbol)
        });
        if taken {
            return Err(StoreError::Duplicate(format!(
                "open position {} {} for account {}",
                key.symbol,
                key.side.as_str(),
                key.account_id
            )));
        }
        t.positions.insert(position.id, position.clone());
        Ok(())
    }

    async fn update_position(&self, position: &Position) -> Result<(), StoreError> {
        let mut t = self.tables.write().await;
        match t.positions.get_mut(&position.id) {
            Some(slot) => {
                *slot = position.clone();
                Ok(())
            }
            None => Err(StoreError::NotFound(format!("position {}", position.id))),
        }
    }

    async fn get_position(&self, id: Uuid) -> Result<Option<Position>, StoreError> {
        Ok(self.tables.read().await.positions.get(&id).cloned())
    }

    async fn open_positions_for_account(&self, account_id: Uuid) -> Result<Vec<Position>, StoreError> {
        Ok(self
            .tables
            .read()
            .await
            .positions
            .values()
            .filter(|p| p.is_open() && p.account_id == account_id)
            .cloned()
            .collect())
    }

    async fn open_positions_for_symbol(
        &self,
        symbol: &str,
        side: Option<Side>,
    ) -> Result<Vec<Position>, StoreError> {
        Ok(self
            .tables
            .read()
            .await
            .positions
            .values()
            .filter(|p| p.is_open() && p.symbol.eq_ignore_ascii_case(symbol))
            .filter(|p| side.map(|s| p.side == s).unwrap_or(true))
            .cloned()
            .collect())
    }

    async fn list_open_positions(&self) -> Result<Vec<Position>, StoreError> {
        let mut open: Vec<Position> = self
            .tables
            .read()
            .await
            .positions
            .values()
            .filter(|p| p.is_open())
            .cloned()
            .collect();
        open.sort_by_key(|p| p.opened_at);
        Ok(open)
    }

    async fn insert_execution(&self, record: &ExecutionRecord) -> Result<(), StoreError> {
        let mut t = self.tables.write().await;
        let key = (record.signal_id, record.account_id);
        if t.executions.contains_key(&key) {
            return Err(StoreError::Duplicate(format!(
                "execution for signal {} account {}",
                record.signal_id, record.account_id
            )));
        }
        t.executions.insert(key, record.clone());
        Ok(())
    }

    async fn find_execution(
        &self,
        signal_id: Uuid,
        account_id: Uuid,
    ) -> Result<Option<ExecutionRecord>, StoreError> {
        Ok(self
            .tables
            .read()
            .await
            .executions
            .get(&(signal_id, account_id))
            .cloned())
    }

    async fn executions_for_signal(&self, signal_id: Uuid) -> Result<Vec<ExecutionRecord>, StoreError> {
        let mut records: Vec<ExecutionRecord> = self
            .tables
            .read()
            .await
            .executions
            .values()
            .filter(|r| r.signal_id == signal_id)
            .cloned()
            .collect();
        records.sort_by_key(|r| r.created_at);
        Ok(records)
    }

    async fn insert_debt(&self, debt: &DebtEntry) -> Result<(), StoreError> {
        self.tables.write().await.debts.push(debt.clone());
        Ok(())
    }

    async fn commit_ledger(&self, account: &Account, debts: &[DebtEntry]) -> Result<(), StoreError> {
        let mut t = self.tables.write().await;
        for debt in debts {
            match t.debts.iter_mut().find(|d| d.id == debt.id) {
                Some(slot) => *slot = debt.clone(),
                None => t.debts.push(debt.clone()),
            }
        }
        t.accounts.insert(account.id, account.clone());
        Ok(())
    }

    async fn open_debts(
        &self,
        account_id: Uuid,
        currency: Option<&str>,
    ) -> Result<Vec<DebtEntry>, StoreError> {
        // `debts` is append-only, so insertion order is age order.
        Ok(self
            .tables
            .read()
            .await
            .debts
            .iter()
            .filter(|d| d.account_id == account_id && d.is_outstanding())
            .filter(|d| currency.map(|c| d.currency == c).unwrap_or(true))
            .cloned()
            .collect())
    }
}
