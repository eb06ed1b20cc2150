//! # store::postgres — PostgreSQL Store
//!
//! Uses `sqlx` runtime queries against the schema in `migrations/001_init.sql`.
//!
//! ## Setup
//! 1. Create the database
//! 2. Set `DATABASE_URL` in `.env`
//! 3. Run with `--features postgres`; the migration is applied on connect

use anyhow::Context;
use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};
use sqlx::{
    postgres::{PgArguments, PgPoolOptions},
    query::Query,
    types::Json,
    Executor, PgPool, Postgres, Row,
};
use tracing::info;
use uuid::Uuid;

use crate::error::StoreError;
use crate::models::{
    Account, DebtEntry, DecisionRecord, ExecutionRecord, OrderParams, Position, Side, Signal,
    SignalStatus,
};
use crate::store::Store;

// ─── Pool Init ────────────────────────────────────────────────────────────────

pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    /// Connect and apply the embedded migration.
    pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
        info!("Connecting to PostgreSQL...");

        let pool = PgPoolOptions::new()
            .max_connections(10)
            .acquire_timeout(std::time::Duration::from_secs(5))
            .connect(database_url)
            .await
            .context("Failed to connect to PostgreSQL")?;

        pool.execute(include_str!("../../migrations/001_init.sql"))
            .await
            .context("Failed to run migration 001_init.sql")?;

        info!("✅ PostgreSQL connected and migrations applied");
        Ok(Self { pool })
    }
}

// ─── Helpers ──────────────────────────────────────────────────────────────────

fn backend(err: sqlx::Error) -> StoreError {
    StoreError::Backend(anyhow::Error::new(err))
}

/// Maps unique-violation (23505) onto `Duplicate`.
fn insert_err(what: String) -> impl FnOnce(sqlx::Error) -> StoreError {
    move |err| match &err {
        sqlx::Error::Database(db) if db.code().as_deref() == Some("23505") => {
            StoreError::Duplicate(what)
        }
        _ => backend(err),
    }
}

/// Enums are stored as their serde string form.
fn encode<T: Serialize>(value: &T) -> String {
    match serde_json::to_value(value) {
        Ok(serde_json::Value::String(s)) => s,
        Ok(other) => other.to_string(),
        Err(_) => String::new(),
    }
}

fn decode<T: DeserializeOwned>(raw: String) -> Result<T, StoreError> {
    serde_json::from_value(serde_json::Value::String(raw.clone()))
        .map_err(|e| StoreError::Backend(anyhow::anyhow!("bad enum value '{raw}': {e}")))
}

fn signal_from_row(row: &sqlx::postgres::PgRow) -> Result<Signal, StoreError> {
    let side: Option<String> = row.try_get("side").map_err(backend)?;
    Ok(Signal {
        id:              row.try_get("id").map_err(backend)?,
        source:          row.try_get("source").map_err(backend)?,
        raw:             row.try_get::<Json<serde_json::Value>, _>("raw").map_err(backend)?.0,
        symbol:          row.try_get("symbol").map_err(backend)?,
        action:          row.try_get("action").map_err(backend)?,
        side:            side.map(decode).transpose()?,
        strength:        decode(row.try_get("strength").map_err(backend)?)?,
        reference_price: row.try_get("reference_price").map_err(backend)?,
        paper:           row.try_get("paper").map_err(backend)?,
        source_time:     row.try_get("source_time").map_err(backend)?,
        received_at:     row.try_get("received_at").map_err(backend)?,
        status:          decode(row.try_get("status").map_err(backend)?)?,
        result:          row.try_get("result").map_err(backend)?,
    })
}

fn account_from_row(row: &sqlx::postgres::PgRow) -> Result<Account, StoreError> {
    Ok(Account {
        id:                 row.try_get("id").map_err(backend)?,
        tier:               decode(row.try_get("tier").map_err(backend)?)?,
        subscription_until: row.try_get("subscription_until").map_err(backend)?,
        trading_enabled:    row.try_get("trading_enabled").map_err(backend)?,
        active:             row.try_get("active").map_err(backend)?,
        credentials:        row.try_get::<Json<_>, _>("credentials").map_err(backend)?.0,
        real_balance:       row.try_get("real_balance").map_err(backend)?,
        bonus_balance:      row.try_get("bonus_balance").map_err(backend)?,
        currency:           row.try_get("currency").map_err(backend)?,
        operations_blocked: row.try_get("operations_blocked").map_err(backend)?,
        limits:             row.try_get::<Json<_>, _>("limits").map_err(backend)?.0,
        created_at:         row.try_get("created_at").map_err(backend)?,
    })
}

fn position_from_row(row: &sqlx::postgres::PgRow) -> Result<Position, StoreError> {
    let close_reason: Option<String> = row.try_get("close_reason").map_err(backend)?;
    Ok(Position {
        id:                row.try_get("id").map_err(backend)?,
        account_id:        row.try_get("account_id").map_err(backend)?,
        symbol:            row.try_get("symbol").map_err(backend)?,
        side:              decode(row.try_get("side").map_err(backend)?)?,
        venue:             decode(row.try_get("venue").map_err(backend)?)?,
        entry_price:       row.try_get("entry_price").map_err(backend)?,
        quantity:          row.try_get("quantity").map_err(backend)?,
        leverage:          row.try_get::<i32, _>("leverage").map_err(backend)?.max(1) as u32,
        stop_loss:         row.try_get("stop_loss").map_err(backend)?,
        take_profit:       row.try_get("take_profit").map_err(backend)?,
        status:            decode(row.try_get("status").map_err(backend)?)?,
        mark_price:        row.try_get("mark_price").map_err(backend)?,
        unrealized_pnl:    row.try_get("unrealized_pnl").map_err(backend)?,
        realized_pnl:      row.try_get("realized_pnl").map_err(backend)?,
        commission:        row.try_get("commission").map_err(backend)?,
        opening_signal_id: row.try_get("opening_signal_id").map_err(backend)?,
        closing_signal_id: row.try_get("closing_signal_id").map_err(backend)?,
        exchange_order_id: row.try_get("exchange_order_id").map_err(backend)?,
        close_reason:      close_reason.map(decode).transpose()?,
        opened_at:         row.try_get("opened_at").map_err(backend)?,
        closed_at:         row.try_get("closed_at").map_err(backend)?,
    })
}

fn execution_from_row(row: &sqlx::postgres::PgRow) -> Result<ExecutionRecord, StoreError> {
    let venue: Option<String> = row.try_get("venue").map_err(backend)?;
    let params: Option<Json<OrderParams>> = row.try_get("params").map_err(backend)?;
    let raw: Option<Json<serde_json::Value>> = row.try_get("raw_response").map_err(backend)?;
    Ok(ExecutionRecord {
        id:                   row.try_get("id").map_err(backend)?,
        signal_id:            row.try_get("signal_id").map_err(backend)?,
        account_id:           row.try_get("account_id").map_err(backend)?,
        venue:                venue.map(decode).transpose()?,
        params:               params.map(|p| p.0),
        order_id:             row.try_get("order_id").map_err(backend)?,
        fill_price:           row.try_get("fill_price").map_err(backend)?,
        fill_quantity:        row.try_get("fill_quantity").map_err(backend)?,
        success:              row.try_get("success").map_err(backend)?,
        reason_code:          row.try_get("reason_code").map_err(backend)?,
        failure_reason:       row.try_get("failure_reason").map_err(backend)?,
        raw_response:         raw.map(|r| r.0),
        needs_reconciliation: row.try_get("needs_reconciliation").map_err(backend)?,
        latency_ms:           row.try_get::<i64, _>("latency_ms").map_err(backend)?.max(0) as u64,
        created_at:           row.try_get("created_at").map_err(backend)?,
    })
}

fn debt_from_row(row: &sqlx::postgres::PgRow) -> Result<DebtEntry, StoreError> {
    Ok(DebtEntry {
        id:                  row.try_get("id").map_err(backend)?,
        account_id:          row.try_get("account_id").map_err(backend)?,
        currency:            row.try_get("currency").map_err(backend)?,
        amount:              row.try_get("amount").map_err(backend)?,
        original_amount:     row.try_get("original_amount").map_err(backend)?,
        origin_execution_id: row.try_get("origin_execution_id").map_err(backend)?,
        compensated:         row.try_get("compensated").map_err(backend)?,
        compensated_at:      row.try_get("compensated_at").map_err(backend)?,
        created_at:          row.try_get("created_at").map_err(backend)?,
    })
}


fn upsert_account(a: &Account) -> Query<'_, Postgres, PgArguments> {
    sqlx::query(
        r#"
        INSERT INTO accounts
          (id, tier, subscription_until, trading_enabled, active, credentials,
           real_balance, bonus_balance, currency, operations_blocked, limits, created_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
        ON CONFLICT (id) DO UPDATE SET
          tier               = EXCLUDED.tier,
          subscription_until = EXCLUDED.subscription_until,
          trading_enabled    = EXCLUDED.trading_enabled,
          active             = EXCLUDED.active,
          credentials        = EXCLUDED.credentials,
          real_balance       = EXCLUDED.real_balance,
          bonus_balance      = EXCLUDED.bonus_balance,
          currency           = EXCLUDED.currency,
          operations_blocked = EXCLUDED.operations_blocked,
          limits             = EXCLUDED.limits
        "#,
    )
    .bind(a.id)
    .bind(encode(&a.tier))
    .bind(a.subscription_until)
    .bind(a.trading_enabled)
    .bind(a.active)
    .bind(Json(&a.credentials))
    .bind(a.real_balance)
    .bind(a.bonus_balance)
    .bind(&a.currency)
    .bind(a.operations_blocked)
    .bind(Json(&a.limits))
    .bind(a.created_at)
}

fn upsert_debt(d: &DebtEntry) -> Query<'_, Postgres, PgArguments> {
    sqlx::query(
        r#"
        INSERT INTO debt_entries
          (id, account_id, currency, amount, original_amount, origin_execution_id,
           compensated, compensated_at, created_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
        ON CONFLICT (id) DO UPDATE SET
          amount         = EXCLUDED.amount,
          compensated    = EXCLUDED.compensated,
          compensated_at = EXCLUDED.compensated_at
        "#,
    )
    .bind(d.id)
    .bind(d.account_id)
    .bind(&d.currency)
    .bind(d.amount)
    .bind(d.original_amount)
    .bind(d.origin_execution_id)
    .bind(d.compensated)
    .bind(d.compensated_at)
    .bind(d.created_at)
}

// ─── Store impl ───────────────────────────────────────────────────────────────

#[async_trait]
impl Store for PgStore {
    async fn insert_signal(&self, signal: &Signal) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO signals
              (id, source, raw, symbol, action, side, strength, reference_price,
               paper, source_time, received_at, status, result)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            "#,
        )
        .bind(signal.id)
        .bind(&signal.source)
        .bind(Json(&signal.raw))
        .bind(&signal.symbol)
        .bind(&signal.action)
        .bind(signal.side.map(|s| encode(&s)))
        .bind(encode(&signal.strength))
        .bind(signal.reference_price)
        .bind(signal.paper)
        .bind(signal.source_time)
        .bind(signal.received_at)
        .bind(signal.status.as_str())
        .bind(&signal.result)
        .execute(&self.pool)
        .await
        .map_err(insert_err(format!("signal {}", signal.id)))?;
        Ok(())
    }

    async fn update_signal_status(
        &self,
        id: Uuid,
        status: SignalStatus,
        result: Option<String>,
    ) -> Result<(), StoreError> {
        let done = sqlx::query(
            "UPDATE signals SET status = $2, result = COALESCE($3, result) WHERE id = $1",
        )
        .bind(id)
        .bind(status.as_str())
        .bind(result)
        .execute(&self.pool)
        .await
        .map_err(backend)?;
        if done.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("signal {id}")));
        }
        Ok(())
    }

    async fn get_signal(&self, id: Uuid) -> Result<Option<Signal>, StoreError> {
        let row = sqlx::query("SELECT * FROM signals WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(backend)?;
        row.as_ref().map(signal_from_row).transpose()
    }

    async fn insert_decision(&self, d: &DecisionRecord) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO decisions
              (signal_id, approved, confidence, reason_text, reason_code,
               sentiment_index, trend, dominant_share_pct, decided_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(d.signal_id)
        .bind(d.approved)
        .bind(d.confidence)
        .bind(&d.reason_text)
        .bind(&d.reason_code)
        .bind(d.sentiment_index)
        .bind(d.trend.map(|t| encode(&t)))
        .bind(d.dominant_share_pct)
        .bind(d.decided_at)
        .execute(&self.pool)
        .await
        .map_err(insert_err(format!("decision for signal {}", d.signal_id)))?;
        Ok(())
    }

    async fn list_active_accounts(&self) -> Result<Vec<Account>, StoreError> {
        let rows = sqlx::query("SELECT * FROM accounts WHERE active")
            .fetch_all(&self.pool)
            .await
            .map_err(backend)?;
        rows.iter().map(account_from_row).collect()
    }

    async fn get_account(&self, id: Uuid) -> Result<Option<Account>, StoreError> {
        let row = sqlx::query("SELECT * FROM accounts WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(backend)?;
        row.as_ref().map(account_from_row).transpose()
    }

    async fn save_account(&self, a: &Account) -> Result<(), StoreError> {
        upsert_account(a).execute(&self.pool).await.map_err(backend)?;
        Ok(())
    }

    async fn insert_position(&self, p: &Position) -> Result<(), StoreError> {
        // The partial unique index `positions_open_key` enforces one open row per key.
        sqlx::query(
            r#"
            INSERT INTO positions
              (id, account_id, symbol, side, venue, entry_price, quantity, leverage,
               stop_loss, take_profit, status, mark_price, unrealized_pnl, realized_pnl,
               commission, opening_signal_id, closing_signal_id, exchange_order_id,
               close_reason, opened_at, closed_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14,
                    $15, $16, $17, $18, $19, $20, $21)
            "#,
        )
        .bind(p.id)
        .bind(p.account_id)
        .bind(&p.symbol)
        .bind(encode(&p.side))
        .bind(encode(&p.venue))
        .bind(p.entry_price)
        .bind(p.quantity)
        .bind(p.leverage as i32)
        .bind(p.stop_loss)
        .bind(p.take_profit)
        .bind(encode(&p.status))
        .bind(p.mark_price)
        .bind(p.unrealized_pnl)
        .bind(p.realized_pnl)
        .bind(p.commission)
        .bind(p.opening_signal_id)
        .bind(p.closing_signal_id)
        .bind(&p.exchange_order_id)
        .bind(p.close_reason.map(|r| encode(&r)))
        .bind(p.opened_at)
        .bind(p.closed_at)
        .execute(&self.pool)
        .await
        .map_err(insert_err(format!(
            "open position {} {} for account {}",
            p.symbol,
            p.side.as_str(),
            p.account_id
        )))?;
        Ok(())
    }

    async fn update_position(&self, p: &Position) -> Result<(), StoreError> {
        let done = sqlx::query(
            r#"
            UPDATE positions SET
              status = $2, mark_price = $3, unrealized_pnl = $4, realized_pnl = $5,
              commission = $6, closing_signal_id = $7, close_reason = $8, closed_at = $9
            WHERE id = $1
            "#,
        )
        .bind(p.id)
        .bind(encode(&p.status))
        .bind(p.mark_price)
        .bind(p.unrealized_pnl)
        .bind(p.realized_pnl)
        .bind(p.commission)
        .bind(p.closing_signal_id)
        .bind(p.close_reason.map(|r| encode(&r)))
        .bind(p.closed_at)
        .execute(&self.pool)
        .await
        .map_err(backend)?;
        if done.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("position {}", p.id)));
        }
        Ok(())
    }

    async fn get_position(&self, id: Uuid) -> Result<Option<Position>, StoreError> {
        let row = sqlx::query("SELECT * FROM positions WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(backend)?;
        row.as_ref().map(position_from_row).transpose()
    }

    async fn open_positions_for_account(&self, account_id: Uuid) -> Result<Vec<Position>, StoreError> {
        let rows = sqlx::query("SELECT * FROM positions WHERE status = 'OPEN' AND account_id = $1")
            .bind(account_id)
            .fetch_all(&self.pool)
            .await
            .map_err(backend)?;
        rows.iter().map(position_from_row).collect()
    }

    async fn open_positions_for_symbol(
        &self,
        symbol: &str,
        side: Option<Side>,
    ) -> Result<Vec<Position>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM positions
            WHERE status = 'OPEN' AND upper(symbol) = upper($1) AND ($2::TEXT IS NULL OR side = $2)
            "#,
        )
        .bind(symbol)
        .bind(side.map(|s| encode(&s)))
        .fetch_all(&self.pool)
        .await
        .map_err(backend)?;
        rows.iter().map(position_from_row).collect()
    }

    async fn list_open_positions(&self) -> Result<Vec<Position>, StoreError> {
        let rows = sqlx::query("SELECT * FROM positions WHERE status = 'OPEN' ORDER BY opened_at")
            .fetch_all(&self.pool)
            .await
            .map_err(backend)?;
        rows.iter().map(position_from_row).collect()
    }

    async fn insert_execution(&self, r: &ExecutionRecord) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO execution_records
              (id, signal_id, account_id, venue, params, order_id, fill_price, fill_quantity,
               success, reason_code, failure_reason, raw_response, needs_reconciliation,
               latency_ms, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
            "#,
        )
        .bind(r.id)
        .bind(r.signal_id)
        .bind(r.account_id)
        .bind(r.venue.map(|v| encode(&v)))
        .bind(r.params.as_ref().map(Json))
        .bind(&r.order_id)
        .bind(r.fill_price)
        .bind(r.fill_quantity)
        .bind(r.success)
        .bind(&r.reason_code)
        .bind(&r.failure_reason)
        .bind(r.raw_response.as_ref().map(Json))
        .bind(r.needs_reconciliation)
        .bind(r.latency_ms as i64)
        .bind(r.created_at)
        .execute(&self.pool)
        .await
        .map_err(insert_err(format!(
            "execution for signal {} account {}",
            r.signal_id, r.account_id
        )))?;
        Ok(())
    }

    async fn find_execution(
        &self,
        signal_id: Uuid,
        account_id: Uuid,
    ) -> Result<Option<ExecutionRecord>, StoreError> {
        let row = sqlx::query(
            "SELECT * FROM execution_records WHERE signal_id = $1 AND account_id = $2",
        )
        .bind(signal_id)
        .bind(account_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(backend)?;
        row.as_ref().map(execution_from_row).transpose()
    }

    async fn executions_for_signal(&self, signal_id: Uuid) -> Result<Vec<ExecutionRecord>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM execution_records WHERE signal_id = $1 ORDER BY created_at",
        )
        .bind(signal_id)
        .fetch_all(&self.pool)
        .await
        .map_err(backend)?;
        rows.iter().map(execution_from_row).collect()
    }

    async fn insert_debt(&self, d: &DebtEntry) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO debt_entries
              (id, account_id, currency, amount, original_amount, origin_execution_id,
               compensated, compensated_at, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(d.id)
        .bind(d.account_id)
        .bind(&d.currency)
        .bind(d.amount)
        .bind(d.original_amount)
        .bind(d.origin_execution_id)
        .bind(d.compensated)
        .bind(d.compensated_at)
        .bind(d.created_at)
        .execute(&self.pool)
        .await
        .map_err(insert_err(format!("debt {}", d.id)))?;
        Ok(())
    }

    async fn commit_ledger(&self, account: &Account, debts: &[DebtEntry]) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await.map_err(backend)?;
        for debt in debts {
            upsert_debt(debt).execute(&mut *tx).await.map_err(backend)?;
        }
        upsert_account(account).execute(&mut *tx).await.map_err(backend)?;
        tx.commit().await.map_err(backend)?;
        Ok(())
    }

    async fn open_debts(
        &self,
        account_id: Uuid,
        currency: Option<&str>,
    ) -> Result<Vec<DebtEntry>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM debt_entries
            WHERE account_id = $1 AND NOT compensated AND amount > 0
              AND ($2::TEXT IS NULL OR currency = $2)
            ORDER BY created_at, id
            "#,
        )
        .bind(account_id)
        .bind(currency)
        .fetch_all(&self.pool)
        .await
        .map_err(backend)?;
        rows.iter().map(debt_from_row).collect()
    }
}
