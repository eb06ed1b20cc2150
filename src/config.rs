//! # config
//!
//! Every component owns a small config struct with a `from_env()` constructor
//! that falls back to the documented default when a variable is missing or
//! does not parse. [`Config`] aggregates them and is built once in `main`.

use std::time::Duration;

use anyhow::bail;

use crate::exchange::retry::RetryPolicy;

// ─── Env helpers ──────────────────────────────────────────────────────────────

pub(crate) fn env_f64(key: &str, default: f64) -> f64 {
    std::env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}
pub(crate) fn env_u32(key: &str, default: u32) -> u32 {
    std::env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}
pub(crate) fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}
pub(crate) fn env_usize(key: &str, default: usize) -> usize {
    std::env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}
pub(crate) fn env_string(key: &str, default: &str) -> String {
    std::env::var(key)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .unwrap_or_else(|| default.to_string())
}

// ─── Fan-out ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct FanoutConfig {
    /// Upper bound on concurrent per-account tasks for one signal.
    pub max_parallel: usize,
    /// Upper bound on in-flight requests per venue, shared across signals.
    pub per_venue_parallel: usize,
}

impl FanoutConfig {
    pub fn from_env() -> Self {
        Self {
            max_parallel:       env_usize("FANOUT_MAX_PARALLEL", 16).max(1),
            per_venue_parallel: env_usize("FANOUT_PER_VENUE_PARALLEL", 8).max(1),
        }
    }
}

impl Default for FanoutConfig {
    fn default() -> Self {
        Self { max_parallel: 16, per_venue_parallel: 8 }
    }
}

// ─── Order Policy ─────────────────────────────────────────────────────────────

/// Global sizing/leverage/protection bounds. Account-level limits can only
/// tighten these, never widen them.
#[derive(Debug, Clone)]
pub struct OrderPolicy {
    /// Share of available balance committed as margin per order (percent).
    pub risk_pct: f64,
    pub min_notional: f64,
    pub max_notional: f64,
    pub default_leverage: u32,
    pub min_leverage: u32,
    pub max_leverage: u32,
    /// One volatility unit, as a percent of the reference price.
    pub volatility_unit_pct: f64,
    pub sl_multiplier: f64,
    pub tp_multiplier: f64,
    pub max_sl_pct: f64,
    pub max_tp_pct: f64,
}

impl OrderPolicy {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            risk_pct:            env_f64("ORDER_RISK_PCT", d.risk_pct),
            min_notional:        env_f64("ORDER_MIN_NOTIONAL", d.min_notional),
            max_notional:        env_f64("ORDER_MAX_NOTIONAL", d.max_notional),
            default_leverage:    env_u32("ORDER_LEVERAGE_DEFAULT", d.default_leverage),
            min_leverage:        env_u32("ORDER_LEVERAGE_MIN", d.min_leverage).max(1),
            max_leverage:        env_u32("ORDER_LEVERAGE_MAX", d.max_leverage).max(1),
            volatility_unit_pct: env_f64("ORDER_VOLATILITY_UNIT_PCT", d.volatility_unit_pct),
            sl_multiplier:       env_f64("ORDER_SL_MULTIPLIER", d.sl_multiplier),
            tp_multiplier:       env_f64("ORDER_TP_MULTIPLIER", d.tp_multiplier),
            max_sl_pct:          env_f64("ORDER_MAX_SL_PCT", d.max_sl_pct),
            max_tp_pct:          env_f64("ORDER_MAX_TP_PCT", d.max_tp_pct),
        }
    }
}

impl Default for OrderPolicy {
    fn default() -> Self {
        Self {
            risk_pct:            2.0,
            min_notional:        10.0,
            max_notional:        5_000.0,
            default_leverage:    5,
            min_leverage:        1,
            max_leverage:        6,
            volatility_unit_pct: 1.0,
            sl_multiplier:       2.0,
            tp_multiplier:       3.0,
            max_sl_pct:          5.0,
            max_tp_pct:          15.0,
        }
    }
}

// ─── Classifier ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct ClassifierConfig {
    /// Estimated price of one judgment call, for the "cost avoided" counter.
    pub estimated_call_cost: f64,
}

impl ClassifierConfig {
    pub fn from_env() -> Self {
        Self { estimated_call_cost: env_f64("AI_ESTIMATED_CALL_COST", 0.01) }
    }
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self { estimated_call_cost: 0.01 }
    }
}

// ─── Decision Engine ──────────────────────────────────────────────────────────

/// Reasoning providers the decision engine can talk to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AiProvider {
    Claude,
    OpenAi,
}

impl std::fmt::Display for AiProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AiProvider::Claude => write!(f, "claude"),
            AiProvider::OpenAi => write!(f, "openai"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DecisionConfig {
    pub provider: AiProvider,
    /// `None` = no reasoning service configured; every judgment fails closed.
    pub api_key:  Option<String>,
    pub model:    String,
    /// Hard ceiling on one judgment call, enforced by the engine.
    pub timeout:  Duration,
}

impl DecisionConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let provider = match env_string("AI_PROVIDER", "claude").to_lowercase().as_str() {
            "claude" => AiProvider::Claude,
            "openai" => AiProvider::OpenAi,
            other => bail!("Unknown AI_PROVIDER: '{other}'. Use 'claude' or 'openai'"),
        };
        let default_model = match provider {
            AiProvider::Claude => "claude-3-5-sonnet-20241022",
            AiProvider::OpenAi => "gpt-4o",
        };

        Ok(Self {
            provider,
            api_key: std::env::var("AI_API_KEY").ok().filter(|k| !k.trim().is_empty()),
            model:   env_string("AI_MODEL", default_model),
            timeout: Duration::from_secs(env_u64("DECISION_TIMEOUT_SECS", 12)),
        })
    }
}

impl Default for DecisionConfig {
    fn default() -> Self {
        Self {
            provider: AiProvider::Claude,
            api_key:  None,
            model:    "claude-3-5-sonnet-20241022".to_string(),
            timeout:  Duration::from_secs(12),
        }
    }
}

// ─── Pipeline ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Signals older than this at decision time are abandoned, never fanned out.
    pub max_signal_age: Duration,
    /// Currency of account balances, commissions and debts.
    pub ledger_currency: String,
}

impl PipelineConfig {
    pub fn from_env() -> Self {
        Self {
            max_signal_age:  Duration::from_secs(env_u64("SIGNAL_MAX_AGE_SECS", 120)),
            ledger_currency: env_string("LEDGER_CURRENCY", "BRL"),
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_signal_age:  Duration::from_secs(120),
            ledger_currency: "BRL".to_string(),
        }
    }
}

// ─── Commission ───────────────────────────────────────────────────────────────

/// Platform commission charged on closed positions, payable from the
/// account's platform balance.
#[derive(Debug, Clone)]
pub struct CommissionPolicy {
    /// Share of positive realized P&L owed to the platform (percent).
    pub profit_share_pct: f64,
    /// Conversion from the venue quote currency into the ledger currency.
    pub fx_rate: f64,
}

impl CommissionPolicy {
    pub fn from_env() -> Self {
        Self {
            profit_share_pct: env_f64("COMMISSION_PROFIT_SHARE_PCT", 20.0),
            fx_rate:          env_f64("COMMISSION_FX_RATE", 1.0),
        }
    }

    /// Commission owed in the ledger currency. Losing trades owe nothing.
    pub fn commission_for(&self, realized_pnl: f64) -> f64 {
        if realized_pnl <= 0.0 {
            return 0.0;
        }
        realized_pnl * self.profit_share_pct / 100.0 * self.fx_rate
    }
}

impl Default for CommissionPolicy {
    fn default() -> Self {
        Self { profit_share_pct: 20.0, fx_rate: 1.0 }
    }
}

// ─── Venues ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct VenueConfig {
    pub binance_base_url: String,
    pub okx_base_url:     String,
    pub recv_window_ms:   u64,
    pub request_timeout:  Duration,
    /// Starting quote balance reported by the paper venue.
    pub paper_balance:    f64,
}

impl VenueConfig {
    pub fn from_env() -> Self {
        Self {
            binance_base_url: env_string("BINANCE_BASE_URL", "https://fapi.binance.com"),
            okx_base_url:     env_string("OKX_BASE_URL", "https://www.okx.com"),
            recv_window_ms:   env_u64("EXCHANGE_RECV_WINDOW_MS", 5_000),
            request_timeout:  Duration::from_secs(env_u64("EXCHANGE_TIMEOUT_SECS", 10)),
            paper_balance:    env_f64("PAPER_START_BALANCE", 10_000.0),
        }
    }
}

impl Default for VenueConfig {
    fn default() -> Self {
        Self {
            binance_base_url: "https://fapi.binance.com".to_string(),
            okx_base_url:     "https://www.okx.com".to_string(),
            recv_window_ms:   5_000,
            request_timeout:  Duration::from_secs(10),
            paper_balance:    10_000.0,
        }
    }
}

// ─── Top-level ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct Config {
    pub bind_addr:    String,
    /// `X-API-Key` expected by the auth middleware; `None` = dev mode.
    pub api_key:      Option<String>,
    pub database_url: Option<String>,
    /// Base URL of the credential service; `None` = in-memory resolver.
    pub credentials_url:   Option<String>,
    pub credentials_token: Option<String>,
    pub fanout:       FanoutConfig,
    pub order:        OrderPolicy,
    pub classifier:   ClassifierConfig,
    pub decision:     DecisionConfig,
    pub pipeline:     PipelineConfig,
    pub commission:   CommissionPolicy,
    pub venues:       VenueConfig,
    pub read_retry:   RetryPolicy,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        Ok(Self {
            bind_addr:         env_string("BIND_ADDR", "0.0.0.0:3000"),
            api_key:           std::env::var("API_KEY").ok().filter(|k| !k.trim().is_empty()),
            database_url:      std::env::var("DATABASE_URL").ok(),
            credentials_url:   std::env::var("CREDENTIALS_URL").ok(),
            credentials_token: std::env::var("CREDENTIALS_TOKEN").ok(),
            fanout:            FanoutConfig::from_env(),
            order:             OrderPolicy::from_env(),
            classifier:        ClassifierConfig::from_env(),
            decision:          DecisionConfig::from_env()?,
            pipeline:          PipelineConfig::from_env(),
            commission:        CommissionPolicy::from_env(),
            venues:            VenueConfig::from_env(),
            read_retry:        RetryPolicy::reads_from_env(),
        })
    }
}

/// In-memory store, dev-mode auth, no reasoning service.
impl Default for Config {
    fn default() -> Self {
        Self {
            bind_addr:         "0.0.0.0:3000".to_string(),
            api_key:           None,
            database_url:      None,
            credentials_url:   None,
            credentials_token: None,
            fanout:            FanoutConfig::default(),
            order:             OrderPolicy::default(),
            classifier:        ClassifierConfig::default(),
            decision:          DecisionConfig::default(),
            pipeline:          PipelineConfig::default(),
            commission:        CommissionPolicy::default(),
            venues:            VenueConfig::default(),
            read_retry:        RetryPolicy::reads(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commission_only_on_profit() {
        let policy = CommissionPolicy { profit_share_pct: 20.0, fx_rate: 5.0 };
        assert_eq!(policy.commission_for(-12.0), 0.0);
        assert_eq!(policy.commission_for(0.0), 0.0);
        assert!((policy.commission_for(80.0) - 80.0).abs() < 1e-9);
    }

    #[test]
    fn order_policy_defaults_match_house_values() {
        let p = OrderPolicy::default();
        assert_eq!(p.default_leverage, 5);
        assert_eq!(p.max_leverage, 6);
        assert_eq!(p.sl_multiplier, 2.0);
        assert_eq!(p.tp_multiplier, 3.0);
    }
}
