//! # models::account
//!
//! Subscriber accounts. Accounts are never deleted, only deactivated; the
//! balance fields are mutated exclusively by the ledger.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ─── Venue ────────────────────────────────────────────────────────────────────

/// Supported execution venues.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Venue {
    Binance,
    Okx,
    /// In-process simulated venue for paper accounts and paper signals.
    Paper,
}

impl Venue {
    pub fn as_str(self) -> &'static str {
        match self {
            Venue::Binance => "binance",
            Venue::Okx     => "okx",
            Venue::Paper   => "paper",
        }
    }

    pub fn is_paper(self) -> bool {
        self == Venue::Paper
    }
}

impl std::fmt::Display for Venue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ─── Subscription ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PlanTier {
    /// Paper trading only; never receives live orders.
    Paper,
    Basic,
    Premium,
}

impl PlanTier {
    pub fn allows_live(self) -> bool {
        !matches!(self, PlanTier::Paper)
    }
}

// ─── Credentials ──────────────────────────────────────────────────────────────

/// Opaque pointer to a venue credential. The secret itself is fetched from
/// the credential service at dispatch time and never stored here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CredentialRef {
    pub venue: Venue,
    pub key_id: String,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default = "default_true")]
    pub valid: bool,
}

fn default_true() -> bool {
    true
}

impl CredentialRef {
    pub fn is_usable(&self, now: DateTime<Utc>) -> bool {
        self.valid && self.expires_at.map(|exp| now < exp).unwrap_or(true)
    }
}

// ─── Limits ───────────────────────────────────────────────────────────────────

/// Per-account bounds. `None` means "use the global policy".
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccountLimits {
    #[serde(default)]
    pub default_leverage: Option<u32>,
    #[serde(default)]
    pub max_leverage: Option<u32>,
    #[serde(default)]
    pub min_notional: Option<f64>,
    #[serde(default)]
    pub max_notional: Option<f64>,
    #[serde(default)]
    pub max_sl_pct: Option<f64>,
    #[serde(default)]
    pub max_tp_pct: Option<f64>,
    #[serde(default = "default_max_open_positions")]
    pub max_open_positions: u32,
}

fn default_max_open_positions() -> u32 {
    3
}

impl Default for AccountLimits {
    fn default() -> Self {
        Self {
            default_leverage:   None,
            max_leverage:       None,
            min_notional:       None,
            max_notional:       None,
            max_sl_pct:         None,
            max_tp_pct:         None,
            max_open_positions: default_max_open_positions(),
        }
    }
}

// ─── Account ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Account {
    pub id: Uuid,
    pub tier: PlanTier,
    /// `None` = no expiry on the subscription.
    pub subscription_until: Option<DateTime<Utc>>,
    pub trading_enabled: bool,
    /// `false` once deactivated. Deactivated accounts are kept for audit.
    pub active: bool,
    pub credentials: Vec<CredentialRef>,
    /// Prepaid platform balance, in `currency`.
    pub real_balance: f64,
    /// Administrative / bonus credit. Spent before `real_balance`.
    pub bonus_balance: f64,
    pub currency: String,
    /// Set by the ledger when a commission shortfall becomes debt.
    pub operations_blocked: bool,
    pub limits: AccountLimits,
    pub created_at: DateTime<Utc>,
}

impl Account {
    pub fn new(tier: PlanTier, currency: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            tier,
            subscription_until: None,
            trading_enabled: true,
            active: true,
            credentials: Vec::new(),
            real_balance: 0.0,
            bonus_balance: 0.0,
            currency: currency.to_string(),
            operations_blocked: false,
            limits: AccountLimits::default(),
            created_at: Utc::now(),
        }
    }

    pub fn available_balance(&self) -> f64 {
        (self.real_balance + self.bonus_balance).max(0.0)
    }

    pub fn subscription_active(&self, now: DateTime<Utc>) -> bool {
        self.subscription_until.map(|until| now < until).unwrap_or(true)
    }

    /// First usable credential, restricted to the paper venue for paper
    /// signals and to live venues otherwise.
    pub fn usable_venue(&self, now: DateTime<Utc>, paper: bool) -> Option<Venue> {
        self.credentials
            .iter()
            .filter(|c| c.venue.is_paper() == paper)
            .find(|c| c.is_usable(now))
            .map(|c| c.venue)
    }

    pub fn credential_for(&self, venue: Venue) -> Option<&CredentialRef> {
        self.credentials.iter().find(|c| c.venue == venue)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expired_credential_is_not_usable() {
        let now = Utc::now();
        let mut account = Account::new(PlanTier::Basic, "BRL");
        account.credentials.push(CredentialRef {
            venue: Venue::Binance,
            key_id: "k1".into(),
            expires_at: Some(now - chrono::Duration::hours(1)),
            valid: true,
        });
        assert_eq!(account.usable_venue(now, false), None);

        account.credentials.push(CredentialRef {
            venue: Venue::Okx,
            key_id: "k2".into(),
            expires_at: None,
            valid: true,
        });
        assert_eq!(account.usable_venue(now, false), Some(Venue::Okx));
        assert_eq!(account.usable_venue(now, true), None);
    }

    #[test]
    fn available_balance_sums_real_and_bonus() {
        let mut account = Account::new(PlanTier::Premium, "BRL");
        account.real_balance = 40.0;
        account.bonus_balance = 10.0;
        assert_eq!(account.available_balance(), 50.0);
    }
}
