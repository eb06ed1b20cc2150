//! # engine::sizing
//!
//! Order parameters for one account. Pure functions; the fan-out engine
//! supplies the venue balance.
//!
//! ```text
//! margin   = balance × risk% × tier_factor(balance)
//! leverage = clamp(account default ?? policy default, policy min, min(policy max, account max))
//! notional = clamp(margin × leverage, max(min notionals), min(max notionals))
//! quantity = notional / price
//! SL / TP  = price ∓/± min(multiplier × volatility unit, max pct × price)
//! ```

use thiserror::Error;

use crate::config::OrderPolicy;
use crate::models::{Account, OrderParams, Position, Side};

#[derive(Debug, Clone, PartialEq, Error)]
pub enum SizingError {
    #[error("reference price must be positive, got {0}")]
    InvalidPrice(f64),

    #[error("notional bounds are inverted: min {min} > max {max}")]
    InvalidLimits { min: f64, max: f64 },

    #[error("margin {required:.2} exceeds available balance {available:.2}")]
    InsufficientMargin { required: f64, available: f64 },
}

impl SizingError {
    pub fn reason_code(&self) -> &'static str {
        match self {
            SizingError::InsufficientMargin { .. } => "insufficient_margin",
            _ => "invalid_order_params",
        }
    }
}

/// Larger balances commit a smaller share.
pub fn tier_factor(balance: f64) -> f64 {
    if balance < 1_000.0 {
        1.0
    } else if balance < 10_000.0 {
        0.75
    } else {
        0.5
    }
}

pub fn leverage_for(policy: &OrderPolicy, account: &Account) -> u32 {
    let wanted = account.limits.default_leverage.unwrap_or(policy.default_leverage);
    let ceiling = account
        .limits
        .max_leverage
        .map_or(policy.max_leverage, |m| m.min(policy.max_leverage))
        .max(policy.min_leverage);
    wanted.clamp(policy.min_leverage, ceiling)
}

/// Stop-loss and take-profit prices for an entry at `price`.
pub fn protective_prices(policy: &OrderPolicy, account: &Account, side: Side, price: f64) -> (f64, f64) {
    let unit = price * policy.volatility_unit_pct / 100.0;
    let max_sl_pct = account.limits.max_sl_pct.map_or(policy.max_sl_pct, |p| p.min(policy.max_sl_pct));
    let max_tp_pct = account.limits.max_tp_pct.map_or(policy.max_tp_pct, |p| p.min(policy.max_tp_pct));

    let sl_distance = (unit * policy.sl_multiplier).min(price * max_sl_pct / 100.0);
    let tp_distance = (unit * policy.tp_multiplier).min(price * max_tp_pct / 100.0);

    match side {
        Side::Long  => (price - sl_distance, price + tp_distance),
        Side::Short => (price + sl_distance, price - tp_distance),
    }
}

/// Parameters for a new position, sized from the venue's available balance.
pub fn open_params(
    policy: &OrderPolicy,
    account: &Account,
    symbol: &str,
    side: Side,
    price: f64,
    available: f64,
) -> Result<OrderParams, SizingError> {
    if price <= 0.0 || !price.is_finite() {
        return Err(SizingError::InvalidPrice(price));
    }

    let leverage = leverage_for(policy, account);
    let min_notional = account.limits.min_notional.map_or(policy.min_notional, |m| m.max(policy.min_notional));
    let max_notional = account.limits.max_notional.map_or(policy.max_notional, |m| m.min(policy.max_notional));
    if min_notional > max_notional {
        return Err(SizingError::InvalidLimits { min: min_notional, max: max_notional });
    }

    let balance = available.max(0.0);
    let margin = balance * policy.risk_pct / 100.0 * tier_factor(balance);
    let notional = (margin * f64::from(leverage)).clamp(min_notional, max_notional);

    let required = notional / f64::from(leverage);
    if required > balance {
        return Err(SizingError::InsufficientMargin { required, available: balance });
    }

    let (stop_loss, take_profit) = protective_prices(policy, account, side, price);
    Ok(OrderParams {
        symbol: symbol.to_string(),
        side,
        reference_price: price,
        notional,
        quantity: notional / price,
        leverage,
        stop_loss,
        take_profit,
        reduce_only: false,
    })
}

/// Reduce-only parameters that flatten `position`. Falls back to the last
/// mark, then the entry, when the signal carries no price.
pub fn close_params(position: &Position, signal_price: f64) -> OrderParams {
    let price = if signal_price > 0.0 {
        signal_price
    } else {
        position.mark_price.unwrap_or(position.entry_price)
    };
    OrderParams {
        symbol: position.symbol.clone(),
        side: position.side,
        reference_price: price,
        notional: position.quantity * price,
        quantity: position.quantity,
        leverage: position.leverage,
        stop_loss: position.stop_loss,
        take_profit: position.take_profit,
        reduce_only: true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::PlanTier;

    fn account() -> Account {
        Account::new(PlanTier::Basic, "BRL")
    }

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-6
    }

    #[test]
    fn default_policy_small_account() {
        let p = open_params(&OrderPolicy::default(), &account(), "BTCUSDT", Side::Long, 45_000.0, 500.0).unwrap();
        // 500 × 2% × 1.0 = 10 margin, × 5 leverage = 50 notional
        assert_eq!(p.leverage, 5);
        assert!(close(p.notional, 50.0));
        assert!(close(p.quantity, 50.0 / 45_000.0));
        assert!(close(p.stop_loss, 44_100.0));
        assert!(close(p.take_profit, 46_350.0));
        assert!(!p.reduce_only);
    }

    #[test]
    fn short_protection_is_mirrored() {
        let (sl, tp) = protective_prices(&OrderPolicy::default(), &account(), Side::Short, 100.0);
        assert!(close(sl, 102.0));
        assert!(close(tp, 97.0));
    }

    #[test]
    fn tiers_and_notional_clamps() {
        let policy = OrderPolicy::default();
        // 20 000 × 2% × 0.5 × 5 = 1 000
        let big = open_params(&policy, &account(), "X", Side::Long, 10.0, 20_000.0).unwrap();
        assert!(close(big.notional, 1_000.0));

        // 50 × 2% × 5 = 5 → raised to the 10 minimum
        let tiny = open_params(&policy, &account(), "X", Side::Long, 10.0, 50.0).unwrap();
        assert!(close(tiny.notional, 10.0));

        let mut capped = account();
        capped.limits.max_notional = Some(300.0);
        let p = open_params(&policy, &capped, "X", Side::Long, 10.0, 9_000.0).unwrap();
        assert!(close(p.notional, 300.0));
    }

    #[test]
    fn leverage_is_clamped_to_policy() {
        let policy = OrderPolicy::default();
        let mut a = account();
        a.limits.default_leverage = Some(20);
        assert_eq!(leverage_for(&policy, &a), 6);
        a.limits.max_leverage = Some(3);
        assert_eq!(leverage_for(&policy, &a), 3);
        a.limits.default_leverage = Some(0);
        assert_eq!(leverage_for(&policy, &a), 1);
    }

    #[test]
    fn protection_is_capped() {
        let policy = OrderPolicy { sl_multiplier: 10.0, tp_multiplier: 30.0, ..OrderPolicy::default() };
        let (sl, tp) = protective_prices(&policy, &account(), Side::Long, 100.0);
        assert!(close(sl, 95.0));
        assert!(close(tp, 115.0));
    }

    #[test]
    fn insufficient_balance_and_bad_price() {
        let policy = OrderPolicy::default();
        let err = open_params(&policy, &account(), "X", Side::Long, 10.0, 1.0).unwrap_err();
        assert_eq!(err.reason_code(), "insufficient_margin");
        let err = open_params(&policy, &account(), "X", Side::Long, 0.0, 1_000.0).unwrap_err();
        assert_eq!(err, SizingError::InvalidPrice(0.0));
    }
}
