pub mod account;
pub mod execution;
pub mod ledger;
pub mod market;
pub mod position;
pub mod signal;

pub use account::{Account, AccountLimits, CredentialRef, PlanTier, Venue};
pub use execution::{ExecutionRecord, OrderParams};
pub use ledger::{DebtEntry, DecisionRecord};
pub use market::{MarketContext, MarketContextFeed, Trend};
pub use position::{CloseReason, Position, PositionKey, PositionStatus};
pub use signal::{Side, Signal, SignalStatus, Strength, UNKNOWN_SYMBOL};
