//! # signal-relay
//!
//! Trading-signal fan-out core: one inbound alert is normalized, gated,
//! optionally judged, and dispatched concurrently to every eligible
//! subscriber account; fills become tracked positions whose closure settles
//! commission through a debt-aware ledger.
//!
//! ```text
//!  alert ─► normalizer ─► classifier ─► decision ─► eligibility ─► fan-out ─► venues
//!                                          ▲                          │
//!                           market context ┘                          ▼
//!                                                       tracker ─► ledger ─► notifications
//! ```

pub mod auth;
pub mod config;
pub mod credentials;
pub mod engine;
pub mod error;
pub mod events;
pub mod exchange;
pub mod ledger;
pub mod models;
pub mod routes;
pub mod state;
pub mod store;
