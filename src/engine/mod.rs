//! # engine
//!
//! Pipeline stages, leaves first:
//!
//! | Module          | Stage                                                   |
//! |-----------------|---------------------------------------------------------|
//! | `normalizer`    | raw payload → persisted [`crate::models::Signal`]       |
//! | `classifier`    | judgment / proceed / skip, with counters                |
//! | `decision`      | fail-closed judgment call under a timeout               |
//! | `ai`            | LLM-backed judgment service                             |
//! | `eligibility`   | which accounts receive the signal                       |
//! | `sizing`        | per-account order parameters                            |
//! | `fanout`        | concurrent per-account dispatch                         |
//! | `tracker`       | open / mark / close / reconcile positions               |
//! | `pipeline`      | wires the stages for one signal                         |

pub mod ai;
pub mod classifier;
pub mod decision;
pub mod eligibility;
pub mod fanout;
pub mod normalizer;
pub mod pipeline;
pub mod sizing;
pub mod tracker;
