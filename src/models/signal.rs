//! # models::signal
//!
//! Defines [`Signal`], the canonical form of an inbound alert, together with
//! the side/strength vocabulary the classifier routes on and the processing
//! status that is the only mutable part of a persisted signal.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Symbol placeholder used when no symbol-like field could be resolved.
pub const UNKNOWN_SYMBOL: &str = "UNKNOWN";

// ─── Side ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Side {
    Long,
    Short,
}

impl Side {
    pub fn opposite(self) -> Self {
        match self {
            Side::Long  => Side::Short,
            Side::Short => Side::Long,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Side::Long  => "LONG",
            Side::Short => "SHORT",
        }
    }
}

// ─── Strength ─────────────────────────────────────────────────────────────────

/// How the signal is tagged upstream. Drives the judgment-gating policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Strength {
    /// Plain directional signal.
    Normal,
    /// High-conviction signal ("FORTE" / "STRONG").
    Strong,
    /// Close the open exposure on the signal's side.
    Close,
    /// Anything the parser could not place. Always goes to judgment.
    Unknown,
}

// ─── Status ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SignalStatus {
    #[serde(rename = "received")]
    Received,
    #[serde(rename = "classified")]
    Classified,
    #[serde(rename = "decided")]
    Decided,
    #[serde(rename = "fanned-out")]
    FannedOut,
    #[serde(rename = "completed")]
    Completed,
    #[serde(rename = "failed")]
    Failed,
    #[serde(rename = "rejected:unparseable")]
    RejectedUnparseable,
    #[serde(rename = "rejected:decision-unavailable")]
    RejectedDecisionUnavailable,
    #[serde(rename = "rejected:judgment")]
    RejectedByJudgment,
    #[serde(rename = "rejected:stale")]
    RejectedStale,
    #[serde(rename = "skipped:no-exposure")]
    SkippedNoExposure,
}

impl SignalStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            SignalStatus::Received                    => "received",
            SignalStatus::Classified                  => "classified",
            SignalStatus::Decided                     => "decided",
            SignalStatus::FannedOut                   => "fanned-out",
            SignalStatus::Completed                   => "completed",
            SignalStatus::Failed                      => "failed",
            SignalStatus::RejectedUnparseable         => "rejected:unparseable",
            SignalStatus::RejectedDecisionUnavailable => "rejected:decision-unavailable",
            SignalStatus::RejectedByJudgment          => "rejected:judgment",
            SignalStatus::RejectedStale               => "rejected:stale",
            SignalStatus::SkippedNoExposure           => "skipped:no-exposure",
        }
    }

    /// Terminal statuses never transition again.
    pub fn is_terminal(self) -> bool {
        !matches!(
            self,
            SignalStatus::Received
                | SignalStatus::Classified
                | SignalStatus::Decided
                | SignalStatus::FannedOut
        )
    }
}

// ─── Signal ───────────────────────────────────────────────────────────────────

/// A normalized trading instruction.
///
/// Immutable once persisted, except for `status` and `result`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Signal {
    pub id: Uuid,
    /// Where the alert came from, e.g. `"tradingview"`.
    pub source: String,
    /// The payload exactly as delivered, kept for audit.
    pub raw: serde_json::Value,
    pub symbol: String,
    /// The resolved action text, e.g. `"SINAL LONG FORTE"`.
    pub action: String,
    /// `None` when the action text carries no side word.
    pub side: Option<Side>,
    pub strength: Strength,
    pub reference_price: f64,
    /// `true` when the alert targets paper accounts only.
    pub paper: bool,
    /// When the upstream source emitted the alert, if it said so.
    pub source_time: Option<DateTime<Utc>>,
    pub received_at: DateTime<Utc>,
    pub status: SignalStatus,
    /// Human-readable outcome note attached to the final status.
    pub result: Option<String>,
}

impl Signal {
    pub fn is_unparseable(&self) -> bool {
        self.symbol == UNKNOWN_SYMBOL
    }

    /// Age measured from the upstream emission time when known, else receipt.
    pub fn age_at(&self, now: DateTime<Utc>) -> chrono::Duration {
        now.signed_duration_since(self.source_time.unwrap_or(self.received_at))
    }

    pub fn is_stale(&self, now: DateTime<Utc>, max_age: std::time::Duration) -> bool {
        match chrono::Duration::from_std(max_age) {
            Ok(max) => self.age_at(now) > max,
            Err(_) => false,
        }
    }

    /// Open signals create exposure; close signals remove it.
    pub fn is_close(&self) -> bool {
        self.strength == Strength::Close
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn signal_at(source_time: Option<DateTime<Utc>>, received_at: DateTime<Utc>) -> Signal {
        Signal {
            id: Uuid::new_v4(),
            source: "test".into(),
            raw: serde_json::Value::Null,
            symbol: "BTCUSDT".into(),
            action: "LONG".into(),
            side: Some(Side::Long),
            strength: Strength::Normal,
            reference_price: 100.0,
            paper: false,
            source_time,
            received_at,
            status: SignalStatus::Received,
            result: None,
        }
    }

    #[test]
    fn staleness_prefers_source_time() {
        let now = Utc::now();
        let old = now - chrono::Duration::seconds(300);
        let s = signal_at(Some(old), now);
        assert!(s.is_stale(now, std::time::Duration::from_secs(120)));

        let fresh = signal_at(None, now - chrono::Duration::seconds(10));
        assert!(!fresh.is_stale(now, std::time::Duration::from_secs(120)));
    }

    #[test]
    fn status_serializes_with_colon_form() {
        let json = serde_json::to_string(&SignalStatus::RejectedUnparseable).unwrap();
        assert_eq!(json, "\"rejected:unparseable\"");
        assert_eq!(
            SignalStatus::RejectedDecisionUnavailable.as_str(),
            "rejected:decision-unavailable"
        );
        assert!(SignalStatus::SkippedNoExposure.is_terminal());
        assert!(!SignalStatus::Decided.is_terminal());
    }
}
