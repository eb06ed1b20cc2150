//! # engine::normalizer
//!
//! **Signal Normalizer** — raw webhook payload → canonical [`Signal`].
//!
//! Upstream alert templates disagree on field names, so every field is
//! resolved through an ordered fallback chain:
//!
//! ```text
//! symbol          = upper(ticker ?? symbol) ?? "UNKNOWN"
//! action          = signal ?? signal_text ?? action ?? "BUY"
//! reference_price = close ?? price ?? 0
//! source_time     = time ?? timestamp          (RFC 3339 or epoch s/ms)
//! paper           = mode == "paper" || paper == true
//! ```
//!
//! The signal is persisted before [`SignalNormalizer::ingest`] returns, so an
//! inbound alert is never lost even if a later stage fails. An unresolved
//! symbol is persisted as `rejected:unparseable` and goes no further.
//!
//! Alerts that carry an upstream id (`alert_id ?? id`) get a name-based id
//! derived from `source:upstream_id`, so a redelivered alert maps onto the
//! signal already stored instead of becoming a new one.

use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use serde_json::Value;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::StoreError;
use crate::models::{Side, Signal, SignalStatus, Strength, UNKNOWN_SYMBOL};
use crate::store::Store;

const SYMBOL_FIELDS: &[&str] = &["ticker", "symbol"];
const ACTION_FIELDS: &[&str] = &["signal", "signal_text", "action"];
const PRICE_FIELDS: &[&str] = &["close", "price"];
const TIME_FIELDS: &[&str] = &["time", "timestamp"];
const ID_FIELDS: &[&str] = &["alert_id", "id"];

const DEFAULT_ACTION: &str = "BUY";

const LONG_WORDS: &[&str] = &["LONG", "BUY", "COMPRA"];
const SHORT_WORDS: &[&str] = &["SHORT", "SELL", "VENDA"];
const STRONG_WORDS: &[&str] = &["FORTE", "STRONG"];
const CLOSE_WORDS: &[&str] = &["FECHAR", "CLOSE", "EXIT", "SAIR"];

// ─── Field resolution ─────────────────────────────────────────────────────────

fn first_text(raw: &Value, fields: &[&str]) -> Option<String> {
    fields.iter().find_map(|f| {
        raw.get(*f)
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    })
}

fn as_number(value: &Value) -> Option<f64> {
    let n: f64 = match value {
        Value::Number(n) => n.as_f64()?,
        Value::String(s) => s.trim().parse().ok()?,
        _ => return None,
    };
    n.is_finite().then_some(n)
}

fn first_number(raw: &Value, fields: &[&str]) -> Option<f64> {
    fields.iter().find_map(|f| raw.get(*f).and_then(as_number))
}

fn parse_time(value: &Value) -> Option<DateTime<Utc>> {
    if let Some(text) = value.as_str() {
        if let Ok(ts) = DateTime::parse_from_rfc3339(text.trim()) {
            return Some(ts.with_timezone(&Utc));
        }
    }
    let n = as_number(value)? as i64;
    // Anything past year ~2286 in seconds is really milliseconds.
    if n > 10_000_000_000 {
        Utc.timestamp_millis_opt(n).single()
    } else {
        Utc.timestamp_opt(n, 0).single()
    }
}

fn source_time(raw: &Value) -> Option<DateTime<Utc>> {
    TIME_FIELDS.iter().find_map(|f| raw.get(*f).and_then(parse_time))
}

fn upstream_id(raw: &Value) -> Option<String> {
    ID_FIELDS.iter().find_map(|f| match raw.get(*f)? {
        Value::String(s) => Some(s.trim().to_string()).filter(|s| !s.is_empty()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    })
}

/// Stable id for alerts with an upstream id, random otherwise.
pub fn signal_id(source: &str, raw: &Value) -> Uuid {
    match upstream_id(raw) {
        Some(id) => Uuid::new_v5(&Uuid::NAMESPACE_OID, format!("{source}:{id}").as_bytes()),
        None => Uuid::new_v4(),
    }
}

fn is_paper(raw: &Value) -> bool {
    let mode = raw
        .get("mode")
        .and_then(Value::as_str)
        .is_some_and(|m| m.trim().eq_ignore_ascii_case("paper"));
    mode || raw.get("paper").and_then(Value::as_bool).unwrap_or(false)
}

// ─── Action parsing ───────────────────────────────────────────────────────────

/// Side and strength tag from free-form action text such as
/// `"SINAL LONG FORTE"` or `"FECHAR SHORT"`. Case-insensitive.
///
/// A close word without a side word, or text with no side word at all,
/// yields [`Strength::Unknown`].
pub fn parse_action(action: &str) -> (Option<Side>, Strength) {
    let upper = action.to_uppercase();
    let words: Vec<&str> = upper
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .collect();
    let has = |set: &[&str]| words.iter().any(|w| set.contains(w));

    let side = words.iter().find_map(|w| {
        if LONG_WORDS.contains(w) {
            Some(Side::Long)
        } else if SHORT_WORDS.contains(w) {
            Some(Side::Short)
        } else {
            None
        }
    });

    let strength = match side {
        None => Strength::Unknown,
        Some(_) if has(CLOSE_WORDS) => Strength::Close,
        Some(_) if has(STRONG_WORDS) => Strength::Strong,
        Some(_) => Strength::Normal,
    };
    (side, strength)
}

/// Pure normalization. Never fails; unresolvable payloads come back with the
/// `UNKNOWN` symbol and `rejected:unparseable` status.
pub fn normalize(source: &str, raw: Value, received_at: DateTime<Utc>) -> Signal {
    let symbol = first_text(&raw, SYMBOL_FIELDS)
        .map(|s| s.to_uppercase())
        .unwrap_or_else(|| UNKNOWN_SYMBOL.to_string());
    let action = first_text(&raw, ACTION_FIELDS).unwrap_or_else(|| DEFAULT_ACTION.to_string());
    let reference_price = first_number(&raw, PRICE_FIELDS).unwrap_or(0.0);
    let (side, strength) = parse_action(&action);

    let mut signal = Signal {
        id: signal_id(source, &raw),
        source: source.to_string(),
        paper: is_paper(&raw),
        source_time: source_time(&raw),
        raw,
        symbol,
        action,
        side,
        strength,
        reference_price,
        received_at,
        status: SignalStatus::Received,
        result: None,
    };
    if signal.is_unparseable() {
        signal.status = SignalStatus::RejectedUnparseable;
        signal.result = Some("no symbol-like field in payload".to_string());
    }
    signal
}

// ─── Stage ────────────────────────────────────────────────────────────────────

/// Result of [`SignalNormalizer::ingest`].
#[derive(Debug, Clone)]
pub enum Ingested {
    New(Signal),
    /// The upstream id was seen before; carries the stored signal as-is.
    Redelivered(Signal),
}

pub struct SignalNormalizer {
    store: Arc<dyn Store>,
}

impl SignalNormalizer {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Normalize and persist. The returned signal is already stored.
    pub async fn ingest(&self, source: &str, raw: Value) -> Result<Ingested, StoreError> {
        let signal = normalize(source, raw, Utc::now());
        match self.store.insert_signal(&signal).await {
            Ok(()) => {}
            Err(StoreError::Duplicate(what)) => {
                let stored = self
                    .store
                    .get_signal(signal.id)
                    .await?
                    .ok_or(StoreError::Duplicate(what))?;
                info!(
                    signal_id = %stored.id,
                    source,
                    status = stored.status.as_str(),
                    "🔁 Alert redelivered — keeping the stored signal"
                );
                return Ok(Ingested::Redelivered(stored));
            }
            Err(e) => return Err(e),
        }

        if signal.is_unparseable() {
            warn!(signal_id = %signal.id, source, "🚫 Signal rejected — symbol could not be resolved");
        } else {
            info!(
                signal_id = %signal.id,
                symbol = %signal.symbol,
                action = %signal.action,
                price = signal.reference_price,
                paper = signal.paper,
                "📥 Signal received"
            );
        }
        Ok(Ingested::New(signal))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn ticker_wins_over_symbol() {
        let s = normalize("tv", json!({ "ticker": "BTCUSDT", "symbol": "ETHUSDT" }), Utc::now());
        assert_eq!(s.symbol, "BTCUSDT");
    }

    #[test]
    fn upstream_id_gives_a_stable_signal_id() {
        let alert = json!({ "alert_id": "tv-991", "ticker": "BTCUSDT", "signal": "LONG" });
        let first = normalize("tv", alert.clone(), Utc::now());
        let again = normalize("tv", alert.clone(), Utc::now());
        assert_eq!(first.id, again.id);
        assert_ne!(first.id, normalize("other", alert, Utc::now()).id);

        let numeric = json!({ "id": 991, "ticker": "BTCUSDT" });
        assert_eq!(signal_id("tv", &numeric), signal_id("tv", &numeric));

        let anonymous = json!({ "ticker": "BTCUSDT", "signal": "LONG" });
        assert_ne!(signal_id("tv", &anonymous), signal_id("tv", &anonymous));
    }

    #[tokio::test]
    async fn redelivery_returns_the_stored_signal() {
        use crate::store::MemoryStore;

        let store = Arc::new(MemoryStore::new());
        let normalizer = SignalNormalizer::new(store.clone());
        let alert = json!({ "alert_id": "tv-7", "ticker": "ETHUSDT", "signal": "SHORT" });

        let Ingested::New(first) = normalizer.ingest("tv", alert.clone()).await.unwrap() else {
            panic!("first delivery must be new");
        };
        store.update_signal_status(first.id, SignalStatus::Completed, None).await.unwrap();

        match normalizer.ingest("tv", alert).await.unwrap() {
            Ingested::Redelivered(stored) => {
                assert_eq!(stored.id, first.id);
                assert_eq!(stored.status, SignalStatus::Completed);
            }
            Ingested::New(_) => panic!("redelivery must not create a signal"),
        }
    }

    #[test]
    fn symbol_is_trimmed_and_uppercased() {
        let s = normalize("tv", json!({ "ticker": " btcusdt ", "signal": "LONG" }), Utc::now());
        assert_eq!(s.symbol, "BTCUSDT");
    }

    #[test]
    fn strong_long_scenario() {
        let s = normalize(
            "tv",
            json!({ "ticker": "BTCUSDT", "signal": "SINAL LONG FORTE", "close": 45000 }),
            Utc::now(),
        );
        assert_eq!(s.symbol, "BTCUSDT");
        assert_eq!(s.action, "SINAL LONG FORTE");
        assert_eq!(s.reference_price, 45000.0);
        assert_eq!(s.side, Some(Side::Long));
        assert_eq!(s.strength, Strength::Strong);
        assert_eq!(s.status, SignalStatus::Received);
    }

    #[test]
    fn symbol_and_price_fallbacks() {
        let s = normalize("tv", json!({ "symbol": "ETHUSDT", "action": "BUY", "price": 2800 }), Utc::now());
        assert_eq!(s.symbol, "ETHUSDT");
        assert_eq!(s.reference_price, 2800.0);
        assert_eq!(s.strength, Strength::Normal);
    }

    #[test]
    fn defaults_when_fields_missing() {
        let s = normalize("tv", json!({ "ticker": "SOLUSDT" }), Utc::now());
        assert_eq!(s.action, "BUY");
        assert_eq!(s.side, Some(Side::Long));
        assert_eq!(s.reference_price, 0.0);
        assert!(!s.paper);
    }

    #[test]
    fn numeric_strings_and_blank_fields() {
        let s = normalize(
            "tv",
            json!({ "ticker": "  ", "symbol": "XRPUSDT", "close": "n/a", "price": "0.52" }),
            Utc::now(),
        );
        assert_eq!(s.symbol, "XRPUSDT");
        assert_eq!(s.reference_price, 0.52);
    }

    #[test]
    fn missing_symbol_is_unparseable() {
        let s = normalize("tv", json!({ "signal": "LONG", "close": 1 }), Utc::now());
        assert_eq!(s.symbol, UNKNOWN_SYMBOL);
        assert_eq!(s.status, SignalStatus::RejectedUnparseable);
    }

    #[test]
    fn action_aliases() {
        assert_eq!(parse_action("compra"), (Some(Side::Long), Strength::Normal));
        assert_eq!(parse_action("SINAL VENDA FORTE"), (Some(Side::Short), Strength::Strong));
        assert_eq!(parse_action("FECHAR LONG"), (Some(Side::Long), Strength::Close));
        assert_eq!(parse_action("close-short"), (Some(Side::Short), Strength::Close));
        assert_eq!(parse_action("FECHAR"), (None, Strength::Unknown));
        assert_eq!(parse_action("HOLD"), (None, Strength::Unknown));
    }

    #[test]
    fn source_time_and_paper_mode() {
        let s = normalize(
            "tv",
            json!({ "ticker": "BTCUSDT", "time": "2024-05-01T12:00:00Z", "mode": "PAPER" }),
            Utc::now(),
        );
        assert_eq!(s.source_time.unwrap().timestamp(), 1_714_564_800);
        assert!(s.paper);

        let millis = normalize("tv", json!({ "ticker": "BTCUSDT", "timestamp": 1_714_564_800_000i64 }), Utc::now());
        assert_eq!(millis.source_time.unwrap().timestamp(), 1_714_564_800);
    }

    #[tokio::test]
    async fn ingest_persists_even_rejected_signals() {
        let store = Arc::new(crate::store::MemoryStore::new());
        let normalizer = SignalNormalizer::new(store.clone());
        let (Ingested::New(signal) | Ingested::Redelivered(signal)) = normalizer.ingest("tv", json!({ "close": 1 })).await.unwrap();
        let stored = store.get_signal(signal.id).await.unwrap().unwrap();
        assert_eq!(stored.status, SignalStatus::RejectedUnparseable);
    }
}
