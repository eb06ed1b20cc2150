//! # events
//!
//! Defines [`Notification`], every account-facing event this core emits.
//! The notification-delivery collaborator (SMS/push) and the monitor
//! WebSocket both subscribe to the same broadcast channel.
//!
//! Events are serialized to JSON strings before sending so the channel
//! carries `String` and receivers never need the domain types.

use serde::Serialize;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::models::{Position, SignalStatus};

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Notification {
    /// One account's dispatch failed. Carries the stable reason code.
    ExecutionFailed {
        account_id:  Uuid,
        signal_id:   Uuid,
        reason_code: String,
        message:     String,
        needs_reconciliation: bool,
    },

    PositionOpened {
        position: Box<Position>,
    },

    PositionClosed {
        position:   Box<Position>,
        commission: f64,
    },

    /// Commission exceeded the platform balance; the account is blocked.
    DebtCreated {
        account_id: Uuid,
        amount:     f64,
        currency:   String,
        blocked:    bool,
    },

    /// A top-up paid down debt. `unblocked` is true once nothing is owed.
    DebtCompensated {
        account_id: Uuid,
        applied:    f64,
        remaining:  f64,
        unblocked:  bool,
    },

    SignalRejected {
        signal_id: Uuid,
        status:    SignalStatus,
        reason:    String,
    },
}

impl Notification {
    #[inline]
    pub fn to_json(&self) -> String {
        serde_json::to_string(self)
            .unwrap_or_else(|_| r#"{"event":"SERIALIZATION_ERROR"}"#.to_string())
    }
}

/// Cloneable handle onto the notification channel.
#[derive(Clone)]
pub struct Notifier {
    tx: broadcast::Sender<String>,
}

impl Notifier {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Never fails: with no subscriber the event is simply dropped.
    pub fn send(&self, event: Notification) {
        let _ = self.tx.send(event.to_json());
    }

    pub fn subscribe(&self) -> broadcast::Receiver<String> {
        self.tx.subscribe()
    }
}

impl Default for Notifier {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_receive_tagged_json() {
        let notifier = Notifier::default();
        let mut rx = notifier.subscribe();
        notifier.send(Notification::DebtCreated {
            account_id: Uuid::nil(),
            amount: 30.0,
            currency: "BRL".into(),
            blocked: true,
        });
        let json: serde_json::Value = serde_json::from_str(&rx.recv().await.unwrap()).unwrap();
        assert_eq!(json["event"], "DEBT_CREATED");
        assert_eq!(json["blocked"], true);
    }

    #[test]
    fn sending_without_subscribers_is_fine() {
        Notifier::default().send(Notification::SignalRejected {
            signal_id: Uuid::nil(),
            status: SignalStatus::RejectedStale,
            reason: "too old".into(),
        });
    }
}
