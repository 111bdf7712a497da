//! Per-run event fan-out to at most one live subscriber per run.
//!
//! Messages are transient: publishing with no subscriber attached is a
//! no-op, late subscribers see no history, and a subscriber that went away
//! is detected lazily on the next failed send.

use std::collections::HashMap;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tracing::debug;

/// `{source, type, data}` message fanned out over a run's event stream.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Envelope {
    pub source: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub data: Value,
}

impl Envelope {
    pub fn new(source: impl Into<String>, kind: impl Into<String>, data: Value) -> Self {
        Self {
            source: source.into(),
            kind: kind.into(),
            data,
        }
    }

    /// Envelope authored by the control plane itself.
    pub fn orchestrator(kind: impl Into<String>, data: Value) -> Self {
        Self::new("orchestrator", kind, data)
    }

    /// Free-form info message from the control plane.
    pub fn info(message: impl Into<String>) -> Self {
        Self::orchestrator("info", json!({ "message": message.into() }))
    }
}

/// Fan-out hub keyed by run id.
#[derive(Debug, Default)]
pub struct EventHub {
    subscribers: Mutex<HashMap<String, mpsc::UnboundedSender<Envelope>>>,
}

impl EventHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a subscriber for `run_id`, replacing any previous one.
    pub fn subscribe(&self, run_id: &str) -> mpsc::UnboundedReceiver<Envelope> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut subs = self.subscribers.lock().expect("event hub lock");
        if subs.insert(run_id.to_string(), tx).is_some() {
            debug!(run_id, "replaced existing subscriber");
        }
        rx
    }

    /// Remove the subscriber for `run_id`, if any.
    pub fn detach(&self, run_id: &str) {
        self.subscribers
            .lock()
            .expect("event hub lock")
            .remove(run_id);
    }

    /// Deliver `envelope` to the run's subscriber, if one is attached.
    ///
    /// A failed send means the receiver was dropped; the stale entry is
    /// removed so the next subscriber starts clean.
    pub fn publish(&self, run_id: &str, envelope: Envelope) {
        let mut subs = self.subscribers.lock().expect("event hub lock");
        let Some(tx) = subs.get(run_id) else {
            return;
        };
        if tx.send(envelope).is_err() {
            debug!(run_id, "subscriber gone, removing");
            subs.remove(run_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn publish_without_subscriber_is_noop() {
        let hub = EventHub::new();
        hub.publish("run-a", Envelope::info("nobody listening"));
    }

    #[test]
    fn messages_arrive_in_publish_order() {
        let hub = EventHub::new();
        let mut rx = hub.subscribe("run-a");

        hub.publish("run-a", Envelope::info("first"));
        hub.publish("run-a", Envelope::info("second"));
        hub.publish("run-b", Envelope::info("other run"));

        assert_eq!(rx.try_recv().expect("first").data["message"], "first");
        assert_eq!(rx.try_recv().expect("second").data["message"], "second");
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn subscribe_replaces_prior_subscriber() {
        let hub = EventHub::new();
        let mut old_rx = hub.subscribe("run-a");
        let mut new_rx = hub.subscribe("run-a");

        hub.publish("run-a", Envelope::info("hello"));

        assert!(new_rx.try_recv().is_ok());
        // The old channel's sender was dropped on replacement.
        assert!(old_rx.try_recv().is_err());
    }

    #[test]
    fn dropped_receiver_is_pruned_on_next_publish() {
        let hub = EventHub::new();
        let rx = hub.subscribe("run-a");
        drop(rx);

        hub.publish("run-a", Envelope::info("lost"));
        assert!(
            hub.subscribers
                .lock()
                .expect("lock")
                .get("run-a")
                .is_none()
        );
    }
}
