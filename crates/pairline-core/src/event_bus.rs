//! Lifecycle event broadcasting.
//!
//! Every state change of a pairing attempt is published here so any number
//! of observers (the websocket forwarder, the daemon's logs, tests) can follow
//! attempts without holding a reference to the orchestrator.
//!
//! Event types follow `pairing:<kind>:<digits>`:
//!
//! - `pairing:state:0771234567` - lifecycle state changed
//! - `pairing:code:0771234567` - a pairing code was issued
//! - `pairing:closed:0771234567` - the attempt reached a terminal state
//!
//! The payload is always the attempt snapshot as JSON.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::pairing::SessionAttempt;

/// Slow subscribers lag (and miss events) once this many are buffered.
const DEFAULT_CAPACITY: usize = 256;

/// Kind segment of a lifecycle event type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    State,
    Code,
    Closed,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::State => "state",
            EventKind::Code => "code",
            EventKind::Closed => "closed",
        }
    }
}

/// A broadcast event: type string plus JSON payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BroadcastEvent {
    pub event_type: String,
    pub payload: serde_json::Value,
}

/// Publish-subscribe hub for attempt lifecycle events.
pub struct EventBus {
    sender: broadcast::Sender<BroadcastEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publish a snapshot of `attempt` under `kind`.
    ///
    /// Returns the number of subscribers reached; 0 when nobody listens.
    pub fn publish(&self, kind: EventKind, attempt: &SessionAttempt) -> usize {
        let payload = match serde_json::to_value(attempt) {
            Ok(v) => v,
            Err(e) => {
                log::warn!("Failed to serialize attempt snapshot: {}", e);
                return 0;
            }
        };

        let event = BroadcastEvent {
            event_type: event_type(kind, attempt.identity.digits()),
            payload,
        };
        self.sender.send(event).unwrap_or(0)
    }

    /// Receive all events published after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<BroadcastEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Build `pairing:<kind>:<digits>`.
pub fn event_type(kind: EventKind, digits: &str) -> String {
    format!("pairing:{}:{}", kind.as_str(), digits)
}

// ============================================================================
// TESTS
// ============================================================================
