//! WebSocket handler for lifecycle event streaming.
//!
//! Clients connect to `/ws/events` and receive `pairing:*` events from the
//! EventBus. Without subscriptions every event is forwarded; once a client
//! sends `{"subscribe": "pairing:code:*"}` only matching events are.

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
};
use futures::{SinkExt, StreamExt};
use pairline_core::event_bus::BroadcastEvent;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::broadcast::error::RecvError;

use super::SharedState;

/// Filter change requested by a client.
#[derive(Debug, Deserialize, PartialEq, Eq)]
#[serde(untagged)]
enum ClientMessage {
    Subscribe { subscribe: String },
    Unsubscribe { unsubscribe: String },
}

/// Event frame sent to clients.
#[derive(Serialize)]
struct WsEvent {
    event_type: String,
    payload: serde_json::Value,
}

impl From<BroadcastEvent> for WsEvent {
    fn from(event: BroadcastEvent) -> Self {
        Self {
            event_type: event.event_type,
            payload: event.payload,
        }
    }
}

/// Patterns a single client subscribed to.
#[derive(Default)]
struct Subscriptions {
    patterns: Mutex<HashSet<String>>,
}

impl Subscriptions {
    fn apply(&self, message: ClientMessage) {
        let mut patterns = self.patterns.lock().unwrap_or_else(PoisonError::into_inner);
        match message {
            ClientMessage::Subscribe { subscribe } => {
                log::debug!("WebSocket subscribed to {}", subscribe);
                patterns.insert(subscribe);
            }
            ClientMessage::Unsubscribe { unsubscribe } => {
                log::debug!("WebSocket unsubscribed from {}", unsubscribe);
                patterns.remove(&unsubscribe);
            }
        }
    }

    fn admits(&self, event_type: &str) -> bool {
        let patterns = self.patterns.lock().unwrap_or_else(PoisonError::into_inner);
        patterns.is_empty()
            || patterns
                .iter()
                .any(|pattern| matches_pattern(event_type, pattern))
    }
}

/// Handler for GET /ws/events
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<SharedState>>,
) -> impl IntoResponse {
    ws.on_upgrade(|socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: Arc<SharedState>) {
    let (mut sender, mut receiver) = socket.split();
    let subscriptions = Arc::new(Subscriptions::default());
    let mut events = state.event_bus.subscribe();

    let filters = Arc::clone(&subscriptions);
    let recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = receiver.next().await {
            if let Message::Text(text) = msg {
                match serde_json::from_str::<ClientMessage>(&text) {
                    Ok(message) => filters.apply(message),
                    Err(e) => log::debug!("Ignoring WebSocket message: {}", e),
                }
            }
        }
    });

    let send_task = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => {
                    if !subscriptions.admits(&event.event_type) {
                        continue;
                    }
                    let Ok(json) = serde_json::to_string(&WsEvent::from(event)) else {
                        continue;
                    };
                    if sender.send(Message::Text(json.into())).await.is_err() {
                        break;
                    }
                }
                Err(RecvError::Lagged(count)) => {
                    log::warn!("WebSocket client lagged by {} events", count);
                }
                Err(RecvError::Closed) => break,
            }
        }
    });

    tokio::select! {
        _ = recv_task => {},
        _ = send_task => {},
    }

    log::debug!("WebSocket connection closed");
}

/// Check if an event type matches a subscription pattern.
///
/// - exact match
/// - `pairing:code:*` matches any suffix after `pairing:code:`
/// - `*` as a whole segment matches one segment (`pairing:*:0771234567`)
fn matches_pattern(event_type: &str, pattern: &str) -> bool {
    if event_type == pattern {
        return true;
    }

    if let Some(prefix) = pattern.strip_suffix(":*") {
        if event_type
            .strip_prefix(prefix)
            .is_some_and(|rest| rest.starts_with(':'))
        {
            return true;
        }
    }

    if !pattern.contains('*') {
        return false;
    }

    let pattern_parts: Vec<&str> = pattern.split(':').collect();
    let event_parts: Vec<&str> = event_type.split(':').collect();
    pattern_parts.len() == event_parts.len()
        && pattern_parts
            .iter()
            .zip(&event_parts)
            .all(|(p, e)| *p == "*" || p == e)
}

// ============================================================================
// TESTS
// ============================================================================
