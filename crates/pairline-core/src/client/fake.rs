//! Scripted protocol client for testing the orchestrator without a network.
//!
//! # Example
//!
//! ```ignore
//! let (connector, controller) = FakeConnector::new();
//! controller.push_pairing_code(Ok("ABCD1234".into()));
//!
//! let (orchestrator, mut reports) =
//!     PairingOrchestrator::new(store, Arc::new(connector), config, bus);
//! let code = orchestrator.initiate("0771234567").await?;
//!
//! controller.register();
//! controller.emit(ConnectionEvent::Close(DisconnectReason::new(515, "restart")));
//! controller.wait_for_connections(2).await;
//! controller.emit(ConnectionEvent::Open);
//! ```

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use serde_json::json;
use tokio::sync::{mpsc, watch};

use super::{
    ClientConnector, ClientError, ClientOptions, Connection, ConnectionEvent, OutboundMessage,
    ProtocolClient,
};
use crate::store::{AuthState, Credentials};

/// Pairing code handed out when nothing was queued.
pub const DEFAULT_FAKE_CODE: &str = "ABCD1234";

/// A message captured by the fake client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentMessage {
    pub to: String,
    pub message: OutboundMessage,
}

struct FakeConnectionRecord {
    auth: AuthState,
    options: ClientOptions,
    events: mpsc::UnboundedSender<ConnectionEvent>,
}

#[derive(Default)]
struct FakeState {
    pairing_codes: VecDeque<Result<String, ClientError>>,
    connect_failures: VecDeque<ClientError>,
    send_failure: Option<ClientError>,
    stall_pairing_codes: bool,
    register_on_connect: bool,
    connections: Vec<FakeConnectionRecord>,
    pairing_requests: Vec<String>,
    sent: Vec<SentMessage>,
    closes: usize,
}

struct FakeShared {
    state: Mutex<FakeState>,
    connected: watch::Sender<usize>,
}

impl FakeShared {
    fn lock(&self) -> std::sync::MutexGuard<'_, FakeState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Connector half, handed to the orchestrator.
pub struct FakeConnector {
    shared: Arc<FakeShared>,
}

impl FakeConnector {
    /// Build a connector and the controller that scripts it.
    pub fn new() -> (FakeConnector, FakeController) {
        let (connected, _) = watch::channel(0);
        let shared = Arc::new(FakeShared {
            state: Mutex::new(FakeState::default()),
            connected,
        });
        (
            FakeConnector {
                shared: Arc::clone(&shared),
            },
            FakeController { shared },
        )
    }
}

#[async_trait]
impl ClientConnector for FakeConnector {
    async fn connect(
        &self,
        auth: AuthState,
        options: &ClientOptions,
    ) -> Result<Connection, ClientError> {
        let (tx, rx) = mpsc::unbounded_channel();
        {
            let mut state = self.shared.lock();
            if let Some(error) = state.connect_failures.pop_front() {
                return Err(error);
            }
            if state.register_on_connect {
                auth.sink()
                    .save(&registered_credentials(&auth))
                    .map_err(|e| ClientError::Connect(e.to_string()))?;
            }
            state.connections.push(FakeConnectionRecord {
                auth,
                options: options.clone(),
                events: tx,
            });
        }
        self.shared.connected.send_modify(|count| *count += 1);

        Ok(Connection {
            client: Box::new(FakeClient {
                shared: Arc::clone(&self.shared),
            }),
            events: rx,
        })
    }
}

struct FakeClient {
    shared: Arc<FakeShared>,
}

#[async_trait]
impl ProtocolClient for FakeClient {
    async fn request_pairing_code(&self, phone_number: &str) -> Result<String, ClientError> {
        let queued = {
            let mut state = self.shared.lock();
            state.pairing_requests.push(phone_number.to_string());
            if state.stall_pairing_codes {
                None
            } else {
                Some(
                    state
                        .pairing_codes
                        .pop_front()
                        .unwrap_or_else(|| Ok(DEFAULT_FAKE_CODE.to_string())),
                )
            }
        };
        match queued {
            Some(result) => result,
            None => std::future::pending().await,
        }
    }

    async fn send_message(&self, to: &str, message: OutboundMessage) -> Result<(), ClientError> {
        let mut state = self.shared.lock();
        if let Some(error) = state.send_failure.clone() {
            return Err(error);
        }
        state.sent.push(SentMessage {
            to: to.to_string(),
            message,
        });
        Ok(())
    }

    async fn close(&self) {
        self.shared.lock().closes += 1;
    }
}

/// Test-side handle: queues responses, injects events, inspects traffic.
#[derive(Clone)]
pub struct FakeController {
    shared: Arc<FakeShared>,
}

impl FakeController {
    /// Queue the result of the next pairing-code request.
    pub fn push_pairing_code(&self, result: Result<String, ClientError>) {
        self.shared.lock().pairing_codes.push_back(result);
    }

    /// Make the next `connect` fail.
    pub fn fail_next_connect(&self, error: ClientError) {
        self.shared.lock().connect_failures.push_back(error);
    }

    /// Make every subsequent send fail.
    pub fn fail_sends(&self, error: ClientError) {
        self.shared.lock().send_failure = Some(error);
    }

    /// Leave every subsequent pairing-code request unanswered.
    pub fn stall_pairing_codes(&self) {
        self.shared.lock().stall_pairing_codes = true;
    }

    /// Save registered credentials during every subsequent `connect`,
    /// as a client restoring an existing session would.
    pub fn register_on_connect(&self) {
        self.shared.lock().register_on_connect = true;
    }

    /// Persist registered credentials through the latest connection's sink.
    pub fn register(&self) {
        let state = self.shared.lock();
        if let Some(record) = state.connections.last() {
            let saved = record.auth.sink().save(&registered_credentials(&record.auth));
            if let Err(e) = saved {
                log::warn!("Fake registration failed: {}", e);
            }
        }
    }

    /// Deliver a connection event on the latest connection.
    pub fn emit(&self, event: ConnectionEvent) {
        let state = self.shared.lock();
        if let Some(record) = state.connections.last() {
            let _ = record.events.send(event);
        }
    }

    pub fn connection_count(&self) -> usize {
        self.shared.lock().connections.len()
    }

    /// Resolve once at least `count` connections have been opened.
    pub async fn wait_for_connections(&self, count: usize) {
        let mut rx = self.shared.connected.subscribe();
        let _ = rx.wait_for(|opened| *opened >= count).await;
    }

    /// Options passed to the latest `connect`.
    pub fn last_options(&self) -> Option<ClientOptions> {
        self.shared
            .lock()
            .connections
            .last()
            .map(|record| record.options.clone())
    }

    pub fn pairing_requests(&self) -> Vec<String> {
        self.shared.lock().pairing_requests.clone()
    }

    pub fn sent_messages(&self) -> Vec<SentMessage> {
        self.shared.lock().sent.clone()
    }

    pub fn close_count(&self) -> usize {
        self.shared.lock().closes
    }
}

fn registered_credentials(auth: &AuthState) -> Credentials {
    let mut credentials = auth.credentials().clone();
    credentials.registered = true;
    credentials
        .material
        .insert("me".to_string(), json!({ "id": auth.identity().digits() }));
    credentials
}
