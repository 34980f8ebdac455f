//! Protocol client capability.
//!
//! The socket, handshake, and framing live behind these traits. The
//! orchestrator only needs to open a connection bound to an [`AuthState`],
//! ask for a pairing code, send two messages, and watch connection status.
//!
//! Implementations:
//! - `fake::FakeConnector` - scripted, test-controlled client (tests and the
//!   `test-util` feature only)
//! - [`loopback::LoopbackConnector`] - self-driving client for local runs

#[cfg(any(test, feature = "test-util"))]
pub mod fake;
pub mod loopback;

use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::store::AuthState;

/// Upper bound for opening a connection; also bounds a whole attempt.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(300);

/// Domain of user addresses on the remote endpoint.
pub const DEFAULT_USER_DOMAIN: &str = "s.whatsapp.net";

/// Client identity presented to the remote endpoint.
///
/// Kept stable so repeated attempts are recognized as the same companion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BrowserDescriptor {
    pub platform: String,
    pub browser: String,
    pub version: String,
}

impl Default for BrowserDescriptor {
    fn default() -> Self {
        Self {
            platform: "Ubuntu".to_string(),
            browser: "Chrome".to_string(),
            version: "20.0.04".to_string(),
        }
    }
}

/// Options passed to [`ClientConnector::connect`].
#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub connect_timeout: Duration,
    pub browser: BrowserDescriptor,
    pub user_domain: String,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            browser: BrowserDescriptor::default(),
            user_domain: DEFAULT_USER_DOMAIN.to_string(),
        }
    }
}

/// Why the remote end closed the connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisconnectReason {
    pub status_code: Option<u16>,
    pub message: String,
}

impl DisconnectReason {
    /// Permanent unauthorized state. Never retried.
    pub const LOGGED_OUT: u16 = 401;
    pub const CONNECTION_LOST: u16 = 408;
    pub const CONNECTION_CLOSED: u16 = 428;
    pub const CONNECTION_REPLACED: u16 = 440;
    /// Sent right after a successful pairing; the client must reconnect.
    pub const RESTART_REQUIRED: u16 = 515;

    pub fn new(status_code: u16, message: impl Into<String>) -> Self {
        Self {
            status_code: Some(status_code),
            message: message.into(),
        }
    }

    /// The event stream ended without a close event.
    pub fn stream_ended() -> Self {
        Self {
            status_code: None,
            message: "connection event stream ended".to_string(),
        }
    }

    pub fn is_logged_out(&self) -> bool {
        self.status_code == Some(Self::LOGGED_OUT)
    }
}

impl std::fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.status_code {
            Some(code) => write!(f, "{} ({})", self.message, code),
            None => write!(f, "{}", self.message),
        }
    }
}

/// Connection-status updates emitted by a client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    Connecting,
    Open,
    Close(DisconnectReason),
}

/// A message sent through the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundMessage {
    Document {
        file_name: String,
        mime_type: String,
        data: Vec<u8>,
    },
    Text(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ClientError {
    #[error("Connection failed: {0}")]
    Connect(String),

    #[error("Request rejected: {0}")]
    Rejected(String),

    #[error("Send failed: {0}")]
    Send(String),

    #[error("Connection closed")]
    Closed,
}

/// Receiver half of a client's connection-status stream.
pub type ConnectionEvents = mpsc::UnboundedReceiver<ConnectionEvent>;

/// An opened client plus its status stream.
pub struct Connection {
    pub client: Box<dyn ProtocolClient>,
    pub events: ConnectionEvents,
}

/// Opens protocol clients bound to an authentication state.
///
/// The client persists credential updates through `auth.sink()`.
#[async_trait]
pub trait ClientConnector: Send + Sync {
    async fn connect(
        &self,
        auth: AuthState,
        options: &ClientOptions,
    ) -> Result<Connection, ClientError>;
}

/// One live connection to the remote endpoint.
#[async_trait]
pub trait ProtocolClient: Send + Sync {
    /// Ask the remote endpoint for a pairing code for `phone_number` (digits only).
    async fn request_pairing_code(&self, phone_number: &str) -> Result<String, ClientError>;

    async fn send_message(&self, to: &str, message: OutboundMessage) -> Result<(), ClientError>;

    /// Close the connection. Safe to call more than once.
    async fn close(&self);
}
