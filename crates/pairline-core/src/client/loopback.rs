//! Self-driving in-process client for local development.
//!
//! Plays the remote endpoint's part of a pairing:
//!
//! 1. `request_pairing_code` hands out a random eight-character code
//! 2. after `register_after`, it saves registered credentials through the
//!    sink and closes with "restart required" (515)
//! 3. a connection opened with registered credentials reports `Open`
//! 4. deliveries are logged instead of sent anywhere

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use serde_json::json;
use tokio::sync::mpsc;

use super::{
    ClientConnector, ClientError, ClientOptions, Connection, ConnectionEvent, DisconnectReason,
    OutboundMessage, ProtocolClient,
};
use crate::store::{AuthState, Credentials};

/// Ambiguous glyphs (0/O, 1/I) left out so codes are easy to type.
const CODE_ALPHABET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";
const CODE_LENGTH: usize = 8;

/// Delay before a registered connection reports `Open`.
const OPEN_DELAY: Duration = Duration::from_millis(500);

pub struct LoopbackConnector {
    register_after: Duration,
}

impl LoopbackConnector {
    /// `register_after` is how long the simulated user takes to enter the code.
    pub fn new(register_after: Duration) -> Self {
        Self { register_after }
    }
}

#[async_trait]
impl ClientConnector for LoopbackConnector {
    async fn connect(
        &self,
        auth: AuthState,
        options: &ClientOptions,
    ) -> Result<Connection, ClientError> {
        let (events, rx) = mpsc::unbounded_channel();
        let _ = events.send(ConnectionEvent::Connecting);

        log::debug!(
            "Loopback connect for {} as {}/{}/{}",
            auth.identity(),
            options.browser.platform,
            options.browser.browser,
            options.browser.version
        );

        let closed = Arc::new(AtomicBool::new(false));
        if auth.sink().status().registered || auth.is_registered() {
            let events = events.clone();
            let closed = Arc::clone(&closed);
            tokio::spawn(async move {
                tokio::time::sleep(OPEN_DELAY).await;
                if !closed.load(Ordering::SeqCst) {
                    let _ = events.send(ConnectionEvent::Open);
                }
            });
        }

        Ok(Connection {
            client: Box::new(LoopbackClient {
                auth,
                user_domain: options.user_domain.clone(),
                register_after: self.register_after,
                events,
                closed,
            }),
            events: rx,
        })
    }
}

struct LoopbackClient {
    auth: AuthState,
    user_domain: String,
    register_after: Duration,
    events: mpsc::UnboundedSender<ConnectionEvent>,
    closed: Arc<AtomicBool>,
}

#[async_trait]
impl ProtocolClient for LoopbackClient {
    async fn request_pairing_code(&self, phone_number: &str) -> Result<String, ClientError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ClientError::Closed);
        }

        let code = random_code();
        log::info!("Loopback issued pairing code {} for {}", code, phone_number);

        let auth = self.auth.clone();
        let address = auth.identity().address(&self.user_domain);
        let events = self.events.clone();
        let closed = Arc::clone(&self.closed);
        let delay = self.register_after;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if closed.load(Ordering::SeqCst) {
                return;
            }
            let credentials = simulated_credentials(&auth, &address);
            if let Err(e) = auth.sink().save(&credentials) {
                log::warn!("Loopback failed to save credentials for {}: {}", address, e);
                return;
            }
            let _ = events.send(ConnectionEvent::Close(DisconnectReason::new(
                DisconnectReason::RESTART_REQUIRED,
                "restart required",
            )));
        });

        Ok(code)
    }

    async fn send_message(&self, to: &str, message: OutboundMessage) -> Result<(), ClientError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ClientError::Closed);
        }
        match message {
            OutboundMessage::Document {
                file_name,
                mime_type,
                data,
            } => log::info!(
                "Loopback delivered {} ({}, {} bytes) to {}",
                file_name,
                mime_type,
                data.len(),
                to
            ),
            OutboundMessage::Text(text) => log::info!("Loopback delivered text to {}: {}", to, text),
        }
        Ok(())
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

impl Drop for LoopbackClient {
    // An aborted attempt drops its client without closing it.
    fn drop(&mut self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

fn random_code() -> String {
    let mut rng = rand::thread_rng();
    (0..CODE_LENGTH)
        .map(|_| CODE_ALPHABET[rng.gen_range(0..CODE_ALPHABET.len())] as char)
        .collect()
}

fn random_hex(bytes: usize) -> String {
    let mut rng = rand::thread_rng();
    (0..bytes).map(|_| format!("{:02x}", rng.gen::<u8>())).collect()
}

fn simulated_credentials(auth: &AuthState, address: &str) -> Credentials {
    let mut credentials = auth.credentials().clone();
    credentials.registered = true;
    credentials
        .with_material("me", json!({ "id": address }))
        .with_material("noiseKey", json!({ "private": random_hex(32), "public": random_hex(32) }))
        .with_material("advSecretKey", json!(random_hex(32)))
}
