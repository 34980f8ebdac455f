//! # pairline-core
//!
//! Core pairing logic for pairline: given a phone number, open a session
//! against the remote messaging endpoint, hand out a pairing code, and once
//! the companion device is linked, send the session credentials back to the
//! number's own inbox before tearing everything down.
//!
//! This crate is transport-agnostic and can be used by:
//! - the HTTP gateway (`pairline-http`)
//! - the daemon binary (`pairline-daemon`)
//! - tests, via the scripted `client::fake::FakeConnector` (`test-util` feature)
//!
//! ## Key Concepts
//!
//! - **SessionIdentity**: a normalized phone number; one live attempt each
//! - **SessionStore**: per-identity credential directory, reset on every attempt
//! - **ProtocolClient**: the remote endpoint, behind a trait
//! - **PairingOrchestrator**: the lifecycle state machine

pub mod client;
pub mod event_bus;
pub mod identity;
pub mod pairing;
pub mod paths;
pub mod store;

// Re-export commonly used types
pub use event_bus::EventBus;
pub use identity::SessionIdentity;
pub use pairing::{PairingConfig, PairingError, PairingOrchestrator, PairingResult};
pub use store::SessionStore;
