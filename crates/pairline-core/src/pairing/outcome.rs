//! What an attempt tells its caller and its supervisor.

use serde::Serialize;
use thiserror::Error;

use crate::identity::{IdentityError, SessionIdentity};

/// The single response delivered to the caller of `initiate`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "camelCase")]
pub enum PairingResult {
    /// Enter this code on the companion device.
    Pairing {
        #[serde(rename = "pairingCode")]
        pairing_code: String,
    },
    /// Already registered; credentials were delivered without a code.
    Completed,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PairingError {
    #[error("{0}")]
    Validation(String),

    #[error("Failed to initialize session: {0}")]
    Initialization(String),

    #[error("Failed to generate pairing code")]
    PairingCode { reason: String },

    #[error("Authentication failed: {0}")]
    Authentication(String),

    #[error("Connection lost after {attempts} reconnect attempts: {reason}")]
    ReconnectsExhausted { attempts: u32, reason: String },

    #[error("Failed to transfer credentials: {0}")]
    Transfer(String),

    #[error("Pairing timed out")]
    Timeout,

    #[error("Superseded by a newer pairing request")]
    Superseded,

    #[error("Pairing attempt crashed: {0}")]
    Internal(String),
}

impl From<IdentityError> for PairingError {
    fn from(e: IdentityError) -> Self {
        PairingError::Validation(e.to_string())
    }
}

/// Terminal result of an attempt, as seen by the supervisor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptOutcome {
    /// Credentials were sent to the user's own address.
    Delivered,
    Failed(PairingError),
    /// A newer request for the same identity took over.
    Superseded,
    /// The attempt task panicked with this message.
    Crashed(String),
}

/// Delivered to the supervisor once per finished attempt.
#[derive(Debug, Clone)]
pub struct AttemptReport {
    pub identity: SessionIdentity,
    pub outcome: AttemptOutcome,
}
