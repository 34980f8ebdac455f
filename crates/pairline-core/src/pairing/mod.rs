//! Pairing lifecycle.
//!
//! [`PairingOrchestrator`] runs one attempt per identity through
//! `Initializing → AwaitingPairing → Connecting → Transferring → Closed`,
//! answers the caller exactly once, and reports every finished attempt to
//! its supervisor as an [`AttemptReport`].

mod failure;
mod messages;
mod orchestrator;
mod outcome;
mod policy;
mod registry;
mod responder;
mod state;

pub use failure::{is_benign_failure, is_fatal, panic_message, BENIGN_FAILURE_PATTERNS};
pub use messages::{
    advisory_message, credentials_document, format_pairing_code, ADVISORY_TEXT,
    CREDENTIALS_FILE_NAME, CREDENTIALS_MIME_TYPE,
};
pub use orchestrator::{PairingOrchestrator, PairingResponse};
pub use outcome::{AttemptOutcome, AttemptReport, PairingError, PairingResult};
pub use policy::{PairingConfig, PairingTimings, ReconnectPolicy};
pub use registry::{AttemptRegistry, SpawnedAttempt};
pub use responder::ResponseSlot;
pub use state::{LifecycleState, SessionAttempt, Termination};
