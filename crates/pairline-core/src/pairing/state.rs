//! Lifecycle states and the per-attempt snapshot.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::identity::SessionIdentity;

/// How a closed attempt ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Termination {
    Success,
    Failure,
}

/// Where an attempt is in its lifecycle.
///
/// ```text
/// Initializing ─┬─> AwaitingPairing ─┐
///               └────────────────────┴─> Connecting ─> Transferring ─> Closed(Success)
///                      (any state) ──────────────────────────────────> Closed(Failure)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum LifecycleState {
    Initializing,
    AwaitingPairing,
    Connecting,
    Transferring,
    Closed(Termination),
}

impl LifecycleState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, LifecycleState::Closed(_))
    }
}

/// Run-time record of one pairing attempt.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionAttempt {
    pub identity: SessionIdentity,
    pub state: LifecycleState,
    pub created_at: DateTime<Utc>,
    pub reconnects: u32,
    /// Most recent code issued for this attempt, formatted for display.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pairing_code: Option<String>,
}

impl SessionAttempt {
    pub fn new(identity: SessionIdentity) -> Self {
        Self {
            identity,
            state: LifecycleState::Initializing,
            created_at: Utc::now(),
            reconnects: 0,
            pairing_code: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_attempt_is_initializing() {
        let attempt = SessionAttempt::new(SessionIdentity::parse("0771234567").unwrap());
        assert_eq!(attempt.state, LifecycleState::Initializing);
        assert_eq!(attempt.reconnects, 0);
        assert!(attempt.pairing_code.is_none());
    }

    #[test]
    fn only_closed_is_terminal() {
        assert!(LifecycleState::Closed(Termination::Success).is_terminal());
        assert!(LifecycleState::Closed(Termination::Failure).is_terminal());
        assert!(!LifecycleState::Initializing.is_terminal());
        assert!(!LifecycleState::AwaitingPairing.is_terminal());
        assert!(!LifecycleState::Connecting.is_terminal());
        assert!(!LifecycleState::Transferring.is_terminal());
    }

    #[test]
    fn state_serialization() {
        assert_eq!(
            serde_json::to_value(LifecycleState::AwaitingPairing).unwrap(),
            "awaitingPairing"
        );
        assert_eq!(
            serde_json::to_value(LifecycleState::Closed(Termination::Failure)).unwrap(),
            serde_json::json!({"closed": "failure"})
        );
    }

    #[test]
    fn snapshot_serialization_omits_missing_code() {
        let attempt = SessionAttempt::new(SessionIdentity::parse("0771234567").unwrap());
        let json = serde_json::to_value(&attempt).unwrap();

        assert_eq!(json["identity"], "0771234567");
        assert_eq!(json["state"], "initializing");
        assert!(json.get("createdAt").is_some());
        assert!(json.get("pairingCode").is_none());
    }
}
