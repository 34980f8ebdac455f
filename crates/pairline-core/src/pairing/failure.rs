//! Classification of crashed attempts.

use std::any::Any;

use super::outcome::AttemptOutcome;

/// Transient remote conditions that surface as crashes but are not fatal.
pub const BENIGN_FAILURE_PATTERNS: &[&str] = &[
    "conflict",
    "not-authorized",
    "Socket connection timeout",
    "rate-overlimit",
    "Connection Closed",
    "Timed Out",
    "Value not found",
];

/// Whether a failure message matches a known-benign pattern.
pub fn is_benign_failure(message: &str) -> bool {
    BENIGN_FAILURE_PATTERNS
        .iter()
        .any(|pattern| message.contains(pattern))
}

/// Whether the supervisor should stop the process for this outcome.
pub fn is_fatal(outcome: &AttemptOutcome) -> bool {
    match outcome {
        AttemptOutcome::Crashed(message) => !is_benign_failure(message),
        _ => false,
    }
}

/// Extract a readable message from a panic payload.
pub fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pairing::PairingError;

    #[test]
    fn benign_patterns_match_substrings() {
        assert!(is_benign_failure("Stream Errored (conflict)"));
        assert!(is_benign_failure("rate-overlimit while requesting code"));
        assert!(is_benign_failure("Timed Out"));
        assert!(!is_benign_failure("index out of bounds"));
    }

    #[test]
    fn matching_is_case_sensitive() {
        assert!(!is_benign_failure("timed out"));
    }

    #[test]
    fn only_unknown_crashes_are_fatal() {
        assert!(is_fatal(&AttemptOutcome::Crashed("boom".into())));
        assert!(!is_fatal(&AttemptOutcome::Crashed("Connection Closed".into())));
        assert!(!is_fatal(&AttemptOutcome::Failed(PairingError::Timeout)));
        assert!(!is_fatal(&AttemptOutcome::Delivered));
        assert!(!is_fatal(&AttemptOutcome::Superseded));
    }

    #[test]
    fn panic_message_downcasts() {
        assert_eq!(panic_message(Box::new("static")), "static");
        assert_eq!(panic_message(Box::new(String::from("owned"))), "owned");
        assert_eq!(panic_message(Box::new(42u8)), "unknown panic");
    }
}
