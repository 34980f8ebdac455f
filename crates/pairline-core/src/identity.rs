//! Session identity derived from a phone number.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Shortest accepted number after normalization.
const MIN_DIGITS: usize = 7;

/// E.164 caps numbers at 15 digits.
const MAX_DIGITS: usize = 15;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IdentityError {
    #[error("Phone number is required")]
    Missing,

    #[error("Phone number must contain between 7 and 15 digits, got {0}")]
    InvalidLength(usize),
}

/// A normalized phone number identifying one pairing attempt.
///
/// Only digits survive normalization, so `+94 77-123 4567` and `94771234567`
/// name the same session and share the same storage directory.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SessionIdentity(String);

impl SessionIdentity {
    /// Normalize and validate a raw phone number.
    pub fn parse(raw: &str) -> Result<Self, IdentityError> {
        let digits = normalize_phone_number(raw);
        if digits.is_empty() {
            return Err(IdentityError::Missing);
        }
        if !(MIN_DIGITS..=MAX_DIGITS).contains(&digits.len()) {
            return Err(IdentityError::InvalidLength(digits.len()));
        }
        Ok(Self(digits))
    }

    /// The digits-only form, used as storage key and pairing-code argument.
    pub fn digits(&self) -> &str {
        &self.0
    }

    /// The user's own protocol address on the given domain.
    pub fn address(&self, domain: &str) -> String {
        format!("{}@{}", self.0, domain)
    }
}

impl std::fmt::Display for SessionIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl TryFrom<String> for SessionIdentity {
    type Error = IdentityError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<SessionIdentity> for String {
    fn from(identity: SessionIdentity) -> Self {
        identity.0
    }
}

/// Strip everything but ASCII digits.
pub fn normalize_phone_number(raw: &str) -> String {
    raw.chars().filter(|c| c.is_ascii_digit()).collect()
}
