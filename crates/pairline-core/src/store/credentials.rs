//! Credential blob and its persisted status.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Credential and key material for one session.
///
/// Only `registered` is interpreted here. Everything else the protocol client
/// stores is carried through untouched in `material`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Credentials {
    #[serde(default)]
    pub registered: bool,

    #[serde(flatten)]
    pub material: Map<String, Value>,
}

impl Credentials {
    /// Fresh, unregistered credentials with no key material.
    pub fn fresh() -> Self {
        Self::default()
    }

    /// Builder-style setter for one material entry.
    pub fn with_material(mut self, key: impl Into<String>, value: Value) -> Self {
        self.material.insert(key.into(), value);
        self
    }
}

/// What the store last acknowledged writing to disk.
///
/// `revision` counts successful saves through one sink; 0 means nothing has
/// been written yet.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PersistedStatus {
    pub registered: bool,
    pub revision: u64,
}
