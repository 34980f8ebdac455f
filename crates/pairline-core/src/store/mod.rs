//! Per-identity authentication state on disk.
//!
//! # File Locations
//!
//! ```text
//! <session_root>/
//! └── <digits>/
//!     └── creds.json          # Credential blob written by the protocol client
//! ```
//!
//! # Design Principles
//!
//! ## Destructive prepare
//!
//! Every new pairing attempt starts from an empty directory. Leftovers from a
//! previous attempt are removed, never merged.
//!
//! ## Atomic Writes
//!
//! Credential updates use write-then-rename (`creds.json.tmp` → `creds.json`),
//! so a reader never observes a half-written blob.
//!
//! ## Best-effort cleanup
//!
//! [`SessionStore::discard`] never fails. Removal errors are logged and
//! swallowed so teardown paths can call it unconditionally.

mod credentials;
mod session_store;

pub use credentials::{Credentials, PersistedStatus};
pub use session_store::{AuthState, CredentialSink, SessionStore, StoreError, CREDENTIALS_FILE};
