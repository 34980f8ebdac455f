//! SessionStore and the credential sink handed to protocol clients.

use std::collections::HashMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use thiserror::Error;
use tokio::sync::watch;

use super::credentials::{Credentials, PersistedStatus};
use crate::identity::SessionIdentity;

/// Name of the credential blob inside a session directory.
pub const CREDENTIALS_FILE: &str = "creds.json";

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Credentials not found for {0}")]
    NotFound(SessionIdentity),

    #[error("Storage for {0} was reset; this sink no longer owns it")]
    Stale(SessionIdentity),
}

/// Storage epoch per identity.
///
/// Every `prepare`, `load`, and `discard` advances the epoch, and a sink may
/// only write while the epoch it was issued under is still current.
#[derive(Debug, Clone, Default)]
struct Epochs(Arc<Mutex<HashMap<SessionIdentity, u64>>>);

impl Epochs {
    fn lock(&self) -> MutexGuard<'_, HashMap<SessionIdentity, u64>> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn advance(epochs: &mut HashMap<SessionIdentity, u64>, identity: &SessionIdentity) -> u64 {
    let epoch = epochs.entry(identity.clone()).or_insert(0);
    *epoch += 1;
    *epoch
}

/// Manages one storage directory per session identity.
///
/// Clones share the same epochs, so a sink issued by one clone is
/// invalidated by a reset through any other.
#[derive(Debug, Clone)]
pub struct SessionStore {
    root: PathBuf,
    epochs: Epochs,
}

impl SessionStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            epochs: Epochs::default(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory holding the state for `identity`.
    pub fn session_dir(&self, identity: &SessionIdentity) -> PathBuf {
        self.root.join(identity.digits())
    }

    /// Whether any storage exists for `identity`.
    pub fn exists(&self, identity: &SessionIdentity) -> bool {
        self.session_dir(identity).exists()
    }

    /// Reset storage for `identity` and return fresh, unregistered state.
    ///
    /// Existing storage is removed first. A missing directory is fine; other
    /// removal failures are logged and do not abort the prepare. Sinks issued
    /// earlier for `identity` stop accepting writes.
    pub fn prepare(&self, identity: &SessionIdentity) -> Result<AuthState, StoreError> {
        let mut epochs = self.epochs.lock();
        let epoch = advance(&mut epochs, identity);
        self.remove_storage(identity);

        let dir = self.session_dir(identity);
        fs::create_dir_all(&dir)?;

        let credentials = Credentials::fresh();
        let sink = self.sink(identity, epoch, &credentials);
        Ok(AuthState::new(identity.clone(), credentials, sink))
    }

    /// Open the existing state for `identity` without resetting it.
    ///
    /// Falls back to fresh credentials when nothing has been written yet.
    /// As with `prepare`, earlier sinks for `identity` become stale.
    pub fn load(&self, identity: &SessionIdentity) -> Result<AuthState, StoreError> {
        let mut epochs = self.epochs.lock();
        let epoch = advance(&mut epochs, identity);
        let dir = self.session_dir(identity);
        fs::create_dir_all(&dir)?;

        let credentials = match fs::read_to_string(dir.join(CREDENTIALS_FILE)) {
            Ok(contents) => serde_json::from_str(&contents)?,
            Err(e) if e.kind() == ErrorKind::NotFound => Credentials::fresh(),
            Err(e) => return Err(e.into()),
        };

        let sink = self.sink(identity, epoch, &credentials);
        Ok(AuthState::new(identity.clone(), credentials, sink))
    }

    /// Read the serialized credential blob for `identity`.
    ///
    /// Returns `StoreError::NotFound` until the client has saved credentials.
    pub fn persisted_credentials(&self, identity: &SessionIdentity) -> Result<Vec<u8>, StoreError> {
        let path = self.session_dir(identity).join(CREDENTIALS_FILE);
        match fs::read(&path) {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                Err(StoreError::NotFound(identity.clone()))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Remove all storage for `identity`. Never fails.
    pub fn discard(&self, identity: &SessionIdentity) {
        let mut epochs = self.epochs.lock();
        advance(&mut epochs, identity);
        self.remove_storage(identity);
    }

    fn sink(
        &self,
        identity: &SessionIdentity,
        epoch: u64,
        initial: &Credentials,
    ) -> CredentialSink {
        let (status, _) = watch::channel(PersistedStatus {
            registered: initial.registered,
            revision: 0,
        });
        CredentialSink {
            identity: identity.clone(),
            dir: self.session_dir(identity),
            epoch,
            epochs: self.epochs.clone(),
            status: Arc::new(status),
        }
    }

    fn remove_storage(&self, identity: &SessionIdentity) {
        let dir = self.session_dir(identity);
        match fs::remove_dir_all(&dir) {
            Ok(()) => log::debug!("Removed session storage for {}", identity),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => log::warn!(
                "Failed to remove session storage for {} at {}: {}",
                identity,
                dir.display(),
                e
            ),
        }
    }
}

/// Write handle for credential updates coming from the protocol client.
///
/// Each successful save is acknowledged on a watch channel, so the
/// orchestrator can wait for the registered state to reach disk instead of
/// guessing with a timer.
#[derive(Debug, Clone)]
pub struct CredentialSink {
    identity: SessionIdentity,
    dir: PathBuf,
    epoch: u64,
    epochs: Epochs,
    status: Arc<watch::Sender<PersistedStatus>>,
}

impl CredentialSink {
    /// Persist `credentials` atomically and acknowledge the write.
    ///
    /// The session directory is not recreated: once storage has been
    /// discarded, late writes fail instead of leaving residue behind. Once the
    /// store has been reset for this identity, writes fail with
    /// [`StoreError::Stale`] even though the directory exists again.
    pub fn save(&self, credentials: &Credentials) -> Result<(), StoreError> {
        // Held across the write so a concurrent reset cannot interleave.
        let epochs = self.epochs.lock();
        if epochs.get(&self.identity) != Some(&self.epoch) {
            log::debug!("Rejected stale credential write for {}", self.identity);
            return Err(StoreError::Stale(self.identity.clone()));
        }

        let file_path = self.dir.join(CREDENTIALS_FILE);
        let temp_path = self.dir.join(format!("{CREDENTIALS_FILE}.tmp"));

        let json = serde_json::to_vec_pretty(credentials)?;
        fs::write(&temp_path, json)?;
        fs::rename(&temp_path, &file_path)?;

        self.status.send_modify(|status| {
            status.registered = credentials.registered;
            status.revision += 1;
        });
        Ok(())
    }

    /// Last acknowledged status.
    pub fn status(&self) -> PersistedStatus {
        *self.status.borrow()
    }

    /// Subscribe to save acknowledgments.
    pub fn subscribe(&self) -> watch::Receiver<PersistedStatus> {
        self.status.subscribe()
    }
}

/// Credentials plus the sink that persists updates to them.
#[derive(Debug, Clone)]
pub struct AuthState {
    identity: SessionIdentity,
    credentials: Credentials,
    sink: CredentialSink,
}

impl AuthState {
    fn new(identity: SessionIdentity, credentials: Credentials, sink: CredentialSink) -> Self {
        Self {
            identity,
            credentials,
            sink,
        }
    }

    pub fn identity(&self) -> &SessionIdentity {
        &self.identity
    }

    pub fn credentials(&self) -> &Credentials {
        &self.credentials
    }

    pub fn sink(&self) -> &CredentialSink {
        &self.sink
    }

    pub fn is_registered(&self) -> bool {
        self.credentials.registered
    }
}

// ============================================================================
// TESTS
// ============================================================================
