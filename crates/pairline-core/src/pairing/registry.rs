//! AttemptRegistry - one live attempt per identity.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::sync::watch;
use tokio::task::AbortHandle;

use super::state::SessionAttempt;
use crate::identity::SessionIdentity;

/// Handles returned by the spawner passed to [`AttemptRegistry::replace`].
pub struct SpawnedAttempt {
    pub task: AbortHandle,
    /// Flips to `true` once the attempt has fully stopped.
    pub finished: watch::Receiver<bool>,
}

struct AttemptEntry {
    generation: u64,
    snapshot: SessionAttempt,
    task: AbortHandle,
    finished: watch::Receiver<bool>,
}

#[derive(Default)]
struct RegistryInner {
    next_generation: u64,
    attempts: HashMap<SessionIdentity, AttemptEntry>,
}

/// Tracks the live attempt for every identity.
///
/// Each attempt is tagged with a generation number. Updates and removals
/// carry the generation they were issued for, so a superseded attempt can
/// never touch the entry of the attempt that replaced it.
#[derive(Default)]
pub struct AttemptRegistry {
    inner: Mutex<RegistryInner>,
}

impl AttemptRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, RegistryInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Replace the attempt for `identity` with a new one.
    ///
    /// Under a single lock: the previous attempt (if any) is aborted, and
    /// `spawn` is called with the new generation plus the previous attempt's
    /// `finished` receiver so the new task can wait for it to stop.
    ///
    /// Returns the new generation and the snapshot of the replaced attempt.
    pub fn replace<F>(&self, identity: SessionIdentity, spawn: F) -> (u64, Option<SessionAttempt>)
    where
        F: FnOnce(u64, Option<watch::Receiver<bool>>) -> SpawnedAttempt,
    {
        let mut inner = self.lock();

        let previous = inner.attempts.remove(&identity);
        let waiting_on = previous.as_ref().map(|entry| {
            entry.task.abort();
            entry.finished.clone()
        });

        inner.next_generation += 1;
        let generation = inner.next_generation;
        let spawned = spawn(generation, waiting_on);

        inner.attempts.insert(
            identity.clone(),
            AttemptEntry {
                generation,
                snapshot: SessionAttempt::new(identity),
                task: spawned.task,
                finished: spawned.finished,
            },
        );

        (generation, previous.map(|entry| entry.snapshot))
    }

    /// Apply `f` to the snapshot if `generation` is still current.
    ///
    /// Returns the updated snapshot.
    pub fn update<F>(
        &self,
        identity: &SessionIdentity,
        generation: u64,
        f: F,
    ) -> Option<SessionAttempt>
    where
        F: FnOnce(&mut SessionAttempt),
    {
        let mut inner = self.lock();
        let entry = inner
            .attempts
            .get_mut(identity)
            .filter(|entry| entry.generation == generation)?;
        f(&mut entry.snapshot);
        Some(entry.snapshot.clone())
    }

    pub fn is_current(&self, identity: &SessionIdentity, generation: u64) -> bool {
        self.lock()
            .attempts
            .get(identity)
            .is_some_and(|entry| entry.generation == generation)
    }

    /// Remove the entry if `generation` is still current.
    pub fn remove(&self, identity: &SessionIdentity, generation: u64) -> Option<SessionAttempt> {
        let mut inner = self.lock();
        if inner
            .attempts
            .get(identity)
            .is_some_and(|entry| entry.generation == generation)
        {
            inner.attempts.remove(identity).map(|entry| entry.snapshot)
        } else {
            None
        }
    }

    pub fn get(&self, identity: &SessionIdentity) -> Option<SessionAttempt> {
        self.lock()
            .attempts
            .get(identity)
            .map(|entry| entry.snapshot.clone())
    }

    /// All live attempts, oldest first.
    pub fn snapshots(&self) -> Vec<SessionAttempt> {
        let mut snapshots: Vec<_> = self
            .lock()
            .attempts
            .values()
            .map(|entry| entry.snapshot.clone())
            .collect();
        snapshots.sort_by_key(|snapshot| snapshot.created_at);
        snapshots
    }

    pub fn len(&self) -> usize {
        self.lock().attempts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
