//! At-most-once response slot.

use std::sync::{Mutex, PoisonError};

use tokio::sync::oneshot;

/// Holds the caller's response channel until the first write.
///
/// Every terminal path may try to respond; only the first write is delivered
/// and later ones report `false`.
pub struct ResponseSlot<T> {
    sender: Mutex<Option<oneshot::Sender<T>>>,
}

impl<T> ResponseSlot<T> {
    pub fn channel() -> (Self, oneshot::Receiver<T>) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                sender: Mutex::new(Some(tx)),
            },
            rx,
        )
    }

    /// Deliver `value` if nothing was delivered yet.
    ///
    /// Returns true when this call consumed the slot, even if the caller has
    /// already stopped listening.
    pub fn respond(&self, value: T) -> bool {
        let sender = self
            .sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        match sender {
            Some(tx) => {
                let _ = tx.send(value);
                true
            }
            None => false,
        }
    }

    pub fn is_spent(&self) -> bool {
        self.sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_none()
    }
}
