//! Shared state for the HTTP server.

use pairline_core::event_bus::EventBus;
use pairline_core::pairing::PairingOrchestrator;
use std::sync::Arc;

/// Shared state available to all HTTP handlers.
#[derive(Clone)]
pub struct SharedState {
    pub orchestrator: PairingOrchestrator,
    /// Same bus the orchestrator publishes lifecycle events on.
    pub event_bus: Arc<EventBus>,
}

impl SharedState {
    pub fn new(orchestrator: PairingOrchestrator) -> Self {
        let event_bus = Arc::clone(orchestrator.event_bus());
        Self {
            orchestrator,
            event_bus,
        }
    }
}
