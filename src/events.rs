//! Bridge event bus: broadcast of coarse lifecycle events.
//!
//! Connectivity transitions, upgrade/restart recommendations, and address
//! mutations are announced here so that frontends and connection managers
//! can react. Emission is fire-and-forget; a bus with no subscribers is
//! valid and sends are never awaited.

use tokio::sync::broadcast;

use crate::constants::EVENT_BUS_CAPACITY;

/// Coarse lifecycle event visible outside the sync core.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BridgeEvent {
    /// The remote service stopped being reachable.
    InternetOff,
    /// Connectivity came back after an `InternetOff`.
    InternetOn,
    /// The remote service refuses this client version.
    UpgradeApplication,
    /// The process is degraded (e.g. file descriptors near the ulimit)
    /// and should be restarted.
    RestartBridge,
    /// An address was added; carries the user's current primary address.
    AddressChanged(String),
    /// An address change invalidated sessions for this email.
    AddressChangedLogout(String),
}

/// Cloneable handle to the broadcast bus.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<BridgeEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_BUS_CAPACITY);
        Self { tx }
    }

    /// Emit an event to all current subscribers. Never blocks; an event
    /// with no listeners is dropped silently.
    pub fn emit(&self, event: BridgeEvent) {
        tracing::debug!("Emitting bridge event: {:?}", event);
        self.tx.send(event).ok();
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BridgeEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
