//! Storage pool membership events.

use crate::types::StorePort;

/// Events related to storage pool changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreEvent {
    /// A storage node joined the pool.
    Joined {
        /// The node's listening port.
        port: StorePort,
    },

    /// A storage node left the pool, either because its connection dropped or
    /// because it stopped answering.
    Left {
        /// The node's listening port.
        port: StorePort,
    },
}

impl StoreEvent {
    /// Port of the node this event is about.
    pub fn port(&self) -> StorePort {
        match self {
            StoreEvent::Joined { port } | StoreEvent::Left { port } => *port,
        }
    }

    pub fn is_leave(&self) -> bool {
        matches!(self, StoreEvent::Left { .. })
    }
}

/// Listener for storage pool events.
pub trait StoreEventListener: Send + Sync + 'static {
    /// Called after the registry applied the change.
    fn on_event(&self, event: StoreEvent);
}

/// Event listener that logs events.
pub struct LoggingEventListener;

impl StoreEventListener for LoggingEventListener {
    fn on_event(&self, event: StoreEvent) {
        match event {
            StoreEvent::Joined { port } => tracing::info!(port, "Storage node joined pool"),
            StoreEvent::Left { port } => tracing::info!(port, "Storage node left pool"),
        }
    }
}
