//! Registry of connected storage nodes.

use crate::cluster::events::{StoreEvent, StoreEventListener};
use crate::network::Connection;
use crate::types::{ConnectionId, StorePort};
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

/// A connected storage node.
#[derive(Debug, Clone)]
pub struct StorageNode {
    /// Listening port, the node's identity.
    pub port: StorePort,

    /// Connection the node joined on.
    pub connection: Arc<Connection>,

    /// When the node joined.
    pub joined_at: Instant,
}

#[derive(Default)]
struct RegistryInner {
    /// Nodes in join order.
    nodes: Vec<StorageNode>,

    /// Round-robin allocation cursor. Only ever advances.
    cursor: usize,
}

/// The pool of storage nodes known to the controller.
#[derive(Default)]
pub struct StoreRegistry {
    inner: RwLock<RegistryInner>,
    listeners: RwLock<Vec<Arc<dyn StoreEventListener>>>,
}

impl std::fmt::Debug for StoreRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreRegistry")
            .field("nodes", &self.ports())
            .finish()
    }
}

impl StoreRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a listener notified after every join and leave.
    pub fn add_listener(&self, listener: Arc<dyn StoreEventListener>) {
        self.listeners.write().push(listener);
    }

    /// Register a node. A node re-joining with a known port replaces the
    /// previous registration, which counts as a leave of the old node.
    pub fn join(&self, port: StorePort, connection: Arc<Connection>) {
        let replaced = {
            let mut inner = self.inner.write();
            let replaced = match inner.nodes.iter().position(|n| n.port == port) {
                Some(idx) => {
                    inner.nodes.remove(idx);
                    true
                }
                None => false,
            };
            inner.nodes.push(StorageNode {
                port,
                connection,
                joined_at: Instant::now(),
            });
            replaced
        };

        if replaced {
            warn!(port, "Storage node re-joined, replacing previous registration");
            self.emit(StoreEvent::Left { port });
        }
        self.emit(StoreEvent::Joined { port });
    }

    /// Remove the node on `port`. Returns whether it was registered.
    pub fn leave(&self, port: StorePort) -> bool {
        let removed = {
            let mut inner = self.inner.write();
            let before = inner.nodes.len();
            inner.nodes.retain(|n| n.port != port);
            inner.nodes.len() != before
        };

        if removed {
            self.emit(StoreEvent::Left { port });
        }
        removed
    }

    /// Remove the node on `port` only if it is still registered through
    /// connection `conn`, so a stale link cannot evict a newer registration.
    pub fn leave_connection(&self, port: StorePort, conn: ConnectionId) -> bool {
        let removed = {
            let mut inner = self.inner.write();
            let before = inner.nodes.len();
            inner
                .nodes
                .retain(|n| !(n.port == port && n.connection.id() == conn));
            inner.nodes.len() != before
        };

        if removed {
            self.emit(StoreEvent::Left { port });
        } else {
            debug!(port, %conn, "Ignoring leave from a superseded connection");
        }
        removed
    }

    /// Pick `count` distinct nodes round robin. Empty if the pool is too small.
    pub fn allocate(&self, count: usize) -> Vec<StorePort> {
        let mut inner = self.inner.write();
        let len = inner.nodes.len();
        if count == 0 || len < count {
            return Vec::new();
        }

        let mut ports = Vec::with_capacity(count);
        for _ in 0..count {
            let idx = inner.cursor % len;
            ports.push(inner.nodes[idx].port);
            inner.cursor = inner.cursor.wrapping_add(1);
        }
        ports
    }

    /// Whether at least `replication_factor` nodes are connected.
    pub fn has_enough(&self, replication_factor: usize) -> bool {
        self.inner.read().nodes.len() >= replication_factor
    }

    /// Look up a node by port.
    pub fn get(&self, port: StorePort) -> Option<StorageNode> {
        self.inner
            .read()
            .nodes
            .iter()
            .find(|n| n.port == port)
            .cloned()
    }

    pub fn contains(&self, port: StorePort) -> bool {
        self.inner.read().nodes.iter().any(|n| n.port == port)
    }

    /// Snapshot of all nodes in join order.
    pub fn nodes(&self) -> Vec<StorageNode> {
        self.inner.read().nodes.clone()
    }

    /// Ports of all nodes in join order.
    pub fn ports(&self) -> Vec<StorePort> {
        self.inner.read().nodes.iter().map(|n| n.port).collect()
    }

    pub fn len(&self) -> usize {
        self.inner.read().nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().nodes.is_empty()
    }

    fn emit(&self, event: StoreEvent) {
        let listeners = self.listeners.read().clone();
        for listener in listeners {
            listener.on_event(event);
        }
    }
}
