//! Message handling on the controller.
//!
//! One dispatcher serves every connection. A connection becomes a storage
//! node link once it sent `JOIN`; every other connection is a client.
//! Storage node links bypass the rebalance hold so acknowledgements and
//! listings keep flowing while client requests wait.

use crate::cluster::StoreRegistry;
use crate::error::{FileOperationError, Result};
use crate::index::{FileIndex, LoadTracker};
use crate::network::{Connection, Dispatcher, Message};
use crate::rebalancing::{RebalanceCoordinator, RebalanceTrigger};
use crate::types::StorePort;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// The wire reply for a failed file operation.
pub fn error_reply(err: FileOperationError) -> Message {
    match err {
        FileOperationError::AlreadyExists => Message::ErrorFileAlreadyExists,
        FileOperationError::NotExists | FileOperationError::AlreadyRemoving => {
            Message::ErrorFileDoesNotExist
        }
        FileOperationError::NotEnoughStores => Message::ErrorNotEnoughDstores,
        FileOperationError::LoadFailed => Message::ErrorLoad,
    }
}

/// Routes controller traffic to the registry, the index and the coordinator.
pub struct ControllerDispatcher {
    registry: Arc<StoreRegistry>,
    index: Arc<FileIndex>,
    coordinator: Arc<RebalanceCoordinator>,
    loads: LoadTracker,
    replication_factor: usize,
}

impl std::fmt::Debug for ControllerDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControllerDispatcher")
            .field("nodes", &self.registry.len())
            .field("loads", &self.loads.len())
            .field("replication_factor", &self.replication_factor)
            .finish()
    }
}

impl ControllerDispatcher {
    pub fn new(
        registry: Arc<StoreRegistry>,
        index: Arc<FileIndex>,
        coordinator: Arc<RebalanceCoordinator>,
        replication_factor: usize,
    ) -> Self {
        Self {
            registry,
            index,
            coordinator,
            loads: LoadTracker::new(),
            replication_factor,
        }
    }

    async fn reply(
        &self,
        conn: &Arc<Connection>,
        result: std::result::Result<Message, FileOperationError>,
    ) -> Result<()> {
        let msg = result.unwrap_or_else(|e| {
            debug!(conn = %conn.id(), error = %e, "File operation refused");
            error_reply(e)
        });
        conn.send(&msg).await
    }

    fn ensure_enough_stores(&self) -> std::result::Result<(), FileOperationError> {
        if self.registry.has_enough(self.replication_factor) {
            Ok(())
        } else {
            Err(FileOperationError::NotEnoughStores)
        }
    }

    fn handle_join(&self, conn: &Arc<Connection>, port: StorePort) {
        if let Some(existing) = conn.store_port() {
            warn!(conn = %conn.id(), existing, port, "Connection already joined, ignoring JOIN");
            return;
        }
        conn.set_store_port(port);
        self.registry.join(port, conn.clone());
        info!(port, nodes = self.registry.len(), "Storage node joined");

        if self.registry.has_enough(self.replication_factor) {
            self.coordinator.trigger(RebalanceTrigger::NodeJoin(port));
        }
    }

    async fn handle_store(&self, conn: &Arc<Connection>, name: &str, size: u64) -> Result<()> {
        let result = match self.ensure_enough_stores() {
            Ok(()) => self
                .index
                .add_file(name, size, conn.clone())
                .await
                .map(|ports| Message::StoreTo { ports }),
            Err(e) => Err(e),
        };
        self.reply(conn, result).await
    }

    async fn handle_load(&self, conn: &Arc<Connection>, name: &str) -> Result<()> {
        let result = self.ensure_enough_stores().and_then(|()| {
            let file = self
                .index
                .get_available(name)
                .ok_or(FileOperationError::NotExists)?;
            self.loads
                .start(conn.id(), &file, |port| self.registry.contains(port))
                .map(|(port, size)| Message::LoadFrom { port, size })
                .ok_or(FileOperationError::LoadFailed)
        });
        self.reply(conn, result).await
    }

    async fn handle_reload(&self, conn: &Arc<Connection>, name: &str) -> Result<()> {
        let result = self
            .loads
            .reload(conn.id(), name, |port| self.registry.contains(port))
            .map(|(port, size)| Message::LoadFrom { port, size })
            .ok_or(FileOperationError::LoadFailed);
        self.reply(conn, result).await
    }

    async fn handle_remove(&self, conn: &Arc<Connection>, name: &str) -> Result<()> {
        match self.index.remove_file(name, conn.clone()).await {
            Ok(()) => Ok(()),
            Err(e) => self.reply(conn, Err(e)).await,
        }
    }
}

#[async_trait]
impl Dispatcher for ControllerDispatcher {
    async fn dispatch(&self, conn: &Arc<Connection>, msg: Message) -> Result<()> {
        let store_port = conn.store_port();
        match (msg, store_port) {
            (Message::Join { port }, _) => {
                self.handle_join(conn, port);
                Ok(())
            }

            (Message::StoreAck { name }, Some(port)) => {
                debug!(file = %name, port, "Store acknowledged by node");
                self.index.acknowledge_store(&name);
                Ok(())
            }
            (Message::RemoveAck { name }, Some(port)) => {
                self.index.acknowledge_remove(&name, port);
                Ok(())
            }
            (Message::List(names), Some(port)) => {
                self.coordinator.handle_listing(port, names);
                Ok(())
            }
            (Message::RebalanceComplete, Some(port)) => {
                self.coordinator.handle_complete(port);
                Ok(())
            }
            (Message::ErrorFileDoesNotExist, Some(port)) => {
                warn!(port, "Storage node reported a missing file");
                Ok(())
            }

            (Message::Store { name, size }, None) => self.handle_store(conn, &name, size).await,
            (Message::Load { name }, None) => self.handle_load(conn, &name).await,
            (Message::Reload { name }, None) => self.handle_reload(conn, &name).await,
            (Message::Remove { name }, None) => self.handle_remove(conn, &name).await,
            (Message::List(_), None) => {
                conn.send(&Message::List(self.index.available_names()))
                    .await
            }

            (other, port) => {
                warn!(
                    conn = %conn.id(),
                    kind = other.kind(),
                    store = port.is_some(),
                    "Message not valid from this peer, ignoring"
                );
                Ok(())
            }
        }
    }

    fn accepts(&self, msg: &Message) -> bool {
        matches!(
            msg,
            Message::Join { .. }
                | Message::Store { .. }
                | Message::StoreAck { .. }
                | Message::Load { .. }
                | Message::Reload { .. }
                | Message::Remove { .. }
                | Message::RemoveAck { .. }
                | Message::List(_)
                | Message::RebalanceComplete
                | Message::ErrorFileDoesNotExist
        )
    }

    fn bypasses_hold(&self, conn: &Connection) -> bool {
        conn.store_port().is_some()
    }

    async fn disconnected(&self, conn: &Arc<Connection>) {
        self.loads.forget(conn.id());
        match conn.store_port() {
            Some(port) => {
                if self.registry.leave_connection(port, conn.id()) {
                    warn!(port, nodes = self.registry.len(), "Storage node disconnected");
                }
            }
            None => debug!(conn = %conn.id(), "Client disconnected"),
        }
    }
}
