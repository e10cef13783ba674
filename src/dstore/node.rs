//! A running storage node.

use crate::config::StoreConfig;
use crate::dstore::dispatcher::{ControllerLinkDispatcher, PeerDispatcher, StoreContext};
use crate::dstore::storage::{DiskFileStore, FileStore};
use crate::error::{NetworkError, Result};
use crate::network::{Connection, NetworkServer};
use crate::types::{local_addr, StorePort};
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// A storage node: a server for clients and peers plus a link to the controller.
pub struct StoreNode {
    /// Shared handler state.
    ctx: Arc<StoreContext>,

    /// Address the server is bound to.
    local_addr: SocketAddr,

    /// Link to the controller.
    controller: Arc<Connection>,

    /// Stops the server.
    shutdown: CancellationToken,

    /// Cancelled when the controller link ends.
    controller_lost: CancellationToken,

    /// Keeps the queue-hold channel of inbound links open. Never raised.
    _hold: watch::Sender<bool>,
}

impl std::fmt::Debug for StoreNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreNode")
            .field("port", &self.ctx.port())
            .field("local_addr", &self.local_addr)
            .finish()
    }
}

impl StoreNode {
    /// Start a storage node backed by `config.storage_dir`.
    ///
    /// This will:
    /// 1. Validate the configuration
    /// 2. Prepare (create and clear) the storage directory
    /// 3. Start the server for clients and peers
    /// 4. Connect to the controller and join the pool
    pub async fn start(config: StoreConfig) -> Result<Self> {
        config.validate()?;
        let store = DiskFileStore::prepare(&config.storage_dir).await?;
        Self::start_with_store(config, Arc::new(store)).await
    }

    /// Start a storage node on top of an already prepared store.
    pub async fn start_with_store(config: StoreConfig, store: Arc<dyn FileStore>) -> Result<Self> {
        config.validate()?;
        info!(port = config.port, controller_port = config.controller_port, "Starting storage node");

        let ctx = StoreContext::new(config.port, config.timeout, store);
        let shutdown = CancellationToken::new();
        let (hold_tx, hold) = watch::channel(false);

        let server = NetworkServer::bind(
            SocketAddr::from((Ipv4Addr::UNSPECIFIED, config.port)),
            Arc::new(PeerDispatcher::new(ctx.clone())),
            hold.clone(),
            shutdown.clone(),
        )
        .await?;
        let bound = server.local_addr()?;
        tokio::spawn(async move {
            if let Err(e) = server.run().await {
                error!(error = %e, "Storage node server error");
            }
        });

        let controller_lost = CancellationToken::new();
        let controller = match Connection::connect(
            local_addr(config.controller_port),
            Arc::new(ControllerLinkDispatcher::new(
                ctx.clone(),
                controller_lost.clone(),
            )),
            hold,
        )
        .await
        {
            Ok(conn) => conn,
            Err(e) => {
                shutdown.cancel();
                return Err(e);
            }
        };

        Ok(Self {
            ctx,
            local_addr: bound,
            controller,
            shutdown,
            controller_lost,
            _hold: hold_tx,
        })
    }

    pub fn port(&self) -> StorePort {
        self.ctx.port()
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// The node's local storage.
    pub fn store(&self) -> &Arc<dyn FileStore> {
        self.ctx.store()
    }

    /// Serve until shutdown. Losing the controller is an error.
    pub async fn run(&self) -> Result<()> {
        tokio::select! {
            _ = self.shutdown.cancelled() => Ok(()),
            _ = self.controller_lost.cancelled() => {
                if self.shutdown.is_cancelled() {
                    Ok(())
                } else {
                    Err(NetworkError::ConnectionClosed.into())
                }
            }
        }
    }

    /// Stop serving and leave the pool.
    pub async fn shutdown(&self) {
        info!(port = self.ctx.port(), "Shutting down storage node");
        self.shutdown.cancel();
        self.controller.close().await;
    }
}
