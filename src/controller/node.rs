//! A running controller.

use crate::cluster::{LoggingEventListener, OperationBarrier, StoreRegistry};
use crate::config::ControllerConfig;
use crate::controller::dispatcher::ControllerDispatcher;
use crate::error::Result;
use crate::index::FileIndex;
use crate::network::NetworkServer;
use crate::rebalancing::RebalanceCoordinator;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// The coordinating node of the cluster.
pub struct Controller {
    /// Connected storage nodes.
    registry: Arc<StoreRegistry>,

    /// File catalog.
    index: Arc<FileIndex>,

    /// Rebalance runner.
    coordinator: Arc<RebalanceCoordinator>,

    /// Address the server is bound to.
    local_addr: SocketAddr,

    /// Stops the server and the periodic rebalance.
    shutdown: CancellationToken,
}

impl std::fmt::Debug for Controller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Controller")
            .field("local_addr", &self.local_addr)
            .field("nodes", &self.registry.len())
            .field("files", &self.index.len())
            .finish()
    }
}

impl Controller {
    /// Start a controller.
    ///
    /// This will:
    /// 1. Validate the configuration
    /// 2. Wire the registry, barrier, index and rebalance coordinator
    /// 3. Start the network server
    /// 4. Schedule the periodic rebalance
    pub async fn start(config: ControllerConfig) -> Result<Self> {
        config.validate()?;
        info!(
            port = config.port,
            replication_factor = config.replication_factor,
            timeout_ms = config.timeout.as_millis() as u64,
            "Starting controller"
        );

        let registry = Arc::new(StoreRegistry::new());
        let barrier = OperationBarrier::new();
        let index = FileIndex::new(
            registry.clone(),
            barrier.clone(),
            config.replication_factor,
            config.timeout,
        );
        registry.add_listener(Arc::new(LoggingEventListener));
        registry.add_listener(index.clone());

        let coordinator = RebalanceCoordinator::new(
            registry.clone(),
            index.clone(),
            barrier.clone(),
            config.replication_factor,
            config.timeout,
        );
        registry.add_listener(coordinator.clone());

        let dispatcher = ControllerDispatcher::new(
            registry.clone(),
            index.clone(),
            coordinator.clone(),
            config.replication_factor,
        );

        let shutdown = CancellationToken::new();
        let server = NetworkServer::bind(
            SocketAddr::from((Ipv4Addr::UNSPECIFIED, config.port)),
            Arc::new(dispatcher),
            barrier.subscribe(),
            shutdown.clone(),
        )
        .await?;
        let local_addr = server.local_addr()?;

        tokio::spawn(async move {
            if let Err(e) = server.run().await {
                error!(error = %e, "Controller server error");
            }
        });

        tokio::spawn(
            coordinator
                .clone()
                .run_periodic(config.rebalance_period, shutdown.clone()),
        );

        Ok(Self {
            registry,
            index,
            coordinator,
            local_addr,
            shutdown,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn registry(&self) -> &Arc<StoreRegistry> {
        &self.registry
    }

    pub fn index(&self) -> &Arc<FileIndex> {
        &self.index
    }

    pub fn coordinator(&self) -> &Arc<RebalanceCoordinator> {
        &self.coordinator
    }

    /// Resolves once [`Controller::shutdown`] was called.
    pub async fn run(&self) {
        self.shutdown.cancelled().await
    }

    /// Stop accepting connections and stop the periodic rebalance.
    pub fn shutdown(&self) {
        info!(addr = %self.local_addr, "Shutting down controller");
        self.shutdown.cancel();
    }
}
