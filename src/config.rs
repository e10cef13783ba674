//! Configuration types for the controller and storage nodes.

use crate::error::{Error, Result};
use crate::types::StorePort;
use std::path::PathBuf;
use std::time::Duration;

/// Configuration of the coordinating controller.
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Port to listen on for clients and storage nodes.
    pub port: u16,

    /// Number of storage nodes every file is replicated to.
    pub replication_factor: usize,

    /// Upper bound for every protocol wait (acks, listings, completions).
    pub timeout: Duration,

    /// Interval between periodic rebalances. The first run happens after one period.
    pub rebalance_period: Duration,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            port: 0,
            replication_factor: 3,
            timeout: Duration::from_millis(1000),
            rebalance_period: Duration::from_secs(30),
        }
    }
}

impl ControllerConfig {
    /// Create a configuration listening on `port` with replication factor `replication_factor`.
    pub fn new(port: u16, replication_factor: usize) -> Self {
        Self {
            port,
            replication_factor,
            ..Default::default()
        }
    }

    /// Set the protocol timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set the rebalance period.
    pub fn with_rebalance_period(mut self, period: Duration) -> Self {
        self.rebalance_period = period;
        self
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.replication_factor == 0 {
            return Err(Error::Config(
                "replication factor must be at least 1".to_string(),
            ));
        }
        if self.timeout.is_zero() {
            return Err(Error::Config("timeout must be positive".to_string()));
        }
        if self.rebalance_period.is_zero() {
            return Err(Error::Config(
                "rebalance period must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Configuration of a storage node.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Port to listen on for clients and peers. Also the node's identity.
    pub port: StorePort,

    /// Port of the controller on the loopback interface.
    pub controller_port: u16,

    /// Upper bound for waits on acks and raw bytes.
    pub timeout: Duration,

    /// Directory holding this node's files. Cleared at startup.
    pub storage_dir: PathBuf,
}

impl StoreConfig {
    /// Create a configuration for a node on `port` reporting to `controller_port`.
    pub fn new(port: StorePort, controller_port: u16, storage_dir: impl Into<PathBuf>) -> Self {
        Self {
            port,
            controller_port,
            timeout: Duration::from_millis(1000),
            storage_dir: storage_dir.into(),
        }
    }

    /// Set the protocol timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.port == 0 {
            return Err(Error::Config(
                "storage node needs a fixed port, it is the node's identity".to_string(),
            ));
        }
        if self.port == self.controller_port {
            return Err(Error::Config(
                "storage node port equals controller port".to_string(),
            ));
        }
        if self.timeout.is_zero() {
            return Err(Error::Config("timeout must be positive".to_string()));
        }
        Ok(())
    }
}
