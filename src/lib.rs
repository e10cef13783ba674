//! Replicated file storage over a pool of storage nodes.
//!
//! A single controller keeps the catalog of files and decides where their
//! replicas live. Storage nodes hold the bytes. Clients ask the controller
//! where to upload or download a file and then talk to the storage nodes
//! directly:
//!
//! - **Store**: the controller allocates `R` nodes, the client uploads to each,
//!   every node reports `STORE_ACK`, the client gets `STORE_COMPLETE`
//! - **Load**: the controller hands out one replica at a time; `RELOAD` moves
//!   on to the next replica
//! - **Remove**: the controller asks every holder to delete, then notifies the
//!   client
//! - **Rebalance**: on a timer and whenever a node joins, the controller
//!   refreshes its view from the nodes' listings and spreads replicas evenly
//!
//! # Example
//!
//! ```rust,no_run
//! use replistore::{Controller, ControllerConfig, StoreConfig, StoreNode};
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let controller = Controller::start(
//!         ControllerConfig::new(4000, 2).with_rebalance_period(Duration::from_secs(30)),
//!     )
//!     .await?;
//!
//!     let a = StoreNode::start(StoreConfig::new(4001, 4000, "/tmp/store-a")).await?;
//!     let b = StoreNode::start(StoreConfig::new(4002, 4000, "/tmp/store-b")).await?;
//!
//!     controller.run().await;
//!     # let _ = (a, b);
//!     Ok(())
//! }
//! ```
//!
//! # Architecture
//!
//! ```text
//!                   ┌─────────────────────────────────────────────┐
//!   client ────────▶│                 Controller                  │
//!     │             │  ┌──────────┐  ┌───────────┐  ┌───────────┐ │
//!     │             │  │ Registry │  │ FileIndex │  │ Rebalance │ │
//!     │             │  │  (pool)  │  │ + Barrier │  │Coordinator│ │
//!     │             │  └──────────┘  └───────────┘  └───────────┘ │
//!     │             └──────────────────────┬──────────────────────┘
//!     │                     JOIN / ACKs ▲  │ REMOVE / LIST / REBALANCE
//!     │                                 │  ▼
//!     │             ┌────────────┐  ┌────────────┐  ┌────────────┐
//!     └────────────▶│ StoreNode  │◀▶│ StoreNode  │◀▶│ StoreNode  │
//!   STORE/LOAD_DATA │  FileStore │  │  FileStore │  │  FileStore │
//!                   └────────────┘  └────────────┘  └────────────┘
//!                          REBALANCE_STORE between nodes
//! ```
//!
//! Every connection, whatever its role, runs on the same line-oriented
//! protocol engine in [`network`]; roles differ only in their dispatcher.

pub mod cli;
pub mod cluster;
pub mod config;
pub mod controller;
pub mod dstore;
pub mod error;
pub mod index;
pub mod network;
pub mod rebalancing;
pub mod types;

#[cfg(test)]
pub(crate) mod testing;

pub use config::{ControllerConfig, StoreConfig};
pub use controller::Controller;
pub use dstore::StoreNode;
pub use error::{Error, Result};
pub use types::{ConnectionId, StorePort};
