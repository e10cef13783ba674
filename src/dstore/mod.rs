//! The storage node role.
//!
//! # Architecture
//!
//! ```text
//!   clients / peers ──▶ NetworkServer ──▶ PeerDispatcher ──┐
//!                                                          ├──▶ FileStore
//!   controller ◀────▶ controller link ──▶ ControllerLink ──┘
//!                                         Dispatcher
//!                                              │ REBALANCE
//!                                              ▼
//!                                      RebalanceExecutor ──▶ peers
//! ```

pub mod dispatcher;
pub mod node;
pub mod storage;

pub use dispatcher::{ControllerLinkDispatcher, PeerDispatcher, StoreContext};
pub use node::StoreNode;
pub use storage::{DiskFileStore, FileStore, MemoryFileStore};
