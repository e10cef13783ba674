//! Test support and multi-node end-to-end tests.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                     TestCluster                          │
//! │   Controller ◀──── loopback TCP ────▶ StoreNode × n       │
//! │        ▲                                  (tempdir each) │
//! │        └──────────── TestClient ─────────────┘           │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! Unit tests drive single components over in-memory pipes from [`utils`];
//! the suites here run real processes' worth of tasks on loopback sockets.

pub(crate) mod utils;
