//! Network communication layer.

pub mod ack;
pub mod connection;
pub mod protocol;
pub mod server;

pub use ack::{AckTracker, AckWait};
pub use connection::{Connection, Dispatcher};
pub use protocol::Message;
pub use server::NetworkServer;
