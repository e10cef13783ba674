//! The controller role: pool membership, the file index and rebalancing.

pub mod dispatcher;
pub mod node;

pub use dispatcher::{error_reply, ControllerDispatcher};
pub use node::Controller;
