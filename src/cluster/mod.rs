//! Storage pool membership and operation coordination.

pub mod barrier;
pub mod events;
pub mod registry;

pub use barrier::{OperationBarrier, OperationKind, OperationPermit, RebalanceGuard};
pub use events::{LoggingEventListener, StoreEvent, StoreEventListener};
pub use registry::{StorageNode, StoreRegistry};
