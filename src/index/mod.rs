//! File index: catalog, replica tracking and load cursors.

pub mod file;
pub mod latch;
pub mod load;
pub mod service;

pub use file::{FileState, IndexedFile};
pub use latch::CountdownLatch;
pub use load::{LoadOperation, LoadTracker};
pub use service::FileIndex;
