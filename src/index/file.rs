//! Indexed file records and their lifecycle states.

use crate::types::StorePort;
use std::fmt;
use std::time::Instant;

/// Lifecycle of a file in the index.
///
/// ```text
/// StoreInProgress ──▶ Available ──▶ RemoveInProgress ──▶ Gone
///        │                ▲                │
///        │                └────────────────┘ (remove timed out)
///        └──────────────────────────────────────────────▶ Gone (store timed out)
/// ```
///
/// Any state moves to `Gone` once the replica set becomes empty.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileState {
    StoreInProgress,
    Available,
    RemoveInProgress,
    Gone,
}

impl fmt::Display for FileState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FileState::StoreInProgress => "store in progress",
            FileState::Available => "available",
            FileState::RemoveInProgress => "remove in progress",
            FileState::Gone => "gone",
        };
        f.write_str(s)
    }
}

/// A file known to the controller.
#[derive(Debug, Clone)]
pub struct IndexedFile {
    /// Unique per file incarnation. A name can be reused once the earlier file
    /// is gone; the generation tells the two apart.
    pub generation: u64,

    /// Name as given by the client that stored it.
    pub name: String,

    /// Size in bytes.
    pub size: u64,

    /// Ports of the storage nodes holding a replica, without duplicates.
    pub replicas: Vec<StorePort>,

    pub state: FileState,

    pub created_at: Instant,
}

impl IndexedFile {
    pub fn new(generation: u64, name: impl Into<String>, size: u64, replicas: Vec<StorePort>) -> Self {
        let mut file = Self {
            generation,
            name: name.into(),
            size,
            replicas: Vec::with_capacity(replicas.len()),
            state: FileState::StoreInProgress,
            created_at: Instant::now(),
        };
        for port in replicas {
            file.add_replica(port);
        }
        file
    }

    pub fn is_available(&self) -> bool {
        self.state == FileState::Available
    }

    pub fn has_replica(&self, port: StorePort) -> bool {
        self.replicas.contains(&port)
    }

    /// Add a replica. Returns `false` if it was already present.
    pub fn add_replica(&mut self, port: StorePort) -> bool {
        if self.has_replica(port) {
            return false;
        }
        self.replicas.push(port);
        true
    }

    /// Remove a replica. The file becomes `Gone` when its last replica is removed.
    /// Returns `false` if the port was not a replica.
    pub fn remove_replica(&mut self, port: StorePort) -> bool {
        let before = self.replicas.len();
        self.replicas.retain(|p| *p != port);
        if self.replicas.len() == before {
            return false;
        }
        if self.replicas.is_empty() {
            self.state = FileState::Gone;
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_file_dedups_replicas() {
        let file = IndexedFile::new(1, "a.txt", 10, vec![4001, 4002, 4001]);
        assert_eq!(file.replicas, vec![4001, 4002]);
        assert_eq!(file.state, FileState::StoreInProgress);
    }

    #[test]
    fn test_losing_last_replica_makes_file_gone() {
        let mut file = IndexedFile::new(1, "a.txt", 10, vec![4001, 4002]);
        file.state = FileState::Available;

        assert!(file.remove_replica(4001));
        assert!(!file.remove_replica(4001));
        assert_eq!(file.state, FileState::Available);

        assert!(file.remove_replica(4002));
        assert_eq!(file.state, FileState::Gone);
    }
}
