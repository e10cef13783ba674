//! Per-client load retry cursors.

use crate::index::file::IndexedFile;
use crate::types::{name_key, ConnectionId, StorePort};
use dashmap::DashMap;
use rand::seq::SliceRandom;
use tracing::{debug, warn};

/// An in-progress load: a shuffled snapshot of a file's replicas and a cursor
/// over it.
#[derive(Debug, Clone)]
pub struct LoadOperation {
    name: String,
    size: u64,
    candidates: Vec<StorePort>,
    cursor: usize,
}

impl LoadOperation {
    /// Snapshot and shuffle the replicas of `file`.
    pub fn new(file: &IndexedFile) -> Self {
        let mut candidates = file.replicas.clone();
        candidates.shuffle(&mut rand::rng());
        Self {
            name: file.name.clone(),
            size: file.size,
            candidates,
            cursor: 0,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    /// Next untried replica accepted by `usable`, or `None` once every
    /// candidate was handed out.
    pub fn next(&mut self, usable: impl Fn(StorePort) -> bool) -> Option<StorePort> {
        while let Some(&port) = self.candidates.get(self.cursor) {
            self.cursor += 1;
            if usable(port) {
                debug!(file = %self.name, port, attempt = self.cursor, "Serving load from replica");
                return Some(port);
            }
        }
        warn!(file = %self.name, "Ran out of replicas to serve file from");
        None
    }
}

/// Load operations keyed by the requesting client connection. A client has at
/// most one load at a time; starting a new one supersedes the previous.
#[derive(Debug, Default)]
pub struct LoadTracker {
    ops: DashMap<ConnectionId, LoadOperation>,
}

impl LoadTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a load of `file` for `client` and return the first replica and the file size.
    pub fn start(
        &self,
        client: ConnectionId,
        file: &IndexedFile,
        usable: impl Fn(StorePort) -> bool,
    ) -> Option<(StorePort, u64)> {
        let mut op = LoadOperation::new(file);
        let next = op.next(usable).map(|port| (port, op.size));
        if self.ops.insert(client, op).is_some() {
            debug!(%client, "Replaced previous load operation");
        }
        next
    }

    /// Advance the client's load of `name`. `None` if the client has no load
    /// of that file or every replica was tried.
    pub fn reload(
        &self,
        client: ConnectionId,
        name: &str,
        usable: impl Fn(StorePort) -> bool,
    ) -> Option<(StorePort, u64)> {
        let mut op = self.ops.get_mut(&client)?;
        if name_key(op.name()) != name_key(name) {
            return None;
        }
        let size = op.size();
        op.next(usable).map(|port| (port, size))
    }

    /// Drop the client's load state.
    pub fn forget(&self, client: ConnectionId) {
        self.ops.remove(&client);
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn file(replicas: Vec<StorePort>) -> IndexedFile {
        IndexedFile::new(1, "Movie.mp4", 2048, replicas)
    }

    #[test]
    fn test_cursor_visits_every_replica_once() {
        let tracker = LoadTracker::new();
        let client = ConnectionId::next();
        let f = file(vec![4001, 4002, 4003]);

        let mut seen = HashSet::new();
        let (first, size) = tracker.start(client, &f, |_| true).unwrap();
        assert_eq!(size, 2048);
        seen.insert(first);
        while let Some((port, _)) = tracker.reload(client, "movie.MP4", |_| true) {
            assert!(seen.insert(port), "replica {port} served twice");
        }

        assert_eq!(seen, HashSet::from([4001, 4002, 4003]));
        assert!(tracker.reload(client, "Movie.mp4", |_| true).is_none());
    }

    #[test]
    fn test_reload_needs_matching_operation() {
        let tracker = LoadTracker::new();
        let client = ConnectionId::next();
        assert!(tracker.reload(client, "Movie.mp4", |_| true).is_none());

        tracker.start(client, &file(vec![4001, 4002]), |_| true);
        assert!(tracker.reload(client, "other.mp4", |_| true).is_none());
        assert!(tracker.reload(ConnectionId::next(), "Movie.mp4", |_| true).is_none());
    }

    #[test]
    fn test_new_load_supersedes_old() {
        let tracker = LoadTracker::new();
        let client = ConnectionId::next();
        tracker.start(client, &file(vec![4001]), |_| true);
        assert!(tracker.reload(client, "Movie.mp4", |_| true).is_none());

        tracker.start(client, &file(vec![4002, 4003]), |_| true);
        assert!(tracker.reload(client, "Movie.mp4", |_| true).is_some());
        assert_eq!(tracker.len(), 1);

        tracker.forget(client);
        assert!(tracker.is_empty());
    }

    #[test]
    fn test_unusable_replicas_are_skipped() {
        let tracker = LoadTracker::new();
        let client = ConnectionId::next();
        let (port, _) = tracker
            .start(client, &file(vec![4001, 4002, 4003]), |p| p == 4002)
            .unwrap();
        assert_eq!(port, 4002);
        assert!(tracker.reload(client, "Movie.mp4", |p| p == 4002).is_none());
    }
}
