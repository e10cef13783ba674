//! The controller's file index.
//!
//! The index owns every [`IndexedFile`] that is not gone, the store and
//! remove counters of in-flight operations, and the waiter tasks that turn a
//! counter reaching zero (or the timeout expiring) into a state transition and
//! a client notification. Gone files are pruned, so a name is free for reuse
//! as soon as its previous file is gone.

use crate::cluster::{OperationBarrier, OperationPermit, StoreEvent, StoreEventListener, StoreRegistry};
use crate::error::FileOperationError;
use crate::index::file::{FileState, IndexedFile};
use crate::index::latch::CountdownLatch;
use crate::network::{Connection, Message};
use crate::types::{name_key, StorePort};
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

struct Entry {
    file: IndexedFile,
    /// Counter of the in-flight store or remove, if any.
    latch: Option<Arc<CountdownLatch>>,
}

/// Catalog of files and their replicas.
pub struct FileIndex {
    files: RwLock<HashMap<String, Entry>>,
    registry: Arc<StoreRegistry>,
    barrier: Arc<OperationBarrier>,
    replication_factor: usize,
    timeout: Duration,
    next_generation: AtomicU64,
}

impl std::fmt::Debug for FileIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileIndex")
            .field("files", &self.files.read().len())
            .field("replication_factor", &self.replication_factor)
            .finish()
    }
}

impl FileIndex {
    pub fn new(
        registry: Arc<StoreRegistry>,
        barrier: Arc<OperationBarrier>,
        replication_factor: usize,
        timeout: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            files: RwLock::new(HashMap::new()),
            registry,
            barrier,
            replication_factor,
            timeout,
            next_generation: AtomicU64::new(1),
        })
    }

    /// Start storing a new file and return the ports the client must upload to.
    ///
    /// The file stays `StoreInProgress` until every allocated node sent
    /// `STORE_ACK`, at which point it becomes `Available` and the requester
    /// receives `STORE_COMPLETE`. If the timeout expires first the file is
    /// dropped and the requester hears nothing.
    pub async fn add_file(
        self: &Arc<Self>,
        name: &str,
        size: u64,
        requester: Arc<Connection>,
    ) -> Result<Vec<StorePort>, FileOperationError> {
        let permit = self.barrier.begin_store().await;
        let key = name_key(name);

        let (generation, ports, latch) = {
            let mut files = self.files.write();
            if files.contains_key(&key) {
                return Err(FileOperationError::AlreadyExists);
            }

            let ports = self.registry.allocate(self.replication_factor);
            if ports.is_empty() {
                return Err(FileOperationError::NotEnoughStores);
            }

            let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
            let file = IndexedFile::new(generation, name, size, ports.clone());
            let latch = Arc::new(CountdownLatch::new(file.replicas.len()));
            files.insert(
                key.clone(),
                Entry {
                    file,
                    latch: Some(latch.clone()),
                },
            );
            (generation, ports, latch)
        };

        info!(file = name, size, ?ports, "Adding file");
        tokio::spawn(self.clone().await_store(key, generation, latch, requester, permit));
        Ok(ports)
    }

    async fn await_store(
        self: Arc<Self>,
        key: String,
        generation: u64,
        latch: Arc<CountdownLatch>,
        requester: Arc<Connection>,
        _permit: OperationPermit,
    ) {
        let success = latch.wait(self.timeout).await;

        let name = {
            let mut files = self.files.write();
            let Some(entry) = files.get_mut(&key).filter(|e| e.file.generation == generation)
            else {
                warn!(file = %key, "File vanished while its store was in progress");
                return;
            };
            if !success {
                error!(file = %entry.file.name, "Store operation timed out");
                files.remove(&key);
                return;
            }
            entry.file.state = FileState::Available;
            entry.latch = None;
            entry.file.name.clone()
        };

        info!(file = %name, "Store complete");
        if let Err(e) = requester.send(&Message::StoreComplete).await {
            warn!(file = %name, error = %e, "Failed to notify client of store completion");
        }
    }

    /// Count one `STORE_ACK` for `name`.
    pub fn acknowledge_store(&self, name: &str) {
        let files = self.files.read();
        match files.get(&name_key(name)) {
            Some(Entry {
                file,
                latch: Some(latch),
            }) if file.state == FileState::StoreInProgress => {
                latch.count_down();
                debug!(file = name, remaining = latch.count(), "Store acknowledged");
            }
            Some(entry) => {
                warn!(file = name, state = %entry.file.state, "Store acknowledgement for a file not being stored, ignoring");
            }
            None => error!(file = name, "Store acknowledgement for unknown file, ignoring"),
        }
    }

    /// Start removing an available file from every node holding it.
    ///
    /// Completion is asynchronous: once every replica acknowledged, the file is
    /// gone and the requester receives `REMOVE_COMPLETE`. On timeout the file
    /// returns to `Available` with whatever replicas did not acknowledge.
    pub async fn remove_file(
        self: &Arc<Self>,
        name: &str,
        requester: Arc<Connection>,
    ) -> Result<(), FileOperationError> {
        let permit = self.barrier.begin_remove().await;
        let key = name_key(name);

        let (generation, file_name, targets, latch) = {
            let mut files = self.files.write();
            let entry = files.get_mut(&key).ok_or(FileOperationError::NotExists)?;
            match entry.file.state {
                FileState::RemoveInProgress => return Err(FileOperationError::AlreadyRemoving),
                FileState::Available => {}
                _ => return Err(FileOperationError::NotExists),
            }

            entry.file.state = FileState::RemoveInProgress;
            let latch = Arc::new(CountdownLatch::new(entry.file.replicas.len()));
            entry.latch = Some(latch.clone());
            (
                entry.file.generation,
                entry.file.name.clone(),
                entry.file.replicas.clone(),
                latch,
            )
        };

        info!(file = %file_name, replicas = ?targets, "Removing file");
        let index = self.clone();
        tokio::spawn(async move {
            let _permit = permit;
            let request = Message::Remove {
                name: file_name.clone(),
            };
            for port in targets {
                match index.registry.get(port) {
                    Some(node) => {
                        if let Err(e) = node.connection.send(&request).await {
                            warn!(file = %file_name, port, error = %e, "Failed to send remove request");
                        }
                    }
                    None => warn!(file = %file_name, port, "Replica holder is no longer connected"),
                }
            }
            index
                .await_remove(key, generation, file_name, latch, requester)
                .await;
        });
        Ok(())
    }

    async fn await_remove(
        &self,
        key: String,
        generation: u64,
        name: String,
        latch: Arc<CountdownLatch>,
        requester: Arc<Connection>,
    ) {
        let success = latch.wait(self.timeout).await;

        {
            let mut files = self.files.write();
            let current = files
                .get(&key)
                .is_some_and(|e| e.file.generation == generation);
            if success {
                if current {
                    files.remove(&key);
                }
            } else {
                match files.get_mut(&key).filter(|_| current) {
                    Some(entry) => {
                        error!(file = %name, "Remove operation timed out");
                        if entry.file.state == FileState::RemoveInProgress {
                            entry.file.state = FileState::Available;
                        }
                        entry.latch = None;
                    }
                    None => {
                        warn!(file = %name, "Remove timed out but every replica is already gone");
                    }
                }
                return;
            }
        }

        info!(file = %name, "Remove complete");
        if let Err(e) = requester.send(&Message::RemoveComplete).await {
            warn!(file = %name, error = %e, "Failed to notify client of remove completion");
        }
    }

    /// Apply a `REMOVE_ACK` from the node on `port`.
    pub fn acknowledge_remove(&self, name: &str, port: StorePort) {
        if !self.registry.contains(port) {
            warn!(file = name, port, "Remove acknowledgement from unknown node, ignoring");
            return;
        }

        let key = name_key(name);
        let mut files = self.files.write();
        let Some(entry) = files.get_mut(&key) else {
            error!(file = name, port, "Remove acknowledgement for unknown file, ignoring");
            return;
        };
        if !entry.file.remove_replica(port) {
            warn!(file = name, port, "Remove acknowledgement from a node not holding the file, ignoring");
            return;
        }
        if let Some(latch) = &entry.latch {
            latch.count_down();
        }
        debug!(file = name, port, "Remove acknowledged");

        if entry.file.state == FileState::Gone {
            files.remove(&key);
        }
    }

    /// Drop `port` from every replica set. Files left without replicas are gone.
    pub fn remove_node(&self, port: StorePort) {
        let mut files = self.files.write();
        let mut lost = Vec::new();
        for (key, entry) in files.iter_mut() {
            if entry.file.remove_replica(port) && entry.file.state == FileState::Gone {
                lost.push(key.clone());
            }
        }
        for key in lost {
            if let Some(entry) = files.remove(&key) {
                warn!(file = %entry.file.name, "File lost, no node holds a replica");
            }
        }
        debug!(port, "Removed node from all replica sets");
    }

    /// Remove `port` from every available file it is believed to hold but did
    /// not report. `reported` holds name keys.
    pub fn reconcile(&self, port: StorePort, reported: &HashSet<String>) {
        let mut files = self.files.write();
        let mut lost = Vec::new();
        let mut indexed = 0usize;
        for (key, entry) in files.iter_mut() {
            if !entry.file.is_available() || !entry.file.has_replica(port) {
                continue;
            }
            indexed += 1;
            if !reported.contains(key) {
                info!(file = %entry.file.name, port, "Node does not hold a file the index attributes to it");
                entry.file.remove_replica(port);
                if entry.file.state == FileState::Gone {
                    lost.push(key.clone());
                }
            }
        }
        for key in lost {
            files.remove(&key);
        }
        info!(port, reported = reported.len(), indexed, "Reconciled node listing");
    }

    /// Record that `port` now holds a replica of `name`.
    pub fn add_replica(&self, name: &str, port: StorePort) -> bool {
        let mut files = self.files.write();
        match files.get_mut(&name_key(name)) {
            Some(entry) => entry.file.add_replica(port),
            None => {
                warn!(file = name, port, "Cannot add replica of unknown file");
                false
            }
        }
    }

    /// Record that `port` no longer holds a replica of `name`.
    pub fn remove_replica(&self, name: &str, port: StorePort) -> bool {
        let key = name_key(name);
        let mut files = self.files.write();
        let Some(entry) = files.get_mut(&key) else {
            return false;
        };
        let removed = entry.file.remove_replica(port);
        if entry.file.state == FileState::Gone {
            warn!(file = name, "File lost its last replica");
            files.remove(&key);
        }
        removed
    }

    /// An available file by name.
    pub fn get_available(&self, name: &str) -> Option<IndexedFile> {
        self.files
            .read()
            .get(&name_key(name))
            .filter(|e| e.file.is_available())
            .map(|e| e.file.clone())
    }

    /// Any live file by name, whatever its state.
    pub fn get(&self, name: &str) -> Option<IndexedFile> {
        self.files.read().get(&name_key(name)).map(|e| e.file.clone())
    }

    /// Snapshot of every available file, ordered by name.
    pub fn available_files(&self) -> Vec<IndexedFile> {
        let mut files: Vec<IndexedFile> = self
            .files
            .read()
            .values()
            .filter(|e| e.file.is_available())
            .map(|e| e.file.clone())
            .collect();
        files.sort_by(|a, b| a.name.cmp(&b.name));
        files
    }

    /// Names of every available file, ordered.
    pub fn available_names(&self) -> Vec<String> {
        self.available_files().into_iter().map(|f| f.name).collect()
    }

    /// Number of live files, whatever their state.
    pub fn len(&self) -> usize {
        self.files.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.read().is_empty()
    }

    pub fn replication_factor(&self) -> usize {
        self.replication_factor
    }
}

impl StoreEventListener for FileIndex {
    fn on_event(&self, event: StoreEvent) {
        if let StoreEvent::Left { port } = event {
            self.remove_node(port);
        }
    }
}
