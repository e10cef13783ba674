//! Mutual exclusion between cluster-wide rebalancing and store/remove operations.
//!
//! Stores and removes run concurrently with each other but never with a
//! rebalance. Starting a rebalance raises the queue hold, which pauses every
//! client connection between messages, and then waits for the in-flight
//! stores and removes to drain. The hold is lowered when the rebalance guard
//! is dropped, whatever the outcome of the rebalance.

use crate::error::RebalanceError;
use parking_lot::Mutex;
use std::pin::pin;
use std::sync::Arc;
use tokio::sync::{watch, Notify};
use tracing::{debug, info};

#[derive(Debug, Default)]
struct BarrierState {
    stores: usize,
    removes: usize,
    /// Set from the moment a rebalance is requested until it finishes.
    rebalancing: bool,
}

/// Kind of operation a permit was issued for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationKind {
    Store,
    Remove,
}

/// Tracks in-flight operations and the rebalance flag.
#[derive(Debug)]
pub struct OperationBarrier {
    state: Mutex<BarrierState>,

    /// Notified whenever the in-flight count drops to zero.
    drained: Notify,

    /// Notified when a rebalance finishes.
    released: Notify,

    /// Queue hold broadcast to connection workers.
    hold: watch::Sender<bool>,
}

impl Default for OperationBarrier {
    fn default() -> Self {
        Self {
            state: Mutex::new(BarrierState::default()),
            drained: Notify::new(),
            released: Notify::new(),
            hold: watch::Sender::new(false),
        }
    }
}

impl OperationBarrier {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Receiver of the queue hold signal.
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.hold.subscribe()
    }

    /// Begin a store. Waits while a rebalance is pending or running.
    pub async fn begin_store(self: &Arc<Self>) -> OperationPermit {
        self.begin(OperationKind::Store).await
    }

    /// Begin a remove. Waits while a rebalance is pending or running.
    pub async fn begin_remove(self: &Arc<Self>) -> OperationPermit {
        self.begin(OperationKind::Remove).await
    }

    async fn begin(self: &Arc<Self>, kind: OperationKind) -> OperationPermit {
        loop {
            let mut released = pin!(self.released.notified());
            released.as_mut().enable();
            {
                let mut state = self.state.lock();
                if !state.rebalancing {
                    match kind {
                        OperationKind::Store => state.stores += 1,
                        OperationKind::Remove => state.removes += 1,
                    }
                    return OperationPermit {
                        barrier: self.clone(),
                        kind,
                    };
                }
            }
            debug!(?kind, "Operation waiting for rebalance to finish");
            released.await;
        }
    }

    fn finish(&self, kind: OperationKind) {
        let mut state = self.state.lock();
        match kind {
            OperationKind::Store => state.stores = state.stores.saturating_sub(1),
            OperationKind::Remove => state.removes = state.removes.saturating_sub(1),
        }
        if state.stores == 0 && state.removes == 0 {
            self.drained.notify_waiters();
        }
    }

    /// Start a rebalance.
    ///
    /// Fails immediately if a rebalance is already pending or running.
    /// Otherwise raises the queue hold and waits for every in-flight store and
    /// remove to finish. Dropping the returned guard ends the rebalance.
    pub async fn start_rebalance(self: &Arc<Self>) -> Result<RebalanceGuard, RebalanceError> {
        {
            let mut state = self.state.lock();
            if state.rebalancing {
                return Err(RebalanceError::AlreadyRebalancing);
            }
            state.rebalancing = true;
        }
        self.hold.send_replace(true);

        // The guard exists before draining so a cancelled start still lowers the hold.
        let guard = RebalanceGuard {
            barrier: self.clone(),
        };

        loop {
            let mut drained = pin!(self.drained.notified());
            drained.as_mut().enable();
            {
                let state = self.state.lock();
                if state.stores == 0 && state.removes == 0 {
                    break;
                }
                debug!(
                    stores = state.stores,
                    removes = state.removes,
                    "Waiting for operations to drain before rebalancing"
                );
            }
            drained.await;
        }

        info!("Rebalance started, operations drained");
        Ok(guard)
    }

    fn finish_rebalance(&self) {
        self.state.lock().rebalancing = false;
        self.hold.send_replace(false);
        self.released.notify_waiters();
        info!("Rebalance finished, queue hold released");
    }

    /// Whether a rebalance is pending or running.
    pub fn is_rebalancing(&self) -> bool {
        self.state.lock().rebalancing
    }

    /// In-flight (stores, removes).
    pub fn in_flight(&self) -> (usize, usize) {
        let state = self.state.lock();
        (state.stores, state.removes)
    }
}

/// Proof of an in-flight store or remove. Dropping it finishes the operation.
#[derive(Debug)]
pub struct OperationPermit {
    barrier: Arc<OperationBarrier>,
    kind: OperationKind,
}

impl OperationPermit {
    pub fn kind(&self) -> OperationKind {
        self.kind
    }
}

impl Drop for OperationPermit {
    fn drop(&mut self) {
        self.barrier.finish(self.kind);
    }
}

/// Held for the duration of a rebalance.
#[derive(Debug)]
pub struct RebalanceGuard {
    barrier: Arc<OperationBarrier>,
}

impl Drop for RebalanceGuard {
    fn drop(&mut self) {
        self.barrier.finish_rebalance();
    }
}
