//! Single-slot acknowledgement tracking for one connection.

use parking_lot::Mutex;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, warn};

/// Tracks at most one outstanding wait for an `ACK` message.
///
/// The wait must be registered before the message that elicits the `ACK` is
/// sent, otherwise a fast peer can acknowledge before anyone is listening and
/// the acknowledgement is discarded.
#[derive(Debug, Default)]
pub struct AckTracker {
    slot: Mutex<Option<oneshot::Sender<()>>>,
}

/// A registered wait for an acknowledgement.
#[derive(Debug)]
pub struct AckWait {
    rx: oneshot::Receiver<()>,
}

impl AckTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new wait, replacing any unclaimed one.
    pub fn wait(&self) -> AckWait {
        let (tx, rx) = oneshot::channel();
        let mut slot = self.slot.lock();
        if slot.as_ref().is_some_and(|old| !old.is_closed()) {
            warn!("Overwriting an acknowledgement wait that was never completed");
        }
        *slot = Some(tx);
        AckWait { rx }
    }

    /// Complete the pending wait, if any.
    pub fn ack_received(&self) {
        match self.slot.lock().take() {
            Some(tx) => {
                if tx.send(()).is_err() {
                    debug!("Acknowledgement arrived after its waiter gave up");
                }
            }
            None => warn!("Received ACK but no acknowledgement was pending"),
        }
    }

    /// Whether a wait is registered and not yet completed.
    pub fn is_pending(&self) -> bool {
        self.slot.lock().as_ref().is_some_and(|tx| !tx.is_closed())
    }
}

impl AckWait {
    /// Wait up to `timeout` for the acknowledgement. Returns `false` on timeout.
    pub async fn received_within(self, timeout: Duration) -> bool {
        matches!(tokio::time::timeout(timeout, self.rx).await, Ok(Ok(())))
    }
}
