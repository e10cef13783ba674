//! Countdown counter with a bounded async wait.

use std::time::Duration;
use tokio::sync::watch;

/// Counts down from a fixed number; waiters resume once it reaches zero.
#[derive(Debug)]
pub struct CountdownLatch {
    count: watch::Sender<usize>,
}

impl CountdownLatch {
    pub fn new(count: usize) -> Self {
        Self {
            count: watch::Sender::new(count),
        }
    }

    /// Decrement the counter. Saturates at zero.
    pub fn count_down(&self) {
        self.count.send_modify(|c| *c = c.saturating_sub(1));
    }

    pub fn count(&self) -> usize {
        *self.count.borrow()
    }

    /// Wait until the counter reaches zero. Returns `false` if `timeout` expired first.
    pub async fn wait(&self, timeout: Duration) -> bool {
        let mut rx = self.count.subscribe();
        let reached = matches!(
            tokio::time::timeout(timeout, rx.wait_for(|c| *c == 0)).await,
            Ok(Ok(_))
        );
        reached
    }
}
