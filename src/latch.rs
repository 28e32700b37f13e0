//! One-shot completion gate used to sequence senders behind authentication.

use std::time::Duration;
use tokio::sync::watch;

/// Single-shot gate: starts closed, opens exactly once, stays open.
///
/// Waiters either observe the gate opening within their timeout or give up.
/// Opening an already open gate is a no-op.
#[derive(Debug)]
pub struct Latch {
    tx: watch::Sender<bool>,
}

impl Latch {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx }
    }

    /// Open the gate, releasing all current and future waiters.
    pub fn count_down(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_complete(&self) -> bool {
        *self.tx.borrow()
    }

    /// Wait until the gate opens. Returns `false` on timeout.
    pub async fn wait(&self, timeout: Duration) -> bool {
        let mut rx = self.tx.subscribe();
        tokio::time::timeout(timeout, rx.wait_for(|open| *open))
            .await
            .map(|result| result.is_ok())
            .unwrap_or(false)
    }
}

impl Default for Latch {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_wait_times_out_when_not_counted_down() {
        let latch = Latch::new();
        assert!(!latch.is_complete());
        assert!(!latch.wait(Duration::from_millis(20)).await);
    }

    #[tokio::test]
    async fn test_count_down_releases_waiter() {
        let latch = Arc::new(Latch::new());
        let waiter = {
            let latch = latch.clone();
            tokio::spawn(async move { latch.wait(Duration::from_secs(1)).await })
        };
        latch.count_down();
        assert!(waiter.await.unwrap());
        assert!(latch.is_complete());
    }

    #[tokio::test]
    async fn test_wait_after_completion_returns_immediately() {
        let latch = Latch::new();
        latch.count_down();
        latch.count_down();
        assert!(latch.wait(Duration::from_millis(1)).await);
    }
}
