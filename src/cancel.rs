//! Cooperative cancellation for batch runs.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Cloneable cancellation flag.
///
/// Once cancelled it stays cancelled. Workers check it before dequeuing the next
/// collection; fetches already in flight are left to finish or time out on their own.
#[derive(Debug, Clone)]
pub struct CancelSignal {
    tx: Arc<watch::Sender<bool>>,
    rx: watch::Receiver<bool>,
}

impl Default for CancelSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelSignal {
    /// Create an untriggered signal.
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self { tx: Arc::new(tx), rx }
    }

    /// Trigger cancellation.
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    /// Whether cancellation was triggered.
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Whether `other` is a clone of this signal.
    pub fn same_as(&self, other: &CancelSignal) -> bool {
        Arc::ptr_eq(&self.tx, &other.tx)
    }

    /// Resolve once cancellation is triggered.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        // The sender lives as long as any clone of the signal, including `self`.
        let _ = rx.wait_for(|cancelled| *cancelled).await;
    }

    /// Trigger cancellation after `timeout`. Abort the handle to disarm.
    pub fn cancel_after(&self, timeout: Duration) -> JoinHandle<()> {
        let signal = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            tracing::info!(timeout_ms = timeout.as_millis() as u64, "batch timeout reached, cancelling");
            signal.cancel();
        })
    }
}
