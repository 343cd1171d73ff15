//! Single-slot wake primitive.
//!
//! `set` stores one pending wake, `wait` suspends until a wake is pending and
//! consumes it, `reset` discards it. Setting twice before a wait still yields
//! exactly one wake.

use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::Notify;

/// One-shot completion hand-off between tasks.
#[derive(Debug, Default)]
pub struct Signal {
    pending: AtomicBool,
    notify: Notify,
}

impl Signal {
    /// Create a signal with no pending wake.
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a pending wake and wake one waiter.
    pub fn set(&self) {
        self.pending.store(true, Ordering::SeqCst);
        self.notify.notify_one();
    }

    /// Wait until a wake is pending, then consume it.
    pub async fn wait(&self) {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.pending.swap(false, Ordering::SeqCst) {
                return;
            }
            notified.await;
        }
    }

    /// Consume a pending wake without waiting. Returns whether one was pending.
    pub fn try_take(&self) -> bool {
        self.pending.swap(false, Ordering::SeqCst)
    }

    /// Discard any pending wake.
    pub fn reset(&self) {
        self.pending.store(false, Ordering::SeqCst);
    }

    /// Whether a wake is pending.
    pub fn is_set(&self) -> bool {
        self.pending.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_set_before_wait_is_not_lost() {
        let signal = Signal::new();
        signal.set();
        signal.wait().await;
        assert!(!signal.is_set());
    }

    #[tokio::test]
    async fn test_double_set_is_single_wake() {
        let signal = Signal::new();
        signal.set();
        signal.set();
        signal.wait().await;
        assert!(!signal.try_take());
    }

    #[tokio::test]
    async fn test_reset_clears_pending() {
        let signal = Signal::new();
        signal.set();
        signal.reset();

        let waited = tokio::time::timeout(Duration::from_millis(50), signal.wait()).await;
        assert!(waited.is_err());
    }

    #[tokio::test]
    async fn test_wakes_waiting_task() {
        let signal = Arc::new(Signal::new());
        let waiter = {
            let signal = Arc::clone(&signal);
            tokio::spawn(async move { signal.wait().await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        signal.set();

        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should wake")
            .unwrap();
        assert!(!signal.is_set());
    }
}
