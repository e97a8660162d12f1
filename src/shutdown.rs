//! Cooperative shutdown signal shared by the engine, strategies and brokers.

use std::sync::Arc;

use tokio::sync::watch;

/// A cloneable, one-way cancellation signal.
///
/// Every blocking operation in the crate observes a `Shutdown`: the engine
/// derives a group-scoped signal from the caller's one, and hands clones to
/// the strategy, the broker background task and every watcher it spawns.
/// Cancelling any clone wakes every waiter on every clone; the signal cannot
/// be reset.
#[derive(Debug, Clone)]
pub struct Shutdown {
    cancelled: Arc<watch::Sender<bool>>,
}

impl Shutdown {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self {
            cancelled: Arc::new(tx),
        }
    }

    /// Cancels the signal. Idempotent.
    pub fn cancel(&self) {
        self.cancelled.send_replace(true);
    }

    /// Non-blocking probe.
    pub fn is_cancelled(&self) -> bool {
        *self.cancelled.borrow()
    }

    /// Resolves once the signal is cancelled, immediately if it already is.
    pub async fn cancelled(&self) {
        let mut rx = self.cancelled.subscribe();
        let _ = rx.wait_for(|cancelled| *cancelled).await;
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn starts_uncancelled() {
        let shutdown = Shutdown::new();
        assert!(!shutdown.is_cancelled());
    }

    #[tokio::test]
    async fn cancel_is_idempotent_and_visible_through_clones() {
        let shutdown = Shutdown::new();
        let clone = shutdown.clone();

        shutdown.cancel();
        shutdown.cancel();

        assert!(shutdown.is_cancelled());
        assert!(clone.is_cancelled());
    }

    #[tokio::test]
    async fn cancelled_resolves_for_waiters_and_late_subscribers() {
        let shutdown = Shutdown::new();

        let waiter = {
            let shutdown = shutdown.clone();
            tokio::spawn(async move { shutdown.cancelled().await })
        };
        shutdown.cancel();
        waiter.await.unwrap();

        // already-cancelled signal resolves immediately
        shutdown.cancelled().await;
    }
}
