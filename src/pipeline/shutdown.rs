//! Process-wide shutdown signal.

use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};
use tracing::info;

/// Shutdown signal shared by every long-running task.
///
/// Triggering only cancels the token and wakes waiters, so it is safe to call
/// from a signal listener, and any number of times.
#[derive(Debug, Clone, Default)]
pub struct Shutdown {
    token: CancellationToken,
}

impl Shutdown {
    /// Create an untriggered signal.
    pub fn new() -> Self {
        Self::default()
    }

    /// Request shutdown. Returns `true` only for the first call.
    pub fn trigger(&self) -> bool {
        let first = !self.token.is_cancelled();
        self.token.cancel();
        if first {
            info!("Shutdown requested");
        }
        first
    }

    /// Whether shutdown has been requested.
    pub fn is_triggered(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolves once shutdown is requested, at once if it already was.
    pub fn cancelled(&self) -> WaitForCancellationFuture<'_> {
        self.token.cancelled()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::time::timeout;

    #[test]
    fn test_trigger_is_idempotent() {
        let shutdown = Shutdown::new();

        assert!(!shutdown.is_triggered());
        assert!(shutdown.trigger());
        assert!(!shutdown.trigger());
        assert!(shutdown.is_triggered());
    }

    #[tokio::test]
    async fn test_cancelled_after_trigger_returns() {
        let shutdown = Shutdown::new();
        shutdown.trigger();

        timeout(Duration::from_millis(100), shutdown.cancelled())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_trigger_wakes_all_waiters() {
        let shutdown = Arc::new(Shutdown::new());

        let waiters: Vec<_> = (0..4)
            .map(|_| {
                let shutdown = Arc::clone(&shutdown);
                tokio::spawn(async move { shutdown.cancelled().await })
            })
            .collect();
        tokio::time::sleep(Duration::from_millis(20)).await;

        shutdown.trigger();

        for waiter in waiters {
            timeout(Duration::from_secs(1), waiter)
                .await
                .unwrap()
                .unwrap();
        }
    }

    #[tokio::test]
    async fn test_cancelled_blocks_until_triggered() {
        let shutdown = Shutdown::new();

        let result = timeout(Duration::from_millis(30), shutdown.cancelled()).await;

        assert!(result.is_err());
    }
}
