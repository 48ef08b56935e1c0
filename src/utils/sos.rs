//! Signal-of-Stop: cooperative cancellation primitive.
//!
//! A thread-safe, async-aware cancellation token that can be cloned and
//! shared across tasks, awaited for cancellation, and used in select!
//! patterns to abandon futures.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

/// A cooperative cancellation token.
///
/// Clones share the same underlying state, so cancelling any clone
/// notifies all waiters.
#[derive(Debug, Default, Clone)]
pub struct SignalOfStop {
    internal: Arc<SharedState>,
}

#[derive(Debug, Default)]
struct SharedState {
    closing: AtomicBool,
    notify: Notify,
}

impl SignalOfStop {
    /// Create a new, uncancelled signal.
    pub fn new() -> Self {
        Self::default()
    }

    /// Signal cancellation to all waiters.
    ///
    /// After this call, `cancelled()` returns `true` and all pending
    /// `wait()` futures complete.
    pub fn cancel(&self) {
        self.internal.closing.store(true, Ordering::Release);
        self.internal.notify.notify_waiters();
    }

    /// Check if cancellation has been signaled.
    pub fn cancelled(&self) -> bool {
        self.internal.closing.load(Ordering::Acquire)
    }

    /// Wait for cancellation to be signaled.
    ///
    /// Returns immediately if already cancelled.
    pub async fn wait(&self) {
        loop {
            if self.cancelled() {
                return;
            }
            let notified = self.internal.notify.notified();
            if self.cancelled() {
                return;
            }
            notified.await;
        }
    }

    /// Race a future against cancellation.
    ///
    /// Returns `Ok(T)` if the future completes first, `Err(())` if
    /// cancellation is signaled first.
    pub async fn select<F, T>(&self, fut: F) -> Result<T, ()>
    where
        F: Future<Output = T>,
    {
        tokio::select! {
            res = fut => Ok(res),
            _ = self.wait() => Err(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn cancel_releases_all_waiters() {
        let sos = SignalOfStop::new();
        assert!(!sos.cancelled());

        let waiter = sos.clone();
        let handle = tokio::spawn(async move { waiter.wait().await });
        sos.cancel();
        handle.await.unwrap();
        assert!(sos.cancelled());
    }

    #[tokio::test]
    async fn select_prefers_completed_future() {
        let sos = SignalOfStop::new();
        assert_eq!(sos.select(async { 7 }).await, Ok(7));

        sos.cancel();
        let res = sos.select(std::future::pending::<()>()).await;
        assert_eq!(res, Err(()));
    }
}
