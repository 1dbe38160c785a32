//! Outstanding-work accounting for an orderly session exit.
//!
//! Every accepted request or notification holds an [`OutstandingGuard`]
//! until its handler returns. The session itself holds one guard while it
//! is reading, so the count only reaches zero after the read loop is done
//! and every handler has settled.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

#[derive(Default)]
struct Inner {
    outstanding: AtomicUsize,
    idle: Notify,
}

#[derive(Clone, Default)]
pub struct ShutdownCoordinator {
    inner: Arc<Inner>,
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count one unit of outstanding work until the guard drops.
    pub fn hold(&self) -> OutstandingGuard {
        self.inner.outstanding.fetch_add(1, Ordering::AcqRel);
        OutstandingGuard {
            inner: self.inner.clone(),
        }
    }

    pub fn outstanding(&self) -> usize {
        self.inner.outstanding.load(Ordering::Acquire)
    }

    /// Wait until nothing is outstanding. Returns `false` on timeout.
    pub async fn wait_idle(&self, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, self.idle()).await.is_ok()
    }

    async fn idle(&self) {
        loop {
            let notified = self.inner.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.outstanding() == 0 {
                return;
            }
            notified.await;
        }
    }
}

/// RAII guard that decrements the outstanding count on drop.
pub struct OutstandingGuard {
    inner: Arc<Inner>,
}

impl Drop for OutstandingGuard {
    fn drop(&mut self) {
        let prev = self.inner.outstanding.fetch_sub(1, Ordering::AcqRel);
        if prev == 1 {
            self.inner.idle.notify_waiters();
        }
    }
}
