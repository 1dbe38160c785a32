//! Fan-out notification bus with drain and disable.
//!
//! Each subscribed [`DataConsumer`] gets its own FIFO queue and worker
//! task, so a slow consumer never delays another. [`NotificationBus::drain`]
//! waits until every item published before the call has been consumed by
//! every consumer. [`NotificationBus::disable`] stops accepting items,
//! lets the workers finish what is already queued, and joins them.

use async_trait::async_trait;
use futures::FutureExt;
use parking_lot::RwLock;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

#[async_trait]
pub trait DataConsumer<T>: Send + Sync {
    fn name(&self) -> &str;

    async fn consume(&self, item: &T) -> anyhow::Result<()>;
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum BusError {
    #[error("notification bus is disabled")]
    Disabled,
    #[error("timed out draining notification bus")]
    DrainTimedOut,
}

/// Per-consumer queue positions.
#[derive(Default)]
struct Progress {
    enqueued: AtomicU64,
    consumed: AtomicU64,
}

struct Subscription<T> {
    tx: mpsc::UnboundedSender<Arc<T>>,
    progress: Arc<Progress>,
}

struct BusState<T> {
    disabled: bool,
    subscriptions: Vec<Subscription<T>>,
    workers: Vec<JoinHandle<()>>,
}

struct BusInner<T> {
    state: RwLock<BusState<T>>,
    /// Fired whenever any worker finishes an item.
    consumed: Notify,
}

pub struct NotificationBus<T> {
    inner: Arc<BusInner<T>>,
}

impl<T> Clone for NotificationBus<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Send + Sync + 'static> Default for NotificationBus<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Send + Sync + 'static> NotificationBus<T> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(BusInner {
                state: RwLock::new(BusState {
                    disabled: false,
                    subscriptions: Vec::new(),
                    workers: Vec::new(),
                }),
                consumed: Notify::new(),
            }),
        }
    }

    /// Attach a consumer and start its worker. Must be called inside a
    /// tokio runtime.
    pub fn subscribe(&self, consumer: Arc<dyn DataConsumer<T>>) -> Result<(), BusError> {
        let mut state = self.inner.state.write();
        if state.disabled {
            return Err(BusError::Disabled);
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let progress = Arc::new(Progress::default());
        let worker = tokio::spawn(run_worker(
            consumer,
            rx,
            progress.clone(),
            self.inner.clone(),
        ));
        state.subscriptions.push(Subscription { tx, progress });
        state.workers.push(worker);
        Ok(())
    }

    /// Queue an item for every consumer.
    pub fn publish(&self, item: T) -> Result<(), BusError> {
        let state = self.inner.state.read();
        if state.disabled {
            return Err(BusError::Disabled);
        }
        let item = Arc::new(item);
        for sub in &state.subscriptions {
            sub.progress.enqueued.fetch_add(1, Ordering::AcqRel);
            if sub.tx.send(item.clone()).is_err() {
                // Worker is gone; count the item as handled so drain can finish.
                sub.progress.consumed.fetch_add(1, Ordering::AcqRel);
            }
        }
        Ok(())
    }

    /// Wait until everything published before this call has been consumed.
    pub async fn drain(&self, timeout: Duration) -> Result<(), BusError> {
        let targets: Vec<(Arc<Progress>, u64)> = {
            let state = self.inner.state.read();
            state
                .subscriptions
                .iter()
                .map(|s| (s.progress.clone(), s.progress.enqueued.load(Ordering::Acquire)))
                .collect()
        };

        let caught_up = async {
            loop {
                let notified = self.inner.consumed.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();
                if targets
                    .iter()
                    .all(|(p, target)| p.consumed.load(Ordering::Acquire) >= *target)
                {
                    return;
                }
                notified.await;
            }
        };

        tokio::time::timeout(timeout, caught_up)
            .await
            .map_err(|_| BusError::DrainTimedOut)
    }

    /// Stop accepting items, finish queued ones, and join the workers.
    /// Calling it again is a no-op.
    pub async fn disable(&self) {
        let workers = {
            let mut state = self.inner.state.write();
            if state.disabled {
                return;
            }
            state.disabled = true;
            // Dropping the senders ends each worker once its queue is empty.
            state.subscriptions.clear();
            std::mem::take(&mut state.workers)
        };

        for worker in workers {
            if let Err(e) = worker.await {
                warn!(?e, "notification worker failed");
            }
        }
    }

    pub fn is_disabled(&self) -> bool {
        self.inner.state.read().disabled
    }
}

async fn run_worker<T: Send + Sync + 'static>(
    consumer: Arc<dyn DataConsumer<T>>,
    mut rx: mpsc::UnboundedReceiver<Arc<T>>,
    progress: Arc<Progress>,
    bus: Arc<BusInner<T>>,
) {
    while let Some(item) = rx.recv().await {
        match AssertUnwindSafe(consumer.consume(&item)).catch_unwind().await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(consumer = consumer.name(), "consumer failed: {:#}", e),
            Err(_) => warn!(consumer = consumer.name(), "consumer panicked"),
        }
        progress.consumed.fetch_add(1, Ordering::AcqRel);
        bus.consumed.notify_waiters();
    }
    debug!(consumer = consumer.name(), "notification worker exiting");
}
