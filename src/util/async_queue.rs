use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_channel::{Receiver, Sender};
use futures::future::BoxFuture;
use futures::FutureExt;

use crate::util::runtime;

/// Identifies the source of a delayed operation so duplicate timers can be
/// reasoned about in logs and tests.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TimerId {
    ListenStreamConnectionBackoff,
    WriteStreamConnectionBackoff,
    OnlineStateTimeout,
    GarbageCollectionDelay,
}

type QueueTask = BoxFuture<'static, ()>;

/// Ordered cooperative task queue.
///
/// Every operation enqueued here runs to completion before the next one
/// starts, which is what makes transactions against the local caches appear
/// atomic to the rest of the engine. Timers and delayed retries re-enter the
/// same queue instead of running on separate threads, so their ordering
/// relative to user-initiated operations is well defined.
#[derive(Clone)]
pub struct AsyncQueue {
    tx: Sender<QueueTask>,
}

impl AsyncQueue {
    pub fn new() -> Self {
        let (tx, rx) = async_channel::unbounded::<QueueTask>();
        Self::start_worker(rx);
        Self { tx }
    }

    fn start_worker(rx: Receiver<QueueTask>) {
        runtime::spawn_detached(async move {
            while let Ok(task) = rx.recv().await {
                task.await;
            }
        });
    }

    /// Appends an operation to the back of the queue.
    pub fn enqueue<F>(&self, future: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if self.tx.try_send(future.boxed()).is_err() {
            log::warn!("async queue is shut down; dropping task");
        }
    }

    /// Schedules an operation to be enqueued after `delay`.
    ///
    /// The operation joins the back of the queue at fire time, it does not
    /// preempt whatever is running. Returns a handle that cancels the
    /// operation if it has not fired yet.
    pub fn enqueue_after_delay<F>(
        &self,
        timer_id: TimerId,
        delay: Duration,
        future: F,
    ) -> DelayedOperation
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let cancelled = Arc::new(AtomicBool::new(false));
        let handle = DelayedOperation {
            timer_id,
            cancelled: Arc::clone(&cancelled),
        };
        let queue = self.clone();
        runtime::spawn_detached(async move {
            runtime::sleep(delay).await;
            if !cancelled.load(Ordering::SeqCst) {
                queue.enqueue(future);
            }
        });
        handle
    }

    /// Closes the queue. Already-enqueued operations still drain; later
    /// enqueues are dropped.
    pub fn shut_down(&self) {
        self.tx.close();
    }
}

impl Default for AsyncQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// Cancellation handle for a pending delayed operation.
#[derive(Debug)]
pub struct DelayedOperation {
    timer_id: TimerId,
    cancelled: Arc<AtomicBool>,
}

impl DelayedOperation {
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn timer_id(&self) -> TimerId {
        self.timer_id
    }
}
