//! In-process task queue with a self-driving drain loop

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use parking_lot::Mutex;
use tokio::sync::{oneshot, Notify};
use tracing::debug;

use crate::concurrency::LimitError;

type BoxedTask = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Snapshot of queue occupancy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskQueueStatus {
    pub pending: usize,
    pub active: usize,
    pub total: usize,
}

/// The task was dropped by `clear()` before it ever ran
#[derive(Debug, PartialEq, Eq, thiserror::Error)]
#[error("Task dropped before it ran")]
pub struct TaskCleared;

/// Resolves with the task's output once the queue has run it
pub struct TaskHandle<T> {
    rx: oneshot::Receiver<T>,
}

impl<T> Future for TaskHandle<T> {
    type Output = Result<T, TaskCleared>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx).poll(cx).map(|r| r.map_err(|_| TaskCleared))
    }
}

struct Inner {
    concurrency: usize,
    pending: Mutex<VecDeque<BoxedTask>>,
    active: AtomicUsize,
    draining: AtomicBool,
    notify: Notify,
}

/// FIFO queue of deferred operations with its own concurrency cap.
///
/// Adding the first task to an idle queue starts a drain loop that pulls
/// tasks while capacity allows, yields between dispatches, and stops when
/// the queue empties. Enqueueing while draining is supported.
#[derive(Clone)]
pub struct TaskQueue {
    inner: Arc<Inner>,
}

impl TaskQueue {
    pub fn new(concurrency: usize) -> Result<Self, LimitError> {
        if concurrency == 0 {
            return Err(LimitError::InvalidConcurrency);
        }
        Ok(Self {
            inner: Arc::new(Inner {
                concurrency,
                pending: Mutex::new(VecDeque::new()),
                active: AtomicUsize::new(0),
                draining: AtomicBool::new(false),
                notify: Notify::new(),
            }),
        })
    }

    /// Enqueue one task; the handle resolves when it eventually runs
    pub fn add<F, T>(&self, task: F) -> TaskHandle<T>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let boxed: BoxedTask = Box::pin(async move {
            let output = task.await;
            let _ = tx.send(output);
        });

        self.inner.pending.lock().push_back(boxed);
        self.ensure_draining();
        TaskHandle { rx }
    }

    /// Enqueue many tasks at once
    pub fn add_batch<F, T>(&self, tasks: Vec<F>) -> Vec<TaskHandle<T>>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        tasks.into_iter().map(|t| self.add(t)).collect()
    }

    /// Current occupancy
    pub fn status(&self) -> TaskQueueStatus {
        let pending = self.inner.pending.lock().len();
        let active = self.inner.active.load(Ordering::Acquire);
        TaskQueueStatus {
            pending,
            active,
            total: pending + active,
        }
    }

    /// Drop unclaimed tasks; in-flight tasks finish normally.
    ///
    /// Handles of dropped tasks observe [`TaskCleared`]. Returns how many
    /// were dropped.
    pub fn clear(&self) -> usize {
        let dropped: Vec<_> = {
            let mut pending = self.inner.pending.lock();
            pending.drain(..).collect()
        };
        if !dropped.is_empty() {
            debug!(count = dropped.len(), "Cleared task queue");
        }
        dropped.len()
    }

    fn ensure_draining(&self) {
        self.inner.notify.notify_one();
        if self
            .inner
            .draining
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            let inner = self.inner.clone();
            tokio::spawn(drain(inner));
        }
    }
}

async fn drain(inner: Arc<Inner>) {
    loop {
        let task = {
            let mut pending = inner.pending.lock();
            if inner.active.load(Ordering::Acquire) >= inner.concurrency {
                None
            } else {
                pending.pop_front()
            }
        };

        match task {
            Some(task) => {
                inner.active.fetch_add(1, Ordering::AcqRel);
                let inner2 = inner.clone();
                tokio::spawn(async move {
                    task.await;
                    inner2.active.fetch_sub(1, Ordering::AcqRel);
                    inner2.notify.notify_one();
                });
                // a long backlog must not starve the rest of the runtime
                tokio::task::yield_now().await;
            }
            None => {
                if inner.active.load(Ordering::Acquire) == 0 && inner.pending.lock().is_empty() {
                    inner.draining.store(false, Ordering::Release);
                    // an add() racing the store above may have enqueued without
                    // spawning a new drain; re-claim the flag if work appeared
                    if inner.pending.lock().is_empty()
                        || inner
                            .draining
                            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                            .is_err()
                    {
                        return;
                    }
                    continue;
                }
                inner.notify.notified().await;
            }
        }
    }
}
