//! Bounded concurrency limiter with an inspectable FIFO wait queue

use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::debug;

/// Error from limiter construction or a dropped wait
#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum LimitError {
    #[error("Concurrency limit must be at least 1")]
    InvalidConcurrency,

    #[error("Queued operation dropped by clear_queue")]
    Cleared,
}

impl From<LimitError> for crate::error::EncoreError {
    fn from(e: LimitError) -> Self {
        match e {
            LimitError::InvalidConcurrency => Self::InvalidArgument(e.to_string()),
            LimitError::Cleared => Self::Internal(e.to_string()),
        }
    }
}

#[derive(Debug)]
struct Inner {
    concurrency: usize,
    active: AtomicUsize,
    // Waiters receive their permit directly from the releasing permit's Drop,
    // so the slot never goes through a free state another caller could steal.
    waiters: Mutex<VecDeque<oneshot::Sender<LimiterPermit>>>,
}

/// Caps how many submitted operations run simultaneously.
///
/// Operations past the cap wait in FIFO order. Each caller observes its own
/// operation's outcome; a failing operation neither blocks nor cancels its
/// siblings.
#[derive(Clone, Debug)]
pub struct Limiter {
    inner: Arc<Inner>,
}

/// A held slot. Dropping it hands the slot to the oldest waiter.
#[derive(Debug)]
pub struct LimiterPermit {
    inner: Arc<Inner>,
}

impl Drop for LimiterPermit {
    fn drop(&mut self) {
        let mut waiters = self.inner.waiters.lock();
        loop {
            match waiters.pop_front() {
                Some(tx) => {
                    let handoff = LimiterPermit {
                        inner: self.inner.clone(),
                    };
                    match tx.send(handoff) {
                        Ok(()) => return,
                        Err(returned) => {
                            // Receiver gave up while queued; the slot stays
                            // with us, try the next waiter. Forgetting avoids
                            // re-entering this Drop for the same slot.
                            std::mem::forget(returned);
                        }
                    }
                }
                None => {
                    self.inner.active.fetch_sub(1, Ordering::AcqRel);
                    return;
                }
            }
        }
    }
}

impl Limiter {
    /// Create a limiter that allows at most `concurrency` operations at once
    pub fn new(concurrency: usize) -> Result<Self, LimitError> {
        if concurrency == 0 {
            return Err(LimitError::InvalidConcurrency);
        }
        Ok(Self {
            inner: Arc::new(Inner {
                concurrency,
                active: AtomicUsize::new(0),
                waiters: Mutex::new(VecDeque::new()),
            }),
        })
    }

    /// Acquire a slot, waiting FIFO behind earlier callers if none is free
    pub async fn acquire(&self) -> Result<LimiterPermit, LimitError> {
        let rx = {
            let mut waiters = self.inner.waiters.lock();
            if waiters.is_empty()
                && self.inner.active.load(Ordering::Acquire) < self.inner.concurrency
            {
                self.inner.active.fetch_add(1, Ordering::AcqRel);
                return Ok(LimiterPermit {
                    inner: self.inner.clone(),
                });
            }
            let (tx, rx) = oneshot::channel();
            waiters.push_back(tx);
            rx
        };

        rx.await.map_err(|_| LimitError::Cleared)
    }

    /// Run a future under a slot
    pub async fn run<F, T>(&self, fut: F) -> Result<T, LimitError>
    where
        F: Future<Output = T>,
    {
        let _permit = self.acquire().await?;
        Ok(fut.await)
    }

    /// Number of operations currently running
    pub fn active_count(&self) -> usize {
        self.inner.active.load(Ordering::Acquire)
    }

    /// Number of operations waiting for a slot
    pub fn queued_count(&self) -> usize {
        self.inner.waiters.lock().len()
    }

    /// Configured concurrency cap
    pub fn concurrency(&self) -> usize {
        self.inner.concurrency
    }

    /// Drop all not-yet-started operations; running work is unaffected.
    ///
    /// Dropped waiters observe [`LimitError::Cleared`]. Returns how many were
    /// dropped.
    pub fn clear_queue(&self) -> usize {
        let dropped: Vec<_> = {
            let mut waiters = self.inner.waiters.lock();
            waiters.drain(..).collect()
        };
        if !dropped.is_empty() {
            debug!(count = dropped.len(), "Cleared limiter queue");
        }
        dropped.len()
    }
}
