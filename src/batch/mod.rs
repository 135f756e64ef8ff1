//! Batch and chunk fan-out over the bounded limiter
//!
//! Two granularities share one backpressure and progress contract:
//! per-item for providers called once per record (artist detail fetches),
//! per-chunk for providers that accept bulk payloads (catalog lookups).

use std::future::Future;
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::warn;

use crate::concurrency::Limiter;
use crate::error::EncoreError;

/// Progress callback: (items settled, items total)
pub type ProgressFn = Arc<dyn Fn(usize, usize) + Send + Sync>;

/// Error from a batch run
#[derive(Debug, thiserror::Error)]
pub enum BatchError {
    #[error("Invalid batch options: {0}")]
    Invalid(String),

    #[error("{failed} of {total} items failed; first: {first_error}")]
    Aggregate {
        failed: usize,
        total: usize,
        first_error: String,
    },
}

impl From<BatchError> for EncoreError {
    fn from(e: BatchError) -> Self {
        match e {
            BatchError::Invalid(msg) => Self::InvalidArgument(msg),
            // sub-fetch failures are worth a job-level retry
            BatchError::Aggregate { .. } => Self::Transient(e.to_string()),
        }
    }
}

/// Options for [`process_batch`]
#[derive(Clone, Default)]
pub struct BatchOptions {
    /// Concurrency cap for in-flight items (0 means the default of 5)
    pub concurrency: usize,
    /// Collect failures instead of failing the whole batch
    pub continue_on_error: bool,
    /// Invoked after every item settles
    pub on_progress: Option<ProgressFn>,
}

impl BatchOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub fn continue_on_error(mut self, continue_on_error: bool) -> Self {
        self.continue_on_error = continue_on_error;
        self
    }

    pub fn on_progress(mut self, f: impl Fn(usize, usize) + Send + Sync + 'static) -> Self {
        self.on_progress = Some(Arc::new(f));
        self
    }

    fn effective_concurrency(&self) -> usize {
        if self.concurrency == 0 {
            5
        } else {
            self.concurrency
        }
    }
}

/// Options for [`process_in_chunks`]
#[derive(Clone)]
pub struct ChunkOptions {
    /// Items per chunk
    pub chunk_size: usize,
    /// Concurrency cap for in-flight chunks
    pub concurrency: usize,
    /// Invoked with item-count granularity after each chunk completes
    pub on_progress: Option<ProgressFn>,
}

impl ChunkOptions {
    pub fn new(chunk_size: usize) -> Self {
        Self {
            chunk_size,
            concurrency: 2,
            on_progress: None,
        }
    }

    pub fn concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub fn on_progress(mut self, f: impl Fn(usize, usize) + Send + Sync + 'static) -> Self {
        self.on_progress = Some(Arc::new(f));
        self
    }
}

/// Outcome of a batch run with `continue_on_error`
#[derive(Debug)]
pub struct BatchOutcome<T> {
    /// One slot per input item, original order; failed slots are `None`
    pub results: Vec<Option<T>>,
    /// Collected failures as (item index, error)
    pub failures: Vec<(usize, EncoreError)>,
}

impl<T> BatchOutcome<T> {
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }

    /// Successful values in original order, dropping failed slots
    pub fn into_values(self) -> Vec<T> {
        self.results.into_iter().flatten().collect()
    }
}

/// Run `op` over every item with bounded concurrency.
///
/// Results keep the input order regardless of completion order. The progress
/// callback fires after every settle, success or failure. With
/// `continue_on_error` unset, any failure aggregates into
/// [`BatchError::Aggregate`] once every already-scheduled item has settled.
pub async fn process_batch<I, T, F, Fut>(
    items: Vec<I>,
    op: F,
    options: BatchOptions,
) -> Result<BatchOutcome<T>, BatchError>
where
    I: Send + 'static,
    T: Send + 'static,
    F: Fn(I) -> Fut + Clone + Send + Sync + 'static,
    Fut: Future<Output = Result<T, EncoreError>> + Send + 'static,
{
    let total = items.len();
    let limiter = Limiter::new(options.effective_concurrency())
        .map_err(|e| BatchError::Invalid(e.to_string()))?;

    let (tx, mut rx) = mpsc::unbounded_channel();
    for (index, item) in items.into_iter().enumerate() {
        let limiter = limiter.clone();
        let op = op.clone();
        let tx = tx.clone();
        tokio::spawn(async move {
            let result = match limiter.acquire().await {
                Ok(_permit) => op(item).await,
                Err(e) => Err(e.into()),
            };
            let _ = tx.send((index, result));
        });
    }
    drop(tx);

    let mut results: Vec<Option<T>> = (0..total).map(|_| None).collect();
    let mut failures: Vec<(usize, EncoreError)> = Vec::new();
    let mut settled = 0usize;

    while let Some((index, result)) = rx.recv().await {
        settled += 1;
        match result {
            Ok(value) => results[index] = Some(value),
            Err(error) => {
                warn!(index, error = %error, "Batch item failed");
                failures.push((index, error));
            }
        }
        if let Some(cb) = &options.on_progress {
            cb(settled, total);
        }
    }

    if !options.continue_on_error && !failures.is_empty() {
        failures.sort_by_key(|(i, _)| *i);
        return Err(BatchError::Aggregate {
            failed: failures.len(),
            total,
            first_error: failures[0].1.to_string(),
        });
    }

    failures.sort_by_key(|(i, _)| *i);
    Ok(BatchOutcome { results, failures })
}

/// Partition items into fixed-size chunks and run `chunk_op` per chunk with
/// bounded concurrency, flattening results in input order.
///
/// Progress is reported in item counts after each chunk completes. Any chunk
/// failure fails the whole call once the scheduled chunks have settled.
pub async fn process_in_chunks<I, T, F, Fut>(
    items: Vec<I>,
    chunk_op: F,
    options: ChunkOptions,
) -> Result<Vec<T>, BatchError>
where
    I: Send + 'static,
    T: Send + 'static,
    F: Fn(Vec<I>) -> Fut + Clone + Send + Sync + 'static,
    Fut: Future<Output = Result<Vec<T>, EncoreError>> + Send + 'static,
{
    if options.chunk_size == 0 {
        return Err(BatchError::Invalid("chunk_size must be at least 1".into()));
    }

    let total_items = items.len();
    let mut chunks: Vec<Vec<I>> = Vec::new();
    let mut current = Vec::with_capacity(options.chunk_size.min(total_items));
    for item in items {
        current.push(item);
        if current.len() == options.chunk_size {
            chunks.push(std::mem::take(&mut current));
        }
    }
    if !current.is_empty() {
        chunks.push(current);
    }

    let chunk_sizes: Vec<usize> = chunks.iter().map(Vec::len).collect();
    let limiter =
        Limiter::new(options.concurrency).map_err(|e| BatchError::Invalid(e.to_string()))?;

    let (tx, mut rx) = mpsc::unbounded_channel();
    for (index, chunk) in chunks.into_iter().enumerate() {
        let limiter = limiter.clone();
        let chunk_op = chunk_op.clone();
        let tx = tx.clone();
        tokio::spawn(async move {
            let result = match limiter.acquire().await {
                Ok(_permit) => chunk_op(chunk).await,
                Err(e) => Err(e.into()),
            };
            let _ = tx.send((index, result));
        });
    }
    drop(tx);

    let mut slots: Vec<Option<Vec<T>>> = (0..chunk_sizes.len()).map(|_| None).collect();
    let mut failed = 0usize;
    let mut first_error: Option<(usize, String)> = None;
    let mut items_done = 0usize;

    while let Some((index, result)) = rx.recv().await {
        items_done += chunk_sizes[index];
        match result {
            Ok(values) => slots[index] = Some(values),
            Err(error) => {
                warn!(chunk = index, error = %error, "Chunk failed");
                failed += 1;
                match &first_error {
                    Some((i, _)) if *i < index => {}
                    _ => first_error = Some((index, error.to_string())),
                }
            }
        }
        if let Some(cb) = &options.on_progress {
            cb(items_done, total_items);
        }
    }

    if failed > 0 {
        return Err(BatchError::Aggregate {
            failed,
            total: chunk_sizes.len(),
            first_error: first_error.map(|(_, e)| e).unwrap_or_default(),
        });
    }

    Ok(slots.into_iter().flatten().flatten().collect())
}
