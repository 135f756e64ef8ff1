//! Batched structured logging for job execution
//!
//! One logger per job. Entries mirror to `tracing` immediately for live
//! tailing, accumulate in a buffer, and persist as whole batches when the
//! buffer fills or the idle timer fires. A failed flush puts the batch back
//! at the front of the buffer: entries are never silently dropped, so a
//! persistently broken sink grows the buffer without bound. Callers watch
//! `failed_flush_count()` and treat repeated failures as fatal for the job.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{oneshot, Mutex};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::Result;
use crate::models::{LogEntry, LogLevel};
use crate::store::LogSink;

/// Batching configuration
#[derive(Debug, Clone)]
pub struct JobLoggerConfig {
    /// Buffer size that triggers an immediate flush
    pub batch_size: usize,
    /// Idle flush interval
    pub flush_interval: Duration,
}

impl Default for JobLoggerConfig {
    fn default() -> Self {
        Self {
            batch_size: 10,
            flush_interval: Duration::from_secs(5),
        }
    }
}

struct LoggerInner {
    job_id: Uuid,
    sink: Arc<dyn LogSink>,
    config: JobLoggerConfig,
    buffer: Mutex<VecDeque<LogEntry>>,
    flush_count: AtomicU64,
    failed_flushes: AtomicU32,
    stop_timer: parking_lot::Mutex<Option<oneshot::Sender<()>>>,
}

/// Per-job batched logger over an abstract [`LogSink`].
///
/// `complete()` must be called on every code path that ends the job, or the
/// idle timer task leaks.
#[derive(Clone)]
pub struct JobLogger {
    inner: Arc<LoggerInner>,
}

impl JobLogger {
    pub fn new(job_id: Uuid, sink: Arc<dyn LogSink>, config: JobLoggerConfig) -> Self {
        let (stop_tx, mut stop_rx) = oneshot::channel::<()>();
        let inner = Arc::new(LoggerInner {
            job_id,
            sink,
            config,
            buffer: Mutex::new(VecDeque::new()),
            flush_count: AtomicU64::new(0),
            failed_flushes: AtomicU32::new(0),
            stop_timer: parking_lot::Mutex::new(Some(stop_tx)),
        });

        let timer_inner = inner.clone();
        tokio::spawn(async move {
            let period = timer_inner.config.flush_interval;
            let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = &mut stop_rx => break,
                    _ = interval.tick() => {
                        let _ = flush_inner(&timer_inner).await;
                    }
                }
            }
        });

        Self { inner }
    }

    pub fn job_id(&self) -> Uuid {
        self.inner.job_id
    }

    pub async fn info(&self, stage: &str, message: &str) {
        self.push(LogEntry::new(self.inner.job_id, LogLevel::Info, stage, message))
            .await;
    }

    pub async fn warning(&self, stage: &str, message: &str) {
        self.push(LogEntry::new(
            self.inner.job_id,
            LogLevel::Warning,
            stage,
            message,
        ))
        .await;
    }

    pub async fn error(&self, stage: &str, message: &str) {
        self.push(LogEntry::new(
            self.inner.job_id,
            LogLevel::Error,
            stage,
            message,
        ))
        .await;
    }

    pub async fn success(&self, stage: &str, message: &str) {
        self.push(LogEntry::new(
            self.inner.job_id,
            LogLevel::Success,
            stage,
            message,
        ))
        .await;
    }

    pub async fn debug(&self, stage: &str, message: &str) {
        self.push(LogEntry::new(
            self.inner.job_id,
            LogLevel::Debug,
            stage,
            message,
        ))
        .await;
    }

    /// Append a pre-built entry (for details, counters, durations)
    pub async fn push(&self, entry: LogEntry) {
        mirror(&entry);

        let should_flush = {
            let mut buffer = self.inner.buffer.lock().await;
            buffer.push_back(entry);
            buffer.len() >= self.inner.config.batch_size
        };

        if should_flush {
            let _ = flush_inner(&self.inner).await;
        }
    }

    /// Persist everything currently buffered as one batch.
    ///
    /// On sink failure the batch is prepended back onto the buffer so a
    /// later flush retries it.
    pub async fn flush(&self) -> Result<()> {
        flush_inner(&self.inner).await
    }

    /// Cancel the idle timer and force a final flush
    pub async fn complete(&self) -> Result<()> {
        if let Some(stop) = self.inner.stop_timer.lock().take() {
            let _ = stop.send(());
        }
        flush_inner(&self.inner).await
    }

    /// Entries waiting in the buffer
    pub async fn buffered_count(&self) -> usize {
        self.inner.buffer.lock().await.len()
    }

    /// Batches persisted so far
    pub fn flush_count(&self) -> u64 {
        self.inner.flush_count.load(Ordering::Relaxed)
    }

    /// Consecutive-failure signal for callers to monitor
    pub fn failed_flush_count(&self) -> u32 {
        self.inner.failed_flushes.load(Ordering::Relaxed)
    }
}

async fn flush_inner(inner: &LoggerInner) -> Result<()> {
    let batch: Vec<LogEntry> = {
        let mut buffer = inner.buffer.lock().await;
        buffer.drain(..).collect()
    };
    if batch.is_empty() {
        return Ok(());
    }

    match inner.sink.append_batch(&batch).await {
        Ok(()) => {
            inner.flush_count.fetch_add(1, Ordering::Relaxed);
            inner.failed_flushes.store(0, Ordering::Relaxed);
            debug!(job_id = %inner.job_id, count = batch.len(), "Flushed log batch");
            Ok(())
        }
        Err(e) => {
            {
                let mut buffer = inner.buffer.lock().await;
                for entry in batch.into_iter().rev() {
                    buffer.push_front(entry);
                }
            }
            let failures = inner.failed_flushes.fetch_add(1, Ordering::Relaxed) + 1;
            error!(
                job_id = %inner.job_id,
                failures,
                error = %e,
                "Log flush failed, entries re-queued"
            );
            Err(e)
        }
    }
}

/// Mirror an entry to the process-level subscriber for live tailing
fn mirror(entry: &LogEntry) {
    match entry.level {
        LogLevel::Info | LogLevel::Success => {
            info!(job_id = %entry.job_id, stage = %entry.stage, level = entry.level.as_str(), "{}", entry.message)
        }
        LogLevel::Warning => {
            warn!(job_id = %entry.job_id, stage = %entry.stage, "{}", entry.message)
        }
        LogLevel::Error => {
            error!(job_id = %entry.job_id, stage = %entry.stage, "{}", entry.message)
        }
        LogLevel::Debug => {
            debug!(job_id = %entry.job_id, stage = %entry.stage, "{}", entry.message)
        }
    }
}
