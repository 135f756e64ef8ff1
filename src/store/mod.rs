//! Persistence abstraction for jobs and job logs
//!
//! Implement [`JobStore`] for any backend. The crate ships a SQLite
//! implementation and an in-memory store for tests and embedding.

mod memory;

#[cfg(feature = "sqlite")]
pub mod sqlite;

pub use memory::MemoryStore;

#[cfg(feature = "sqlite")]
pub use sqlite::SqliteStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::Result;
use crate::models::{Job, LogEntry, QueueCounts};

/// Durable sink for batched log entries.
///
/// Any store satisfying this contract can back the batched logger: a
/// row-oriented table, an append-only file, an external log service.
#[async_trait]
pub trait LogSink: Send + Sync + 'static {
    /// Persist a whole batch in one operation
    async fn append_batch(&self, entries: &[LogEntry]) -> Result<()>;
}

/// Storage operations needed by the queue manager.
///
/// Implementations must be thread-safe; jobs are claimed and written back by
/// concurrent workers, possibly across processes.
#[async_trait]
pub trait JobStore: LogSink {
    // =========================================================================
    // Job lifecycle
    // =========================================================================

    /// Insert a new job
    async fn insert_job(&self, job: &Job) -> Result<()>;

    /// Get a job by ID
    async fn get_job(&self, id: Uuid) -> Result<Option<Job>>;

    /// List jobs in a queue, newest first
    async fn get_jobs_by_queue(&self, queue: &str, limit: i64, offset: i64) -> Result<Vec<Job>>;

    /// Atomically claim up to `limit` eligible jobs for a worker.
    ///
    /// Eligible: pending, `scheduled_for` absent or in the past, no live
    /// claim lease. Highest priority first, FIFO within a priority. Claimed
    /// jobs become active with `attempts` incremented and a lease of
    /// `lock_duration_secs` held by `worker_id`.
    async fn claim_jobs(
        &self,
        queue: &str,
        worker_id: &str,
        limit: i64,
        lock_duration_secs: i64,
    ) -> Result<Vec<Job>>;

    /// Mark a job completed
    async fn complete_job(&self, id: Uuid) -> Result<()>;

    /// Mark a job terminally failed
    async fn fail_job(&self, id: Uuid, error: &str) -> Result<()>;

    /// Put a job back in pending for a later attempt
    async fn retry_job(&self, id: Uuid, error: &str, scheduled_for: DateTime<Utc>) -> Result<()>;

    /// Release a claim lease without changing the outcome (worker shutdown)
    async fn release_job(&self, id: Uuid, worker_id: &str) -> Result<()>;

    /// Return active jobs whose lease expired to pending; returns how many
    async fn reclaim_stale_jobs(&self, limit: i64) -> Result<u64>;

    // =========================================================================
    // Health and maintenance
    // =========================================================================

    /// Per-status counts for one queue
    async fn queue_counts(&self, queue: &str) -> Result<QueueCounts>;

    /// Delete terminal jobs older than the cutoff; returns how many
    async fn purge_terminal_jobs(&self, older_than: DateTime<Utc>) -> Result<u64>;

    /// Read persisted log entries for a job, oldest first
    async fn get_job_logs(&self, job_id: Uuid, limit: i64, offset: i64) -> Result<Vec<LogEntry>>;

    /// Health check - verify backend connectivity
    async fn ping(&self) -> Result<()>;

    /// Create or update the backing schema
    async fn migrate(&self) -> Result<()>;
}
