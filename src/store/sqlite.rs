//! SQLite implementation of JobStore
//!
//! Ideal for:
//! - Local development
//! - Single-node deployments
//! - Testing

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use uuid::Uuid;

use crate::error::{EncoreError, Result};
use crate::models::{Job, JobStatus, LogEntry, LogLevel, Priority, QueueCounts};
use crate::store::{JobStore, LogSink};

/// SQLite-backed job store.
///
/// Uses WAL mode for concurrent reads and a single-writer pool; timestamps
/// are stored as rfc3339 text.
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Connect to a SQLite database
    pub async fn connect(url: &str) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1) // SQLite works best with a single writer
            .connect(url)
            .await?;

        sqlx::query("PRAGMA journal_mode=WAL")
            .execute(&pool)
            .await?;
        sqlx::query("PRAGMA foreign_keys=ON").execute(&pool).await?;

        Ok(Self { pool })
    }

    /// Create an in-memory store (useful for testing)
    pub async fn in_memory() -> Result<Self> {
        Self::connect("sqlite::memory:").await
    }

    /// Create from an existing pool
    pub fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Reference to the connection pool
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[async_trait]
impl LogSink for SqliteStore {
    async fn append_batch(&self, entries: &[LogEntry]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for entry in entries {
            sqlx::query(
                r#"
                INSERT INTO job_logs (job_id, level, stage, message, details,
                                      items_processed, items_total, duration_ms,
                                      error_code, error_stack, timestamp)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(entry.job_id.to_string())
            .bind(entry.level.as_str())
            .bind(&entry.stage)
            .bind(&entry.message)
            .bind(
                entry
                    .details
                    .as_ref()
                    .map(|v| serde_json::to_string(v).unwrap_or_default()),
            )
            .bind(entry.items_processed)
            .bind(entry.items_total)
            .bind(entry.duration_ms)
            .bind(&entry.error_code)
            .bind(&entry.error_stack)
            .bind(entry.timestamp.to_rfc3339())
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }
}

#[async_trait]
impl JobStore for SqliteStore {
    async fn insert_job(&self, job: &Job) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO jobs (
                id, queue_name, job_type, priority, payload, status,
                attempts, max_attempts, last_error, subject_id, scheduled_for,
                locked_until, locked_by, created_at, updated_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(job.id.to_string())
        .bind(&job.queue_name)
        .bind(&job.job_type)
        .bind(job.priority.as_i32())
        .bind(serde_json::to_string(&job.payload).unwrap_or_default())
        .bind(job.status.as_str())
        .bind(job.attempts)
        .bind(job.max_attempts)
        .bind(&job.last_error)
        .bind(&job.subject_id)
        .bind(job.scheduled_for.map(|t| t.to_rfc3339()))
        .bind(job.locked_until.map(|t| t.to_rfc3339()))
        .bind(&job.locked_by)
        .bind(job.created_at.to_rfc3339())
        .bind(job.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_job(&self, id: Uuid) -> Result<Option<Job>> {
        let row = sqlx::query(
            r#"
            SELECT id, queue_name, job_type, priority, payload, status,
                   attempts, max_attempts, last_error, subject_id, scheduled_for,
                   locked_until, locked_by, created_at, updated_at
            FROM jobs WHERE id = ?
            "#,
        )
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await?;

        row.map(|r| row_to_job(&r)).transpose()
    }

    async fn get_jobs_by_queue(&self, queue: &str, limit: i64, offset: i64) -> Result<Vec<Job>> {
        let rows = sqlx::query(
            r#"
            SELECT id, queue_name, job_type, priority, payload, status,
                   attempts, max_attempts, last_error, subject_id, scheduled_for,
                   locked_until, locked_by, created_at, updated_at
            FROM jobs WHERE queue_name = ?
            ORDER BY created_at DESC
            LIMIT ? OFFSET ?
            "#,
        )
        .bind(queue)
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_job).collect()
    }

    async fn claim_jobs(
        &self,
        queue: &str,
        worker_id: &str,
        limit: i64,
        lock_duration_secs: i64,
    ) -> Result<Vec<Job>> {
        // SQLite has no FOR UPDATE SKIP LOCKED; the single-writer pool makes
        // select-then-update atomic enough for one process, and the lease
        // columns cover multi-process claimers.
        let now = Utc::now();
        let lock_until = now + chrono::Duration::seconds(lock_duration_secs);

        let ids: Vec<String> = sqlx::query_scalar(
            r#"
            SELECT id FROM jobs
            WHERE queue_name = ?
              AND status = 'pending'
              AND (scheduled_for IS NULL OR scheduled_for <= ?)
              AND (locked_until IS NULL OR locked_until < ?)
            ORDER BY priority DESC, created_at
            LIMIT ?
            "#,
        )
        .bind(queue)
        .bind(now.to_rfc3339())
        .bind(now.to_rfc3339())
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        if ids.is_empty() {
            return Ok(vec![]);
        }

        let placeholders = ids.iter().map(|_| "?").collect::<Vec<_>>().join(",");
        let query = format!(
            r#"
            UPDATE jobs
            SET status = 'active',
                attempts = attempts + 1,
                locked_until = ?,
                locked_by = ?,
                updated_at = ?
            WHERE id IN ({})
            "#,
            placeholders
        );

        let mut q = sqlx::query(&query)
            .bind(lock_until.to_rfc3339())
            .bind(worker_id)
            .bind(now.to_rfc3339());
        for id in &ids {
            q = q.bind(id);
        }
        q.execute(&self.pool).await?;

        let mut jobs = Vec::with_capacity(ids.len());
        for id in ids {
            let parsed = Uuid::parse_str(&id)
                .map_err(|e| EncoreError::Internal(format!("Bad job id in store: {e}")))?;
            if let Some(job) = self.get_job(parsed).await? {
                jobs.push(job);
            }
        }
        Ok(jobs)
    }

    async fn complete_job(&self, id: Uuid) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'completed', locked_until = NULL, locked_by = NULL,
                updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(Utc::now().to_rfc3339())
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn fail_job(&self, id: Uuid, error: &str) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'failed', last_error = ?, locked_until = NULL,
                locked_by = NULL, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(error)
        .bind(Utc::now().to_rfc3339())
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn retry_job(&self, id: Uuid, error: &str, scheduled_for: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'pending', last_error = ?, scheduled_for = ?,
                locked_until = NULL, locked_by = NULL, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(error)
        .bind(scheduled_for.to_rfc3339())
        .bind(Utc::now().to_rfc3339())
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn release_job(&self, id: Uuid, worker_id: &str) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE jobs
            SET locked_until = NULL, locked_by = NULL, updated_at = ?
            WHERE id = ? AND locked_by = ?
            "#,
        )
        .bind(Utc::now().to_rfc3339())
        .bind(id.to_string())
        .bind(worker_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn reclaim_stale_jobs(&self, limit: i64) -> Result<u64> {
        let now = Utc::now().to_rfc3339();
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'pending', locked_until = NULL, locked_by = NULL,
                updated_at = ?
            WHERE id IN (
                SELECT id FROM jobs
                WHERE status = 'active' AND locked_until < ?
                ORDER BY locked_until
                LIMIT ?
            )
            "#,
        )
        .bind(&now)
        .bind(&now)
        .bind(limit)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn queue_counts(&self, queue: &str) -> Result<QueueCounts> {
        let rows = sqlx::query(
            r#"
            SELECT status, COUNT(*) as count FROM jobs
            WHERE queue_name = ?
            GROUP BY status
            "#,
        )
        .bind(queue)
        .fetch_all(&self.pool)
        .await?;

        let mut counts = QueueCounts::default();
        for row in rows {
            let status: String = row.get("status");
            let count: i64 = row.get("count");
            match JobStatus::from_str(&status) {
                Some(JobStatus::Pending) => counts.pending = count as u64,
                Some(JobStatus::Active) => counts.active = count as u64,
                Some(JobStatus::Completed) => counts.completed = count as u64,
                Some(JobStatus::Failed) => counts.failed = count as u64,
                None => {}
            }
        }
        Ok(counts)
    }

    async fn purge_terminal_jobs(&self, older_than: DateTime<Utc>) -> Result<u64> {
        let cutoff = older_than.to_rfc3339();

        sqlx::query(
            r#"
            DELETE FROM job_logs WHERE job_id IN (
                SELECT id FROM jobs
                WHERE status IN ('completed', 'failed') AND updated_at < ?
            )
            "#,
        )
        .bind(&cutoff)
        .execute(&self.pool)
        .await?;

        let result = sqlx::query(
            r#"
            DELETE FROM jobs
            WHERE status IN ('completed', 'failed') AND updated_at < ?
            "#,
        )
        .bind(&cutoff)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn get_job_logs(&self, job_id: Uuid, limit: i64, offset: i64) -> Result<Vec<LogEntry>> {
        let rows = sqlx::query(
            r#"
            SELECT job_id, level, stage, message, details, items_processed,
                   items_total, duration_ms, error_code, error_stack, timestamp
            FROM job_logs WHERE job_id = ?
            ORDER BY id
            LIMIT ? OFFSET ?
            "#,
        )
        .bind(job_id.to_string())
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_log_entry).collect()
    }

    async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    async fn migrate(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS jobs (
                id TEXT PRIMARY KEY,
                queue_name TEXT NOT NULL,
                job_type TEXT NOT NULL,
                priority INTEGER NOT NULL,
                payload TEXT NOT NULL,
                status TEXT NOT NULL,
                attempts INTEGER NOT NULL DEFAULT 0,
                max_attempts INTEGER NOT NULL DEFAULT 3,
                last_error TEXT,
                subject_id TEXT,
                scheduled_for TEXT,
                locked_until TEXT,
                locked_by TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_jobs_claim
            ON jobs (queue_name, status, priority, created_at)
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS job_logs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                job_id TEXT NOT NULL,
                level TEXT NOT NULL,
                stage TEXT NOT NULL,
                message TEXT NOT NULL,
                details TEXT,
                items_processed INTEGER,
                items_total INTEGER,
                duration_ms INTEGER,
                error_code TEXT,
                error_stack TEXT,
                timestamp TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_job_logs_job
            ON job_logs (job_id, id)
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

fn row_to_job(row: &sqlx::sqlite::SqliteRow) -> Result<Job> {
    let id: String = row.get("id");
    let status: String = row.get("status");
    let priority: i32 = row.get("priority");
    let payload: String = row.get("payload");

    Ok(Job {
        id: parse_uuid(&id)?,
        queue_name: row.get("queue_name"),
        job_type: row.get("job_type"),
        priority: Priority::from_i32(priority)
            .ok_or_else(|| EncoreError::Internal(format!("Bad priority in store: {priority}")))?,
        payload: serde_json::from_str(&payload)?,
        status: JobStatus::from_str(&status)
            .ok_or_else(|| EncoreError::Internal(format!("Bad status in store: {status}")))?,
        attempts: row.get("attempts"),
        max_attempts: row.get("max_attempts"),
        last_error: row.get("last_error"),
        subject_id: row.get("subject_id"),
        scheduled_for: parse_opt_timestamp(row.get("scheduled_for"))?,
        locked_until: parse_opt_timestamp(row.get("locked_until"))?,
        locked_by: row.get("locked_by"),
        created_at: parse_timestamp(&row.get::<String, _>("created_at"))?,
        updated_at: parse_timestamp(&row.get::<String, _>("updated_at"))?,
    })
}

fn row_to_log_entry(row: &sqlx::sqlite::SqliteRow) -> Result<LogEntry> {
    let job_id: String = row.get("job_id");
    let level: String = row.get("level");
    let details: Option<String> = row.get("details");

    Ok(LogEntry {
        job_id: parse_uuid(&job_id)?,
        level: LogLevel::from_str(&level)
            .ok_or_else(|| EncoreError::Internal(format!("Bad log level in store: {level}")))?,
        stage: row.get("stage"),
        message: row.get("message"),
        details: details.map(|d| serde_json::from_str(&d)).transpose()?,
        items_processed: row.get("items_processed"),
        items_total: row.get("items_total"),
        duration_ms: row.get("duration_ms"),
        error_code: row.get("error_code"),
        error_stack: row.get("error_stack"),
        timestamp: parse_timestamp(&row.get::<String, _>("timestamp"))?,
    })
}

fn parse_uuid(s: &str) -> Result<Uuid> {
    Uuid::parse_str(s).map_err(|e| EncoreError::Internal(format!("Bad UUID in store: {e}")))
}

fn parse_timestamp(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| EncoreError::Internal(format!("Bad timestamp in store: {e}")))
}

fn parse_opt_timestamp(s: Option<String>) -> Result<Option<DateTime<Utc>>> {
    s.as_deref().map(parse_timestamp).transpose()
}
