//! In-memory JobStore for tests and single-process embedding

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

use crate::error::{EncoreError, Result};
use crate::models::{Job, JobStatus, LogEntry, QueueCounts};
use crate::store::{JobStore, LogSink};

/// HashMap-backed store. Claims are serialized by a write lock, so the
/// single-claimer invariant holds within one process.
#[derive(Clone)]
pub struct MemoryStore {
    inner: Arc<Inner>,
}

struct Inner {
    jobs: RwLock<HashMap<Uuid, Job>>,
    logs: RwLock<Vec<LogEntry>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                jobs: RwLock::new(HashMap::new()),
                logs: RwLock::new(Vec::new()),
            }),
        }
    }

    /// Total jobs held, any status (test helper)
    pub fn job_count(&self) -> usize {
        self.inner.jobs.read().len()
    }

    /// Total persisted log entries (test helper)
    pub fn log_count(&self) -> usize {
        self.inner.logs.read().len()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LogSink for MemoryStore {
    async fn append_batch(&self, entries: &[LogEntry]) -> Result<()> {
        self.inner.logs.write().extend_from_slice(entries);
        Ok(())
    }
}

#[async_trait]
impl JobStore for MemoryStore {
    async fn insert_job(&self, job: &Job) -> Result<()> {
        self.inner.jobs.write().insert(job.id, job.clone());
        Ok(())
    }

    async fn get_job(&self, id: Uuid) -> Result<Option<Job>> {
        Ok(self.inner.jobs.read().get(&id).cloned())
    }

    async fn get_jobs_by_queue(&self, queue: &str, limit: i64, offset: i64) -> Result<Vec<Job>> {
        let jobs = self.inner.jobs.read();
        let mut matched: Vec<Job> = jobs
            .values()
            .filter(|j| j.queue_name == queue)
            .cloned()
            .collect();
        matched.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(matched
            .into_iter()
            .skip(offset.max(0) as usize)
            .take(limit.max(0) as usize)
            .collect())
    }

    async fn claim_jobs(
        &self,
        queue: &str,
        worker_id: &str,
        limit: i64,
        lock_duration_secs: i64,
    ) -> Result<Vec<Job>> {
        let now = Utc::now();
        let mut jobs = self.inner.jobs.write();

        let mut eligible: Vec<Uuid> = jobs
            .values()
            .filter(|j| {
                j.queue_name == queue
                    && j.status == JobStatus::Pending
                    && j.scheduled_for.map(|t| t <= now).unwrap_or(true)
                    && j.locked_until.map(|t| t < now).unwrap_or(true)
            })
            .map(|j| j.id)
            .collect();

        eligible.sort_by(|a, b| {
            let ja = &jobs[a];
            let jb = &jobs[b];
            jb.priority
                .as_i32()
                .cmp(&ja.priority.as_i32())
                .then(ja.created_at.cmp(&jb.created_at))
        });
        eligible.truncate(limit.max(0) as usize);

        let mut claimed = Vec::with_capacity(eligible.len());
        for id in eligible {
            if let Some(job) = jobs.get_mut(&id) {
                job.status = JobStatus::Active;
                job.attempts += 1;
                job.locked_by = Some(worker_id.to_string());
                job.locked_until = Some(now + chrono::Duration::seconds(lock_duration_secs));
                job.updated_at = now;
                claimed.push(job.clone());
            }
        }
        Ok(claimed)
    }

    async fn complete_job(&self, id: Uuid) -> Result<()> {
        let mut jobs = self.inner.jobs.write();
        let job = jobs
            .get_mut(&id)
            .ok_or(EncoreError::JobNotFound { id })?;
        job.status = JobStatus::Completed;
        job.locked_by = None;
        job.locked_until = None;
        job.updated_at = Utc::now();
        Ok(())
    }

    async fn fail_job(&self, id: Uuid, error: &str) -> Result<()> {
        let mut jobs = self.inner.jobs.write();
        let job = jobs
            .get_mut(&id)
            .ok_or(EncoreError::JobNotFound { id })?;
        job.status = JobStatus::Failed;
        job.last_error = Some(error.to_string());
        job.locked_by = None;
        job.locked_until = None;
        job.updated_at = Utc::now();
        Ok(())
    }

    async fn retry_job(&self, id: Uuid, error: &str, scheduled_for: DateTime<Utc>) -> Result<()> {
        let mut jobs = self.inner.jobs.write();
        let job = jobs
            .get_mut(&id)
            .ok_or(EncoreError::JobNotFound { id })?;
        job.status = JobStatus::Pending;
        job.last_error = Some(error.to_string());
        job.scheduled_for = Some(scheduled_for);
        job.locked_by = None;
        job.locked_until = None;
        job.updated_at = Utc::now();
        Ok(())
    }

    async fn release_job(&self, id: Uuid, worker_id: &str) -> Result<()> {
        let mut jobs = self.inner.jobs.write();
        if let Some(job) = jobs.get_mut(&id) {
            if job.locked_by.as_deref() == Some(worker_id) {
                job.locked_by = None;
                job.locked_until = None;
                job.updated_at = Utc::now();
            }
        }
        Ok(())
    }

    async fn reclaim_stale_jobs(&self, limit: i64) -> Result<u64> {
        let now = Utc::now();
        let mut jobs = self.inner.jobs.write();
        let mut reclaimed = 0u64;

        for job in jobs.values_mut() {
            if reclaimed >= limit.max(0) as u64 {
                break;
            }
            if job.status == JobStatus::Active && job.locked_until.map(|t| t < now).unwrap_or(false)
            {
                job.status = JobStatus::Pending;
                job.locked_by = None;
                job.locked_until = None;
                job.updated_at = now;
                reclaimed += 1;
            }
        }
        Ok(reclaimed)
    }

    async fn queue_counts(&self, queue: &str) -> Result<QueueCounts> {
        let jobs = self.inner.jobs.read();
        let mut counts = QueueCounts::default();
        for job in jobs.values().filter(|j| j.queue_name == queue) {
            match job.status {
                JobStatus::Pending => counts.pending += 1,
                JobStatus::Active => counts.active += 1,
                JobStatus::Completed => counts.completed += 1,
                JobStatus::Failed => counts.failed += 1,
            }
        }
        Ok(counts)
    }

    async fn purge_terminal_jobs(&self, older_than: DateTime<Utc>) -> Result<u64> {
        let mut jobs = self.inner.jobs.write();
        let before = jobs.len();
        jobs.retain(|_, j| !(j.status.is_terminal() && j.updated_at < older_than));
        Ok((before - jobs.len()) as u64)
    }

    async fn get_job_logs(&self, job_id: Uuid, limit: i64, offset: i64) -> Result<Vec<LogEntry>> {
        let logs = self.inner.logs.read();
        Ok(logs
            .iter()
            .filter(|e| e.job_id == job_id)
            .skip(offset.max(0) as usize)
            .take(limit.max(0) as usize)
            .cloned()
            .collect())
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }

    async fn migrate(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Priority;
    use serde_json::json;

    #[tokio::test]
    async fn test_insert_and_get() {
        let store = MemoryStore::new();
        let job = Job::new("artist-import", "artist.import", json!({"artist_id": "a1"}));
        store.insert_job(&job).await.unwrap();

        let fetched = store.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(fetched.queue_name, "artist-import");
        assert_eq!(fetched.status, JobStatus::Pending);
    }

    #[tokio::test]
    async fn test_claim_orders_by_priority_then_fifo() {
        let store = MemoryStore::new();

        let low = Job::new("q", "t", json!({})).with_priority(Priority::Low);
        let first_normal = Job::new("q", "t", json!({}));
        let second_normal = Job::new("q", "t", json!({}));
        let high = Job::new("q", "t", json!({})).with_priority(Priority::High);

        for job in [&low, &first_normal, &second_normal, &high] {
            store.insert_job(job).await.unwrap();
        }

        let claimed = store.claim_jobs("q", "w1", 10, 60).await.unwrap();
        let ids: Vec<Uuid> = claimed.iter().map(|j| j.id).collect();
        assert_eq!(ids, vec![high.id, first_normal.id, second_normal.id, low.id]);
        assert!(claimed.iter().all(|j| j.status == JobStatus::Active));
        assert!(claimed.iter().all(|j| j.attempts == 1));
    }

    #[tokio::test]
    async fn test_claim_respects_schedule_and_lease() {
        let store = MemoryStore::new();

        let future = Job::new("q", "t", json!({}))
            .with_schedule(Utc::now() + chrono::Duration::minutes(5));
        let ready = Job::new("q", "t", json!({}));
        store.insert_job(&future).await.unwrap();
        store.insert_job(&ready).await.unwrap();

        let claimed = store.claim_jobs("q", "w1", 10, 60).await.unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].id, ready.id);

        // an active job stays claimed
        assert!(store.claim_jobs("q", "w2", 10, 60).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_retry_and_fail_lifecycle() {
        let store = MemoryStore::new();
        let job = Job::new("q", "t", json!({}));
        store.insert_job(&job).await.unwrap();
        store.claim_jobs("q", "w1", 1, 60).await.unwrap();

        store
            .retry_job(job.id, "provider timeout", Utc::now())
            .await
            .unwrap();
        let retried = store.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(retried.status, JobStatus::Pending);
        assert_eq!(retried.last_error.as_deref(), Some("provider timeout"));

        store.claim_jobs("q", "w1", 1, 60).await.unwrap();
        store.fail_job(job.id, "gave up").await.unwrap();
        let failed = store.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(failed.status, JobStatus::Failed);
        assert_eq!(failed.attempts, 2);
        assert!(failed.locked_by.is_none());
    }

    #[tokio::test]
    async fn test_reclaim_stale() {
        let store = MemoryStore::new();
        let job = Job::new("q", "t", json!({}));
        store.insert_job(&job).await.unwrap();

        // a lease that is already expired
        store.claim_jobs("q", "w1", 1, -10).await.unwrap();
        assert_eq!(store.reclaim_stale_jobs(10).await.unwrap(), 1);

        let reclaimed = store.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(reclaimed.status, JobStatus::Pending);
        assert_eq!(reclaimed.attempts, 1);
    }

    #[tokio::test]
    async fn test_queue_counts() {
        let store = MemoryStore::new();
        for _ in 0..3 {
            store
                .insert_job(&Job::new("q", "t", json!({})))
                .await
                .unwrap();
        }
        let claimed = store.claim_jobs("q", "w1", 1, 60).await.unwrap();
        store.complete_job(claimed[0].id).await.unwrap();

        let counts = store.queue_counts("q").await.unwrap();
        assert_eq!(counts.pending, 2);
        assert_eq!(counts.active, 0);
        assert_eq!(counts.completed, 1);
        assert_eq!(counts.failed, 0);
    }

    #[tokio::test]
    async fn test_purge_terminal_only() {
        let store = MemoryStore::new();
        let done = Job::new("q", "t", json!({}));
        let live = Job::new("q", "t", json!({}));
        store.insert_job(&done).await.unwrap();
        store.insert_job(&live).await.unwrap();
        store.claim_jobs("q", "w", 2, 60).await.unwrap();
        store.complete_job(done.id).await.unwrap();

        let purged = store
            .purge_terminal_jobs(Utc::now() + chrono::Duration::seconds(1))
            .await
            .unwrap();
        assert_eq!(purged, 1);
        assert!(store.get_job(done.id).await.unwrap().is_none());
        assert!(store.get_job(live.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_log_sink_roundtrip() {
        let store = MemoryStore::new();
        let job_id = Uuid::now_v7();
        let entries = vec![
            LogEntry::new(job_id, crate::models::LogLevel::Info, "fetch", "started"),
            LogEntry::new(job_id, crate::models::LogLevel::Success, "fetch", "done"),
        ];
        store.append_batch(&entries).await.unwrap();

        let read = store.get_job_logs(job_id, 10, 0).await.unwrap();
        assert_eq!(read.len(), 2);
        assert_eq!(read[1].message, "done");
    }
}
