//! Domain models for the setlist import core

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Status of a queued job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting to be claimed by a worker
    Pending,
    /// Currently executing
    Active,
    /// Successfully completed
    Completed,
    /// Failed after all attempts exhausted
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Active => "active",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "active" => Some(Self::Active),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// Priority levels within a queue (higher value claims first)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Critical,
    High,
    Normal,
    Low,
}

impl Priority {
    /// Stable integer encoding used for ordering in the store
    pub fn as_i32(&self) -> i32 {
        match self {
            Self::Critical => 100,
            Self::High => 75,
            Self::Normal => 50,
            Self::Low => 25,
        }
    }

    pub fn from_i32(v: i32) -> Option<Self> {
        match v {
            100 => Some(Self::Critical),
            75 => Some(Self::High),
            50 => Some(Self::Normal),
            25 => Some(Self::Low),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Critical => "critical",
            Self::High => "high",
            Self::Normal => "normal",
            Self::Low => "low",
        }
    }
}

impl Default for Priority {
    fn default() -> Self {
        Self::Normal
    }
}

/// A persisted unit of work, owned exclusively by the queue manager
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    /// Unique job ID (UUIDv7 for time-ordering)
    pub id: Uuid,
    /// Name of the queue this job belongs to
    pub queue_name: String,
    /// Job type, resolved to a handler through the registry
    pub job_type: String,
    /// Priority within the queue
    pub priority: Priority,
    /// Handler payload
    pub payload: serde_json::Value,
    /// Current status
    pub status: JobStatus,
    /// Attempts consumed so far (incremented at claim)
    pub attempts: i32,
    /// Maximum attempts before the job fails terminally
    pub max_attempts: i32,
    /// Error message from the most recent failed attempt
    pub last_error: Option<String>,
    /// Progress bus subject this job reports under, if any
    pub subject_id: Option<String>,
    /// Earliest time a worker may claim this job
    pub scheduled_for: Option<DateTime<Utc>>,
    /// Claim lease expiration (for multi-process workers)
    pub locked_until: Option<DateTime<Utc>>,
    /// Worker ID that holds the claim lease
    pub locked_by: Option<String>,
    /// When the job was created
    pub created_at: DateTime<Utc>,
    /// When the job was last mutated
    pub updated_at: DateTime<Utc>,
}

impl Job {
    pub fn new(
        queue_name: impl Into<String>,
        job_type: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::now_v7(),
            queue_name: queue_name.into(),
            job_type: job_type.into(),
            priority: Priority::Normal,
            payload,
            status: JobStatus::Pending,
            attempts: 0,
            max_attempts: 3,
            last_error: None,
            subject_id: None,
            scheduled_for: None,
            locked_until: None,
            locked_by: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_max_attempts(mut self, max: i32) -> Self {
        self.max_attempts = max;
        self
    }

    pub fn with_subject(mut self, subject_id: impl Into<String>) -> Self {
        self.subject_id = Some(subject_id.into());
        self
    }

    pub fn with_schedule(mut self, scheduled_for: DateTime<Utc>) -> Self {
        self.scheduled_for = Some(scheduled_for);
        self
    }

    pub fn can_retry(&self) -> bool {
        self.attempts < self.max_attempts && !self.status.is_terminal()
    }
}

/// Static configuration for one named queue, immutable after registration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueDescriptor {
    /// Queue name (e.g. "artist-import", "show-import", "catalog-sync")
    pub name: String,
    /// Maximum jobs this queue's worker pool runs concurrently
    pub concurrency_limit: usize,
    /// Priorities accepted at enqueue
    pub priority_levels: Vec<Priority>,
    /// Attempt budget applied when the submitter does not choose one
    pub default_max_attempts: i32,
}

impl QueueDescriptor {
    pub fn new(name: impl Into<String>, concurrency_limit: usize) -> Self {
        Self {
            name: name.into(),
            concurrency_limit,
            priority_levels: vec![
                Priority::Critical,
                Priority::High,
                Priority::Normal,
                Priority::Low,
            ],
            default_max_attempts: 3,
        }
    }

    pub fn priorities(mut self, levels: Vec<Priority>) -> Self {
        self.priority_levels = levels;
        self
    }

    pub fn max_attempts(mut self, max: i32) -> Self {
        self.default_max_attempts = max;
        self
    }

    pub fn accepts_priority(&self, priority: Priority) -> bool {
        self.priority_levels.contains(&priority)
    }
}

/// Severity of a structured log entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Info,
    Warning,
    Error,
    Success,
    Debug,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Error => "error",
            Self::Success => "success",
            Self::Debug => "debug",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "info" => Some(Self::Info),
            "warning" => Some(Self::Warning),
            "error" => Some(Self::Error),
            "success" => Some(Self::Success),
            "debug" => Some(Self::Debug),
            _ => None,
        }
    }
}

/// A structured log entry produced during job execution
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    /// Job this entry belongs to
    pub job_id: Uuid,
    /// Severity
    pub level: LogLevel,
    /// Pipeline stage the entry was emitted from
    pub stage: String,
    /// Human-readable message
    pub message: String,
    /// Arbitrary structured details
    pub details: Option<serde_json::Value>,
    /// Items processed so far, for fan-out stages
    pub items_processed: Option<i64>,
    /// Total items expected, for fan-out stages
    pub items_total: Option<i64>,
    /// Duration of the logged operation
    pub duration_ms: Option<i64>,
    /// Machine-readable error code, if the entry records a failure
    pub error_code: Option<String>,
    /// Rendered error chain, if the entry records a failure
    pub error_stack: Option<String>,
    /// When the entry was produced
    pub timestamp: DateTime<Utc>,
}

impl LogEntry {
    pub fn new(
        job_id: Uuid,
        level: LogLevel,
        stage: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            job_id,
            level,
            stage: stage.into(),
            message: message.into(),
            details: None,
            items_processed: None,
            items_total: None,
            duration_ms: None,
            error_code: None,
            error_stack: None,
            timestamp: Utc::now(),
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn with_progress(mut self, processed: i64, total: i64) -> Self {
        self.items_processed = Some(processed);
        self.items_total = Some(total);
        self
    }

    pub fn with_duration(mut self, duration_ms: i64) -> Self {
        self.duration_ms = Some(duration_ms);
        self
    }

    pub fn with_error_code(mut self, code: impl Into<String>) -> Self {
        self.error_code = Some(code.into());
        self
    }

    /// Record the full error chain of a failure
    pub fn with_error(mut self, error: &(dyn std::error::Error + 'static)) -> Self {
        let mut rendered = error.to_string();
        let mut source = error.source();
        while let Some(cause) = source {
            rendered.push_str(&format!("\ncaused by: {cause}"));
            source = cause.source();
        }
        self.error_stack = Some(rendered);
        self
    }
}

/// Per-queue job counts, the health boundary's unit of reporting
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueueCounts {
    pub pending: u64,
    pub active: u64,
    pub completed: u64,
    pub failed: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_status_roundtrip() {
        for status in [
            JobStatus::Pending,
            JobStatus::Active,
            JobStatus::Completed,
            JobStatus::Failed,
        ] {
            assert_eq!(JobStatus::from_str(status.as_str()), Some(status));
        }
    }

    #[test]
    fn test_priority_ordering() {
        assert!(Priority::Critical.as_i32() > Priority::High.as_i32());
        assert!(Priority::High.as_i32() > Priority::Normal.as_i32());
        assert!(Priority::Normal.as_i32() > Priority::Low.as_i32());
        assert_eq!(Priority::from_i32(75), Some(Priority::High));
        assert_eq!(Priority::from_i32(42), None);
    }

    #[test]
    fn test_job_builder() {
        let job = Job::new("artist-import", "artist.import", serde_json::json!({"artist_id": "a1"}))
            .with_priority(Priority::High)
            .with_max_attempts(5)
            .with_subject("artist-a1");

        assert_eq!(job.queue_name, "artist-import");
        assert_eq!(job.priority, Priority::High);
        assert_eq!(job.max_attempts, 5);
        assert_eq!(job.subject_id, Some("artist-a1".to_string()));
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.attempts, 0);
    }

    #[test]
    fn test_job_retry_logic() {
        let mut job = Job::new("q", "t", serde_json::json!({})).with_max_attempts(3);

        assert!(job.can_retry());

        job.attempts = 3;
        assert!(!job.can_retry());

        job.attempts = 1;
        job.status = JobStatus::Completed;
        assert!(!job.can_retry());
    }

    #[test]
    fn test_queue_descriptor_priority_policy() {
        let desc = QueueDescriptor::new("catalog-sync", 4)
            .priorities(vec![Priority::Normal, Priority::Low]);

        assert!(desc.accepts_priority(Priority::Normal));
        assert!(!desc.accepts_priority(Priority::Critical));
    }

    #[test]
    fn test_log_entry_builder() {
        let entry = LogEntry::new(Uuid::now_v7(), LogLevel::Info, "fetch-shows", "page 3 done")
            .with_progress(30, 120)
            .with_duration(412);

        assert_eq!(entry.items_processed, Some(30));
        assert_eq!(entry.items_total, Some(120));
        assert_eq!(entry.duration_ms, Some(412));
        assert!(entry.error_code.is_none());
        assert!(entry.error_stack.is_none());
    }

    #[test]
    fn test_log_entry_error_chain() {
        let cause = crate::error::EncoreError::ExhaustedRetries {
            attempts: 3,
            source: Box::new(crate::error::EncoreError::Transient("socket reset".into())),
        };
        let entry = LogEntry::new(Uuid::now_v7(), LogLevel::Error, "fetch-shows", "gave up")
            .with_error(&cause);

        let stack = entry.error_stack.unwrap();
        assert!(stack.contains("Exhausted 3 attempts"));
        assert!(stack.contains("caused by: Transient failure: socket reset"));
    }
}
