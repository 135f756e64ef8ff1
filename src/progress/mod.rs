//! Progress bus - pub/sub status store for long-running imports
//!
//! Holds the current stage/percentage/message per subject (an artist being
//! imported, a catalog being synced) and pushes every update to subscribers
//! synchronously, in subscription order. In-memory only: records are not
//! visible across processes without a shared backing store in front.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;
use uuid::Uuid;

/// Stage name reported when a subject finishes successfully
pub const STAGE_COMPLETED: &str = "completed";
/// Stage name reported when a subject gives up
pub const STAGE_FAILED: &str = "failed";

/// Whether a stage ends the subject's lifecycle
pub fn is_terminal_stage(stage: &str) -> bool {
    stage == STAGE_COMPLETED || stage == STAGE_FAILED
}

/// Current status of one subject
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressRecord {
    pub subject_id: String,
    pub stage: String,
    /// 0-100, non-decreasing within one lifecycle
    pub percentage: u8,
    pub message: String,
    pub metadata: Option<serde_json::Value>,
    /// Job driving the current lifecycle; a report with a different job id
    /// starts a new lifecycle and may reset the percentage
    pub job_id: Option<Uuid>,
    pub updated_at: DateTime<Utc>,
}

/// Listener invoked synchronously on every report for its subject
pub type ProgressListener = Arc<dyn Fn(&ProgressRecord) + Send + Sync>;

/// Token returned by `on_progress`, used to unsubscribe
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriptionId(u64);

struct StoredRecord {
    record: ProgressRecord,
    terminal_at: Option<Instant>,
}

/// Publish/subscribe status store keyed by subject id
pub struct ProgressBus {
    records: DashMap<String, StoredRecord>,
    listeners: DashMap<String, Vec<(u64, ProgressListener)>>,
    next_subscription: AtomicU64,
    grace: Duration,
}

impl ProgressBus {
    pub fn new() -> Self {
        Self::with_grace(Duration::from_secs(300))
    }

    /// Grace period during which terminal records stay readable
    pub fn with_grace(grace: Duration) -> Self {
        Self {
            records: DashMap::new(),
            listeners: DashMap::new(),
            next_subscription: AtomicU64::new(1),
            grace,
        }
    }

    /// Update a subject's status and notify its subscribers
    pub fn report(
        &self,
        subject_id: impl Into<String>,
        stage: impl Into<String>,
        percentage: u8,
        message: impl Into<String>,
    ) {
        self.report_with(subject_id, stage, percentage, message, None, None)
    }

    /// Like [`report`](Self::report), carrying metadata and the driving job id
    pub fn report_with(
        &self,
        subject_id: impl Into<String>,
        stage: impl Into<String>,
        percentage: u8,
        message: impl Into<String>,
        metadata: Option<serde_json::Value>,
        job_id: Option<Uuid>,
    ) {
        let subject_id = subject_id.into();
        let stage = stage.into();
        let mut record = ProgressRecord {
            subject_id: subject_id.clone(),
            stage,
            percentage: percentage.min(100),
            message: message.into(),
            metadata,
            job_id,
            updated_at: Utc::now(),
        };

        {
            let mut entry = self
                .records
                .entry(subject_id.clone())
                .or_insert_with(|| StoredRecord {
                    record: record.clone(),
                    terminal_at: None,
                });

            // only a report carrying a *different* job id starts a new
            // lifecycle; reports without one continue whatever is running
            let same_lifecycle = match (entry.record.job_id, record.job_id) {
                (Some(old), Some(new)) => old == new,
                _ => true,
            };
            if same_lifecycle {
                record.percentage = record.percentage.max(entry.record.percentage);
                if record.job_id.is_none() {
                    record.job_id = entry.record.job_id;
                }
            }

            entry.terminal_at = if is_terminal_stage(&record.stage) {
                Some(Instant::now())
            } else {
                None
            };
            entry.record = record.clone();
        }

        debug!(
            subject_id = %record.subject_id,
            stage = %record.stage,
            percentage = record.percentage,
            "Progress reported"
        );

        // Clone the listener list so a callback can subscribe/unsubscribe
        // without deadlocking against the shard lock.
        let to_notify: Vec<ProgressListener> = self
            .listeners
            .get(&subject_id)
            .map(|l| l.iter().map(|(_, cb)| cb.clone()).collect())
            .unwrap_or_default();

        for listener in to_notify {
            listener(&record);
        }
    }

    /// Current record for a subject, if any
    pub fn get_status(&self, subject_id: &str) -> Option<ProgressRecord> {
        self.records.get(subject_id).map(|e| e.record.clone())
    }

    /// Subscribe to a subject's updates; notification order is subscription
    /// order
    pub fn on_progress(
        &self,
        subject_id: impl Into<String>,
        listener: impl Fn(&ProgressRecord) + Send + Sync + 'static,
    ) -> SubscriptionId {
        let id = self.next_subscription.fetch_add(1, Ordering::Relaxed);
        self.listeners
            .entry(subject_id.into())
            .or_default()
            .push((id, Arc::new(listener)));
        SubscriptionId(id)
    }

    /// Remove a subscription
    pub fn off_progress(&self, subject_id: &str, subscription: SubscriptionId) {
        if let Some(mut listeners) = self.listeners.get_mut(subject_id) {
            listeners.retain(|(id, _)| *id != subscription.0);
        }
    }

    /// Evict a subject immediately
    pub fn clear(&self, subject_id: &str) {
        self.records.remove(subject_id);
    }

    /// Evict terminal records past the grace period; returns how many
    pub fn sweep_expired(&self) -> usize {
        let before = self.records.len();
        self.records.retain(|_, stored| {
            stored
                .terminal_at
                .map(|t| t.elapsed() < self.grace)
                .unwrap_or(true)
        });
        before - self.records.len()
    }

    /// Number of subjects currently tracked
    pub fn subject_count(&self) -> usize {
        self.records.len()
    }
}

impl Default for ProgressBus {
    fn default() -> Self {
        Self::new()
    }
}
