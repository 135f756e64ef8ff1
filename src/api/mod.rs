//! HTTP boundaries for the import core
//!
//! Exactly the surfaces outer layers consume: job submission, job/progress
//! reads, queue health, and a liveness check. Page routing, auth and UI
//! rendering live elsewhere.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

use crate::error::EncoreError;
use crate::models::{Job, LogEntry, Priority};
use crate::progress::ProgressRecord;
use crate::queue::{JobOptions, QueueManager, QueueMetrics};
use crate::store::JobStore;

/// Application state shared across handlers
pub struct AppState<S: JobStore> {
    pub manager: Arc<QueueManager<S>>,
}

/// Create the API router
pub fn router<S: JobStore>(state: Arc<AppState<S>>) -> Router {
    Router::new()
        // Jobs
        .route("/jobs", post(submit_job::<S>))
        .route("/jobs/:id", get(get_job::<S>))
        .route("/jobs/:id/logs", get(get_job_logs::<S>))
        // Progress
        .route("/progress/:subject_id", get(get_progress::<S>))
        // Queue health
        .route("/queues/stats", get(all_queue_stats::<S>))
        .route("/queues/:name/metrics", get(queue_metrics::<S>))
        // Health
        .route("/health", get(health_check::<S>))
        .with_state(state)
}

// === Request/Response types ===

#[derive(Debug, Deserialize)]
pub struct SubmitJobRequest {
    pub queue: String,
    pub job_type: String,
    pub payload: serde_json::Value,
    pub priority: Option<Priority>,
    pub max_attempts: Option<i32>,
    pub scheduled_for: Option<DateTime<Utc>>,
    pub subject_id: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct JobResponse {
    pub id: Uuid,
    pub queue: String,
    pub job_type: String,
    pub priority: String,
    pub status: String,
    pub attempts: i32,
    pub max_attempts: i32,
    pub last_error: Option<String>,
    pub subject_id: Option<String>,
    pub scheduled_for: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl From<Job> for JobResponse {
    fn from(j: Job) -> Self {
        Self {
            id: j.id,
            queue: j.queue_name,
            job_type: j.job_type,
            priority: j.priority.as_str().to_string(),
            status: j.status.as_str().to_string(),
            attempts: j.attempts,
            max_attempts: j.max_attempts,
            last_error: j.last_error,
            subject_id: j.subject_id,
            scheduled_for: j.scheduled_for.map(|t| t.to_rfc3339()),
            created_at: j.created_at.to_rfc3339(),
            updated_at: j.updated_at.to_rfc3339(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ProgressResponse {
    pub subject_id: String,
    pub stage: String,
    pub percentage: u8,
    pub message: String,
    pub metadata: Option<serde_json::Value>,
    pub updated_at: String,
}

impl From<ProgressRecord> for ProgressResponse {
    fn from(r: ProgressRecord) -> Self {
        Self {
            subject_id: r.subject_id,
            stage: r.stage,
            percentage: r.percentage,
            message: r.message,
            metadata: r.metadata,
            updated_at: r.updated_at.to_rfc3339(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct PaginationQuery {
    #[serde(default = "default_limit")]
    pub limit: i64,
    #[serde(default)]
    pub offset: i64,
}

fn default_limit() -> i64 {
    50
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub database: String,
}

// === Handlers ===

async fn submit_job<S: JobStore>(
    State(state): State<Arc<AppState<S>>>,
    Json(req): Json<SubmitJobRequest>,
) -> Result<Json<JobResponse>, AppError> {
    let mut options = JobOptions::new();
    if let Some(priority) = req.priority {
        options = options.priority(priority);
    }
    if let Some(max) = req.max_attempts {
        options = options.max_attempts(max);
    }
    if let Some(at) = req.scheduled_for {
        options = options.scheduled_for(at);
    }
    if let Some(subject) = req.subject_id {
        options = options.subject(subject);
    }

    let job = state
        .manager
        .add_job(&req.queue, &req.job_type, req.payload, options)
        .await?;
    Ok(Json(job.into()))
}

async fn get_job<S: JobStore>(
    State(state): State<Arc<AppState<S>>>,
    Path(id): Path<Uuid>,
) -> Result<Json<JobResponse>, AppError> {
    let job = state
        .manager
        .store()
        .get_job(id)
        .await?
        .ok_or(EncoreError::JobNotFound { id })?;
    Ok(Json(job.into()))
}

async fn get_job_logs<S: JobStore>(
    State(state): State<Arc<AppState<S>>>,
    Path(id): Path<Uuid>,
    Query(page): Query<PaginationQuery>,
) -> Result<Json<Vec<LogEntry>>, AppError> {
    let logs = state
        .manager
        .store()
        .get_job_logs(id, page.limit, page.offset)
        .await?;
    Ok(Json(logs))
}

async fn get_progress<S: JobStore>(
    State(state): State<Arc<AppState<S>>>,
    Path(subject_id): Path<String>,
) -> Result<Json<ProgressResponse>, AppError> {
    match state.manager.progress().get_status(&subject_id) {
        Some(record) => Ok(Json(record.into())),
        None => Err(AppError::not_found(format!(
            "No progress for subject {subject_id}"
        ))),
    }
}

async fn all_queue_stats<S: JobStore>(
    State(state): State<Arc<AppState<S>>>,
) -> Result<Json<HashMap<String, QueueMetrics>>, AppError> {
    let stats = state.manager.get_all_queue_stats().await?;
    Ok(Json(stats))
}

async fn queue_metrics<S: JobStore>(
    State(state): State<Arc<AppState<S>>>,
    Path(name): Path<String>,
) -> Result<Json<QueueMetrics>, AppError> {
    let metrics = state.manager.get_queue_metrics(&name).await?;
    Ok(Json(metrics))
}

async fn health_check<S: JobStore>(
    State(state): State<Arc<AppState<S>>>,
) -> Result<Json<HealthResponse>, AppError> {
    let database = match state.manager.store().ping().await {
        Ok(()) => "ok".to_string(),
        Err(e) => e.to_string(),
    };
    Ok(Json(HealthResponse {
        status: "ok".to_string(),
        database,
    }))
}

// === Error handling ===

pub struct AppError {
    error: EncoreError,
    status: Option<StatusCode>,
}

impl AppError {
    fn not_found(message: impl Into<String>) -> Self {
        Self {
            error: EncoreError::Internal(message.into()),
            status: Some(StatusCode::NOT_FOUND),
        }
    }
}

impl From<EncoreError> for AppError {
    fn from(error: EncoreError) -> Self {
        Self {
            error,
            status: None,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        let (status, message) = match (&self.error, self.status) {
            (error, Some(status)) => (status, error.to_string()),
            (EncoreError::JobNotFound { .. } | EncoreError::QueueNotFound { .. }, _) => {
                (StatusCode::NOT_FOUND, self.error.to_string())
            }
            (
                EncoreError::InvalidArgument(_)
                | EncoreError::UnknownJobType { .. }
                | EncoreError::Serialization(_),
                _,
            ) => (StatusCode::BAD_REQUEST, self.error.to_string()),
            (EncoreError::CircuitOpen { .. }, _) => {
                (StatusCode::SERVICE_UNAVAILABLE, self.error.to_string())
            }
            _ => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Internal server error".to_string(),
            ),
        };

        let body = serde_json::json!({ "error": message });
        (status, Json(body)).into_response()
    }
}
