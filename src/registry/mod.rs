//! Job registry - maps job types to their handlers
//!
//! Payloads are validated against the handler at enqueue time, so a bad
//! submission fails at the boundary instead of inside a worker.

use async_trait::async_trait;
use dashmap::DashMap;
use serde::de::DeserializeOwned;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tracing::info;

use crate::error::{EncoreError, Result};
use crate::models::Job;
use crate::queue::JobContext;

/// Job handler trait - implement this to define what a job type does
#[async_trait]
pub trait JobHandler: Send + Sync {
    /// Execute the job with its context
    async fn execute(&self, job: Job, ctx: JobContext) -> Result<()>;

    /// Check a payload at enqueue time; the default accepts anything
    fn validate_payload(&self, payload: &serde_json::Value) -> Result<()> {
        let _ = payload;
        Ok(())
    }
}

type BoxedRun = Pin<Box<dyn Future<Output = Result<()>> + Send>>;

/// Handler that deserializes the payload into a concrete type up front.
///
/// Both execution and enqueue-time validation go through the same serde
/// round-trip, so a job that enqueues successfully will parse in the worker.
pub struct TypedJobHandler<P, F>
where
    P: DeserializeOwned + Send + 'static,
    F: Fn(P, Job, JobContext) -> BoxedRun + Send + Sync,
{
    func: F,
    _marker: std::marker::PhantomData<fn(P)>,
}

impl<P, F> TypedJobHandler<P, F>
where
    P: DeserializeOwned + Send + 'static,
    F: Fn(P, Job, JobContext) -> BoxedRun + Send + Sync,
{
    pub fn new(func: F) -> Self {
        Self {
            func,
            _marker: std::marker::PhantomData,
        }
    }
}

#[async_trait]
impl<P, F> JobHandler for TypedJobHandler<P, F>
where
    P: DeserializeOwned + Send + 'static,
    F: Fn(P, Job, JobContext) -> BoxedRun + Send + Sync,
{
    async fn execute(&self, job: Job, ctx: JobContext) -> Result<()> {
        let payload: P = serde_json::from_value(job.payload.clone())
            .map_err(|e| EncoreError::InvalidArgument(format!("Payload mismatch: {e}")))?;
        (self.func)(payload, job, ctx).await
    }

    fn validate_payload(&self, payload: &serde_json::Value) -> Result<()> {
        serde_json::from_value::<P>(payload.clone())
            .map(|_| ())
            .map_err(|e| EncoreError::InvalidArgument(format!("Payload mismatch: {e}")))
    }
}

/// Registry of job types and their handlers
pub struct JobRegistry {
    handlers: DashMap<String, Arc<dyn JobHandler>>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self {
            handlers: DashMap::new(),
        }
    }

    /// Register a handler for a job type
    pub fn register<H: JobHandler + 'static>(&self, job_type: impl Into<String>, handler: H) -> &Self {
        let job_type = job_type.into();
        self.handlers.insert(job_type.clone(), Arc::new(handler));
        info!(job_type = %job_type, "Registered job handler");
        self
    }

    /// Register a typed closure handler for a job type
    pub fn register_fn<P, F>(&self, job_type: impl Into<String>, func: F) -> &Self
    where
        P: DeserializeOwned + Send + 'static,
        F: Fn(P, Job, JobContext) -> BoxedRun + Send + Sync + 'static,
    {
        self.register(job_type, TypedJobHandler::new(func))
    }

    /// Get the handler for a job type
    pub fn get(&self, job_type: &str) -> Option<Arc<dyn JobHandler>> {
        self.handlers.get(job_type).map(|h| h.clone())
    }

    /// Whether a job type has a handler
    pub fn contains(&self, job_type: &str) -> bool {
        self.handlers.contains_key(job_type)
    }

    /// All registered job types
    pub fn job_types(&self) -> Vec<String> {
        self.handlers.iter().map(|e| e.key().clone()).collect()
    }

    /// Enqueue-time validation: the type must be registered and the payload
    /// must satisfy its handler
    pub fn validate(&self, job_type: &str, payload: &serde_json::Value) -> Result<()> {
        match self.get(job_type) {
            Some(handler) => handler.validate_payload(payload),
            None => Err(EncoreError::UnknownJobType {
                job_type: job_type.to_string(),
            }),
        }
    }
}

impl Default for JobRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Deserialize)]
    struct ImportPayload {
        artist_id: String,
    }

    fn registry_with_typed_handler() -> JobRegistry {
        let registry = JobRegistry::new();
        registry.register_fn("artist.import", |payload: ImportPayload, _job, _ctx| {
            Box::pin(async move {
                assert!(!payload.artist_id.is_empty());
                Ok(())
            })
        });
        registry
    }

    #[test]
    fn test_register_and_lookup() {
        let registry = registry_with_typed_handler();
        assert!(registry.contains("artist.import"));
        assert!(registry.get("artist.import").is_some());
        assert!(registry.get("show.import").is_none());
        assert_eq!(registry.job_types(), vec!["artist.import".to_string()]);
    }

    #[test]
    fn test_validate_unknown_type() {
        let registry = JobRegistry::new();
        let err = registry
            .validate("nope", &serde_json::json!({}))
            .unwrap_err();
        assert!(matches!(err, EncoreError::UnknownJobType { .. }));
    }

    #[test]
    fn test_validate_payload_shape() {
        let registry = registry_with_typed_handler();

        assert!(registry
            .validate("artist.import", &serde_json::json!({"artist_id": "a1"}))
            .is_ok());

        let err = registry
            .validate("artist.import", &serde_json::json!({"wrong": true}))
            .unwrap_err();
        assert!(matches!(err, EncoreError::InvalidArgument(_)));
    }
}
