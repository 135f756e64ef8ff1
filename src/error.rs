//! Error types for the import core

use std::time::Duration;
use thiserror::Error;

/// Core error type for import/orchestration operations
#[derive(Error, Debug)]
pub enum EncoreError {
    /// Database operation failed
    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    /// Bad configuration or bad call arguments, fatal at construction
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// A protected dependency is suspected unhealthy; call was not attempted
    #[error("Circuit open, retry in {retry_in:?}")]
    CircuitOpen { retry_in: Duration },

    /// An operation failed on every attempt of its retry budget
    #[error("Exhausted {attempts} attempts: {source}")]
    ExhaustedRetries {
        attempts: u32,
        #[source]
        source: Box<EncoreError>,
    },

    /// A job consumed its full attempt budget and is terminally failed
    #[error("Job {id} reached max attempts ({attempts})")]
    MaxAttemptsReached { id: uuid::Uuid, attempts: i32 },

    /// Job not found
    #[error("Job not found: {id}")]
    JobNotFound { id: uuid::Uuid },

    /// Queue name not registered with the manager
    #[error("Queue not registered: {name}")]
    QueueNotFound { name: String },

    /// Job type has no registered handler
    #[error("No handler registered for job type: {job_type}")]
    UnknownJobType { job_type: String },

    /// A single operation failed but may succeed on retry
    #[error("Transient failure: {0}")]
    Transient(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Timeout
    #[error("Operation timed out")]
    Timeout,

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl EncoreError {
    /// Whether a failure is worth another attempt at the job level.
    ///
    /// CircuitOpen counts as retriable: the job-level reschedule lands after
    /// the circuit's recovery window, which is exactly when a retry can win.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            Self::Transient(_)
                | Self::CircuitOpen { .. }
                | Self::Timeout
                | Self::Database(DatabaseError::Connection(_))
        )
    }
}

/// Database-specific errors
#[derive(Error, Debug)]
pub enum DatabaseError {
    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Constraint violation: {0}")]
    Constraint(String),

    #[error("Not found")]
    NotFound,

    #[error("Conflict: {0}")]
    Conflict(String),
}

impl From<sqlx::Error> for DatabaseError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => Self::NotFound,
            sqlx::Error::Database(db_err) => {
                let code = db_err.code().map(|c| c.to_string()).unwrap_or_default();
                // PostgreSQL 23xxx / SQLite 1555+2067 unique-constraint codes
                if code.starts_with("23") || code == "1555" || code == "2067" {
                    Self::Constraint(db_err.message().to_string())
                } else {
                    Self::Query(db_err.message().to_string())
                }
            }
            sqlx::Error::PoolTimedOut => Self::Connection("Pool timeout".to_string()),
            _ => Self::Query(err.to_string()),
        }
    }
}

impl From<sqlx::Error> for EncoreError {
    fn from(err: sqlx::Error) -> Self {
        Self::Database(err.into())
    }
}

/// Result type alias for import core operations
pub type Result<T> = std::result::Result<T, EncoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retriable_classification() {
        assert!(EncoreError::Transient("503".into()).is_retriable());
        assert!(EncoreError::CircuitOpen {
            retry_in: Duration::from_secs(30)
        }
        .is_retriable());
        assert!(EncoreError::Timeout.is_retriable());
        assert!(!EncoreError::InvalidArgument("bad".into()).is_retriable());
        assert!(!EncoreError::UnknownJobType {
            job_type: "x".into()
        }
        .is_retriable());
    }

    #[test]
    fn test_exhausted_retries_preserves_cause() {
        let err = EncoreError::ExhaustedRetries {
            attempts: 3,
            source: Box::new(EncoreError::Transient("connection reset".into())),
        };
        let message = err.to_string();
        assert!(message.contains("3 attempts"));
        assert!(std::error::Error::source(&err).is_some());
    }
}
