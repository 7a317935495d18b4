//! Error types for intake.

use thiserror::Error;
use uuid::Uuid;

use crate::models::ItemStatus;

/// Result type alias using intake's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type for intake operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Database operation failed (wraps sqlx::Error)
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Resource not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Item not found
    #[error("Item not found: {0}")]
    ItemNotFound(Uuid),

    /// Job enqueued against an item that does not exist
    #[error("Invalid target: item {0} does not exist")]
    InvalidTarget(Uuid),

    /// The caller no longer owns the lease on this job
    #[error("Lease lost for job {job_id}")]
    LeaseLost { job_id: Uuid },

    /// Lifecycle transition not allowed from the current status
    #[error("Invalid transition from {from}: {trigger}")]
    InvalidTransition { from: ItemStatus, trigger: String },

    /// Inference/generation failed
    #[error("Inference error: {0}")]
    Inference(String),

    /// Collaborator answered but the payload did not match the expected schema
    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    /// Job queue error
    #[error("Job error: {0}")]
    Job(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// HTTP/network request failed
    #[error("Request error: {0}")]
    Request(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),

    /// Forbidden (item belongs to another owner)
    #[error("Forbidden: {0}")]
    Forbidden(String),

    /// File I/O operation failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// True when the error means another worker now owns the job.
    pub fn is_lease_lost(&self) -> bool {
        matches!(self, Error::LeaseLost { .. })
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        Error::Request(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_not_found() {
        let err = Error::NotFound("test resource".to_string());
        assert_eq!(err.to_string(), "Not found: test resource");
    }

    #[test]
    fn test_error_display_item_not_found() {
        let id = Uuid::nil();
        let err = Error::ItemNotFound(id);
        assert_eq!(err.to_string(), format!("Item not found: {}", id));
    }

    #[test]
    fn test_error_display_invalid_target() {
        let id = Uuid::nil();
        let err = Error::InvalidTarget(id);
        assert_eq!(
            err.to_string(),
            format!("Invalid target: item {} does not exist", id)
        );
    }

    #[test]
    fn test_error_display_lease_lost() {
        let job_id = Uuid::nil();
        let err = Error::LeaseLost { job_id };
        assert_eq!(err.to_string(), format!("Lease lost for job {}", job_id));
        assert!(err.is_lease_lost());
    }

    #[test]
    fn test_error_display_invalid_transition() {
        let err = Error::InvalidTransition {
            from: ItemStatus::Processed,
            trigger: "dismiss".to_string(),
        };
        assert_eq!(err.to_string(), "Invalid transition from processed: dismiss");
        assert!(!err.is_lease_lost());
    }

    #[test]
    fn test_error_display_inference() {
        let err = Error::Inference("model unavailable".to_string());
        assert_eq!(err.to_string(), "Inference error: model unavailable");
    }

    #[test]
    fn test_error_display_invalid_response() {
        let err = Error::InvalidResponse("missing overview".to_string());
        assert_eq!(err.to_string(), "Invalid response: missing overview");
    }

    #[test]
    fn test_error_display_config() {
        let err = Error::Config("missing env var".to_string());
        assert_eq!(err.to_string(), "Configuration error: missing env var");
    }

    #[test]
    fn test_error_display_forbidden() {
        let err = Error::Forbidden("not your item".to_string());
        assert_eq!(err.to_string(), "Forbidden: not your item");
    }

    #[test]
    fn test_error_from_serde_json() {
        let json_err = serde_json::from_str::<serde_json::Value>("{invalid").unwrap_err();
        let err: Error = json_err.into();
        assert!(matches!(err, Error::Serialization(_)));
    }

    #[test]
    fn test_error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file missing");
        let err: Error = io_err.into();
        assert!(matches!(err, Error::Io(_)));
        assert!(err.to_string().contains("file missing"));
    }

    #[test]
    fn test_error_debug_format() {
        let err = Error::Job("lease expired".to_string());
        let debug_str = format!("{:?}", err);
        assert!(debug_str.contains("Job"));
        assert!(debug_str.contains("lease expired"));
    }
}
