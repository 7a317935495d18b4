//! OpenAI-specific error handling.

use intake_core::Error;

/// OpenAI-specific error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenAIErrorCode {
    /// Invalid authentication credentials.
    AuthenticationError,
    /// Account out of credits (OpenRouter).
    PaymentRequired,
    /// Rate limit exceeded.
    RateLimitExceeded,
    /// Model not found or not available.
    ModelNotFound,
    /// Request too large.
    ContextLengthExceeded,
    /// Server error.
    ServerError,
    /// Unknown error.
    Unknown,
}

impl OpenAIErrorCode {
    /// Determine error code from HTTP status and error type.
    pub fn from_response(status: u16, error_type: &str) -> Self {
        match (status, error_type) {
            (401, _) => Self::AuthenticationError,
            (402, _) => Self::PaymentRequired,
            (429, _) => Self::RateLimitExceeded,
            (404, _) | (_, "model_not_found") => Self::ModelNotFound,
            (400, _) if error_type.contains("context_length") => Self::ContextLengthExceeded,
            (500..=599, _) => Self::ServerError,
            _ => Self::Unknown,
        }
    }

    /// Check if this error is worth retrying later.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::RateLimitExceeded | Self::ServerError)
    }
}

/// Convert an OpenAI error to an intake Error.
pub fn to_intake_error(code: OpenAIErrorCode, message: &str) -> Error {
    match code {
        OpenAIErrorCode::AuthenticationError => {
            Error::Config(format!("Authentication failed: {message}"))
        }
        OpenAIErrorCode::PaymentRequired => {
            Error::Config(format!("Insufficient credits: {message}"))
        }
        OpenAIErrorCode::RateLimitExceeded => {
            Error::Inference(format!("Rate limit exceeded: {message}"))
        }
        OpenAIErrorCode::ModelNotFound => Error::Config(format!("Model not found: {message}")),
        OpenAIErrorCode::ContextLengthExceeded => {
            Error::Inference(format!("Context too long: {message}"))
        }
        OpenAIErrorCode::ServerError => Error::Inference(format!("Server error: {message}")),
        OpenAIErrorCode::Unknown => Error::Inference(message.to_string()),
    }
}
