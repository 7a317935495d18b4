//! OpenAI-compatible collaborator backend.
//!
//! Works with any endpoint that speaks the chat completions API with JSON
//! response mode. The default base URL points at OpenRouter; set
//! `OPENAI_BASE_URL` for OpenAI itself, Ollama, vLLM or LM Studio.
//!
//! # Example
//!
//! ```rust,no_run
//! use intake_inference::openai::{OpenAIBackend, OpenAIConfig};
//!
//! let backend = OpenAIBackend::from_env().unwrap();
//!
//! let config = OpenAIConfig {
//!     base_url: "http://localhost:11434/v1".to_string(),
//!     gen_model: "llama3".to_string(),
//!     ..Default::default()
//! };
//! let local = OpenAIBackend::new(config).unwrap();
//! ```

mod backend;
mod error;
mod types;

pub use backend::{
    OpenAIBackend, OpenAIConfig, DEFAULT_GEN_MODEL, DEFAULT_OPENAI_URL, DEFAULT_TIMEOUT_SECS,
};
pub use error::{to_intake_error, OpenAIErrorCode};
pub use types::*;
