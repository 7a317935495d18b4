//! # intake-inference
//!
//! Model-backed collaborators for intake.
//!
//! This crate provides:
//! - An OpenAI-compatible backend (OpenRouter by default) implementing the
//!   classification, title normalization and follow-up collaborator traits
//! - Prompt loading with per-deployment overrides
//! - Lenient parsing of model JSON into typed results
//! - Scripted collaborators for tests (`mock` feature)

pub mod openai;
pub mod parse;
pub mod prompts;

#[cfg(any(test, feature = "mock"))]
pub mod mock;

pub use openai::{OpenAIBackend, OpenAIConfig};
pub use prompts::PromptSet;
