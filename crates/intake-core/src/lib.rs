//! # intake-core
//!
//! Core types, traits, and lifecycle rules for intake.
//!
//! This crate provides the data model for captured items and worker jobs,
//! the item lifecycle state machine, and the store and collaborator traits
//! that the database, inference, and jobs crates implement or consume.

pub mod defaults;
pub mod error;
pub mod lifecycle;
pub mod logging;
pub mod models;
pub mod traits;
pub mod uuid_utils;

// Re-export commonly used types at crate root
pub use error::{Error, Result};
pub use lifecycle::{
    check_event, classify_outcome, follow_up_for_past_event, mark_duplicate, resolve_follow_up,
    transition, transition_effect, EventCheck, Routed, Trigger,
};
pub use models::*;
pub use traits::*;
pub use uuid_utils::new_v7;
