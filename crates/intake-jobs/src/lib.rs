//! # intake-jobs
//!
//! Background processing for captured items.
//!
//! This crate provides:
//! - A lease-based job worker with bounded concurrency and retry backoff
//! - Handlers for the `analysis`, `normalize` and `follow_up` job types
//! - The worker manager's scheduled rules
//! - The capture surface front-ends call into
//! - Read-only queue monitoring
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use intake_jobs::{AnalysisHandler, NormalizeHandler, WorkerBuilder, WorkerConfig};
//!
//! let store: Arc<dyn QueueStore> = Arc::new(Database::connect("postgres://...").await?);
//! let backend = Arc::new(OpenAIBackend::from_env()?);
//!
//! let worker = WorkerBuilder::new(store.clone())
//!     .with_config(WorkerConfig::from_env())
//!     .with_handler(AnalysisHandler::new(store.clone(), backend.clone()))
//!     .with_handler(NormalizeHandler::new(store.clone(), backend))
//!     .build()
//!     .await;
//!
//! // One pass over the queue
//! let report = worker.run_batch(None, 20).await?;
//!
//! // Or keep polling until shut down
//! let handle = worker.start();
//! handle.shutdown().await?;
//! ```

pub mod backoff;
pub mod capture;
pub mod handler;
pub mod handlers;
pub mod manager;
pub mod monitor;
pub mod worker;

// Re-export core types
pub use intake_core::*;

pub use backoff::RetryPolicy;
pub use capture::{CaptureRequest, CaptureService, Captured, NoteAdded};
pub use handler::{JobContext, JobHandler, JobOutcome, NoOpHandler};
pub use handlers::{AnalysisHandler, FollowUpHandler, NormalizeHandler};
pub use manager::{ManagerConfig, ManagerReport, WorkerManager};
pub use monitor::{MonitorSnapshot, QueueMonitor};
pub use worker::{
    default_worker_id, BatchReport, JobWorker, WorkerBuilder, WorkerConfig, WorkerEvent,
    WorkerHandle,
};

/// Default polling interval for continuous mode (milliseconds).
pub const DEFAULT_POLL_INTERVAL_MS: u64 = intake_core::defaults::JOB_POLL_INTERVAL_MS;
