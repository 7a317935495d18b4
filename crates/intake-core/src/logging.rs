//! Structured logging schema and field name constants for intake.
//!
//! All crates use these names for structured `tracing` fields so that log
//! aggregation can query by the same keys across every subsystem.
//!
//! ## Log Level Contract
//!
//! | Level | Usage |
//! |-------|-------|
//! | ERROR | Degraded service, requires operator attention |
//! | WARN  | Recoverable issue: retry scheduled, lease lost, effect skipped |
//! | INFO  | Lifecycle events (startup, shutdown), job completions, transitions |
//! | DEBUG | Decision points, lease attempts, config choices |
//! | TRACE | Per-row iteration |

// ─── Identity fields ───────────────────────────────────────────────────────

/// Subsystem originating the log event.
/// Values: "db", "inference", "jobs", "worker"
pub const SUBSYSTEM: &str = "subsystem";

/// Component within a subsystem.
/// Examples: "pool", "lease", "worker", "manager", "openai"
pub const COMPONENT: &str = "component";

/// Logical operation name.
/// Examples: "enqueue", "try_lease", "release", "run_batch"
pub const OPERATION: &str = "op";

/// Worker instance identifier holding a lease.
pub const WORKER_ID: &str = "worker_id";

// ─── Entity fields ─────────────────────────────────────────────────────────

/// Item UUID being operated on.
pub const ITEM_ID: &str = "item_id";

/// Job UUID being processed.
pub const JOB_ID: &str = "job_id";

/// Job type (`analysis`, `normalize`, `follow_up`).
pub const JOB_TYPE: &str = "job_type";

/// Item lifecycle status.
pub const ITEM_STATUS: &str = "item_status";

// ─── Measurement fields ────────────────────────────────────────────────────

/// Wall-clock duration in milliseconds.
pub const DURATION_MS: &str = "duration_ms";

/// Lease attempts recorded on a job.
pub const ATTEMPTS: &str = "attempts";

/// Retry delay in milliseconds.
pub const DELAY_MS: &str = "delay_ms";

/// Number of rows affected by a bulk operation.
pub const RESULT_COUNT: &str = "result_count";

// ─── Inference fields ──────────────────────────────────────────────────────

/// Model name used for inference.
pub const MODEL: &str = "model";

/// Byte length of a model response.
pub const RESPONSE_LEN: &str = "response_len";

// ─── Outcome fields ────────────────────────────────────────────────────────

/// Error message when an operation fails.
pub const ERROR_MSG: &str = "error";
