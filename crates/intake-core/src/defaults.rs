//! Centralized default constants for intake.
//!
//! Every crate and the worker binary reference these constants instead of
//! defining their own magic numbers. Organized by domain area.

// =============================================================================
// JOB QUEUE
// =============================================================================

/// Maximum number of lease attempts before a job fails permanently.
pub const JOB_MAX_ATTEMPTS: i32 = 5;

/// Base delay for exponential retry backoff, in seconds.
pub const JOB_BACKOFF_BASE_SECS: u64 = 30;

/// Upper bound for a single retry delay, in seconds.
pub const JOB_BACKOFF_CAP_SECS: u64 = 3_600;

/// Lease time-to-live in seconds. Must exceed the slowest handler run.
pub const JOB_LEASE_SECS: u64 = 600;

/// Number of due jobs a worker tries to lease per batch.
pub const JOB_BATCH_LIMIT: i64 = 20;

// =============================================================================
// WORKER
// =============================================================================

/// Poll interval in continuous mode when the queue is empty (milliseconds).
pub const JOB_POLL_INTERVAL_MS: u64 = 5_000;

/// Maximum number of jobs a single worker runs at once.
pub const JOB_MAX_CONCURRENT: usize = 4;

/// Broadcast channel capacity for worker events.
pub const EVENT_BUS_CAPACITY: usize = 256;

// =============================================================================
// WORKER MANAGER
// =============================================================================

/// Interval between manager cycles in loop mode (seconds).
pub const MANAGER_INTERVAL_SECS: u64 = 60;

/// Maximum items inspected per manager rule per cycle.
pub const MANAGER_SCAN_LIMIT: i64 = 100;

/// Failed jobs with at most this many attempts get one automatic retry.
pub const MANAGER_RETRY_MAX_ATTEMPTS: i32 = 1;

// =============================================================================
// INFERENCE
// =============================================================================

/// Number of the owner's existing tags offered to the model as preferences.
pub const PREFERRED_TAG_LIMIT: i64 = 30;

// =============================================================================
// PAGINATION
// =============================================================================

/// Default page size for monitoring listings.
pub const PAGE_LIMIT: i64 = 50;

/// Internal "fetch everything" limit for aggregation queries.
pub const INTERNAL_FETCH_LIMIT: i64 = 10_000;
