//! Core traits for intake abstractions.
//!
//! Store traits are implemented by `intake-db` (Postgres and in-memory);
//! collaborator traits are implemented by `intake-inference`. The jobs
//! crate only talks to these traits.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use uuid::Uuid;

use crate::error::Result;
use crate::models::*;

// =============================================================================
// ITEM STORE
// =============================================================================

/// Durable record of captured items and their notes.
#[async_trait]
pub trait ItemStore: Send + Sync {
    /// Insert a new item in status `new`.
    async fn insert(&self, item: NewItem) -> Result<Item>;

    /// Insert a new item together with its first jobs, all or nothing.
    ///
    /// Jobs come back in the order of `job_types`.
    async fn insert_with_jobs(
        &self,
        item: NewItem,
        job_types: &[JobType],
    ) -> Result<(Item, Vec<WorkerJob>)>;

    /// Fetch an item by id.
    async fn get(&self, id: Uuid) -> Result<Option<Item>>;

    /// Apply a conditional effect.
    ///
    /// Returns `Ok(false)` without writing when the item's status is not one
    /// the effect expects, and `ItemNotFound` when the item is gone.
    async fn apply(&self, effect: &ItemEffect) -> Result<bool>;

    /// Status-agnostic edit of title and tags.
    async fn update_details(
        &self,
        id: Uuid,
        title: Option<String>,
        tags: Option<Vec<String>>,
    ) -> Result<Item>;

    /// Remove the item with its notes and jobs. Returns false if absent.
    async fn hard_delete(&self, id: Uuid) -> Result<bool>;

    /// Timeline items whose event date is before `today`, least recently
    /// updated first.
    async fn list_passed_timeline(&self, today: NaiveDate, limit: i64) -> Result<Vec<Item>>;

    /// Follow-up items deferred until `now` or earlier, least recently
    /// updated first.
    async fn list_due_deferred(&self, now: DateTime<Utc>, limit: i64) -> Result<Vec<Item>>;

    /// Item counts per status (statuses with no items are omitted).
    async fn count_by_status(&self) -> Result<Vec<StatusCount>>;

    /// Tags the owner already uses, most frequent first.
    async fn owner_tags(&self, owner: &str, limit: i64) -> Result<Vec<String>>;

    /// Attach a note. Fails with `InvalidTarget` if the item does not exist.
    async fn add_note(&self, note: NewItemNote) -> Result<ItemNote>;

    /// Notes on an item, oldest first, optionally filtered by kind.
    async fn list_notes(&self, item_id: Uuid, kind: Option<NoteKind>) -> Result<Vec<ItemNote>>;
}

// =============================================================================
// JOB QUEUE
// =============================================================================

/// Durable queue of worker jobs.
#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Queue a job for an item. Fails with `InvalidTarget` if the item does not exist.
    async fn enqueue(&self, job_type: JobType, item_id: Uuid) -> Result<WorkerJob>;

    /// Fetch a job by id.
    async fn get_job(&self, job_id: Uuid) -> Result<Option<WorkerJob>>;

    /// Queued jobs whose `available_at` has passed, oldest first.
    async fn list_due(&self, job_type: Option<JobType>, limit: i64) -> Result<Vec<WorkerJob>>;

    /// All jobs for an item, oldest first.
    async fn list_for_item(&self, item_id: Uuid) -> Result<Vec<WorkerJob>>;

    /// Return expired leases to the queue without touching attempts.
    async fn requeue_stale_leases(&self) -> Result<u64>;

    /// Failed jobs, most recently failed first.
    async fn list_failed(&self, job_type: Option<JobType>, limit: i64) -> Result<Vec<WorkerJob>>;

    /// Requeue failed jobs of a type whose last error equals `error`, resetting attempts.
    async fn reset_failed(&self, job_type: JobType, error: &str) -> Result<u64>;

    /// Requeue one failed job, keeping its attempt count.
    async fn requeue_failed(&self, job_id: Uuid) -> Result<bool>;

    /// Job counts by type and status.
    async fn queue_stats(&self) -> Result<Vec<QueueStats>>;
}

// =============================================================================
// LEASE MANAGER
// =============================================================================

/// Compare-and-swap lease protocol over the job queue.
#[async_trait]
pub trait LeaseManager: Send + Sync {
    /// Lease every job in `job_ids` that is still queued and due.
    ///
    /// Each job is claimed with a single conditional write; jobs another
    /// worker got first are simply absent from the result. Attempts are
    /// incremented on every successful lease.
    async fn try_lease(
        &self,
        job_ids: &[Uuid],
        worker_id: &str,
        ttl: Duration,
    ) -> Result<Vec<WorkerJob>>;

    /// Extend a lease held by `worker_id`. Fails with `LeaseLost` otherwise.
    async fn renew(&self, job_id: Uuid, worker_id: &str, ttl: Duration)
        -> Result<DateTime<Utc>>;

    /// Give up a lease held by `worker_id`, applying the release's item
    /// effect in the same write. Fails with `LeaseLost` if the lease moved on.
    async fn release(
        &self,
        job_id: Uuid,
        worker_id: &str,
        release: Release,
    ) -> Result<ReleaseReceipt>;

    /// Apply an item effect while `worker_id` still holds the job's lease.
    ///
    /// The ownership check and the effect are one atomic write. Fails with
    /// `LeaseLost` if the lease moved on; otherwise returns whether the
    /// effect's status guard matched.
    async fn apply_as_owner(&self, job_id: Uuid, worker_id: &str, effect: &ItemEffect)
        -> Result<bool>;
}

/// Everything the worker needs from a backing store.
pub trait QueueStore: ItemStore + JobQueue + LeaseManager {}

impl<T: ItemStore + JobQueue + LeaseManager> QueueStore for T {}

// =============================================================================
// COLLABORATORS
// =============================================================================

/// Classifies captured content.
#[async_trait]
pub trait ClassificationBackend: Send + Sync {
    /// Classify an item, nudging tags towards `preferred_tags`.
    ///
    /// Schema-invalid responses are returned as errors.
    async fn classify(&self, item: &Item, preferred_tags: &[String]) -> Result<Classification>;

    /// Model identifier for logging.
    fn model_name(&self) -> &str;
}

/// Produces a human-friendly title for an item.
#[async_trait]
pub trait NormalizationBackend: Send + Sync {
    /// Suggested title, or `None` when the model had nothing useful.
    async fn normalize_title(&self, item: &Item) -> Result<Option<String>>;
}

/// Re-evaluates a follow-up item after the user added notes.
#[async_trait]
pub trait FollowUpBackend: Send + Sync {
    async fn resolve(
        &self,
        item: &Item,
        analysis: &Analysis,
        notes: &[ItemNote],
        preferred_tags: &[String],
    ) -> Result<FollowUpResolution>;
}

/// Finds earlier items that a new analysis duplicates.
#[async_trait]
pub trait DuplicateDetector: Send + Sync {
    async fn find_duplicate(&self, item: &Item, analysis: &Analysis) -> Result<Option<Uuid>>;
}

/// Detector that never reports duplicates.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoDuplicateDetector;

#[async_trait]
impl DuplicateDetector for NoDuplicateDetector {
    async fn find_duplicate(&self, _item: &Item, _analysis: &Analysis) -> Result<Option<Uuid>> {
        Ok(None)
    }
}
