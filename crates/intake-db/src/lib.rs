//! # intake-db
//!
//! Storage layer for intake.
//!
//! This crate provides:
//! - Connection pool management
//! - Postgres repositories for items, notes and worker jobs
//! - Compare-and-swap leasing over the `worker_jobs` table
//! - An in-memory store with identical semantics for tests and local runs
//!
//! ## Example
//!
//! ```rust,ignore
//! use intake_db::{Database, ItemStore, JobQueue, JobType, NewItem, ContentType};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let db = Database::connect("postgres://localhost/intake").await?;
//!
//!     let item = db.items.insert(NewItem {
//!         owner: "me@example.com".to_string(),
//!         content_type: ContentType::Text,
//!         content: "Dentist on Friday at 10".to_string(),
//!         title: None,
//!         metadata: None,
//!     }).await?;
//!     db.jobs.enqueue(JobType::Analysis, item.id).await?;
//!     Ok(())
//! }
//! ```

pub mod items;
pub mod jobs;
pub mod memory;
pub mod pool;

// Always compiled so integration tests (in tests/) can use DEFAULT_TEST_DATABASE_URL
pub mod test_fixtures;

pub use intake_core::*;

pub use items::PgItemRepository;
pub use jobs::PgJobRepository;
pub use memory::MemoryStore;
pub use pool::{create_pool, create_pool_with_config, log_pool_metrics, PoolConfig};

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use uuid::Uuid;

/// Combined database context with all repositories.
#[derive(Clone)]
pub struct Database {
    /// The underlying connection pool.
    pub pool: sqlx::Pool<sqlx::Postgres>,
    /// Items and their notes.
    pub items: PgItemRepository,
    /// Worker job queue and leases.
    pub jobs: PgJobRepository,
}

impl Database {
    /// Create a new Database instance from a connection pool.
    pub fn new(pool: sqlx::Pool<sqlx::Postgres>) -> Self {
        Self {
            items: PgItemRepository::new(pool.clone()),
            jobs: PgJobRepository::new(pool.clone()),
            pool,
        }
    }

    /// Create a new Database instance by connecting to the given URL.
    pub async fn connect(url: &str) -> Result<Self> {
        let pool = create_pool(url).await?;
        Ok(Self::new(pool))
    }

    /// Create a new Database instance with custom pool configuration.
    pub async fn connect_with_config(url: &str, config: PoolConfig) -> Result<Self> {
        let pool = create_pool_with_config(url, config).await?;
        Ok(Self::new(pool))
    }

    /// Connect using `DATABASE_URL`, falling back to the local test database.
    pub async fn connect_test() -> Result<Self> {
        let url = std::env::var("DATABASE_URL")
            .unwrap_or_else(|_| test_fixtures::DEFAULT_TEST_DATABASE_URL.to_string());
        Self::connect(&url).await
    }

    /// Run pending migrations from `migrations/`.
    #[cfg(feature = "migrations")]
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("../../migrations")
            .run(&self.pool)
            .await
            .map_err(|e| Error::Database(sqlx::Error::Migrate(Box::new(e))))?;
        Ok(())
    }
}

// The worker takes a single `QueueStore`; delegate each trait to the
// repository that owns the table.

#[async_trait]
impl ItemStore for Database {
    async fn insert(&self, item: NewItem) -> Result<Item> {
        self.items.insert(item).await
    }

    async fn insert_with_jobs(
        &self,
        item: NewItem,
        job_types: &[JobType],
    ) -> Result<(Item, Vec<WorkerJob>)> {
        self.items.insert_with_jobs(item, job_types).await
    }

    async fn get(&self, id: Uuid) -> Result<Option<Item>> {
        self.items.get(id).await
    }

    async fn apply(&self, effect: &ItemEffect) -> Result<bool> {
        self.items.apply(effect).await
    }

    async fn update_details(
        &self,
        id: Uuid,
        title: Option<String>,
        tags: Option<Vec<String>>,
    ) -> Result<Item> {
        self.items.update_details(id, title, tags).await
    }

    async fn hard_delete(&self, id: Uuid) -> Result<bool> {
        self.items.hard_delete(id).await
    }

    async fn list_passed_timeline(&self, today: NaiveDate, limit: i64) -> Result<Vec<Item>> {
        self.items.list_passed_timeline(today, limit).await
    }

    async fn list_due_deferred(&self, now: DateTime<Utc>, limit: i64) -> Result<Vec<Item>> {
        self.items.list_due_deferred(now, limit).await
    }

    async fn count_by_status(&self) -> Result<Vec<StatusCount>> {
        self.items.count_by_status().await
    }

    async fn owner_tags(&self, owner: &str, limit: i64) -> Result<Vec<String>> {
        self.items.owner_tags(owner, limit).await
    }

    async fn add_note(&self, note: NewItemNote) -> Result<ItemNote> {
        self.items.add_note(note).await
    }

    async fn list_notes(&self, item_id: Uuid, kind: Option<NoteKind>) -> Result<Vec<ItemNote>> {
        self.items.list_notes(item_id, kind).await
    }
}

#[async_trait]
impl JobQueue for Database {
    async fn enqueue(&self, job_type: JobType, item_id: Uuid) -> Result<WorkerJob> {
        self.jobs.enqueue(job_type, item_id).await
    }

    async fn get_job(&self, job_id: Uuid) -> Result<Option<WorkerJob>> {
        self.jobs.get_job(job_id).await
    }

    async fn list_due(&self, job_type: Option<JobType>, limit: i64) -> Result<Vec<WorkerJob>> {
        self.jobs.list_due(job_type, limit).await
    }

    async fn list_for_item(&self, item_id: Uuid) -> Result<Vec<WorkerJob>> {
        self.jobs.list_for_item(item_id).await
    }

    async fn requeue_stale_leases(&self) -> Result<u64> {
        self.jobs.requeue_stale_leases().await
    }

    async fn list_failed(&self, job_type: Option<JobType>, limit: i64) -> Result<Vec<WorkerJob>> {
        self.jobs.list_failed(job_type, limit).await
    }

    async fn reset_failed(&self, job_type: JobType, error: &str) -> Result<u64> {
        self.jobs.reset_failed(job_type, error).await
    }

    async fn requeue_failed(&self, job_id: Uuid) -> Result<bool> {
        self.jobs.requeue_failed(job_id).await
    }

    async fn queue_stats(&self) -> Result<Vec<QueueStats>> {
        self.jobs.queue_stats().await
    }
}

#[async_trait]
impl LeaseManager for Database {
    async fn try_lease(
        &self,
        job_ids: &[Uuid],
        worker_id: &str,
        ttl: Duration,
    ) -> Result<Vec<WorkerJob>> {
        self.jobs.try_lease(job_ids, worker_id, ttl).await
    }

    async fn renew(&self, job_id: Uuid, worker_id: &str, ttl: Duration) -> Result<DateTime<Utc>> {
        self.jobs.renew(job_id, worker_id, ttl).await
    }

    async fn release(
        &self,
        job_id: Uuid,
        worker_id: &str,
        release: Release,
    ) -> Result<ReleaseReceipt> {
        self.jobs.release(job_id, worker_id, release).await
    }

    async fn apply_as_owner(
        &self,
        job_id: Uuid,
        worker_id: &str,
        effect: &ItemEffect,
    ) -> Result<bool> {
        self.jobs.apply_as_owner(job_id, worker_id, effect).await
    }
}
