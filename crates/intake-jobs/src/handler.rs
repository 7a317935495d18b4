//! Job handler contract.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use tracing::debug;
use uuid::Uuid;

use intake_core::{ItemEffect, JobType, QueueStore, Result, WorkerJob};

/// Context provided to job handlers.
pub struct JobContext {
    /// The leased job being processed.
    pub job: WorkerJob,
    store: Arc<dyn QueueStore>,
    worker_id: String,
    lease_ttl: Duration,
}

impl JobContext {
    /// Create a new job context.
    pub fn new(
        job: WorkerJob,
        store: Arc<dyn QueueStore>,
        worker_id: impl Into<String>,
        lease_ttl: Duration,
    ) -> Self {
        Self {
            job,
            store,
            worker_id: worker_id.into(),
            lease_ttl,
        }
    }

    /// The item this job acts on.
    pub fn item_id(&self) -> Uuid {
        self.job.item_id
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Calendar date used for event checks.
    pub fn today(&self) -> NaiveDate {
        Utc::now().date_naive()
    }

    /// Extend the lease by the configured TTL.
    ///
    /// Fails with `LeaseLost` when another worker has taken the job over;
    /// handlers should propagate that error unchanged.
    pub async fn renew_lease(&self) -> Result<DateTime<Utc>> {
        let expires_at = self
            .store
            .renew(self.job.id, &self.worker_id, self.lease_ttl)
            .await?;
        debug!(
            subsystem = "jobs",
            component = "handler",
            op = "renew",
            job_id = %self.job.id,
            worker_id = %self.worker_id,
            %expires_at,
            "Lease renewed"
        );
        Ok(expires_at)
    }

    /// Apply an item effect only while this worker still holds the lease.
    ///
    /// Writes a handler makes before its final outcome go through here so a
    /// worker that lost its job cannot touch the item.
    pub async fn apply(&self, effect: &ItemEffect) -> Result<bool> {
        self.store
            .apply_as_owner(self.job.id, &self.worker_id, effect)
            .await
    }
}

/// Result of job execution.
#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    /// Job done; the effect is applied when the lease is released.
    Success(Option<ItemEffect>),
    /// Job should be retried after a backoff delay.
    RetryableFailure(String),
    /// Job failed for good.
    PermanentFailure(String),
}

impl JobOutcome {
    pub fn name(&self) -> &'static str {
        match self {
            JobOutcome::Success(_) => "success",
            JobOutcome::RetryableFailure(_) => "retryable_failure",
            JobOutcome::PermanentFailure(_) => "permanent_failure",
        }
    }
}

/// Trait for job handlers.
///
/// Handlers must be idempotent: a job may run again after a lease expired
/// mid-run, and the effects they return are guarded by the item status they
/// observed.
#[async_trait]
pub trait JobHandler: Send + Sync {
    /// The job type this handler processes.
    fn job_type(&self) -> JobType;

    /// Execute the job.
    ///
    /// `Err(LeaseLost)` aborts the job without releasing it; any other error
    /// is treated as a retryable failure.
    async fn execute(&self, ctx: &JobContext) -> Result<JobOutcome>;

    /// Item revert to apply alongside a retry or permanent failure.
    fn revert_on_failure(&self, _job: &WorkerJob) -> Option<ItemEffect> {
        None
    }
}

/// Handler that succeeds without touching the item.
pub struct NoOpHandler {
    job_type: JobType,
}

impl NoOpHandler {
    pub fn new(job_type: JobType) -> Self {
        Self { job_type }
    }
}

#[async_trait]
impl JobHandler for NoOpHandler {
    fn job_type(&self) -> JobType {
        self.job_type
    }

    async fn execute(&self, _ctx: &JobContext) -> Result<JobOutcome> {
        Ok(JobOutcome::Success(None))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use intake_core::{Error, JobQueue, LeaseManager};
    use intake_db::{test_fixtures, MemoryStore};

    async fn leased(store: &Arc<MemoryStore>, worker_id: &str) -> WorkerJob {
        let item_id = test_fixtures::insert_text_item(store.as_ref(), "me", "hello")
            .await
            .unwrap();
        let job = store.enqueue(JobType::Analysis, item_id).await.unwrap();
        store
            .try_lease(&[job.id], worker_id, Duration::from_secs(60))
            .await
            .unwrap()
            .remove(0)
    }

    #[tokio::test]
    async fn test_renew_lease_extends_expiry() {
        let store = Arc::new(MemoryStore::new());
        let job = leased(&store, "w1").await;
        let before = job.lease_expires_at.unwrap();

        let ctx = JobContext::new(job, store.clone(), "w1", Duration::from_secs(600));
        let after = ctx.renew_lease().await.unwrap();
        assert!(after > before);
    }

    #[tokio::test]
    async fn test_renew_lease_lost_to_other_worker() {
        let store = Arc::new(MemoryStore::new());
        let job = leased(&store, "w1").await;

        let ctx = JobContext::new(job, store.clone(), "w2", Duration::from_secs(600));
        let err = ctx.renew_lease().await.unwrap_err();
        assert!(matches!(err, Error::LeaseLost { .. }));
    }

    #[tokio::test]
    async fn test_noop_handler() {
        let store = Arc::new(MemoryStore::new());
        let job = leased(&store, "w1").await;
        let handler = NoOpHandler::new(JobType::Analysis);

        assert_eq!(handler.job_type(), JobType::Analysis);
        assert!(handler.revert_on_failure(&job).is_none());

        let ctx = JobContext::new(job, store, "w1", Duration::from_secs(60));
        assert_eq!(ctx.worker_id(), "w1");
        let outcome = handler.execute(&ctx).await.unwrap();
        assert_eq!(outcome, JobOutcome::Success(None));
        assert_eq!(outcome.name(), "success");
    }
}
