//! Read-only views over the queue and items.

use std::sync::Arc;

use serde::Serialize;
use uuid::Uuid;

use intake_core::defaults::PAGE_LIMIT;
use intake_core::{JobType, QueueStats, QueueStore, Result, StatusCount, WorkerJob};

/// Point-in-time view of the system.
#[derive(Debug, Clone, Serialize)]
pub struct MonitorSnapshot {
    /// Job counts per type and status.
    pub queue: Vec<QueueStats>,
    /// Item counts per status.
    pub items: Vec<StatusCount>,
    /// Most recent permanent failures.
    pub recent_failures: Vec<FailedJob>,
}

impl MonitorSnapshot {
    /// Jobs waiting to run across all types.
    pub fn queued(&self) -> i64 {
        self.queue.iter().map(|s| s.queued).sum()
    }

    pub fn failed(&self) -> i64 {
        self.queue.iter().map(|s| s.failed).sum()
    }
}

/// Summary of a failed job.
#[derive(Debug, Clone, Serialize)]
pub struct FailedJob {
    pub job_id: Uuid,
    pub job_type: JobType,
    pub item_id: Uuid,
    pub attempts: i32,
    pub last_error: Option<String>,
}

impl From<WorkerJob> for FailedJob {
    fn from(job: WorkerJob) -> Self {
        Self {
            job_id: job.id,
            job_type: job.job_type,
            item_id: job.item_id,
            attempts: job.attempts,
            last_error: job.last_error,
        }
    }
}

/// Read-only queries for dashboards and the `stats` command.
pub struct QueueMonitor {
    store: Arc<dyn QueueStore>,
}

impl QueueMonitor {
    pub fn new(store: Arc<dyn QueueStore>) -> Self {
        Self { store }
    }

    pub async fn snapshot(&self) -> Result<MonitorSnapshot> {
        let queue = self.store.queue_stats().await?;
        let items = self.store.count_by_status().await?;
        let recent_failures = self
            .store
            .list_failed(None, PAGE_LIMIT)
            .await?
            .into_iter()
            .map(FailedJob::from)
            .collect();

        Ok(MonitorSnapshot {
            queue,
            items,
            recent_failures,
        })
    }

    /// Every job an item has had, oldest first.
    pub async fn job_history(&self, item_id: Uuid) -> Result<Vec<WorkerJob>> {
        self.store.list_for_item(item_id).await
    }
}
