//! Lease-based job worker.
//!
//! A batch goes through four steps:
//! 1. requeue leases that expired on crashed or stalled workers
//! 2. list due jobs
//! 3. lease them with the store's conditional write
//! 4. run the leased jobs with bounded concurrency and release each lease
//!
//! Exclusion between workers comes only from the store. A worker whose lease
//! was taken over finds out through `LeaseLost` on renew or release and
//! drops the job without side effects.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::stream::{self, StreamExt};
use serde::Serialize;
use tokio::sync::{broadcast, mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use intake_core::defaults::{
    EVENT_BUS_CAPACITY, JOB_BATCH_LIMIT, JOB_LEASE_SECS, JOB_MAX_CONCURRENT,
};
use intake_core::{Error, ItemEffect, JobType, QueueStore, Release, Result, WorkerJob};

use crate::backoff::RetryPolicy;
use crate::handler::{JobContext, JobHandler, JobOutcome};
use crate::DEFAULT_POLL_INTERVAL_MS;

/// Default worker identity: `WORKER_ID`, else `<hostname>-<pid>-<6 hex>`.
pub fn default_worker_id() -> String {
    if let Some(id) = std::env::var("WORKER_ID")
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
    {
        return id;
    }

    let host = std::env::var("HOSTNAME")
        .ok()
        .or_else(|| std::fs::read_to_string("/etc/hostname").ok())
        .map(|h| h.trim().to_string())
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "worker".to_string());
    let suffix = Uuid::new_v4().simple().to_string();
    format!("{host}-{}-{}", std::process::id(), &suffix[..6])
}

/// Configuration for the job worker.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Identity written as `lease_owner`.
    pub worker_id: String,
    /// Polling interval in continuous mode when the queue is empty (milliseconds).
    pub poll_interval_ms: u64,
    /// Maximum number of jobs run at once within a batch.
    pub max_concurrent_jobs: usize,
    /// Whether continuous mode processes jobs at all.
    pub enabled: bool,
    /// Lease time-to-live in seconds.
    pub lease_secs: u64,
    /// Due jobs considered per batch.
    pub batch_limit: i64,
    /// Restrict continuous mode to one job type.
    pub job_type: Option<JobType>,
    /// Retry and backoff policy.
    pub retry: RetryPolicy,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_id: default_worker_id(),
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            max_concurrent_jobs: JOB_MAX_CONCURRENT,
            enabled: true,
            lease_secs: JOB_LEASE_SECS,
            batch_limit: JOB_BATCH_LIMIT,
            job_type: None,
            retry: RetryPolicy::default(),
        }
    }
}

impl WorkerConfig {
    /// Create config from environment variables (with defaults).
    ///
    /// | Variable | Default | Description |
    /// |----------|---------|-------------|
    /// | `WORKER_ID` | `<hostname>-<pid>-<hex>` | Lease owner identity |
    /// | `JOB_WORKER_ENABLED` | `true` | Enable/disable job processing |
    /// | `JOB_MAX_CONCURRENT` | `4` | Max concurrent jobs |
    /// | `JOB_POLL_INTERVAL_MS` | `5000` | Polling interval when queue is empty |
    /// | `JOB_LEASE_SECS` | `600` | Lease TTL |
    /// | `JOB_BATCH_LIMIT` | `20` | Due jobs leased per batch |
    ///
    /// Retry settings are read by [`RetryPolicy::from_env`].
    pub fn from_env() -> Self {
        let enabled = std::env::var("JOB_WORKER_ENABLED")
            .map(|v| v != "false" && v != "0")
            .unwrap_or(true);

        let max_concurrent_jobs = std::env::var("JOB_MAX_CONCURRENT")
            .ok()
            .and_then(|v| v.parse::<usize>().ok())
            .unwrap_or(JOB_MAX_CONCURRENT)
            .max(1);

        let poll_interval_ms = std::env::var("JOB_POLL_INTERVAL_MS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(DEFAULT_POLL_INTERVAL_MS);

        let lease_secs = std::env::var("JOB_LEASE_SECS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(JOB_LEASE_SECS)
            .max(1);

        let batch_limit = std::env::var("JOB_BATCH_LIMIT")
            .ok()
            .and_then(|v| v.parse::<i64>().ok())
            .unwrap_or(JOB_BATCH_LIMIT)
            .max(1);

        Self {
            worker_id: default_worker_id(),
            poll_interval_ms,
            max_concurrent_jobs,
            enabled,
            lease_secs,
            batch_limit,
            job_type: None,
            retry: RetryPolicy::from_env(),
        }
    }

    pub fn with_worker_id(mut self, worker_id: impl Into<String>) -> Self {
        self.worker_id = worker_id.into();
        self
    }

    /// Create a new config with custom poll interval.
    pub fn with_poll_interval(mut self, ms: u64) -> Self {
        self.poll_interval_ms = ms;
        self
    }

    /// Set maximum concurrent jobs.
    pub fn with_max_concurrent(mut self, max: usize) -> Self {
        self.max_concurrent_jobs = max;
        self
    }

    /// Enable or disable job processing.
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn with_lease_secs(mut self, secs: u64) -> Self {
        self.lease_secs = secs;
        self
    }

    pub fn with_batch_limit(mut self, limit: i64) -> Self {
        self.batch_limit = limit;
        self
    }

    pub fn with_job_type(mut self, job_type: Option<JobType>) -> Self {
        self.job_type = job_type;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn lease_ttl(&self) -> Duration {
        Duration::from_secs(self.lease_secs)
    }
}

/// Event emitted by the job worker.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerEvent {
    /// Worker started.
    WorkerStarted { worker_id: String },
    /// A leased job was handed to its handler.
    JobStarted { job_id: Uuid, job_type: JobType },
    /// A job completed.
    JobCompleted {
        job_id: Uuid,
        job_type: JobType,
        effect_applied: bool,
    },
    /// A job went back to the queue.
    RetryScheduled {
        job_id: Uuid,
        job_type: JobType,
        delay: Duration,
        error: String,
    },
    /// A job failed for good.
    JobFailed {
        job_id: Uuid,
        job_type: JobType,
        error: String,
    },
    /// Another worker owns the job now.
    LeaseLost { job_id: Uuid, job_type: JobType },
    /// Worker stopped.
    WorkerStopped { worker_id: String },
}

/// Counts from one batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BatchReport {
    /// Expired leases returned to the queue.
    pub requeued: u64,
    /// Jobs this worker leased.
    pub leased: usize,
    pub completed: usize,
    pub retried: usize,
    pub failed: usize,
    pub lease_lost: usize,
    /// Jobs whose release could not be written for a reason other than a lost lease.
    pub errors: usize,
}

impl BatchReport {
    fn record(&mut self, disposition: Disposition) {
        match disposition {
            Disposition::Completed => self.completed += 1,
            Disposition::Retried => self.retried += 1,
            Disposition::Failed => self.failed += 1,
            Disposition::LeaseLost => self.lease_lost += 1,
            Disposition::Error => self.errors += 1,
        }
    }
}

/// How a single leased job ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Disposition {
    Completed,
    Retried,
    Failed,
    LeaseLost,
    Error,
}

/// Handle for controlling a running worker.
pub struct WorkerHandle {
    shutdown_tx: mpsc::Sender<()>,
    event_rx: broadcast::Receiver<WorkerEvent>,
    task: JoinHandle<()>,
}

impl WorkerHandle {
    /// Signal the worker to shut down and wait for the current batch to finish.
    pub async fn shutdown(self) -> Result<()> {
        self.shutdown_tx
            .send(())
            .await
            .map_err(|_| Error::Internal("Failed to send shutdown signal".into()))?;
        self.task
            .await
            .map_err(|e| Error::Internal(format!("Worker task failed: {e}")))
    }

    /// Get a receiver for worker events.
    pub fn events(&self) -> broadcast::Receiver<WorkerEvent> {
        self.event_rx.resubscribe()
    }
}

type HandlerMap = Arc<RwLock<HashMap<JobType, Arc<dyn JobHandler>>>>;

/// Job worker that leases and runs jobs from the queue.
pub struct JobWorker {
    store: Arc<dyn QueueStore>,
    config: WorkerConfig,
    handlers: HandlerMap,
    event_tx: broadcast::Sender<WorkerEvent>,
}

impl JobWorker {
    /// Create a new job worker.
    pub fn new(store: Arc<dyn QueueStore>, config: WorkerConfig) -> Self {
        let (event_tx, _) = broadcast::channel(EVENT_BUS_CAPACITY);
        Self {
            store,
            config,
            handlers: Arc::new(RwLock::new(HashMap::new())),
            event_tx,
        }
    }

    /// Register a handler for a job type.
    pub async fn register_handler<H: JobHandler + 'static>(&self, handler: H) {
        let job_type = handler.job_type();
        let mut handlers = self.handlers.write().await;
        handlers.insert(job_type, Arc::new(handler));
        debug!(%job_type, "Registered job handler");
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    pub fn worker_id(&self) -> &str {
        &self.config.worker_id
    }

    /// Get a receiver for worker events.
    pub fn events(&self) -> broadcast::Receiver<WorkerEvent> {
        self.event_tx.subscribe()
    }

    fn emit(&self, event: WorkerEvent) {
        // No subscribers is fine.
        let _ = self.event_tx.send(event);
    }

    /// Run one batch: requeue stale leases, lease due jobs, run and release them.
    #[instrument(skip(self), fields(worker_id = %self.config.worker_id))]
    pub async fn run_batch(&self, job_type: Option<JobType>, limit: i64) -> Result<BatchReport> {
        let mut report = BatchReport {
            requeued: self.store.requeue_stale_leases().await?,
            ..Default::default()
        };

        let due = self.store.list_due(job_type, limit).await?;
        if due.is_empty() {
            return Ok(report);
        }

        let ids: Vec<Uuid> = due.iter().map(|j| j.id).collect();
        let leased = self
            .store
            .try_lease(&ids, &self.config.worker_id, self.config.lease_ttl())
            .await?;
        report.leased = leased.len();
        debug!(due = ids.len(), leased = leased.len(), "Leased due jobs");

        let concurrency = self.config.max_concurrent_jobs.max(1);
        let dispositions: Vec<Disposition> = stream::iter(leased)
            .map(|job| self.process_job(job))
            .buffer_unordered(concurrency)
            .collect()
            .await;

        for disposition in dispositions {
            report.record(disposition);
        }

        if report.leased > 0 {
            info!(
                leased = report.leased,
                completed = report.completed,
                retried = report.retried,
                failed = report.failed,
                lease_lost = report.lease_lost,
                "Batch finished"
            );
        }
        Ok(report)
    }

    /// Run a leased job through its handler and release the lease.
    async fn process_job(&self, job: WorkerJob) -> Disposition {
        let start = Instant::now();
        let job_id = job.id;
        let job_type = job.job_type;

        info!(%job_id, %job_type, attempts = job.attempts, "Processing job");
        self.emit(WorkerEvent::JobStarted { job_id, job_type });

        let handler = {
            let handlers = self.handlers.read().await;
            handlers.get(&job_type).cloned()
        };

        let Some(handler) = handler else {
            warn!(%job_type, "No handler registered for job type");
            let error = format!("No handler registered for job type: {job_type}");
            return self.fail(&job, error, None).await;
        };

        let ctx = JobContext::new(
            job.clone(),
            self.store.clone(),
            self.config.worker_id.clone(),
            self.config.lease_ttl(),
        );

        let ttl = self.config.lease_ttl();
        let outcome = match tokio::time::timeout(ttl, handler.execute(&ctx)).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(e)) if e.is_lease_lost() => {
                return self.lease_lost(&job);
            }
            Ok(Err(e)) => JobOutcome::RetryableFailure(e.to_string()),
            Err(_) => {
                warn!(%job_id, %job_type, lease_secs = ttl.as_secs(), "Job outlived its lease");
                JobOutcome::RetryableFailure(format!(
                    "Job exceeded lease of {}s",
                    ttl.as_secs()
                ))
            }
        };

        let disposition = match outcome {
            JobOutcome::Success(effect) => self.complete(&job, effect).await,
            JobOutcome::RetryableFailure(error) => {
                let revert = handler.revert_on_failure(&job);
                if self.config.retry.should_retry(job.attempts) {
                    let delay = self.config.retry.backoff(job.attempts);
                    self.retry(&job, delay, error, revert).await
                } else {
                    self.fail(&job, error, revert).await
                }
            }
            JobOutcome::PermanentFailure(error) => {
                let revert = handler.revert_on_failure(&job);
                self.fail(&job, error, revert).await
            }
        };

        debug!(
            %job_id,
            %job_type,
            ?disposition,
            duration_ms = start.elapsed().as_millis() as u64,
            "Job released"
        );
        disposition
    }

    fn lease_lost(&self, job: &WorkerJob) -> Disposition {
        warn!(
            job_id = %job.id,
            job_type = %job.job_type,
            "Lease lost, dropping job"
        );
        self.emit(WorkerEvent::LeaseLost {
            job_id: job.id,
            job_type: job.job_type,
        });
        Disposition::LeaseLost
    }

    async fn complete(
        &self,
        job: &WorkerJob,
        effect: Option<ItemEffect>,
    ) -> Disposition {
        let release = Release::Completed { effect };
        match self
            .store
            .release(job.id, &self.config.worker_id, release)
            .await
        {
            Ok(receipt) => {
                info!(
                    job_id = %job.id,
                    job_type = %job.job_type,
                    effect_applied = receipt.effect_applied,
                    "Job completed"
                );
                self.emit(WorkerEvent::JobCompleted {
                    job_id: job.id,
                    job_type: job.job_type,
                    effect_applied: receipt.effect_applied,
                });
                Disposition::Completed
            }
            Err(e) if e.is_lease_lost() => self.lease_lost(job),
            Err(e) => {
                // The result could not be written; run the job again right away.
                warn!(job_id = %job.id, error = %e, "Failed to apply job result");
                let error = format!("Failed to apply result: {e}");
                self.retry(job, Duration::ZERO, error, None).await
            }
        }
    }

    async fn retry(
        &self,
        job: &WorkerJob,
        delay: Duration,
        error: String,
        revert: Option<ItemEffect>,
    ) -> Disposition {
        let release = Release::Retry {
            delay,
            error: error.clone(),
            revert,
        };
        match self
            .store
            .release(job.id, &self.config.worker_id, release)
            .await
        {
            Ok(_) => {
                warn!(
                    job_id = %job.id,
                    job_type = %job.job_type,
                    attempts = job.attempts,
                    delay_ms = delay.as_millis() as u64,
                    %error,
                    "Job failed, retry scheduled"
                );
                self.emit(WorkerEvent::RetryScheduled {
                    job_id: job.id,
                    job_type: job.job_type,
                    delay,
                    error,
                });
                Disposition::Retried
            }
            Err(e) if e.is_lease_lost() => self.lease_lost(job),
            Err(e) => {
                error!(job_id = %job.id, error = %e, "Failed to release job for retry");
                Disposition::Error
            }
        }
    }

    async fn fail(
        &self,
        job: &WorkerJob,
        error: String,
        revert: Option<ItemEffect>,
    ) -> Disposition {
        let release = Release::Failed {
            error: error.clone(),
            revert,
        };
        match self
            .store
            .release(job.id, &self.config.worker_id, release)
            .await
        {
            Ok(_) => {
                error!(
                    job_id = %job.id,
                    job_type = %job.job_type,
                    attempts = job.attempts,
                    %error,
                    "Job failed permanently"
                );
                self.emit(WorkerEvent::JobFailed {
                    job_id: job.id,
                    job_type: job.job_type,
                    error,
                });
                Disposition::Failed
            }
            Err(e) if e.is_lease_lost() => self.lease_lost(job),
            Err(e) => {
                error!(job_id = %job.id, error = %e, "Failed to mark job as failed");
                Disposition::Error
            }
        }
    }

    /// Start the worker and return a handle for control.
    pub fn start(self) -> WorkerHandle {
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel(1);
        let event_rx = self.event_tx.subscribe();

        let worker = Arc::new(self);
        let task = tokio::spawn(async move {
            worker.run(&mut shutdown_rx).await;
        });

        WorkerHandle {
            shutdown_tx,
            event_rx,
            task,
        }
    }

    /// Poll the queue until shut down.
    ///
    /// Only sleeps when a batch leased nothing.
    #[instrument(skip(self, shutdown_rx), fields(worker_id = %self.config.worker_id))]
    async fn run(&self, shutdown_rx: &mut mpsc::Receiver<()>) {
        if !self.config.enabled {
            info!("Job worker is disabled, not starting");
            return;
        }

        info!(
            poll_interval_ms = self.config.poll_interval_ms,
            max_concurrent = self.config.max_concurrent_jobs,
            lease_secs = self.config.lease_secs,
            job_type = ?self.config.job_type,
            "Job worker started"
        );
        self.emit(WorkerEvent::WorkerStarted {
            worker_id: self.config.worker_id.clone(),
        });

        let poll_interval = Duration::from_millis(self.config.poll_interval_ms);

        loop {
            if shutdown_rx.try_recv().is_ok() {
                info!("Job worker received shutdown signal");
                break;
            }

            let busy = match self
                .run_batch(self.config.job_type, self.config.batch_limit)
                .await
            {
                Ok(report) => report.leased > 0,
                Err(e) => {
                    error!(error = %e, "Batch failed");
                    false
                }
            };

            if !busy {
                tokio::select! {
                    _ = shutdown_rx.recv() => {
                        info!("Job worker received shutdown signal");
                        break;
                    }
                    _ = sleep(poll_interval) => {}
                }
            }
        }

        self.emit(WorkerEvent::WorkerStopped {
            worker_id: self.config.worker_id.clone(),
        });
        info!("Job worker stopped");
    }
}

/// Builder for creating a job worker with handlers.
pub struct WorkerBuilder {
    store: Arc<dyn QueueStore>,
    config: WorkerConfig,
    handlers: Vec<Box<dyn JobHandler>>,
}

impl WorkerBuilder {
    pub fn new(store: Arc<dyn QueueStore>) -> Self {
        Self {
            store,
            config: WorkerConfig::default(),
            handlers: Vec::new(),
        }
    }

    /// Set the worker configuration.
    pub fn with_config(mut self, config: WorkerConfig) -> Self {
        self.config = config;
        self
    }

    /// Add a handler.
    pub fn with_handler<H: JobHandler + 'static>(mut self, handler: H) -> Self {
        self.handlers.push(Box::new(handler));
        self
    }

    /// Build and return the worker.
    pub async fn build(self) -> JobWorker {
        let worker = JobWorker::new(self.store, self.config);

        {
            let mut handlers = worker.handlers.write().await;
            for handler in self.handlers {
                handlers.insert(handler.job_type(), Arc::from(handler));
            }
        }

        worker
    }
}
