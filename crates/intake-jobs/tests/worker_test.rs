//! End-to-end worker tests against the in-memory store with scripted collaborators.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{Days, Utc};
use tokio::sync::broadcast::error::TryRecvError;
use uuid::Uuid;

use intake_core::{
    Classification, Error, FollowUpAction, ItemEffect, ItemStatus, ItemStore, JobQueue, JobStatus,
    JobType, LeaseManager, NoteKind, Result, TimelineEvent,
};
use intake_db::MemoryStore;
use intake_inference::mock::{MockClassifier, MockFollowUp, MockNormalizer};
use intake_jobs::{
    AnalysisHandler, CaptureRequest, CaptureService, FollowUpHandler, JobContext, JobHandler,
    JobOutcome, JobWorker, NoOpHandler, NormalizeHandler, RetryPolicy, WorkerBuilder,
    WorkerConfig, WorkerEvent,
};

fn config(worker_id: &str) -> WorkerConfig {
    WorkerConfig::default()
        .with_worker_id(worker_id)
        .with_max_concurrent(4)
        .with_lease_secs(600)
        .with_retry(
            RetryPolicy::default()
                .with_max_attempts(5)
                .with_base(Duration::from_secs(30))
                .with_cap(Duration::from_secs(3_600)),
        )
}

fn request(content: &str) -> CaptureRequest {
    CaptureRequest {
        owner: "me".to_string(),
        content_type: intake_core::ContentType::Text,
        content: content.to_string(),
        title: None,
        metadata: None,
    }
}

fn dinner_event() -> TimelineEvent {
    let date = Utc::now().date_naive() + Days::new(3);
    TimelineEvent {
        date: Some(date.format("%Y-%m-%d").to_string()),
        time: Some("19:00".to_string()),
        duration: None,
        location: Some("Luigi's".to_string()),
        principal: Some("Sam".to_string()),
    }
}

async fn worker_with(
    store: &Arc<MemoryStore>,
    classifier: MockClassifier,
    worker_id: &str,
) -> JobWorker {
    WorkerBuilder::new(store.clone())
        .with_config(config(worker_id))
        .with_handler(AnalysisHandler::new(store.clone(), Arc::new(classifier)))
        .with_handler(NormalizeHandler::new(
            store.clone(),
            Arc::new(MockNormalizer::replying(Some("Dinner with Sam".to_string()))),
        ))
        .build()
        .await
}

fn drain(rx: &mut tokio::sync::broadcast::Receiver<WorkerEvent>) -> Vec<WorkerEvent> {
    let mut events = Vec::new();
    loop {
        match rx.try_recv() {
            Ok(event) => events.push(event),
            Err(TryRecvError::Lagged(_)) => continue,
            Err(_) => break,
        }
    }
    events
}

#[tokio::test]
async fn test_confident_event_lands_on_timeline() {
    let store = Arc::new(MemoryStore::new());
    let capture = CaptureService::new(store.clone());
    let item = capture
        .capture(request("Dinner at Luigi's, Friday 7pm with Sam"))
        .await
        .unwrap()
        .item;

    let worker = worker_with(
        &store,
        MockClassifier::replying(Classification {
            overview: "Dinner with Sam at Luigi's".to_string(),
            tags: vec!["social".to_string()],
            timeline: Some(dinner_event()),
            ..Default::default()
        }),
        "w1",
    )
    .await;

    let report = worker.run_batch(None, 10).await.unwrap();
    assert_eq!(report.leased, 2);
    assert_eq!(report.completed, 2);

    let item = store.get(item.id).await.unwrap().unwrap();
    assert_eq!(item.status, ItemStatus::Timeline);
    assert_eq!(item.title.as_deref(), Some("Dinner with Sam"));
    assert!(item.is_normalized);
    assert!(item.timeline().is_some());

    let jobs = store.list_for_item(item.id).await.unwrap();
    assert!(jobs.iter().all(|j| j.status == JobStatus::Completed));
}

#[tokio::test]
async fn test_question_without_event_lands_on_follow_up() {
    let store = Arc::new(MemoryStore::new());
    let capture = CaptureService::new(store.clone());
    let item = capture.capture(request("that thing")).await.unwrap().item;

    let worker = worker_with(
        &store,
        MockClassifier::replying(Classification {
            overview: "An unclear reminder".to_string(),
            follow_up: Some("What is this about?".to_string()),
            ..Default::default()
        }),
        "w1",
    )
    .await;

    worker.run_batch(Some(JobType::Analysis), 10).await.unwrap();

    let item = store.get(item.id).await.unwrap().unwrap();
    assert_eq!(item.status, ItemStatus::FollowUp);
    let jobs = store.list_for_item(item.id).await.unwrap();
    let analysis = jobs.iter().find(|j| j.job_type == JobType::Analysis).unwrap();
    assert_eq!(analysis.status, JobStatus::Completed);
    let normalize = jobs.iter().find(|j| j.job_type == JobType::Normalize).unwrap();
    assert_eq!(normalize.status, JobStatus::Queued);
}

#[tokio::test]
async fn test_repeated_timeouts_fail_job_and_revert_item() {
    let store = Arc::new(MemoryStore::new());
    let capture = CaptureService::new(store.clone());
    let item = capture.capture(request("call mom")).await.unwrap().item;

    let worker = worker_with(&store, MockClassifier::failing("request timed out"), "w1").await;
    let mut events = worker.events();

    for _ in 0..5 {
        worker.run_batch(Some(JobType::Analysis), 10).await.unwrap();
        store.advance(Duration::from_secs(2 * 3_600)).await.unwrap();
    }

    let job = store
        .list_for_item(item.id)
        .await
        .unwrap()
        .into_iter()
        .find(|j| j.job_type == JobType::Analysis)
        .unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.attempts, 5);
    assert!(job.last_error.unwrap().contains("timed out"));
    assert!(job.last_error_at.is_some());

    let item = store.get(item.id).await.unwrap().unwrap();
    assert_eq!(item.status, ItemStatus::New);

    // Four retries with non-decreasing delays, then one permanent failure.
    let events = drain(&mut events);
    let delays: Vec<Duration> = events
        .iter()
        .filter_map(|e| match e {
            WorkerEvent::RetryScheduled { delay, .. } => Some(*delay),
            _ => None,
        })
        .collect();
    assert_eq!(delays.len(), 4);
    assert!(delays.windows(2).all(|w| w[0] <= w[1]));
    assert_eq!(delays[0], Duration::from_secs(60));
    assert_eq!(
        events
            .iter()
            .filter(|e| matches!(e, WorkerEvent::JobFailed { .. }))
            .count(),
        1
    );
}

#[tokio::test]
async fn test_retry_not_due_before_backoff() {
    let store = Arc::new(MemoryStore::new());
    let capture = CaptureService::new(store.clone());
    capture.capture(request("x")).await.unwrap();

    let worker = worker_with(&store, MockClassifier::failing("503"), "w1").await;

    let first = worker.run_batch(Some(JobType::Analysis), 10).await.unwrap();
    assert_eq!(first.retried, 1);

    let second = worker.run_batch(Some(JobType::Analysis), 10).await.unwrap();
    assert_eq!(second.leased, 0);

    store.advance(Duration::from_secs(61)).await.unwrap();
    let third = worker.run_batch(Some(JobType::Analysis), 10).await.unwrap();
    assert_eq!(third.leased, 1);
}

#[tokio::test]
async fn test_follow_up_note_delete_soft_deletes() {
    let store = Arc::new(MemoryStore::new());
    let capture = CaptureService::new(store.clone());
    let item = capture.capture(request("concert?")).await.unwrap().item;

    let worker = WorkerBuilder::new(store.clone())
        .with_config(config("w1"))
        .with_handler(AnalysisHandler::new(
            store.clone(),
            Arc::new(MockClassifier::replying(Classification {
                overview: "Concert".to_string(),
                follow_up: Some("Are you going?".to_string()),
                ..Default::default()
            })),
        ))
        .with_handler(NoOpHandler::new(JobType::Normalize))
        .with_handler(FollowUpHandler::new(
            store.clone(),
            Arc::new(MockFollowUp::action(FollowUpAction::Delete)),
        ))
        .build()
        .await;

    worker.run_batch(None, 10).await.unwrap();
    assert_eq!(
        store.get(item.id).await.unwrap().unwrap().status,
        ItemStatus::FollowUp
    );

    let added = capture
        .add_note(item.id, "me", "delete this", NoteKind::FollowUp)
        .await
        .unwrap();
    let job_id = added.job.unwrap().id;

    let report = worker.run_batch(Some(JobType::FollowUp), 10).await.unwrap();
    assert_eq!(report.completed, 1);

    assert_eq!(
        store.get(item.id).await.unwrap().unwrap().status,
        ItemStatus::SoftDeleted
    );
    assert_eq!(
        store.get_job(job_id).await.unwrap().unwrap().status,
        JobStatus::Completed
    );
}

#[tokio::test]
async fn test_missing_handler_fails_permanently() {
    let store = Arc::new(MemoryStore::new());
    let capture = CaptureService::new(store.clone());
    let item = capture.capture(request("x")).await.unwrap().item;

    let worker = WorkerBuilder::new(store.clone())
        .with_config(config("w1"))
        .with_handler(NoOpHandler::new(JobType::Normalize))
        .build()
        .await;

    let report = worker.run_batch(None, 10).await.unwrap();
    assert_eq!(report.failed, 1);
    assert_eq!(report.completed, 1);

    let job = store
        .list_for_item(item.id)
        .await
        .unwrap()
        .into_iter()
        .find(|j| j.job_type == JobType::Analysis)
        .unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert!(job.last_error.unwrap().contains("No handler"));
    assert_eq!(job.attempts, 1);
}

#[tokio::test]
async fn test_success_effect_is_idempotent() {
    let store = Arc::new(MemoryStore::new());
    let capture = CaptureService::new(store.clone());
    let item = capture.capture(request("x")).await.unwrap().item;

    let effect = ItemEffect::new(item.id)
        .with_title("Normalized")
        .mark_normalized();
    assert!(store.apply(&effect).await.unwrap());
    let once = store.get(item.id).await.unwrap().unwrap();
    assert!(store.apply(&effect).await.unwrap());
    let twice = store.get(item.id).await.unwrap().unwrap();

    assert_eq!(once.title, twice.title);
    assert_eq!(once.status, twice.status);
    assert_eq!(once.is_normalized, twice.is_normalized);
    assert_eq!(once.analysis, twice.analysis);
}

/// Counts executions and sleeps so two workers overlap.
struct CountingHandler {
    runs: Arc<AtomicUsize>,
}

#[async_trait]
impl JobHandler for CountingHandler {
    fn job_type(&self) -> JobType {
        JobType::Normalize
    }

    async fn execute(&self, _ctx: &JobContext) -> Result<JobOutcome> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(10)).await;
        Ok(JobOutcome::Success(None))
    }
}

#[tokio::test]
async fn test_racing_workers_run_each_job_once() {
    let store = Arc::new(MemoryStore::new());
    let capture = CaptureService::new(store.clone());
    let mut ids = Vec::new();
    for i in 0..10 {
        ids.push(capture.capture(request(&format!("item {i}"))).await.unwrap().item.id);
    }

    let runs = Arc::new(AtomicUsize::new(0));
    let build = |id: &'static str| {
        WorkerBuilder::new(store.clone())
            .with_config(config(id))
            .with_handler(CountingHandler { runs: runs.clone() })
            .build()
    };
    let a = build("a").await;
    let b = build("b").await;

    let (ra, rb) = tokio::join!(
        a.run_batch(Some(JobType::Normalize), 20),
        b.run_batch(Some(JobType::Normalize), 20)
    );
    let (ra, rb) = (ra.unwrap(), rb.unwrap());

    assert_eq!(ra.leased + rb.leased, 10);
    assert_eq!(ra.completed + rb.completed, 10);
    assert_eq!(runs.load(Ordering::SeqCst), 10);
    for id in ids {
        let jobs = store.list_for_item(id).await.unwrap();
        let normalize = jobs.iter().find(|j| j.job_type == JobType::Normalize).unwrap();
        assert_eq!(normalize.status, JobStatus::Completed);
        assert_eq!(normalize.attempts, 1);
    }
}

/// Lets another worker take the job over mid-run.
struct StolenLeaseHandler {
    store: Arc<MemoryStore>,
}

#[async_trait]
impl JobHandler for StolenLeaseHandler {
    fn job_type(&self) -> JobType {
        JobType::Normalize
    }

    async fn execute(&self, ctx: &JobContext) -> Result<JobOutcome> {
        self.store.advance(Duration::from_secs(700)).await?;
        self.store.requeue_stale_leases().await?;
        let taken = self
            .store
            .try_lease(&[ctx.job.id], "thief", Duration::from_secs(600))
            .await?;
        assert_eq!(taken.len(), 1);
        Ok(JobOutcome::Success(Some(
            ItemEffect::new(ctx.item_id()).with_title("late write"),
        )))
    }
}

#[tokio::test]
async fn test_late_write_after_lease_loss_is_dropped() {
    let store = Arc::new(MemoryStore::new());
    let capture = CaptureService::new(store.clone());
    let item = capture.capture(request("x")).await.unwrap().item;

    let worker = WorkerBuilder::new(store.clone())
        .with_config(config("slow"))
        .with_handler(StolenLeaseHandler {
            store: store.clone(),
        })
        .build()
        .await;
    let mut events = worker.events();

    let report = worker.run_batch(Some(JobType::Normalize), 10).await.unwrap();
    assert_eq!(report.lease_lost, 1);
    assert_eq!(report.completed, 0);

    let item = store.get(item.id).await.unwrap().unwrap();
    assert!(item.title.is_none());

    let job = store
        .list_for_item(item.id)
        .await
        .unwrap()
        .into_iter()
        .find(|j| j.job_type == JobType::Normalize)
        .unwrap();
    assert_eq!(job.status, JobStatus::Leased);
    assert_eq!(job.lease_owner.as_deref(), Some("thief"));
    assert_eq!(job.attempts, 2);

    assert!(drain(&mut events)
        .iter()
        .any(|e| matches!(e, WorkerEvent::LeaseLost { .. })));
}

/// Returns an effect for an item that does not exist.
struct DanglingEffectHandler;

#[async_trait]
impl JobHandler for DanglingEffectHandler {
    fn job_type(&self) -> JobType {
        JobType::Normalize
    }

    async fn execute(&self, _ctx: &JobContext) -> Result<JobOutcome> {
        Ok(JobOutcome::Success(Some(
            ItemEffect::new(Uuid::now_v7()).mark_normalized(),
        )))
    }
}

#[tokio::test]
async fn test_failed_effect_requeues_immediately() {
    let store = Arc::new(MemoryStore::new());
    let capture = CaptureService::new(store.clone());
    let item = capture.capture(request("x")).await.unwrap().item;

    let worker = WorkerBuilder::new(store.clone())
        .with_config(config("w1"))
        .with_handler(DanglingEffectHandler)
        .build()
        .await;

    let report = worker.run_batch(Some(JobType::Normalize), 10).await.unwrap();
    assert_eq!(report.retried, 1);

    let job = store
        .list_for_item(item.id)
        .await
        .unwrap()
        .into_iter()
        .find(|j| j.job_type == JobType::Normalize)
        .unwrap();
    assert_eq!(job.status, JobStatus::Queued);
    assert!(job.last_error.unwrap().contains("Failed to apply result"));
    assert!(job.available_at <= store.now().await);
}

/// Never finishes within the lease.
struct StuckHandler;

#[async_trait]
impl JobHandler for StuckHandler {
    fn job_type(&self) -> JobType {
        JobType::Normalize
    }

    async fn execute(&self, _ctx: &JobContext) -> Result<JobOutcome> {
        tokio::time::sleep(Duration::from_secs(3_600)).await;
        Ok(JobOutcome::Success(None))
    }
}

#[tokio::test(start_paused = true)]
async fn test_handler_outliving_lease_is_retryable() {
    let store = Arc::new(MemoryStore::new());
    let capture = CaptureService::new(store.clone());
    capture.capture(request("x")).await.unwrap();

    let worker = WorkerBuilder::new(store.clone())
        .with_config(config("w1").with_lease_secs(5))
        .with_handler(StuckHandler)
        .build()
        .await;

    let report = worker.run_batch(Some(JobType::Normalize), 10).await.unwrap();
    assert_eq!(report.retried, 1);

    let job = store
        .all_jobs()
        .await
        .into_iter()
        .find(|j| j.job_type == JobType::Normalize)
        .unwrap();
    assert_eq!(job.status, JobStatus::Queued);
    assert!(job.last_error.unwrap().contains("exceeded lease"));
}

/// Surfaces a lost lease the way a handler's renew would.
struct LeaseLostHandler;

#[async_trait]
impl JobHandler for LeaseLostHandler {
    fn job_type(&self) -> JobType {
        JobType::Normalize
    }

    async fn execute(&self, ctx: &JobContext) -> Result<JobOutcome> {
        Err(Error::LeaseLost { job_id: ctx.job.id })
    }
}

#[tokio::test]
async fn test_stale_worker_cannot_restart_failed_analysis() {
    let store = Arc::new(MemoryStore::new());
    let capture = CaptureService::new(store.clone());
    let item = capture.capture(request("Call mom")).await.unwrap().item;
    let job_id = store
        .list_for_item(item.id)
        .await
        .unwrap()
        .into_iter()
        .find(|j| j.job_type == JobType::Analysis)
        .unwrap()
        .id;

    let short = Duration::from_secs(5);
    let leased = store.try_lease(&[job_id], "late", short).await.unwrap();
    let late_ctx = JobContext::new(leased[0].clone(), store.clone(), "late", short);
    store.advance(Duration::from_secs(6)).await.unwrap();

    let reclaimer = WorkerBuilder::new(store.clone())
        .with_config(config("reclaimer").with_retry(RetryPolicy::default().with_max_attempts(1)))
        .with_handler(AnalysisHandler::new(
            store.clone(),
            Arc::new(MockClassifier::failing("timeout")),
        ))
        .build()
        .await;
    reclaimer.run_batch(Some(JobType::Analysis), 10).await.unwrap();

    let job = store.get_job(job_id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(store.get(item.id).await.unwrap().unwrap().status, ItemStatus::New);

    let late_handler = AnalysisHandler::new(
        store.clone(),
        Arc::new(MockClassifier::replying(Classification {
            overview: "Call mom".to_string(),
            ..Default::default()
        })),
    );
    let err = late_handler.execute(&late_ctx).await.unwrap_err();
    assert!(err.is_lease_lost());
    assert_eq!(store.get(item.id).await.unwrap().unwrap().status, ItemStatus::New);
}

#[tokio::test]
async fn test_lease_lost_error_leaves_job_untouched() {
    let store = Arc::new(MemoryStore::new());
    let capture = CaptureService::new(store.clone());
    capture.capture(request("x")).await.unwrap();

    let worker = WorkerBuilder::new(store.clone())
        .with_config(config("w1"))
        .with_handler(LeaseLostHandler)
        .build()
        .await;

    let report = worker.run_batch(Some(JobType::Normalize), 10).await.unwrap();
    assert_eq!(report.lease_lost, 1);

    let job = store
        .all_jobs()
        .await
        .into_iter()
        .find(|j| j.job_type == JobType::Normalize)
        .unwrap();
    assert_eq!(job.status, JobStatus::Leased);
    assert!(job.last_error.is_none());
}

#[tokio::test]
async fn test_continuous_mode_processes_and_shuts_down() {
    let store = Arc::new(MemoryStore::new());
    let capture = CaptureService::new(store.clone());
    let item = capture.capture(request("x")).await.unwrap().item;

    let worker = WorkerBuilder::new(store.clone())
        .with_config(config("w1").with_poll_interval(10))
        .with_handler(NoOpHandler::new(JobType::Analysis))
        .with_handler(NoOpHandler::new(JobType::Normalize))
        .build()
        .await;

    let handle = worker.start();
    let mut events = handle.events();

    let mut completed = 0;
    while completed < 2 {
        match tokio::time::timeout(Duration::from_secs(5), events.recv()).await {
            Ok(Ok(WorkerEvent::JobCompleted { .. })) => completed += 1,
            Ok(Ok(_)) => {}
            other => panic!("worker did not complete jobs: {other:?}"),
        }
    }
    handle.shutdown().await.unwrap();

    let jobs = store.list_for_item(item.id).await.unwrap();
    assert!(jobs.iter().all(|j| j.status == JobStatus::Completed));
}

#[tokio::test]
async fn test_disabled_worker_does_nothing() {
    let store = Arc::new(MemoryStore::new());
    let capture = CaptureService::new(store.clone());
    capture.capture(request("x")).await.unwrap();

    let worker = WorkerBuilder::new(store.clone())
        .with_config(config("w1").with_enabled(false))
        .with_handler(NoOpHandler::new(JobType::Normalize))
        .build()
        .await;

    let handle = worker.start();
    tokio::time::sleep(Duration::from_millis(50)).await;
    // The run loop already returned, so the shutdown signal has no receiver.
    assert!(handle.shutdown().await.is_err());

    let due = store.list_due(None, 10).await.unwrap();
    assert_eq!(due.len(), 2);
}
