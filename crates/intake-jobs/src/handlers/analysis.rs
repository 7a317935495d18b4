//! Classification of newly captured items.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use intake_core::defaults::PREFERRED_TAG_LIMIT;
use intake_core::{
    classify_outcome, mark_duplicate, transition_effect, ClassificationBackend, DuplicateDetector,
    Error, ItemEffect, ItemStatus, JobType, NoDuplicateDetector, QueueStore, Result, Trigger,
    WorkerJob,
};

use crate::handler::{JobContext, JobHandler, JobOutcome};

/// Runs the classification collaborator and routes the item.
pub struct AnalysisHandler {
    store: Arc<dyn QueueStore>,
    classifier: Arc<dyn ClassificationBackend>,
    duplicates: Arc<dyn DuplicateDetector>,
}

impl AnalysisHandler {
    pub fn new(store: Arc<dyn QueueStore>, classifier: Arc<dyn ClassificationBackend>) -> Self {
        Self {
            store,
            classifier,
            duplicates: Arc::new(NoDuplicateDetector),
        }
    }

    /// Use a similarity collaborator to flag duplicates.
    pub fn with_duplicate_detector(mut self, detector: Arc<dyn DuplicateDetector>) -> Self {
        self.duplicates = detector;
        self
    }

    /// Move the item into `analyzing`. Returns false when it already moved on.
    async fn start(&self, ctx: &JobContext) -> Result<bool> {
        let effect = ItemEffect::new(ctx.item_id())
            .expecting(&[ItemStatus::New, ItemStatus::Analyzing])
            .with_status(ItemStatus::Analyzing);
        match ctx.apply(&effect).await {
            Ok(applied) => Ok(applied),
            Err(Error::ItemNotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }
}

#[async_trait]
impl JobHandler for AnalysisHandler {
    fn job_type(&self) -> JobType {
        JobType::Analysis
    }

    async fn execute(&self, ctx: &JobContext) -> Result<JobOutcome> {
        let item_id = ctx.item_id();

        if !self.start(ctx).await? {
            debug!(
                subsystem = "jobs",
                component = "analysis",
                %item_id,
                "Item no longer awaiting analysis, skipping"
            );
            return Ok(JobOutcome::Success(None));
        }

        let Some(item) = self.store.get(item_id).await? else {
            return Ok(JobOutcome::Success(None));
        };

        if item.content.trim().is_empty() {
            info!(
                subsystem = "jobs",
                component = "analysis",
                %item_id,
                next_step = "processed",
                reason = "empty content",
                "Nothing to analyze"
            );
            let effect = transition_effect(
                item_id,
                ItemStatus::Analyzing,
                Trigger::Classified(ItemStatus::Processed),
            )?;
            return Ok(JobOutcome::Success(Some(effect)));
        }

        let preferred_tags = self
            .store
            .owner_tags(&item.owner, PREFERRED_TAG_LIMIT)
            .await?;

        let classification = match self.classifier.classify(&item, &preferred_tags).await {
            Ok(c) => c,
            Err(e) => {
                warn!(
                    subsystem = "jobs",
                    component = "analysis",
                    %item_id,
                    model = self.classifier.model_name(),
                    error = %e,
                    "Classification failed"
                );
                return Ok(JobOutcome::RetryableFailure(e.to_string()));
            }
        };

        ctx.renew_lease().await?;

        let mut routed = classify_outcome(classification, ctx.today());
        match self.duplicates.find_duplicate(&item, &routed.analysis).await {
            Ok(Some(of)) => {
                info!(
                    subsystem = "jobs",
                    component = "analysis",
                    %item_id,
                    duplicate_of = %of,
                    "Item looks like a duplicate"
                );
                routed = mark_duplicate(routed.analysis, of);
            }
            Ok(None) => {}
            Err(e) => warn!(
                subsystem = "jobs",
                component = "analysis",
                %item_id,
                error = %e,
                "Duplicate check failed, continuing without it"
            ),
        }

        info!(
            subsystem = "jobs",
            component = "analysis",
            %item_id,
            item_status = %routed.status,
            tags = routed.analysis.tags.len(),
            "Item classified"
        );

        let effect = transition_effect(
            item_id,
            ItemStatus::Analyzing,
            Trigger::Classified(routed.status),
        )?
        .with_analysis(routed.analysis);
        Ok(JobOutcome::Success(Some(effect)))
    }

    fn revert_on_failure(&self, job: &WorkerJob) -> Option<ItemEffect> {
        transition_effect(job.item_id, ItemStatus::Analyzing, Trigger::AnalysisFailed).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use chrono::Utc;
    use intake_core::{
        Classification, FollowUpState, ItemStore, JobQueue, LeaseManager, TimelineEvent,
    };
    use intake_db::{test_fixtures, MemoryStore};
    use intake_inference::mock::{FixedDuplicate, MockClassifier};

    const TTL: Duration = Duration::from_secs(600);

    async fn leased_job(store: &Arc<MemoryStore>, content: &str) -> JobContext {
        let item_id = test_fixtures::insert_text_item(store.as_ref(), "me", content)
            .await
            .unwrap();
        let job = store.enqueue(JobType::Analysis, item_id).await.unwrap();
        let job = store.try_lease(&[job.id], "w1", TTL).await.unwrap().remove(0);
        JobContext::new(job, store.clone(), "w1", TTL)
    }

    fn future_date() -> String {
        (Utc::now().date_naive() + chrono::Days::new(10))
            .format("%Y-%m-%d")
            .to_string()
    }

    fn full_event() -> TimelineEvent {
        TimelineEvent {
            date: Some(future_date()),
            time: Some("19:00".to_string()),
            duration: Some("2h".to_string()),
            location: Some("Luigi's".to_string()),
            principal: Some("Sam".to_string()),
        }
    }

    #[tokio::test]
    async fn test_confident_event_routes_to_timeline() {
        let store = Arc::new(MemoryStore::new());
        let ctx = leased_job(&store, "Dinner at Luigi's, Friday 7pm with Sam").await;
        let classifier = Arc::new(MockClassifier::replying(Classification {
            overview: "Dinner with Sam".to_string(),
            tags: vec!["social".to_string()],
            timeline: Some(full_event()),
            ..Default::default()
        }));
        let handler = AnalysisHandler::new(store.clone(), classifier);

        let outcome = handler.execute(&ctx).await.unwrap();
        let JobOutcome::Success(Some(effect)) = outcome else {
            panic!("expected success with effect, got {outcome:?}");
        };
        assert_eq!(effect.expected_status, vec![ItemStatus::Analyzing]);
        assert_eq!(effect.update.status, Some(ItemStatus::Timeline));
        assert!(effect.update.analysis.unwrap().timeline.is_some());

        // Item was moved to analyzing before the call.
        let item = store.get(ctx.item_id()).await.unwrap().unwrap();
        assert_eq!(item.status, ItemStatus::Analyzing);
    }

    #[tokio::test]
    async fn test_passes_owner_tags_as_preferences() {
        let store = Arc::new(MemoryStore::new());
        let earlier = test_fixtures::insert_text_item(store.as_ref(), "me", "old")
            .await
            .unwrap();
        store
            .apply(
                &ItemEffect::new(earlier)
                    .with_status(ItemStatus::Analyzed)
                    .with_analysis(intake_core::Analysis {
                        overview: "old".to_string(),
                        tags: vec!["errands".to_string()],
                        ..Default::default()
                    }),
            )
            .await
            .unwrap();

        let ctx = leased_job(&store, "buy milk").await;
        let classifier = Arc::new(MockClassifier::replying(Classification {
            overview: "Groceries".to_string(),
            ..Default::default()
        }));
        let handler = AnalysisHandler::new(store.clone(), classifier.clone());
        handler.execute(&ctx).await.unwrap();

        assert_eq!(
            classifier.preferred_tags_seen(),
            vec![vec!["errands".to_string()]]
        );
    }

    #[tokio::test]
    async fn test_empty_content_goes_straight_to_processed() {
        let store = Arc::new(MemoryStore::new());
        let ctx = leased_job(&store, "   ").await;
        let classifier = Arc::new(MockClassifier::failing("should not be called"));
        let handler = AnalysisHandler::new(store.clone(), classifier.clone());

        let outcome = handler.execute(&ctx).await.unwrap();
        let JobOutcome::Success(Some(effect)) = outcome else {
            panic!("expected success with effect");
        };
        assert_eq!(effect.update.status, Some(ItemStatus::Processed));
        assert!(effect.update.analysis.is_none());
        assert_eq!(classifier.calls(), 0);
    }

    #[tokio::test]
    async fn test_collaborator_error_is_retryable() {
        let store = Arc::new(MemoryStore::new());
        let ctx = leased_job(&store, "something").await;
        let handler = AnalysisHandler::new(store.clone(), Arc::new(MockClassifier::failing("timeout")));

        let outcome = handler.execute(&ctx).await.unwrap();
        assert!(matches!(outcome, JobOutcome::RetryableFailure(ref e) if e.contains("timeout")));

        let revert = handler.revert_on_failure(&ctx.job).unwrap();
        assert_eq!(revert.expected_status, vec![ItemStatus::Analyzing]);
        assert_eq!(revert.update.status, Some(ItemStatus::New));
    }

    #[tokio::test]
    async fn test_dismissed_item_is_skipped() {
        let store = Arc::new(MemoryStore::new());
        let ctx = leased_job(&store, "something").await;
        store
            .apply(&ItemEffect::new(ctx.item_id()).with_status(ItemStatus::SoftDeleted))
            .await
            .unwrap();
        let classifier = Arc::new(MockClassifier::failing("should not be called"));
        let handler = AnalysisHandler::new(store.clone(), classifier.clone());

        let outcome = handler.execute(&ctx).await.unwrap();
        assert_eq!(outcome, JobOutcome::Success(None));
        assert_eq!(classifier.calls(), 0);
    }

    #[tokio::test]
    async fn test_non_owner_cannot_start_analysis() {
        let store = Arc::new(MemoryStore::new());
        let ctx = leased_job(&store, "something").await;
        let other = JobContext::new(ctx.job.clone(), store.clone(), "w2", TTL);
        let classifier = Arc::new(MockClassifier::replying(Classification {
            overview: "x".to_string(),
            ..Default::default()
        }));
        let handler = AnalysisHandler::new(store.clone(), classifier.clone());

        let err = handler.execute(&other).await.unwrap_err();
        assert!(err.is_lease_lost());
        assert_eq!(classifier.calls(), 0);
        let item = store.get(ctx.item_id()).await.unwrap().unwrap();
        assert_eq!(item.status, ItemStatus::New);
    }

    #[tokio::test]
    async fn test_duplicate_detector_reroutes_to_follow_up() {
        let store = Arc::new(MemoryStore::new());
        let original = test_fixtures::insert_text_item(store.as_ref(), "me", "ticket")
            .await
            .unwrap();
        let ctx = leased_job(&store, "ticket again").await;
        let handler = AnalysisHandler::new(
            store.clone(),
            Arc::new(MockClassifier::replying(Classification {
                overview: "Concert ticket".to_string(),
                timeline: Some(full_event()),
                ..Default::default()
            })),
        )
        .with_duplicate_detector(Arc::new(FixedDuplicate(original)));

        let JobOutcome::Success(Some(effect)) = handler.execute(&ctx).await.unwrap() else {
            panic!("expected success with effect");
        };
        assert_eq!(effect.update.status, Some(ItemStatus::FollowUp));
        let analysis = effect.update.analysis.unwrap();
        assert!(analysis.timeline.is_none());
        let follow_up = analysis.follow_up.unwrap();
        assert_eq!(follow_up.state, FollowUpState::Duplicate { of: Some(original) });
        assert!(follow_up.event.is_some());
    }

    #[tokio::test]
    async fn test_effect_released_with_job() {
        let store = Arc::new(MemoryStore::new());
        let ctx = leased_job(&store, "ambiguous").await;
        let handler = AnalysisHandler::new(
            store.clone(),
            Arc::new(MockClassifier::replying(Classification {
                overview: "Unclear".to_string(),
                follow_up: Some("What is this for?".to_string()),
                ..Default::default()
            })),
        );

        let JobOutcome::Success(effect) = handler.execute(&ctx).await.unwrap() else {
            panic!("expected success");
        };
        let receipt = store
            .release(ctx.job.id, "w1", intake_core::Release::Completed { effect })
            .await
            .unwrap();
        assert!(receipt.effect_applied);

        let item = store.get(ctx.item_id()).await.unwrap().unwrap();
        assert_eq!(item.status, ItemStatus::FollowUp);
        assert_eq!(
            item.follow_up().unwrap().state,
            FollowUpState::NeedsContext
        );
    }
}
