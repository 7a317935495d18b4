//! Best-effort title normalization.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use intake_core::{ItemEffect, JobType, NormalizationBackend, QueueStore, Result};

use crate::handler::{JobContext, JobHandler, JobOutcome};

/// Asks the normalizer for a friendlier title. Never fails on collaborator errors.
pub struct NormalizeHandler {
    store: Arc<dyn QueueStore>,
    normalizer: Arc<dyn NormalizationBackend>,
}

impl NormalizeHandler {
    pub fn new(store: Arc<dyn QueueStore>, normalizer: Arc<dyn NormalizationBackend>) -> Self {
        Self { store, normalizer }
    }
}

#[async_trait]
impl JobHandler for NormalizeHandler {
    fn job_type(&self) -> JobType {
        JobType::Normalize
    }

    async fn execute(&self, ctx: &JobContext) -> Result<JobOutcome> {
        let Some(item) = self.store.get(ctx.item_id()).await? else {
            return Ok(JobOutcome::Success(None));
        };

        let title = match self.normalizer.normalize_title(&item).await {
            Ok(title) => title.map(|t| t.trim().to_string()).filter(|t| !t.is_empty()),
            Err(e) => {
                warn!(
                    subsystem = "jobs",
                    component = "normalize",
                    item_id = %item.id,
                    error = %e,
                    "Normalization failed, keeping current title"
                );
                None
            }
        };

        let mut effect = ItemEffect::new(item.id).mark_normalized();
        match title {
            Some(title) if item.title.as_deref() != Some(title.as_str()) => {
                debug!(
                    subsystem = "jobs",
                    component = "normalize",
                    item_id = %item.id,
                    %title,
                    "Title normalized"
                );
                effect = effect.with_title(title);
            }
            _ => {}
        }

        Ok(JobOutcome::Success(Some(effect)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use intake_core::{ItemStore, JobQueue, LeaseManager};
    use intake_db::{test_fixtures, MemoryStore};
    use intake_inference::mock::MockNormalizer;

    const TTL: Duration = Duration::from_secs(60);

    async fn ctx(store: &Arc<MemoryStore>) -> JobContext {
        let item_id = test_fixtures::insert_text_item(store.as_ref(), "me", "plumber tmrw")
            .await
            .unwrap();
        let job = store.enqueue(JobType::Normalize, item_id).await.unwrap();
        let job = store.try_lease(&[job.id], "w1", TTL).await.unwrap().remove(0);
        JobContext::new(job, store.clone(), "w1", TTL)
    }

    #[tokio::test]
    async fn test_sets_title_and_marks_normalized() {
        let store = Arc::new(MemoryStore::new());
        let ctx = ctx(&store).await;
        let handler = NormalizeHandler::new(
            store.clone(),
            Arc::new(MockNormalizer::replying(Some(" Call the plumber ".to_string()))),
        );

        let JobOutcome::Success(Some(effect)) = handler.execute(&ctx).await.unwrap() else {
            panic!("expected success with effect");
        };
        assert!(effect.expected_status.is_empty());
        assert_eq!(effect.update.title.as_deref(), Some("Call the plumber"));
        assert!(effect.update.mark_normalized);
        assert!(effect.update.status.is_none());
    }

    #[tokio::test]
    async fn test_collaborator_error_still_succeeds() {
        let store = Arc::new(MemoryStore::new());
        let ctx = ctx(&store).await;
        let handler =
            NormalizeHandler::new(store.clone(), Arc::new(MockNormalizer::failing("503")));

        let JobOutcome::Success(Some(effect)) = handler.execute(&ctx).await.unwrap() else {
            panic!("expected success with effect");
        };
        assert!(effect.update.title.is_none());
        assert!(effect.update.mark_normalized);

        store.apply(&effect).await.unwrap();
        let item = store.get(ctx.item_id()).await.unwrap().unwrap();
        assert!(item.is_normalized);
        assert!(item.title.is_none());
    }

    #[tokio::test]
    async fn test_no_title_keeps_current() {
        let store = Arc::new(MemoryStore::new());
        let ctx = ctx(&store).await;
        let handler = NormalizeHandler::new(store.clone(), Arc::new(MockNormalizer::replying(None)));

        let JobOutcome::Success(Some(effect)) = handler.execute(&ctx).await.unwrap() else {
            panic!("expected success with effect");
        };
        assert!(effect.update.title.is_none());
    }

    #[tokio::test]
    async fn test_missing_item_is_noop() {
        let store = Arc::new(MemoryStore::new());
        let ctx = ctx(&store).await;
        store.hard_delete(ctx.item_id()).await.unwrap();
        let normalizer = Arc::new(MockNormalizer::replying(Some("x".to_string())));
        let handler = NormalizeHandler::new(store.clone(), normalizer.clone());

        assert_eq!(handler.execute(&ctx).await.unwrap(), JobOutcome::Success(None));
        assert_eq!(normalizer.calls(), 0);
    }
}
