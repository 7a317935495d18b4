//! Re-evaluation of follow-up items once the user has answered.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use intake_core::defaults::PREFERRED_TAG_LIMIT;
use intake_core::{
    resolve_follow_up, transition_effect, Error, FollowUpBackend, ItemStatus, JobType, NoteKind,
    QueueStore, Result, Trigger,
};

use crate::handler::{JobContext, JobHandler, JobOutcome};

/// Error recorded when a follow-up job runs before any answer exists.
pub const NO_FOLLOW_UP_NOTES: &str = "no_follow_up_notes";

/// Passes the user's notes to the follow-up collaborator and applies its decision.
pub struct FollowUpHandler {
    store: Arc<dyn QueueStore>,
    backend: Arc<dyn FollowUpBackend>,
}

impl FollowUpHandler {
    pub fn new(store: Arc<dyn QueueStore>, backend: Arc<dyn FollowUpBackend>) -> Self {
        Self { store, backend }
    }
}

#[async_trait]
impl JobHandler for FollowUpHandler {
    fn job_type(&self) -> JobType {
        JobType::FollowUp
    }

    async fn execute(&self, ctx: &JobContext) -> Result<JobOutcome> {
        let item_id = ctx.item_id();
        let Some(item) = self.store.get(item_id).await? else {
            return Ok(JobOutcome::Success(None));
        };

        let analysis = match item.analysis {
            Some(ref analysis)
                if item.status == ItemStatus::FollowUp && analysis.follow_up.is_some() =>
            {
                analysis.clone()
            }
            _ => {
                debug!(
                    subsystem = "jobs",
                    component = "follow_up",
                    %item_id,
                    item_status = %item.status,
                    "Item has no open follow-up, skipping"
                );
                return Ok(JobOutcome::Success(None));
            }
        };

        let notes = self
            .store
            .list_notes(item_id, Some(NoteKind::FollowUp))
            .await?;
        if notes.is_empty() {
            return Ok(JobOutcome::RetryableFailure(NO_FOLLOW_UP_NOTES.to_string()));
        }

        let preferred_tags = self
            .store
            .owner_tags(&item.owner, PREFERRED_TAG_LIMIT)
            .await?;

        let resolution = match self
            .backend
            .resolve(&item, &analysis, &notes, &preferred_tags)
            .await
        {
            Ok(r) => r,
            Err(e) => {
                warn!(
                    subsystem = "jobs",
                    component = "follow_up",
                    %item_id,
                    error = %e,
                    "Follow-up resolution failed"
                );
                return Ok(JobOutcome::RetryableFailure(e.to_string()));
            }
        };

        ctx.renew_lease().await?;

        let routed = match resolve_follow_up(
            &resolution.action,
            &analysis,
            resolution.analysis,
            ctx.today(),
        ) {
            Ok(routed) => routed,
            Err(Error::InvalidResponse(msg)) => return Ok(JobOutcome::RetryableFailure(msg)),
            Err(e) => return Ok(JobOutcome::PermanentFailure(e.to_string())),
        };

        info!(
            subsystem = "jobs",
            component = "follow_up",
            %item_id,
            action = resolution.action.as_str(),
            item_status = %routed.status,
            notes = notes.len(),
            "Follow-up resolved"
        );

        let effect = transition_effect(
            item_id,
            ItemStatus::FollowUp,
            Trigger::FollowUpResolved(routed.status),
        )?
        .with_analysis(routed.analysis);
        Ok(JobOutcome::Success(Some(effect)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use intake_core::{
        Analysis, Classification, FollowUp, FollowUpAction, FollowUpResolution, FollowUpState,
        ItemEffect, ItemStore, JobQueue, LeaseManager, NewItemNote,
    };
    use intake_db::{test_fixtures, MemoryStore};
    use intake_inference::mock::MockFollowUp;
    use uuid::Uuid;

    const TTL: Duration = Duration::from_secs(60);

    async fn follow_up_item(store: &Arc<MemoryStore>, state: FollowUpState) -> Uuid {
        let id = test_fixtures::insert_text_item(store.as_ref(), "me", "concert?")
            .await
            .unwrap();
        let analysis = Analysis {
            overview: "Concert".to_string(),
            follow_up: Some(FollowUp::new("Are you going?", state)),
            ..Default::default()
        };
        store
            .apply(
                &ItemEffect::new(id)
                    .with_status(ItemStatus::FollowUp)
                    .with_analysis(analysis),
            )
            .await
            .unwrap();
        id
    }

    async fn note(store: &Arc<MemoryStore>, item_id: Uuid, text: &str) {
        store
            .add_note(NewItemNote {
                item_id,
                owner: "me".to_string(),
                text: text.to_string(),
                kind: NoteKind::FollowUp,
            })
            .await
            .unwrap();
    }

    async fn ctx(store: &Arc<MemoryStore>, item_id: Uuid) -> JobContext {
        let job = store.enqueue(JobType::FollowUp, item_id).await.unwrap();
        let job = store.try_lease(&[job.id], "w1", TTL).await.unwrap().remove(0);
        JobContext::new(job, store.clone(), "w1", TTL)
    }

    #[tokio::test]
    async fn test_delete_action_soft_deletes() {
        let store = Arc::new(MemoryStore::new());
        let id = follow_up_item(&store, FollowUpState::Triage).await;
        note(&store, id, "delete this").await;
        let backend = Arc::new(MockFollowUp::action(FollowUpAction::Delete));
        let handler = FollowUpHandler::new(store.clone(), backend.clone());

        let JobOutcome::Success(Some(effect)) = handler.execute(&ctx(&store, id).await).await.unwrap()
        else {
            panic!("expected success with effect");
        };
        assert_eq!(effect.expected_status, vec![ItemStatus::FollowUp]);
        assert_eq!(effect.update.status, Some(ItemStatus::SoftDeleted));
        assert_eq!(backend.notes_seen(), vec![1]);
    }

    #[tokio::test]
    async fn test_needs_context_update_returns_to_triage() {
        let store = Arc::new(MemoryStore::new());
        let id = follow_up_item(&store, FollowUpState::NeedsContext).await;
        note(&store, id, "it's for work, not sure when").await;
        let handler = FollowUpHandler::new(
            store.clone(),
            Arc::new(MockFollowUp::replying(FollowUpResolution {
                action: FollowUpAction::Update,
                analysis: Some(Classification {
                    overview: "Work concert".to_string(),
                    follow_up: Some("Which date?".to_string()),
                    ..Default::default()
                }),
            })),
        );

        let JobOutcome::Success(Some(effect)) = handler.execute(&ctx(&store, id).await).await.unwrap()
        else {
            panic!("expected success with effect");
        };
        assert_eq!(effect.update.status, Some(ItemStatus::FollowUp));
        let follow_up = effect.update.analysis.unwrap().follow_up.unwrap();
        assert_eq!(follow_up.state, FollowUpState::Triage);
        assert_eq!(follow_up.question, "Which date?");
    }

    #[tokio::test]
    async fn test_no_notes_is_retryable() {
        let store = Arc::new(MemoryStore::new());
        let id = follow_up_item(&store, FollowUpState::Triage).await;
        let backend = Arc::new(MockFollowUp::action(FollowUpAction::Archive));
        let handler = FollowUpHandler::new(store.clone(), backend.clone());

        let outcome = handler.execute(&ctx(&store, id).await).await.unwrap();
        assert_eq!(
            outcome,
            JobOutcome::RetryableFailure(NO_FOLLOW_UP_NOTES.to_string())
        );
        assert_eq!(backend.calls(), 0);
    }

    #[tokio::test]
    async fn test_context_notes_do_not_count() {
        let store = Arc::new(MemoryStore::new());
        let id = follow_up_item(&store, FollowUpState::Triage).await;
        store
            .add_note(NewItemNote {
                item_id: id,
                owner: "me".to_string(),
                text: "unrelated".to_string(),
                kind: NoteKind::Context,
            })
            .await
            .unwrap();
        let handler = FollowUpHandler::new(
            store.clone(),
            Arc::new(MockFollowUp::action(FollowUpAction::Archive)),
        );

        let outcome = handler.execute(&ctx(&store, id).await).await.unwrap();
        assert!(matches!(outcome, JobOutcome::RetryableFailure(_)));
    }

    #[tokio::test]
    async fn test_item_not_in_follow_up_is_noop() {
        let store = Arc::new(MemoryStore::new());
        let id = test_fixtures::insert_text_item(store.as_ref(), "me", "x")
            .await
            .unwrap();
        note(&store, id, "hello").await;
        let backend = Arc::new(MockFollowUp::action(FollowUpAction::Archive));
        let handler = FollowUpHandler::new(store.clone(), backend.clone());

        let outcome = handler.execute(&ctx(&store, id).await).await.unwrap();
        assert_eq!(outcome, JobOutcome::Success(None));
        assert_eq!(backend.calls(), 0);
    }

    #[tokio::test]
    async fn test_unknown_action_is_permanent() {
        let store = Arc::new(MemoryStore::new());
        let id = follow_up_item(&store, FollowUpState::Triage).await;
        note(&store, id, "snooze it").await;
        let handler = FollowUpHandler::new(
            store.clone(),
            Arc::new(MockFollowUp::action(FollowUpAction::Unknown("snooze".to_string()))),
        );

        let outcome = handler.execute(&ctx(&store, id).await).await.unwrap();
        assert!(matches!(outcome, JobOutcome::PermanentFailure(ref e) if e.contains("snooze")));
    }

    #[tokio::test]
    async fn test_update_without_analysis_is_retryable() {
        let store = Arc::new(MemoryStore::new());
        let id = follow_up_item(&store, FollowUpState::Triage).await;
        note(&store, id, "moved to next week").await;
        let handler = FollowUpHandler::new(
            store.clone(),
            Arc::new(MockFollowUp::action(FollowUpAction::Update)),
        );

        let outcome = handler.execute(&ctx(&store, id).await).await.unwrap();
        assert!(matches!(outcome, JobOutcome::RetryableFailure(_)));
    }

    #[tokio::test]
    async fn test_collaborator_error_is_retryable() {
        let store = Arc::new(MemoryStore::new());
        let id = follow_up_item(&store, FollowUpState::Triage).await;
        note(&store, id, "done").await;
        let handler =
            FollowUpHandler::new(store.clone(), Arc::new(MockFollowUp::failing("rate limited")));

        let outcome = handler.execute(&ctx(&store, id).await).await.unwrap();
        assert!(matches!(outcome, JobOutcome::RetryableFailure(ref e) if e.contains("rate limited")));
    }
}
