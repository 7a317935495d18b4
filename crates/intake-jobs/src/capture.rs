//! Capture surface used by front-ends.
//!
//! Front-ends never write items or jobs directly. They capture content,
//! attach notes and make the few explicit user decisions (dismiss, archive,
//! defer, delete) through this service, which checks ownership and routes
//! every status change through the lifecycle rules.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::info;
use uuid::Uuid;

use intake_core::{
    transition_effect, ContentType, Error, FollowUpState, Item, ItemEffect, ItemMetadata,
    ItemNote, ItemStatus, JobType, NewItem, NewItemNote, NoteKind, QueueStore, Result, Trigger,
    WorkerJob,
};

/// A new piece of captured content.
#[derive(Debug, Clone)]
pub struct CaptureRequest {
    pub owner: String,
    pub content_type: ContentType,
    pub content: String,
    pub title: Option<String>,
    pub metadata: Option<ItemMetadata>,
}

/// Result of a capture: the item and the jobs queued for it.
#[derive(Debug, Clone)]
pub struct Captured {
    pub item: Item,
    pub jobs: Vec<WorkerJob>,
}

/// Result of adding a note.
#[derive(Debug, Clone)]
pub struct NoteAdded {
    pub note: ItemNote,
    /// The `follow_up` job queued for a follow-up note.
    pub job: Option<WorkerJob>,
}

/// Entry point for captures and explicit user actions.
#[derive(Clone)]
pub struct CaptureService {
    store: Arc<dyn QueueStore>,
}

impl CaptureService {
    pub fn new(store: Arc<dyn QueueStore>) -> Self {
        Self { store }
    }

    /// Store a new item and queue its analysis and normalize jobs.
    pub async fn capture(&self, request: CaptureRequest) -> Result<Captured> {
        let owner = request.owner.trim();
        if owner.is_empty() {
            return Err(Error::InvalidInput("owner is required".to_string()));
        }

        let (item, jobs) = self
            .store
            .insert_with_jobs(
                NewItem {
                    owner: owner.to_string(),
                    content_type: request.content_type,
                    content: request.content,
                    title: request.title.filter(|t| !t.trim().is_empty()),
                    metadata: request.metadata,
                },
                &[JobType::Analysis, JobType::Normalize],
            )
            .await?;

        info!(
            subsystem = "jobs",
            component = "capture",
            item_id = %item.id,
            content_type = %item.content_type,
            "Item captured"
        );
        Ok(Captured { item, jobs })
    }

    /// Fetch an item, checking it belongs to `owner`.
    async fn owned(&self, item_id: Uuid, owner: &str) -> Result<Item> {
        let item = self
            .store
            .get(item_id)
            .await?
            .ok_or(Error::InvalidTarget(item_id))?;
        if item.owner != owner {
            return Err(Error::Forbidden(format!(
                "item {item_id} belongs to another owner"
            )));
        }
        Ok(item)
    }

    /// Apply an effect built from `item`, then return the updated item.
    async fn commit(&self, item: &Item, effect: ItemEffect, trigger: &str) -> Result<Item> {
        if !self.store.apply(&effect).await? {
            // Lost a race with a worker; report against what is there now.
            let current = self
                .store
                .get(item.id)
                .await?
                .ok_or(Error::InvalidTarget(item.id))?;
            return Err(Error::InvalidTransition {
                from: current.status,
                trigger: trigger.to_string(),
            });
        }
        self.store
            .get(item.id)
            .await?
            .ok_or(Error::InvalidTarget(item.id))
    }

    /// Attach a note. A follow-up note queues a `follow_up` job.
    pub async fn add_note(
        &self,
        item_id: Uuid,
        owner: &str,
        text: &str,
        kind: NoteKind,
    ) -> Result<NoteAdded> {
        let text = text.trim();
        if text.is_empty() {
            return Err(Error::InvalidInput("note text is empty".to_string()));
        }
        self.owned(item_id, owner).await?;

        let note = self
            .store
            .add_note(NewItemNote {
                item_id,
                owner: owner.to_string(),
                text: text.to_string(),
                kind,
            })
            .await?;

        let job = match kind {
            NoteKind::FollowUp => Some(self.store.enqueue(JobType::FollowUp, item_id).await?),
            NoteKind::Context => None,
        };

        info!(
            subsystem = "jobs",
            component = "capture",
            %item_id,
            kind = kind.as_str(),
            queued = job.is_some(),
            "Note added"
        );
        Ok(NoteAdded { note, job })
    }

    /// Edit title and tags regardless of status.
    pub async fn update_details(
        &self,
        item_id: Uuid,
        owner: &str,
        title: Option<String>,
        tags: Option<Vec<String>>,
    ) -> Result<Item> {
        self.owned(item_id, owner).await?;
        self.store.update_details(item_id, title, tags).await
    }

    /// Move an item to `soft_deleted`.
    pub async fn dismiss(&self, item_id: Uuid, owner: &str) -> Result<Item> {
        let item = self.owned(item_id, owner).await?;
        let mut effect = transition_effect(item.id, item.status, Trigger::Dismissed)?;
        // A dismissed item leaves the timeline for good.
        if let Some(mut analysis) = item.analysis.clone().filter(|a| a.timeline.is_some()) {
            analysis.timeline = None;
            effect = effect.with_analysis(analysis);
        }
        let item = self.commit(&item, effect, "dismissed").await?;
        info!(subsystem = "jobs", component = "capture", %item_id, "Item dismissed");
        Ok(item)
    }

    /// Move a non-terminal item to `processed`.
    pub async fn archive(&self, item_id: Uuid, owner: &str) -> Result<Item> {
        let item = self.owned(item_id, owner).await?;
        let effect = transition_effect(item.id, item.status, Trigger::Archived)?;
        let item = self.commit(&item, effect, "archived").await?;
        info!(subsystem = "jobs", component = "capture", %item_id, "Item archived");
        Ok(item)
    }

    /// Snooze a follow-up item until `until`.
    pub async fn defer(&self, item_id: Uuid, owner: &str, until: DateTime<Utc>) -> Result<Item> {
        if until <= Utc::now() {
            return Err(Error::InvalidInput(
                "deferral must end in the future".to_string(),
            ));
        }
        let item = self.owned(item_id, owner).await?;

        let mut analysis = match item.analysis.clone() {
            Some(a) if item.status == ItemStatus::FollowUp && a.follow_up.is_some() => a,
            _ => {
                return Err(Error::InvalidTransition {
                    from: item.status,
                    trigger: "deferred".to_string(),
                })
            }
        };
        if let Some(ref mut follow_up) = analysis.follow_up {
            follow_up.state = FollowUpState::Deferred { until };
        }

        let effect = ItemEffect::new(item.id)
            .expecting(&[ItemStatus::FollowUp])
            .with_analysis(analysis);
        let item = self.commit(&item, effect, "deferred").await?;
        info!(subsystem = "jobs", component = "capture", %item_id, %until, "Follow-up deferred");
        Ok(item)
    }

    /// Remove the item with its notes and jobs.
    pub async fn delete(&self, item_id: Uuid, owner: &str) -> Result<()> {
        self.owned(item_id, owner).await?;
        if !self.store.hard_delete(item_id).await? {
            return Err(Error::InvalidTarget(item_id));
        }
        info!(subsystem = "jobs", component = "capture", %item_id, "Item deleted");
        Ok(())
    }
}
