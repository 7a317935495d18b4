//! In-memory store with the same semantics as the Postgres repositories.
//!
//! A single mutex guards all state, so every trait method is atomic in the
//! same way the Postgres conditional writes are. The clock can be pushed
//! forward with [`MemoryStore::advance`] to exercise backoff and lease expiry
//! without sleeping.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use tokio::sync::Mutex;
use uuid::Uuid;

use intake_core::{
    new_v7, Error, FollowUpState, Item, ItemEffect, ItemNote, ItemStatus, ItemStore, JobQueue,
    JobStatus, JobType, LeaseManager, NewItem, NewItemNote, NoteKind, QueueStats, Release,
    ReleaseReceipt, Result, StatusCount, WorkerJob,
};

use crate::items::retag;

fn oldest_first<'a>(items: impl Iterator<Item = &'a Item>, limit: i64) -> Vec<Item> {
    let mut items: Vec<Item> = items.cloned().collect();
    items.sort_by_key(|i| (i.updated_at, i.id));
    items.truncate(limit.max(0) as usize);
    items
}

struct State {
    items: HashMap<Uuid, Item>,
    notes: Vec<ItemNote>,
    jobs: HashMap<Uuid, WorkerJob>,
    offset: chrono::Duration,
}

impl Default for State {
    fn default() -> Self {
        Self {
            items: HashMap::new(),
            notes: Vec::new(),
            jobs: HashMap::new(),
            offset: chrono::Duration::zero(),
        }
    }
}

impl State {
    fn now(&self) -> DateTime<Utc> {
        Utc::now() + self.offset
    }

    /// Check an effect against the current item without writing.
    fn effect_applies(&self, effect: &ItemEffect) -> Result<bool> {
        let item = self
            .items
            .get(&effect.item_id)
            .ok_or(Error::ItemNotFound(effect.item_id))?;
        Ok(effect.matches(item.status))
    }

    fn insert_item(&mut self, item: NewItem) -> Item {
        let now = self.now();
        let item = Item {
            id: new_v7(),
            owner: item.owner,
            content_type: item.content_type,
            content: item.content,
            title: item.title,
            status: ItemStatus::New,
            analysis: None,
            metadata: item.metadata,
            is_normalized: false,
            created_at: now,
            updated_at: now,
        };
        self.items.insert(item.id, item.clone());
        item
    }

    fn insert_job(&mut self, job_type: JobType, item_id: Uuid) -> Result<WorkerJob> {
        if !self.items.contains_key(&item_id) {
            return Err(Error::InvalidTarget(item_id));
        }
        let now = self.now();
        let job = WorkerJob {
            id: new_v7(),
            job_type,
            item_id,
            status: JobStatus::Queued,
            attempts: 0,
            lease_owner: None,
            lease_expires_at: None,
            available_at: now,
            last_error: None,
            last_error_at: None,
            created_at: now,
            updated_at: now,
        };
        self.jobs.insert(job.id, job.clone());
        Ok(job)
    }

    fn apply_effect(&mut self, effect: &ItemEffect) -> Result<bool> {
        if !self.effect_applies(effect)? {
            return Ok(false);
        }
        let now = self.now();
        if let Some(item) = self.items.get_mut(&effect.item_id) {
            effect.update.apply_to(item);
            item.updated_at = now;
        }
        Ok(true)
    }
}

fn to_chrono(d: Duration) -> Result<chrono::Duration> {
    chrono::Duration::from_std(d).map_err(|e| Error::Internal(format!("duration out of range: {e}")))
}

/// In-memory implementation of every store trait.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current store time, including any offset applied by `advance`.
    pub async fn now(&self) -> DateTime<Utc> {
        self.state.lock().await.now()
    }

    /// Move the store clock forward.
    pub async fn advance(&self, by: Duration) -> Result<()> {
        let by = to_chrono(by)?;
        let mut state = self.state.lock().await;
        state.offset = state.offset + by;
        Ok(())
    }

    /// Every job in the store, oldest first.
    pub async fn all_jobs(&self) -> Vec<WorkerJob> {
        let state = self.state.lock().await;
        let mut jobs: Vec<WorkerJob> = state.jobs.values().cloned().collect();
        jobs.sort_by_key(|j| (j.created_at, j.id));
        jobs
    }
}

#[async_trait]
impl ItemStore for MemoryStore {
    async fn insert(&self, item: NewItem) -> Result<Item> {
        Ok(self.state.lock().await.insert_item(item))
    }

    async fn insert_with_jobs(
        &self,
        item: NewItem,
        job_types: &[JobType],
    ) -> Result<(Item, Vec<WorkerJob>)> {
        let mut state = self.state.lock().await;
        let item = state.insert_item(item);
        let jobs = job_types
            .iter()
            .map(|job_type| state.insert_job(*job_type, item.id))
            .collect::<Result<Vec<_>>>()?;
        Ok((item, jobs))
    }

    async fn get(&self, id: Uuid) -> Result<Option<Item>> {
        Ok(self.state.lock().await.items.get(&id).cloned())
    }

    async fn apply(&self, effect: &ItemEffect) -> Result<bool> {
        self.state.lock().await.apply_effect(effect)
    }

    async fn update_details(
        &self,
        id: Uuid,
        title: Option<String>,
        tags: Option<Vec<String>>,
    ) -> Result<Item> {
        let mut state = self.state.lock().await;
        let now = state.now();
        let item = state.items.get_mut(&id).ok_or(Error::ItemNotFound(id))?;

        if let Some(tags) = tags {
            item.analysis = Some(retag(item, tags)?);
        }
        if let Some(title) = title {
            item.title = Some(title);
        }
        item.updated_at = now;
        Ok(item.clone())
    }

    async fn hard_delete(&self, id: Uuid) -> Result<bool> {
        let mut state = self.state.lock().await;
        if state.items.remove(&id).is_none() {
            return Ok(false);
        }
        state.notes.retain(|n| n.item_id != id);
        state.jobs.retain(|_, j| j.item_id != id);
        Ok(true)
    }

    async fn list_passed_timeline(&self, today: NaiveDate, limit: i64) -> Result<Vec<Item>> {
        let state = self.state.lock().await;
        Ok(oldest_first(
            state.items.values().filter(|i| {
                i.status == ItemStatus::Timeline
                    && i.timeline()
                        .and_then(|ev| ev.event_date())
                        .is_some_and(|date| date < today)
            }),
            limit,
        ))
    }

    async fn list_due_deferred(&self, now: DateTime<Utc>, limit: i64) -> Result<Vec<Item>> {
        let state = self.state.lock().await;
        Ok(oldest_first(
            state.items.values().filter(|i| {
                i.status == ItemStatus::FollowUp
                    && matches!(
                        i.follow_up().map(|f| &f.state),
                        Some(FollowUpState::Deferred { until }) if *until <= now
                    )
            }),
            limit,
        ))
    }

    async fn count_by_status(&self) -> Result<Vec<StatusCount>> {
        let state = self.state.lock().await;
        Ok(ItemStatus::ALL
            .into_iter()
            .map(|status| StatusCount {
                status,
                count: state.items.values().filter(|i| i.status == status).count() as i64,
            })
            .filter(|c| c.count > 0)
            .collect())
    }

    async fn owner_tags(&self, owner: &str, limit: i64) -> Result<Vec<String>> {
        let state = self.state.lock().await;
        let mut uses: HashMap<&str, i64> = HashMap::new();
        for item in state
            .items
            .values()
            .filter(|i| i.owner == owner && i.status != ItemStatus::SoftDeleted)
        {
            for tag in item.analysis.iter().flat_map(|a| a.tags.iter()) {
                *uses.entry(tag.as_str()).or_default() += 1;
            }
        }

        let mut ranked: Vec<(&str, i64)> = uses.into_iter().collect();
        ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(b.0)));
        Ok(ranked
            .into_iter()
            .take(limit.max(0) as usize)
            .map(|(tag, _)| tag.to_string())
            .collect())
    }

    async fn add_note(&self, note: NewItemNote) -> Result<ItemNote> {
        let mut state = self.state.lock().await;
        if !state.items.contains_key(&note.item_id) {
            return Err(Error::InvalidTarget(note.item_id));
        }
        let note = ItemNote {
            id: new_v7(),
            item_id: note.item_id,
            owner: note.owner,
            text: note.text,
            kind: note.kind,
            created_at: state.now(),
        };
        state.notes.push(note.clone());
        Ok(note)
    }

    async fn list_notes(&self, item_id: Uuid, kind: Option<NoteKind>) -> Result<Vec<ItemNote>> {
        let state = self.state.lock().await;
        Ok(state
            .notes
            .iter()
            .filter(|n| n.item_id == item_id && kind.map_or(true, |k| n.kind == k))
            .cloned()
            .collect())
    }
}

#[async_trait]
impl JobQueue for MemoryStore {
    async fn enqueue(&self, job_type: JobType, item_id: Uuid) -> Result<WorkerJob> {
        self.state.lock().await.insert_job(job_type, item_id)
    }

    async fn get_job(&self, job_id: Uuid) -> Result<Option<WorkerJob>> {
        Ok(self.state.lock().await.jobs.get(&job_id).cloned())
    }

    async fn list_due(&self, job_type: Option<JobType>, limit: i64) -> Result<Vec<WorkerJob>> {
        let state = self.state.lock().await;
        let now = state.now();
        let mut due: Vec<WorkerJob> = state
            .jobs
            .values()
            .filter(|j| j.is_due(now) && job_type.map_or(true, |jt| j.job_type == jt))
            .cloned()
            .collect();
        due.sort_by_key(|j| (j.available_at, j.created_at, j.id));
        due.truncate(limit.max(0) as usize);
        Ok(due)
    }

    async fn list_for_item(&self, item_id: Uuid) -> Result<Vec<WorkerJob>> {
        let state = self.state.lock().await;
        let mut jobs: Vec<WorkerJob> = state
            .jobs
            .values()
            .filter(|j| j.item_id == item_id)
            .cloned()
            .collect();
        jobs.sort_by_key(|j| (j.created_at, j.id));
        Ok(jobs)
    }

    async fn requeue_stale_leases(&self) -> Result<u64> {
        let mut state = self.state.lock().await;
        let now = state.now();
        let mut count = 0;
        for job in state.jobs.values_mut().filter(|j| j.is_lease_stale(now)) {
            job.status = JobStatus::Queued;
            job.lease_owner = None;
            job.lease_expires_at = None;
            job.updated_at = now;
            count += 1;
        }
        Ok(count)
    }

    async fn list_failed(&self, job_type: Option<JobType>, limit: i64) -> Result<Vec<WorkerJob>> {
        let state = self.state.lock().await;
        let mut failed: Vec<WorkerJob> = state
            .jobs
            .values()
            .filter(|j| {
                j.status == JobStatus::Failed && job_type.map_or(true, |jt| j.job_type == jt)
            })
            .cloned()
            .collect();
        failed.sort_by(|a, b| b.updated_at.cmp(&a.updated_at).then_with(|| b.id.cmp(&a.id)));
        failed.truncate(limit.max(0) as usize);
        Ok(failed)
    }

    async fn reset_failed(&self, job_type: JobType, error: &str) -> Result<u64> {
        let mut state = self.state.lock().await;
        let now = state.now();
        let mut count = 0;
        for job in state.jobs.values_mut().filter(|j| {
            j.status == JobStatus::Failed
                && j.job_type == job_type
                && j.last_error.as_deref() == Some(error)
        }) {
            job.status = JobStatus::Queued;
            job.attempts = 0;
            job.available_at = now;
            job.updated_at = now;
            count += 1;
        }
        Ok(count)
    }

    async fn requeue_failed(&self, job_id: Uuid) -> Result<bool> {
        let mut state = self.state.lock().await;
        let now = state.now();
        match state.jobs.get_mut(&job_id) {
            Some(job) if job.status == JobStatus::Failed => {
                job.status = JobStatus::Queued;
                job.available_at = now;
                job.updated_at = now;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn queue_stats(&self) -> Result<Vec<QueueStats>> {
        let state = self.state.lock().await;
        Ok(JobType::ALL
            .into_iter()
            .map(|jt| {
                let mut stats = QueueStats::empty(jt);
                for job in state.jobs.values().filter(|j| j.job_type == jt) {
                    stats.add(job.status, 1);
                }
                stats
            })
            .collect())
    }
}

#[async_trait]
impl LeaseManager for MemoryStore {
    async fn try_lease(
        &self,
        job_ids: &[Uuid],
        worker_id: &str,
        ttl: Duration,
    ) -> Result<Vec<WorkerJob>> {
        let ttl = to_chrono(ttl)?;
        let mut state = self.state.lock().await;
        let now = state.now();
        let mut leased = Vec::new();
        for id in job_ids {
            if let Some(job) = state.jobs.get_mut(id).filter(|j| j.is_due(now)) {
                job.status = JobStatus::Leased;
                job.lease_owner = Some(worker_id.to_string());
                job.lease_expires_at = Some(now + ttl);
                job.attempts += 1;
                job.updated_at = now;
                leased.push(job.clone());
            }
        }
        Ok(leased)
    }

    async fn renew(&self, job_id: Uuid, worker_id: &str, ttl: Duration) -> Result<DateTime<Utc>> {
        let ttl = to_chrono(ttl)?;
        let mut state = self.state.lock().await;
        let now = state.now();
        let job = state
            .jobs
            .get_mut(&job_id)
            .filter(|j| j.is_owned_by(worker_id))
            .ok_or(Error::LeaseLost { job_id })?;
        let expires_at = now + ttl;
        job.lease_expires_at = Some(expires_at);
        job.updated_at = now;
        Ok(expires_at)
    }

    async fn release(
        &self,
        job_id: Uuid,
        worker_id: &str,
        release: Release,
    ) -> Result<ReleaseReceipt> {
        let mut state = self.state.lock().await;
        let now = state.now();

        if !state
            .jobs
            .get(&job_id)
            .is_some_and(|j| j.is_owned_by(worker_id))
        {
            return Err(Error::LeaseLost { job_id });
        }

        // Validate the effect first so a failure leaves the job untouched.
        if let Some(effect) = release.item_effect() {
            state.effect_applies(effect)?;
        }

        let available_at = match &release {
            Release::Retry { delay, .. } => now + to_chrono(*delay)?,
            _ => now,
        };

        let effect_applied = match release.item_effect() {
            Some(effect) => state.apply_effect(effect)?,
            None => false,
        };

        let job = state
            .jobs
            .get_mut(&job_id)
            .ok_or(Error::LeaseLost { job_id })?;
        job.status = release.job_status();
        job.lease_owner = None;
        job.lease_expires_at = None;
        job.updated_at = now;
        match &release {
            Release::Completed { .. } => {}
            Release::Retry { error, .. } => {
                job.available_at = available_at;
                job.last_error = Some(error.clone());
                job.last_error_at = Some(now);
            }
            Release::Failed { error, .. } => {
                job.last_error = Some(error.clone());
                job.last_error_at = Some(now);
            }
        }

        Ok(ReleaseReceipt {
            job: job.clone(),
            effect_applied,
        })
    }

    async fn apply_as_owner(
        &self,
        job_id: Uuid,
        worker_id: &str,
        effect: &ItemEffect,
    ) -> Result<bool> {
        let mut state = self.state.lock().await;
        if !state
            .jobs
            .get(&job_id)
            .is_some_and(|j| j.is_owned_by(worker_id))
        {
            return Err(Error::LeaseLost { job_id });
        }
        state.apply_effect(effect)
    }
}
