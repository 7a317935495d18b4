//! Data models for captured items, notes, and worker jobs.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Error;

// =============================================================================
// ITEM TYPES
// =============================================================================

/// Kind of content an item holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentType {
    Text,
    WebUrl,
    Image,
    Video,
    Audio,
    File,
    Screenshot,
}

impl ContentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContentType::Text => "text",
            ContentType::WebUrl => "web_url",
            ContentType::Image => "image",
            ContentType::Video => "video",
            ContentType::Audio => "audio",
            ContentType::File => "file",
            ContentType::Screenshot => "screenshot",
        }
    }

    /// Content is an image the model should look at directly.
    pub fn is_visual(&self) -> bool {
        matches!(self, ContentType::Image | ContentType::Screenshot)
    }

    /// Content is a link to something stored elsewhere.
    pub fn is_remote(&self) -> bool {
        matches!(
            self,
            ContentType::WebUrl | ContentType::Video | ContentType::Audio | ContentType::File
        )
    }
}

impl fmt::Display for ContentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ContentType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "text" => Ok(ContentType::Text),
            "web_url" | "weburl" => Ok(ContentType::WebUrl),
            "image" => Ok(ContentType::Image),
            "video" => Ok(ContentType::Video),
            "audio" => Ok(ContentType::Audio),
            "file" => Ok(ContentType::File),
            "screenshot" => Ok(ContentType::Screenshot),
            other => Err(Error::InvalidInput(format!("Unknown content type: {other}"))),
        }
    }
}

/// Lifecycle status of an item.
///
/// `follow_up` carries an internal sub-state inside the item's
/// [`FollowUp`] payload; only the top-level status is stored here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    New,
    Analyzing,
    Analyzed,
    Timeline,
    FollowUp,
    Processed,
    SoftDeleted,
}

impl ItemStatus {
    pub const ALL: [ItemStatus; 7] = [
        ItemStatus::New,
        ItemStatus::Analyzing,
        ItemStatus::Analyzed,
        ItemStatus::Timeline,
        ItemStatus::FollowUp,
        ItemStatus::Processed,
        ItemStatus::SoftDeleted,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ItemStatus::New => "new",
            ItemStatus::Analyzing => "analyzing",
            ItemStatus::Analyzed => "analyzed",
            ItemStatus::Timeline => "timeline",
            ItemStatus::FollowUp => "follow_up",
            ItemStatus::Processed => "processed",
            ItemStatus::SoftDeleted => "soft_deleted",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ItemStatus::Processed | ItemStatus::SoftDeleted)
    }
}

impl fmt::Display for ItemStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ItemStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ItemStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| Error::InvalidInput(format!("Unknown item status: {s}")))
    }
}

/// Event details extracted by the classifier.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimelineEvent {
    pub date: Option<String>,
    pub time: Option<String>,
    pub duration: Option<String>,
    pub location: Option<String>,
    pub principal: Option<String>,
}

impl TimelineEvent {
    /// Parse `date` as an ISO calendar date.
    pub fn event_date(&self) -> Option<NaiveDate> {
        self.date
            .as_deref()
            .and_then(|d| NaiveDate::parse_from_str(d.trim(), "%Y-%m-%d").ok())
    }

    /// Rewrite `date` as zero-padded `YYYY-MM-DD` when it parses.
    pub fn with_canonical_date(mut self) -> Self {
        if let Some(date) = self.event_date() {
            self.date = Some(date.format("%Y-%m-%d").to_string());
        }
        self
    }

    /// True when every field is absent or blank.
    pub fn is_empty(&self) -> bool {
        [
            &self.date,
            &self.time,
            &self.duration,
            &self.location,
            &self.principal,
        ]
        .iter()
        .all(|f| f.as_deref().map_or(true, |v| v.trim().is_empty()))
    }
}

/// Internal sub-state of an item in `follow_up`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FollowUpState {
    /// Waiting for the user to answer a question or fill in event details.
    #[default]
    Triage,
    /// The classifier needs more context before it can decide anything.
    NeedsContext,
    /// Snoozed by the user until the given time.
    Deferred { until: DateTime<Utc> },
    /// Looks like a copy of another item.
    Duplicate {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        of: Option<Uuid>,
    },
}

impl FollowUpState {
    pub fn name(&self) -> &'static str {
        match self {
            FollowUpState::Triage => "triage",
            FollowUpState::NeedsContext => "needs_context",
            FollowUpState::Deferred { .. } => "deferred",
            FollowUpState::Duplicate { .. } => "duplicate",
        }
    }
}

/// Question put to the user while an item sits in `follow_up`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FollowUp {
    pub question: String,
    #[serde(default)]
    pub state: FollowUpState,
    /// Event fields that were missing or failed validation.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub missing_fields: Vec<String>,
    /// Partial event kept for reference while the question is open.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event: Option<TimelineEvent>,
}

impl FollowUp {
    pub fn new(question: impl Into<String>, state: FollowUpState) -> Self {
        Self {
            question: question.into(),
            state,
            missing_fields: Vec::new(),
            event: None,
        }
    }

    pub fn triage(question: impl Into<String>) -> Self {
        Self::new(question, FollowUpState::Triage)
    }

    pub fn with_missing_fields(mut self, fields: Vec<String>) -> Self {
        self.missing_fields = fields;
        self
    }

    pub fn with_event(mut self, event: TimelineEvent) -> Self {
        self.event = Some(event);
        self
    }
}

/// Stored classification result of an item.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Analysis {
    pub overview: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeline: Option<TimelineEvent>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub follow_up: Option<FollowUp>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub consumption_time_minutes: Option<u32>,
}

/// Raw result returned by the classification collaborator.
///
/// `follow_up` is plain question text here; routing turns it into a
/// [`FollowUp`] payload on the stored [`Analysis`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Classification {
    pub overview: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub timeline: Option<TimelineEvent>,
    #[serde(default)]
    pub follow_up: Option<String>,
    #[serde(default)]
    pub consumption_time_minutes: Option<u32>,
}

/// Optional file details captured with the item.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ItemMetadata {
    pub file_name: Option<String>,
    pub mime_type: Option<String>,
    pub file_size: Option<i64>,
    pub width: Option<i32>,
    pub height: Option<i32>,
    pub duration: Option<f64>,
}

/// A captured item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Item {
    pub id: Uuid,
    pub owner: String,
    pub content_type: ContentType,
    pub content: String,
    pub title: Option<String>,
    pub status: ItemStatus,
    pub analysis: Option<Analysis>,
    pub metadata: Option<ItemMetadata>,
    pub is_normalized: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Item {
    /// Open follow-up payload, if the item has one.
    pub fn follow_up(&self) -> Option<&FollowUp> {
        self.analysis.as_ref().and_then(|a| a.follow_up.as_ref())
    }

    /// Scheduled event, if the item has one.
    pub fn timeline(&self) -> Option<&TimelineEvent> {
        self.analysis.as_ref().and_then(|a| a.timeline.as_ref())
    }
}

/// Request to capture a new item.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewItem {
    pub owner: String,
    pub content_type: ContentType,
    pub content: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub metadata: Option<ItemMetadata>,
}

/// Kind of note attached to an item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NoteKind {
    /// Free-form context from the user.
    Context,
    /// Answer to an open follow-up question.
    FollowUp,
}

impl NoteKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NoteKind::Context => "context",
            NoteKind::FollowUp => "follow_up",
        }
    }
}

impl FromStr for NoteKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "context" => Ok(NoteKind::Context),
            "follow_up" => Ok(NoteKind::FollowUp),
            other => Err(Error::InvalidInput(format!("Unknown note kind: {other}"))),
        }
    }
}

/// A note attached to an item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemNote {
    pub id: Uuid,
    pub item_id: Uuid,
    pub owner: String,
    pub text: String,
    pub kind: NoteKind,
    pub created_at: DateTime<Utc>,
}

/// Request to attach a note to an item.
#[derive(Debug, Clone)]
pub struct NewItemNote {
    pub item_id: Uuid,
    pub owner: String,
    pub text: String,
    pub kind: NoteKind,
}

/// Item count for one lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusCount {
    pub status: ItemStatus,
    pub count: i64,
}

/// Action chosen by the follow-up collaborator after reading the user's note.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FollowUpAction {
    Archive,
    Delete,
    AddContextArchive,
    Update,
    /// Anything the collaborator made up.
    Unknown(String),
}

impl FollowUpAction {
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "archive" | "done" => FollowUpAction::Archive,
            "delete" => FollowUpAction::Delete,
            "add_context_archive" => FollowUpAction::AddContextArchive,
            "update" => FollowUpAction::Update,
            _ => FollowUpAction::Unknown(raw.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            FollowUpAction::Archive => "archive",
            FollowUpAction::Delete => "delete",
            FollowUpAction::AddContextArchive => "add_context_archive",
            FollowUpAction::Update => "update",
            FollowUpAction::Unknown(raw) => raw,
        }
    }
}

/// Result returned by the follow-up collaborator.
#[derive(Debug, Clone, PartialEq)]
pub struct FollowUpResolution {
    pub action: FollowUpAction,
    pub analysis: Option<Classification>,
}

// =============================================================================
// ITEM EFFECTS
// =============================================================================

/// Field changes carried by an [`ItemEffect`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ItemUpdate {
    pub status: Option<ItemStatus>,
    pub analysis: Option<Analysis>,
    pub title: Option<String>,
    pub mark_normalized: bool,
}

impl ItemUpdate {
    /// Apply the changes to an in-memory item.
    pub fn apply_to(&self, item: &mut Item) {
        if let Some(status) = self.status {
            item.status = status;
        }
        if let Some(ref analysis) = self.analysis {
            item.analysis = Some(analysis.clone());
        }
        if let Some(ref title) = self.title {
            item.title = Some(title.clone());
        }
        if self.mark_normalized {
            item.is_normalized = true;
        }
    }
}

/// A conditional item mutation computed by a handler.
///
/// The store applies it only when the item's current status is one of
/// `expected_status` (any status when empty). Applying the same effect
/// twice leaves the item in the same state.
#[derive(Debug, Clone, PartialEq)]
pub struct ItemEffect {
    pub item_id: Uuid,
    pub expected_status: Vec<ItemStatus>,
    pub update: ItemUpdate,
}

impl ItemEffect {
    /// Unconditional effect with no changes yet.
    pub fn new(item_id: Uuid) -> Self {
        Self {
            item_id,
            expected_status: Vec::new(),
            update: ItemUpdate::default(),
        }
    }

    pub fn expecting(mut self, statuses: &[ItemStatus]) -> Self {
        self.expected_status = statuses.to_vec();
        self
    }

    pub fn with_status(mut self, status: ItemStatus) -> Self {
        self.update.status = Some(status);
        self
    }

    pub fn with_analysis(mut self, analysis: Analysis) -> Self {
        self.update.analysis = Some(analysis);
        self
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.update.title = Some(title.into());
        self
    }

    pub fn mark_normalized(mut self) -> Self {
        self.update.mark_normalized = true;
        self
    }

    /// Whether the effect may be applied to an item in `current` status.
    pub fn matches(&self, current: ItemStatus) -> bool {
        self.expected_status.is_empty() || self.expected_status.contains(&current)
    }
}

// =============================================================================
// JOB TYPES
// =============================================================================

/// Type of background job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    /// Classify the item's content.
    Analysis,
    /// Humanize the item's title.
    Normalize,
    /// Re-evaluate a follow-up item after the user answered.
    FollowUp,
}

impl JobType {
    pub const ALL: [JobType; 3] = [JobType::Analysis, JobType::Normalize, JobType::FollowUp];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobType::Analysis => "analysis",
            JobType::Normalize => "normalize",
            JobType::FollowUp => "follow_up",
        }
    }
}

impl fmt::Display for JobType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobType::ALL
            .into_iter()
            .find(|jt| jt.as_str() == s)
            .ok_or_else(|| Error::InvalidInput(format!("Unknown job type: {s}")))
    }
}

/// Status of a job in the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Leased,
    Completed,
    Failed,
}

impl JobStatus {
    pub const ALL: [JobStatus; 4] = [
        JobStatus::Queued,
        JobStatus::Leased,
        JobStatus::Completed,
        JobStatus::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Leased => "leased",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobStatus::ALL
            .into_iter()
            .find(|st| st.as_str() == s)
            .ok_or_else(|| Error::InvalidInput(format!("Unknown job status: {s}")))
    }
}

/// A job in the worker queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerJob {
    pub id: Uuid,
    pub job_type: JobType,
    pub item_id: Uuid,
    pub status: JobStatus,
    /// Number of times the job has been leased.
    pub attempts: i32,
    pub lease_owner: Option<String>,
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub available_at: DateTime<Utc>,
    pub last_error: Option<String>,
    pub last_error_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WorkerJob {
    /// Queued and past its `available_at`.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status == JobStatus::Queued && self.available_at <= now
    }

    /// Leased, but the lease has run out.
    pub fn is_lease_stale(&self, now: DateTime<Utc>) -> bool {
        self.status == JobStatus::Leased && self.lease_expires_at.map_or(true, |exp| exp < now)
    }

    /// Leased by `worker_id`.
    pub fn is_owned_by(&self, worker_id: &str) -> bool {
        self.status == JobStatus::Leased && self.lease_owner.as_deref() == Some(worker_id)
    }
}

/// How a worker gives up its lease on a job.
#[derive(Debug, Clone, PartialEq)]
pub enum Release {
    /// Job done; apply the effect in the same write.
    Completed { effect: Option<ItemEffect> },
    /// Back to `queued`, eligible again after `delay`.
    Retry {
        delay: Duration,
        error: String,
        revert: Option<ItemEffect>,
    },
    /// Give up for good.
    Failed {
        error: String,
        revert: Option<ItemEffect>,
    },
}

impl Release {
    pub fn name(&self) -> &'static str {
        match self {
            Release::Completed { .. } => "completed",
            Release::Retry { .. } => "retry",
            Release::Failed { .. } => "failed",
        }
    }

    /// The item effect this release carries, if any.
    pub fn item_effect(&self) -> Option<&ItemEffect> {
        match self {
            Release::Completed { effect } => effect.as_ref(),
            Release::Retry { revert, .. } | Release::Failed { revert, .. } => revert.as_ref(),
        }
    }

    /// Job status after the release.
    pub fn job_status(&self) -> JobStatus {
        match self {
            Release::Completed { .. } => JobStatus::Completed,
            Release::Retry { .. } => JobStatus::Queued,
            Release::Failed { .. } => JobStatus::Failed,
        }
    }
}

/// Result of a successful release.
#[derive(Debug, Clone)]
pub struct ReleaseReceipt {
    pub job: WorkerJob,
    /// False when the item effect was skipped because the item had moved on.
    pub effect_applied: bool,
}

/// Job counts by status for one job type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub job_type: JobType,
    pub queued: i64,
    pub leased: i64,
    pub completed: i64,
    pub failed: i64,
}

impl QueueStats {
    pub fn empty(job_type: JobType) -> Self {
        Self {
            job_type,
            queued: 0,
            leased: 0,
            completed: 0,
            failed: 0,
        }
    }

    /// Add `count` jobs in `status`.
    pub fn add(&mut self, status: JobStatus, count: i64) {
        match status {
            JobStatus::Queued => self.queued += count,
            JobStatus::Leased => self.leased += count,
            JobStatus::Completed => self.completed += count,
            JobStatus::Failed => self.failed += count,
        }
    }

    pub fn total(&self) -> i64 {
        self.queued + self.leased + self.completed + self.failed
    }
}
