//! Scripted collaborators for deterministic testing.
//!
//! Each mock plays back a queue of [`Scripted`] replies and then falls back
//! to a fixed reply, recording every call.
//!
//! ```rust,ignore
//! use intake_inference::mock::{MockClassifier, Scripted};
//!
//! let classifier = MockClassifier::replying(classification)
//!     .then(Scripted::Fail("rate limited".into()));
//! ```

use std::collections::VecDeque;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use uuid::Uuid;

use intake_core::{
    Analysis, Classification, ClassificationBackend, DuplicateDetector, Error, FollowUpAction,
    FollowUpBackend, FollowUpResolution, Item, ItemNote, NormalizationBackend, Result,
};

/// One scripted reply.
#[derive(Debug, Clone)]
pub enum Scripted<T> {
    /// Return the value.
    Reply(T),
    /// Fail with an inference error.
    Fail(String),
    /// Fail with an invalid-response error.
    Invalid(String),
    /// Wait, then return the value.
    Slow(Duration, T),
}

/// Reply queue shared by the mocks.
struct Script<T> {
    queue: Mutex<VecDeque<Scripted<T>>>,
    fallback: Option<Scripted<T>>,
    calls: Mutex<usize>,
}

impl<T: Clone + Send> Script<T> {
    fn new(fallback: Option<Scripted<T>>) -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            fallback,
            calls: Mutex::new(0),
        }
    }

    fn push(&self, reply: Scripted<T>) {
        self.queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(reply);
    }

    fn calls(&self) -> usize {
        *self.calls.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn play(&self) -> Result<T> {
        *self.calls.lock().unwrap_or_else(PoisonError::into_inner) += 1;
        let next = self
            .queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
            .or_else(|| self.fallback.clone());

        match next {
            Some(Scripted::Reply(value)) => Ok(value),
            Some(Scripted::Fail(msg)) => Err(Error::Inference(msg)),
            Some(Scripted::Invalid(msg)) => Err(Error::InvalidResponse(msg)),
            Some(Scripted::Slow(delay, value)) => {
                tokio::time::sleep(delay).await;
                Ok(value)
            }
            None => Err(Error::Inference("mock script exhausted".to_string())),
        }
    }
}

// =============================================================================
// CLASSIFICATION
// =============================================================================

/// Scripted classification collaborator.
pub struct MockClassifier {
    script: Script<Classification>,
    preferred_tags: Mutex<Vec<Vec<String>>>,
}

impl MockClassifier {
    /// Always reply with `classification` once the queue is empty.
    pub fn replying(classification: Classification) -> Self {
        Self::with_fallback(Some(Scripted::Reply(classification)))
    }

    /// Always fail once the queue is empty.
    pub fn failing(msg: impl Into<String>) -> Self {
        Self::with_fallback(Some(Scripted::Fail(msg.into())))
    }

    /// Play only the queued replies.
    pub fn scripted() -> Self {
        Self::with_fallback(None)
    }

    fn with_fallback(fallback: Option<Scripted<Classification>>) -> Self {
        Self {
            script: Script::new(fallback),
            preferred_tags: Mutex::new(Vec::new()),
        }
    }

    /// Queue a reply ahead of the fallback.
    pub fn then(self, reply: Scripted<Classification>) -> Self {
        self.script.push(reply);
        self
    }

    pub fn calls(&self) -> usize {
        self.script.calls()
    }

    /// Preferred tags passed on each call.
    pub fn preferred_tags_seen(&self) -> Vec<Vec<String>> {
        self.preferred_tags
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl ClassificationBackend for MockClassifier {
    async fn classify(&self, _item: &Item, preferred_tags: &[String]) -> Result<Classification> {
        self.preferred_tags
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(preferred_tags.to_vec());
        self.script.play().await
    }

    fn model_name(&self) -> &str {
        "mock-classifier"
    }
}

// =============================================================================
// NORMALIZATION
// =============================================================================

/// Scripted title normalizer.
pub struct MockNormalizer {
    script: Script<Option<String>>,
}

impl MockNormalizer {
    pub fn replying(title: Option<String>) -> Self {
        Self {
            script: Script::new(Some(Scripted::Reply(title))),
        }
    }

    pub fn failing(msg: impl Into<String>) -> Self {
        Self {
            script: Script::new(Some(Scripted::Fail(msg.into()))),
        }
    }

    pub fn calls(&self) -> usize {
        self.script.calls()
    }
}

#[async_trait]
impl NormalizationBackend for MockNormalizer {
    async fn normalize_title(&self, _item: &Item) -> Result<Option<String>> {
        self.script.play().await
    }
}

// =============================================================================
// FOLLOW-UP
// =============================================================================

/// Scripted follow-up collaborator.
pub struct MockFollowUp {
    script: Script<FollowUpResolution>,
    notes_seen: Mutex<Vec<usize>>,
}

impl MockFollowUp {
    pub fn replying(resolution: FollowUpResolution) -> Self {
        Self {
            script: Script::new(Some(Scripted::Reply(resolution))),
            notes_seen: Mutex::new(Vec::new()),
        }
    }

    /// Reply with a bare action and no analysis.
    pub fn action(action: FollowUpAction) -> Self {
        Self::replying(FollowUpResolution {
            action,
            analysis: None,
        })
    }

    pub fn failing(msg: impl Into<String>) -> Self {
        Self {
            script: Script::new(Some(Scripted::Fail(msg.into()))),
            notes_seen: Mutex::new(Vec::new()),
        }
    }

    pub fn then(self, reply: Scripted<FollowUpResolution>) -> Self {
        self.script.push(reply);
        self
    }

    pub fn calls(&self) -> usize {
        self.script.calls()
    }

    /// Number of notes passed on each call.
    pub fn notes_seen(&self) -> Vec<usize> {
        self.notes_seen
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl FollowUpBackend for MockFollowUp {
    async fn resolve(
        &self,
        _item: &Item,
        _analysis: &Analysis,
        notes: &[ItemNote],
        _preferred_tags: &[String],
    ) -> Result<FollowUpResolution> {
        self.notes_seen
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(notes.len());
        self.script.play().await
    }
}

// =============================================================================
// DUPLICATES
// =============================================================================

/// Detector that reports every item as a duplicate of one fixed item.
#[derive(Debug, Clone, Copy)]
pub struct FixedDuplicate(pub Uuid);

#[async_trait]
impl DuplicateDetector for FixedDuplicate {
    async fn find_duplicate(&self, item: &Item, _analysis: &Analysis) -> Result<Option<Uuid>> {
        Ok((item.id != self.0).then_some(self.0))
    }
}
