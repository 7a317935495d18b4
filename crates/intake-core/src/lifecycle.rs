//! Item lifecycle state machine.
//!
//! Every status change an item goes through is checked here. Handlers and
//! the capture surface never write a status directly; they ask
//! [`transition`] for the next status and build an [`ItemEffect`] that is
//! guarded by the status they observed.
//!
//! | From | Trigger | To |
//! |------|---------|----|
//! | new, analyzing | analysis started | analyzing |
//! | analyzing | analysis failed | new |
//! | analyzing | classified | timeline, follow_up, analyzed, processed |
//! | follow_up | follow-up resolved | processed, soft_deleted, timeline, follow_up |
//! | timeline | event passed | follow_up |
//! | follow_up | resurfaced | follow_up |
//! | analyzed, timeline, follow_up | dismissed | soft_deleted |
//! | any non-terminal | archived | processed |

use std::fmt;

use chrono::NaiveDate;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::models::{
    Analysis, Classification, FollowUp, FollowUpAction, FollowUpState, Item, ItemEffect,
    ItemStatus, TimelineEvent,
};

/// What caused a status change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    /// An analysis job started on the item.
    AnalysisStarted,
    /// An analysis job failed (retry scheduled or given up).
    AnalysisFailed,
    /// Classification produced a routing decision.
    Classified(ItemStatus),
    /// The follow-up collaborator resolved the user's note.
    FollowUpResolved(ItemStatus),
    /// The scheduled event date is behind us.
    EventPassed,
    /// A deferred follow-up came due again.
    Resurfaced,
    /// The user dismissed the item.
    Dismissed,
    /// The user archived the item.
    Archived,
}

impl fmt::Display for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Trigger::AnalysisStarted => f.write_str("analysis started"),
            Trigger::AnalysisFailed => f.write_str("analysis failed"),
            Trigger::Classified(to) => write!(f, "classified as {to}"),
            Trigger::FollowUpResolved(to) => write!(f, "follow-up resolved to {to}"),
            Trigger::EventPassed => f.write_str("event passed"),
            Trigger::Resurfaced => f.write_str("resurfaced"),
            Trigger::Dismissed => f.write_str("dismissed"),
            Trigger::Archived => f.write_str("archived"),
        }
    }
}

/// Compute the status reached from `from` by `trigger`.
pub fn transition(from: ItemStatus, trigger: Trigger) -> Result<ItemStatus> {
    use ItemStatus::*;

    let to = match (from, trigger) {
        (New | Analyzing, Trigger::AnalysisStarted) => Some(Analyzing),
        (Analyzing, Trigger::AnalysisFailed) => Some(New),
        (Analyzing, Trigger::Classified(to @ (Timeline | FollowUp | Analyzed | Processed))) => {
            Some(to)
        }
        (FollowUp, Trigger::FollowUpResolved(to @ (Processed | SoftDeleted | Timeline | FollowUp))) => {
            Some(to)
        }
        (Timeline, Trigger::EventPassed) => Some(FollowUp),
        (FollowUp, Trigger::Resurfaced) => Some(FollowUp),
        (Analyzed | Timeline | FollowUp, Trigger::Dismissed) => Some(SoftDeleted),
        (from, Trigger::Archived) if !from.is_terminal() => Some(Processed),
        _ => None,
    };

    to.ok_or_else(|| Error::InvalidTransition {
        from,
        trigger: trigger.to_string(),
    })
}

/// Build an effect that moves the item from `from` via `trigger`.
///
/// The effect is guarded by `from`, so it is skipped when the item has
/// moved on in the meantime.
pub fn transition_effect(item_id: Uuid, from: ItemStatus, trigger: Trigger) -> Result<ItemEffect> {
    let to = transition(from, trigger)?;
    Ok(ItemEffect::new(item_id).expecting(&[from]).with_status(to))
}

// =============================================================================
// CONFIDENCE POLICY
// =============================================================================

/// Outcome of validating a timeline event.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EventCheck {
    /// Fields that are missing or invalid, in a fixed order.
    pub missing: Vec<String>,
}

impl EventCheck {
    pub fn is_confident(&self) -> bool {
        self.missing.is_empty()
    }
}

fn present(field: &Option<String>) -> bool {
    field.as_deref().is_some_and(|v| !v.trim().is_empty())
}

/// Check an event against the confidence policy.
///
/// Date, time, location, and principal must all be present. The date must
/// parse as `YYYY-MM-DD` and must not be before `today`.
pub fn check_event(event: &TimelineEvent, today: NaiveDate) -> EventCheck {
    let mut missing = Vec::new();

    if !present(&event.date) {
        missing.push("date".to_string());
    } else {
        match event.event_date() {
            None => missing.push("date (unrecognized format)".to_string()),
            Some(date) if date < today => missing.push("date (in the past)".to_string()),
            Some(_) => {}
        }
    }
    if !present(&event.time) {
        missing.push("time".to_string());
    }
    if !present(&event.location) {
        missing.push("location".to_string());
    }
    if !present(&event.principal) {
        missing.push("principal".to_string());
    }

    EventCheck { missing }
}

/// Status and stored analysis chosen for a result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Routed {
    pub status: ItemStatus,
    pub analysis: Analysis,
}

const MISSING_DETAILS_QUESTION: &str = "This looks like an event, but some details are missing.";
const DUPLICATE_QUESTION: &str = "This looks like something you already saved. Keep it anyway?";

fn missing_details_question(question: Option<String>, missing: &[String]) -> String {
    let base = question.unwrap_or_else(|| MISSING_DETAILS_QUESTION.to_string());
    format!("{} Missing: {}.", base.trim_end(), missing.join(", "))
}

/// Route a classification result to a lifecycle status.
///
/// * confident event: `timeline`
/// * partial or past event: `follow_up` in triage, missing fields listed and
///   the event moved off the stored timeline
/// * question without event: `follow_up` needing context
/// * neither: `analyzed`
pub fn classify_outcome(result: Classification, today: NaiveDate) -> Routed {
    let Classification {
        overview,
        tags,
        timeline,
        follow_up,
        consumption_time_minutes,
    } = result;

    let event = timeline.filter(|ev| !ev.is_empty());
    let question = follow_up
        .map(|q| q.trim().to_string())
        .filter(|q| !q.is_empty());

    let mut analysis = Analysis {
        overview,
        tags,
        timeline: None,
        follow_up: None,
        consumption_time_minutes,
    };

    let status = match event {
        Some(event) => {
            let check = check_event(&event, today);
            if check.is_confident() {
                analysis.timeline = Some(event.with_canonical_date());
                ItemStatus::Timeline
            } else {
                let text = missing_details_question(question, &check.missing);
                analysis.follow_up = Some(
                    FollowUp::triage(text)
                        .with_missing_fields(check.missing)
                        .with_event(event),
                );
                ItemStatus::FollowUp
            }
        }
        None => match question {
            Some(question) => {
                analysis.follow_up = Some(FollowUp::new(question, FollowUpState::NeedsContext));
                ItemStatus::FollowUp
            }
            None => ItemStatus::Analyzed,
        },
    };

    Routed { status, analysis }
}

/// Reroute an analysis to `follow_up` as a suspected duplicate of `of`.
pub fn mark_duplicate(mut analysis: Analysis, of: Uuid) -> Routed {
    let mut follow_up = FollowUp::new(DUPLICATE_QUESTION, FollowUpState::Duplicate { of: Some(of) });
    if let Some(event) = analysis.timeline.take() {
        follow_up = follow_up.with_event(event);
    }
    analysis.follow_up = Some(follow_up);
    Routed {
        status: ItemStatus::FollowUp,
        analysis,
    }
}

/// Map a follow-up action to the item's next status and analysis.
///
/// `update` and `add_context_archive` need a fresh analysis from the
/// collaborator; without one the response is invalid.
pub fn resolve_follow_up(
    action: &FollowUpAction,
    current: &Analysis,
    revised: Option<Classification>,
    today: NaiveDate,
) -> Result<Routed> {
    match action {
        FollowUpAction::Archive => Ok(Routed {
            status: ItemStatus::Processed,
            analysis: current.clone(),
        }),
        FollowUpAction::Delete => Ok(Routed {
            status: ItemStatus::SoftDeleted,
            analysis: current.clone(),
        }),
        FollowUpAction::AddContextArchive => {
            let revised = revised.ok_or_else(|| {
                Error::InvalidResponse("add_context_archive without analysis".to_string())
            })?;
            let timeline = revised
                .timeline
                .filter(|ev| !ev.is_empty())
                .or_else(|| current.follow_up.as_ref().and_then(|f| f.event.clone()));
            Ok(Routed {
                status: ItemStatus::Processed,
                analysis: Analysis {
                    overview: revised.overview,
                    tags: revised.tags,
                    timeline,
                    follow_up: None,
                    consumption_time_minutes: revised.consumption_time_minutes,
                },
            })
        }
        FollowUpAction::Update => {
            let revised =
                revised.ok_or_else(|| Error::InvalidResponse("update without analysis".to_string()))?;
            let mut routed = classify_outcome(revised, today);
            match routed.status {
                ItemStatus::FollowUp => {
                    if let Some(ref mut follow_up) = routed.analysis.follow_up {
                        follow_up.state = FollowUpState::Triage;
                    }
                }
                ItemStatus::Analyzed => routed.status = ItemStatus::Processed,
                _ => {}
            }
            Ok(routed)
        }
        FollowUpAction::Unknown(raw) => Err(Error::InvalidInput(format!(
            "unknown follow-up action: {raw}"
        ))),
    }
}

/// Build the "how did it go" analysis for a timeline item whose date passed.
///
/// Returns `None` when the item has no parseable event date or the date is
/// not before `today`.
pub fn follow_up_for_past_event(item: &Item, today: NaiveDate) -> Option<Analysis> {
    let analysis = item.analysis.as_ref()?;
    let event = analysis.timeline.as_ref()?;
    let date = event.event_date()?;
    if date >= today {
        return None;
    }

    let title = item
        .title
        .as_deref()
        .filter(|t| !t.trim().is_empty())
        .or_else(|| Some(analysis.overview.as_str()).filter(|o| !o.trim().is_empty()))
        .unwrap_or("this event");

    let mut parts = vec![format!("How was \"{title}\"?")];
    if let Some(location) = event.location.as_deref().filter(|l| !l.trim().is_empty()) {
        parts.push(format!("Did you make it to {location}?"));
    }
    parts.push("Anything to note or report?".to_string());

    let mut updated = analysis.clone();
    let event = updated.timeline.take()?;
    updated.follow_up = Some(FollowUp::triage(parts.join(" ")).with_event(event));
    Some(updated)
}
