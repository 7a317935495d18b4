//! Parsing of model responses into collaborator results.
//!
//! Models are asked for JSON objects but still wrap them in code fences,
//! return numbers as strings, or leave fields empty. Parsing here is lenient
//! about shape and strict about the one thing every result needs: an
//! analysis must have an overview.

use serde_json::{Map, Value};

use intake_core::{Classification, Error, FollowUpAction, FollowUpResolution, Result, TimelineEvent};

type JsonObject = Map<String, Value>;

/// Remove a surrounding markdown code fence, if any.
pub fn strip_code_fence(raw: &str) -> &str {
    let trimmed = raw.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    // Drop the language tag line, e.g. ```json
    let body = rest.split_once('\n').map_or("", |(_, body)| body);
    body.strip_suffix("```").unwrap_or(body).trim()
}

/// Parse a response body as a JSON object.
pub fn parse_json_object(raw: &str) -> Result<JsonObject> {
    let value: Value = serde_json::from_str(strip_code_fence(raw))
        .map_err(|e| Error::InvalidResponse(format!("response is not valid JSON: {e}")))?;
    match value {
        Value::Object(map) => Ok(map),
        other => Err(Error::InvalidResponse(format!(
            "expected a JSON object, got {}",
            json_kind(&other)
        ))),
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

/// Non-blank text from a string or number.
fn text(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::String(s) => {
            let s = s.trim();
            (!s.is_empty()).then(|| s.to_string())
        }
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn tags(value: Option<&Value>) -> Vec<String> {
    let raw: Vec<String> = match value {
        Some(Value::Array(items)) => items.iter().filter_map(|v| text(Some(v))).collect(),
        Some(Value::String(s)) => s.split(',').map(|t| t.trim().to_string()).collect(),
        _ => Vec::new(),
    };

    let mut out: Vec<String> = Vec::with_capacity(raw.len());
    for tag in raw {
        if !tag.is_empty() && !out.contains(&tag) {
            out.push(tag);
        }
    }
    out
}

fn timeline(value: Option<&Value>) -> Option<TimelineEvent> {
    let obj = value?.as_object()?;
    let event = TimelineEvent {
        date: text(obj.get("date")),
        time: text(obj.get("time")),
        duration: text(obj.get("duration")),
        location: text(obj.get("location")),
        principal: text(obj.get("principal")),
    };
    (!event.is_empty()).then_some(event)
}

fn minutes(value: Option<&Value>) -> Option<u32> {
    match value? {
        Value::Number(n) => n.as_u64().and_then(|m| u32::try_from(m).ok()),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Build a classification from a parsed object.
pub fn classification_from_object(obj: &JsonObject) -> Result<Classification> {
    let overview = text(obj.get("overview")).ok_or_else(|| {
        match text(obj.get("error")) {
            Some(err) => Error::InvalidResponse(format!("model reported an error: {err}")),
            None => Error::InvalidResponse("analysis has no overview".to_string()),
        }
    })?;

    Ok(Classification {
        overview,
        tags: tags(obj.get("tags")),
        timeline: timeline(obj.get("timeline")),
        follow_up: text(obj.get("follow_up")),
        consumption_time_minutes: minutes(obj.get("consumption_time_minutes")),
    })
}

/// Parse a classification response.
pub fn parse_classification(raw: &str) -> Result<Classification> {
    classification_from_object(&parse_json_object(raw)?)
}

/// Pull a title out of a normalization response.
///
/// Accepts `title`, `item.title`, `normalized_title`, `{"item": {"title"}}`
/// or any single-key object. Returns `None` when nothing usable is found.
pub fn extract_title(raw: &str) -> Option<String> {
    let obj = parse_json_object(raw).ok()?;

    let title = text(obj.get("title"))
        .or_else(|| text(obj.get("item.title")))
        .or_else(|| text(obj.get("normalized_title")))
        .or_else(|| {
            obj.get("item")
                .and_then(Value::as_object)
                .and_then(|item| text(item.get("title")))
        });
    if title.is_some() {
        return title;
    }

    if obj.len() == 1 {
        return obj.values().next().and_then(|v| text(Some(v)));
    }
    None
}

/// Parse a follow-up resolution.
///
/// A response without an `action` that still carries an analysis is read as
/// an `update`.
pub fn parse_follow_up(raw: &str) -> Result<FollowUpResolution> {
    let obj = parse_json_object(raw)?;

    let analysis = obj
        .get("analysis")
        .and_then(Value::as_object)
        .and_then(|a| classification_from_object(a).ok());

    match text(obj.get("action")) {
        Some(action) => Ok(FollowUpResolution {
            action: FollowUpAction::parse(&action),
            analysis,
        }),
        None if analysis.is_some() => Ok(FollowUpResolution {
            action: FollowUpAction::Update,
            analysis,
        }),
        None if obj.contains_key("overview") => Ok(FollowUpResolution {
            action: FollowUpAction::Update,
            analysis: Some(classification_from_object(&obj)?),
        }),
        None => Err(Error::InvalidResponse(
            "follow-up response has no action".to_string(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strip_code_fence() {
        assert_eq!(strip_code_fence("```json\n{\"a\":1}\n```"), "{\"a\":1}");
        assert_eq!(strip_code_fence("  {\"a\":1} "), "{\"a\":1}");
        assert_eq!(strip_code_fence("```\n{}\n```"), "{}");
    }

    #[test]
    fn test_parse_full_classification() {
        let raw = r#"{
            "overview": "Dentist appointment",
            "tags": ["health", " dentist ", "health", ""],
            "timeline": {
                "date": "2030-05-01", "time": "10:00", "duration": 60,
                "location": "Main St Clinic", "principal": "Dr. Lee"
            },
            "follow_up": "",
            "consumption_time_minutes": "15"
        }"#;
        let c = parse_classification(raw).unwrap();

        assert_eq!(c.overview, "Dentist appointment");
        assert_eq!(c.tags, vec!["health", "dentist"]);
        let event = c.timeline.unwrap();
        assert_eq!(event.duration.as_deref(), Some("60"));
        assert_eq!(event.principal.as_deref(), Some("Dr. Lee"));
        assert!(c.follow_up.is_none());
        assert_eq!(c.consumption_time_minutes, Some(15));
    }

    #[test]
    fn test_empty_timeline_is_dropped() {
        let c = parse_classification(r#"{"overview": "x", "timeline": {"date": ""}}"#).unwrap();
        assert!(c.timeline.is_none());
        let c = parse_classification(r#"{"overview": "x", "timeline": null}"#).unwrap();
        assert!(c.timeline.is_none());
    }

    #[test]
    fn test_comma_separated_tags() {
        let c = parse_classification(r#"{"overview": "x", "tags": "a, b,,c"}"#).unwrap();
        assert_eq!(c.tags, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_missing_overview_is_invalid() {
        let err = parse_classification(r#"{"tags": ["a"]}"#).unwrap_err();
        assert!(matches!(err, Error::InvalidResponse(_)));

        let err = parse_classification(r#"{"error": "Invalid JSON"}"#).unwrap_err();
        assert!(err.to_string().contains("Invalid JSON"));
    }

    #[test]
    fn test_non_object_is_invalid() {
        assert!(matches!(
            parse_classification("[1, 2]").unwrap_err(),
            Error::InvalidResponse(_)
        ));
        assert!(matches!(
            parse_classification("not json").unwrap_err(),
            Error::InvalidResponse(_)
        ));
    }

    #[test]
    fn test_extract_title_variants() {
        assert_eq!(extract_title(r#"{"title": "A"}"#).as_deref(), Some("A"));
        assert_eq!(extract_title(r#"{"item.title": "B"}"#).as_deref(), Some("B"));
        assert_eq!(
            extract_title(r#"{"normalized_title": "C"}"#).as_deref(),
            Some("C")
        );
        assert_eq!(
            extract_title(r#"{"item": {"title": "D"}}"#).as_deref(),
            Some("D")
        );
        assert_eq!(extract_title(r#"{"name": "E"}"#).as_deref(), Some("E"));
    }

    #[test]
    fn test_extract_title_nothing_usable() {
        assert!(extract_title(r#"{"a": "x", "b": "y"}"#).is_none());
        assert!(extract_title(r#"{"title": "   "}"#).is_none());
        assert!(extract_title("plain text").is_none());
    }

    #[test]
    fn test_follow_up_with_action() {
        let r = parse_follow_up(r#"{"action": "delete"}"#).unwrap();
        assert_eq!(r.action, FollowUpAction::Delete);
        assert!(r.analysis.is_none());

        let r = parse_follow_up(
            r#"{"action": "update", "analysis": {"overview": "moved", "follow_up": "When?"}}"#,
        )
        .unwrap();
        assert_eq!(r.action, FollowUpAction::Update);
        assert_eq!(r.analysis.unwrap().follow_up.as_deref(), Some("When?"));
    }

    #[test]
    fn test_follow_up_unknown_action_kept() {
        let r = parse_follow_up(r#"{"action": "snooze"}"#).unwrap();
        assert_eq!(r.action, FollowUpAction::Unknown("snooze".to_string()));
    }

    #[test]
    fn test_follow_up_without_action_is_update() {
        let r = parse_follow_up(r#"{"overview": "bare analysis", "tags": []}"#).unwrap();
        assert_eq!(r.action, FollowUpAction::Update);
        assert_eq!(r.analysis.unwrap().overview, "bare analysis");

        let err = parse_follow_up(r#"{"note": "hm"}"#).unwrap_err();
        assert!(matches!(err, Error::InvalidResponse(_)));
    }
}
