//! System prompts for the three collaborators.
//!
//! Built-in prompts can be overridden per deployment by dropping markdown
//! files into the directory named by `INTAKE_PROMPTS_DIR`:
//!
//! | File | Collaborator |
//! |------|--------------|
//! | `analyze-this.md` | classification |
//! | `normalize-this.md` | title normalization |
//! | `follow-up.md` | follow-up resolution |

use std::path::Path;

use tracing::{debug, warn};

pub const ANALYSIS_PROMPT_FILE: &str = "analyze-this.md";
pub const NORMALIZE_PROMPT_FILE: &str = "normalize-this.md";
pub const FOLLOW_UP_PROMPT_FILE: &str = "follow-up.md";

pub const DEFAULT_ANALYSIS_PROMPT: &str = r#"You triage items a user captured for later: notes, links, screenshots, photos and files.

Respond with a single JSON object:
{
  "overview": "one or two sentences describing the item",
  "tags": ["short", "lowercase", "tags"],
  "timeline": null or {
    "date": "YYYY-MM-DD",
    "time": "HH:MM",
    "duration": "expected length, e.g. 1h",
    "location": "where it happens",
    "principal": "who the user meets or who organizes it"
  },
  "follow_up": null or "a single question for the user",
  "consumption_time_minutes": null or an integer
}

Only fill "timeline" when the item describes a concrete event the user plans to attend.
Leave unknown event fields empty rather than guessing.
Ask a "follow_up" question only when the item cannot be filed without the user's help."#;

pub const DEFAULT_NORMALIZE_PROMPT: &str = r#"You write short, human-friendly titles for items a user captured.

The field being normalized is the item's title. Respond with a JSON object:
{"title": "the new title"}

Keep titles under 80 characters. Prefer the subject of the content over URLs or file names."#;

pub const DEFAULT_FOLLOW_UP_PROMPT: &str = r#"You re-evaluate a captured item after the user answered a follow-up question.

You receive the original item, its previous analysis and the user's follow-up notes.
Respond with a JSON object:
{
  "action": "archive" | "delete" | "add_context_archive" | "update",
  "analysis": null or an analysis object with the same fields as before
}

- "archive": the item is done and needs no changes.
- "delete": the user no longer wants the item.
- "add_context_archive": fold the notes into the analysis, then archive.
- "update": the notes change what the item is; return the revised analysis."#;

/// The prompt set used by a backend.
#[derive(Debug, Clone)]
pub struct PromptSet {
    pub analysis: String,
    pub normalize: String,
    pub follow_up: String,
}

impl Default for PromptSet {
    fn default() -> Self {
        Self {
            analysis: DEFAULT_ANALYSIS_PROMPT.to_string(),
            normalize: DEFAULT_NORMALIZE_PROMPT.to_string(),
            follow_up: DEFAULT_FOLLOW_UP_PROMPT.to_string(),
        }
    }
}

impl PromptSet {
    /// Load overrides from `INTAKE_PROMPTS_DIR`, if set.
    pub fn from_env() -> Self {
        match std::env::var("INTAKE_PROMPTS_DIR") {
            Ok(dir) if !dir.trim().is_empty() => Self::from_dir(Path::new(dir.trim())),
            _ => Self::default(),
        }
    }

    /// Load prompts from `dir`, keeping the built-in prompt for any file that
    /// is missing or unreadable.
    pub fn from_dir(dir: &Path) -> Self {
        let defaults = Self::default();
        Self {
            analysis: read_prompt(dir, ANALYSIS_PROMPT_FILE).unwrap_or(defaults.analysis),
            normalize: read_prompt(dir, NORMALIZE_PROMPT_FILE).unwrap_or(defaults.normalize),
            follow_up: read_prompt(dir, FOLLOW_UP_PROMPT_FILE).unwrap_or(defaults.follow_up),
        }
    }
}

fn read_prompt(dir: &Path, file: &str) -> Option<String> {
    let path = dir.join(file);
    match std::fs::read_to_string(&path) {
        Ok(text) if !text.trim().is_empty() => {
            debug!(
                subsystem = "inference",
                component = "prompts",
                path = %path.display(),
                "Loaded prompt override"
            );
            Some(text)
        }
        Ok(_) => None,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
        Err(e) => {
            warn!(
                subsystem = "inference",
                component = "prompts",
                path = %path.display(),
                error = %e,
                "Failed to read prompt override, using built-in prompt"
            );
            None
        }
    }
}

/// Append the owner's preferred tags to a system prompt.
pub fn with_preferred_tags(prompt: &str, preferred_tags: &[String]) -> String {
    if preferred_tags.is_empty() {
        return prompt.to_string();
    }
    let lines: Vec<String> = preferred_tags.iter().map(|t| format!("- {t}")).collect();
    format!(
        "{}\n\nPreferred tags (use when appropriate):\n{}\n",
        prompt.trim_end(),
        lines.join("\n")
    )
}
