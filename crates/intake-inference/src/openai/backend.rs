//! OpenAI-compatible collaborator implementation.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::Client;
use tracing::{debug, info, warn};

use intake_core::{
    Analysis, Classification, ClassificationBackend, Error, FollowUpBackend,
    FollowUpResolution, Item, ItemNote, NormalizationBackend, Result,
};

use super::error::{to_intake_error, OpenAIErrorCode};
use super::types::*;
use crate::parse::{extract_title, parse_classification, parse_follow_up};
use crate::prompts::{with_preferred_tags, PromptSet};

/// Default API endpoint (OpenRouter).
pub const DEFAULT_OPENAI_URL: &str = "https://openrouter.ai/api/v1";

/// Default generation model.
pub const DEFAULT_GEN_MODEL: &str = "google/gemini-2.0-flash-exp:free";

/// Default timeout in seconds.
pub const DEFAULT_TIMEOUT_SECS: u64 = 120;

/// Configuration for the OpenAI-compatible backend.
#[derive(Debug, Clone)]
pub struct OpenAIConfig {
    /// Base URL for the API endpoint.
    pub base_url: String,
    /// API key for authentication (optional for local endpoints).
    pub api_key: Option<String>,
    /// Model used by all three collaborators.
    pub gen_model: String,
    /// Request timeout in seconds.
    pub timeout_seconds: u64,
    /// HTTP-Referer header for OpenRouter.ai rankings (optional).
    pub http_referer: Option<String>,
    /// X-Title header for app name on OpenRouter.ai (optional).
    pub x_title: Option<String>,
}

impl Default for OpenAIConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_OPENAI_URL.to_string(),
            api_key: None,
            gen_model: DEFAULT_GEN_MODEL.to_string(),
            timeout_seconds: DEFAULT_TIMEOUT_SECS,
            http_referer: None,
            x_title: None,
        }
    }
}

impl OpenAIConfig {
    /// Read configuration from environment variables.
    ///
    /// | Variable | Default |
    /// |----------|---------|
    /// | `OPENAI_BASE_URL` | OpenRouter |
    /// | `OPENAI_API_KEY` | none |
    /// | `OPENAI_GEN_MODEL` | `google/gemini-2.0-flash-exp:free` |
    /// | `OPENAI_TIMEOUT` | `120` |
    /// | `OPENAI_HTTP_REFERER` | none |
    /// | `OPENAI_X_TITLE` | none |
    pub fn from_env() -> Self {
        Self {
            base_url: std::env::var("OPENAI_BASE_URL")
                .unwrap_or_else(|_| DEFAULT_OPENAI_URL.to_string()),
            api_key: std::env::var("OPENAI_API_KEY")
                .ok()
                .filter(|k| !k.is_empty()),
            gen_model: std::env::var("OPENAI_GEN_MODEL")
                .unwrap_or_else(|_| DEFAULT_GEN_MODEL.to_string()),
            timeout_seconds: std::env::var("OPENAI_TIMEOUT")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(DEFAULT_TIMEOUT_SECS),
            http_referer: std::env::var("OPENAI_HTTP_REFERER").ok(),
            x_title: std::env::var("OPENAI_X_TITLE").ok(),
        }
    }
}

/// OpenAI-compatible backend implementing every collaborator trait.
pub struct OpenAIBackend {
    client: Client,
    config: OpenAIConfig,
    prompts: PromptSet,
}

impl OpenAIBackend {
    /// Create a new backend with the built-in prompts.
    pub fn new(config: OpenAIConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .build()
            .map_err(|e| Error::Inference(format!("Failed to create HTTP client: {e}")))?;

        info!(
            subsystem = "inference",
            component = "openai",
            op = "init",
            base_url = %config.base_url,
            model = %config.gen_model,
            "Initializing OpenAI-compatible backend"
        );

        Ok(Self {
            client,
            config,
            prompts: PromptSet::default(),
        })
    }

    /// Create from environment variables, including prompt overrides.
    pub fn from_env() -> Result<Self> {
        Ok(Self::new(OpenAIConfig::from_env())?.with_prompts(PromptSet::from_env()))
    }

    /// Replace the prompt set.
    pub fn with_prompts(mut self, prompts: PromptSet) -> Self {
        self.prompts = prompts;
        self
    }

    /// Get the current configuration.
    pub fn config(&self) -> &OpenAIConfig {
        &self.config
    }

    /// Build a request with authentication if configured.
    fn build_request(&self, endpoint: &str) -> reqwest::RequestBuilder {
        let url = format!("{}{}", self.config.base_url.trim_end_matches('/'), endpoint);
        let mut req = self.client.post(&url);

        if let Some(ref api_key) = self.config.api_key {
            req = req.header("Authorization", format!("Bearer {api_key}"));
        }
        if let Some(ref referer) = self.config.http_referer {
            req = req.header("HTTP-Referer", referer);
        }
        if let Some(ref title) = self.config.x_title {
            req = req.header("X-Title", title);
        }

        req.header("Content-Type", "application/json")
    }

    /// Run a JSON-mode chat completion and return the raw message text.
    async fn chat_json(&self, op: &'static str, messages: Vec<ChatMessage>) -> Result<String> {
        let start = Instant::now();
        let request = ChatCompletionRequest {
            model: self.config.gen_model.clone(),
            messages,
            temperature: None,
            response_format: Some(ResponseFormat::json_object()),
        };

        let response = self
            .build_request("/chat/completions")
            .json(&request)
            .send()
            .await
            .map_err(|e| Error::Inference(format!("Request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body: Option<OpenAIErrorResponse> = response.json().await.ok();
            let (message, error_type) = match body {
                Some(b) => (b.error.message, b.error.error_type.unwrap_or_default()),
                None => ("Unknown error".to_string(), String::new()),
            };
            let code = OpenAIErrorCode::from_response(status.as_u16(), &error_type);
            warn!(
                subsystem = "inference",
                component = "openai",
                op,
                model = %self.config.gen_model,
                status = status.as_u16(),
                retryable = code.is_retryable(),
                error = %message,
                "Completion request failed"
            );
            return Err(to_intake_error(code, &message));
        }

        let result: ChatCompletionResponse = response
            .json()
            .await
            .map_err(|e| Error::InvalidResponse(format!("Failed to parse response: {e}")))?;

        let content = result
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .filter(|c| !c.trim().is_empty())
            .ok_or_else(|| Error::InvalidResponse("empty completion".to_string()))?;

        debug!(
            subsystem = "inference",
            component = "openai",
            op,
            model = %self.config.gen_model,
            response_len = content.len(),
            duration_ms = start.elapsed().as_millis() as u64,
            "Completion received"
        );
        Ok(content)
    }
}

/// User message for classifying an item.
pub(crate) fn analysis_message(item: &Item) -> ChatMessage {
    match item.content_type {
        ct if ct.is_visual() => {
            ChatMessage::user_with_image("Analyze this image item:", item.content.clone())
        }
        ct if ct.is_remote() => ChatMessage::user(format!(
            "Analyze the content at this URL:\n\n{}",
            item.content
        )),
        _ => ChatMessage::user(format!("Analyze this user item:\n\n{}", item.content)),
    }
}

/// User message for title normalization.
pub(crate) fn normalize_message(item: &Item) -> String {
    let mut content = format!("Content: {}\n", item.content);
    if let Some(ref title) = item.title {
        content.push_str(&format!("Current Title: {title}\n"));
    }
    content.push_str(&format!("Type: {}", item.content_type));
    content
}

/// User message for follow-up resolution.
pub(crate) fn follow_up_message(item: &Item, analysis: &Analysis, notes: &[ItemNote]) -> Result<String> {
    let mut content = format!(
        "## Original Item ({})\n\n{}\n\n",
        item.content_type, item.content
    );
    content.push_str(&format!(
        "## Original Analysis\n\n{}\n\n",
        serde_json::to_string_pretty(analysis)?
    ));
    content.push_str("## Follow-up Notes\n\n");
    for note in notes.iter().filter(|n| !n.text.trim().is_empty()) {
        content.push_str(&format!("- {}\n", note.text.trim()));
    }
    Ok(content)
}

#[async_trait]
impl ClassificationBackend for OpenAIBackend {
    async fn classify(&self, item: &Item, preferred_tags: &[String]) -> Result<Classification> {
        let messages = vec![
            ChatMessage::system(with_preferred_tags(&self.prompts.analysis, preferred_tags)),
            analysis_message(item),
        ];
        let raw = self.chat_json("classify", messages).await?;
        parse_classification(&raw)
    }

    fn model_name(&self) -> &str {
        &self.config.gen_model
    }
}

#[async_trait]
impl NormalizationBackend for OpenAIBackend {
    async fn normalize_title(&self, item: &Item) -> Result<Option<String>> {
        let messages = vec![
            ChatMessage::system(self.prompts.normalize.clone()),
            ChatMessage::user(normalize_message(item)),
        ];
        let raw = self.chat_json("normalize_title", messages).await?;
        let title = extract_title(&raw);
        if title.is_none() {
            warn!(
                subsystem = "inference",
                component = "openai",
                op = "normalize_title",
                item_id = %item.id,
                response_len = raw.len(),
                "Could not extract title from response"
            );
        }
        Ok(title)
    }
}

#[async_trait]
impl FollowUpBackend for OpenAIBackend {
    async fn resolve(
        &self,
        item: &Item,
        analysis: &Analysis,
        notes: &[ItemNote],
        preferred_tags: &[String],
    ) -> Result<FollowUpResolution> {
        let messages = vec![
            ChatMessage::system(with_preferred_tags(&self.prompts.follow_up, preferred_tags)),
            ChatMessage::user(follow_up_message(item, analysis, notes)?),
        ];
        let raw = self.chat_json("resolve_follow_up", messages).await?;
        parse_follow_up(&raw)
    }
}
