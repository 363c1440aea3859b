//! Reflection: turning discarded conversation into lessons

use super::formatter::{render_transcript, ReflectionMessage};
use super::lessons::{Lesson, LessonKind};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, warn};

/// Reflector trait for different reflection strategies
#[async_trait]
pub trait Reflector: Send + Sync {
    /// Distill `messages` into lessons and model-specific state
    async fn reflect(
        &self,
        messages: &[ReflectionMessage],
        model_id: &str,
        options: &ReflectionOptions,
    ) -> Result<Reflection, ReflectorError>;
}

/// Per-call reflection options
#[derive(Debug, Clone, Default)]
pub struct ReflectionOptions {
    /// Upper bound on lessons requested from the reflector
    pub max_lessons: usize,
    /// Lessons already held for the model, so the reflector can avoid repeats
    pub known_lessons: Vec<String>,
    /// Current model state, if any
    pub current_state: Option<Value>,
}

/// Reflection output
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Reflection {
    pub lessons: Vec<Lesson>,
    /// New model-specific state blobs; the first one replaces the current state
    pub state_entries: Vec<Value>,
}

/// Configuration for LLM reflector
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReflectorConfig {
    /// Disabled reflection condenses without producing lessons
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    #[serde(default)]
    pub api_key: Option<String>,
    /// Model used for reflection; defaults to the model being condensed
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: usize,
}

fn default_enabled() -> bool {
    true
}

fn default_endpoint() -> String {
    "http://localhost:8080/v1/chat/completions".to_string()
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_max_retries() -> usize {
    3
}

impl Default for ReflectorConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            endpoint: default_endpoint(),
            api_key: None,
            model: None,
            timeout_secs: default_timeout_secs(),
            max_retries: default_max_retries(),
        }
    }
}

/// LLM-based reflector using an OpenAI-compatible API
pub struct LlmReflector {
    client: Client,
    config: ReflectorConfig,
}

impl LlmReflector {
    /// Create a new LLM reflector
    pub fn new(config: ReflectorConfig) -> Result<Self, ReflectorError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| ReflectorError::InitializationError(e.to_string()))?;

        Ok(Self { client, config })
    }

    /// Build reflection prompt
    fn build_prompt(&self, messages: &[ReflectionMessage], options: &ReflectionOptions) -> String {
        let mut prompt = format!(
            "The following conversation is being removed from your context. \
            Extract at most {} durable lessons worth keeping: facts about the task \
            (type \"factual\") and lessons about how to work (type \"behavioral\"). \
            Also write a short state object capturing where the work stands.\n\
            Reply with JSON only: {{\"lessons\": [{{\"type\": \"factual\", \"content\": \"...\"}}], \
            \"state\": [{{\"summary\": \"...\"}}]}}\n\n",
            options.max_lessons.max(1)
        );

        if !options.known_lessons.is_empty() {
            prompt.push_str("Already known (do not repeat):\n");
            for lesson in &options.known_lessons {
                prompt.push_str("- ");
                prompt.push_str(lesson);
                prompt.push('\n');
            }
            prompt.push('\n');
        }

        if let Some(state) = &options.current_state {
            prompt.push_str(&format!("Current state: {}\n\n", state));
        }

        prompt.push_str(&render_transcript(messages));
        prompt
    }
}

/// Exponential backoff starting at 200ms, capped at ~100s
fn retry_delay(attempt: usize) -> Duration {
    Duration::from_millis(100u64 << attempt.min(10))
}

/// Parse the JSON reply of a reflection call. Code fences are tolerated.
pub fn parse_reflection(content: &str) -> Result<Reflection, ReflectorError> {
    let trimmed = content.trim();
    let body = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .and_then(|rest| rest.trim_end().strip_suffix("```"))
        .unwrap_or(trimmed)
        .trim();

    let reply: ReflectionReply = serde_json::from_str(body)
        .map_err(|e| ReflectorError::InvalidResponse(format!("{}: {}", e, body)))?;

    let lessons = reply
        .lessons
        .into_iter()
        .filter(|l| !l.content.trim().is_empty())
        .map(|l| Lesson::new(l.kind, l.content.trim()))
        .collect();

    let state_entries = match reply.state {
        None | Some(Value::Null) => Vec::new(),
        Some(Value::Array(items)) => items,
        Some(single) => vec![single],
    };

    Ok(Reflection {
        lessons,
        state_entries,
    })
}

#[async_trait]
impl Reflector for LlmReflector {
    async fn reflect(
        &self,
        messages: &[ReflectionMessage],
        model_id: &str,
        options: &ReflectionOptions,
    ) -> Result<Reflection, ReflectorError> {
        if messages.is_empty() {
            return Ok(Reflection::default());
        }

        debug!("Reflecting on {} messages for {}", messages.len(), model_id);

        let request = ChatCompletionRequest {
            model: self
                .config
                .model
                .clone()
                .unwrap_or_else(|| model_id.to_string()),
            messages: vec![
                ChatMessage {
                    role: "system".to_string(),
                    content: "You distill conversations into short, reusable lessons. \
                        Reply with JSON only."
                        .to_string(),
                },
                ChatMessage {
                    role: "user".to_string(),
                    content: self.build_prompt(messages, options),
                },
            ],
            temperature: Some(0.2),
        };

        // Retry logic
        let mut last_error = None;
        for attempt in 0..self.config.max_retries.max(1) {
            if attempt > 0 {
                debug!("Retry attempt {} for reflection", attempt);
                tokio::time::sleep(retry_delay(attempt)).await;
            }

            let mut req = self.client.post(&self.config.endpoint).json(&request);

            if let Some(ref api_key) = self.config.api_key {
                req = req.header("Authorization", format!("Bearer {}", api_key));
            }

            match req.send().await {
                Ok(response) => {
                    if !response.status().is_success() {
                        let status = response.status();
                        let body = response.text().await.unwrap_or_default();
                        last_error = Some(ReflectorError::ApiError(format!(
                            "HTTP {}: {}",
                            status, body
                        )));
                        continue;
                    }

                    match response.json::<ChatCompletionResponse>().await {
                        Ok(resp) => match resp.choices.first() {
                            Some(choice) => {
                                // A malformed reply will not improve on retry
                                return parse_reflection(&choice.message.content);
                            }
                            None => {
                                last_error =
                                    Some(ReflectorError::ApiError("No choices in response".to_string()));
                            }
                        },
                        Err(e) => {
                            last_error = Some(ReflectorError::ApiError(format!(
                                "Failed to parse response: {}",
                                e
                            )));
                        }
                    }
                }
                Err(e) => {
                    last_error = Some(ReflectorError::NetworkError(e.to_string()));
                }
            }
        }

        warn!("Reflection failed after {} attempts", self.config.max_retries);
        Err(last_error.unwrap_or(ReflectorError::Unknown))
    }
}

/// Reflector that learns nothing; used when reflection is disabled
pub struct NullReflector;

#[async_trait]
impl Reflector for NullReflector {
    async fn reflect(
        &self,
        _messages: &[ReflectionMessage],
        _model_id: &str,
        _options: &ReflectionOptions,
    ) -> Result<Reflection, ReflectorError> {
        Ok(Reflection::default())
    }
}

/// Reflector errors
#[derive(Debug, thiserror::Error)]
pub enum ReflectorError {
    #[error("Initialization error: {0}")]
    InitializationError(String),

    #[error("API error: {0}")]
    ApiError(String),

    #[error("Network error: {0}")]
    NetworkError(String),

    #[error("Invalid reflection response: {0}")]
    InvalidResponse(String),

    #[error("Reflection timed out after {0:?}")]
    Timeout(Duration),

    #[error("Unknown error")]
    Unknown,
}

#[derive(Debug, Deserialize)]
struct ReflectionReply {
    #[serde(default)]
    lessons: Vec<ReplyLesson>,
    #[serde(default)]
    state: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct ReplyLesson {
    #[serde(rename = "type", default = "default_reply_kind")]
    kind: LessonKind,
    content: String,
}

fn default_reply_kind() -> LessonKind {
    LessonKind::Factual
}

// OpenAI-compatible API types
#[derive(Debug, Serialize)]
struct ChatCompletionRequest {
    model: String,
    messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
}

#[derive(Debug, Serialize, Deserialize)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}
