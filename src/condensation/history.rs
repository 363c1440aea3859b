//! Per-model conversation history held in an agent's own state

use super::lessons::Lesson;
use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Model identifier, e.g. `"anthropic:claude-sonnet"`
pub type ModelId = String;

/// Kind of history entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    User,
    Assistant,
    Decision,
    Result,
    Prompt,
    Event,
}

/// Chat role an entry is presented under
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }
}

impl EntryKind {
    /// Model output is `assistant`; everything fed to the model is `user`
    pub fn role(&self) -> Role {
        match self {
            Self::Assistant | Self::Decision => Role::Assistant,
            Self::User | Self::Prompt | Self::Result | Self::Event => Role::User,
        }
    }
}

/// One part of multimodal content
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text { text: String },
    ImageUrl { url: String },
    Other { data: Value },
}

/// Entry payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "format", content = "value", rename_all = "snake_case")]
pub enum EntryContent {
    Text(String),
    Structured(Value),
    Tuple(Vec<Value>),
    Parts(Vec<ContentPart>),
}

impl EntryContent {
    /// Readable text form used for token estimation and reflection
    pub fn to_text(&self) -> String {
        match self {
            Self::Text(text) => text.clone(),
            Self::Structured(value) => {
                serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
            }
            Self::Tuple(items) => {
                let rendered: Vec<String> = items.iter().map(render_scalar).collect();
                format!("({})", rendered.join(", "))
            }
            Self::Parts(parts) => parts
                .iter()
                .map(|part| match part {
                    ContentPart::Text { text } => text.clone(),
                    ContentPart::ImageUrl { url } => format!("[image: {}]", url),
                    ContentPart::Other { data } => data.to_string(),
                })
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }
}

fn render_scalar(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

impl From<&str> for EntryContent {
    fn from(text: &str) -> Self {
        Self::Text(text.to_string())
    }
}

impl From<String> for EntryContent {
    fn from(text: String) -> Self {
        Self::Text(text)
    }
}

impl From<Value> for EntryContent {
    fn from(value: Value) -> Self {
        match value {
            Value::String(s) => Self::Text(s),
            other => Self::Structured(other),
        }
    }
}

/// One exchanged message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    #[serde(rename = "type")]
    pub kind: EntryKind,
    pub content: EntryContent,
    pub timestamp: DateTime<Utc>,
}

impl HistoryEntry {
    pub fn new(kind: EntryKind, content: impl Into<EntryContent>) -> Self {
        Self {
            kind,
            content: content.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn user(content: impl Into<EntryContent>) -> Self {
        Self::new(EntryKind::User, content)
    }

    pub fn assistant(content: impl Into<EntryContent>) -> Self {
        Self::new(EntryKind::Assistant, content)
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn role(&self) -> Role {
        self.kind.role()
    }

    pub fn text(&self) -> String {
        self.content.to_text()
    }
}

/// Condensation-relevant state of one agent
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentState {
    pub agent_id: String,
    #[serde(default)]
    pub model_histories: IndexMap<ModelId, Vec<HistoryEntry>>,
    #[serde(default)]
    pub context_lessons: IndexMap<ModelId, Vec<Lesson>>,
    #[serde(default)]
    pub model_states: IndexMap<ModelId, Value>,
}

impl AgentState {
    pub fn new(agent_id: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
            ..Default::default()
        }
    }

    /// Append an entry to a model's history (newest last)
    pub fn push_entry(&mut self, model_id: &str, entry: HistoryEntry) {
        self.model_histories
            .entry(model_id.to_string())
            .or_default()
            .push(entry);
    }

    pub fn history(&self, model_id: &str) -> &[HistoryEntry] {
        self.model_histories
            .get(model_id)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn lessons(&self, model_id: &str) -> &[Lesson] {
        self.context_lessons
            .get(model_id)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn model_state(&self, model_id: &str) -> Option<&Value> {
        self.model_states.get(model_id)
    }

    pub fn model_ids(&self) -> Vec<ModelId> {
        self.model_histories.keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_roles() {
        assert_eq!(EntryKind::Decision.role(), Role::Assistant);
        assert_eq!(EntryKind::Result.role(), Role::User);
        assert_eq!(EntryKind::Prompt.role(), Role::User);
        assert_eq!(EntryKind::Event.role(), Role::User);
    }

    #[test]
    fn test_content_to_text() {
        assert_eq!(EntryContent::from("hi").to_text(), "hi");
        assert_eq!(
            EntryContent::Tuple(vec![json!("ok"), json!(3)]).to_text(),
            "(ok, 3)"
        );

        let parts = EntryContent::Parts(vec![
            ContentPart::Text {
                text: "look at this".to_string(),
            },
            ContentPart::ImageUrl {
                url: "https://example.com/a.png".to_string(),
            },
        ]);
        assert_eq!(parts.to_text(), "look at this\n[image: https://example.com/a.png]");

        let structured = EntryContent::from(json!({"action": "wait"}));
        assert!(structured.to_text().contains("\"action\": \"wait\""));
    }

    #[test]
    fn test_push_and_read_history() {
        let mut state = AgentState::new("agent-1");
        state.push_entry("m1", HistoryEntry::user("q"));
        state.push_entry("m1", HistoryEntry::assistant("a"));
        state.push_entry("m2", HistoryEntry::user("q2"));

        assert_eq!(state.history("m1").len(), 2);
        assert_eq!(state.history("m1")[1].role(), Role::Assistant);
        assert!(state.history("missing").is_empty());
        assert_eq!(state.model_ids(), vec!["m1".to_string(), "m2".to_string()]);
    }

    #[test]
    fn test_state_serde_round_trip() {
        let mut state = AgentState::new("agent-1");
        state.push_entry(
            "m1",
            HistoryEntry::new(EntryKind::Result, json!({"exit": 0})),
        );
        state.model_states.insert("m1".to_string(), json!({"focus": "tests"}));

        let json = serde_json::to_string(&state).unwrap();
        let back: AgentState = serde_json::from_str(&json).unwrap();
        assert_eq!(back, state);
    }
}
