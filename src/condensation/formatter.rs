//! Formatting discarded history for reflection

use super::history::{EntryKind, HistoryEntry, Role};
use serde::{Deserialize, Serialize};

/// Role-tagged message handed to a reflector
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReflectionMessage {
    pub role: Role,
    pub content: String,
}

impl ReflectionMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }
}

fn label(kind: EntryKind) -> Option<&'static str> {
    match kind {
        EntryKind::Decision => Some("Decision"),
        EntryKind::Result => Some("Action result"),
        EntryKind::Event => Some("Event"),
        EntryKind::User | EntryKind::Assistant | EntryKind::Prompt => None,
    }
}

/// Format one entry. Decisions, results and events carry a short label so
/// the reflector can tell them apart from plain chat turns.
pub fn format_entry(entry: &HistoryEntry) -> ReflectionMessage {
    let text = entry.text();
    let content = match label(entry.kind) {
        Some(label) => format!("{}: {}", label, text),
        None => text,
    };
    ReflectionMessage::new(entry.role(), content)
}

/// Format entries in order; empty entries are dropped
pub fn format_for_reflection(entries: &[HistoryEntry]) -> Vec<ReflectionMessage> {
    entries
        .iter()
        .map(format_entry)
        .filter(|m| !m.content.trim().is_empty())
        .collect()
}

/// Plain transcript form, one `role: content` block per message
pub fn render_transcript(messages: &[ReflectionMessage]) -> String {
    messages
        .iter()
        .map(|m| format!("[{}]\n{}", m.role.as_str(), m.content))
        .collect::<Vec<_>>()
        .join("\n\n")
}
