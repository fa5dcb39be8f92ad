use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{ChartConfig, ProcessingStep, TableData};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    User,
    Assistant,
    System,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    Sending,
    Sent,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct MessageMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub table: Option<TableData>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub charts: Vec<ChartConfig>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub processing_steps: Vec<ProcessingStep>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    pub id: String,
    pub role: MessageRole,
    #[serde(default)]
    pub content: String,
    pub status: MessageStatus,
    #[serde(default)]
    pub metadata: MessageMetadata,
    pub created_at: DateTime<Utc>,
}

impl Message {
    pub fn new(role: MessageRole, content: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            role,
            content: content.into(),
            status: MessageStatus::Sent,
            metadata: MessageMetadata::default(),
            created_at: Utc::now(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(MessageRole::User, content)
    }

    /// An assistant message still being streamed.
    pub fn pending_assistant() -> Self {
        let mut message = Self::new(MessageRole::Assistant, "");
        message.status = MessageStatus::Sending;
        message
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Session {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub messages: Vec<Message>,
    #[serde(default)]
    pub data_source_ids: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Session {
    pub fn new(title: Option<String>, data_source_ids: Vec<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            title: title.unwrap_or_else(|| "New session".to_string()),
            messages: Vec::new(),
            data_source_ids,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn last_message(&self) -> Option<&Message> {
        self.messages.last()
    }
}

/// Title derived from the first user question, cut at a char boundary.
pub fn title_from_query(query: &str) -> String {
    let trimmed = query.trim();
    if trimmed.is_empty() {
        return "New session".to_string();
    }
    let mut title = trimmed.chars().take(48).collect::<String>();
    if trimmed.chars().count() > 48 {
        title.push('…');
    }
    title
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pending_assistant_starts_sending_and_empty() {
        let message = Message::pending_assistant();
        assert_eq!(message.role, MessageRole::Assistant);
        assert_eq!(message.status, MessageStatus::Sending);
        assert!(message.content.is_empty());
    }

    #[test]
    fn title_truncates_on_char_boundary() {
        let long = "每".repeat(60);
        let title = title_from_query(&long);
        assert_eq!(title.chars().count(), 49);
        assert!(title.ends_with('…'));
        assert_eq!(title_from_query("  "), "New session");
    }

    #[test]
    fn empty_metadata_serializes_compactly() {
        let value = serde_json::to_value(MessageMetadata::default()).expect("serialize");
        assert_eq!(value, serde_json::json!({}));
    }
}
