//! Core data types used throughout parley.
//!
//! This module defines the conversation model that flows between the
//! orchestrator, the provider adapters and the persistence layer:
//! messages, conversations, folders, token usage and attachments.

use serde::{Deserialize, Serialize};

// --- Message Roles ---

/// The role of a message in the conversation.
///
/// - `System`: instructions to the model (never shown as a turn)
/// - `User`: the human's input
/// - `Assistant`: the model's response
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

// --- Usage ---

/// Token counters reported by a provider, normalized to one shape.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Usage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

impl Usage {
    pub fn new(prompt_tokens: u64, completion_tokens: u64, total_tokens: u64) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens,
        }
    }
}

// --- Attachment ---

/// A file attached to a user turn.
///
/// `data` is base64 without any `data:` URL prefix.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Attachment {
    pub name: String,
    pub mime_type: String,
    pub data: String,
}

impl Attachment {
    pub fn is_image(&self) -> bool {
        self.mime_type.starts_with("image/")
    }
}

// --- Messages ---

/// A single turn in a conversation.
///
/// Only assistant messages carry citations, model, latency, usage and
/// suggestions. `created_at` (epoch milliseconds) doubles as the ordering
/// key and as the cutoff for "messages sent before this turn".
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    pub role: Role,
    pub content: String,
    pub created_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub citations: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_time_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub suggestions: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<Attachment>,
}

impl Message {
    fn new(role: Role, content: impl Into<String>, created_at: i64) -> Self {
        Self {
            role,
            content: content.into(),
            created_at,
            citations: None,
            model: None,
            response_time_ms: None,
            usage: None,
            suggestions: Vec::new(),
            attachments: Vec::new(),
        }
    }

    #[cfg(test)]
    pub fn system(content: impl Into<String>, created_at: i64) -> Self {
        Self::new(Role::System, content, created_at)
    }

    /// Create a user message.
    pub fn user(content: impl Into<String>, created_at: i64) -> Self {
        Self::new(Role::User, content, created_at)
    }

    #[cfg(test)]
    pub fn assistant(content: impl Into<String>, created_at: i64) -> Self {
        Self::new(Role::Assistant, content, created_at)
    }

    pub fn with_attachments(mut self, attachments: Vec<Attachment>) -> Self {
        self.attachments = attachments;
        self
    }

    /// Empty assistant turn that the stream fills in.
    pub fn placeholder(model: impl Into<String>, created_at: i64) -> Self {
        let mut msg = Self::new(Role::Assistant, String::new(), created_at);
        msg.model = Some(model.into());
        msg
    }
}

// --- Conversation ---

/// An ordered, append-only list of turns plus its metadata.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Conversation {
    pub id: String,
    pub title: String,
    pub messages: Vec<Message>,
    pub created_at: i64,
    pub updated_at: i64,
    /// Weak reference to a folder by id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub folder_id: Option<String>,
}

impl Conversation {
    pub fn new(title: impl Into<String>) -> Self {
        let now = now_millis();
        Self {
            id: generate_id(),
            title: title.into(),
            messages: Vec::new(),
            created_at: now,
            updated_at: now,
            folder_id: None,
        }
    }

    /// Returns a timestamp strictly greater than every message already
    /// in the conversation.
    pub fn next_timestamp(&self) -> i64 {
        let now = now_millis();
        match self.messages.last() {
            Some(last) if last.created_at >= now => last.created_at + 1,
            _ => now,
        }
    }

    /// Messages created strictly before `cutoff`.
    pub fn history_before(&self, cutoff: i64) -> Vec<Message> {
        self.messages
            .iter()
            .filter(|m| m.created_at < cutoff)
            .cloned()
            .collect()
    }

    pub fn message_at_mut(&mut self, created_at: i64) -> Option<&mut Message> {
        self.messages
            .iter_mut()
            .rev()
            .find(|m| m.created_at == created_at)
    }

    pub fn user_turns(&self) -> usize {
        self.messages.iter().filter(|m| m.role == Role::User).count()
    }
}

// --- Folder ---

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Folder {
    pub id: String,
    pub name: String,
    pub created_at: i64,
}

impl Folder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: generate_id(),
            name: name.into(),
            created_at: now_millis(),
        }
    }
}

pub fn generate_id() -> String {
    uuid::Uuid::new_v4().to_string()[..8].to_string()
}

pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
