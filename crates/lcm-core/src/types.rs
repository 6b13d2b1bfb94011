//! Core types for lcm — prompts, chat messages, and the health record.
//!
//! Messages serialize in the `{"role": "...", "content": "..."}` shape that
//! chat-style backends (Ollama `/api/chat`) expect on the wire.

use serde::{Deserialize, Serialize};

// ─────────────────────────────────────────────
// Messages
// ─────────────────────────────────────────────

/// A single chat message.
///
/// Each variant maps to a `role` field value.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "role", rename_all = "lowercase")]
pub enum Message {
    System { content: String },
    User { content: String },
    Assistant { content: String },
}

impl Message {
    /// Create a system message.
    pub fn system(content: impl Into<String>) -> Self {
        Message::System {
            content: content.into(),
        }
    }

    /// Create a user message.
    pub fn user(content: impl Into<String>) -> Self {
        Message::User {
            content: content.into(),
        }
    }

    /// Create an assistant message.
    pub fn assistant(content: impl Into<String>) -> Self {
        Message::Assistant {
            content: content.into(),
        }
    }

    pub fn content(&self) -> &str {
        match self {
            Message::System { content }
            | Message::User { content }
            | Message::Assistant { content } => content,
        }
    }

    pub fn role(&self) -> &'static str {
        match self {
            Message::System { .. } => "system",
            Message::User { .. } => "user",
            Message::Assistant { .. } => "assistant",
        }
    }
}

// ─────────────────────────────────────────────
// Prompt
// ─────────────────────────────────────────────

/// What the caller asks the model: a bare string or a full conversation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Prompt {
    Text(String),
    Messages(Vec<Message>),
}

impl Prompt {
    /// Normalize into a message list. Plain text becomes one user message.
    pub fn to_messages(&self) -> Vec<Message> {
        match self {
            Prompt::Text(text) => vec![Message::user(text.clone())],
            Prompt::Messages(messages) => messages.clone(),
        }
    }

    /// The text a completion-style backend receives: the last message's
    /// content, or the bare text.
    pub fn last_text(&self) -> &str {
        match self {
            Prompt::Text(text) => text,
            Prompt::Messages(messages) => messages.last().map(Message::content).unwrap_or(""),
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            Prompt::Text(text) => text.is_empty(),
            Prompt::Messages(messages) => messages.is_empty(),
        }
    }
}

impl From<&str> for Prompt {
    fn from(text: &str) -> Self {
        Prompt::Text(text.to_string())
    }
}

impl From<String> for Prompt {
    fn from(text: String) -> Self {
        Prompt::Text(text)
    }
}

impl From<&String> for Prompt {
    fn from(text: &String) -> Self {
        Prompt::Text(text.clone())
    }
}

impl From<Vec<Message>> for Prompt {
    fn from(messages: Vec<Message>) -> Self {
        Prompt::Messages(messages)
    }
}

impl From<&[Message]> for Prompt {
    fn from(messages: &[Message]) -> Self {
        Prompt::Messages(messages.to_vec())
    }
}

// ─────────────────────────────────────────────
// Health
// ─────────────────────────────────────────────

/// Diagnostic status of a backend.
///
/// Health checks degrade into this record instead of failing.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct HealthStatus {
    /// Whether the backend answered at all.
    pub reachable: bool,
    /// Whether the configured model is present and usable.
    pub model_ready: bool,
    /// Free-form explanation (pull status, error text, device, …).
    pub detail: String,
}

impl HealthStatus {
    pub fn ready(detail: impl Into<String>) -> Self {
        Self {
            reachable: true,
            model_ready: true,
            detail: detail.into(),
        }
    }

    /// Reachable, but the model is not (yet) available.
    pub fn model_missing(detail: impl Into<String>) -> Self {
        Self {
            reachable: true,
            model_ready: false,
            detail: detail.into(),
        }
    }

    pub fn unreachable(detail: impl Into<String>) -> Self {
        Self {
            reachable: false,
            model_ready: false,
            detail: detail.into(),
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.reachable && self.model_ready
    }
}

// ─────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────
