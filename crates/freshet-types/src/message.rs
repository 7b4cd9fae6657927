//! Message model — the finalized units of a conversation.
//!
//! Streams are the in-flight representation; once a generation step
//! completes, its output lives on as a [`Message`] with the stream's
//! order/step position.

use serde::{Deserialize, Serialize};

use crate::ids::{MessageId, ThreadId};
use crate::now_millis;
use crate::part::{concat_text, OutputPart};

/// Who authored a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    User,
    Assistant,
    System,
}

impl MessageRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::System => "system",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "user" => Some(Self::User),
            "assistant" => Some(Self::Assistant),
            "system" => Some(Self::System),
            _ => None,
        }
    }
}

/// Delivery status of a message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MessageStatus {
    /// Fully written.
    Complete,
    /// The generation behind this message failed; rendered distinctly.
    Error {
        /// Failure text surfaced to the user.
        message: String,
    },
}

impl MessageStatus {
    /// The discriminant for the `status` column.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Complete => "complete",
            Self::Error { .. } => "error",
        }
    }
}

/// A finalized conversation message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Unique identifier.
    pub id: MessageId,
    /// Owning thread.
    pub thread_id: ThreadId,
    /// Author role.
    pub role: MessageRole,
    /// Delivery status.
    pub status: MessageStatus,
    /// Ordered output parts.
    pub parts: Vec<OutputPart>,
    /// Position in the thread.
    pub order: u64,
    /// Step within the generation that produced it (0 for user messages).
    pub step_order: u64,
    /// Creation time (Unix millis).
    pub created_at: u64,
}

impl Message {
    /// Create a user message from plain text.
    pub fn user(thread_id: ThreadId, text: impl Into<String>, order: u64) -> Self {
        Self {
            id: MessageId::new(),
            thread_id,
            role: MessageRole::User,
            status: MessageStatus::Complete,
            parts: vec![OutputPart::text(text)],
            order,
            step_order: 0,
            created_at: now_millis(),
        }
    }

    /// Create an assistant message from generated parts.
    pub fn assistant(thread_id: ThreadId, parts: Vec<OutputPart>, order: u64, step_order: u64) -> Self {
        Self {
            id: MessageId::new(),
            thread_id,
            role: MessageRole::Assistant,
            status: MessageStatus::Complete,
            parts,
            order,
            step_order,
            created_at: now_millis(),
        }
    }

    /// Mark this message as failed with the given error text.
    pub fn with_error(mut self, message: impl Into<String>) -> Self {
        self.status = MessageStatus::Error {
            message: message.into(),
        };
        self
    }

    /// The visible text of this message.
    pub fn text(&self) -> String {
        concat_text(&self.parts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_roundtrip() {
        for role in [MessageRole::User, MessageRole::Assistant, MessageRole::System] {
            assert_eq!(MessageRole::from_str(role.as_str()), Some(role));
        }
        assert_eq!(MessageRole::from_str("robot"), None);
    }

    #[test]
    fn test_user_message_text() {
        let msg = Message::user(ThreadId::new(), "hello", 0);
        assert_eq!(msg.text(), "hello");
        assert_eq!(msg.role, MessageRole::User);
        assert_eq!(msg.status, MessageStatus::Complete);
    }

    #[test]
    fn test_error_status() {
        let msg = Message::assistant(ThreadId::new(), vec![], 1, 0).with_error("model unavailable");
        match msg.status {
            MessageStatus::Error { ref message } => assert_eq!(message, "model unavailable"),
            _ => panic!("expected error status"),
        }
        assert_eq!(msg.status.as_str(), "error");
    }
}
