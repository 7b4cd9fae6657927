//! Output parts — the fragments a generation produces.
//!
//! A stream's deltas carry ordered sequences of parts. Readers reconstruct
//! the full output by concatenating parts across deltas in cursor order.
//! Parts are persisted as JSON, so the enum is tagged for schema evolution.

use serde::{Deserialize, Serialize};

/// One fragment of model output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutputPart {
    /// A fragment of the visible response text.
    Text { text: String },

    /// A fragment of reasoning emitted before the response.
    Reasoning { text: String },

    /// Tool invocation request (immutable, created all at once).
    ToolCall {
        /// Unique ID for this call (for correlation with the result).
        id: String,
        /// Tool name (e.g., "shell.exec").
        name: String,
        /// Tool input parameters as JSON.
        input: serde_json::Value,
    },

    /// Tool execution result (provided by the system, not the model).
    ToolResult {
        /// ID of the tool call this is a result for.
        tool_call_id: String,
        /// Result content (typically text or JSON).
        content: String,
        /// Whether this result represents an error.
        is_error: bool,
    },
}

impl OutputPart {
    /// Convenience constructor for a text fragment.
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    /// Convenience constructor for a reasoning fragment.
    pub fn reasoning(text: impl Into<String>) -> Self {
        Self::Reasoning { text: text.into() }
    }

    /// Check if this is a text fragment.
    pub fn is_text(&self) -> bool {
        matches!(self, Self::Text { .. })
    }

    /// Extract the visible text, if any.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text { text } => Some(text),
            _ => None,
        }
    }
}

/// Concatenate the visible text carried by a sequence of parts.
///
/// Reasoning and tool parts contribute nothing; this is the reader-side
/// reconstruction of the response body.
pub fn concat_text<'a, I>(parts: I) -> String
where
    I: IntoIterator<Item = &'a OutputPart>,
{
    let mut out = String::new();
    for part in parts {
        if let Some(text) = part.as_text() {
            out.push_str(text);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_concat_skips_non_text() {
        let parts = vec![
            OutputPart::reasoning("hmm"),
            OutputPart::text("hello"),
            OutputPart::ToolCall {
                id: "t1".into(),
                name: "shell.exec".into(),
                input: serde_json::json!({"cmd": "ls"}),
            },
            OutputPart::text(" world"),
        ];
        assert_eq!(concat_text(&parts), "hello world");
    }

    #[test]
    fn test_json_roundtrip() {
        let part = OutputPart::ToolResult {
            tool_call_id: "t1".into(),
            content: "ok".into(),
            is_error: false,
        };
        let json = serde_json::to_string(&part).unwrap();
        let back: OutputPart = serde_json::from_str(&json).unwrap();
        assert_eq!(part, back);
    }

    #[test]
    fn test_tagged_representation() {
        let json = serde_json::to_value(OutputPart::text("hi")).unwrap();
        assert_eq!(json["type"], "text");
        assert_eq!(json["text"], "hi");
    }
}
