//! Stream lifecycle state and delta records.
//!
//! A stream is one generation step's durable append log. Its state is a
//! tagged union so illegal combinations (a finished timestamp alongside a
//! streaming heartbeat) are unrepresentable.

use serde::{Deserialize, Serialize};

use crate::ids::{StreamId, ThreadId, UserId};
use crate::part::OutputPart;

/// Lifecycle state of a stream.
///
/// Transitions: `Streaming → Finished` or `Streaming → Error`. Terminal
/// states never transition again.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StreamState {
    /// A producer is actively appending deltas.
    Streaming {
        /// Last append time (Unix millis) — the liveness signal the
        /// reconciliation sweep checks.
        last_heartbeat_at: u64,
    },
    /// The stream completed normally.
    Finished {
        /// Completion time (Unix millis). Retained to support vacuuming.
        ended_at: u64,
    },
    /// The stream failed; the owning message carries the error status.
    Error {
        /// Human-readable failure text.
        message: String,
    },
}

impl StreamState {
    /// The discriminant without variant payload.
    pub fn kind(&self) -> StreamStateKind {
        match self {
            Self::Streaming { .. } => StreamStateKind::Streaming,
            Self::Finished { .. } => StreamStateKind::Finished,
            Self::Error { .. } => StreamStateKind::Error,
        }
    }

    /// Check if a producer still owns this stream.
    pub fn is_streaming(&self) -> bool {
        matches!(self, Self::Streaming { .. })
    }

    /// Check if this state admits no further transitions.
    pub fn is_terminal(&self) -> bool {
        !self.is_streaming()
    }
}

/// Discriminant of [`StreamState`] — the `state` column value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamStateKind {
    Streaming,
    Finished,
    Error,
}

impl StreamStateKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Streaming => "streaming",
            Self::Finished => "finished",
            Self::Error => "error",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "streaming" => Some(Self::Streaming),
            "finished" => Some(Self::Finished),
            "error" => Some(Self::Error),
            _ => None,
        }
    }
}

/// Provenance of a stream: who is generating, for which thread, at which
/// position. Captured once when the stream row is created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamOrigin {
    /// The thread this generation belongs to.
    pub thread_id: ThreadId,
    /// Owning user. A stream cannot be created without one.
    pub user_id: Option<UserId>,
    /// Agent persona name, if any.
    pub agent_name: Option<String>,
    /// Model identifier, if known.
    pub model_id: Option<String>,
    /// Provider identifier, if known.
    pub provider: Option<String>,
    /// Position of the parent message in the thread.
    pub order: u64,
    /// Position within a multi-step generation, monotonically increasing
    /// per stream.
    pub step_order: u64,
}

impl StreamOrigin {
    /// Create an origin for the first step at the given thread position.
    pub fn new(thread_id: ThreadId, user_id: UserId, order: u64) -> Self {
        Self {
            thread_id,
            user_id: Some(user_id),
            agent_name: None,
            model_id: None,
            provider: None,
            order,
            step_order: 0,
        }
    }

    /// Set the model metadata.
    pub fn with_model(mut self, provider: impl Into<String>, model_id: impl Into<String>) -> Self {
        self.provider = Some(provider.into());
        self.model_id = Some(model_id.into());
        self
    }

    /// Set the agent persona name.
    pub fn with_agent(mut self, agent_name: impl Into<String>) -> Self {
        self.agent_name = Some(agent_name.into());
        self
    }

    /// Set the step position within a multi-step generation.
    pub fn with_step(mut self, step_order: u64) -> Self {
        self.step_order = step_order;
        self
    }
}

/// One immutable chunk of a stream's output.
///
/// Invariant: for a given stream, delta ranges are contiguous and
/// non-overlapping — the first delta starts at 0 and each delta's `end`
/// equals the next delta's `start`. The unit is the part count, so
/// `end - start == parts.len()`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeltaRecord {
    /// Owning stream.
    pub stream_id: StreamId,
    /// Inclusive part offset of the first part in this delta.
    pub start: u64,
    /// Exclusive part offset past the last part in this delta.
    pub end: u64,
    /// The parts, in production order.
    pub parts: Vec<OutputPart>,
    /// Insertion time (Unix millis).
    pub created_at: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_kind_roundtrip() {
        for kind in [
            StreamStateKind::Streaming,
            StreamStateKind::Finished,
            StreamStateKind::Error,
        ] {
            assert_eq!(StreamStateKind::from_str(kind.as_str()), Some(kind));
        }
        assert_eq!(StreamStateKind::from_str("bogus"), None);
    }

    #[test]
    fn test_terminal_states() {
        assert!(StreamState::Streaming { last_heartbeat_at: 0 }.is_streaming());
        assert!(StreamState::Finished { ended_at: 1 }.is_terminal());
        assert!(StreamState::Error { message: "x".into() }.is_terminal());
    }

    #[test]
    fn test_origin_builder() {
        let thread = ThreadId::new();
        let user = UserId::new();
        let origin = StreamOrigin::new(thread, user, 3)
            .with_model("anthropic", "claude-sonnet-4")
            .with_agent("helper")
            .with_step(2);

        assert_eq!(origin.thread_id, thread);
        assert_eq!(origin.user_id, Some(user));
        assert_eq!(origin.provider.as_deref(), Some("anthropic"));
        assert_eq!(origin.order, 3);
        assert_eq!(origin.step_order, 2);
    }
}
