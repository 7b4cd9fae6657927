//! Shared identity and content types for Freshet.
//!
//! This crate is the relational foundation: typed IDs, output parts,
//! stream lifecycle state, and the message model. It has **no internal
//! freshet dependencies** — a pure leaf crate that other crates build on.
//!
//! # Entity-Relationship Overview
//!
//! ```text
//! Thread (ThreadId) ← one conversation
//!     └── owns Message (MessageId, ordered by order/step_order)
//!     └── owns Stream (StreamId) while a generation is in flight
//!
//! Stream (StreamId) ← one generation step
//!     └── identified by (ThreadId, order, step_order)
//!     └── accumulates Delta (start..end, parts)
//!     └── state: streaming → finished | error
//!
//! Message (MessageId)
//!     └── references File (FileId) attachments
//! ```

pub mod ids;
pub mod message;
pub mod part;
pub mod stream;

// Re-export primary types at crate root for convenience.
pub use ids::{FileId, MessageId, StreamId, ThreadId, UserId};
pub use message::{Message, MessageRole, MessageStatus};
pub use part::{concat_text, OutputPart};
pub use stream::{DeltaRecord, StreamOrigin, StreamState, StreamStateKind};

/// Current time as Unix milliseconds. Used by constructors throughout the
/// workspace.
pub fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
