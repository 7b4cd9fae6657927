//! SQLite persistence for threads, messages, streams, deltas, and files.
//!
//! A single connection behind a mutex serializes every mutation, so each
//! method that opens a transaction is atomic and serializable relative to
//! all others. The check-then-act in [`ChatDb::create_stream`] depends on
//! that: the "one active stream per (thread, order, step)" invariant holds
//! because no other mutation can interleave with the creating transaction.

use std::path::Path;

use rusqlite::{params, Connection, OptionalExtension, Result as SqliteResult};
use thiserror::Error;

use freshet_types::{
    now_millis, DeltaRecord, FileId, Message, MessageRole, MessageStatus, OutputPart, StreamId,
    StreamOrigin, StreamState, StreamStateKind, ThreadId,
};

/// Errors from stream and thread persistence.
#[derive(Debug, Error)]
pub enum StreamError {
    #[error("stream has no owning user")]
    MissingOwner,

    #[error("an active stream already exists for thread {thread_id} at ({order}, {step_order})")]
    ActiveStreamExists {
        thread_id: ThreadId,
        order: u64,
        step_order: u64,
    },

    #[error("generation already in progress for thread {0}")]
    GenerationInProgress(ThreadId),

    #[error("thread not found: {0}")]
    ThreadNotFound(ThreadId),

    #[error("stream not found: {0}")]
    StreamNotFound(StreamId),

    #[error("stream {0} is no longer accepting deltas")]
    StreamClosed(StreamId),

    #[error("delta gap for stream {stream_id}: expected start {expected}, got {got}")]
    DeltaGap {
        stream_id: StreamId,
        expected: u64,
        got: u64,
    },

    #[error("stream {0} already reached a terminal state")]
    AlreadyTerminal(StreamId),

    #[error("no stream was ever created for this generation")]
    NeverStarted,

    #[error("stream aborted: {0}")]
    Aborted(String),

    #[error("corrupt row: {0}")]
    Corrupt(String),

    #[error("database error: {0}")]
    Db(#[from] rusqlite::Error),

    #[error("part encoding error: {0}")]
    Encoding(#[from] serde_json::Error),
}

const SCHEMA: &str = r#"
-- Conversation threads with generation state
CREATE TABLE IF NOT EXISTS threads (
    id TEXT PRIMARY KEY,
    title TEXT NOT NULL,
    generating INTEGER NOT NULL DEFAULT 0,
    cancel_requested INTEGER NOT NULL DEFAULT 0,
    created_at INTEGER NOT NULL
);

-- Finalized messages
CREATE TABLE IF NOT EXISTS messages (
    id TEXT PRIMARY KEY,
    thread_id TEXT NOT NULL,
    role TEXT NOT NULL,
    status TEXT NOT NULL,
    error TEXT,
    parts TEXT NOT NULL,
    order_idx INTEGER NOT NULL,
    step_order INTEGER NOT NULL,
    created_at INTEGER NOT NULL,
    FOREIGN KEY (thread_id) REFERENCES threads(id) ON DELETE CASCADE
);
CREATE INDEX IF NOT EXISTS idx_messages_position ON messages(thread_id, order_idx, step_order);
CREATE INDEX IF NOT EXISTS idx_messages_activity ON messages(thread_id, created_at DESC);

-- Message → file attachment references
CREATE TABLE IF NOT EXISTS message_files (
    message_id TEXT NOT NULL,
    file_id TEXT NOT NULL,
    PRIMARY KEY (message_id, file_id),
    FOREIGN KEY (message_id) REFERENCES messages(id) ON DELETE CASCADE
);

-- In-flight and completed generation streams
CREATE TABLE IF NOT EXISTS streams (
    id TEXT PRIMARY KEY,
    thread_id TEXT NOT NULL,
    user_id TEXT,
    agent_name TEXT,
    model_id TEXT,
    provider TEXT,
    order_idx INTEGER NOT NULL,
    step_order INTEGER NOT NULL,
    state TEXT NOT NULL,
    last_heartbeat_at INTEGER,
    ended_at INTEGER,
    error TEXT,
    created_at INTEGER NOT NULL,
    FOREIGN KEY (thread_id) REFERENCES threads(id) ON DELETE CASCADE
);
CREATE INDEX IF NOT EXISTS idx_streams_thread_state ON streams(thread_id, state);
CREATE INDEX IF NOT EXISTS idx_streams_key ON streams(thread_id, order_idx, step_order, state);

-- Append-only delta log (immutable once written)
CREATE TABLE IF NOT EXISTS deltas (
    stream_id TEXT NOT NULL,
    start_idx INTEGER NOT NULL,
    end_idx INTEGER NOT NULL,
    parts TEXT NOT NULL,
    created_at INTEGER NOT NULL,
    PRIMARY KEY (stream_id, start_idx),
    FOREIGN KEY (stream_id) REFERENCES streams(id) ON DELETE CASCADE
);
CREATE INDEX IF NOT EXISTS idx_deltas_cursor ON deltas(stream_id, end_idx);

-- Deduplicated file records (blob bytes live in the CAS)
CREATE TABLE IF NOT EXISTS files (
    id TEXT PRIMARY KEY,
    hash TEXT NOT NULL,
    filename TEXT,
    mime_type TEXT NOT NULL,
    blob_id TEXT NOT NULL,
    refcount INTEGER NOT NULL DEFAULT 0,
    last_touched_at INTEGER NOT NULL,
    created_at INTEGER NOT NULL
);
CREATE UNIQUE INDEX IF NOT EXISTS idx_files_identity ON files(hash, IFNULL(filename, ''));
CREATE INDEX IF NOT EXISTS idx_files_refcount ON files(refcount);
"#;

// =============================================================================
// Row Structs (module-private helpers)
// =============================================================================

/// Maps a row from the messages table before part decoding.
struct MessageRow {
    id: String,
    thread_id: String,
    role: String,
    status: String,
    error: Option<String>,
    parts: String,
    order_idx: i64,
    step_order: i64,
    created_at: i64,
}

/// A deduplicated file record.
#[derive(Debug, Clone)]
pub struct FileRecord {
    pub id: FileId,
    pub hash: String,
    pub filename: Option<String>,
    pub mime_type: String,
    pub blob_id: String,
    pub refcount: u64,
    pub last_touched_at: u64,
    pub created_at: u64,
}

/// One page of a stable refcount-zero scan.
#[derive(Debug, Clone)]
pub struct FilePage {
    pub files: Vec<FileRecord>,
    pub continue_cursor: Option<String>,
    pub is_done: bool,
}

/// Outcome of a guarded file-row delete.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileDeleteOutcome {
    /// Row removed; the blob id to delete from the CAS.
    Deleted { blob_id: String },
    /// Another referencer appeared since the scan; left in place.
    StillReferenced { refcount: u64 },
    /// No such record.
    Missing,
}

// =============================================================================
// Conversion helpers
// =============================================================================

fn parse_thread_id(s: &str) -> Result<ThreadId, StreamError> {
    ThreadId::parse(s).map_err(|_| StreamError::Corrupt(format!("bad thread id {s:?}")))
}

fn parse_stream_id(s: &str) -> Result<StreamId, StreamError> {
    StreamId::parse(s).map_err(|_| StreamError::Corrupt(format!("bad stream id {s:?}")))
}

fn parse_file_id(s: &str) -> Result<FileId, StreamError> {
    FileId::parse(s).map_err(|_| StreamError::Corrupt(format!("bad file id {s:?}")))
}

/// Reassemble a [`StreamState`] from its column triplet.
///
/// Rejects rows whose variant fields are missing rather than guessing.
fn state_from_columns(
    id: StreamId,
    state: &str,
    last_heartbeat_at: Option<i64>,
    ended_at: Option<i64>,
    error: Option<String>,
) -> Result<StreamState, StreamError> {
    match StreamStateKind::from_str(state) {
        Some(StreamStateKind::Streaming) => {
            let hb = last_heartbeat_at
                .ok_or_else(|| StreamError::Corrupt(format!("stream {id} missing heartbeat")))?;
            Ok(StreamState::Streaming {
                last_heartbeat_at: hb as u64,
            })
        }
        Some(StreamStateKind::Finished) => {
            let ended = ended_at
                .ok_or_else(|| StreamError::Corrupt(format!("stream {id} missing ended_at")))?;
            Ok(StreamState::Finished {
                ended_at: ended as u64,
            })
        }
        Some(StreamStateKind::Error) => {
            let message = error
                .ok_or_else(|| StreamError::Corrupt(format!("stream {id} missing error text")))?;
            Ok(StreamState::Error { message })
        }
        None => Err(StreamError::Corrupt(format!(
            "stream {id} has unknown state {state:?}"
        ))),
    }
}

fn message_from_row(row: MessageRow) -> Result<Message, StreamError> {
    let id = freshet_types::MessageId::parse(&row.id)
        .map_err(|_| StreamError::Corrupt(format!("bad message id {:?}", row.id)))?;
    let thread_id = parse_thread_id(&row.thread_id)?;
    let role = MessageRole::from_str(&row.role)
        .ok_or_else(|| StreamError::Corrupt(format!("unknown role {:?}", row.role)))?;
    let status = match row.status.as_str() {
        "complete" => MessageStatus::Complete,
        "error" => MessageStatus::Error {
            message: row.error.unwrap_or_default(),
        },
        other => return Err(StreamError::Corrupt(format!("unknown status {other:?}"))),
    };
    let parts: Vec<OutputPart> = serde_json::from_str(&row.parts)?;

    Ok(Message {
        id,
        thread_id,
        role,
        status,
        parts,
        order: row.order_idx as u64,
        step_order: row.step_order as u64,
        created_at: row.created_at as u64,
    })
}

/// Database handle for chat persistence.
pub struct ChatDb {
    conn: Connection,
}

impl ChatDb {
    /// Open or create a database at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> SqliteResult<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self { conn })
    }

    /// Create an in-memory database (for testing).
    pub fn in_memory() -> SqliteResult<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self { conn })
    }

    // =========================================================================
    // Threads & generation state
    // =========================================================================

    /// Create a new thread, returning its id.
    pub fn create_thread(&self, title: &str) -> Result<ThreadId, StreamError> {
        let id = ThreadId::new();
        self.conn.execute(
            "INSERT INTO threads (id, title, created_at) VALUES (?1, ?2, ?3)",
            params![id.to_string(), title, now_millis() as i64],
        )?;
        Ok(id)
    }

    /// Mark a thread as generating. Fails if a generation is already in
    /// progress — the producer-side guard against concurrent generations.
    pub fn begin_generation(&self, thread_id: ThreadId) -> Result<(), StreamError> {
        let changed = self.conn.execute(
            "UPDATE threads SET generating = 1 WHERE id = ?1 AND generating = 0",
            params![thread_id.to_string()],
        )?;
        if changed == 1 {
            return Ok(());
        }
        if !self.thread_exists(thread_id)? {
            return Err(StreamError::ThreadNotFound(thread_id));
        }
        Err(StreamError::GenerationInProgress(thread_id))
    }

    /// Request cancellation of an in-flight generation. Returns whether the
    /// flag was set (false when the thread is not generating).
    pub fn request_cancel(&self, thread_id: ThreadId) -> Result<bool, StreamError> {
        let changed = self.conn.execute(
            "UPDATE threads SET cancel_requested = 1 WHERE id = ?1 AND generating = 1",
            params![thread_id.to_string()],
        )?;
        if changed == 0 && !self.thread_exists(thread_id)? {
            return Err(StreamError::ThreadNotFound(thread_id));
        }
        Ok(changed == 1)
    }

    /// Clear `generating` and `cancel_requested` together. Idempotent — this
    /// is both the normal end-of-generation path and the sweep's repair.
    pub fn end_generation(&self, thread_id: ThreadId) -> Result<(), StreamError> {
        self.conn.execute(
            "UPDATE threads SET generating = 0, cancel_requested = 0 WHERE id = ?1",
            params![thread_id.to_string()],
        )?;
        Ok(())
    }

    /// Read (generating, cancel_requested) for a thread.
    pub fn generation_state(&self, thread_id: ThreadId) -> Result<(bool, bool), StreamError> {
        self.conn
            .query_row(
                "SELECT generating, cancel_requested FROM threads WHERE id = ?1",
                params![thread_id.to_string()],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)? != 0,
                        row.get::<_, i64>(1)? != 0,
                    ))
                },
            )
            .optional()?
            .ok_or(StreamError::ThreadNotFound(thread_id))
    }

    /// All threads currently claiming an in-flight generation.
    pub fn generating_threads(&self) -> Result<Vec<ThreadId>, StreamError> {
        let mut stmt = self
            .conn
            .prepare("SELECT id FROM threads WHERE generating = 1 ORDER BY id")?;
        let ids = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<SqliteResult<Vec<_>>>()?;
        ids.iter().map(|s| parse_thread_id(s)).collect()
    }

    /// Last activity on a thread (latest message time, falling back to the
    /// thread's creation time).
    pub fn last_activity(&self, thread_id: ThreadId) -> Result<u64, StreamError> {
        let row = self
            .conn
            .query_row(
                "SELECT t.created_at,
                        (SELECT MAX(m.created_at) FROM messages m WHERE m.thread_id = t.id)
                 FROM threads t WHERE t.id = ?1",
                params![thread_id.to_string()],
                |row| Ok((row.get::<_, i64>(0)?, row.get::<_, Option<i64>>(1)?)),
            )
            .optional()?;
        let (created_at, latest_message) = row.ok_or(StreamError::ThreadNotFound(thread_id))?;
        Ok(latest_message.unwrap_or(created_at) as u64)
    }

    fn thread_exists(&self, thread_id: ThreadId) -> Result<bool, StreamError> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM threads WHERE id = ?1",
            params![thread_id.to_string()],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    /// Delete a thread, its messages, and its streams; attached files lose
    /// one reference per message that carried them.
    pub fn delete_thread(&self, thread_id: ThreadId) -> Result<(), StreamError> {
        let tx = self.conn.unchecked_transaction()?;
        tx.execute(
            "UPDATE files SET refcount = CASE WHEN refcount > 0 THEN refcount - 1 ELSE 0 END
             WHERE id IN (
                 SELECT mf.file_id FROM message_files mf
                 JOIN messages m ON m.id = mf.message_id
                 WHERE m.thread_id = ?1
             )",
            params![thread_id.to_string()],
        )?;
        tx.execute(
            "DELETE FROM threads WHERE id = ?1",
            params![thread_id.to_string()],
        )?;
        tx.commit()?;
        Ok(())
    }

    // =========================================================================
    // Messages
    // =========================================================================

    /// Save a message and attach files, bumping each file's refcount in the
    /// same transaction. Re-attaching the same file to the same message is
    /// a no-op.
    pub fn save_message(&self, msg: &Message, file_ids: &[FileId]) -> Result<(), StreamError> {
        let parts = serde_json::to_string(&msg.parts)?;
        let (status, error) = match &msg.status {
            MessageStatus::Complete => ("complete", None),
            MessageStatus::Error { message } => ("error", Some(message.as_str())),
        };

        let tx = self.conn.unchecked_transaction()?;
        tx.execute(
            "INSERT INTO messages (id, thread_id, role, status, error, parts, order_idx, step_order, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                msg.id.to_string(),
                msg.thread_id.to_string(),
                msg.role.as_str(),
                status,
                error,
                parts,
                msg.order as i64,
                msg.step_order as i64,
                msg.created_at as i64,
            ],
        )?;

        let now = now_millis() as i64;
        for file_id in file_ids {
            let attached = tx.execute(
                "INSERT OR IGNORE INTO message_files (message_id, file_id) VALUES (?1, ?2)",
                params![msg.id.to_string(), file_id.to_string()],
            )?;
            if attached == 1 {
                tx.execute(
                    "UPDATE files SET refcount = refcount + 1, last_touched_at = ?2 WHERE id = ?1",
                    params![file_id.to_string(), now],
                )?;
            }
        }

        tx.commit()?;
        Ok(())
    }

    /// Load all messages for a thread in position order.
    pub fn messages(&self, thread_id: ThreadId) -> Result<Vec<Message>, StreamError> {
        let mut stmt = self.conn.prepare(
            "SELECT id, thread_id, role, status, error, parts, order_idx, step_order, created_at
             FROM messages WHERE thread_id = ?1 ORDER BY order_idx, step_order",
        )?;
        let rows = stmt
            .query_map(params![thread_id.to_string()], |row| {
                Ok(MessageRow {
                    id: row.get(0)?,
                    thread_id: row.get(1)?,
                    role: row.get(2)?,
                    status: row.get(3)?,
                    error: row.get(4)?,
                    parts: row.get(5)?,
                    order_idx: row.get(6)?,
                    step_order: row.get(7)?,
                    created_at: row.get(8)?,
                })
            })?
            .collect::<SqliteResult<Vec<_>>>()?;

        rows.into_iter().map(message_from_row).collect()
    }

    /// Delete a message; every file it referenced loses one reference in
    /// the same transaction.
    pub fn delete_message(&self, message_id: freshet_types::MessageId) -> Result<(), StreamError> {
        let tx = self.conn.unchecked_transaction()?;
        tx.execute(
            "UPDATE files SET refcount = CASE WHEN refcount > 0 THEN refcount - 1 ELSE 0 END
             WHERE id IN (SELECT file_id FROM message_files WHERE message_id = ?1)",
            params![message_id.to_string()],
        )?;
        tx.execute(
            "DELETE FROM messages WHERE id = ?1",
            params![message_id.to_string()],
        )?;
        tx.commit()?;
        Ok(())
    }

    // =========================================================================
    // Streams
    // =========================================================================

    /// Create a stream row for a generation step.
    ///
    /// The whole check-then-insert runs in one transaction on the single
    /// serialized connection, enforcing "at most one streaming row per
    /// (thread, order, step)".
    pub fn create_stream(&self, origin: &StreamOrigin) -> Result<StreamId, StreamError> {
        let user_id = origin.user_id.ok_or(StreamError::MissingOwner)?;

        let tx = self.conn.unchecked_transaction()?;
        let active: i64 = tx.query_row(
            "SELECT COUNT(*) FROM streams
             WHERE thread_id = ?1 AND order_idx = ?2 AND step_order = ?3 AND state = 'streaming'",
            params![
                origin.thread_id.to_string(),
                origin.order as i64,
                origin.step_order as i64
            ],
            |row| row.get(0),
        )?;
        if active > 0 {
            return Err(StreamError::ActiveStreamExists {
                thread_id: origin.thread_id,
                order: origin.order,
                step_order: origin.step_order,
            });
        }

        let id = StreamId::new();
        let now = now_millis() as i64;
        tx.execute(
            "INSERT INTO streams (id, thread_id, user_id, agent_name, model_id, provider,
                                  order_idx, step_order, state, last_heartbeat_at, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 'streaming', ?9, ?10)",
            params![
                id.to_string(),
                origin.thread_id.to_string(),
                user_id.to_string(),
                origin.agent_name,
                origin.model_id,
                origin.provider,
                origin.order as i64,
                origin.step_order as i64,
                now,
                now,
            ],
        )?;
        tx.commit()?;
        Ok(id)
    }

    /// Current lifecycle state of a stream.
    pub fn stream_state(&self, stream_id: StreamId) -> Result<StreamState, StreamError> {
        let row = self
            .conn
            .query_row(
                "SELECT state, last_heartbeat_at, ended_at, error FROM streams WHERE id = ?1",
                params![stream_id.to_string()],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, Option<i64>>(1)?,
                        row.get::<_, Option<i64>>(2)?,
                        row.get::<_, Option<String>>(3)?,
                    ))
                },
            )
            .optional()?
            .ok_or(StreamError::StreamNotFound(stream_id))?;
        state_from_columns(stream_id, &row.0, row.1, row.2, row.3)
    }

    /// The stream's current high-water mark (next delta's start).
    pub fn high_water(&self, stream_id: StreamId) -> Result<u64, StreamError> {
        let end: Option<i64> = self.conn.query_row(
            "SELECT MAX(end_idx) FROM deltas WHERE stream_id = ?1",
            params![stream_id.to_string()],
            |row| row.get(0),
        )?;
        Ok(end.unwrap_or(0) as u64)
    }

    /// Append one delta to a stream.
    ///
    /// Transactionally verifies the stream is still streaming (otherwise the
    /// append is rejected with [`StreamError::StreamClosed`]) and that
    /// `start` equals the current high-water mark (contiguity), then inserts
    /// the delta and refreshes the heartbeat. Returns the new high-water
    /// mark.
    pub fn append_delta(
        &self,
        stream_id: StreamId,
        start: u64,
        parts: &[OutputPart],
    ) -> Result<u64, StreamError> {
        let tx = self.conn.unchecked_transaction()?;

        let state = tx
            .query_row(
                "SELECT state FROM streams WHERE id = ?1",
                params![stream_id.to_string()],
                |row| row.get::<_, String>(0),
            )
            .optional()?
            .ok_or(StreamError::StreamNotFound(stream_id))?;
        if state != "streaming" {
            return Err(StreamError::StreamClosed(stream_id));
        }

        let expected: i64 = tx.query_row(
            "SELECT COALESCE(MAX(end_idx), 0) FROM deltas WHERE stream_id = ?1",
            params![stream_id.to_string()],
            |row| row.get(0),
        )?;
        if start != expected as u64 {
            return Err(StreamError::DeltaGap {
                stream_id,
                expected: expected as u64,
                got: start,
            });
        }

        let end = start + parts.len() as u64;
        let now = now_millis() as i64;
        tx.execute(
            "INSERT INTO deltas (stream_id, start_idx, end_idx, parts, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                stream_id.to_string(),
                start as i64,
                end as i64,
                serde_json::to_string(parts)?,
                now,
            ],
        )?;
        tx.execute(
            "UPDATE streams SET last_heartbeat_at = ?2 WHERE id = ?1",
            params![stream_id.to_string(), now],
        )?;

        tx.commit()?;
        Ok(end)
    }

    /// Finalize a stream: append the final delta (if any parts remain) and
    /// mark the row finished, in one transaction. A reader can never
    /// observe a finished stream missing its last chunk.
    pub fn finish_stream(
        &self,
        stream_id: StreamId,
        final_parts: &[OutputPart],
    ) -> Result<u64, StreamError> {
        let tx = self.conn.unchecked_transaction()?;

        let state = tx
            .query_row(
                "SELECT state FROM streams WHERE id = ?1",
                params![stream_id.to_string()],
                |row| row.get::<_, String>(0),
            )
            .optional()?
            .ok_or(StreamError::StreamNotFound(stream_id))?;
        if state != "streaming" {
            return Err(StreamError::AlreadyTerminal(stream_id));
        }

        let start: i64 = tx.query_row(
            "SELECT COALESCE(MAX(end_idx), 0) FROM deltas WHERE stream_id = ?1",
            params![stream_id.to_string()],
            |row| row.get(0),
        )?;
        let now = now_millis() as i64;
        let mut end = start as u64;

        if !final_parts.is_empty() {
            end += final_parts.len() as u64;
            tx.execute(
                "INSERT INTO deltas (stream_id, start_idx, end_idx, parts, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    stream_id.to_string(),
                    start,
                    end as i64,
                    serde_json::to_string(final_parts)?,
                    now,
                ],
            )?;
        }

        tx.execute(
            "UPDATE streams SET state = 'finished', ended_at = ?2, last_heartbeat_at = NULL
             WHERE id = ?1",
            params![stream_id.to_string(), now],
        )?;

        tx.commit()?;
        Ok(end)
    }

    /// Terminal error transition for a stream.
    pub fn fail_stream(&self, stream_id: StreamId, message: &str) -> Result<(), StreamError> {
        let tx = self.conn.unchecked_transaction()?;
        let state = tx
            .query_row(
                "SELECT state FROM streams WHERE id = ?1",
                params![stream_id.to_string()],
                |row| row.get::<_, String>(0),
            )
            .optional()?
            .ok_or(StreamError::StreamNotFound(stream_id))?;
        if state != "streaming" {
            return Err(StreamError::AlreadyTerminal(stream_id));
        }
        tx.execute(
            "UPDATE streams SET state = 'error', error = ?2, last_heartbeat_at = NULL
             WHERE id = ?1",
            params![stream_id.to_string(), message],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Check whether any stream for this thread is still streaming — the
    /// liveness probe the reconciliation sweep uses.
    pub fn has_streaming(&self, thread_id: ThreadId) -> Result<bool, StreamError> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM streams WHERE thread_id = ?1 AND state = 'streaming'",
            params![thread_id.to_string()],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    /// Streams still marked streaming whose last heartbeat is older than
    /// `cutoff` (Unix millis) — candidates for the timeout reaper.
    pub fn stale_streams(&self, cutoff: u64) -> Result<Vec<StreamId>, StreamError> {
        let mut stmt = self.conn.prepare(
            "SELECT id FROM streams WHERE state = 'streaming' AND last_heartbeat_at < ?1",
        )?;
        let ids = stmt
            .query_map(params![cutoff as i64], |row| row.get::<_, String>(0))?
            .collect::<SqliteResult<Vec<_>>>()?;
        ids.iter().map(|s| parse_stream_id(s)).collect()
    }

    /// All deltas at or past a cursor, in range order.
    pub fn deltas_since(
        &self,
        stream_id: StreamId,
        cursor: u64,
    ) -> Result<Vec<DeltaRecord>, StreamError> {
        let mut stmt = self.conn.prepare(
            "SELECT start_idx, end_idx, parts, created_at FROM deltas
             WHERE stream_id = ?1 AND end_idx > ?2 ORDER BY start_idx",
        )?;
        let rows = stmt
            .query_map(params![stream_id.to_string(), cursor as i64], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, i64>(3)?,
                ))
            })?
            .collect::<SqliteResult<Vec<_>>>()?;

        let mut deltas = Vec::with_capacity(rows.len());
        for (start, end, parts, created_at) in rows {
            deltas.push(DeltaRecord {
                stream_id,
                start: start as u64,
                end: end as u64,
                parts: serde_json::from_str(&parts)?,
                created_at: created_at as u64,
            });
        }
        Ok(deltas)
    }

    // =========================================================================
    // Files
    // =========================================================================

    /// Find-or-create a file record for (hash, filename).
    ///
    /// On reuse: bumps refcount, touches, and returns the existing record's
    /// ids (`existed = true`) — the caller's freshly stored duplicate blob
    /// should be discarded if it differs. On first sight: inserts with
    /// refcount 0; attachment to a saved message is what counts references.
    pub fn add_file_record(
        &self,
        hash: &str,
        filename: Option<&str>,
        mime_type: &str,
        blob_id: &str,
    ) -> Result<(FileId, String, bool), StreamError> {
        let now = now_millis() as i64;
        let tx = self.conn.unchecked_transaction()?;

        let existing = tx
            .query_row(
                "SELECT id, blob_id FROM files
                 WHERE hash = ?1 AND IFNULL(filename, '') = IFNULL(?2, '')",
                params![hash, filename],
                |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)),
            )
            .optional()?;

        if let Some((id, existing_blob)) = existing {
            tx.execute(
                "UPDATE files SET refcount = refcount + 1, last_touched_at = ?2 WHERE id = ?1",
                params![id, now],
            )?;
            tx.commit()?;
            return Ok((parse_file_id(&id)?, existing_blob, true));
        }

        let id = FileId::new();
        tx.execute(
            "INSERT INTO files (id, hash, filename, mime_type, blob_id, refcount, last_touched_at, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, 0, ?6, ?6)",
            params![id.to_string(), hash, filename, mime_type, blob_id, now],
        )?;
        tx.commit()?;
        Ok((id, blob_id.to_string(), false))
    }

    /// Non-counting existence probe: touches the record but does not bump
    /// refcount. For callers that already hold a reference.
    pub fn probe_file(
        &self,
        hash: &str,
        filename: Option<&str>,
    ) -> Result<Option<FileId>, StreamError> {
        let id = self
            .conn
            .query_row(
                "SELECT id FROM files WHERE hash = ?1 AND IFNULL(filename, '') = IFNULL(?2, '')",
                params![hash, filename],
                |row| row.get::<_, String>(0),
            )
            .optional()?;
        match id {
            Some(id) => {
                self.conn.execute(
                    "UPDATE files SET last_touched_at = ?2 WHERE id = ?1",
                    params![id, now_millis() as i64],
                )?;
                Ok(Some(parse_file_id(&id)?))
            }
            None => Ok(None),
        }
    }

    /// Take an additional reference to a file (message fork/reuse).
    /// Returns false when the record is missing.
    pub fn copy_file_record(&self, file_id: FileId) -> Result<bool, StreamError> {
        let changed = self.conn.execute(
            "UPDATE files SET refcount = refcount + 1, last_touched_at = ?2 WHERE id = ?1",
            params![file_id.to_string(), now_millis() as i64],
        )?;
        Ok(changed == 1)
    }

    /// Fetch a file record by id.
    pub fn get_file_record(&self, file_id: FileId) -> Result<Option<FileRecord>, StreamError> {
        let row = self
            .conn
            .query_row(
                "SELECT id, hash, filename, mime_type, blob_id, refcount, last_touched_at, created_at
                 FROM files WHERE id = ?1",
                params![file_id.to_string()],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, Option<String>>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, String>(4)?,
                        row.get::<_, i64>(5)?,
                        row.get::<_, i64>(6)?,
                        row.get::<_, i64>(7)?,
                    ))
                },
            )
            .optional()?;
        row.map(|r| {
            Ok(FileRecord {
                id: parse_file_id(&r.0)?,
                hash: r.1,
                filename: r.2,
                mime_type: r.3,
                blob_id: r.4,
                refcount: r.5.max(0) as u64,
                last_touched_at: r.6 as u64,
                created_at: r.7 as u64,
            })
        })
        .transpose()
    }

    /// One page of unreferenced files, ordered by id for stable pagination.
    pub fn files_to_delete(
        &self,
        cursor: Option<&str>,
        limit: usize,
    ) -> Result<FilePage, StreamError> {
        let after = cursor.unwrap_or("");
        let mut stmt = self.conn.prepare(
            "SELECT id, hash, filename, mime_type, blob_id, refcount, last_touched_at, created_at
             FROM files WHERE refcount = 0 AND id > ?1 ORDER BY id LIMIT ?2",
        )?;
        let rows = stmt
            .query_map(params![after, limit as i64], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, Option<String>>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, i64>(5)?,
                    row.get::<_, i64>(6)?,
                    row.get::<_, i64>(7)?,
                ))
            })?
            .collect::<SqliteResult<Vec<_>>>()?;

        let is_done = rows.len() < limit;
        let continue_cursor = rows.last().map(|r| r.0.clone());
        let mut files = Vec::with_capacity(rows.len());
        for r in rows {
            files.push(FileRecord {
                id: parse_file_id(&r.0)?,
                hash: r.1,
                filename: r.2,
                mime_type: r.3,
                blob_id: r.4,
                refcount: r.5.max(0) as u64,
                last_touched_at: r.6 as u64,
                created_at: r.7 as u64,
            });
        }

        Ok(FilePage {
            files,
            continue_cursor,
            is_done,
        })
    }

    /// Whether any file row still points at a blob. Records with the same
    /// hash but different filenames share one blob, so the blob outlives
    /// any single row.
    pub fn blob_in_use(&self, blob_id: &str) -> Result<bool, StreamError> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM files WHERE blob_id = ?1",
            params![blob_id],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    /// Delete a file row, re-checking refcount at delete time. `force`
    /// overrides the reference guard.
    pub fn delete_file_row(
        &self,
        file_id: FileId,
        force: bool,
    ) -> Result<FileDeleteOutcome, StreamError> {
        let tx = self.conn.unchecked_transaction()?;
        let row = tx
            .query_row(
                "SELECT refcount, blob_id FROM files WHERE id = ?1",
                params![file_id.to_string()],
                |row| Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?)),
            )
            .optional()?;

        let Some((refcount, blob_id)) = row else {
            return Ok(FileDeleteOutcome::Missing);
        };
        if refcount > 0 && !force {
            return Ok(FileDeleteOutcome::StillReferenced {
                refcount: refcount as u64,
            });
        }

        tx.execute(
            "DELETE FROM files WHERE id = ?1",
            params![file_id.to_string()],
        )?;
        tx.commit()?;
        Ok(FileDeleteOutcome::Deleted { blob_id })
    }
}
