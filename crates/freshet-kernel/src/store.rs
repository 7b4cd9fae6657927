//! Shared chat store: the durable delta log plus reactive change events.
//!
//! `ChatStore` is the seam between producers and readers. Producers append
//! through it (via the streamer); readers call [`ChatStore::catch_up`] with
//! a cursor and [`ChatStore::subscribe`] for change notifications, then
//! re-query on each event. Once `finish_stream` returns, a reader polling
//! with the returned cursor sees a finished record whose deltas fully cover
//! `[0, cursor)` — the finalization is a single transaction.
//!
//! # Concurrency Model
//!
//! - One SQLite connection behind a parking_lot mutex: every mutation is
//!   atomic and serialized.
//! - tokio broadcast for change events (capacity 1024; slow readers miss
//!   events and recover by re-querying from their cursor).

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::broadcast;

use freshet_types::{
    DeltaRecord, FileId, Message, MessageId, StreamId, StreamOrigin, StreamState, ThreadId,
};

use crate::db::{ChatDb, StreamError};

/// Thread-safe database handle.
pub type DbHandle = Arc<Mutex<ChatDb>>;

/// Events broadcast when streams or threads change.
#[derive(Clone, Debug)]
pub enum ChatEvent {
    /// A delta landed; readers past `end` are already caught up.
    DeltasAppended { stream_id: StreamId, end: u64 },
    /// The stream finalized at `end`.
    StreamFinished { stream_id: StreamId, end: u64 },
    /// The stream reached the error state.
    StreamErrored { stream_id: StreamId },
    /// The reconciliation sweep cleared a stuck thread.
    ThreadRepaired { thread_id: ThreadId },
}

/// Store facade over [`ChatDb`] with change broadcasting.
pub struct ChatStore {
    db: DbHandle,
    event_tx: broadcast::Sender<ChatEvent>,
}

impl ChatStore {
    /// Wrap a database handle.
    pub fn with_db(db: ChatDb) -> Self {
        let (event_tx, _) = broadcast::channel(1024);
        Self {
            db: Arc::new(Mutex::new(db)),
            event_tx,
        }
    }

    /// Clone the underlying database handle (for collaborators that share
    /// the connection, e.g. the file store).
    pub fn db(&self) -> DbHandle {
        Arc::clone(&self.db)
    }

    /// Get a receiver for subscribing to changes.
    pub fn subscribe(&self) -> broadcast::Receiver<ChatEvent> {
        self.event_tx.subscribe()
    }

    // =========================================================================
    // Stream operations
    // =========================================================================

    /// Create a stream row for a generation step.
    pub fn create_stream(&self, origin: &StreamOrigin) -> Result<StreamId, StreamError> {
        self.db.lock().create_stream(origin)
    }

    /// Append one delta; emits [`ChatEvent::DeltasAppended`] on success.
    pub fn append_delta(
        &self,
        stream_id: StreamId,
        start: u64,
        parts: &[freshet_types::OutputPart],
    ) -> Result<u64, StreamError> {
        let end = self.db.lock().append_delta(stream_id, start, parts)?;
        let _ = self
            .event_tx
            .send(ChatEvent::DeltasAppended { stream_id, end });
        Ok(end)
    }

    /// Finalize a stream with its last parts; emits
    /// [`ChatEvent::StreamFinished`].
    pub fn finish_stream(
        &self,
        stream_id: StreamId,
        final_parts: &[freshet_types::OutputPart],
    ) -> Result<u64, StreamError> {
        let end = self.db.lock().finish_stream(stream_id, final_parts)?;
        let _ = self
            .event_tx
            .send(ChatEvent::StreamFinished { stream_id, end });
        Ok(end)
    }

    /// Terminal error transition; emits [`ChatEvent::StreamErrored`].
    pub fn fail_stream(&self, stream_id: StreamId, message: &str) -> Result<(), StreamError> {
        self.db.lock().fail_stream(stream_id, message)?;
        let _ = self.event_tx.send(ChatEvent::StreamErrored { stream_id });
        Ok(())
    }

    /// Current state of a stream.
    pub fn stream_state(&self, stream_id: StreamId) -> Result<StreamState, StreamError> {
        self.db.lock().stream_state(stream_id)
    }

    /// Reader entry point: current state plus all deltas past `cursor`.
    pub fn catch_up(
        &self,
        stream_id: StreamId,
        cursor: u64,
    ) -> Result<(StreamState, Vec<DeltaRecord>), StreamError> {
        let db = self.db.lock();
        let state = db.stream_state(stream_id)?;
        let deltas = db.deltas_since(stream_id, cursor)?;
        Ok((state, deltas))
    }

    /// Whether any stream for the thread is still streaming.
    pub fn has_streaming(&self, thread_id: ThreadId) -> Result<bool, StreamError> {
        self.db.lock().has_streaming(thread_id)
    }

    /// Streaming rows with a heartbeat older than `cutoff` (Unix millis).
    pub fn stale_streams(&self, cutoff: u64) -> Result<Vec<StreamId>, StreamError> {
        self.db.lock().stale_streams(cutoff)
    }

    // =========================================================================
    // Thread & generation state
    // =========================================================================

    /// Create a new thread.
    pub fn create_thread(&self, title: &str) -> Result<ThreadId, StreamError> {
        self.db.lock().create_thread(title)
    }

    /// Claim the thread for a generation.
    pub fn begin_generation(&self, thread_id: ThreadId) -> Result<(), StreamError> {
        self.db.lock().begin_generation(thread_id)
    }

    /// Ask the in-flight generation to stop.
    pub fn request_cancel(&self, thread_id: ThreadId) -> Result<bool, StreamError> {
        self.db.lock().request_cancel(thread_id)
    }

    /// Release the thread (normal end of generation).
    pub fn end_generation(&self, thread_id: ThreadId) -> Result<(), StreamError> {
        self.db.lock().end_generation(thread_id)
    }

    /// Sweep repair: same clear as [`Self::end_generation`], but announced
    /// as a repair so UIs drop their stale "generating" indicator.
    pub fn repair_thread(&self, thread_id: ThreadId) -> Result<(), StreamError> {
        self.db.lock().end_generation(thread_id)?;
        let _ = self.event_tx.send(ChatEvent::ThreadRepaired { thread_id });
        Ok(())
    }

    /// Read (generating, cancel_requested).
    pub fn generation_state(&self, thread_id: ThreadId) -> Result<(bool, bool), StreamError> {
        self.db.lock().generation_state(thread_id)
    }

    /// Threads currently claiming a generation.
    pub fn generating_threads(&self) -> Result<Vec<ThreadId>, StreamError> {
        self.db.lock().generating_threads()
    }

    /// Last activity time for a thread.
    pub fn last_activity(&self, thread_id: ThreadId) -> Result<u64, StreamError> {
        self.db.lock().last_activity(thread_id)
    }

    /// Delete a thread and everything it owns.
    pub fn delete_thread(&self, thread_id: ThreadId) -> Result<(), StreamError> {
        self.db.lock().delete_thread(thread_id)
    }

    // =========================================================================
    // Messages
    // =========================================================================

    /// Save a finalized message with its file attachments.
    pub fn save_message(&self, msg: &Message, file_ids: &[FileId]) -> Result<(), StreamError> {
        self.db.lock().save_message(msg, file_ids)
    }

    /// Load a thread's messages in position order.
    pub fn messages(&self, thread_id: ThreadId) -> Result<Vec<Message>, StreamError> {
        self.db.lock().messages(thread_id)
    }

    /// Delete a message, releasing its file references.
    pub fn delete_message(&self, message_id: MessageId) -> Result<(), StreamError> {
        self.db.lock().delete_message(message_id)
    }
}

/// Thread-safe handle to a ChatStore.
pub type SharedChatStore = Arc<ChatStore>;

/// Create a shared store over an in-memory database (tests, demos).
pub fn shared_memory_store() -> Result<SharedChatStore, StreamError> {
    Ok(Arc::new(ChatStore::with_db(ChatDb::in_memory()?)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use freshet_types::{concat_text, OutputPart, UserId};

    fn store() -> ChatStore {
        ChatStore::with_db(ChatDb::in_memory().unwrap())
    }

    #[test]
    fn test_append_emits_event() {
        let store = store();
        let thread_id = store.create_thread("events").unwrap();
        let origin = StreamOrigin::new(thread_id, UserId::new(), 0);
        let stream_id = store.create_stream(&origin).unwrap();

        let mut rx = store.subscribe();
        store
            .append_delta(stream_id, 0, &[OutputPart::text("hi")])
            .unwrap();

        match rx.try_recv().unwrap() {
            ChatEvent::DeltasAppended { stream_id: sid, end } => {
                assert_eq!(sid, stream_id);
                assert_eq!(end, 1);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn test_catch_up_reconstructs_text() {
        let store = store();
        let thread_id = store.create_thread("reader").unwrap();
        let origin = StreamOrigin::new(thread_id, UserId::new(), 0);
        let stream_id = store.create_stream(&origin).unwrap();

        store
            .append_delta(stream_id, 0, &[OutputPart::text("The "), OutputPart::text("quick ")])
            .unwrap();
        store
            .append_delta(stream_id, 2, &[OutputPart::text("fox.")])
            .unwrap();
        let end = store.finish_stream(stream_id, &[]).unwrap();
        assert_eq!(end, 3);

        let (state, deltas) = store.catch_up(stream_id, 0).unwrap();
        assert!(matches!(state, StreamState::Finished { .. }));

        let text = concat_text(deltas.iter().flat_map(|d| d.parts.iter()));
        assert_eq!(text, "The quick fox.");

        // A reader already at the final cursor sees a finished stream and
        // no further deltas.
        let (state, rest) = store.catch_up(stream_id, end).unwrap();
        assert!(matches!(state, StreamState::Finished { .. }));
        assert!(rest.is_empty());
    }

    #[test]
    fn test_repair_emits_event() {
        let store = store();
        let thread_id = store.create_thread("stuck").unwrap();
        store.begin_generation(thread_id).unwrap();

        let mut rx = store.subscribe();
        store.repair_thread(thread_id).unwrap();

        assert_eq!(store.generation_state(thread_id).unwrap(), (false, false));
        match rx.try_recv().unwrap() {
            ChatEvent::ThreadRepaired { thread_id: tid } => assert_eq!(tid, thread_id),
            other => panic!("unexpected event {other:?}"),
        }
    }
}
