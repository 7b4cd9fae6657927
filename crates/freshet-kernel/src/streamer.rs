//! Throttled, durable streaming of generation output.
//!
//! One [`DeltaStreamer`] is owned by one generation task. It converts the
//! producer's in-memory part fragments into transactional delta appends at
//! a bounded rate, and finalizes the stream exactly once.
//!
//! # State machine
//!
//! idle → creating → streaming ⇄ flushing → finished, with an orthogonal
//! aborted flag reachable from any non-finished state. The stream row is
//! created lazily on the first [`DeltaStreamer::add_parts`] call.
//!
//! # Concurrency Model
//!
//! - All mutable state lives in one `Inner` behind a parking_lot mutex;
//!   both flush paths (immediate and timer-fired) mark `write_in_flight`
//!   under that lock before touching the database, so two flushes can
//!   never race on the same batch.
//! - The deferred flush is a spawned tokio task; abort cancels it at the
//!   sleep, and `finish` abort-then-joins it. The post-sleep flush body is
//!   synchronous, so a join observes it either not-started or complete —
//!   never half done.
//! - Write failures are not retried. A rejected or failed append cancels
//!   the streamer; partial output with a visible error beats silently
//!   garbled output.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use freshet_types::{Message, OutputPart, StreamId, StreamOrigin};

use crate::chunk::Chunker;
use crate::db::StreamError;
use crate::store::ChatStore;

/// Minimum time between delta writes.
pub const DEFAULT_THROTTLE: Duration = Duration::from_millis(250);

struct Inner {
    origin: StreamOrigin,
    stream_id: Option<StreamId>,
    pending: Vec<OutputPart>,
    cursor: u64,
    last_flush_at: Option<Instant>,
    write_in_flight: bool,
    flush_timer: Option<JoinHandle<()>>,
    /// Failure from a timer-fired flush, surfaced at the next call.
    failed: Option<String>,
}

/// Per-generation streaming pipeline.
#[derive(Clone)]
pub struct DeltaStreamer {
    store: Arc<ChatStore>,
    throttle: Duration,
    chunker: Arc<Chunker>,
    cancel: CancellationToken,
    inner: Arc<Mutex<Inner>>,
}

impl DeltaStreamer {
    /// Create a streamer for a generation rooted at `origin`.
    pub fn new(store: Arc<ChatStore>, origin: StreamOrigin) -> Self {
        Self::with_throttle(store, origin, DEFAULT_THROTTLE)
    }

    /// Create a streamer with a custom write throttle.
    pub fn with_throttle(store: Arc<ChatStore>, origin: StreamOrigin, throttle: Duration) -> Self {
        Self {
            store,
            throttle,
            chunker: Arc::new(Chunker::default()),
            cancel: CancellationToken::new(),
            inner: Arc::new(Mutex::new(Inner {
                origin,
                stream_id: None,
                pending: Vec::new(),
                cursor: 0,
                last_flush_at: None,
                write_in_flight: false,
                flush_timer: None,
                failed: None,
            })),
        }
    }

    /// Use an externally supplied abort signal (e.g. from the cancellation
    /// registry) instead of a private one.
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Override the text chunking policy (default: sentence granularity).
    pub fn with_chunker(mut self, chunker: Chunker) -> Self {
        self.chunker = Arc::new(chunker);
        self
    }

    /// The abort signal for this streamer.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// The backing stream id, once the first batch created it.
    pub fn stream_id(&self) -> Option<StreamId> {
        self.inner.lock().stream_id
    }

    /// Snapshot of the current origin (order/step bookkeeping included).
    pub fn origin(&self) -> StreamOrigin {
        self.inner.lock().origin.clone()
    }

    /// Parts durably written so far.
    pub fn cursor(&self) -> u64 {
        self.inner.lock().cursor
    }

    /// Buffer parts for durable append, creating the stream row on first
    /// use and flushing at most once per throttle interval.
    ///
    /// Ignored entirely after abort. Fails fast when the origin has no
    /// owning user.
    pub fn add_parts(&self, parts: Vec<OutputPart>) -> Result<(), StreamError> {
        if self.cancel.is_cancelled() {
            return Ok(());
        }
        if parts.is_empty() {
            return Ok(());
        }

        let mut inner = self.inner.lock();
        if inner.origin.user_id.is_none() {
            return Err(StreamError::MissingOwner);
        }

        if inner.stream_id.is_none() {
            let id = self.store.create_stream(&inner.origin)?;
            inner.stream_id = Some(id);
        }
        inner.pending.extend(parts);

        // An in-flight write drains the buffer when it completes; an armed
        // timer covers it at its deadline. Either way nothing more to do.
        if inner.write_in_flight || inner.flush_timer.is_some() {
            return Ok(());
        }

        let remaining = match inner.last_flush_at {
            None => Duration::ZERO,
            Some(at) => self.throttle.saturating_sub(at.elapsed()),
        };
        if remaining.is_zero() {
            drop(inner);
            self.flush()
        } else {
            self.arm_timer(&mut inner, remaining);
            Ok(())
        }
    }

    /// Split a raw provider text fragment at the configured granularity
    /// and buffer the resulting parts.
    pub fn add_text(&self, text: &str) -> Result<(), StreamError> {
        let parts = self
            .chunker
            .split(text)
            .into_iter()
            .map(OutputPart::text)
            .collect();
        self.add_parts(parts)
    }

    /// Finalize the stream: cancel any scheduled flush, wait out an
    /// in-flight write, append the remaining parts as the last delta in the
    /// same transaction that marks the row finished, and update order/step
    /// bookkeeping from the last of `messages`. Returns the final cursor.
    pub async fn finish(&self, messages: &[Message]) -> Result<u64, StreamError> {
        let timer = self.inner.lock().flush_timer.take();
        if let Some(handle) = timer {
            handle.abort();
            let _ = handle.await;
        }

        let (stream_id, parts) = {
            let mut inner = self.inner.lock();
            if let Some(message) = inner.failed.take() {
                return Err(StreamError::Aborted(message));
            }
            if self.cancel.is_cancelled() {
                return Err(StreamError::Aborted("stream aborted".into()));
            }
            let Some(stream_id) = inner.stream_id else {
                return Err(StreamError::NeverStarted);
            };
            let parts = std::mem::take(&mut inner.pending);
            (stream_id, parts)
        };

        let end = self.store.finish_stream(stream_id, &parts)?;

        let mut inner = self.inner.lock();
        inner.stream_id = None;
        inner.cursor = 0;
        inner.last_flush_at = None;
        match messages.last() {
            Some(last) => {
                inner.origin.order = last.order;
                inner.origin.step_order = last.step_order + 1;
            }
            None => {
                tracing::warn!(stream_id = %stream_id, "generation step finished with no messages");
            }
        }
        Ok(end)
    }

    /// Abort: silence all further `add_parts` calls and clear any pending
    /// timer. A flush already dispatched to storage may still land.
    pub fn abort(&self) {
        self.cancel.cancel();
        let mut inner = self.inner.lock();
        if let Some(handle) = inner.flush_timer.take() {
            handle.abort();
        }
        inner.pending.clear();
    }

    /// Write the buffered parts as one delta.
    fn flush(&self) -> Result<(), StreamError> {
        let (stream_id, start, parts) = {
            let mut inner = self.inner.lock();
            if self.cancel.is_cancelled() || inner.pending.is_empty() {
                return Ok(());
            }
            // Another flush owns the buffer; its completion drains ours.
            if inner.write_in_flight {
                return Ok(());
            }
            let Some(stream_id) = inner.stream_id else {
                return Err(StreamError::NeverStarted);
            };
            inner.write_in_flight = true;
            let parts = std::mem::take(&mut inner.pending);
            (stream_id, inner.cursor, parts)
        };

        let result = self.store.append_delta(stream_id, start, &parts);

        let mut inner = self.inner.lock();
        inner.write_in_flight = false;
        inner.flush_timer = None;
        match result {
            Ok(end) => {
                inner.cursor = end;
                inner.last_flush_at = Some(Instant::now());
                // Parts that arrived during the write get their own delta
                // after a full throttle interval — a continuous producer
                // drains at a bounded rate, never starves.
                if !inner.pending.is_empty() {
                    self.arm_timer(&mut inner, self.throttle);
                }
                Ok(())
            }
            Err(e) => {
                inner.pending.clear();
                inner.failed = Some(e.to_string());
                drop(inner);
                self.cancel.cancel();
                Err(e)
            }
        }
    }

    /// Arm the deferred flush. Caller must hold the inner lock and have
    /// verified no timer is armed.
    fn arm_timer(&self, inner: &mut Inner, delay: Duration) {
        let streamer = self.clone();
        let cancel = self.cancel.clone();
        inner.flush_timer = Some(tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    if let Err(e) = streamer.flush() {
                        tracing::warn!("deferred flush failed: {e}");
                    }
                }
            }
        }));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::ChatDb;
    use freshet_types::{concat_text, UserId};

    fn setup() -> (Arc<ChatStore>, StreamOrigin) {
        let store = Arc::new(ChatStore::with_db(ChatDb::in_memory().unwrap()));
        let thread_id = store.create_thread("stream test").unwrap();
        let origin = StreamOrigin::new(thread_id, UserId::new(), 0);
        (store, origin)
    }

    fn delta_count(store: &ChatStore, stream_id: StreamId) -> usize {
        store.catch_up(stream_id, 0).unwrap().1.len()
    }

    async fn settle() {
        // Let spawned flush tasks run to completion on the test runtime.
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_add_flushes_immediately() {
        let (store, origin) = setup();
        let streamer = DeltaStreamer::new(Arc::clone(&store), origin);

        streamer.add_parts(vec![OutputPart::text("hello")]).unwrap();
        let stream_id = streamer.stream_id().unwrap();

        assert_eq!(delta_count(&store, stream_id), 1);
        assert_eq!(streamer.cursor(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_throttle_spaces_writes() {
        let (store, origin) = setup();
        let streamer = DeltaStreamer::new(Arc::clone(&store), origin);

        streamer.add_parts(vec![OutputPart::text("a")]).unwrap();
        let stream_id = streamer.stream_id().unwrap();
        assert_eq!(delta_count(&store, stream_id), 1);

        tokio::time::advance(Duration::from_millis(50)).await;
        streamer.add_parts(vec![OutputPart::text("b")]).unwrap();

        // Inside the 250ms window: still one append.
        assert_eq!(delta_count(&store, stream_id), 1);

        // Not yet at the deadline.
        tokio::time::advance(Duration::from_millis(150)).await;
        settle().await;
        assert_eq!(delta_count(&store, stream_id), 1);

        // 250ms after the first write the deferred flush fires.
        tokio::time::advance(Duration::from_millis(50)).await;
        settle().await;
        assert_eq!(delta_count(&store, stream_id), 2);
        assert_eq!(streamer.cursor(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_parts_coalesce_while_timer_armed() {
        let (store, origin) = setup();
        let streamer = DeltaStreamer::new(Arc::clone(&store), origin);

        streamer.add_parts(vec![OutputPart::text("a")]).unwrap();
        let stream_id = streamer.stream_id().unwrap();

        tokio::time::advance(Duration::from_millis(10)).await;
        streamer.add_parts(vec![OutputPart::text("b")]).unwrap();
        streamer.add_parts(vec![OutputPart::text("c")]).unwrap();
        streamer.add_parts(vec![OutputPart::text("d")]).unwrap();

        tokio::time::advance(Duration::from_millis(240)).await;
        settle().await;

        // The three buffered parts landed as one coalesced delta.
        let deltas = store.catch_up(stream_id, 0).unwrap().1;
        assert_eq!(deltas.len(), 2);
        assert_eq!(deltas[1].parts.len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_finish_flushes_remaining_parts() {
        let (store, origin) = setup();
        let streamer = DeltaStreamer::new(Arc::clone(&store), origin);

        streamer.add_parts(vec![OutputPart::text("first ")]).unwrap();
        tokio::time::advance(Duration::from_millis(5)).await;
        streamer.add_parts(vec![OutputPart::text("second")]).unwrap();
        let stream_id = streamer.stream_id().unwrap();

        let msg = Message::assistant(streamer.origin().thread_id, vec![], 0, 0);
        let end = streamer.finish(&[msg]).await.unwrap();
        assert_eq!(end, 2);

        let (state, deltas) = store.catch_up(stream_id, 0).unwrap();
        assert!(state.is_terminal());
        let text = concat_text(deltas.iter().flat_map(|d| d.parts.iter()));
        assert_eq!(text, "first second");
    }

    #[tokio::test(start_paused = true)]
    async fn test_finish_with_empty_buffer_appends_nothing() {
        let (store, origin) = setup();
        let streamer = DeltaStreamer::new(Arc::clone(&store), origin);

        streamer.add_parts(vec![OutputPart::text("all of it")]).unwrap();
        let stream_id = streamer.stream_id().unwrap();
        assert_eq!(delta_count(&store, stream_id), 1);

        let msg = Message::assistant(streamer.origin().thread_id, vec![], 0, 0);
        let end = streamer.finish(&[msg]).await.unwrap();
        assert_eq!(end, 1);
        assert_eq!(delta_count(&store, stream_id), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_finish_before_any_parts_fails() {
        let (store, origin) = setup();
        let streamer = DeltaStreamer::new(store, origin);
        assert!(matches!(
            streamer.finish(&[]).await,
            Err(StreamError::NeverStarted)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_owner_fails_fast() {
        let (store, mut origin) = setup();
        origin.user_id = None;
        let streamer = DeltaStreamer::new(store, origin);
        assert!(matches!(
            streamer.add_parts(vec![OutputPart::text("x")]),
            Err(StreamError::MissingOwner)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_abort_silences_add_parts() {
        let (store, origin) = setup();
        let streamer = DeltaStreamer::new(Arc::clone(&store), origin);

        streamer.add_parts(vec![OutputPart::text("kept")]).unwrap();
        let stream_id = streamer.stream_id().unwrap();
        streamer.abort();

        // Silently ignored, nothing written.
        streamer.add_parts(vec![OutputPart::text("dropped")]).unwrap();
        tokio::time::advance(Duration::from_secs(1)).await;
        settle().await;
        assert_eq!(delta_count(&store, stream_id), 1);

        // Finish on an aborted streamer reports the abort.
        assert!(matches!(
            streamer.finish(&[]).await,
            Err(StreamError::Aborted(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejected_append_aborts_streamer() {
        let (store, origin) = setup();
        let streamer = DeltaStreamer::new(Arc::clone(&store), origin);

        streamer.add_parts(vec![OutputPart::text("a")]).unwrap();
        let stream_id = streamer.stream_id().unwrap();

        // Invalidate the stream out from under the producer.
        store.fail_stream(stream_id, "killed externally").unwrap();

        tokio::time::advance(Duration::from_millis(250)).await;
        let err = streamer
            .add_parts(vec![OutputPart::text("b")])
            .expect_err("append into a closed stream must abort");
        assert!(matches!(err, StreamError::StreamClosed(_)));
        assert!(streamer.cancel_token().is_cancelled());

        // Everything after the abort is silently ignored.
        streamer.add_parts(vec![OutputPart::text("c")]).unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_external_cancel_token() {
        let (store, origin) = setup();
        let cancel = CancellationToken::new();
        let streamer = DeltaStreamer::new(Arc::clone(&store), origin).with_cancel(cancel.clone());

        cancel.cancel();
        streamer.add_parts(vec![OutputPart::text("never")]).unwrap();
        assert!(streamer.stream_id().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_finish_updates_order_bookkeeping() {
        let (store, origin) = setup();
        let thread_id = origin.thread_id;
        let streamer = DeltaStreamer::new(Arc::clone(&store), origin);

        streamer.add_parts(vec![OutputPart::text("step one")]).unwrap();
        let first_stream = streamer.stream_id().unwrap();
        let msg = Message::assistant(thread_id, vec![OutputPart::text("step one")], 4, 1);
        streamer.finish(&[msg]).await.unwrap();

        let origin = streamer.origin();
        assert_eq!(origin.order, 4);
        assert_eq!(origin.step_order, 2);

        // The next step lazily creates a fresh stream at the new position.
        streamer.add_parts(vec![OutputPart::text("step two")]).unwrap();
        let second_stream = streamer.stream_id().unwrap();
        assert_ne!(first_stream, second_stream);
        assert_eq!(delta_count(&store, second_stream), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_add_text_chunks_at_sentence_granularity() {
        let (store, origin) = setup();
        let streamer = DeltaStreamer::new(Arc::clone(&store), origin);

        streamer
            .add_text("One part. Two parts, with a clause. tail")
            .unwrap();
        let stream_id = streamer.stream_id().unwrap();

        let deltas = store.catch_up(stream_id, 0).unwrap().1;
        assert_eq!(deltas.len(), 1);
        let texts: Vec<_> = deltas[0]
            .parts
            .iter()
            .filter_map(|p| p.as_text())
            .collect();
        assert_eq!(texts, vec!["One part. ", "Two parts, ", "with a clause. ", "tail"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_contiguity_under_random_interleaving() {
        // Deterministic xorshift so the schedule is reproducible.
        let mut seed: u64 = 0x2545F4914F6CDD1D;
        let mut next = move |bound: u64| {
            seed ^= seed << 13;
            seed ^= seed >> 7;
            seed ^= seed << 17;
            seed % bound
        };

        let (store, origin) = setup();
        let streamer = DeltaStreamer::new(Arc::clone(&store), origin);

        let mut sent = 0u64;
        for round in 0..40 {
            let batch = (1 + next(4)) as usize;
            let parts: Vec<_> = (0..batch)
                .map(|i| OutputPart::text(format!("p{round}-{i} ")))
                .collect();
            sent += batch as u64;
            streamer.add_parts(parts).unwrap();
            tokio::time::advance(Duration::from_millis(next(400))).await;
            settle().await;
        }

        let stream_id = streamer.stream_id().unwrap();
        let msg = Message::assistant(streamer.origin().thread_id, vec![], 0, 0);
        let end = streamer.finish(&[msg]).await.unwrap();
        assert_eq!(end, sent);

        let (state, deltas) = store.catch_up(stream_id, 0).unwrap();
        assert!(state.is_terminal());

        // Contiguous, gap-free coverage of [0, end).
        assert_eq!(deltas[0].start, 0);
        for pair in deltas.windows(2) {
            assert_eq!(pair[0].end, pair[1].start);
        }
        assert_eq!(deltas.last().unwrap().end, sent);
        let total: usize = deltas.iter().map(|d| d.parts.len()).sum();
        assert_eq!(total as u64, sent);
    }
}
