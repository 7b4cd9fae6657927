//! Registry of in-flight generations and their abort signals.
//!
//! The thread row's `cancel_requested` flag is the durable cancellation
//! signal; this registry is the in-process fast path. The driver registers
//! a token when it claims a thread, the cancel endpoint fires it, and the
//! streamer wired with [`DeltaStreamer::with_cancel`] goes silent
//! immediately instead of waiting to observe the flag.
//!
//! [`DeltaStreamer::with_cancel`]: crate::streamer::DeltaStreamer::with_cancel

use dashmap::DashMap;
use tokio_util::sync::CancellationToken;

use freshet_types::ThreadId;

/// Tracks one abort token per generating thread.
#[derive(Default)]
pub struct GenerationRegistry {
    active: DashMap<ThreadId, CancellationToken>,
}

impl GenerationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a fresh token for a thread's generation, replacing (and
    /// firing) any stale token left by an earlier run.
    pub fn register(&self, thread_id: ThreadId) -> CancellationToken {
        let token = CancellationToken::new();
        if let Some(stale) = self.active.insert(thread_id, token.clone()) {
            stale.cancel();
        }
        token
    }

    /// Fire the thread's abort token. Returns false when no generation is
    /// registered (e.g. it lives on another process — the durable flag
    /// still reaches it).
    pub fn cancel(&self, thread_id: ThreadId) -> bool {
        match self.active.get(&thread_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Drop a thread's entry once its generation ends.
    pub fn remove(&self, thread_id: ThreadId) {
        self.active.remove(&thread_id);
    }

    /// Number of registered generations.
    pub fn len(&self) -> usize {
        self.active.len()
    }

    pub fn is_empty(&self) -> bool {
        self.active.is_empty()
    }
}
