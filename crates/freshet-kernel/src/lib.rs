//! # freshet-kernel
//!
//! Streaming-delta core for the Freshet chat backend.
//!
//! A generation step's output flows through three stages:
//! - the producer feeds fragments into a [`DeltaStreamer`], which batches
//!   and throttles them;
//! - each batch lands as a contiguous delta in the SQLite-backed
//!   [`ChatStore`], which broadcasts a change event;
//! - readers call [`ChatStore::catch_up`] with a cursor and reconstruct
//!   the output by concatenating deltas in range order.
//!
//! Around that pipeline: the reconciliation sweep repairs threads orphaned
//! by crashed producers, the file store deduplicates and refcounts
//! attachments over the CAS, and the exec module runs sandbox commands
//! with bounded output.

pub mod chunk;
pub mod db;
pub mod exec;
pub mod files;
pub mod registry;
pub mod ring;
pub mod store;
pub mod streamer;
pub mod sweep;

pub use chunk::Chunker;
pub use db::{ChatDb, FileDeleteOutcome, FilePage, FileRecord, StreamError};
pub use exec::{run_command, ExecError, ExecOutcome, ExecRequest};
pub use files::{AddedFile, FileStore, FileStoreError, FILE_RETENTION, GC_PAGE_SIZE};
pub use registry::GenerationRegistry;
pub use ring::{RingBuffer, TRUNCATION_MARKER};
pub use store::{ChatEvent, ChatStore, DbHandle, SharedChatStore, shared_memory_store};
pub use streamer::{DeltaStreamer, DEFAULT_THROTTLE};
pub use sweep::{
    reap_stale_streams, run_sweep, sweep_stuck_threads, SweepStats, STREAM_HEARTBEAT_TIMEOUT,
    STUCK_GRACE, SWEEP_INTERVAL,
};
