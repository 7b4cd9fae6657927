//! Reconciliation sweep for generations orphaned by a crashed producer.
//!
//! A producer that dies between `begin_generation` and a clean finish
//! leaves its thread permanently marked generating. Timers die with the
//! process, so nothing in the data path will ever clear the flag — this
//! sweep is the eventual-consistency repair. It runs on a fixed interval
//! and is idempotent: two sweeps racing on the same thread both issue the
//! same two-flag clear, which is safe without locking.
//!
//! The grace period avoids racing a live producer between "claimed the
//! thread" and "created the first stream row", where a legitimate
//! generation is momentarily invisible to the streaming-state probe.

use std::time::Duration;

use freshet_types::now_millis;

use crate::db::StreamError;
use crate::store::ChatStore;

/// How often the maintenance daemon runs the sweep.
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Minimum silence before a generating thread with no live stream is
/// considered stuck.
pub const STUCK_GRACE: Duration = Duration::from_secs(60);

/// How long a streaming row may go without a heartbeat before the reaper
/// marks it errored.
pub const STREAM_HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(10 * 60);

/// Outcome counters for one sweep invocation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepStats {
    /// Threads that claimed to be generating.
    pub examined: usize,
    /// Threads whose flags were force-cleared.
    pub repaired: usize,
    /// Streams failed by the heartbeat reaper.
    pub reaped_streams: usize,
}

/// One full reconciliation pass: reap heartbeat-dead streams first so the
/// thread check below sees them as terminal, then repair stuck threads.
pub fn run_sweep(
    store: &ChatStore,
    grace: Duration,
    heartbeat_timeout: Duration,
) -> Result<SweepStats, StreamError> {
    let reaped_streams = reap_stale_streams(store, heartbeat_timeout)?;
    let mut stats = sweep_stuck_threads(store, grace)?;
    stats.reaped_streams = reaped_streams;
    Ok(stats)
}

/// Force-clear generation flags on threads that claim an in-flight
/// generation but have no live stream and no recent activity.
pub fn sweep_stuck_threads(
    store: &ChatStore,
    grace: Duration,
) -> Result<SweepStats, StreamError> {
    let threads = store.generating_threads()?;
    let now = now_millis();
    let grace_millis = grace.as_millis() as u64;

    let mut stats = SweepStats {
        examined: threads.len(),
        ..SweepStats::default()
    };

    for thread_id in threads {
        // A streaming row means a producer is plausibly still active.
        if store.has_streaming(thread_id)? {
            continue;
        }

        let last = match store.last_activity(thread_id) {
            Ok(last) => last,
            // Deleted since we listed it; nothing left to repair.
            Err(StreamError::ThreadNotFound(_)) => continue,
            Err(e) => return Err(e),
        };

        let elapsed = now.saturating_sub(last);
        if elapsed < grace_millis {
            continue;
        }

        store.repair_thread(thread_id)?;
        stats.repaired += 1;
        tracing::info!(
            thread_id = %thread_id,
            idle_secs = elapsed / 1000,
            "cleared stuck generation state"
        );
    }

    if stats.repaired > 0 {
        tracing::info!(
            examined = stats.examined,
            repaired = stats.repaired,
            "reconciliation sweep repaired threads"
        );
    }
    Ok(stats)
}

/// Mark streaming rows with a long-dead heartbeat as errored.
pub fn reap_stale_streams(store: &ChatStore, timeout: Duration) -> Result<usize, StreamError> {
    let cutoff = now_millis().saturating_sub(timeout.as_millis() as u64);
    let mut reaped = 0;
    for stream_id in store.stale_streams(cutoff)? {
        match store.fail_stream(stream_id, "stream timed out without a heartbeat") {
            Ok(()) => {
                reaped += 1;
                tracing::info!(stream_id = %stream_id, "reaped heartbeat-dead stream");
            }
            // Finished or errored between the scan and the write.
            Err(StreamError::AlreadyTerminal(_)) | Err(StreamError::StreamNotFound(_)) => {}
            Err(e) => return Err(e),
        }
    }
    Ok(reaped)
}
