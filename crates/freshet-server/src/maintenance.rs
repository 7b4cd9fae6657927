//! The periodic maintenance loop.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use freshet_kernel::{
    sweep, ChatStore, FileStore, FILE_RETENTION, STREAM_HEARTBEAT_TIMEOUT, STUCK_GRACE,
    SWEEP_INTERVAL,
};

use crate::constants::FILE_GC_INTERVAL;

/// Tunables for the maintenance loop.
#[derive(Debug, Clone)]
pub struct MaintenanceConfig {
    /// Cadence of the reconciliation sweep.
    pub sweep_interval: Duration,
    /// Minimum silence before a stuck thread is repaired.
    pub stuck_grace: Duration,
    /// Heartbeat age at which a streaming row is reaped.
    pub stream_timeout: Duration,
    /// Cadence of orphaned-file collection.
    pub gc_interval: Duration,
    /// How long unreferenced files are retained.
    pub file_retention: Duration,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            sweep_interval: SWEEP_INTERVAL,
            stuck_grace: STUCK_GRACE,
            stream_timeout: STREAM_HEARTBEAT_TIMEOUT,
            gc_interval: FILE_GC_INTERVAL,
            file_retention: FILE_RETENTION,
        }
    }
}

/// Run the sweep and GC on their intervals until `shutdown` fires.
///
/// Failures are logged and the loop keeps going; a bad pass must not take
/// the daemon down with it.
pub async fn run_maintenance(
    store: Arc<ChatStore>,
    files: Arc<FileStore>,
    config: MaintenanceConfig,
    shutdown: CancellationToken,
) {
    let mut sweep_timer = tokio::time::interval(config.sweep_interval);
    sweep_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut gc_timer = tokio::time::interval(config.gc_interval);
    gc_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                tracing::info!("maintenance loop shutting down");
                break;
            }
            _ = sweep_timer.tick() => {
                match sweep::run_sweep(&store, config.stuck_grace, config.stream_timeout) {
                    Ok(stats) => {
                        tracing::debug!(
                            examined = stats.examined,
                            repaired = stats.repaired,
                            reaped = stats.reaped_streams,
                            "reconciliation sweep completed"
                        );
                    }
                    Err(e) => tracing::error!("reconciliation sweep failed: {e}"),
                }
            }
            _ = gc_timer.tick() => {
                match files.cleanup_orphaned_files(config.file_retention) {
                    Ok(0) => {}
                    Ok(deleted) => tracing::info!(deleted, "file collection pass completed"),
                    Err(e) => tracing::error!("file collection failed: {e}"),
                }
            }
        }
    }
}
