//! Daemon configuration constants.
//!
//! Centralizes hardcoded values for easier configuration and documentation.
//! Sweep cadence and grace periods live next to the sweep itself in
//! `freshet-kernel`; these are the daemon-level knobs.

use std::time::Duration;

/// Default data directory (database + blob store) when none is given.
pub const DEFAULT_DATA_DIR: &str = "./freshet-data";

/// Database filename inside the data directory.
pub const DB_FILENAME: &str = "freshet.db";

/// Blob store directory inside the data directory.
pub const BLOBS_DIRNAME: &str = "blobs";

/// How often orphaned-file collection runs.
pub const FILE_GC_INTERVAL: Duration = Duration::from_secs(60 * 60);
