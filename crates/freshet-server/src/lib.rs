//! Freshet maintenance daemon.
//!
//! Hosts the two background jobs the streaming core depends on:
//! - the reconciliation sweep (stuck threads, heartbeat-dead streams);
//! - orphaned-file garbage collection.
//!
//! The chat data path (streamers, readers) runs in the serving processes;
//! this daemon only repairs and collects.

pub mod constants;
mod maintenance;

pub use maintenance::{run_maintenance, MaintenanceConfig};
