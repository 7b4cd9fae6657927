//! Freshet maintenance daemon binary.
//!
//! Runs the reconciliation sweep and orphaned-file collection against a
//! chat database.
//!
//! ## Usage
//!
//! ```bash
//! # Run with defaults (./freshet-data)
//! freshet-server
//!
//! # Point at a deployment's data directory
//! freshet-server --data-dir /var/lib/freshet
//!
//! # Tighten the cadences (seconds)
//! freshet-server --sweep-interval 60 --gc-interval 600
//! ```

use std::env;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use freshet_cas::BlobStore;
use freshet_kernel::{ChatDb, ChatStore, FileStore};
use freshet_server::constants::{BLOBS_DIRNAME, DB_FILENAME, DEFAULT_DATA_DIR};
use freshet_server::{run_maintenance, MaintenanceConfig};

fn print_usage() {
    eprintln!(
        r#"freshet-server - maintenance daemon for the Freshet chat backend

USAGE:
    freshet-server [OPTIONS]

OPTIONS:
    --data-dir <PATH>         Data directory (default: {data_dir})
    --sweep-interval <SECS>   Reconciliation sweep cadence
    --gc-interval <SECS>      Orphaned-file collection cadence
    --help, -h                Show this help

The data directory holds {db} and the {blobs}/ blob store; both are
created on first run."#,
        data_dir = DEFAULT_DATA_DIR,
        db = DB_FILENAME,
        blobs = BLOBS_DIRNAME,
    );
}

struct Options {
    data_dir: PathBuf,
    config: MaintenanceConfig,
}

fn parse_args(args: &[String]) -> Result<Option<Options>, String> {
    let mut data_dir = PathBuf::from(DEFAULT_DATA_DIR);
    let mut config = MaintenanceConfig::default();

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--help" | "-h" => return Ok(None),
            "--data-dir" => {
                let value = args.get(i + 1).ok_or("--data-dir requires a path")?;
                data_dir = PathBuf::from(value);
                i += 2;
            }
            "--sweep-interval" => {
                let value = args.get(i + 1).ok_or("--sweep-interval requires seconds")?;
                let secs: u64 = value
                    .parse()
                    .map_err(|_| format!("bad sweep interval: {value}"))?;
                config.sweep_interval = Duration::from_secs(secs);
                i += 2;
            }
            "--gc-interval" => {
                let value = args.get(i + 1).ok_or("--gc-interval requires seconds")?;
                let secs: u64 = value
                    .parse()
                    .map_err(|_| format!("bad gc interval: {value}"))?;
                config.gc_interval = Duration::from_secs(secs);
                i += 2;
            }
            other => return Err(format!("unknown argument: {other}")),
        }
    }

    Ok(Some(Options { data_dir, config }))
}

async fn run(opts: Options) -> anyhow::Result<()> {
    std::fs::create_dir_all(&opts.data_dir)?;

    let db = ChatDb::open(opts.data_dir.join(DB_FILENAME))?;
    let store = Arc::new(ChatStore::with_db(db));
    let blobs = BlobStore::open(opts.data_dir.join(BLOBS_DIRNAME))?;
    let files = Arc::new(FileStore::new(store.db(), blobs));

    let shutdown = CancellationToken::new();
    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("received ctrl-c");
            signal_token.cancel();
        }
    });

    tracing::info!(
        data_dir = %opts.data_dir.display(),
        sweep_secs = opts.config.sweep_interval.as_secs(),
        gc_secs = opts.config.gc_interval.as_secs(),
        "maintenance daemon started"
    );
    run_maintenance(store, files, opts.config, shutdown).await;
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();

    let args: Vec<String> = env::args().collect();
    let opts = match parse_args(&args) {
        Ok(Some(opts)) => opts,
        Ok(None) => {
            print_usage();
            return ExitCode::SUCCESS;
        }
        Err(msg) => {
            eprintln!("error: {msg}\n");
            print_usage();
            return ExitCode::FAILURE;
        }
    };

    match run(opts).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("daemon failed: {e:#}");
            ExitCode::FAILURE
        }
    }
}
