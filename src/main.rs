//! Book Recorder Binary
//!
//! Records the Bitfinex depth-25 order book for one pair to hourly Parquet
//! files.
//!
//! Usage:
//!   book_recorder BTCUSD --out-dir ./data
//!
//! Environment:
//!   RECORDER_OUT_DIR - Output directory (default: ./data)
//!   RECORDER_WS_URL - WebSocket endpoint
//!   RECORDER_PRECISION - Book precision P0..P4 (default: P0)
//!   RECORDER_BATCH_SIZE - Rows that trigger a flush (default: 500)
//!   RECORDER_FLUSH_INTERVAL_MS - Periodic flush interval (default: 5000)
//!   RECORDER_MAX_ROWS_PER_FILE - Rotation cap (default: 500000)
//!   RECORDER_RECONNECT_INTERVAL_MS - Delay between reconnects (default: 5000)
//!
//! Exit codes: 0 on signal, 1 on checksum mismatch, 2 on disk full,
//! 3 if startup fails.

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use dotenv::dotenv;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use book_recorder::config::DEFAULT_WS_URL;
use book_recorder::feed::{FeedSession, HaltReason};
use book_recorder::storage::{ParquetSinkFactory, RotatingWriter};
use book_recorder::RecorderConfig;

const STARTUP_FAILURE: u8 = 3;

#[derive(Parser, Debug)]
#[command(name = "book_recorder")]
#[command(about = "Record the Bitfinex depth-25 order book to Parquet")]
struct Args {
    /// Trading pair, e.g. BTCUSD (a leading `t` is accepted)
    pair: String,

    /// Output directory
    #[arg(long, env = "RECORDER_OUT_DIR", default_value = "./data")]
    out_dir: PathBuf,

    /// WebSocket endpoint
    #[arg(long, env = "RECORDER_WS_URL", default_value = DEFAULT_WS_URL)]
    ws_url: String,

    /// Book precision (P0..P4)
    #[arg(long, env = "RECORDER_PRECISION", default_value = "P0")]
    precision: String,

    /// Pending rows that trigger a flush
    #[arg(long, env = "RECORDER_BATCH_SIZE", default_value = "500")]
    batch_size: usize,

    /// Periodic flush interval in milliseconds
    #[arg(long, env = "RECORDER_FLUSH_INTERVAL_MS", default_value = "5000")]
    flush_interval_ms: u64,

    /// Rows per file before rotating to a `_partN` file
    #[arg(long, env = "RECORDER_MAX_ROWS_PER_FILE", default_value = "500000")]
    max_rows_per_file: u64,

    /// Delay between reconnect attempts in milliseconds
    #[arg(long, env = "RECORDER_RECONNECT_INTERVAL_MS", default_value = "5000")]
    reconnect_interval_ms: u64,
}

impl Args {
    fn into_config(self) -> RecorderConfig {
        RecorderConfig {
            pair: self.pair,
            out_dir: self.out_dir,
            ws_url: self.ws_url,
            precision: self.precision,
            batch_size: self.batch_size,
            flush_interval: Duration::from_millis(self.flush_interval_ms),
            max_rows_per_file: self.max_rows_per_file,
            reconnect_interval: Duration::from_millis(self.reconnect_interval_ms),
            ..RecorderConfig::default()
        }
    }
}

fn main() -> ExitCode {
    load_env();
    init_tracing();

    let args = Args::parse();

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            error!(error = %e, "Failed to start async runtime");
            return ExitCode::from(STARTUP_FAILURE);
        }
    };

    match runtime.block_on(run(args)) {
        Ok(reason) => ExitCode::from(reason.exit_code()),
        Err(e) => {
            error!("Startup failed: {:#}", e);
            ExitCode::from(STARTUP_FAILURE)
        }
    }
}

async fn run(args: Args) -> Result<HaltReason> {
    let config = args.into_config().validated()?;

    info!("Starting Book Recorder");
    info!("  Pair: {}", config.pair);
    info!("  Output: {}", config.out_dir.display());
    info!("  WS: {}", config.ws_url);
    info!("  Precision: {}", config.precision);
    info!(
        "  Batch: {} rows / {:?}, rotate at {} rows",
        config.batch_size, config.flush_interval, config.max_rows_per_file
    );

    let writer = RotatingWriter::new(config.writer_config(), Arc::new(ParquetSinkFactory::new()))
        .with_context(|| format!("prepare output directory {}", config.out_dir.display()))?;

    let mut session = FeedSession::new(config.session_config(), writer);
    let reason = session.run(shutdown_signal()).await;

    info!(reason = %reason, "Book recorder stopped");
    Ok(reason)
}

/// Resolves on SIGINT, or SIGTERM on unix.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    info!("Shutdown signal received");
}

/// Load `.env` from the working directory, then from the crate root.
fn load_env() {
    let _ = dotenv();

    let manifest_env = Path::new(env!("CARGO_MANIFEST_DIR")).join(".env");
    if manifest_env.exists() {
        let _ = dotenv::from_path(&manifest_env);
    }
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "book_recorder=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}
