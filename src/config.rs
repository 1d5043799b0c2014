//! Recorder configuration
//!
//! One flat struct the binary fills from CLI/env, split into the per-component
//! configs the writer and session consume.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Result};

use crate::feed::{normalize_pair, SessionConfig};
use crate::storage::WriterConfig;

pub const DEFAULT_WS_URL: &str = "wss://api-pub.bitfinex.com/ws/2";

#[derive(Debug, Clone)]
pub struct RecorderConfig {
    pub pair: String,
    pub out_dir: PathBuf,
    pub ws_url: String,
    pub precision: String,
    pub batch_size: usize,
    pub flush_interval: Duration,
    pub max_rows_per_file: u64,
    pub reconnect_interval: Duration,
    pub shutdown_timeout: Duration,
}

impl Default for RecorderConfig {
    fn default() -> Self {
        Self {
            pair: "BTCUSD".to_string(),
            out_dir: PathBuf::from("./data"),
            ws_url: DEFAULT_WS_URL.to_string(),
            precision: "P0".to_string(),
            batch_size: 500,
            flush_interval: Duration::from_millis(5_000),
            max_rows_per_file: 500_000,
            reconnect_interval: Duration::from_millis(5_000),
            shutdown_timeout: Duration::from_secs(10),
        }
    }
}

impl RecorderConfig {
    /// Normalize the pair and reject values the recorder cannot run with.
    pub fn validated(mut self) -> Result<Self> {
        self.pair = normalize_pair(&self.pair);
        if self.pair.is_empty() || !self.pair.chars().all(|c| c.is_ascii_alphanumeric() || c == ':') {
            bail!("invalid pair {:?}", self.pair);
        }
        if !matches!(self.precision.as_str(), "P0" | "P1" | "P2" | "P3" | "P4") {
            bail!("invalid precision {:?} (expected P0..P4)", self.precision);
        }
        if self.batch_size == 0 {
            bail!("batch size must be positive");
        }
        if self.max_rows_per_file == 0 {
            bail!("max rows per file must be positive");
        }
        if self.flush_interval.is_zero() {
            bail!("flush interval must be positive");
        }
        Ok(self)
    }

    /// Pair with `:` replaced, safe for file names.
    pub fn file_pair(&self) -> String {
        self.pair.replace(':', "_")
    }

    pub fn writer_config(&self) -> WriterConfig {
        WriterConfig {
            out_dir: self.out_dir.clone(),
            pair: self.file_pair(),
            batch_size: self.batch_size,
            flush_interval: self.flush_interval,
            max_rows_per_file: self.max_rows_per_file,
        }
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            ws_url: self.ws_url.clone(),
            pair: self.pair.clone(),
            precision: self.precision.clone(),
            reconnect_interval: self.reconnect_interval,
            shutdown_timeout: self.shutdown_timeout,
        }
    }
}
