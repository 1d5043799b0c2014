//! Bitfinex order book recorder
//!
//! Maintains a depth-25 book from the public WebSocket feed, validates it
//! against the exchange checksum and records one wide snapshot row per
//! update into hourly Parquet files.

pub mod book;
pub mod config;
pub mod feed;
pub mod storage;

pub use config::RecorderConfig;
