//! Feed session controller
//!
//! Owns the book and drives one WebSocket connection at a time:
//! `Disconnected -> Connecting -> Connected -> Disconnected`, until a halt
//! (signal, checksum mismatch, disk full). Each text frame is dispatched
//! synchronously through [`FeedSession::handle_text`]; the writer is only
//! ever handed rows, never awaited on the message path.

use std::future::Future;
use std::pin::Pin;
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

use super::protocol::{self, BookPayload, ControlEvent, FeedMessage};
use crate::book::{build_row, checksum, BookState};
use crate::storage::RotatingWriter;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

// =============================================================================
// CONFIGURATION
// =============================================================================

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub ws_url: String,
    /// Normalized pair, e.g. `BTCUSD`.
    pub pair: String,
    pub precision: String,
    pub reconnect_interval: Duration,
    /// Upper bound on the final writer flush.
    pub shutdown_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            ws_url: "wss://api-pub.bitfinex.com/ws/2".to_string(),
            pair: "BTCUSD".to_string(),
            precision: "P0".to_string(),
            reconnect_interval: Duration::from_secs(5),
            shutdown_timeout: Duration::from_secs(10),
        }
    }
}

// =============================================================================
// STATE
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HaltReason {
    Signal,
    ChecksumMismatch,
    DiskFull,
}

impl HaltReason {
    pub fn exit_code(&self) -> u8 {
        match self {
            Self::Signal => 0,
            Self::ChecksumMismatch => 1,
            Self::DiskFull => 2,
        }
    }
}

impl std::fmt::Display for HaltReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Signal => write!(f, "signal"),
            Self::ChecksumMismatch => write!(f, "checksum mismatch"),
            Self::DiskFull => write!(f, "disk full"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Connected,
    Halted(HaltReason),
}

/// What the connection loop should do after a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    Continue,
    Reconnect,
    Halt(HaltReason),
}

#[derive(Debug, Default)]
pub struct SessionStats {
    pub messages_received: AtomicU64,
    pub data_messages: AtomicU64,
    pub malformed_dropped: AtomicU64,
    pub checksums_verified: AtomicU64,
    pub reconnects: AtomicU64,
    pub sequence_gaps: AtomicU64,
}

impl SessionStats {
    pub fn snapshot(&self) -> SessionStatsSnapshot {
        SessionStatsSnapshot {
            messages_received: self.messages_received.load(Ordering::Relaxed),
            data_messages: self.data_messages.load(Ordering::Relaxed),
            malformed_dropped: self.malformed_dropped.load(Ordering::Relaxed),
            checksums_verified: self.checksums_verified.load(Ordering::Relaxed),
            reconnects: self.reconnects.load(Ordering::Relaxed),
            sequence_gaps: self.sequence_gaps.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct SessionStatsSnapshot {
    pub messages_received: u64,
    pub data_messages: u64,
    pub malformed_dropped: u64,
    pub checksums_verified: u64,
    pub reconnects: u64,
    pub sequence_gaps: u64,
}

enum StreamEnd {
    Disconnected,
    Halt(HaltReason),
}

// =============================================================================
// SESSION
// =============================================================================

pub struct FeedSession {
    config: SessionConfig,
    book: BookState,
    writer: Arc<RotatingWriter>,
    state: SessionState,
    stats: Arc<SessionStats>,
    chan_id: Option<i64>,
    writer_closed: bool,
}

impl FeedSession {
    pub fn new(config: SessionConfig, writer: Arc<RotatingWriter>) -> Self {
        Self {
            config,
            book: BookState::new(),
            writer,
            state: SessionState::Disconnected,
            stats: Arc::new(SessionStats::default()),
            chan_id: None,
            writer_closed: false,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn book(&self) -> &BookState {
        &self.book
    }

    pub fn stats(&self) -> Arc<SessionStats> {
        self.stats.clone()
    }

    pub fn writer(&self) -> &Arc<RotatingWriter> {
        &self.writer
    }

    /// Run until halted. `shutdown` resolving is treated as a signal.
    ///
    /// The writer timer is started here and the writer is flushed and closed
    /// before returning.
    pub async fn run<F>(&mut self, shutdown: F) -> HaltReason
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        let mut disk_full = self.writer.subscribe_disk_full();
        self.writer.start();

        let reason = loop {
            if self.writer.is_disk_full() {
                break HaltReason::DiskFull;
            }

            self.state = SessionState::Connecting;
            info!(url = %self.config.ws_url, pair = %self.config.pair, "🔌 Connecting to book feed");

            let connected = tokio::select! {
                biased;
                _ = shutdown.as_mut() => break HaltReason::Signal,
                _ = disk_full_signal(&mut disk_full) => break HaltReason::DiskFull,
                result = connect_async(self.config.ws_url.as_str()) => result,
            };

            match connected {
                Ok((ws, resp)) => {
                    info!(status = %resp.status(), "✅ Book feed connected");
                    match self.stream(ws, shutdown.as_mut(), &mut disk_full).await {
                        Ok(StreamEnd::Halt(reason)) => break reason,
                        Ok(StreamEnd::Disconnected) => {}
                        Err(e) => warn!(error = %e, "Book feed connection lost"),
                    }
                }
                Err(e) => warn!(error = %e, "Failed to connect to book feed"),
            }

            self.state = SessionState::Disconnected;
            self.stats.reconnects.fetch_add(1, Ordering::Relaxed);
            info!("Reconnecting in {:?}...", self.config.reconnect_interval);

            tokio::select! {
                biased;
                _ = shutdown.as_mut() => break HaltReason::Signal,
                _ = disk_full_signal(&mut disk_full) => break HaltReason::DiskFull,
                _ = tokio::time::sleep(self.config.reconnect_interval) => {}
            }
        };

        self.close_writer().await;
        self.state = SessionState::Halted(reason);
        info!(reason = %reason, stats = %stats_json(&self.stats.snapshot()), "🛑 Session halted");
        reason
    }

    async fn stream<F>(
        &mut self,
        ws: WsStream,
        mut shutdown: Pin<&mut F>,
        disk_full: &mut watch::Receiver<bool>,
    ) -> Result<StreamEnd>
    where
        F: Future<Output = ()>,
    {
        let (mut write, mut read) = ws.split();

        self.state = SessionState::Connected;
        self.book.reset();
        self.chan_id = None;

        write
            .send(Message::Text(protocol::conf_request()))
            .await
            .context("send conf request")?;
        write
            .send(Message::Text(protocol::subscribe_request(
                &self.config.pair,
                &self.config.precision,
            )))
            .await
            .context("send book subscription")?;

        let end = loop {
            let frame = tokio::select! {
                biased;
                _ = shutdown.as_mut() => break StreamEnd::Halt(HaltReason::Signal),
                _ = disk_full_signal(disk_full) => break StreamEnd::Halt(HaltReason::DiskFull),
                frame = read.next() => frame,
            };

            let Some(frame) = frame else {
                warn!("Book feed stream ended");
                break StreamEnd::Disconnected;
            };

            match frame.context("book feed read")? {
                Message::Text(text) => match self.handle_text(&text) {
                    Dispatch::Continue => {}
                    Dispatch::Reconnect => break StreamEnd::Disconnected,
                    Dispatch::Halt(reason) => break StreamEnd::Halt(reason),
                },
                Message::Ping(payload) => {
                    let _ = write.send(Message::Pong(payload)).await;
                }
                Message::Close(frame) => {
                    debug!(?frame, "book feed close");
                    break StreamEnd::Disconnected;
                }
                _ => {}
            }
        };

        // Rows are flushed before the socket goes away.
        if let StreamEnd::Halt(_) = end {
            self.close_writer().await;
        }
        if let Err(e) = write.send(Message::Close(None)).await {
            debug!(error = %e, "close frame not sent");
        }
        let _ = write.close().await;

        Ok(end)
    }

    async fn close_writer(&mut self) {
        if self.writer_closed {
            return;
        }
        self.writer_closed = true;
        let outcome = self.writer.shutdown(self.config.shutdown_timeout).await;
        info!(?outcome, stats = %stats_json(&self.writer.stats().snapshot()), "Writer closed");
    }

    // -------------------------------------------------------------------------
    // Dispatch
    // -------------------------------------------------------------------------

    pub fn handle_text(&mut self, text: &str) -> Dispatch {
        self.handle_text_at(text, Utc::now())
    }

    /// Dispatch one frame, stamping any resulting row with `now`.
    pub fn handle_text_at(&mut self, text: &str, now: DateTime<Utc>) -> Dispatch {
        self.stats.messages_received.fetch_add(1, Ordering::Relaxed);

        let message = match protocol::decode(text) {
            Ok(message) => message,
            Err(e) => {
                self.stats.malformed_dropped.fetch_add(1, Ordering::Relaxed);
                debug!(error = %e, frame = %truncate(text, 200), "dropping malformed frame");
                return Dispatch::Continue;
            }
        };

        match message {
            FeedMessage::Event(event) => self.handle_event(event),
            FeedMessage::Heartbeat { seq } => {
                if let Some(seq) = seq {
                    self.book.seed_sequence(seq);
                }
                Dispatch::Continue
            }
            FeedMessage::Checksum { checksum, seq } => self.handle_checksum(checksum, seq),
            FeedMessage::Book { payload, seq } => {
                self.handle_book(payload, seq, now);
                Dispatch::Continue
            }
        }
    }

    fn handle_event(&mut self, event: ControlEvent) -> Dispatch {
        match event {
            ControlEvent::Subscribed { chan_id, symbol } => {
                self.chan_id = chan_id;
                info!(?chan_id, ?symbol, "📡 Subscribed to book channel");
            }
            ControlEvent::Conf { status } => info!(?status, "Feed configuration acknowledged"),
            ControlEvent::Error { code, msg } => error!(?code, ?msg, "Feed error event"),
            ControlEvent::Info {
                code: Some(protocol::INFO_RECONNECT),
                ..
            } => {
                warn!("Server requested reconnect");
                return Dispatch::Reconnect;
            }
            ControlEvent::Info { code, msg } => info!(?code, ?msg, "Feed info event"),
            ControlEvent::Other(name) => debug!(event = %name, "ignoring control event"),
        }
        Dispatch::Continue
    }

    fn handle_checksum(&mut self, expected: i32, seq: Option<u64>) -> Dispatch {
        if !self.book.has_snapshot() {
            debug!(expected, "checksum before snapshot; skipped");
            return Dispatch::Continue;
        }
        self.track_sequence(seq);

        match checksum::validate(&self.book, expected) {
            Ok(()) => {
                self.stats.checksums_verified.fetch_add(1, Ordering::Relaxed);
                Dispatch::Continue
            }
            Err(mismatch) => {
                error!(
                    expected = mismatch.expected,
                    computed = mismatch.computed,
                    seq = ?self.book.last_sequence(),
                    "❌ Book checksum mismatch"
                );
                Dispatch::Halt(HaltReason::ChecksumMismatch)
            }
        }
    }

    fn handle_book(&mut self, payload: BookPayload, seq: Option<u64>, now: DateTime<Utc>) {
        match payload {
            BookPayload::Levels(levels) => {
                if self.book.has_snapshot() {
                    warn!(levels = levels.len(), "snapshot received mid-stream; replacing book");
                }
                self.book.apply_snapshot(&levels);
                info!(
                    bids = self.book.bid_depth(),
                    asks = self.book.ask_depth(),
                    "📖 Book snapshot applied"
                );
            }
            BookPayload::Level(update) => {
                if !self.book.has_snapshot() {
                    warn!(price = %update.price, "delta before snapshot; dropped");
                    return;
                }
                self.book.apply_delta(&update);
            }
        }

        self.track_sequence(seq);
        self.stats.data_messages.fetch_add(1, Ordering::Relaxed);

        if let Some(row) = build_row(&self.book, &self.config.pair, self.book.last_sequence(), now) {
            self.writer.enqueue(row);
        }
    }

    fn track_sequence(&mut self, seq: Option<u64>) {
        if let Some(seq) = seq {
            if self.book.observe_sequence(seq).is_some() {
                self.stats.sequence_gaps.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

/// Resolves once the writer reports disk exhaustion.
async fn disk_full_signal(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// Stats snapshots go into the halt log lines as one JSON object.
fn stats_json<T: serde::Serialize>(snapshot: &T) -> String {
    serde_json::to_string(snapshot).unwrap_or_default()
}

fn truncate(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}
