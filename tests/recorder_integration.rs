//! End-to-end tests for the feed session
//!
//! A local WebSocket server plays the exchange side: it checks the conf and
//! subscribe requests, then scripts book frames. The recorder writes real
//! Parquet files into a temp directory which are read back afterwards.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use rust_decimal::Decimal;
use serde_json::Value;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio_tungstenite::{accept_async, tungstenite::Message, WebSocketStream};

use book_recorder::book::{checksum, BookState, LevelUpdate, SnapshotRow};
use book_recorder::feed::{FeedSession, HaltReason, SessionConfig, SessionState};
use book_recorder::storage::{
    ParquetSinkFactory, RotatingWriter, RowSink, SinkFactory, StorageError, WriterConfig,
};

const SNAPSHOT: &str = r#"[17,[[100.5,1,2.0],[100.4,1,-1.5]],1]"#;
const DELTA: &str = r#"[17,[100.3,2,3.0],2]"#;

type ServerSocket = WebSocketStream<tokio::net::TcpStream>;

async fn bind() -> (TcpListener, String) {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind test server");
    let addr = listener.local_addr().expect("local addr");
    (listener, format!("ws://{}", addr))
}

/// Accept one client and consume its conf + subscribe requests.
async fn accept_client(listener: &TcpListener) -> ServerSocket {
    let (tcp, _) = listener.accept().await.expect("accept");
    let mut ws = accept_async(tcp).await.expect("ws handshake");

    let conf = next_json(&mut ws).await;
    assert_eq!(conf["event"], "conf");
    assert_eq!(conf["flags"], 196_608);

    let sub = next_json(&mut ws).await;
    assert_eq!(sub["event"], "subscribe");
    assert_eq!(sub["symbol"], "tBTCUSD");
    assert_eq!(sub["len"], "25");

    ws.send(Message::Text(
        r#"{"event":"subscribed","channel":"book","chanId":17,"symbol":"tBTCUSD"}"#.to_string(),
    ))
    .await
    .expect("send subscribed");
    ws
}

async fn next_json(ws: &mut ServerSocket) -> Value {
    loop {
        match ws.next().await.expect("client hung up").expect("read") {
            Message::Text(text) => return serde_json::from_str(&text).expect("client sent json"),
            _ => continue,
        }
    }
}

async fn send(ws: &mut ServerSocket, frame: &str) {
    ws.send(Message::Text(frame.to_string())).await.expect("send frame");
}

/// Checksum of the book after SNAPSHOT and DELTA.
fn expected_checksum() -> i32 {
    let d = |s: &str| Decimal::from_str(s).expect("decimal literal");
    let mut book = BookState::new();
    book.apply_snapshot(&[
        LevelUpdate::new(d("100.5"), 1, d("2.0")),
        LevelUpdate::new(d("100.4"), 1, d("-1.5")),
    ]);
    book.apply_delta(&LevelUpdate::new(d("100.3"), 2, d("3.0")));
    checksum::compute(&book)
}

fn recorder(dir: &Path, ws_url: String) -> FeedSession {
    recorder_with(dir, ws_url, 100, Arc::new(ParquetSinkFactory::new()))
}

fn recorder_with(
    dir: &Path,
    ws_url: String,
    batch_size: usize,
    factory: Arc<dyn SinkFactory>,
) -> FeedSession {
    let writer = RotatingWriter::new(
        WriterConfig {
            out_dir: dir.to_path_buf(),
            pair: "BTCUSD".to_string(),
            batch_size,
            flush_interval: Duration::from_secs(60),
            max_rows_per_file: 10_000,
        },
        factory,
    )
    .expect("create writer");

    FeedSession::new(
        SessionConfig {
            ws_url,
            pair: "BTCUSD".to_string(),
            reconnect_interval: Duration::from_millis(50),
            shutdown_timeout: Duration::from_secs(5),
            ..SessionConfig::default()
        },
        writer,
    )
}

/// Every file it opens is on a full disk.
struct FullDiskFactory {
    opens: Arc<AtomicUsize>,
}

struct FullDiskSink;

impl RowSink for FullDiskSink {
    fn append(&mut self, _rows: &[SnapshotRow]) -> Result<(), StorageError> {
        Err(StorageError::from_io(std::io::Error::from_raw_os_error(libc::ENOSPC)))
    }

    fn close(self: Box<Self>) -> Result<(), StorageError> {
        Ok(())
    }
}

impl SinkFactory for FullDiskFactory {
    fn extension(&self) -> &str {
        "parquet"
    }

    fn create(&self, _path: &Path) -> Result<Box<dyn RowSink>, StorageError> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FullDiskSink))
    }
}

fn parquet_files(dir: &Path) -> Vec<PathBuf> {
    let mut files: Vec<PathBuf> = std::fs::read_dir(dir)
        .expect("read output dir")
        .map(|e| e.expect("dir entry").path())
        .filter(|p| p.extension().map_or(false, |ext| ext == "parquet"))
        .collect();
    files.sort();
    files
}

fn total_rows(files: &[PathBuf]) -> usize {
    files
        .iter()
        .map(|path| {
            let file = File::open(path).expect("open parquet");
            ParquetRecordBatchReaderBuilder::try_new(file)
                .expect("parquet footer present")
                .build()
                .expect("reader")
                .map(|batch| batch.expect("batch").num_rows())
                .sum::<usize>()
        })
        .sum()
}

#[tokio::test]
async fn test_checksum_mismatch_halts_and_persists_rows() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (listener, url) = bind().await;

    let server = tokio::spawn(async move {
        let mut ws = accept_client(&listener).await;
        send(&mut ws, SNAPSHOT).await;
        send(&mut ws, DELTA).await;
        send(&mut ws, r#"[17,"hb",3]"#).await;
        let good = format!(r#"[17,"cs",{},4]"#, expected_checksum());
        send(&mut ws, &good).await;
        let bad = format!(r#"[17,"cs",{},5]"#, expected_checksum().wrapping_add(1));
        send(&mut ws, &bad).await;
        // Drain until the client closes.
        while let Some(Ok(msg)) = ws.next().await {
            if msg.is_close() {
                break;
            }
        }
    });

    let mut session = recorder(dir.path(), url);
    let reason = tokio::time::timeout(Duration::from_secs(10), session.run(std::future::pending()))
        .await
        .expect("session halts");

    assert_eq!(reason, HaltReason::ChecksumMismatch);
    assert_eq!(reason.exit_code(), 1);
    assert_eq!(session.state(), SessionState::Halted(HaltReason::ChecksumMismatch));

    let stats = session.stats().snapshot();
    assert_eq!(stats.data_messages, 2);
    assert_eq!(stats.checksums_verified, 1);

    let files = parquet_files(dir.path());
    assert_eq!(files.len(), 1, "one hourly file expected, got {:?}", files);
    assert_eq!(total_rows(&files), 2);

    server.await.expect("server task");
}

#[tokio::test]
async fn test_server_close_triggers_reconnect_with_fresh_book() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (listener, url) = bind().await;

    let server = tokio::spawn(async move {
        let mut first = accept_client(&listener).await;
        send(&mut first, SNAPSHOT).await;
        first.close(None).await.expect("close first connection");
        drop(first);

        // A delta before the new snapshot must not be applied.
        let mut second = accept_client(&listener).await;
        send(&mut second, DELTA).await;
        send(&mut second, r#"[17,"cs",0,3]"#).await;
        send(&mut second, SNAPSHOT).await;
        send(&mut second, r#"{"event":"info","code":20051}"#).await;

        let mut third = accept_client(&listener).await;
        send(&mut third, SNAPSHOT).await;
        send(&mut third, r#"[17,"cs",1,2]"#).await;
        while let Some(Ok(msg)) = third.next().await {
            if msg.is_close() {
                break;
            }
        }
    });

    let mut session = recorder(dir.path(), url);
    let reason = tokio::time::timeout(Duration::from_secs(10), session.run(std::future::pending()))
        .await
        .expect("session halts");

    assert_eq!(reason, HaltReason::ChecksumMismatch);
    let stats = session.stats().snapshot();
    assert_eq!(stats.reconnects, 2);
    assert_eq!(stats.data_messages, 3);
    assert_eq!(total_rows(&parquet_files(dir.path())), 3);

    server.await.expect("server task");
}

#[tokio::test]
async fn test_shutdown_signal_flushes_and_exits_cleanly() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (listener, url) = bind().await;
    let (ready_tx, ready_rx) = oneshot::channel::<()>();

    let server = tokio::spawn(async move {
        let mut ws = accept_client(&listener).await;
        send(&mut ws, SNAPSHOT).await;
        send(&mut ws, DELTA).await;
        // Heartbeat round-trip marks both frames as delivered.
        send(&mut ws, r#"[17,"hb",3]"#).await;
        ws.send(Message::Ping(b"ok".to_vec())).await.expect("ping");
        loop {
            match ws.next().await {
                Some(Ok(Message::Pong(payload))) => {
                    assert_eq!(payload, b"ok".to_vec());
                    break;
                }
                Some(Ok(_)) => continue,
                other => panic!("expected pong, got {:?}", other),
            }
        }
        let _ = ready_tx.send(());
        while let Some(Ok(msg)) = ws.next().await {
            if msg.is_close() {
                break;
            }
        }
    });

    let mut session = recorder(dir.path(), url);
    let shutdown = async {
        let _ = ready_rx.await;
    };
    let reason = tokio::time::timeout(Duration::from_secs(10), session.run(shutdown))
        .await
        .expect("session halts");

    assert_eq!(reason, HaltReason::Signal);
    assert_eq!(reason.exit_code(), 0);
    assert_eq!(total_rows(&parquet_files(dir.path())), 2);

    server.await.expect("server task");
}

#[tokio::test]
async fn test_unreachable_feed_retries_until_signal() {
    let dir = tempfile::tempdir().expect("tempdir");
    // Bind and drop to get a port nobody listens on.
    let (listener, url) = bind().await;
    drop(listener);

    let mut session = recorder(dir.path(), url);
    let reason = tokio::time::timeout(
        Duration::from_secs(10),
        session.run(tokio::time::sleep(Duration::from_millis(300))),
    )
    .await
    .expect("session halts");

    assert_eq!(reason, HaltReason::Signal);
    assert!(session.stats().snapshot().reconnects >= 1);
    assert!(parquet_files(dir.path()).is_empty());
}

#[tokio::test]
async fn test_disk_full_closes_connection_with_exit_code_2() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (listener, url) = bind().await;
    let opens = Arc::new(AtomicUsize::new(0));

    let server = tokio::spawn(async move {
        let mut ws = accept_client(&listener).await;
        send(&mut ws, SNAPSHOT).await;
        // The client must hang up on its own once the write fails.
        loop {
            match ws.next().await {
                Some(Ok(Message::Close(_))) => return true,
                Some(Ok(_)) => continue,
                _ => return false,
            }
        }
    });

    let factory = Arc::new(FullDiskFactory { opens: opens.clone() });
    let mut session = recorder_with(dir.path(), url, 1, factory);
    let reason = tokio::time::timeout(Duration::from_secs(10), session.run(std::future::pending()))
        .await
        .expect("session halts");

    assert_eq!(reason, HaltReason::DiskFull);
    assert_eq!(reason.exit_code(), 2);
    assert_eq!(session.state(), SessionState::Halted(HaltReason::DiskFull));
    assert!(session.writer().is_disk_full());
    assert_eq!(opens.load(Ordering::SeqCst), 1);

    let saw_close = server.await.expect("server task");
    assert!(saw_close, "server expected a close frame");
}
