//! Shared helpers for integration tests.
//!
//! - [`RecordingFactory`]: a sink factory that records everything the
//!   downloader reports and acknowledges final flashes like a renderer would.
//! - [`scripted_server`]: a raw TCP server for failure modes wiremock cannot
//!   produce (bodies cut off mid-transfer, stalled connections).

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use partfetch_core::download::{ExponentialBackoff, SegmentDownloader};
use partfetch_core::progress::{
    MessageGate, ProgressHandle, ProgressSink, SinkFactory, SinkRequest,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

/// Downloader with a 1ms backoff and no jitter.
pub fn fast_downloader() -> SegmentDownloader {
    SegmentDownloader::new(reqwest::Client::new()).with_backoff(
        ExponentialBackoff::new(Duration::from_millis(1)).with_jitter(Duration::ZERO),
    )
}

// ==================== Recording sinks ====================

/// Everything reported to one recording sink.
#[derive(Debug, Default)]
pub struct SinkLog {
    pub bytes: AtomicU64,
    pub totals: Mutex<Vec<(u64, bool)>>,
    pub positions: Mutex<Vec<u64>>,
    pub finished: AtomicBool,
    pub aborted: AtomicBool,
    pub cleared: AtomicBool,
}

impl SinkLog {
    pub fn bytes(&self) -> u64 {
        self.bytes.load(Ordering::SeqCst)
    }

    pub fn finished(&self) -> bool {
        self.finished.load(Ordering::SeqCst)
    }

    pub fn aborted(&self) -> bool {
        self.aborted.load(Ordering::SeqCst)
    }

    pub fn cleared(&self) -> bool {
        self.cleared.load(Ordering::SeqCst)
    }

    pub fn last_total(&self) -> Option<(u64, bool)> {
        self.totals.lock().unwrap().last().copied()
    }
}

/// Sink writing into a shared [`SinkLog`].
#[derive(Debug, Clone, Default)]
pub struct RecordingSink {
    pub log: Arc<SinkLog>,
}

impl ProgressSink for RecordingSink {
    fn set_total(&self, total: u64, complete: bool) {
        self.log.totals.lock().unwrap().push((total, complete));
        if complete {
            self.finish();
        }
    }

    fn set_position(&self, position: u64) {
        self.log.positions.lock().unwrap().push(position);
    }

    fn inc(&self, bytes: u64, _elapsed: Duration) {
        self.log.bytes.fetch_add(bytes, Ordering::SeqCst);
    }

    fn finish(&self) {
        self.log.finished.store(true, Ordering::SeqCst);
    }

    fn abort(&self, clear: bool) {
        self.log.aborted.store(true, Ordering::SeqCst);
        if clear {
            self.log.cleared.store(true, Ordering::SeqCst);
        }
    }
}

/// Factory handing out [`RecordingSink`]s and draining their gates.
#[derive(Debug, Clone, Default)]
pub struct RecordingFactory {
    pub requests: Arc<Mutex<Vec<SinkRequest>>>,
    pub sink: RecordingSink,
    pub flashes: Arc<Mutex<Vec<String>>>,
    pub finals: Arc<Mutex<Vec<String>>>,
}

impl RecordingFactory {
    pub fn created(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    pub fn flashes(&self) -> Vec<String> {
        self.flashes.lock().unwrap().clone()
    }

    pub fn finals(&self) -> Vec<String> {
        self.finals.lock().unwrap().clone()
    }
}

impl SinkFactory for RecordingFactory {
    fn create(&self, request: SinkRequest) -> ProgressHandle {
        self.requests.lock().unwrap().push(request);

        let (gate, mut inbox) = MessageGate::channel();
        let flashes = Arc::clone(&self.flashes);
        let finals = Arc::clone(&self.finals);
        tokio::spawn(async move {
            while let Some(mut message) = inbox.recv().await {
                let text = message.text().to_string();
                if message.is_final() {
                    finals.lock().unwrap().push(text);
                } else {
                    flashes.lock().unwrap().push(text);
                }
                message.acknowledge();
            }
        });

        ProgressHandle {
            sink: Arc::new(self.sink.clone()),
            gate,
        }
    }
}

// ==================== Scripted TCP server ====================

/// What the scripted server does with one connection.
#[derive(Debug, Clone)]
pub enum Reply {
    /// Declares `declared` body bytes, sends `sent`, then closes.
    Truncated { status: u16, declared: usize, sent: usize },
    /// Declares `declared` body bytes, sends `sent`, then goes silent.
    Stall { status: u16, declared: usize, sent: usize },
    /// Waits `head_after` before a 206 head, then `body_after` before
    /// sending all `len` body bytes.
    Delayed {
        head_after: Duration,
        body_after: Duration,
        len: usize,
    },
    /// Empty response with the given status.
    Status(u16),
    /// Accepts the connection and never answers.
    Hang,
}

/// Handle to a running scripted server.
#[derive(Debug, Clone)]
pub struct ScriptedServer {
    pub url: String,
    /// `Range` header of every request, in arrival order.
    pub ranges: Arc<Mutex<Vec<String>>>,
}

impl ScriptedServer {
    pub fn ranges(&self) -> Vec<String> {
        self.ranges.lock().unwrap().clone()
    }
}

/// Serves `replies` one per connection; the last reply repeats.
pub async fn scripted_server(replies: Vec<Reply>) -> ScriptedServer {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind scripted server");
    let addr = listener.local_addr().expect("local addr");
    let ranges = Arc::new(Mutex::new(Vec::new()));

    let seen = Arc::clone(&ranges);
    tokio::spawn(async move {
        let mut index = 0;
        while let Ok((mut socket, _)) = listener.accept().await {
            let reply = replies[index.min(replies.len() - 1)].clone();
            index += 1;
            let seen = Arc::clone(&seen);
            tokio::spawn(async move {
                let head = read_request_head(&mut socket).await;
                if let Some(range) = head
                    .lines()
                    .find_map(|line| line.strip_prefix("range: ").or_else(|| line.strip_prefix("Range: ")))
                {
                    seen.lock().unwrap().push(range.trim().to_string());
                }

                match reply {
                    Reply::Truncated { status, declared, sent } => {
                        let _ = socket.write_all(&response_head(status, declared)).await;
                        let _ = socket.write_all(&vec![b'x'; sent]).await;
                        let _ = socket.flush().await;
                        let _ = socket.shutdown().await;
                    }
                    Reply::Stall { status, declared, sent } => {
                        let _ = socket.write_all(&response_head(status, declared)).await;
                        let _ = socket.write_all(&vec![b'x'; sent]).await;
                        let _ = socket.flush().await;
                        tokio::time::sleep(Duration::from_secs(60)).await;
                    }
                    Reply::Delayed {
                        head_after,
                        body_after,
                        len,
                    } => {
                        tokio::time::sleep(head_after).await;
                        let _ = socket.write_all(&response_head(206, len)).await;
                        let _ = socket.flush().await;
                        tokio::time::sleep(body_after).await;
                        let _ = socket.write_all(&vec![b'x'; len]).await;
                        let _ = socket.flush().await;
                        let _ = socket.shutdown().await;
                    }
                    Reply::Status(status) => {
                        let _ = socket.write_all(&response_head(status, 0)).await;
                        let _ = socket.flush().await;
                    }
                    Reply::Hang => {
                        tokio::time::sleep(Duration::from_secs(60)).await;
                    }
                }
            });
        }
    });

    ScriptedServer {
        url: format!("http://{addr}/resource"),
        ranges,
    }
}

async fn read_request_head(socket: &mut tokio::net::TcpStream) -> String {
    let mut head = Vec::new();
    let mut buf = [0_u8; 1024];
    while !head.windows(4).any(|window| window == b"\r\n\r\n") {
        match socket.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => head.extend_from_slice(&buf[..n]),
        }
    }
    String::from_utf8_lossy(&head).into_owned()
}

fn response_head(status: u16, content_length: usize) -> Vec<u8> {
    let reason = reqwest::StatusCode::from_u16(status)
        .ok()
        .and_then(|code| code.canonical_reason())
        .unwrap_or("Unknown");
    format!(
        "HTTP/1.1 {status} {reason}\r\nContent-Length: {content_length}\r\nConnection: close\r\n\r\n"
    )
    .into_bytes()
}
