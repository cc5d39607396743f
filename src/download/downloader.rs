//! The per-segment download state machine.
//!
//! ```text
//! Dialing ──► HeaderReceived ──► Streaming ──► Completed
//!    ▲             │                 │
//!    │             ├─► Skipped       ├─► Restarting ─┐
//!    │             └─► Aborted       └─► Aborted     │
//!    └───────────────────────────────────────────────┘
//! ```
//!
//! One [`SegmentDownloader::download`] call drives one segment to a terminal
//! state. Every attempt clones the request template, sets the `Range` header
//! from the segment's resume offset and streams the body into the part file.
//! Transport faults are retried with a ratcheting idle timeout and a backoff
//! delay; protocol outcomes are not.

use std::fmt;
use std::future::Future;
use std::io;
use std::path::Path;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::TryStreamExt;
use reqwest::header::{HeaderValue, RANGE};
use reqwest::{Client, Request, Response, StatusCode};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::time::Sleep;
use tokio_util::io::StreamReader;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, trace, warn};

use super::constants::{BUF_SIZE, MAX_RETRY_FLASH, TIMEOUT_FLASH};
use super::error::DownloadError;
use super::retry::{Backoff, ExponentialBackoff, TimeoutRatchet};
use super::segment::Segment;
use crate::progress::{AttemptCounter, ProgressHandle, ProgressSink, RetryState, SinkFactory, SinkRequest};

/// Observable states of a segment download.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentState {
    /// Request issued, waiting for headers.
    Dialing,
    /// Status line and headers received.
    HeaderReceived,
    /// Body bytes are being appended to the part file.
    Streaming,
    /// Partial data of a non-ranged response was discarded.
    Restarting,
    /// Every byte of the segment is on disk.
    Completed,
    /// Another segment fetches the whole resource; the part file is gone.
    Skipped,
    /// The segment failed for good.
    Aborted,
}

impl SegmentState {
    /// True for states a download call can return in.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Skipped | Self::Aborted)
    }
}

impl fmt::Display for SegmentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Dialing => "dialing",
            Self::HeaderReceived => "header-received",
            Self::Streaming => "streaming",
            Self::Restarting => "restarting",
            Self::Completed => "completed",
            Self::Skipped => "skipped",
            Self::Aborted => "aborted",
        };
        f.write_str(name)
    }
}

/// Downloads segments of one resource.
///
/// Cheap to clone: the HTTP client, aggregate sink and retry state are
/// shared, the backoff template is copied into every call.
#[derive(Clone)]
pub struct SegmentDownloader {
    client: Client,
    aggregate: Option<Arc<dyn ProgressSink>>,
    retry_state: Arc<RetryState>,
    backoff: ExponentialBackoff,
}

impl fmt::Debug for SegmentDownloader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SegmentDownloader")
            .field("aggregate", &self.aggregate.is_some())
            .field("retry_state", &self.retry_state)
            .field("backoff", &self.backoff)
            .finish_non_exhaustive()
    }
}

impl SegmentDownloader {
    /// Creates a downloader with the default backoff and no aggregate sink.
    #[must_use]
    pub fn new(client: Client) -> Self {
        Self {
            client,
            aggregate: None,
            retry_state: Arc::new(RetryState::new()),
            backoff: ExponentialBackoff::default(),
        }
    }

    /// Counts every streamed byte into `sink` as well.
    #[must_use]
    pub fn with_aggregate(mut self, sink: Arc<dyn ProgressSink>) -> Self {
        self.aggregate = Some(sink);
        self
    }

    /// Shares the run-wide retry signal with the renderers.
    #[must_use]
    pub fn with_retry_state(mut self, retry_state: Arc<RetryState>) -> Self {
        self.retry_state = retry_state;
        self
    }

    /// Replaces the backoff template used by [`download`](Self::download).
    #[must_use]
    pub fn with_backoff(mut self, backoff: ExponentialBackoff) -> Self {
        self.backoff = backoff;
        self
    }

    /// The run-wide retry signal.
    #[must_use]
    pub fn retry_state(&self) -> &Arc<RetryState> {
        &self.retry_state
    }

    /// Drives `segment` to a terminal state.
    ///
    /// The backoff template is reset after `2 × initial_timeout` of sustained
    /// attempt time.
    ///
    /// # Errors
    ///
    /// See [`download_with_backoff`](Self::download_with_backoff).
    pub async fn download(
        &self,
        segment: &mut Segment,
        scope: &CancellationToken,
        sinks: &dyn SinkFactory,
        request: &Request,
        initial_timeout: Duration,
    ) -> Result<SegmentState, DownloadError> {
        let mut backoff = self
            .backoff
            .clone()
            .with_reset_after(TimeoutRatchet::new(initial_timeout).reset_window());
        self.download_with_backoff(segment, scope, sinks, request, initial_timeout, &mut backoff)
            .await
    }

    /// Drives `segment` to a terminal state using a caller-supplied backoff.
    ///
    /// Returns [`SegmentState::Completed`] or [`SegmentState::Skipped`].
    ///
    /// # Errors
    ///
    /// - [`DownloadError::Http`] for statuses other than 200/206
    /// - [`DownloadError::RetriesExhausted`] once `segment.max_attempts`
    ///   transport failures happened
    /// - [`DownloadError::Cancelled`] when `scope` is cancelled
    /// - [`DownloadError::Io`] / [`DownloadError::Incomplete`] for fatal faults
    /// - [`DownloadError::Request`] when the template cannot be cloned
    #[instrument(
        skip_all,
        fields(segment = %segment.name, start = segment.start, stop = ?segment.stop)
    )]
    pub async fn download_with_backoff(
        &self,
        segment: &mut Segment,
        scope: &CancellationToken,
        sinks: &dyn SinkFactory,
        request: &Request,
        initial_timeout: Duration,
        backoff: &mut dyn Backoff,
    ) -> Result<SegmentState, DownloadError> {
        if segment.skip {
            remove_part_file(&segment.file_name).await?;
            debug!(state = %SegmentState::Skipped, "segment skipped in an earlier run");
            return Ok(SegmentState::Skipped);
        }
        if segment.is_done() {
            debug!(state = %SegmentState::Completed, written = segment.written, "segment already complete");
            return Ok(SegmentState::Completed);
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&segment.file_name)
            .await
            .map_err(|e| DownloadError::io(&segment.file_name, e))?;

        let mut run = SegmentRun {
            url: request.url().to_string(),
            handle: None,
            attempt: AttemptCounter::new(),
        };
        let outcome = self
            .attempt_loop(segment, &mut file, &mut run, scope, sinks, request, initial_timeout, backoff)
            .await;

        let flushed = file
            .flush()
            .await
            .map_err(|e| DownloadError::io(&segment.file_name, e));
        drop(file);

        let outcome = match (outcome, flushed) {
            (Ok(SegmentState::Skipped), _) => remove_part_file(&segment.file_name)
                .await
                .map(|()| SegmentState::Skipped),
            (Ok(state), Ok(())) => Ok(state),
            (Ok(_), Err(e)) | (Err(e), _) => Err(e),
        };

        match &outcome {
            Ok(state) => info!(state = %state, written = segment.written, "segment finished"),
            Err(error) => {
                if let Some(handle) = &run.handle {
                    if !flashed_on_failure(error) {
                        handle.gate.final_flash(error.to_string()).await;
                    }
                    handle.sink.abort(false);
                }
                warn!(state = %SegmentState::Aborted, error = %error, written = segment.written, "segment aborted");
            }
        }
        outcome
    }

    #[allow(clippy::too_many_arguments)]
    async fn attempt_loop(
        &self,
        segment: &mut Segment,
        file: &mut File,
        run: &mut SegmentRun,
        scope: &CancellationToken,
        sinks: &dyn SinkFactory,
        request: &Request,
        initial_timeout: Duration,
        backoff: &mut dyn Backoff,
    ) -> Result<SegmentState, DownloadError> {
        let mut ratchet = TimeoutRatchet::new(initial_timeout);
        let mut previous_ran_for = Duration::ZERO;
        let mut index: u32 = 0;

        loop {
            if index > 0 {
                ratchet.advance(previous_ran_for);
                self.retry_state.record_retry();
                run.attempt.set(index);

                let delay = backoff.next_delay();
                debug!(
                    attempt = index,
                    delay_ms = delay.as_millis(),
                    timeout_ms = ratchet.current().as_millis(),
                    "waiting before next attempt"
                );
                tokio::select! {
                    () = scope.cancelled() => return Err(DownloadError::Cancelled),
                    () = tokio::time::sleep(delay) => {}
                }
            }
            if scope.is_cancelled() {
                return Err(DownloadError::Cancelled);
            }

            let mut record = AttemptRecord {
                index,
                timeout: ratchet.current(),
                written_at_start: segment.written,
                started: Instant::now(),
                bytes: 0,
                status: None,
            };
            let result = self
                .attempt(segment, file, run, scope, sinks, request, &mut record)
                .await;

            previous_ran_for = record.started.elapsed();
            if record.bytes > 0 {
                segment.elapsed += previous_ran_for;
            }

            let error = match result {
                Ok(state) => return Ok(state),
                Err(error) if error.is_retryable() => error,
                Err(error) => return Err(error),
            };

            if let (DownloadError::Timeout { .. }, Some(handle)) = (&error, &run.handle) {
                handle.gate.flash(TIMEOUT_FLASH);
            }
            warn!(
                attempt = index,
                bytes = record.bytes,
                ran_for_ms = previous_ran_for.as_millis(),
                error = %error,
                "attempt failed"
            );

            if index + 1 >= segment.max_attempts {
                if let Some(handle) = &run.handle {
                    handle.gate.final_flash(MAX_RETRY_FLASH).await;
                    handle.sink.abort(false);
                }
                return Err(DownloadError::retries_exhausted(index + 1, error));
            }

            // a non-ranged body cannot be resumed
            if record.status.is_some_and(|status| status != StatusCode::PARTIAL_CONTENT)
                && segment.written > 0
            {
                debug!(
                    state = %SegmentState::Restarting,
                    discarded = segment.written,
                    since = record.written_at_start,
                    "discarding partial data"
                );
                truncate_part_file(file, &segment.file_name).await?;
                segment.written = 0;
                if let Some(handle) = &run.handle {
                    handle.sink.set_position(0);
                }
            }

            index += 1;
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn attempt(
        &self,
        segment: &mut Segment,
        file: &mut File,
        run: &mut SegmentRun,
        scope: &CancellationToken,
        sinks: &dyn SinkFactory,
        request: &Request,
        record: &mut AttemptRecord,
    ) -> Result<SegmentState, DownloadError> {
        let mut watchdog = IdleWatchdog::new(scope.child_token(), record.timeout, &run.url);

        let mut request = request
            .try_clone()
            .ok_or_else(|| DownloadError::request("request body cannot be replayed"))?;
        let range = segment.range_header();
        request.headers_mut().insert(
            RANGE,
            HeaderValue::from_str(&range).map_err(|e| DownloadError::request(e.to_string()))?,
        );

        debug!(state = %SegmentState::Dialing, attempt = record.index, range = %range, timeout_ms = record.timeout.as_millis(), "sending request");
        let response = watchdog
            .guard(scope, self.client.execute(request))
            .await?
            .map_err(|e| DownloadError::network(&run.url, e))?;

        let status = response.status();
        record.status = Some(status);
        debug!(state = %SegmentState::HeaderReceived, status = status.as_u16(), "response headers received");

        match status {
            StatusCode::PARTIAL_CONTENT => {}
            StatusCode::OK if !segment.is_primary() => {
                info!("server ignored the range; another segment fetches the whole resource");
                segment.skip = true;
                return Ok(SegmentState::Skipped);
            }
            StatusCode::OK => {
                self.fall_back_to_whole_resource(segment, file, run, &response, record.index)
                    .await?;
            }
            StatusCode::FORBIDDEN | StatusCode::TOO_MANY_REQUESTS => {
                let text = status.to_string();
                if let Some(handle) = &run.handle {
                    handle.gate.final_flash(text.clone()).await;
                }
                return Err(DownloadError::http(status.as_u16(), text));
            }
            other => return Err(DownloadError::http(other.as_u16(), other.to_string())),
        }

        let handle = run.sink(segment, sinks);
        if let Some(total) = segment.total() {
            handle.sink.set_total(total, false);
        }

        debug!(state = %SegmentState::Streaming, written = segment.written, "streaming body");
        watchdog.rearm();
        let body = response.bytes_stream().map_err(io::Error::other);
        let mut reader = StreamReader::new(Box::pin(body));
        let mut buf = vec![0_u8; BUF_SIZE];

        loop {
            let read_started = Instant::now();
            let (n, read) = watchdog
                .guard(scope, read_full(&mut reader, &mut buf))
                .await?;
            let took = read_started.elapsed();

            if n > 0 {
                file.write_all(&buf[..n])
                    .await
                    .map_err(|e| DownloadError::io(&segment.file_name, e))?;
                let n = n as u64;
                if let Some(aggregate) = &self.aggregate {
                    aggregate.inc(n, took);
                }
                handle.sink.inc(n, took);
                segment.written += n;
                record.bytes += n;
                if segment.total().is_none() {
                    handle.sink.set_total(segment.written, false);
                }
                trace!(bytes = n, written = segment.written, "chunk written");
            }

            if read.map_err(|e| DownloadError::stream(&run.url, e))? {
                break;
            }
            watchdog.rearm();
        }

        match segment.total() {
            Some(total) if segment.written != total => Err(DownloadError::Incomplete {
                path: segment.file_name.clone(),
                expected: total,
                written: segment.written,
            }),
            Some(total) => {
                handle.sink.set_total(total, true);
                Ok(SegmentState::Completed)
            }
            None => {
                // the size is known now
                if segment.written > 0 {
                    segment.stop = Some(segment.start + segment.written - 1);
                }
                handle.sink.set_total(segment.written, true);
                Ok(SegmentState::Completed)
            }
        }
    }

    /// The primary segment takes over the whole resource after a 200.
    async fn fall_back_to_whole_resource(
        &self,
        segment: &mut Segment,
        file: &mut File,
        run: &SegmentRun,
        response: &Response,
        index: u32,
    ) -> Result<(), DownloadError> {
        if index == 0
            && let Some(aggregate) = &self.aggregate
        {
            aggregate.abort(true);
        }

        segment.stop = response
            .content_length()
            .filter(|len| *len > 0)
            .map(|len| segment.start + len - 1);
        info!(stop = ?segment.stop, "server ignored the range; fetching the whole resource");

        if segment.written > 0 {
            truncate_part_file(file, &segment.file_name).await?;
            if let Some(handle) = &run.handle {
                handle.sink.set_position(0);
            }
        }
        segment.written = 0;
        Ok(())
    }
}

/// State that outlives a single attempt.
struct SegmentRun {
    url: String,
    handle: Option<ProgressHandle>,
    attempt: AttemptCounter,
}

impl SegmentRun {
    /// Creates the segment's sink on first use.
    fn sink(&mut self, segment: &Segment, sinks: &dyn SinkFactory) -> ProgressHandle {
        self.handle
            .get_or_insert_with(|| {
                let handle = sinks.create(SinkRequest {
                    name: segment.name.clone(),
                    order: segment.order,
                    total: segment.total(),
                    position: segment.written,
                    elapsed: segment.elapsed,
                    attempt: self.attempt.clone(),
                });
                handle.sink.set_position(segment.written);
                handle
            })
            .clone()
    }
}

#[derive(Debug)]
struct AttemptRecord {
    index: u32,
    timeout: Duration,
    written_at_start: u64,
    started: Instant,
    bytes: u64,
    status: Option<StatusCode>,
}

/// One idle timer per attempt; firing cancels the attempt's scope.
struct IdleWatchdog {
    attempt_scope: CancellationToken,
    sleep: Pin<Box<Sleep>>,
    timeout: Duration,
    url: String,
}

impl IdleWatchdog {
    fn new(attempt_scope: CancellationToken, timeout: Duration, url: &str) -> Self {
        Self {
            attempt_scope,
            sleep: Box::pin(tokio::time::sleep(timeout)),
            timeout,
            url: url.to_string(),
        }
    }

    fn rearm(&mut self) {
        self.sleep
            .as_mut()
            .reset(tokio::time::Instant::now() + self.timeout);
    }

    /// Runs `operation` unless the outer scope is cancelled or the timer fires.
    async fn guard<F: Future>(
        &mut self,
        outer: &CancellationToken,
        operation: F,
    ) -> Result<F::Output, DownloadError> {
        tokio::select! {
            biased;
            () = outer.cancelled() => Err(DownloadError::Cancelled),
            () = self.attempt_scope.cancelled() => Err(DownloadError::timeout(&self.url, self.timeout)),
            () = &mut self.sleep => {
                self.attempt_scope.cancel();
                Err(DownloadError::timeout(&self.url, self.timeout))
            }
            output = operation => Ok(output),
        }
    }
}

/// True for errors whose notice the attempt loop already showed.
fn flashed_on_failure(error: &DownloadError) -> bool {
    matches!(
        error,
        DownloadError::RetriesExhausted { .. } | DownloadError::Http { code: 403 | 429, .. }
    )
}

/// Fills `buf` completely unless the stream ends or fails first.
///
/// Returns the bytes read alongside whether EOF was reached. Bytes that
/// arrived before a read error are still reported.
async fn read_full<R: AsyncRead + Unpin>(
    reader: &mut R,
    buf: &mut [u8],
) -> (usize, io::Result<bool>) {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]).await {
            Ok(0) => return (filled, Ok(true)),
            Ok(n) => filled += n,
            Err(e) => return (filled, Err(e)),
        }
    }
    (filled, Ok(false))
}

async fn truncate_part_file(file: &mut File, path: &Path) -> Result<(), DownloadError> {
    file.flush().await.map_err(|e| DownloadError::io(path, e))?;
    *file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(path)
        .await
        .map_err(|e| DownloadError::io(path, e))?;
    Ok(())
}

async fn remove_part_file(path: &Path) -> Result<(), DownloadError> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(DownloadError::io(path, e)),
    }
}
