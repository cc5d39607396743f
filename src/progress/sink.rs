//! Interfaces between the segment downloader and whatever displays it.

use std::sync::Arc;
use std::time::Duration;

use super::gate::MessageGate;
use super::state::AttemptCounter;

/// Snapshot of a sink's counters handed to decorators on each render tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Statistics {
    /// Total size in bytes; 0 while unknown.
    pub total: u64,
    /// Bytes accounted so far.
    pub current: u64,
    /// The sink was finished successfully.
    pub completed: bool,
    /// The sink was aborted.
    pub aborted: bool,
}

/// A piece of display text derived from [`Statistics`].
///
/// Render calls come from the render task only and must not do network or
/// disk I/O.
pub trait Decorator: Send {
    /// Produces the text for the current tick.
    fn render(&mut self, stats: &Statistics) -> String;

    /// Receives a sample of `bytes` transferred in `elapsed`.
    fn ingest(&mut self, _bytes: u64, _elapsed: Duration) {}

    /// Called once when the sink is done; must release any waiting producer.
    fn shutdown(&mut self) {}
}

/// Progress receiver for one segment (or the aggregate of all of them).
pub trait ProgressSink: Send + Sync {
    /// Updates the total size. `complete` marks the transfer as finished.
    fn set_total(&self, total: u64, complete: bool);

    /// Moves the current position, e.g. to the resume offset.
    fn set_position(&self, position: u64);

    /// Accounts `bytes` that took `elapsed` to arrive.
    fn inc(&self, bytes: u64, elapsed: Duration);

    /// Marks the transfer successfully completed.
    fn finish(&self);

    /// Marks the transfer aborted; `clear` removes it from the display.
    fn abort(&self, clear: bool);
}

/// What a [`SinkFactory`] needs to know to build a segment's sink.
#[derive(Debug, Clone)]
pub struct SinkRequest {
    /// Segment display name.
    pub name: String,
    /// Segment ordinal, used for display ordering.
    pub order: usize,
    /// Target size when known.
    pub total: Option<u64>,
    /// Bytes already on disk.
    pub position: u64,
    /// Time already spent on earlier runs.
    pub elapsed: Duration,
    /// The segment's live attempt index.
    pub attempt: AttemptCounter,
}

/// A segment's sink plus the gate feeding its label.
#[derive(Clone)]
pub struct ProgressHandle {
    /// Counter receiver.
    pub sink: Arc<dyn ProgressSink>,
    /// Status message producer.
    pub gate: MessageGate,
}

impl std::fmt::Debug for ProgressHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgressHandle")
            .field("gate", &self.gate)
            .finish_non_exhaustive()
    }
}

/// Builds sinks lazily, on a segment's first successful response.
pub trait SinkFactory: Send + Sync {
    /// Creates the sink and gate for one segment.
    fn create(&self, request: SinkRequest) -> ProgressHandle;
}

/// Sink that ignores everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSink;

impl ProgressSink for NoopSink {
    fn set_total(&self, _total: u64, _complete: bool) {}
    fn set_position(&self, _position: u64) {}
    fn inc(&self, _bytes: u64, _elapsed: Duration) {}
    fn finish(&self) {}
    fn abort(&self, _clear: bool) {}
}

/// Factory producing [`NoopSink`]s with quiet gates.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSinkFactory;

impl SinkFactory for NoopSinkFactory {
    fn create(&self, _request: SinkRequest) -> ProgressHandle {
        ProgressHandle {
            sink: Arc::new(NoopSink),
            gate: MessageGate::quiet(),
        }
    }
}
