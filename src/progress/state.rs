//! Cross-task retry signals read by every label renderer.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

/// Run-wide retry signal shared by all segments of one download.
///
/// Each segment task bumps the counter when it starts a retry; renderers only
/// read it. Once non-zero, every label switches to the `name:Rnn` form.
#[derive(Debug, Default)]
pub struct RetryState {
    retries: AtomicU32,
}

impl RetryState {
    /// Creates a state with no retries recorded.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records that some segment started a retry.
    pub fn record_retry(&self) {
        self.retries.fetch_add(1, Ordering::Relaxed);
    }

    /// True once any segment of the run has retried.
    #[must_use]
    pub fn any_retrying(&self) -> bool {
        self.retries.load(Ordering::Relaxed) != 0
    }

    /// Total retries recorded across the run.
    #[must_use]
    pub fn total_retries(&self) -> u32 {
        self.retries.load(Ordering::Relaxed)
    }
}

/// Current attempt index of one segment.
///
/// Written by the segment's own task, read by its renderer.
#[derive(Debug, Clone, Default)]
pub struct AttemptCounter(Arc<AtomicU32>);

impl AttemptCounter {
    /// Creates a counter at attempt 0.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Publishes the attempt index now running.
    pub fn set(&self, attempt: u32) {
        self.0.store(attempt, Ordering::Relaxed);
    }

    /// Reads the last published attempt index.
    #[must_use]
    pub fn get(&self) -> u32 {
        self.0.load(Ordering::Relaxed)
    }
}
