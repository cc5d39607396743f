//! The unit of work: one byte range of a remote resource.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::constants::DEFAULT_MAX_ATTEMPTS;

/// One contiguous byte range `[start, stop]` of a resource and its part file.
///
/// The persisted fields (`file_name`, `start`, `stop`, `written`, `skip`,
/// `elapsed`) are what a session file stores between runs. `name`, `order`
/// and `max_attempts` are runtime settings and are rebuilt on load.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Segment {
    /// Part file the range is appended to.
    pub file_name: PathBuf,
    /// First byte of the range.
    pub start: u64,
    /// Last byte of the range (inclusive); `None` while the size is unknown.
    pub stop: Option<u64>,
    /// Bytes already written to `file_name`.
    pub written: u64,
    /// Set when another segment is fetching the whole resource.
    pub skip: bool,
    /// Accumulated time of attempts that wrote data.
    pub elapsed: Duration,

    /// Display name, e.g. `P01`.
    #[serde(skip)]
    pub name: String,
    /// 1-based position among sibling segments; 1 is the primary segment.
    #[serde(skip)]
    pub order: usize,
    /// Attempts allowed, including the first one.
    #[serde(skip, default = "default_max_attempts")]
    pub max_attempts: u32,
}

fn default_max_attempts() -> u32 {
    DEFAULT_MAX_ATTEMPTS
}

impl Segment {
    /// Creates a fresh segment covering `[start, stop]`.
    pub fn new(
        name: impl Into<String>,
        order: usize,
        file_name: impl Into<PathBuf>,
        start: u64,
        stop: Option<u64>,
    ) -> Self {
        Self {
            file_name: file_name.into(),
            start,
            stop,
            written: 0,
            skip: false,
            elapsed: Duration::ZERO,
            name: name.into(),
            order,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }

    /// Sets the attempt budget (at least one attempt is always made).
    #[must_use]
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    /// Target size of the segment, `None` when unknown.
    #[must_use]
    pub fn total(&self) -> Option<u64> {
        self.stop
            .filter(|stop| *stop >= self.start)
            .map(|stop| stop - self.start + 1)
    }

    /// True once every byte of a known-size segment has been written.
    #[must_use]
    pub fn is_done(&self) -> bool {
        self.written > 0 && Some(self.written) == self.total()
    }

    /// True for the first-ordinal segment, the one allowed to fall back to a
    /// whole-resource download when ranges are ignored.
    #[must_use]
    pub fn is_primary(&self) -> bool {
        self.order == 1
    }

    /// `Range` header value resuming after the bytes already written.
    #[must_use]
    pub fn range_header(&self) -> String {
        let from = self.start + self.written;
        match self.total().and(self.stop) {
            Some(stop) => format!("bytes={from}-{stop}"),
            None => format!("bytes={from}-"),
        }
    }

    /// Bytes left to fetch, `None` when the size is unknown.
    #[must_use]
    pub fn remaining(&self) -> Option<u64> {
        self.total().map(|total| total.saturating_sub(self.written))
    }
}
