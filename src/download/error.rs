//! Error types for the download module.
//!
//! Errors fall into three groups that the segment downloader treats
//! differently:
//!
//! - retryable transport faults ([`Network`](DownloadError::Network),
//!   [`Stream`](DownloadError::Stream), [`Timeout`](DownloadError::Timeout)),
//!   consumed by the attempt loop until attempts run out;
//! - terminal protocol outcomes ([`Http`](DownloadError::Http),
//!   [`RetriesExhausted`](DownloadError::RetriesExhausted),
//!   [`Cancelled`](DownloadError::Cancelled));
//! - fatal faults ([`Io`](DownloadError::Io),
//!   [`Incomplete`](DownloadError::Incomplete)) that retrying cannot fix and
//!   that callers must treat as a segment abort.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Errors that can occur while downloading a segment.
#[derive(Debug, Error)]
pub enum DownloadError {
    /// Server answered with a status outside the accepted set.
    #[error("HTTP {code}: {status_text}")]
    Http {
        /// The HTTP status code.
        code: u16,
        /// Status line text, e.g. `403 Forbidden`.
        status_text: String,
    },

    /// The segment used up all of its attempts.
    #[error("max retry reached after {attempts} attempts: {source}")]
    RetriesExhausted {
        /// Number of attempts that were made.
        attempts: u32,
        /// The failure of the last attempt.
        #[source]
        source: Box<DownloadError>,
    },

    /// Connection-level error (DNS, refused, reset, TLS) before headers arrived.
    #[error("network error fetching {url}: {source}")]
    Network {
        /// The URL being fetched.
        url: String,
        /// The underlying client error.
        #[source]
        source: reqwest::Error,
    },

    /// The response body broke off mid-transfer.
    #[error("stream error fetching {url}: {source}")]
    Stream {
        /// The URL being fetched.
        url: String,
        /// The underlying read error.
        #[source]
        source: std::io::Error,
    },

    /// The idle watchdog fired.
    #[error("no data from {url} for {after:?}")]
    Timeout {
        /// The URL being fetched.
        url: String,
        /// The idle period that elapsed.
        after: Duration,
    },

    /// The caller's cancellation scope was cancelled.
    #[error("download cancelled")]
    Cancelled,

    /// Local file system failure. Never retried.
    #[error("IO error on {path}: {source}")]
    Io {
        /// The file path where the error occurred.
        path: PathBuf,
        /// The underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// The stream reached EOF short of the agreed byte count.
    #[error("stream for {path} ended after {written} of {expected} bytes")]
    Incomplete {
        /// Segment part file.
        path: PathBuf,
        /// Target size of the segment.
        expected: u64,
        /// Bytes actually written.
        written: u64,
    },

    /// The request template cannot be reused for another attempt.
    #[error("invalid request: {reason}")]
    Request {
        /// Why the request was rejected.
        reason: String,
    },
}

impl DownloadError {
    /// Creates an HTTP status error.
    pub fn http(code: u16, status_text: impl Into<String>) -> Self {
        Self::Http {
            code,
            status_text: status_text.into(),
        }
    }

    /// Wraps the last cause into a retries-exhausted error.
    pub fn retries_exhausted(attempts: u32, cause: DownloadError) -> Self {
        Self::RetriesExhausted {
            attempts,
            source: Box::new(cause),
        }
    }

    /// Creates a network error from a reqwest error.
    pub fn network(url: impl Into<String>, source: reqwest::Error) -> Self {
        Self::Network {
            url: url.into(),
            source,
        }
    }

    /// Creates a body stream error.
    pub fn stream(url: impl Into<String>, source: std::io::Error) -> Self {
        Self::Stream {
            url: url.into(),
            source,
        }
    }

    /// Creates an idle timeout error.
    pub fn timeout(url: impl Into<String>, after: Duration) -> Self {
        Self::Timeout {
            url: url.into(),
            after,
        }
    }

    /// Creates an IO error.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Creates an invalid request error.
    pub fn request(reason: impl Into<String>) -> Self {
        Self::Request {
            reason: reason.into(),
        }
    }

    /// Returns true for faults the attempt loop may retry.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Network { .. } | Self::Stream { .. } | Self::Timeout { .. }
        )
    }

    /// Returns true for faults that must abort the segment without retry.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Io { .. } | Self::Incomplete { .. })
    }

    /// Returns the HTTP status code for [`Http`](Self::Http) errors.
    #[must_use]
    pub fn status_code(&self) -> Option<u16> {
        match self {
            Self::Http { code, .. } => Some(*code),
            _ => None,
        }
    }
}

// No `From<reqwest::Error>` / `From<std::io::Error>`: every variant needs the
// url or path that the source error does not carry.
