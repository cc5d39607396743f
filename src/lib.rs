//! Partfetch Core Library
//!
//! Resumable multi-segment HTTP downloads with live progress.
//!
//! # Architecture
//!
//! The library is organized into the following modules:
//! - [`download`] - Segment state machine, retry/backoff, HTTP client
//! - [`progress`] - Message gate, label renderer, peak estimator, sinks
//! - [`session`] - Splitting, persistence and assembly of parts

// Clippy lints - strict for library code
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod download;
pub mod progress;
pub mod session;

// Re-export commonly used types
pub use download::{
    Backoff, DownloadError, ExponentialBackoff, Segment, SegmentDownloader, SegmentState,
};
pub use progress::{BarFactory, MessageGate, NoopSinkFactory, ProgressSink, RetryState, SinkFactory};
pub use session::{Session, SessionError};
