//! Segment downloads: ranged requests streamed into part files.
//!
//! # Overview
//!
//! A resource is fetched as a set of [`Segment`]s, each driven by
//! [`SegmentDownloader::download`] in its own task. Transport faults are
//! retried with a ratcheting idle timeout and a pluggable [`Backoff`];
//! partial data survives across attempts through the `Range` header.
//!
//! # Example
//!
//! ```no_run
//! use std::time::Duration;
//! use partfetch_core::download::{ClientOptions, Segment, SegmentDownloader, build_client};
//! use partfetch_core::progress::NoopSinkFactory;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let client = build_client(&ClientOptions::default())?;
//! let request = client.get("https://example.com/big.iso").build()?;
//! let mut segment = Segment::new("P01", 1, "big.iso.part01", 0, Some(1_048_575));
//!
//! let state = SegmentDownloader::new(client)
//!     .download(&mut segment, &CancellationToken::new(), &NoopSinkFactory, &request, Duration::from_secs(15))
//!     .await?;
//! println!("{state}: {} bytes", segment.written);
//! # Ok(())
//! # }
//! ```

mod client;
pub mod constants;
mod downloader;
mod error;
mod retry;
mod segment;

pub use client::{ClientOptions, ProbeResult, build_client, default_user_agent, probe};
pub use downloader::{SegmentDownloader, SegmentState};
pub use error::DownloadError;
pub use retry::{Backoff, ExponentialBackoff, TimeoutRatchet};
pub use segment::Segment;
