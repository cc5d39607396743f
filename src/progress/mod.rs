//! Progress reporting for segment downloads.
//!
//! The downloader pushes byte counts into a [`ProgressSink`] and status text
//! into a [`MessageGate`]. Everything that turns those into display text runs
//! on a separate render task through the [`Decorator`] interface:
//!
//! - [`LabelRenderer`]: segment name, size and retry marker, with decaying
//!   flash overlays;
//! - [`PeakEstimator`]: best sustained throughput, frozen on completion.
//!
//! [`BarFactory`] wires both to `indicatif` bars; [`NoopSinkFactory`] is the
//! headless variant.

mod bar;
mod gate;
mod label;
mod peak;
mod sink;
mod state;

pub use bar::{BarFactory, DEFAULT_TICK_INTERVAL, SegmentBar, TotalBar};
pub use gate::{GATE_CAPACITY, MessageGate, MessageInbox, StatusMessage};
pub use label::{DEFAULT_FLASH_TICKS, LabelRenderer};
pub use peak::{PEAK_UNAVAILABLE, PeakEstimator};
pub use sink::{
    Decorator, NoopSink, NoopSinkFactory, ProgressHandle, ProgressSink, SinkFactory, SinkRequest,
    Statistics,
};
pub use state::{AttemptCounter, RetryState};
