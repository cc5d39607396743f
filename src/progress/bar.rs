//! `indicatif` implementation of the progress sink.
//!
//! Every segment bar owns a render task that ticks on its own schedule and
//! is the only place decorators run. The download side only touches atomics
//! (indicatif's position/length), a briefly held sample lock and a [`Notify`].

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use tokio::sync::Notify;
use tracing::trace;

use super::gate::MessageGate;
use super::label::{DEFAULT_FLASH_TICKS, LabelRenderer};
use super::peak::PeakEstimator;
use super::sink::{
    Decorator, NoopSinkFactory, ProgressHandle, ProgressSink, SinkFactory, SinkRequest,
    Statistics,
};
use super::state::RetryState;

/// Default interval between render ticks.
pub const DEFAULT_TICK_INTERVAL: Duration = Duration::from_millis(120);

const KNOWN_TOTAL_TEMPLATE: &str =
    "{prefix:.bold} [{bar:32.cyan/blue}] {percent:>3}% {binary_bytes_per_sec:>12} {eta:>4} {msg}";
const UNKNOWN_TOTAL_TEMPLATE: &str =
    "{prefix:.bold} {spinner} {binary_bytes:>10} {binary_bytes_per_sec:>12} {msg}";
const TOTAL_TEMPLATE: &str =
    "{prefix:.bold} [{bar:32.green/white}] {binary_bytes}/{binary_total_bytes} {binary_bytes_per_sec:>12}";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum Phase {
    Running = 0,
    Completed = 1,
    Aborted = 2,
    Cleared = 3,
}

impl Phase {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Completed,
            2 => Self::Aborted,
            3 => Self::Cleared,
            _ => Self::Running,
        }
    }
}

/// Builds one indicatif bar plus render task per segment.
#[derive(Debug, Clone)]
pub struct BarFactory {
    multi: MultiProgress,
    retry_state: Arc<RetryState>,
    tick_interval: Duration,
    flash_ticks: u32,
    quiet: bool,
}

impl BarFactory {
    /// Creates a factory drawing into `multi`.
    #[must_use]
    pub fn new(multi: MultiProgress, retry_state: Arc<RetryState>) -> Self {
        Self {
            multi,
            retry_state,
            tick_interval: DEFAULT_TICK_INTERVAL,
            flash_ticks: DEFAULT_FLASH_TICKS,
            quiet: false,
        }
    }

    /// Sets the render tick interval.
    #[must_use]
    pub fn with_tick_interval(mut self, interval: Duration) -> Self {
        self.tick_interval = interval;
        self
    }

    /// Sets how many ticks a flash stays visible.
    #[must_use]
    pub fn with_flash_ticks(mut self, ticks: u32) -> Self {
        self.flash_ticks = ticks;
        self
    }

    /// Quiet factories draw nothing and drop every flash.
    #[must_use]
    pub fn quiet(mut self, quiet: bool) -> Self {
        self.quiet = quiet;
        self
    }

    /// Creates the aggregate bar spanning all segments.
    #[must_use]
    pub fn total_bar(&self, total: u64) -> TotalBar {
        let bar = if self.quiet {
            ProgressBar::hidden()
        } else {
            self.multi.add(ProgressBar::new(total))
        };
        bar.set_style(
            ProgressStyle::with_template(TOTAL_TEMPLATE)
                .unwrap_or_else(|_| ProgressStyle::default_bar()),
        );
        bar.set_prefix("Total");
        TotalBar { bar }
    }
}

impl SinkFactory for BarFactory {
    fn create(&self, request: SinkRequest) -> ProgressHandle {
        if self.quiet {
            return NoopSinkFactory.create(request);
        }

        let template = if request.total.is_some() {
            KNOWN_TOTAL_TEMPLATE
        } else {
            UNKNOWN_TOTAL_TEMPLATE
        };
        let bar = ProgressBar::new(request.total.unwrap_or(0))
            .with_position(request.position)
            .with_elapsed(request.elapsed);
        bar.set_style(
            ProgressStyle::with_template(template)
                .unwrap_or_else(|_| ProgressStyle::default_bar()),
        );
        let bar = self.multi.add(bar);

        let (gate, inbox) = MessageGate::channel();
        let label = LabelRenderer::new(
            request.name.clone(),
            inbox,
            Arc::clone(&self.retry_state),
            request.attempt,
        )
        .with_flash_ticks(self.flash_ticks);

        let shared = Arc::new(BarShared {
            label: Mutex::new(label),
            peak: Mutex::new(PeakEstimator::new()),
            phase: AtomicU8::new(Phase::Running as u8),
            wake: Notify::new(),
        });
        tokio::spawn(render_loop(
            bar.clone(),
            Arc::clone(&shared),
            self.tick_interval,
        ));
        trace!(segment = %request.name, "progress bar created");

        ProgressHandle {
            sink: Arc::new(SegmentBar { bar, shared }),
            gate,
        }
    }
}

#[derive(Debug)]
struct BarShared {
    label: Mutex<LabelRenderer>,
    peak: Mutex<PeakEstimator>,
    phase: AtomicU8,
    wake: Notify,
}

impl BarShared {
    fn phase(&self) -> Phase {
        Phase::from_u8(self.phase.load(Ordering::Acquire))
    }

    /// First terminal transition wins.
    fn end(&self, phase: Phase) {
        if self
            .phase
            .compare_exchange(
                Phase::Running as u8,
                phase as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
        {
            self.wake.notify_one();
        }
    }
}

/// Per-segment sink drawing an indicatif bar.
#[derive(Debug)]
pub struct SegmentBar {
    bar: ProgressBar,
    shared: Arc<BarShared>,
}

impl ProgressSink for SegmentBar {
    fn set_total(&self, total: u64, complete: bool) {
        self.bar.set_length(total);
        if complete {
            self.finish();
        }
    }

    fn set_position(&self, position: u64) {
        self.bar.set_position(position);
    }

    fn inc(&self, bytes: u64, elapsed: Duration) {
        self.bar.inc(bytes);
        self.shared
            .peak
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .ingest(bytes, elapsed);
    }

    fn finish(&self) {
        self.shared.end(Phase::Completed);
    }

    fn abort(&self, clear: bool) {
        self.shared
            .end(if clear { Phase::Cleared } else { Phase::Aborted });
    }
}

async fn render_loop(bar: ProgressBar, shared: Arc<BarShared>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            () = shared.wake.notified() => {}
        }

        let phase = shared.phase();
        let stats = Statistics {
            total: bar.length().unwrap_or(0),
            current: bar.position(),
            completed: phase == Phase::Completed,
            aborted: matches!(phase, Phase::Aborted | Phase::Cleared),
        };
        render_once(&bar, &shared, &stats);

        if phase == Phase::Running {
            continue;
        }

        shared
            .label
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .shutdown();
        shared
            .peak
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .shutdown();
        match phase {
            Phase::Completed => bar.finish(),
            Phase::Cleared => bar.finish_and_clear(),
            Phase::Aborted | Phase::Running => bar.abandon(),
        }
        break;
    }
}

fn render_once(bar: &ProgressBar, shared: &BarShared, stats: &Statistics) {
    let prefix = shared
        .label
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .render(stats);
    let peak = shared
        .peak
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .render(stats);

    bar.set_prefix(prefix);
    if peak.is_empty() {
        bar.set_message("");
    } else {
        bar.set_message(format!("Peak: {peak}"));
    }
}

/// Aggregate sink spanning every segment of one download.
#[derive(Debug, Clone)]
pub struct TotalBar {
    bar: ProgressBar,
}

impl TotalBar {
    /// Bytes accounted so far.
    #[must_use]
    pub fn position(&self) -> u64 {
        self.bar.position()
    }
}

impl ProgressSink for TotalBar {
    fn set_total(&self, total: u64, complete: bool) {
        self.bar.set_length(total);
        if complete {
            self.bar.finish();
        }
    }

    fn set_position(&self, position: u64) {
        self.bar.set_position(position);
    }

    fn inc(&self, bytes: u64, _elapsed: Duration) {
        self.bar.inc(bytes);
    }

    fn finish(&self) {
        self.bar.finish();
    }

    fn abort(&self, clear: bool) {
        if clear {
            self.bar.finish_and_clear();
        } else {
            self.bar.abandon();
        }
    }
}

#[cfg(test)]
mod tests {
    use indicatif::ProgressDrawTarget;

    use super::*;
    use crate::progress::state::AttemptCounter;

    fn hidden_factory() -> BarFactory {
        let multi = MultiProgress::with_draw_target(ProgressDrawTarget::hidden());
        BarFactory::new(multi, Arc::new(RetryState::new()))
            .with_tick_interval(Duration::from_millis(5))
            .with_flash_ticks(2)
    }

    fn request(total: Option<u64>) -> SinkRequest {
        SinkRequest {
            name: "P01".to_string(),
            order: 1,
            total,
            position: 0,
            elapsed: Duration::ZERO,
            attempt: AttemptCounter::new(),
        }
    }

    #[tokio::test]
    async fn test_final_flash_is_acknowledged_by_render_task() {
        let handle = hidden_factory().create(request(Some(100)));
        tokio::time::timeout(
            Duration::from_secs(2),
            handle.gate.final_flash("max retry reached"),
        )
        .await
        .ok();
        handle.sink.abort(false);
        assert!(tokio::time::timeout(Duration::from_secs(2), async {
            while !handle.gate.is_closed() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .is_ok());
    }

    #[tokio::test]
    async fn test_finish_stops_render_task_and_closes_gate() {
        let handle = hidden_factory().create(request(None));
        handle.sink.inc(10, Duration::from_millis(1));
        handle.sink.set_total(10, true);

        tokio::time::timeout(Duration::from_secs(2), async {
            while !handle.gate.is_closed() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .ok();
        assert!(handle.gate.is_closed());
        // gate closed: terminal flashes return immediately
        tokio::time::timeout(Duration::from_millis(100), handle.gate.final_flash("late"))
            .await
            .ok();
    }

    #[tokio::test]
    async fn test_quiet_factory_hands_out_quiet_gates() {
        let factory = hidden_factory().quiet(true);
        let handle = factory.create(request(Some(1)));
        assert!(handle.gate.is_closed());
    }

    #[tokio::test]
    async fn test_total_bar_counts_increments() {
        let factory = hidden_factory();
        let total = factory.total_bar(100);
        total.inc(40, Duration::ZERO);
        total.inc(2, Duration::ZERO);
        assert_eq!(total.position(), 42);
    }

    #[test]
    fn test_phase_first_terminal_transition_wins() {
        let (_gate, inbox) = MessageGate::channel();
        let shared = BarShared {
            label: Mutex::new(LabelRenderer::new(
                "P01",
                inbox,
                Arc::new(RetryState::new()),
                AttemptCounter::new(),
            )),
            peak: Mutex::new(PeakEstimator::new()),
            phase: AtomicU8::new(Phase::Running as u8),
            wake: Notify::new(),
        };
        shared.end(Phase::Completed);
        shared.end(Phase::Aborted);
        assert_eq!(shared.phase(), Phase::Completed);
    }
}
