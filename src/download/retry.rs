//! Backoff between attempts and the per-attempt timeout ratchet.
//!
//! # Overview
//!
//! Two independent knobs shape the segment attempt loop:
//!
//! - a [`Backoff`] policy decides how long to wait before the next attempt is
//!   issued. [`ExponentialBackoff`] is the stock implementation: the delay
//!   doubles from a 500ms base up to a cap, plus optional jitter, and starts
//!   over once an attempt has run longer than the reset window;
//! - a [`TimeoutRatchet`] decides the idle timeout of the next attempt:
//!   short-lived attempts earn 5 more seconds, a long-lived one resets it.
//!
//! # Example
//!
//! ```
//! use std::time::Duration;
//! use partfetch_core::download::{Backoff, ExponentialBackoff, TimeoutRatchet};
//!
//! let mut backoff = ExponentialBackoff::default().with_jitter(Duration::ZERO);
//! assert_eq!(backoff.next_delay(), Duration::from_millis(500));
//! assert_eq!(backoff.next_delay(), Duration::from_millis(1000));
//!
//! let mut ratchet = TimeoutRatchet::new(Duration::from_secs(10));
//! assert_eq!(ratchet.advance(Duration::from_secs(1)), Duration::from_secs(15));
//! assert_eq!(ratchet.advance(Duration::from_secs(40)), Duration::from_secs(10));
//! ```

use std::time::{Duration, Instant};

use rand::Rng;
use tracing::debug;

use super::constants::{BACKOFF_BASE_DELAY, BACKOFF_MAX_DELAY, TIMEOUT_INCREMENT};

/// Default backoff multiplier (doubles each attempt).
const DEFAULT_BACKOFF_MULTIPLIER: f32 = 2.0;

/// Default maximum jitter added to delays.
const DEFAULT_MAX_JITTER: Duration = Duration::from_millis(100);

/// Strategy producing the delay before the next attempt.
///
/// Implementations are stateful: one instance serves one segment's attempt
/// sequence and sees exactly one `next_delay` call per failed attempt.
pub trait Backoff: Send {
    /// Returns how long to wait before issuing the next attempt.
    fn next_delay(&mut self) -> Duration;
}

/// Exponential backoff with a cap, jitter and a reset window.
///
/// # Delay Calculation
///
/// ```text
/// delay = min(base_delay * multiplier^step, max_delay) + jitter
/// ```
///
/// `step` counts consecutive calls and drops back to zero when more than
/// `reset_after` has passed since the previous call.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    base_delay: Duration,
    max_delay: Duration,
    multiplier: f32,
    max_jitter: Duration,
    reset_after: Option<Duration>,
    step: u32,
    last_call: Option<Instant>,
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self {
            base_delay: BACKOFF_BASE_DELAY,
            max_delay: BACKOFF_MAX_DELAY,
            multiplier: DEFAULT_BACKOFF_MULTIPLIER,
            max_jitter: DEFAULT_MAX_JITTER,
            reset_after: None,
            step: 0,
            last_call: None,
        }
    }
}

impl ExponentialBackoff {
    /// Creates a backoff with a custom base delay and defaults elsewhere.
    #[must_use]
    pub fn new(base_delay: Duration) -> Self {
        Self {
            base_delay,
            ..Self::default()
        }
    }

    /// Sets the delay cap.
    #[must_use]
    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    /// Sets the upper bound of the random jitter (`Duration::ZERO` disables it).
    #[must_use]
    pub fn with_jitter(mut self, max_jitter: Duration) -> Self {
        self.max_jitter = max_jitter;
        self
    }

    /// Restarts the exponent once this much time passed between two calls.
    #[must_use]
    pub fn with_reset_after(mut self, reset_after: Duration) -> Self {
        self.reset_after = Some(reset_after);
        self
    }

    /// Returns the configured reset window, if any.
    #[must_use]
    pub fn reset_after(&self) -> Option<Duration> {
        self.reset_after
    }

    #[allow(
        clippy::cast_precision_loss,
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss
    )]
    fn calculate_delay(&self, step: u32) -> Duration {
        let base_ms = self.base_delay.as_millis() as f64;
        let delay_ms = base_ms * f64::from(self.multiplier).powi(step.min(31) as i32);
        let capped_ms = delay_ms.min(self.max_delay.as_millis() as f64);

        Duration::from_millis(capped_ms as u64) + self.calculate_jitter()
    }

    #[allow(clippy::cast_possible_truncation)]
    fn calculate_jitter(&self) -> Duration {
        if self.max_jitter.is_zero() {
            return Duration::ZERO;
        }
        let jitter_ms = rand::thread_rng().gen_range(0..=self.max_jitter.as_millis() as u64);
        Duration::from_millis(jitter_ms)
    }
}

impl Backoff for ExponentialBackoff {
    fn next_delay(&mut self) -> Duration {
        let now = Instant::now();
        if let (Some(window), Some(last)) = (self.reset_after, self.last_call)
            && now.duration_since(last) >= window
        {
            debug!(window_ms = window.as_millis(), "backoff reset after sustained attempt");
            self.step = 0;
        }
        self.last_call = Some(now);

        let delay = self.calculate_delay(self.step);
        self.step = self.step.saturating_add(1);
        delay
    }
}

/// Per-attempt timeout that grows for short attempts and resets for long ones.
///
/// Given an initial timeout `T`: if the previous attempt ran for less than
/// `2T` the next timeout is the previous one plus 5 seconds, otherwise it is
/// `T` again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeoutRatchet {
    initial: Duration,
    current: Duration,
}

impl TimeoutRatchet {
    /// Creates a ratchet starting at `initial`.
    #[must_use]
    pub fn new(initial: Duration) -> Self {
        Self {
            initial,
            current: initial,
        }
    }

    /// Returns the timeout of the current attempt.
    #[must_use]
    pub fn current(&self) -> Duration {
        self.current
    }

    /// Returns the window after which the timeout (and backoff) resets.
    #[must_use]
    pub fn reset_window(&self) -> Duration {
        self.initial * 2
    }

    /// Moves to the next attempt given how long the previous one ran.
    pub fn advance(&mut self, previous_ran_for: Duration) -> Duration {
        if previous_ran_for < self.reset_window() {
            self.current += TIMEOUT_INCREMENT;
        } else {
            self.current = self.initial;
        }
        self.current
    }
}
