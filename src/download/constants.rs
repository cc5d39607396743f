//! Constants for the download module (timeouts, buffers, retry tuning).

use std::time::Duration;

/// Default HTTP connect timeout (30 seconds).
pub const CONNECT_TIMEOUT_SECS: u64 = 30;

/// Default initial per-attempt timeout (15 seconds).
pub const DEFAULT_TIMEOUT_SECS: u64 = 15;

/// Default number of attempts per segment, including the first one.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 10;

/// Amount added to the attempt timeout after a short-lived attempt.
pub const TIMEOUT_INCREMENT: Duration = Duration::from_secs(5);

/// Size of the read buffer used while streaming a segment.
pub const BUF_SIZE: usize = 4096;

/// Base delay for exponential backoff between attempts.
pub const BACKOFF_BASE_DELAY: Duration = Duration::from_millis(500);

/// Upper bound for a single backoff delay.
pub const BACKOFF_MAX_DELAY: Duration = Duration::from_secs(60);

/// Flash text shown when the idle watchdog fires.
pub const TIMEOUT_FLASH: &str = "Timeout...";

/// Flash text shown when a segment runs out of attempts.
pub const MAX_RETRY_FLASH: &str = "max retry reached";
