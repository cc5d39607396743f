//! Persistent segment label with decaying flash overlays.

use std::collections::VecDeque;
use std::sync::Arc;

use indicatif::HumanBytes;

use super::gate::{MessageInbox, StatusMessage};
use super::sink::{Decorator, Statistics};
use super::state::{AttemptCounter, RetryState};

/// Default number of render ticks a flash stays visible.
pub const DEFAULT_FLASH_TICKS: u32 = 15;

/// Renders `name size` (or `name:Rnn size` once the run has retries) and
/// overlays flashed messages on top of it.
///
/// Tick rules:
/// - an active message with ticks left is shown and loses one tick;
/// - an active final message out of ticks is acknowledged and stays shown;
/// - an active non-final message out of ticks is dropped;
/// - otherwise newly arrived messages are drained and the oldest pending one
///   becomes active with a fresh tick budget;
/// - with nothing to flash the persistent label is shown.
#[derive(Debug)]
pub struct LabelRenderer {
    name: String,
    inbox: MessageInbox,
    pending: VecDeque<StatusMessage>,
    active: Option<StatusMessage>,
    flash_ticks: u32,
    retry_state: Arc<RetryState>,
    attempt: AttemptCounter,
}

impl LabelRenderer {
    /// Creates a renderer reading flashes from `inbox`.
    pub fn new(
        name: impl Into<String>,
        inbox: MessageInbox,
        retry_state: Arc<RetryState>,
        attempt: AttemptCounter,
    ) -> Self {
        Self {
            name: name.into(),
            inbox,
            pending: VecDeque::new(),
            active: None,
            flash_ticks: DEFAULT_FLASH_TICKS,
            retry_state,
            attempt,
        }
    }

    /// Sets how many ticks a flash stays visible (at least one).
    #[must_use]
    pub fn with_flash_ticks(mut self, ticks: u32) -> Self {
        self.flash_ticks = ticks.max(1);
        self
    }

    /// The label shown when no flash is active.
    #[must_use]
    pub fn persistent_label(&self, stats: &Statistics) -> String {
        let size = HumanBytes(stats.total);
        if self.retry_state.any_retrying() {
            format!("{}:R{:02} {size}", self.name, self.attempt.get())
        } else {
            format!("{} {size}", self.name)
        }
    }

    fn show_active(&mut self) -> Option<String> {
        let active = self.active.as_mut()?;
        if active.tick() {
            return Some(active.text().to_string());
        }
        if active.is_final() {
            active.acknowledge();
            return Some(active.text().to_string());
        }
        self.active = None;
        None
    }
}

impl Decorator for LabelRenderer {
    fn render(&mut self, stats: &Statistics) -> String {
        if let Some(text) = self.show_active() {
            return text;
        }

        self.inbox.drain_into(&mut self.pending);
        if let Some(mut next) = self.pending.pop_front() {
            next.set_remaining(self.flash_ticks);
            self.active = Some(next);
            if let Some(text) = self.show_active() {
                return text;
            }
        }

        self.persistent_label(stats)
    }

    fn shutdown(&mut self) {
        self.inbox.close();
        self.inbox.drain_into(&mut self.pending);
        if let Some(active) = self.active.as_mut() {
            active.acknowledge();
        }
        for message in &mut self.pending {
            message.acknowledge();
        }
    }
}
