//! Message gate: the only backpressured handoff between a segment task and its
//! renderer.
//!
//! The producer half ([`MessageGate`]) lives in the downloader, the consumer
//! half ([`MessageInbox`]) inside the label renderer. A bounded channel
//! (capacity [`GATE_CAPACITY`]) decouples them. Final messages carry a
//! one-shot acknowledgement the producer waits on.
//!
//! # Shutdown
//!
//! Closing or dropping the inbox is the shutdown signal. After it, sends fail
//! at once and any acknowledgement still held by a dropped message resolves
//! the waiting producer, so [`MessageGate::final_flash`] can be called safely
//! even after the renderer stopped ticking.

use std::collections::VecDeque;

use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tracing::trace;

/// Mailbox capacity between producer and renderer.
pub const GATE_CAPACITY: usize = 4;

/// A transient status text overlaid on a segment label.
#[derive(Debug)]
pub struct StatusMessage {
    text: String,
    remaining: u32,
    ack: Option<oneshot::Sender<()>>,
    is_final: bool,
}

impl StatusMessage {
    /// Creates a non-final message.
    pub fn transient(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            remaining: 0,
            ack: None,
            is_final: false,
        }
    }

    /// Creates a final message and the receiver its producer waits on.
    pub fn terminal(text: impl Into<String>) -> (Self, oneshot::Receiver<()>) {
        let (tx, rx) = oneshot::channel();
        let message = Self {
            text: text.into(),
            remaining: 0,
            ack: Some(tx),
            is_final: true,
        };
        (message, rx)
    }

    /// The text to display.
    #[must_use]
    pub fn text(&self) -> &str {
        &self.text
    }

    /// True for messages whose display is guaranteed before the producer moves on.
    #[must_use]
    pub fn is_final(&self) -> bool {
        self.is_final
    }

    /// Render ticks left before the message decays.
    #[must_use]
    pub fn remaining(&self) -> u32 {
        self.remaining
    }

    pub(crate) fn set_remaining(&mut self, ticks: u32) {
        self.remaining = ticks;
    }

    /// Consumes one tick of display time. Returns false if none was left.
    pub(crate) fn tick(&mut self) -> bool {
        if self.remaining == 0 {
            return false;
        }
        self.remaining -= 1;
        true
    }

    /// Releases a producer blocked in [`MessageGate::final_flash`]. Idempotent.
    pub fn acknowledge(&mut self) {
        if let Some(ack) = self.ack.take() {
            // producer may have given up already
            let _ = ack.send(());
        }
    }
}

/// Producer half of the gate, held by the segment downloader.
#[derive(Debug, Clone)]
pub struct MessageGate {
    tx: Option<mpsc::Sender<StatusMessage>>,
}

impl MessageGate {
    /// Creates a connected gate/inbox pair.
    #[must_use]
    pub fn channel() -> (MessageGate, MessageInbox) {
        let (tx, rx) = mpsc::channel(GATE_CAPACITY);
        (MessageGate { tx: Some(tx) }, MessageInbox { rx })
    }

    /// Creates a gate that drops every message (quiet mode).
    #[must_use]
    pub fn quiet() -> Self {
        Self { tx: None }
    }

    /// True when nothing is listening any more.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.tx.as_ref().is_none_or(mpsc::Sender::is_closed)
    }

    /// Best-effort notice. Never blocks the caller.
    ///
    /// When the mailbox is full the send is handed to a background task, so
    /// this must be called from within a Tokio runtime.
    pub fn flash(&self, text: impl Into<String>) {
        let Some(tx) = &self.tx else {
            return;
        };
        match tx.try_send(StatusMessage::transient(text)) {
            Ok(()) | Err(TrySendError::Closed(_)) => {}
            Err(TrySendError::Full(message)) => {
                let tx = tx.clone();
                tokio::spawn(async move {
                    let _ = tx.send(message).await;
                });
            }
        }
    }

    /// Terminal notice. Returns once the renderer has displayed and
    /// acknowledged the message, or immediately when the renderer is gone.
    pub async fn final_flash(&self, text: impl Into<String>) {
        let Some(tx) = &self.tx else {
            return;
        };
        let (message, ack) = StatusMessage::terminal(text);
        if tx.send(message).await.is_err() {
            trace!("final flash after renderer shutdown");
            return;
        }
        // Err means the message was dropped unacknowledged during shutdown
        let _ = ack.await;
    }
}

/// Consumer half of the gate, owned by the label renderer.
#[derive(Debug)]
pub struct MessageInbox {
    rx: mpsc::Receiver<StatusMessage>,
}

impl MessageInbox {
    /// Waits for the next message; `None` once every gate is gone.
    pub async fn recv(&mut self) -> Option<StatusMessage> {
        self.rx.recv().await
    }

    /// Moves every message that has already arrived into `pending`, oldest
    /// first, without waiting. Returns how many were moved.
    pub fn drain_into(&mut self, pending: &mut VecDeque<StatusMessage>) -> usize {
        let mut moved = 0;
        while let Ok(message) = self.rx.try_recv() {
            pending.push_back(message);
            moved += 1;
        }
        moved
    }

    /// Stops accepting messages. Already queued messages stay drainable.
    pub fn close(&mut self) {
        self.rx.close();
    }
}
