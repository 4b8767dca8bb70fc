//! Notification bus for background completions.
//!
//! Background workers push a [`NotificationEvent`] when their task reaches a
//! terminal state. The coordinating loop drains the queue once per decision
//! cycle and folds the rendered blocks into its next message. Producers never
//! wait on the consumer.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

use crate::executor::{BackgroundKind, BackgroundStatus};

/// Terminal state of one background task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationEvent {
    /// Background task id (`b…` or `a…`).
    pub task_id: String,
    /// What kind of work it was.
    pub kind: BackgroundKind,
    /// Terminal status.
    pub status: BackgroundStatus,
    /// Bounded prefix of the output. The full output stays with the executor.
    pub summary: String,
    /// When the terminal transition happened.
    pub timestamp: DateTime<Utc>,
}

impl NotificationEvent {
    /// Build an event, cutting `output` down to `summary_chars` characters.
    pub fn new(
        task_id: impl Into<String>,
        kind: BackgroundKind,
        status: BackgroundStatus,
        output: &str,
        summary_chars: usize,
    ) -> Self {
        Self {
            task_id: task_id.into(),
            kind,
            status,
            summary: truncate_summary(output, summary_chars),
            timestamp: Utc::now(),
        }
    }

    /// Structured block injected into the coordinator's context.
    pub fn render(&self) -> String {
        format!(
            "<task-notification>\n<task-id>{}</task-id>\n<status>{}</status>\n<summary>{}</summary>\n</task-notification>",
            self.task_id, self.status, self.summary
        )
    }
}

/// Render a drained batch as one injection, or `None` if there is nothing to say.
pub fn render_injection(events: &[NotificationEvent]) -> Option<String> {
    if events.is_empty() {
        return None;
    }
    Some(events.iter().map(NotificationEvent::render).collect::<Vec<_>>().join("\n"))
}

/// Keep the first `max_chars` characters, marking the cut with `...`.
pub fn truncate_summary(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        None => text.to_string(),
        Some((cut, _)) => format!("{}...", &text[..cut]),
    }
}

struct BusInner {
    sender: UnboundedSender<NotificationEvent>,
    receiver: Mutex<UnboundedReceiver<NotificationEvent>>,
    published: AtomicU64,
}

/// Unbounded FIFO of completion events with a single draining consumer.
///
/// Cloning gives another handle to the same queue.
#[derive(Clone)]
pub struct NotificationBus {
    inner: Arc<BusInner>,
}

impl NotificationBus {
    pub fn new() -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(BusInner {
                sender,
                receiver: Mutex::new(receiver),
                published: AtomicU64::new(0),
            }),
        }
    }

    /// Enqueue an event. Never blocks.
    pub fn publish(&self, event: NotificationEvent) {
        log::debug!("Notification queued for {} ({})", event.task_id, event.status);
        // The receiver lives as long as `inner`, so the send cannot fail here
        if self.inner.sender.send(event).is_ok() {
            self.inner.published.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Remove and return everything queued so far, oldest first.
    pub fn drain(&self) -> Vec<NotificationEvent> {
        let mut receiver = self.inner.receiver.lock().unwrap_or_else(|e| e.into_inner());
        let mut events = Vec::new();
        while let Ok(event) = receiver.try_recv() {
            events.push(event);
        }
        events
    }

    /// Total events published over the bus's lifetime.
    pub fn published(&self) -> u64 {
        self.inner.published.load(Ordering::Relaxed)
    }
}

impl Default for NotificationBus {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for NotificationBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NotificationBus")
            .field("published", &self.published())
            .finish()
    }
}
