// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Notification sinks.
//!
//! The queue calls [`NotificationSink::notify`] while holding its lock, which
//! is what gives each task a well-defined event order. Sinks must therefore
//! return quickly and never call back into the queue.

use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex};

use serde::Serialize;
use tokio::sync::{broadcast, mpsc};

use super::types::{TaskEvent, TaskStatus};
use crate::config::DEFAULT_HISTORY_LIMIT;
use crate::locks::resilient_lock;

/// Receives lifecycle and progress events from the queue.
pub trait NotificationSink: Send + Sync {
    fn notify(&self, event: &TaskEvent);
}

impl<T: NotificationSink + ?Sized> NotificationSink for Arc<T> {
    fn notify(&self, event: &TaskEvent) {
        (**self).notify(event)
    }
}

/// Discards every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl NotificationSink for NullSink {
    fn notify(&self, _event: &TaskEvent) {}
}

/// Writes events to the `tracing` log.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl NotificationSink for TracingSink {
    fn notify(&self, event: &TaskEvent) {
        match event {
            TaskEvent::Progress { id, progress } => {
                tracing::trace!(task = %id, progress, "download progress");
            }
            TaskEvent::ChangeStatus { id, status } => {
                tracing::debug!(task = %id, %status, "download status changed");
            }
            TaskEvent::Complete { id, file_url, .. } => {
                tracing::info!(task = %id, %file_url, "download complete");
            }
            TaskEvent::Failed { id, message, reason } => {
                tracing::warn!(task = %id, ?reason, "download failed: {}", message);
            }
        }
    }
}

/// Forwards every event into an unbounded channel. Nothing is ever dropped.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<TaskEvent>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<TaskEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl NotificationSink for ChannelSink {
    fn notify(&self, event: &TaskEvent) {
        let _ = self.tx.send(event.clone());
    }
}

/// Fans events out to any number of subscribers.
///
/// Slow subscribers may lag and lose old events; terminal outcomes can still
/// be recovered from the queue's history.
#[derive(Debug, Clone)]
pub struct BroadcastSink {
    tx: broadcast::Sender<TaskEvent>,
}

impl BroadcastSink {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TaskEvent> {
        self.tx.subscribe()
    }
}

impl NotificationSink for BroadcastSink {
    fn notify(&self, event: &TaskEvent) {
        // No subscribers is not an error.
        let _ = self.tx.send(event.clone());
    }
}

/// Delivers each event to several sinks in order.
#[derive(Default)]
pub struct FanoutSink {
    sinks: Vec<Box<dyn NotificationSink>>,
}

impl FanoutSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, sink: impl NotificationSink + 'static) -> Self {
        self.sinks.push(Box::new(sink));
        self
    }
}

impl NotificationSink for FanoutSink {
    fn notify(&self, event: &TaskEvent) {
        for sink in &self.sinks {
            sink.notify(event);
        }
    }
}

/// A presentation-ready user notice.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Notice {
    pub title: String,
    pub body: String,
    /// Completions not yet acknowledged
    pub badge: u32,
}

/// Recently cancelled ids, oldest first, capped at `limit`.
#[derive(Debug)]
struct Exclusions {
    ids: HashSet<String>,
    order: VecDeque<String>,
    limit: usize,
}

impl Exclusions {
    fn new(limit: usize) -> Self {
        Self {
            ids: HashSet::new(),
            order: VecDeque::new(),
            limit: limit.max(1),
        }
    }

    fn insert(&mut self, id: &str) {
        if !self.ids.insert(id.to_string()) {
            return;
        }
        self.order.push_back(id.to_string());
        while self.order.len() > self.limit {
            if let Some(oldest) = self.order.pop_front() {
                self.ids.remove(&oldest);
            }
        }
    }

    fn remove(&mut self, id: &str) {
        if self.ids.remove(id) {
            self.order.retain(|x| x != id);
        }
    }

    fn contains(&self, id: &str) -> bool {
        self.ids.contains(id)
    }
}

#[derive(Debug)]
struct NoticeState {
    excluded: Exclusions,
    badge: u32,
}

/// Turns completions into user notices, like an OS notification would show.
///
/// Ids that were cancelled are remembered in a bounded exclusion set, so a
/// late completion for them never produces a notice.
#[derive(Debug)]
pub struct CompletionNotices {
    state: Mutex<NoticeState>,
    tx: mpsc::UnboundedSender<Notice>,
}

impl CompletionNotices {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Notice>) {
        Self::with_limit(DEFAULT_HISTORY_LIMIT)
    }

    /// Remember at most `limit` cancelled ids; the oldest are forgotten first.
    pub fn with_limit(limit: usize) -> (Self, mpsc::UnboundedReceiver<Notice>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let notices = Self {
            state: Mutex::new(NoticeState {
                excluded: Exclusions::new(limit),
                badge: 0,
            }),
            tx,
        };
        (notices, rx)
    }

    /// Number of cancelled ids currently remembered.
    pub fn excluded_len(&self) -> usize {
        resilient_lock(&self.state).excluded.order.len()
    }

    /// Reset the badge after the user has seen the notices.
    pub fn acknowledge(&self) {
        resilient_lock(&self.state).badge = 0;
    }

    pub fn badge(&self) -> u32 {
        resilient_lock(&self.state).badge
    }
}

impl NotificationSink for CompletionNotices {
    fn notify(&self, event: &TaskEvent) {
        let mut state = resilient_lock(&self.state);
        match event {
            TaskEvent::ChangeStatus { id, status: TaskStatus::Cancelled } => {
                state.excluded.insert(id);
            }
            TaskEvent::ChangeStatus { id, status: TaskStatus::Waiting } => {
                // Re-registered under the same id.
                state.excluded.remove(id);
            }
            TaskEvent::Complete { id, display_name, .. } => {
                if state.excluded.contains(id) {
                    tracing::debug!(task = %id, "suppressing notice for cancelled task");
                    return;
                }
                state.badge += 1;
                let _ = self.tx.send(Notice {
                    title: display_name.clone(),
                    body: format!("{} download complete", display_name),
                    badge: state.badge,
                });
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn complete(id: &str) -> TaskEvent {
        TaskEvent::Complete {
            id: id.into(),
            file_url: format!("file:///tmp/{id}"),
            file_name: format!("{id}.mp3"),
            display_name: format!("Track {id}"),
        }
    }

    #[test]
    fn test_channel_sink_keeps_order() {
        let (sink, mut rx) = ChannelSink::new();
        sink.notify(&TaskEvent::Progress { id: "a".into(), progress: 0.1 });
        sink.notify(&complete("a"));

        assert_eq!(rx.try_recv().unwrap().name(), "onProgress");
        assert_eq!(rx.try_recv().unwrap().name(), "onComplete");
    }

    #[test]
    fn test_fanout_delivers_to_all() {
        let (first, mut rx1) = ChannelSink::new();
        let (second, mut rx2) = ChannelSink::new();
        let fanout = FanoutSink::new().with(first).with(TracingSink).with(second);

        fanout.notify(&complete("x"));
        assert!(rx1.try_recv().is_ok());
        assert!(rx2.try_recv().is_ok());
    }

    #[test]
    fn test_broadcast_without_subscribers_is_fine() {
        let sink = BroadcastSink::new(4);
        sink.notify(&complete("nobody-listening"));

        let mut rx = sink.subscribe();
        sink.notify(&complete("b"));
        assert_eq!(rx.try_recv().unwrap().id(), "b");
    }

    #[test]
    fn test_completion_notices_count_badge() {
        let (notices, mut rx) = CompletionNotices::new();
        notices.notify(&complete("1"));
        notices.notify(&complete("2"));

        let first = rx.try_recv().unwrap();
        let second = rx.try_recv().unwrap();
        assert_eq!(first.title, "Track 1");
        assert_eq!(first.body, "Track 1 download complete");
        assert_eq!(second.badge, 2);

        notices.acknowledge();
        assert_eq!(notices.badge(), 0);
    }

    #[test]
    fn test_completion_notices_suppress_cancelled() {
        let (notices, mut rx) = CompletionNotices::new();
        notices.notify(&TaskEvent::ChangeStatus { id: "c".into(), status: TaskStatus::Cancelled });
        notices.notify(&complete("c"));
        assert!(rx.try_recv().is_err());

        // Re-adding the id lifts the exclusion.
        notices.notify(&TaskEvent::ChangeStatus { id: "c".into(), status: TaskStatus::Waiting });
        notices.notify(&complete("c"));
        assert!(rx.try_recv().is_ok());
    }

    #[test]
    fn test_exclusions_stay_bounded() {
        let (notices, mut rx) = CompletionNotices::with_limit(4);
        for i in 0..10 {
            notices.notify(&TaskEvent::ChangeStatus { id: format!("c{i}"), status: TaskStatus::Cancelled });
        }
        assert_eq!(notices.excluded_len(), 4);

        // The newest cancellations are still suppressed, the oldest forgotten.
        notices.notify(&complete("c9"));
        assert!(rx.try_recv().is_err());
        notices.notify(&complete("c0"));
        assert_eq!(rx.try_recv().unwrap().title, "Track c0");

        // Re-adding frees a slot without evicting anyone else.
        notices.notify(&TaskEvent::ChangeStatus { id: "c8".into(), status: TaskStatus::Waiting });
        assert_eq!(notices.excluded_len(), 3);
        notices.notify(&complete("c6"));
        assert!(rx.try_recv().is_err());
    }
}
