// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! The transport capability the queue drives.
//!
//! A transport moves bytes for exactly one task at a time on behalf of the
//! queue. It never touches the registry: everything it has to say goes back
//! through an [`EventSender`] and is applied by the queue under its own lock.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};

use tokio::sync::mpsc;

use super::error::Result;

/// Opaque reference to one in-flight transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TransportHandle(u64);

impl TransportHandle {
    pub fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for TransportHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "xfer-{}", self.0)
    }
}

/// Everything a transport needs to perform one download.
#[derive(Debug, Clone)]
pub struct TransportRequest {
    pub task_id: String,
    pub url: String,
    pub headers: HashMap<String, String>,
    /// Final location of the file
    pub destination: PathBuf,
    /// Declared size, used as the progress denominator when the server sends none
    pub declared_size: u64,
}

impl TransportRequest {
    /// Where bytes are staged before the final rename.
    pub fn partial_path(&self) -> PathBuf {
        partial_path(&self.destination)
    }
}

/// Staging path for a destination: `<destination>.part`.
pub fn partial_path(destination: &Path) -> PathBuf {
    let mut name = destination.as_os_str().to_os_string();
    name.push(".part");
    PathBuf::from(name)
}

/// What happened to a transfer.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEventKind {
    Progress(f64),
    Complete { file_url: String },
    Failed { message: String },
}

/// An event reported by a transport for one handle.
#[derive(Debug, Clone, PartialEq)]
pub struct TransportEvent {
    pub task_id: String,
    pub handle: TransportHandle,
    pub kind: TransportEventKind,
}

impl TransportEvent {
    pub fn progress(task_id: impl Into<String>, handle: TransportHandle, fraction: f64) -> Self {
        Self { task_id: task_id.into(), handle, kind: TransportEventKind::Progress(fraction) }
    }

    pub fn complete(task_id: impl Into<String>, handle: TransportHandle, file_url: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            handle,
            kind: TransportEventKind::Complete { file_url: file_url.into() },
        }
    }

    pub fn failed(task_id: impl Into<String>, handle: TransportHandle, message: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            handle,
            kind: TransportEventKind::Failed { message: message.into() },
        }
    }

    /// Completion and failure must never be dropped.
    pub fn is_terminal(&self) -> bool {
        !matches!(self.kind, TransportEventKind::Progress(_))
    }
}

/// Receiving half of the transport event channel.
pub type TransportEventReceiver = mpsc::UnboundedReceiver<TransportEvent>;

/// Sending half handed to the transport on every `begin`.
///
/// Sending never blocks, so it is safe from any thread or callback context.
/// Events from one sender arrive in the order they were sent.
#[derive(Debug, Clone)]
pub struct EventSender {
    tx: mpsc::UnboundedSender<TransportEvent>,
}

impl EventSender {
    /// Create a connected sender/receiver pair.
    pub fn channel() -> (Self, TransportEventReceiver) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Deliver an event. Returns false once the queue side is gone.
    pub fn send(&self, event: TransportEvent) -> bool {
        match self.tx.send(event) {
            Ok(()) => true,
            Err(err) => {
                tracing::debug!(task = %err.0.task_id, "transport event dropped, queue receiver closed");
                false
            }
        }
    }
}

/// A download transport.
///
/// Every method is called while the queue holds its lock, so none of them may
/// block on I/O. The actual transfer runs elsewhere and reports through the
/// `EventSender` given to `begin`. After `cancel` a transport should stay
/// quiet; anything it still sends is discarded as stale by the queue.
pub trait Transport: Send + Sync {
    /// Start a transfer and return its handle.
    fn begin(&self, request: TransportRequest, events: EventSender) -> Result<TransportHandle>;

    /// Suspend an in-flight transfer.
    fn suspend(&self, handle: TransportHandle);

    /// Resume a suspended transfer.
    fn resume(&self, handle: TransportHandle);

    /// Abort a transfer and discard its partial output.
    fn cancel(&self, handle: TransportHandle);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_path_appends_suffix() {
        assert_eq!(
            partial_path(Path::new("/data/media/ep1.mp3")),
            PathBuf::from("/data/media/ep1.mp3.part")
        );
    }

    #[test]
    fn test_event_sender_preserves_order() {
        let (tx, mut rx) = EventSender::channel();
        let handle = TransportHandle::new(3);
        assert!(tx.send(TransportEvent::progress("a", handle, 0.5)));
        assert!(tx.send(TransportEvent::complete("a", handle, "file:///a")));

        let first = rx.try_recv().unwrap();
        let second = rx.try_recv().unwrap();
        assert!(!first.is_terminal());
        assert!(second.is_terminal());
    }

    #[test]
    fn test_event_sender_reports_closed_receiver() {
        let (tx, rx) = EventSender::channel();
        drop(rx);
        assert!(!tx.send(TransportEvent::failed("a", TransportHandle::new(1), "boom")));
    }
}
