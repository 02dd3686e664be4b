// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Download manager: the queue wired to its default collaborators.

use std::sync::{Arc, Mutex};

use tokio::runtime::Handle;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;

use super::error::{DownloadError, Result};
use super::http::HttpTransport;
use super::notify::{BroadcastSink, FanoutSink, TracingSink};
use super::queue::{DownloadQueue, QueueParts};
use super::space::FsSpaceChecker;
use super::state::{JsonFileStore, QueueLock};
use super::transport::TransportEventReceiver;
use super::types::{TaskDescriptor, TaskEvent, TaskView, TerminalRecord};
use crate::config::{DownloaderConfig, QueueOptions};
use crate::locks::resilient_lock;

/// Owns a [`DownloadQueue`] and the background task that feeds it transport
/// events.
///
/// Operations are plain method calls on the queue; lifecycle events can be
/// observed by any number of subscribers.
pub struct DownloadManager {
    queue: Arc<DownloadQueue>,
    events: BroadcastSink,
    pump: Mutex<Option<JoinHandle<()>>>,
    /// Held while the queue runs on a state directory
    owner: Option<QueueLock>,
}

impl DownloadManager {
    /// Create a manager with the HTTP transport, the real filesystem and a
    /// JSON state file in the configured state directory.
    ///
    /// Must be called from within a tokio runtime. Fails with a `Store`
    /// error, before touching the registry, when another manager already
    /// owns the state directory.
    pub fn new(config: &DownloaderConfig) -> Result<Self> {
        let state_dir = config.state_dir()?;
        let owner = QueueLock::acquire(&state_dir)?;
        tracing::debug!(state_dir = %state_dir.display(), "opening download registry");

        let parts = QueueParts {
            transport: Arc::new(HttpTransport::new(config)?),
            space: Arc::new(FsSpaceChecker),
            store: Arc::new(JsonFileStore::in_dir(state_dir)),
            sink: Arc::new(TracingSink),
        };
        let mut manager = Self::with_parts(parts, config.queue_options(), config.event_capacity())?;
        manager.owner = Some(owner);
        Ok(manager)
    }

    /// Create a manager around custom collaborators.
    ///
    /// Events reach `parts.sink` first and are then broadcast to subscribers.
    pub fn with_parts(parts: QueueParts, options: QueueOptions, event_capacity: usize) -> Result<Self> {
        let runtime = Handle::try_current()
            .map_err(|e| DownloadError::TransportFailure(format!("no tokio runtime available: {}", e)))?;

        let events = BroadcastSink::new(event_capacity);
        let parts = QueueParts {
            sink: Arc::new(FanoutSink::new().with(parts.sink.clone()).with(events.clone())),
            ..parts
        };

        let (queue, rx) = DownloadQueue::open(parts, options)?;
        let queue = Arc::new(queue);
        let pump = runtime.spawn(Self::pump(Arc::clone(&queue), rx));

        Ok(Self {
            queue,
            events,
            pump: Mutex::new(Some(pump)),
            owner: None,
        })
    }

    /// Apply transport events as they arrive.
    async fn pump(queue: Arc<DownloadQueue>, mut rx: TransportEventReceiver) {
        while let Some(event) = rx.recv().await {
            queue.on_transport_event(event);
        }
        tracing::debug!("transport event channel closed");
    }

    /// Lock file held on the state directory, if this manager owns one.
    pub fn lock_path(&self) -> Option<&std::path::Path> {
        self.owner.as_ref().map(QueueLock::path)
    }

    /// The underlying queue.
    pub fn queue(&self) -> &Arc<DownloadQueue> {
        &self.queue
    }

    /// Subscribe to lifecycle and progress events.
    pub fn subscribe(&self) -> broadcast::Receiver<TaskEvent> {
        self.events.subscribe()
    }

    pub fn add(&self, descriptor: TaskDescriptor) -> Result<TaskView> {
        self.queue.add(descriptor)
    }

    pub fn start(&self, id: &str) -> Result<TaskView> {
        self.queue.start(id)
    }

    pub fn pause(&self, id: &str) -> Result<TaskView> {
        self.queue.pause(id)
    }

    pub fn resume(&self, id: &str) -> Result<TaskView> {
        self.queue.resume(id)
    }

    pub fn cancel(&self, id: &str) -> Result<TaskView> {
        self.queue.cancel(id)
    }

    pub fn stop(&self, id: &str) -> Result<TaskView> {
        self.queue.stop(id)
    }

    pub fn get(&self, id: &str) -> Result<TaskView> {
        self.queue.get(id)
    }

    pub fn list(&self) -> Vec<TaskView> {
        self.queue.list()
    }

    pub fn history(&self) -> Vec<TerminalRecord> {
        self.queue.history()
    }

    /// Get download statistics: (waiting, queued, downloading, paused).
    pub fn stats(&self) -> (usize, usize, usize, usize) {
        self.queue.stats()
    }

    /// Wait until a task leaves the registry and return how it ended.
    pub async fn wait(&self, id: &str) -> Result<TerminalRecord> {
        // Subscribe before looking, so the terminal event cannot slip between.
        let mut rx = self.subscribe();
        loop {
            if self.queue.get(id).is_err() {
                return self
                    .queue
                    .last_outcome(id)
                    .ok_or_else(|| DownloadError::NotFound(id.to_string()));
            }

            match rx.recv().await {
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => {
                    tracing::debug!(task = %id, skipped, "event subscriber lagged");
                }
                Err(RecvError::Closed) => {
                    return self
                        .queue
                        .last_outcome(id)
                        .ok_or_else(|| DownloadError::NotFound(id.to_string()));
                }
            }
        }
    }

    /// Release the active transfer and stop applying transport events.
    pub fn shutdown(&self) {
        self.queue.release_for_shutdown();
        if let Some(pump) = resilient_lock(&self.pump).take() {
            pump.abort();
        }
    }
}

impl Drop for DownloadManager {
    fn drop(&mut self) {
        if let Some(pump) = resilient_lock(&self.pump).take() {
            pump.abort();
        }
    }
}
