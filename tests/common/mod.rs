// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Shared test doubles for the queue integration tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use nativedl::config::QueueOptions;
use nativedl::download::{
    ChannelSink, DownloadError, DownloadQueue, EventSender, MemoryStore, QueueParts, StaticSpace,
    TaskDescriptor, TaskEvent, TaskStatus, Transport, TransportEvent, TransportEventReceiver,
    TransportHandle, TransportRequest,
};
use tokio::sync::mpsc::UnboundedReceiver;

/// A transport call as seen by the test double.
#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    Begin { task_id: String, handle: TransportHandle },
    Suspend(TransportHandle),
    Resume(TransportHandle),
    Cancel(TransportHandle),
}

/// Records every call and lets the test play the network.
#[derive(Default)]
pub struct RecordingTransport {
    next: AtomicU64,
    refuse: AtomicBool,
    calls: Mutex<Vec<Call>>,
    live: Mutex<HashMap<String, (TransportHandle, EventSender)>>,
}

impl RecordingTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every following `begin` fail.
    pub fn refuse_begin(&self, refuse: bool) {
        self.refuse.store(refuse, Ordering::SeqCst);
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    /// Ids passed to `begin`, in order.
    pub fn begun(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::Begin { task_id, .. } => Some(task_id),
                _ => None,
            })
            .collect()
    }

    /// Latest handle issued for a task.
    pub fn handle_of(&self, id: &str) -> Option<TransportHandle> {
        self.live.lock().unwrap().get(id).map(|(h, _)| *h)
    }

    fn sender_of(&self, id: &str) -> Option<(TransportHandle, EventSender)> {
        self.live.lock().unwrap().get(id).cloned()
    }

    pub fn progress(&self, id: &str, fraction: f64) -> bool {
        self.sender_of(id)
            .map(|(h, tx)| tx.send(TransportEvent::progress(id, h, fraction)))
            .unwrap_or(false)
    }

    pub fn complete(&self, id: &str) -> bool {
        self.sender_of(id)
            .map(|(h, tx)| tx.send(TransportEvent::complete(id, h, format!("file:///tmp/{id}"))))
            .unwrap_or(false)
    }

    pub fn fail(&self, id: &str, message: &str) -> bool {
        self.sender_of(id)
            .map(|(h, tx)| tx.send(TransportEvent::failed(id, h, message)))
            .unwrap_or(false)
    }

    /// Send an event for an explicit, possibly outdated, handle.
    pub fn complete_with(&self, id: &str, handle: TransportHandle) -> bool {
        self.sender_of(id)
            .map(|(_, tx)| tx.send(TransportEvent::complete(id, handle, "file:///tmp/stale")))
            .unwrap_or(false)
    }
}

impl Transport for RecordingTransport {
    fn begin(&self, request: TransportRequest, events: EventSender) -> Result<TransportHandle, DownloadError> {
        if self.refuse.load(Ordering::SeqCst) {
            return Err(DownloadError::TransportFailure("connection refused".into()));
        }
        let handle = TransportHandle::new(self.next.fetch_add(1, Ordering::SeqCst) + 1);
        self.calls.lock().unwrap().push(Call::Begin { task_id: request.task_id.clone(), handle });
        self.live.lock().unwrap().insert(request.task_id, (handle, events));
        Ok(handle)
    }

    fn suspend(&self, handle: TransportHandle) {
        self.calls.lock().unwrap().push(Call::Suspend(handle));
    }

    fn resume(&self, handle: TransportHandle) {
        self.calls.lock().unwrap().push(Call::Resume(handle));
    }

    fn cancel(&self, handle: TransportHandle) {
        self.calls.lock().unwrap().push(Call::Cancel(handle));
    }
}

/// A queue wired to test doubles, driven synchronously.
pub struct Harness {
    pub queue: DownloadQueue,
    pub rx: TransportEventReceiver,
    pub transport: Arc<RecordingTransport>,
    pub space: Arc<StaticSpace>,
    pub store: Arc<MemoryStore>,
    pub events: UnboundedReceiver<TaskEvent>,
}

impl Harness {
    pub fn new(free_bytes: u64) -> Self {
        Self::with(free_bytes, Arc::new(MemoryStore::new()), QueueOptions::default())
    }

    pub fn with(free_bytes: u64, store: Arc<MemoryStore>, options: QueueOptions) -> Self {
        let transport = Arc::new(RecordingTransport::new());
        let space = Arc::new(StaticSpace::new(free_bytes));
        let (sink, events) = ChannelSink::new();
        let parts = QueueParts {
            transport: transport.clone(),
            space: space.clone(),
            store: store.clone(),
            sink: Arc::new(sink),
        };
        let (queue, rx) = DownloadQueue::open(parts, options).expect("queue should open");
        Self { queue, rx, transport, space, store, events }
    }

    /// Open a second queue on the same store, as a restarted process would.
    pub fn reopen(&self) -> Self {
        Self::with(u64::MAX, self.store.clone(), QueueOptions::default())
    }

    /// Apply pending transport events.
    pub fn pump(&mut self) -> usize {
        self.queue.drain_events(&mut self.rx)
    }

    pub fn status(&self, id: &str) -> Option<TaskStatus> {
        self.queue.get(id).ok().map(|v| v.status)
    }

    /// Drain everything the sink received so far.
    pub fn take_events(&mut self) -> Vec<TaskEvent> {
        let mut out = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            out.push(event);
        }
        out
    }
}

pub fn descriptor(id: &str, size: u64) -> TaskDescriptor {
    TaskDescriptor::new(id, format!("https://media.example.com/{id}.mp3"), size, "/tmp/nativedl-tests", format!("{id}.mp3"))
}
