// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! The single-flight download queue.
//!
//! All registry state lives behind one mutex. Caller operations and transport
//! events both take that lock, so they are applied one at a time and only one
//! task can ever occupy the transfer slot. A `Paused` task keeps the slot: its
//! transport handle is still live and resuming it must not create a second
//! concurrent download.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::Utc;
use url::Url;

use super::error::{DownloadError, Result, MSG_DOWNLOAD_FAILED};
use super::notify::NotificationSink;
use super::space::SpaceChecker;
use super::state::{DownloadState, TaskStore};
use super::transport::{
    partial_path, EventSender, Transport, TransportEvent, TransportEventKind,
    TransportEventReceiver, TransportRequest,
};
use super::types::{
    resolve_directory, DownloadTask, FailureReason, TaskDescriptor, TaskEvent, TaskStatus,
    TaskView, TerminalRecord,
};
use crate::config::QueueOptions;
use crate::locks::resilient_lock;

/// The collaborators a queue is wired to.
#[derive(Clone)]
pub struct QueueParts {
    pub transport: Arc<dyn Transport>,
    pub space: Arc<dyn SpaceChecker>,
    pub store: Arc<dyn TaskStore>,
    pub sink: Arc<dyn NotificationSink>,
}

/// How a task left the registry.
enum Outcome {
    Completed { file_url: String },
    Failed { message: String, reason: FailureReason },
    Cancelled,
}

impl Outcome {
    fn status(&self) -> TaskStatus {
        match self {
            Outcome::Completed { .. } => TaskStatus::Completed,
            Outcome::Failed { .. } => TaskStatus::Failed,
            Outcome::Cancelled => TaskStatus::Cancelled,
        }
    }
}

struct QueueInner {
    state: DownloadState,
    /// Id of the task holding the transfer slot
    active: Option<String>,
    history: VecDeque<TerminalRecord>,
}

/// Owns the task registry and drives every state transition.
pub struct DownloadQueue {
    inner: Mutex<QueueInner>,
    transport: Arc<dyn Transport>,
    space: Arc<dyn SpaceChecker>,
    store: Arc<dyn TaskStore>,
    sink: Arc<dyn NotificationSink>,
    events: EventSender,
    options: QueueOptions,
}

impl DownloadQueue {
    /// Load the registry from the store and reconcile it after a restart.
    ///
    /// Returns the queue and the receiver its transport events arrive on. The
    /// caller must feed that receiver back through [`on_transport_event`]
    /// (the manager does this with a pump task).
    ///
    /// [`on_transport_event`]: DownloadQueue::on_transport_event
    pub fn open(parts: QueueParts, options: QueueOptions) -> Result<(Self, TransportEventReceiver)> {
        let mut state = parts.store.load()?;

        let reset = reconcile(&mut state);
        if reset > 0 {
            tracing::info!(count = reset, "reset interrupted downloads to waiting");
        }
        if options.clean_partial_on_open {
            state.remove_partial_files();
        }

        let (events, rx) = EventSender::channel();
        let queue = Self {
            inner: Mutex::new(QueueInner {
                state,
                active: None,
                history: VecDeque::new(),
            }),
            transport: parts.transport,
            space: parts.space,
            store: parts.store,
            sink: parts.sink,
            events,
            options,
        };

        {
            let mut inner = queue.lock();
            queue.persist(&mut inner);
        }

        Ok((queue, rx))
    }

    fn lock(&self) -> MutexGuard<'_, QueueInner> {
        resilient_lock(&self.inner)
    }

    /// Register a new `Waiting` task.
    pub fn add(&self, descriptor: TaskDescriptor) -> Result<TaskView> {
        validate(&descriptor)?;

        let mut inner = self.lock();
        if inner.state.get_task(&descriptor.id).is_some() {
            return Err(DownloadError::DuplicateId(descriptor.id));
        }

        let file_path = resolve_directory(&descriptor.file_path, self.options.download_root.as_deref());
        if self.options.check_space_on_add {
            self.check_space(&descriptor.id, descriptor.size, &file_path)?;
        }

        let now = Utc::now();
        let sequence_index = inner.state.allocate_sequence();
        let task = DownloadTask {
            display_name: descriptor
                .display_name
                .unwrap_or_else(|| descriptor.file_name.clone()),
            id: descriptor.id,
            url: descriptor.url,
            size: descriptor.size,
            file_path,
            file_name: descriptor.file_name,
            headers: descriptor.headers,
            sequence_index,
            status: TaskStatus::Waiting,
            created_at: now,
            updated_at: now,
            progress: 0.0,
            transport_handle: None,
        };
        let view = task.view();
        inner.state.upsert_task(task);

        tracing::debug!(task = %view.id, sequence_index, "task registered");
        self.persist(&mut inner);
        self.emit_status(&view.id, TaskStatus::Waiting);
        Ok(view)
    }

    /// Request admission for a task.
    ///
    /// A free slot admits the task straight away; an occupied slot parks it as
    /// `Queued`. Calling this on a task that is already downloading, paused or
    /// queued behind an occupied slot changes nothing.
    pub fn start(&self, id: &str) -> Result<TaskView> {
        let mut inner = self.lock();
        let task = inner
            .state
            .get_task(id)
            .ok_or_else(|| DownloadError::NotFound(id.to_string()))?;

        match (task.status, inner.active.is_some()) {
            (TaskStatus::Waiting, true) => {
                let view = self.set_status(&mut inner, id, TaskStatus::Queued)?;
                self.persist(&mut inner);
                self.emit_status(id, TaskStatus::Queued);
                Ok(view)
            }
            (TaskStatus::Waiting | TaskStatus::Queued, false) => self.admit(&mut inner, id),
            _ => Ok(task.view()),
        }
    }

    /// Suspend the active transfer. A no-op unless the task is `Downloading`.
    pub fn pause(&self, id: &str) -> Result<TaskView> {
        let mut inner = self.lock();
        let task = inner
            .state
            .get_task(id)
            .ok_or_else(|| DownloadError::NotFound(id.to_string()))?;

        let (TaskStatus::Downloading, Some(handle)) = (task.status, task.transport_handle) else {
            return Ok(task.view());
        };

        self.transport.suspend(handle);
        let view = self.set_status(&mut inner, id, TaskStatus::Paused)?;
        self.persist(&mut inner);
        self.emit_status(id, TaskStatus::Paused);
        Ok(view)
    }

    /// Continue a suspended transfer. A no-op unless the task is `Paused`.
    pub fn resume(&self, id: &str) -> Result<TaskView> {
        let mut inner = self.lock();
        let task = inner
            .state
            .get_task(id)
            .ok_or_else(|| DownloadError::NotFound(id.to_string()))?;

        let (TaskStatus::Paused, Some(handle)) = (task.status, task.transport_handle) else {
            return Ok(task.view());
        };

        self.transport.resume(handle);
        let view = self.set_status(&mut inner, id, TaskStatus::Downloading)?;
        self.persist(&mut inner);
        self.emit_status(id, TaskStatus::Downloading);
        Ok(view)
    }

    /// Cancel a task in any non-terminal state and drop it from the registry.
    pub fn cancel(&self, id: &str) -> Result<TaskView> {
        let mut inner = self.lock();
        let handle = inner
            .state
            .get_task(id)
            .ok_or_else(|| DownloadError::NotFound(id.to_string()))?
            .transport_handle;

        if let Some(handle) = handle {
            self.transport.cancel(handle);
        }

        let view = self
            .finish(&mut inner, id, Outcome::Cancelled)
            .ok_or_else(|| DownloadError::NotFound(id.to_string()))?;
        self.advance_locked(&mut inner);
        Ok(view)
    }

    /// Alias of [`cancel`](DownloadQueue::cancel).
    pub fn stop(&self, id: &str) -> Result<TaskView> {
        self.cancel(id)
    }

    /// Promote the next eligible task if the slot is free.
    pub fn advance(&self) {
        let mut inner = self.lock();
        self.advance_locked(&mut inner);
    }

    /// Apply one transport event.
    ///
    /// Events for tasks no longer in the registry, or carrying a handle other
    /// than the task's current one, are stale and silently dropped. Returns
    /// whether the event was applied.
    pub fn on_transport_event(&self, event: TransportEvent) -> bool {
        let mut inner = self.lock();

        let current = inner
            .state
            .get_task(&event.task_id)
            .and_then(|t| t.transport_handle.map(|h| (h, t.status)));
        let Some((handle, status)) = current else {
            tracing::debug!(task = %event.task_id, handle = %event.handle, "dropping stale transport event");
            return false;
        };
        if handle != event.handle {
            tracing::debug!(task = %event.task_id, handle = %event.handle, current = %handle, "dropping event from superseded transfer");
            return false;
        }

        match event.kind {
            TransportEventKind::Progress(fraction) => {
                // Progress is display state; late ticks after a pause are ignored.
                if status != TaskStatus::Downloading || !fraction.is_finite() {
                    return false;
                }
                let progress = fraction.clamp(0.0, 1.0);
                if let Some(task) = inner.state.get_task_mut(&event.task_id) {
                    task.progress = progress;
                }
                self.sink.notify(&TaskEvent::Progress { id: event.task_id, progress });
                true
            }
            TransportEventKind::Complete { file_url } => {
                tracing::info!(task = %event.task_id, "download completed");
                self.finish(&mut inner, &event.task_id, Outcome::Completed { file_url });
                self.advance_locked(&mut inner);
                true
            }
            TransportEventKind::Failed { message } => {
                tracing::warn!(task = %event.task_id, "download failed: {}", message);
                let message = format!("{} ({})", MSG_DOWNLOAD_FAILED, message);
                self.finish(
                    &mut inner,
                    &event.task_id,
                    Outcome::Failed { message, reason: FailureReason::Transport },
                );
                self.advance_locked(&mut inner);
                true
            }
        }
    }

    /// Apply every transport event that is already waiting. Returns how many
    /// events were read.
    pub fn drain_events(&self, rx: &mut TransportEventReceiver) -> usize {
        let mut count = 0;
        while let Ok(event) = rx.try_recv() {
            self.on_transport_event(event);
            count += 1;
        }
        count
    }

    /// Give up the slot before the process exits.
    ///
    /// The in-flight transfer is cancelled and its task goes back to `Waiting`,
    /// exactly what a restart would do to it anyway.
    pub fn release_for_shutdown(&self) {
        let mut inner = self.lock();
        let Some(id) = inner.active.take() else {
            return;
        };
        if let Some(task) = inner.state.get_task_mut(&id) {
            if let Some(handle) = task.transport_handle.take() {
                self.transport.cancel(handle);
            }
            task.progress = 0.0;
            task.update_status(TaskStatus::Waiting);
        }
        tracing::info!(task = %id, "released active download for shutdown");
        self.persist(&mut inner);
        self.emit_status(&id, TaskStatus::Waiting);
    }

    /// Public view of one registered task.
    pub fn get(&self, id: &str) -> Result<TaskView> {
        self.lock()
            .state
            .get_task(id)
            .map(DownloadTask::view)
            .ok_or_else(|| DownloadError::NotFound(id.to_string()))
    }

    /// Views of all registered tasks in admission order.
    pub fn list(&self) -> Vec<TaskView> {
        self.lock()
            .state
            .ordered_tasks()
            .into_iter()
            .map(DownloadTask::view)
            .collect()
    }

    /// Recent terminal records, oldest first.
    pub fn history(&self) -> Vec<TerminalRecord> {
        self.lock().history.iter().cloned().collect()
    }

    /// Latest terminal record for an id, if it is still in history.
    pub fn last_outcome(&self, id: &str) -> Option<TerminalRecord> {
        self.lock().history.iter().rev().find(|r| r.id == id).cloned()
    }

    /// Id of the task occupying the transfer slot.
    pub fn active_id(&self) -> Option<String> {
        self.lock().active.clone()
    }

    /// Counts of (waiting, queued, downloading, paused) tasks.
    pub fn stats(&self) -> (usize, usize, usize, usize) {
        self.lock().state.status_counts()
    }

    // ------------------------------------------------------------------------
    // Transitions. Everything below runs with the queue lock held.
    // ------------------------------------------------------------------------

    fn check_space(&self, id: &str, size: u64, dir: &std::path::Path) -> Result<()> {
        match self.space.available_bytes(dir) {
            Ok(free) if free >= size => Ok(()),
            Ok(free) => Err(DownloadError::InsufficientSpace {
                id: id.to_string(),
                required: size,
                available: Some(free),
            }),
            Err(e) => {
                tracing::warn!(task = %id, dir = %dir.display(), "could not determine free space: {}", e);
                Err(DownloadError::InsufficientSpace {
                    id: id.to_string(),
                    required: size,
                    available: None,
                })
            }
        }
    }

    /// Move a task into the slot: admission check, then transport.
    fn admit(&self, inner: &mut QueueInner, id: &str) -> Result<TaskView> {
        let Some(task) = inner.state.get_task(id) else {
            return Err(DownloadError::NotFound(id.to_string()));
        };
        let request = TransportRequest {
            task_id: task.id.clone(),
            url: task.url.clone(),
            headers: task.headers.clone(),
            destination: task.destination(),
            declared_size: task.size,
        };
        let (size, dir) = (task.size, task.file_path.clone());

        if let Err(err) = self.check_space(id, size, &dir) {
            tracing::warn!(task = %id, "admission rejected: {}", err);
            self.finish(
                inner,
                id,
                Outcome::Failed { message: err.user_message(), reason: FailureReason::InsufficientSpace },
            );
            return Err(err);
        }

        let partial = request.partial_path();
        match self.transport.begin(request, self.events.clone()) {
            Ok(handle) => {
                let Some(task) = inner.state.get_task_mut(id) else {
                    return Err(DownloadError::NotFound(id.to_string()));
                };
                task.transport_handle = Some(handle);
                task.progress = 0.0;
                task.update_status(TaskStatus::Downloading);
                let view = task.view();

                inner.active = Some(id.to_string());
                inner.state.track_partial(partial);
                tracing::info!(task = %id, %handle, "download started");
                self.persist(inner);
                self.emit_status(id, TaskStatus::Downloading);
                Ok(view)
            }
            Err(err) => {
                tracing::warn!(task = %id, "transport refused download: {}", err);
                let message = format!("{} ({})", MSG_DOWNLOAD_FAILED, err);
                self.finish(inner, id, Outcome::Failed { message, reason: FailureReason::Transport })
                    .ok_or_else(|| DownloadError::NotFound(id.to_string()))
            }
        }
    }

    /// Fill a free slot with the earliest eligible task.
    fn advance_locked(&self, inner: &mut QueueInner) {
        let eligible: &[TaskStatus] = if self.options.promote_waiting {
            &[TaskStatus::Queued, TaskStatus::Waiting]
        } else {
            &[TaskStatus::Queued]
        };

        // Each failed admission removes its task, so this terminates.
        while inner.active.is_none() {
            let Some(next) = inner.state.next_eligible(eligible).map(|t| t.id.clone()) else {
                break;
            };
            tracing::debug!(task = %next, "promoting next task");
            match self.admit(inner, &next) {
                Ok(view) if view.status == TaskStatus::Downloading => break,
                Ok(_) => continue,
                Err(err) => tracing::debug!(task = %next, "promotion skipped: {}", err),
            }
        }
    }

    /// Remove a task on reaching a terminal state and announce it.
    fn finish(&self, inner: &mut QueueInner, id: &str, outcome: Outcome) -> Option<TaskView> {
        let mut task = inner.state.remove_task(id)?;
        let status = outcome.status();
        task.transport_handle = None;
        task.update_status(status);
        let view = task.view();

        if inner.active.as_deref() == Some(id) {
            inner.active = None;
        }
        inner.state.untrack_partial(&partial_path(&task.destination()));

        let message = match &outcome {
            Outcome::Failed { message, .. } => Some(message.clone()),
            _ => None,
        };
        inner.history.push_back(TerminalRecord {
            id: id.to_string(),
            status,
            message,
            finished_at: Utc::now(),
        });
        while inner.history.len() > self.options.history_limit {
            inner.history.pop_front();
        }

        self.persist(inner);
        self.emit_status(id, status);
        match outcome {
            Outcome::Completed { file_url } => self.sink.notify(&TaskEvent::Complete {
                id: id.to_string(),
                file_url,
                file_name: task.file_name,
                display_name: task.display_name,
            }),
            Outcome::Failed { message, reason } => self.sink.notify(&TaskEvent::Failed {
                id: id.to_string(),
                message,
                reason,
            }),
            Outcome::Cancelled => {}
        }
        Some(view)
    }

    fn set_status(&self, inner: &mut QueueInner, id: &str, status: TaskStatus) -> Result<TaskView> {
        let task = inner
            .state
            .get_task_mut(id)
            .ok_or_else(|| DownloadError::NotFound(id.to_string()))?;
        task.update_status(status);
        Ok(task.view())
    }

    fn persist(&self, inner: &mut QueueInner) {
        inner.state.last_saved = Some(Utc::now());
        if let Err(e) = self.store.save(&inner.state) {
            tracing::warn!("Failed to persist download registry: {:#}", e);
        }
    }

    fn emit_status(&self, id: &str, status: TaskStatus) {
        self.sink.notify(&TaskEvent::ChangeStatus { id: id.to_string(), status });
    }
}

/// Bring a freshly loaded registry in line with an empty transfer slot.
///
/// No transport handle survives a restart: tasks that were downloading or
/// paused go back to `Waiting`. Terminal records should never have been saved
/// and are dropped. Returns how many tasks were reset.
fn reconcile(state: &mut DownloadState) -> usize {
    state.tasks.retain(|id, task| {
        if task.status.is_terminal() {
            tracing::debug!(task = %id, status = %task.status, "dropping terminal record found at startup");
            false
        } else {
            true
        }
    });

    let mut reset = 0;
    for task in state.tasks.values_mut() {
        task.transport_handle = None;
        task.progress = 0.0;
        if task.status.holds_transport() {
            task.update_status(TaskStatus::Waiting);
            reset += 1;
        }
    }
    reset
}

fn validate(descriptor: &TaskDescriptor) -> Result<()> {
    let invalid = |msg: String| -> Result<()> { Err(DownloadError::InvalidDescriptor(msg)) };

    if descriptor.id.trim().is_empty() {
        return invalid("id must not be empty".to_string());
    }
    if let Err(e) = Url::parse(&descriptor.url) {
        return invalid(format!("url '{}' is not valid: {}", descriptor.url, e));
    }
    let name = descriptor.file_name.as_str();
    if name.trim().is_empty() || name == "." || name == ".." || name.contains(['/', '\\']) {
        return invalid(format!("fileName '{}' must be a plain file name", name));
    }
    if let Some(bad) = descriptor
        .headers
        .keys()
        .find(|k| k.trim().is_empty() || k.contains([':', ' ', '\r', '\n']))
    {
        return invalid(format!("header name '{}' is not valid", bad));
    }
    Ok(())
}
