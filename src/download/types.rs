// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Task types for the download queue.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::transport::TransportHandle;

/// Lifecycle status of a download task.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    /// Registered, not yet started
    Waiting,
    /// Start requested while the slot was occupied
    Queued,
    /// Owns the transfer slot and is streaming
    Downloading,
    /// Owns the transfer slot, transfer suspended
    Paused,
    /// Transfer finished successfully
    Completed,
    /// Admission or transfer failed
    Failed,
    /// Cancelled by the caller
    Cancelled,
}

impl TaskStatus {
    /// Returns true for states from which no further transition occurs.
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled)
    }

    /// Returns true if the task holds a live transport handle.
    pub fn holds_transport(&self) -> bool {
        matches!(self, TaskStatus::Downloading | TaskStatus::Paused)
    }

    /// Lowercase wire name, as sent in `onChangeStatus`.
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Waiting => "waiting",
            TaskStatus::Queued => "queued",
            TaskStatus::Downloading => "downloading",
            TaskStatus::Paused => "paused",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Caller-supplied description of a download, as received from the bridge.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TaskDescriptor {
    pub id: String,
    pub url: String,
    /// Declared size in bytes, used only for admission
    pub size: u64,
    /// Destination directory; a `file://` prefix is accepted
    pub file_path: String,
    pub file_name: String,
    /// Name shown in completion notices (defaults to the file name)
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub headers: HashMap<String, String>,
}

impl TaskDescriptor {
    /// Create a descriptor with no headers and no display name.
    pub fn new(
        id: impl Into<String>,
        url: impl Into<String>,
        size: u64,
        file_path: impl Into<String>,
        file_name: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            url: url.into(),
            size,
            file_path: file_path.into(),
            file_name: file_name.into(),
            display_name: None,
            headers: HashMap::new(),
        }
    }

    /// Add a request header.
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// Set the notice display name.
    pub fn display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = Some(name.into());
        self
    }
}

/// A registered download task. This is the record persisted by the task store.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadTask {
    pub id: String,
    pub url: String,
    pub size: u64,
    /// Resolved destination directory
    pub file_path: PathBuf,
    pub file_name: String,
    pub display_name: String,
    pub headers: HashMap<String, String>,
    /// Admission order; lower starts first
    pub sequence_index: u64,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Fraction in [0,1], transient
    #[serde(skip)]
    pub progress: f64,
    #[serde(skip)]
    pub transport_handle: Option<TransportHandle>,
}

impl DownloadTask {
    /// Full path of the finished file.
    pub fn destination(&self) -> PathBuf {
        self.file_path.join(&self.file_name)
    }

    /// Update the status and timestamp.
    pub fn update_status(&mut self, status: TaskStatus) {
        self.status = status;
        self.updated_at = Utc::now();
    }

    /// Snapshot of the public view.
    pub fn view(&self) -> TaskView {
        TaskView {
            id: self.id.clone(),
            status: self.status,
            progress: self.progress,
            file_name: self.file_name.clone(),
            absolute_path: self.destination(),
        }
    }
}

/// What callers see of a task: `{id, status, progress, fileName, absolutePath}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TaskView {
    pub id: String,
    pub status: TaskStatus,
    pub progress: f64,
    pub file_name: String,
    pub absolute_path: PathBuf,
}

impl TaskView {
    /// Progress as a whole percentage for display.
    pub fn percent(&self) -> u8 {
        (self.progress.clamp(0.0, 1.0) * 100.0).round() as u8
    }
}

/// Why a task ended up `Failed`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum FailureReason {
    /// Declared size exceeded free space at admission
    InsufficientSpace,
    /// The transport reported an error (including timeouts)
    Transport,
}

/// Lifecycle and progress events delivered to a notification sink.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "event")]
pub enum TaskEvent {
    #[serde(rename = "onChangeStatus")]
    ChangeStatus { id: String, status: TaskStatus },
    #[serde(rename = "onProgress")]
    Progress { id: String, progress: f64 },
    #[serde(rename = "onComplete", rename_all = "camelCase")]
    Complete {
        id: String,
        file_url: String,
        file_name: String,
        display_name: String,
    },
    #[serde(rename = "onFailed")]
    Failed {
        id: String,
        message: String,
        reason: FailureReason,
    },
}

impl TaskEvent {
    /// Task the event refers to.
    pub fn id(&self) -> &str {
        match self {
            TaskEvent::ChangeStatus { id, .. }
            | TaskEvent::Progress { id, .. }
            | TaskEvent::Complete { id, .. }
            | TaskEvent::Failed { id, .. } => id,
        }
    }

    /// Bridge event name.
    pub fn name(&self) -> &'static str {
        match self {
            TaskEvent::ChangeStatus { .. } => "onChangeStatus",
            TaskEvent::Progress { .. } => "onProgress",
            TaskEvent::Complete { .. } => "onComplete",
            TaskEvent::Failed { .. } => "onFailed",
        }
    }

    /// Returns the terminal status this event announces, if any.
    pub fn terminal_status(&self) -> Option<TaskStatus> {
        match self {
            TaskEvent::ChangeStatus { status, .. } if status.is_terminal() => Some(*status),
            _ => None,
        }
    }
}

/// A task that reached a terminal state and left the registry.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TerminalRecord {
    pub id: String,
    pub status: TaskStatus,
    pub message: Option<String>,
    pub finished_at: DateTime<Utc>,
}

/// Strip a `file://` prefix and resolve a relative directory under `root`.
pub fn resolve_directory(file_path: &str, root: Option<&Path>) -> PathBuf {
    let trimmed = file_path.strip_prefix("file://").unwrap_or(file_path);
    let path = Path::new(trimmed);
    match root {
        Some(root) if path.is_relative() => root.join(path),
        _ => path.to_path_buf(),
    }
}
