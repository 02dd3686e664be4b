// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Persistent registry state for downloads.
//!
//! The queue keeps its whole registry in a [`DownloadState`] and hands it to a
//! [`TaskStore`] after every mutation, so pending tasks survive a restart.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};

use super::types::{DownloadTask, TaskStatus};
use crate::locks::resilient_lock;

/// Default timeout for acquiring file locks (5 seconds)
const LOCK_TIMEOUT: Duration = Duration::from_secs(5);

/// Retry interval when waiting for lock acquisition
const LOCK_RETRY_INTERVAL: Duration = Duration::from_millis(50);

/// Lock file marking which process owns a state directory.
pub const QUEUE_LOCK_FILE: &str = "queue.lock";

/// Current on-disk layout version.
pub const STATE_VERSION: u32 = 1;

/// Persistent download state saved by a task store.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadState {
    /// Registered tasks keyed by id
    pub tasks: HashMap<String, DownloadTask>,
    /// Next admission sequence index to hand out
    #[serde(default = "first_sequence")]
    pub next_sequence: u64,
    /// Part files of transfers that were in flight
    #[serde(default)]
    pub partial_files: Vec<PathBuf>,
    /// When the state was last saved
    pub last_saved: Option<DateTime<Utc>>,
    /// Version for future migrations
    pub version: u32,
}

fn first_sequence() -> u64 {
    1
}

impl Default for DownloadState {
    fn default() -> Self {
        Self::new()
    }
}

impl DownloadState {
    /// Create a new empty state.
    pub fn new() -> Self {
        Self {
            tasks: HashMap::new(),
            next_sequence: first_sequence(),
            partial_files: Vec::new(),
            last_saved: None,
            version: STATE_VERSION,
        }
    }

    /// Hand out the next admission index.
    pub fn allocate_sequence(&mut self) -> u64 {
        // Never go backwards, even if an older file carried a stale counter.
        let floor = self.tasks.values().map(|t| t.sequence_index + 1).max().unwrap_or(1);
        let index = self.next_sequence.max(floor);
        self.next_sequence = index + 1;
        index
    }

    /// Add or update a task.
    pub fn upsert_task(&mut self, task: DownloadTask) {
        self.tasks.insert(task.id.clone(), task);
    }

    /// Get a task by ID.
    pub fn get_task(&self, id: &str) -> Option<&DownloadTask> {
        self.tasks.get(id)
    }

    /// Get a mutable task by ID.
    pub fn get_task_mut(&mut self, id: &str) -> Option<&mut DownloadTask> {
        self.tasks.get_mut(id)
    }

    /// Remove a task.
    pub fn remove_task(&mut self, id: &str) -> Option<DownloadTask> {
        self.tasks.remove(id)
    }

    /// All tasks in admission order.
    pub fn ordered_tasks(&self) -> Vec<&DownloadTask> {
        let mut tasks: Vec<_> = self.tasks.values().collect();
        tasks.sort_by_key(|t| t.sequence_index);
        tasks
    }

    /// Earliest-admitted task whose status is in `eligible`.
    pub fn next_eligible(&self, eligible: &[TaskStatus]) -> Option<&DownloadTask> {
        self.tasks
            .values()
            .filter(|t| eligible.contains(&t.status))
            .min_by_key(|t| t.sequence_index)
    }

    /// Remember a part file for startup cleanup.
    pub fn track_partial(&mut self, path: PathBuf) {
        if !self.partial_files.contains(&path) {
            self.partial_files.push(path);
        }
    }

    /// Forget a part file.
    pub fn untrack_partial(&mut self, path: &Path) {
        self.partial_files.retain(|p| p != path);
    }

    /// Delete every tracked part file and clear the list.
    ///
    /// Only meaningful when nothing is in flight, i.e. at startup. Returns the
    /// number of files actually removed.
    pub fn remove_partial_files(&mut self) -> usize {
        let mut removed = 0;
        for path in self.partial_files.drain(..) {
            match fs::remove_file(&path) {
                Ok(()) => {
                    tracing::info!(path = %path.display(), "removed interrupted partial download");
                    removed += 1;
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    tracing::warn!(path = %path.display(), "failed to remove partial download: {}", e);
                }
            }
        }
        removed
    }

    /// Get count of tasks by status: (waiting, queued, active, paused).
    pub fn status_counts(&self) -> (usize, usize, usize, usize) {
        let mut waiting = 0;
        let mut queued = 0;
        let mut active = 0;
        let mut paused = 0;

        for task in self.tasks.values() {
            match task.status {
                TaskStatus::Waiting => waiting += 1,
                TaskStatus::Queued => queued += 1,
                TaskStatus::Downloading => active += 1,
                TaskStatus::Paused => paused += 1,
                // Terminal tasks leave the registry; nothing to count.
                TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled => {}
            }
        }

        (waiting, queued, active, paused)
    }
}

/// Exclusive ownership of a state directory for the lifetime of a queue.
///
/// Opening a queue reconciles the registry and deletes leftover part files,
/// so at most one process may do it per directory. The lock is released when
/// this value is dropped or the process dies.
#[derive(Debug)]
pub struct QueueLock {
    file: File,
    path: PathBuf,
}

impl QueueLock {
    /// Take ownership of `dir`, failing at once if another owner holds it.
    pub fn acquire(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create state directory: {:?}", dir))?;

        let path = dir.join(QUEUE_LOCK_FILE);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .with_context(|| format!("Failed to open lock file: {:?}", path))?;

        match file.try_lock_exclusive() {
            Ok(()) => {
                tracing::debug!(lock = %path.display(), "acquired download queue");
                Ok(Self { file, path })
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => bail!(
                "download queue in {:?} is in use by another nativedl process",
                dir
            ),
            Err(e) => Err(e).with_context(|| format!("Failed to lock {:?}", path)),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for QueueLock {
    fn drop(&mut self) {
        if let Err(e) = self.file.unlock() {
            tracing::warn!(lock = %self.path.display(), "failed to release queue lock: {}", e);
        }
    }
}

/// Durable storage for the registry: load everything, save everything.
pub trait TaskStore: Send + Sync {
    /// Load the last saved state, or an empty one if nothing was saved.
    fn load(&self) -> Result<DownloadState>;

    /// Replace the saved state.
    fn save(&self, state: &DownloadState) -> Result<()>;
}

/// Stores the registry as a JSON file guarded by a sibling `.lock` file.
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    path: PathBuf,
    lock_timeout: Duration,
}

impl JsonFileStore {
    /// Store at an explicit path.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock_timeout: LOCK_TIMEOUT,
        }
    }

    /// Store at `<dir>/state.json`.
    pub fn in_dir(dir: impl AsRef<Path>) -> Self {
        Self::new(dir.as_ref().join("state.json"))
    }

    /// Override the lock acquisition timeout.
    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    /// Get the state file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Get the lock file path for the state file.
    ///
    /// A separate .lock file lets the lock be held across the atomic rename.
    fn lock_path(&self) -> PathBuf {
        self.path.with_extension("lock")
    }

    /// Acquire an exclusive lock with timeout.
    ///
    /// Returns the locked file handle on success, or an error if the timeout expires.
    fn acquire_exclusive_lock_with_timeout(path: &Path, timeout: Duration) -> Result<File> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory for lock file: {:?}", parent))?;
        }

        let lock_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .with_context(|| format!("Failed to open lock file: {:?}", path))?;

        let start = Instant::now();

        loop {
            match lock_file.try_lock_exclusive() {
                Ok(()) => return Ok(lock_file),
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    if start.elapsed() >= timeout {
                        bail!(
                            "Timed out waiting for exclusive lock on {:?} after {:?}. \
                             Another instance may be writing to the state file.",
                            path,
                            timeout
                        );
                    }
                    thread::sleep(LOCK_RETRY_INTERVAL);
                }
                Err(e) => {
                    return Err(e).with_context(|| {
                        format!("Failed to acquire exclusive lock on {:?}", path)
                    });
                }
            }
        }
    }

    /// Acquire a shared lock with timeout.
    fn acquire_shared_lock_with_timeout(file: &File, timeout: Duration) -> Result<()> {
        let start = Instant::now();

        loop {
            match FileExt::try_lock_shared(file) {
                Ok(()) => return Ok(()),
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    if start.elapsed() >= timeout {
                        bail!(
                            "Timed out waiting for shared lock after {:?}. \
                             Another instance may be writing to the state file.",
                            timeout
                        );
                    }
                    thread::sleep(LOCK_RETRY_INTERVAL);
                }
                Err(e) => {
                    return Err(e).with_context(|| "Failed to acquire shared lock on state file");
                }
            }
        }
    }
}

impl TaskStore for JsonFileStore {
    /// Load state under a shared lock, so readers only wait for writers.
    fn load(&self) -> Result<DownloadState> {
        let lock_path = self.lock_path();

        if !self.path.exists() {
            return Ok(DownloadState::new());
        }

        let lock_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&lock_path)
            .with_context(|| format!("Failed to open lock file: {:?}", lock_path))?;

        Self::acquire_shared_lock_with_timeout(&lock_file, self.lock_timeout)?;

        let content = fs::read_to_string(&self.path)
            .with_context(|| format!("Failed to read state file: {:?}", self.path))?;

        let state: DownloadState = serde_json::from_str(&content)
            .with_context(|| "Failed to parse state file")?;

        Ok(state)
    }

    /// Save state with a temp file + atomic rename under an exclusive lock.
    ///
    /// The lock is held during the entire write including the rename, so two
    /// processes sharing a state directory never interleave their writes.
    fn save(&self, state: &DownloadState) -> Result<()> {
        let lock_path = self.lock_path();

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory: {:?}", parent))?;
        }

        let _lock_guard = Self::acquire_exclusive_lock_with_timeout(&lock_path, self.lock_timeout)?;

        let temp_path = self.path.with_extension("tmp");

        let content = serde_json::to_string_pretty(state)
            .with_context(|| "Failed to serialize state to JSON")?;

        {
            let mut temp_file = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(&temp_path)
                .with_context(|| format!("Failed to create temp file: {:?}", temp_path))?;

            temp_file.write_all(content.as_bytes())
                .with_context(|| "Failed to write to temp file")?;

            temp_file.sync_all()
                .with_context(|| "Failed to sync temp file to disk")?;
        }

        // Atomic on POSIX, best-effort on Windows
        fs::rename(&temp_path, &self.path)
            .with_context(|| format!("Failed to rename temp file to state file: {:?} -> {:?}", temp_path, self.path))?;

        Ok(())
    }
}

/// In-process store that keeps the serialized JSON in memory.
///
/// Going through serde keeps it honest about what actually survives a save.
#[derive(Debug, Default)]
pub struct MemoryStore {
    saved: Mutex<Option<String>>,
    saves: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the store as if `state` had been saved by an earlier process.
    pub fn with_state(state: &DownloadState) -> Result<Self> {
        let store = Self::new();
        store.save(state)?;
        store.saves.store(0, Ordering::SeqCst);
        Ok(store)
    }

    /// Number of saves since creation (seeding excluded).
    pub fn saves(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }

    /// Decode the last saved state.
    pub fn snapshot(&self) -> Option<DownloadState> {
        let saved = resilient_lock(&self.saved);
        saved.as_deref().and_then(|json| serde_json::from_str(json).ok())
    }
}

impl TaskStore for MemoryStore {
    fn load(&self) -> Result<DownloadState> {
        let saved = resilient_lock(&self.saved);
        match saved.as_deref() {
            Some(json) => serde_json::from_str(json).with_context(|| "Failed to parse saved state"),
            None => Ok(DownloadState::new()),
        }
    }

    fn save(&self, state: &DownloadState) -> Result<()> {
        let json = serde_json::to_string(state).with_context(|| "Failed to serialize state")?;
        *resilient_lock(&self.saved) = Some(json);
        self.saves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
