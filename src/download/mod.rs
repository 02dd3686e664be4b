// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Single-flight download queue
//!
//! This module runs file downloads one at a time with:
//! - Persisted tasks that survive restarts
//! - Pause, resume and cancel of the active transfer
//! - Free-space admission before any bytes are fetched
//! - Lifecycle and progress events for the host UI
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐     ┌─────────────────┐
//! │ DownloadManager │────▶│ event pump      │
//! │                 │     │ (tokio task)    │
//! └────────┬────────┘     └────────┬────────┘
//!          │                       │ TransportEvent
//!          ▼                       ▼
//! ┌─────────────────┐     ┌─────────────────┐
//! │ DownloadQueue   │────▶│ Transport       │
//! │ (one mutex)     │     │ (HttpTransport) │
//! └───┬─────────┬───┘     └─────────────────┘
//!     ▼         ▼
//! TaskStore  NotificationSink
//! ```
//!
//! # Usage
//!
//! ```rust,no_run
//! use nativedl::config::DownloaderConfig;
//! use nativedl::download::{DownloadManager, TaskDescriptor};
//!
//! # async fn example() -> anyhow::Result<()> {
//! let manager = DownloadManager::new(&DownloaderConfig::default())?;
//!
//! manager.add(TaskDescriptor::new(
//!     "ep-1",
//!     "https://example.com/ep1.mp3",
//!     48_000_000,
//!     "file:///data/podcasts",
//!     "ep1.mp3",
//! ))?;
//! manager.start("ep-1")?;
//!
//! let outcome = manager.wait("ep-1").await?;
//! println!("{}: {}", outcome.id, outcome.status);
//! # Ok(())
//! # }
//! ```

pub mod error;
pub mod http;
pub mod manager;
pub mod notify;
pub mod queue;
pub mod space;
pub mod state;
pub mod transport;
pub mod types;

// Re-export commonly used items
pub use error::{DownloadError, MSG_CAPACITY_LACK, MSG_DOWNLOAD_FAILED};
pub use http::HttpTransport;
pub use manager::DownloadManager;
pub use notify::{
    BroadcastSink, ChannelSink, CompletionNotices, FanoutSink, Notice, NotificationSink, NullSink,
    TracingSink,
};
pub use queue::{DownloadQueue, QueueParts};
pub use space::{FsSpaceChecker, SpaceChecker, StaticSpace};
pub use state::{DownloadState, JsonFileStore, MemoryStore, QueueLock, TaskStore, QUEUE_LOCK_FILE};
pub use transport::{
    EventSender, Transport, TransportEvent, TransportEventKind, TransportEventReceiver,
    TransportHandle, TransportRequest,
};
pub use types::{
    DownloadTask, FailureReason, TaskDescriptor, TaskEvent, TaskStatus, TaskView, TerminalRecord,
};
