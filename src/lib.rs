// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! nativedl - single-flight download queue library
//!
//! Downloads files one at a time, in the order they were asked for, and keeps
//! the pending queue across restarts.
//!
//! # Core Modules
//!
//! - [`download`] - Task registry, queue state machine, transports and events
//! - [`config`] - User configuration and queue options
//! - [`error`] - Consistent error formatting utilities
//! - [`locks`] - Poison-tolerant mutex access

pub mod config;
pub mod download;
pub mod error;
pub mod locks;

// Re-export commonly used types from the download module
pub use download::{
    DownloadError, DownloadManager, DownloadQueue, QueueParts, TaskDescriptor, TaskEvent,
    TaskStatus, TaskView,
};

// Re-export configuration
pub use config::{DownloaderConfig, QueueOptions};

// Re-export error utilities
pub use error::{explain, format_error, format_simple_error, ErrorBuilder, HELP_HINT};
