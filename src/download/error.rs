// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Errors returned synchronously by queue operations.
//!
//! Transfer failures are not in here on purpose: they surface only as a
//! `Failed` transition and an `onFailed` event.

use thiserror::Error;

/// Message shown when a transfer fails.
pub const MSG_DOWNLOAD_FAILED: &str = "Failed to download the data";

/// Message shown when admission control rejects a task.
pub const MSG_CAPACITY_LACK: &str = "Not enough free space on the device to download";

#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("a task with id '{0}' is already registered")]
    DuplicateId(String),

    #[error("no task with id '{0}'")]
    NotFound(String),

    #[error("invalid task descriptor: {0}")]
    InvalidDescriptor(String),

    #[error("insufficient space for '{id}': {required} bytes required, {} available", fmt_available(.available))]
    InsufficientSpace {
        id: String,
        required: u64,
        available: Option<u64>,
    },

    #[error("transport failure: {0}")]
    TransportFailure(String),

    #[error("task store error: {0}")]
    Store(#[from] anyhow::Error),
}

impl DownloadError {
    /// Human-readable message for presenting to end users.
    ///
    /// Capacity problems get their own message so the caller can tell them
    /// apart from generic transfer failures.
    pub fn user_message(&self) -> String {
        match self {
            DownloadError::InsufficientSpace { .. } => MSG_CAPACITY_LACK.to_string(),
            DownloadError::TransportFailure(_) => MSG_DOWNLOAD_FAILED.to_string(),
            other => other.to_string(),
        }
    }

    /// Short machine-readable code for bridge rejections.
    pub fn code(&self) -> &'static str {
        match self {
            DownloadError::DuplicateId(_) => "DuplicateId",
            DownloadError::NotFound(_) => "NotFound",
            DownloadError::InvalidDescriptor(_) => "InvalidDescriptor",
            DownloadError::InsufficientSpace { .. } => "InsufficientSpace",
            DownloadError::TransportFailure(_) => "TransportFailure",
            DownloadError::Store(_) => "Store",
        }
    }
}

fn fmt_available(available: &Option<u64>) -> String {
    available.map(|b| b.to_string()).unwrap_or_else(|| "unknown".to_string())
}

pub type Result<T> = std::result::Result<T, DownloadError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insufficient_space_display() {
        let err = DownloadError::InsufficientSpace {
            id: "c".into(),
            required: 5000,
            available: Some(100),
        };
        assert_eq!(
            err.to_string(),
            "insufficient space for 'c': 5000 bytes required, 100 available"
        );
        assert_eq!(err.user_message(), MSG_CAPACITY_LACK);
        assert_eq!(err.code(), "InsufficientSpace");

        let unknown = DownloadError::InsufficientSpace { id: "c".into(), required: 1, available: None };
        assert!(unknown.to_string().ends_with("unknown available"));
    }

    #[test]
    fn test_user_message_distinguishes_transport() {
        let err = DownloadError::TransportFailure("HTTP 500".into());
        assert_eq!(err.user_message(), MSG_DOWNLOAD_FAILED);
        assert_ne!(err.user_message(), MSG_CAPACITY_LACK);
    }
}
