// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Consistent error formatting for nativedl.
//!
//! Provides utilities to format errors with actionable information including
//! possible causes and suggested fixes.

use std::fmt;

use crate::download::DownloadError;

/// Closing line of every formatted error.
pub const HELP_HINT: &str = "Need help? Run: nativedl --help";

/// Formats an error message with title, causes, fixes, and help hint.
///
/// # Example
///
/// ```
/// use nativedl::error::format_error;
///
/// let error = format_error(
///     "Failed to open the download registry",
///     &["Another nativedl process holds the state lock"],
///     &["Wait for the other process, then retry"],
/// );
/// println!("{}", error);
/// ```
pub fn format_error(title: &str, causes: &[&str], fixes: &[&str]) -> String {
    let mut output = String::new();

    output.push_str(&format!("[✗] {}\n\n", title));

    if !causes.is_empty() {
        output.push_str("Possible causes:\n");
        for cause in causes {
            output.push_str(&format!("  - {}\n", cause));
        }
        output.push('\n');
    }

    if !fixes.is_empty() {
        output.push_str("Try these fixes:\n");
        for (i, fix) in fixes.iter().enumerate() {
            output.push_str(&format!("  {}. {}\n", i + 1, fix));
        }
        output.push('\n');
    }

    output.push_str(HELP_HINT);
    output
}

/// Formats a simple error with just a title and help hint.
pub fn format_simple_error(title: &str) -> String {
    format!("[✗] {}\n\n{}", title, HELP_HINT)
}

/// Builder for constructing formatted error messages.
///
/// # Example
///
/// ```
/// use nativedl::error::ErrorBuilder;
///
/// let error = ErrorBuilder::new("Download rejected")
///     .cause("Not enough free space")
///     .fix("Free up disk space: nativedl clean")
///     .build();
/// println!("{}", error);
/// ```
#[derive(Debug, Clone)]
pub struct ErrorBuilder {
    title: String,
    causes: Vec<String>,
    fixes: Vec<String>,
}

impl ErrorBuilder {
    /// Create a new error builder with the given title.
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            causes: Vec::new(),
            fixes: Vec::new(),
        }
    }

    /// Add a possible cause.
    pub fn cause(mut self, cause: impl Into<String>) -> Self {
        self.causes.push(cause.into());
        self
    }

    /// Add a suggested fix.
    pub fn fix(mut self, fix: impl Into<String>) -> Self {
        self.fixes.push(fix.into());
        self
    }

    /// Build the formatted error message.
    pub fn build(self) -> String {
        let causes: Vec<&str> = self.causes.iter().map(|s| s.as_str()).collect();
        let fixes: Vec<&str> = self.fixes.iter().map(|s| s.as_str()).collect();
        format_error(&self.title, &causes, &fixes)
    }
}

impl fmt::Display for ErrorBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.clone().build())
    }
}

/// Turn a rejected queue operation into an actionable message for the terminal.
pub fn explain(err: &DownloadError) -> String {
    match err {
        DownloadError::DuplicateId(id) => ErrorBuilder::new(err.to_string())
            .cause("The task was added before and has not finished yet")
            .fix(format!("Check its state: nativedl get {}", id))
            .fix(format!("Drop it first: nativedl cancel {}", id))
            .build(),
        DownloadError::NotFound(_) => ErrorBuilder::new(err.to_string())
            .cause("The id is misspelled")
            .cause("The task already completed, failed or was cancelled")
            .fix("List registered tasks: nativedl list")
            .build(),
        DownloadError::InvalidDescriptor(_) => ErrorBuilder::new(err.to_string())
            .cause("The URL is not absolute or the file name contains a path")
            .fix("See the expected arguments: nativedl add --help")
            .build(),
        DownloadError::InsufficientSpace { .. } => ErrorBuilder::new(err.user_message())
            .cause(err.to_string())
            .fix("Free up space on the destination volume")
            .fix("Remove leftover partial files: nativedl clean")
            .build(),
        DownloadError::TransportFailure(_) => ErrorBuilder::new(err.to_string())
            .cause("The HTTP client could not be set up")
            .fix("Check connect_timeout_secs and user_agent: nativedl config show")
            .build(),
        DownloadError::Store(e) => ErrorBuilder::new("Failed to access the download registry")
            .cause(format!("{:#}", e))
            .cause("Another nativedl process may own the download queue")
            .fix("Wait for a running `nativedl start` to finish, or stop it with Ctrl+C")
            .fix("Check the state_dir setting: nativedl config show")
            .build(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_error() {
        let error = format_error(
            "Test Error",
            &["Cause 1", "Cause 2"],
            &["Fix 1", "Fix 2"],
        );

        assert!(error.contains("[✗] Test Error"));
        assert!(error.contains("Possible causes:"));
        assert!(error.contains("  - Cause 1"));
        assert!(error.contains("  - Cause 2"));
        assert!(error.contains("Try these fixes:"));
        assert!(error.contains("  1. Fix 1"));
        assert!(error.contains("  2. Fix 2"));
        assert!(error.ends_with(HELP_HINT));
    }

    #[test]
    fn test_format_simple_error() {
        let error = format_simple_error("Simple error");
        assert!(error.contains("[✗] Simple error"));
        assert!(error.contains(HELP_HINT));
    }

    #[test]
    fn test_error_builder_display() {
        let builder = ErrorBuilder::new("Display test")
            .cause("Cause")
            .fix("Fix");

        let error = format!("{}", builder);
        assert!(error.contains("[✗] Display test"));
        assert!(error.contains("  1. Fix"));
    }

    #[test]
    fn test_empty_causes_and_fixes() {
        let error = format_error("Empty test", &[], &[]);
        assert!(!error.contains("Possible causes:"));
        assert!(!error.contains("Try these fixes:"));
    }

    #[test]
    fn test_explain_insufficient_space_leads_with_user_message() {
        let err = DownloadError::InsufficientSpace {
            id: "big".into(),
            required: 10,
            available: Some(1),
        };
        let text = explain(&err);
        assert!(text.starts_with("[✗] Not enough free space on the device to download"));
        assert!(text.contains("10 bytes required"));
    }

    #[test]
    fn test_explain_duplicate_points_at_the_id() {
        let text = explain(&DownloadError::DuplicateId("ep-1".into()));
        assert!(text.contains("nativedl get ep-1"));
    }
}
