// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Free-space queries for admission control.

use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

/// Reports free bytes on the volume holding a path.
pub trait SpaceChecker: Send + Sync {
    fn available_bytes(&self, path: &Path) -> io::Result<u64>;
}

/// Queries the real filesystem through `fs2`.
///
/// The destination directory usually does not exist yet, so the query walks up
/// to the nearest existing ancestor, which lives on the same volume.
#[derive(Debug, Default, Clone, Copy)]
pub struct FsSpaceChecker;

impl SpaceChecker for FsSpaceChecker {
    fn available_bytes(&self, path: &Path) -> io::Result<u64> {
        let existing = path
            .ancestors()
            .find(|p| !p.as_os_str().is_empty() && p.exists())
            .unwrap_or_else(|| Path::new("."));
        fs2::available_space(existing)
    }
}

/// A fixed, adjustable free-space figure.
///
/// Handy for sandboxes and tests where the real disk must not decide.
#[derive(Debug)]
pub struct StaticSpace {
    bytes: AtomicU64,
}

impl StaticSpace {
    pub fn new(bytes: u64) -> Self {
        Self { bytes: AtomicU64::new(bytes) }
    }

    pub fn set(&self, bytes: u64) {
        self.bytes.store(bytes, Ordering::SeqCst);
    }
}

impl SpaceChecker for StaticSpace {
    fn available_bytes(&self, _path: &Path) -> io::Result<u64> {
        Ok(self.bytes.load(Ordering::SeqCst))
    }
}
