// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Resilient lock helpers.
//!
//! Every piece of shared state in the download core sits behind a
//! `std::sync::Mutex`. A panic inside a transport callback or a sink must not
//! take the whole queue down with it, so these helpers recover the guard from
//! a poisoned lock instead of panicking.
//!
//! ```no_run
//! use std::sync::Mutex;
//! use nativedl::locks::resilient_lock;
//!
//! let lock = Mutex::new(42);
//! let mut guard = resilient_lock(&lock);
//! *guard = 100;
//! ```

use std::sync::{Mutex, MutexGuard};

/// Acquire a mutex, recovering from poisoning if necessary.
///
/// When the lock is poisoned (a thread panicked while holding it) the event
/// is logged and the guard is recovered anyway. The registry may then hold
/// a half-applied transition, which the next persisted write overwrites.
#[inline]
pub fn resilient_lock<T>(lock: &Mutex<T>) -> MutexGuard<'_, T> {
    match lock.lock() {
        Ok(guard) => guard,
        Err(poisoned) => {
            tracing::error!(
                target: "nativedl::locks",
                event = "LOCK_POISONED",
                "Mutex was poisoned by a panicking holder. Recovering data."
            );
            poisoned.into_inner()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_resilient_lock_normal() {
        let lock = Mutex::new(42);
        {
            let mut guard = resilient_lock(&lock);
            *guard = 7;
        }
        assert_eq!(*resilient_lock(&lock), 7);
    }

    #[test]
    fn test_resilient_lock_recovers_from_poison() {
        let lock = Arc::new(Mutex::new(vec![1, 2, 3]));
        let lock_clone = Arc::clone(&lock);

        let _ = thread::spawn(move || {
            let _guard = lock_clone.lock().unwrap();
            panic!("intentional panic to poison lock");
        })
        .join();

        assert!(lock.is_poisoned());

        let mut guard = resilient_lock(&lock);
        guard.push(4);
        assert_eq!(*guard, vec![1, 2, 3, 4]);
    }
}
