// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Race Detection Tests for nativedl
//!
//! These tests hammer one shared `DownloadQueue` from many threads while a
//! separate thread plays the network, and check the single-flight invariant
//! after every step. They are designed to detect data races when run with
//! ThreadSanitizer (TSAN).
//!
//! # Running with ThreadSanitizer
//!
//! ```bash
//! # On Linux with nightly Rust:
//! RUSTFLAGS="-Z sanitizer=thread" cargo +nightly test --target x86_64-unknown-linux-gnu --test race_detection_test
//! ```

mod common;

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use common::{descriptor, RecordingTransport};
use nativedl::config::QueueOptions;
use nativedl::download::{
    DownloadQueue, MemoryStore, NullSink, QueueParts, StaticSpace, TaskStatus, TransportEventReceiver,
};

// Test configuration
const WORKERS: usize = 8;
const OPS_PER_WORKER: usize = 400;
const TASK_IDS: usize = 12;
const TEST_TIMEOUT_SECS: u64 = 30;

/// Small deterministic generator so every worker gets its own op sequence.
struct Lcg(u64);

impl Lcg {
    fn next(&mut self) -> u64 {
        self.0 = self.0.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
        self.0 >> 33
    }

    fn below(&mut self, n: usize) -> usize {
        (self.next() % n as u64) as usize
    }
}

fn shared_queue(free_bytes: u64) -> (Arc<DownloadQueue>, TransportEventReceiver, Arc<RecordingTransport>, Arc<MemoryStore>) {
    let transport = Arc::new(RecordingTransport::new());
    let store = Arc::new(MemoryStore::new());
    let parts = QueueParts {
        transport: transport.clone(),
        space: Arc::new(StaticSpace::new(free_bytes)),
        store: store.clone(),
        sink: Arc::new(NullSink),
    };
    let (queue, rx) = DownloadQueue::open(parts, QueueOptions::default()).unwrap();
    (Arc::new(queue), rx, transport, store)
}

/// Downloading and paused tasks both hold the slot.
fn slot_holders(queue: &DownloadQueue) -> usize {
    queue
        .list()
        .iter()
        .filter(|v| matches!(v.status, TaskStatus::Downloading | TaskStatus::Paused))
        .count()
}

// =============================================================================
// SINGLE-FLIGHT UNDER CONTENTION
// =============================================================================

#[test]
fn test_single_flight_under_concurrent_operations() {
    let (queue, rx, transport, _store) = shared_queue(u64::MAX);
    let rx = Arc::new(Mutex::new(rx));
    let stop = Arc::new(AtomicBool::new(false));
    let violations = Arc::new(Mutex::new(Vec::new()));
    let deadline = Instant::now() + Duration::from_secs(TEST_TIMEOUT_SECS);

    // The network: finishes, fails and reports progress for whatever is running.
    let network = {
        let (queue, transport, rx, stop) = (queue.clone(), transport.clone(), rx.clone(), stop.clone());
        thread::spawn(move || {
            let mut rng = Lcg(99);
            while !stop.load(Ordering::SeqCst) && Instant::now() < deadline {
                if let Some(id) = queue.active_id() {
                    match rng.below(4) {
                        0 => {
                            transport.complete(&id);
                        }
                        1 => {
                            transport.fail(&id, "connection reset");
                        }
                        _ => {
                            transport.progress(&id, rng.below(100) as f64 / 100.0);
                        }
                    }
                }
                queue.drain_events(&mut rx.lock().unwrap());
                thread::yield_now();
            }
        })
    };

    let mut workers = vec![];
    for w in 0..WORKERS {
        let (queue, rx, violations) = (queue.clone(), rx.clone(), violations.clone());
        workers.push(thread::spawn(move || {
            let mut rng = Lcg(w as u64 + 1);
            for _ in 0..OPS_PER_WORKER {
                let id = format!("t{}", rng.below(TASK_IDS));
                let _ = match rng.below(7) {
                    0 | 1 => queue.add(descriptor(&id, 10)),
                    2 | 3 => queue.start(&id),
                    4 => queue.pause(&id),
                    5 => queue.resume(&id),
                    _ => queue.cancel(&id),
                };
                if rng.below(5) == 0 {
                    // Callbacks and caller operations interleave from several threads.
                    if let Ok(mut rx) = rx.try_lock() {
                        queue.drain_events(&mut rx);
                    }
                }

                let holders = slot_holders(&queue);
                if holders > 1 {
                    violations.lock().unwrap().push(holders);
                }
            }
        }));
    }

    for worker in workers {
        worker.join().expect("Worker panicked");
    }
    stop.store(true, Ordering::SeqCst);
    network.join().expect("Network thread panicked");

    assert!(violations.lock().unwrap().is_empty(), "more than one task held the slot");

    // The slot owner and the registry agree.
    let holders: Vec<_> = queue
        .list()
        .into_iter()
        .filter(|v| matches!(v.status, TaskStatus::Downloading | TaskStatus::Paused))
        .map(|v| v.id)
        .collect();
    assert_eq!(holders, queue.active_id().into_iter().collect::<Vec<_>>());
}

#[test]
fn test_concurrent_adds_get_unique_ordered_indices() {
    let (queue, _rx, _transport, store) = shared_queue(u64::MAX);

    let mut handles = vec![];
    for w in 0..WORKERS {
        let queue = queue.clone();
        handles.push(thread::spawn(move || {
            for i in 0..50 {
                queue.add(descriptor(&format!("w{w}-{i}"), 1)).unwrap();
            }
        }));
    }
    for handle in handles {
        handle.join().expect("Thread panicked");
    }

    let state = store.snapshot().unwrap();
    assert_eq!(state.tasks.len(), WORKERS * 50);
    let indices: HashSet<_> = state.tasks.values().map(|t| t.sequence_index).collect();
    assert_eq!(indices.len(), WORKERS * 50, "no two tasks share an index");

    // Each worker's own tasks were admitted in its call order.
    for w in 0..WORKERS {
        let own: Vec<_> = (0..50)
            .map(|i| state.get_task(&format!("w{w}-{i}")).unwrap().sequence_index)
            .collect();
        assert!(own.windows(2).all(|p| p[0] < p[1]));
    }
}

#[test]
fn test_cancel_racing_completion_never_resurrects() {
    for round in 0..50 {
        let (queue, mut rx, transport, _store) = shared_queue(u64::MAX);
        let id = format!("r{round}");
        queue.add(descriptor(&id, 1)).unwrap();
        queue.start(&id).unwrap();

        let canceller = {
            let (queue, id) = (queue.clone(), id.clone());
            thread::spawn(move || {
                let _ = queue.cancel(&id);
            })
        };
        transport.complete(&id);
        canceller.join().expect("Canceller panicked");
        queue.drain_events(&mut rx);

        assert!(queue.get(&id).is_err(), "task gone after cancel or completion");
        assert!(queue.active_id().is_none());
        let outcome = queue.last_outcome(&id).unwrap().status;
        assert!(matches!(outcome, TaskStatus::Cancelled | TaskStatus::Completed));
        assert_eq!(queue.history().len(), 1, "exactly one terminal transition");
    }
}
