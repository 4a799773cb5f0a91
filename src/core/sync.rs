// Copyright 2024 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Synchronization between the caller of a parallel region and the worker
//! threads executing it.
//!
//! The caller ([`Lender`]) publishes a task and bumps a region generation. Each
//! worker ([`Borrower`]) waits for the generation it expects, runs the task,
//! and reports back through a drop guard, which also fires while unwinding.

use super::util::{RegionTask, Status, TaskSlot};
use crate::macros::{log_debug, log_error};
use crossbeam_utils::CachePadded;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};

/// What a worker thread should do after [`Borrower::borrow()`] returns.
#[derive(Clone, Copy)]
pub enum WorkerState {
    /// Wait for the next region.
    Ready,
    /// Exit, the pool is shutting down.
    Finished,
}

/// Signal broadcast to the worker threads.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Signal {
    /// Run the region with this generation number.
    Run(u64),
    /// Exit.
    Exit,
}

/// State shared by a lending group.
struct Shared {
    /// Number of workers that haven't finished the current region yet.
    pending: CachePadded<AtomicUsize>,
    /// Number of workers that panicked during the current region.
    panicked: CachePadded<AtomicUsize>,
    signal: Status<Signal>,
    /// Whether all the workers are done with the current region.
    done: Status<bool>,
    task: RwLock<TaskSlot>,
}

/// Creates a [`Lender`] paired with `num_threads` [`Borrower`]s.
pub fn make_lending_group(num_threads: usize) -> (Lender, Vec<Borrower>) {
    let shared = Arc::new(Shared {
        pending: CachePadded::new(AtomicUsize::new(0)),
        panicked: CachePadded::new(AtomicUsize::new(0)),
        signal: Status::new(Signal::Run(0)),
        done: Status::new(false),
        task: RwLock::new(TaskSlot::empty()),
    });

    let borrowers = (0..num_threads)
        .map(|id| Borrower {
            id,
            next_region: 1,
            shared: shared.clone(),
        })
        .collect();

    let lender = Lender {
        num_threads,
        region: 0,
        shared,
    };
    (lender, borrowers)
}

/// Main-thread side of a lending group.
pub struct Lender {
    num_threads: usize,
    /// Generation of the last region lent.
    region: u64,
    shared: Arc<Shared>,
}

impl Lender {
    /// Runs the given task on all the worker threads, returning once every
    /// one of them is done with it.
    ///
    /// Panics if any worker thread panicked while running the task. The group
    /// is left ready for the next call either way.
    pub fn lend(&mut self, task: &(dyn RegionTask + Sync)) {
        let shared = &*self.shared;
        shared.pending.store(self.num_threads, Ordering::SeqCst);
        shared.panicked.store(0, Ordering::SeqCst);

        // The slot is cleared below, after all the workers reported back.
        shared.task.write().unwrap().set(task);

        self.region += 1;
        let region = self.region;
        log_debug!("[main thread] Lending region {region}");
        shared.signal.notify_all(Signal::Run(region));

        *shared.done.wait_while(|done| !*done) = false;
        shared.task.write().unwrap().clear();

        let panicked = shared.panicked.load(Ordering::SeqCst);
        if panicked != 0 {
            log_error!("[main thread] Region {region}: {panicked} worker thread(s) panicked");
            panic!("{panicked} worker thread(s) panicked!");
        }
    }

    /// Tells the worker threads to exit.
    pub fn finish_workers(&mut self) {
        log_debug!("[main thread] Stopping the worker threads");
        self.shared.signal.notify_all(Signal::Exit);
    }
}

/// Worker-thread side of a lending group.
pub struct Borrower {
    id: usize,
    /// Generation of the region this worker waits for.
    next_region: u64,
    shared: Arc<Shared>,
}

impl Borrower {
    /// Returns the index of this worker thread.
    pub fn id(&self) -> usize {
        self.id
    }

    /// Waits for the next region and runs its task.
    ///
    /// Returns [`WorkerState::Finished`] without running anything once
    /// [`Lender::finish_workers()`] was called.
    pub fn borrow(&mut self) -> WorkerState {
        let expected = Signal::Run(self.next_region);
        let signal = *self
            .shared
            .signal
            .wait_while(|signal| *signal != expected && *signal != Signal::Exit);
        if signal == Signal::Exit {
            return WorkerState::Finished;
        }
        self.next_region += 1;

        let _guard = DoneGuard {
            id: self.id,
            shared: &self.shared,
        };
        let slot = self.shared.task.read().unwrap();
        // SAFETY: The lender keeps the task alive until every `DoneGuard` of this
        // region is dropped, and only hands out shared references to it.
        let task = unsafe { slot.get() };
        if let Some(task) = task {
            task.run(self.id);
        }
        WorkerState::Ready
    }
}

/// Reports a worker as done with the current region when dropped, counting it
/// as panicked if dropped while unwinding.
struct DoneGuard<'a> {
    #[cfg_attr(not(feature = "log"), allow(dead_code))]
    id: usize,
    shared: &'a Shared,
}

impl Drop for DoneGuard<'_> {
    fn drop(&mut self) {
        if std::thread::panicking() {
            log_error!("[thread {}] Panicked during a region", self.id);
            self.shared.panicked.fetch_add(1, Ordering::SeqCst);
        }

        let pending = self.shared.pending.fetch_sub(1, Ordering::SeqCst);
        assert!(pending > 0);
        if pending == 1 {
            if let Err(e) = self.shared.done.try_notify_one(true) {
                log_error!("[thread {}] Cannot wake the main thread: {e:?}", self.id);
                panic!("Failed to notify the main thread, the mutex was poisoned: {e:?}");
            }
        }
    }
}
