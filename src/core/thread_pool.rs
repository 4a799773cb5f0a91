// Copyright 2024-2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! A pool of persistent worker threads running parallel regions.

use super::sync::{make_lending_group, Borrower, Lender, WorkerState};
use super::util::RegionTask;
use crate::macros::{log_debug, log_error, log_warn};
// Platforms that support `libc::sched_setaffinity()`.
#[cfg(all(
    not(miri),
    any(
        target_os = "android",
        target_os = "dragonfly",
        target_os = "freebsd",
        target_os = "linux"
    )
))]
use nix::{
    sched::{sched_setaffinity, CpuSet},
    unistd::Pid,
};
use std::convert::TryFrom;
use std::num::NonZeroUsize;
use std::panic::AssertUnwindSafe;
use std::sync::Mutex;
use std::thread::JoinHandle;

/// Number of threads to spawn in a thread pool, or to balance work over.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ThreadCount {
    /// Use the number of threads returned by
    /// [`std::thread::available_parallelism()`].
    AvailableParallelism,
    /// Use the given number of threads.
    Count(NonZeroUsize),
}

impl ThreadCount {
    /// Resolves this to a concrete number of threads.
    ///
    /// If the available parallelism cannot be queried, this falls back to a
    /// single thread.
    pub fn count(self) -> NonZeroUsize {
        match self {
            ThreadCount::AvailableParallelism => {
                std::thread::available_parallelism().unwrap_or_else(|_e| {
                    log_warn!("Getting the available parallelism failed: {_e}");
                    NonZeroUsize::MIN
                })
            }
            ThreadCount::Count(count) => count,
        }
    }
}

impl TryFrom<usize> for ThreadCount {
    type Error = <NonZeroUsize as TryFrom<usize>>::Error;

    fn try_from(thread_count: usize) -> Result<Self, Self::Error> {
        let count = NonZeroUsize::try_from(thread_count)?;
        Ok(ThreadCount::Count(count))
    }
}

/// Policy to pin worker threads to CPUs.
#[derive(Clone, Copy)]
pub enum CpuPinningPolicy {
    /// Don't pin worker threads to CPUs.
    No,
    /// Pin each worker thread to a CPU, if CPU pinning is supported and
    /// implemented on this platform.
    IfSupported,
    /// Pin each worker thread to a CPU. If CPU pinning isn't supported on this
    /// platform (or not implemented), building a thread pool will panic.
    Always,
}

/// A builder for [`ThreadPool`].
pub struct ThreadPoolBuilder {
    /// Number of worker threads to spawn in the pool.
    pub num_threads: ThreadCount,
    /// Policy to pin worker threads to CPUs.
    pub cpu_pinning: CpuPinningPolicy,
}

impl ThreadPoolBuilder {
    /// Spawns a thread pool.
    ///
    /// ```
    /// # use sievework::{CpuPinningPolicy, ThreadCount, ThreadPoolBuilder};
    /// let pool_builder = ThreadPoolBuilder {
    ///     num_threads: ThreadCount::AvailableParallelism,
    ///     cpu_pinning: CpuPinningPolicy::No,
    /// };
    /// let mut thread_pool = pool_builder.build();
    ///
    /// let num_threads = thread_pool.num_threads().get();
    /// let sum = thread_pool.region(thread_pool.num_threads(), |id| id, |a, b| a + b);
    /// assert_eq!(sum, num_threads * (num_threads - 1) / 2);
    /// ```
    pub fn build(&self) -> ThreadPool {
        ThreadPool::new(self.num_threads.count().get(), self.cpu_pinning)
    }
}

/// A fixed set of OS worker threads, spawned once and reused by successive
/// parallel regions.
///
/// The threads are joined when the pool is dropped.
pub struct ThreadPool {
    /// Handles to all the worker threads in the pool.
    threads: Vec<WorkerThreadHandle>,
    /// Region tasks lent to the worker threads.
    lender: Lender,
}

/// Handle to a worker thread in a thread pool.
struct WorkerThreadHandle {
    /// Thread handle object.
    handle: JoinHandle<()>,
}

impl ThreadPool {
    /// Creates a new thread pool using the given parameters.
    fn new(num_threads: usize, cpu_pinning: CpuPinningPolicy) -> Self {
        let (lender, borrowers) = make_lending_group(num_threads);

        #[cfg(any(
            miri,
            not(any(
                target_os = "android",
                target_os = "dragonfly",
                target_os = "freebsd",
                target_os = "linux"
            ))
        ))]
        match cpu_pinning {
            CpuPinningPolicy::No => (),
            CpuPinningPolicy::IfSupported => {
                log_warn!("Pinning threads to CPUs is not implemented on this platform.")
            }
            CpuPinningPolicy::Always => {
                panic!("Pinning threads to CPUs is not implemented on this platform.")
            }
        }

        let threads = borrowers
            .into_iter()
            .map(|borrower| {
                let mut context = ThreadContext { borrower };
                WorkerThreadHandle {
                    handle: std::thread::spawn(move || {
                        #[cfg(all(
                            not(miri),
                            any(
                                target_os = "android",
                                target_os = "dragonfly",
                                target_os = "freebsd",
                                target_os = "linux"
                            )
                        ))]
                        pin_to_cpu(context.borrower.id(), cpu_pinning);
                        context.run()
                    }),
                }
            })
            .collect();
        log_debug!("[main thread] Spawned {num_threads} thread(s)");

        Self { threads, lender }
    }

    /// Returns the number of worker threads that have been spawned in this
    /// thread pool.
    pub fn num_threads(&self) -> NonZeroUsize {
        NonZeroUsize::new(self.threads.len()).unwrap_or(NonZeroUsize::MIN)
    }

    /// Runs `work` on the first `min(num_active, num_threads())` worker
    /// threads, and folds their outputs with `reduce`.
    ///
    /// Each active worker calls `work` exactly once with its index in
    /// `0..num_active`. This blocks until all of them have returned.
    ///
    /// If any worker panics, this panics with a message counting the panicking
    /// workers, once all the workers are done. The pool remains usable
    /// afterwards.
    ///
    /// ```
    /// # use sievework::{CpuPinningPolicy, ThreadCount, ThreadPoolBuilder};
    /// # use std::num::NonZeroUsize;
    /// let mut thread_pool = ThreadPoolBuilder {
    ///     num_threads: ThreadCount::try_from(4).unwrap(),
    ///     cpu_pinning: CpuPinningPolicy::No,
    /// }
    /// .build();
    ///
    /// let two = NonZeroUsize::try_from(2).unwrap();
    /// let ids = thread_pool.region(two, |id| vec![id], |mut a, b| {
    ///     a.extend(b);
    ///     a
    /// });
    /// assert_eq!(ids, [0, 1]);
    /// ```
    pub fn region<Output: Send>(
        &mut self,
        num_active: NonZeroUsize,
        work: impl Fn(usize) -> Output + Sync,
        reduce: impl Fn(Output, Output) -> Output,
    ) -> Output {
        let num_active = num_active.get().min(self.threads.len());
        let outputs = (0..num_active)
            .map(|_| Mutex::new(None))
            .collect::<Vec<_>>();

        log_debug!("[main thread] Starting a region over {num_active} thread(s)");
        self.lender.lend(&RegionImpl {
            num_active,
            outputs: &outputs,
            work,
        });

        outputs
            .into_iter()
            .map(|output| output.into_inner().unwrap().unwrap())
            .reduce(reduce)
            .unwrap()
    }
}

impl Drop for ThreadPool {
    /// Joins all the threads in the pool.
    #[allow(clippy::unused_enumerate_index)]
    fn drop(&mut self) {
        self.lender.finish_workers();

        log_debug!("[main thread] Joining threads in the pool...");
        for (_i, t) in self.threads.drain(..).enumerate() {
            let result = t.handle.join();
            match result {
                Ok(_) => log_debug!("[main thread] Thread {_i} joined with result: {result:?}"),
                Err(_) => log_error!("[main thread] Thread {_i} joined with result: {result:?}"),
            }
        }
        log_debug!("[main thread] Joined threads.");
    }
}

/// Pins the current thread to the CPU with the given index, following the
/// given policy.
#[cfg(all(
    not(miri),
    any(
        target_os = "android",
        target_os = "dragonfly",
        target_os = "freebsd",
        target_os = "linux"
    )
))]
fn pin_to_cpu(id: usize, cpu_pinning: CpuPinningPolicy) {
    match cpu_pinning {
        CpuPinningPolicy::No => (),
        CpuPinningPolicy::IfSupported => {
            let mut cpu_set = CpuSet::new();
            if let Err(_e) = cpu_set.set(id) {
                log_warn!("Failed to set CPU affinity for thread #{id}: {_e}");
            } else if let Err(_e) = sched_setaffinity(Pid::from_raw(0), &cpu_set) {
                log_warn!("Failed to set CPU affinity for thread #{id}: {_e}");
            } else {
                log_debug!("Pinned thread #{id} to CPU #{id}");
            }
        }
        CpuPinningPolicy::Always => {
            let mut cpu_set = CpuSet::new();
            if let Err(e) = cpu_set.set(id) {
                panic!("Failed to set CPU affinity for thread #{id}: {e}");
            } else if let Err(e) = sched_setaffinity(Pid::from_raw(0), &cpu_set) {
                panic!("Failed to set CPU affinity for thread #{id}: {e}");
            } else {
                log_debug!("Pinned thread #{id} to CPU #{id}");
            }
        }
    }
}

/// A region task storing the output of each active worker in its own slot.
struct RegionImpl<'a, Output, Work> {
    num_active: usize,
    outputs: &'a [Mutex<Option<Output>>],
    work: Work,
}

impl<Output, Work> RegionTask for RegionImpl<'_, Output, Work>
where
    Work: Fn(usize) -> Output,
{
    fn run(&self, worker_id: usize) {
        if worker_id < self.num_active {
            let output = (self.work)(worker_id);
            *self.outputs[worker_id].lock().unwrap() = Some(output);
        }
    }
}

/// Context object owned by a worker thread.
struct ThreadContext {
    /// Region tasks borrowed from the main thread.
    borrower: Borrower,
}

impl ThreadContext {
    /// Main function run by this thread.
    fn run(&mut self) {
        loop {
            // A panicking task has already been reported to the main thread while
            // unwinding, so this thread can wait for the next region.
            match std::panic::catch_unwind(AssertUnwindSafe(|| self.borrower.borrow())) {
                Ok(WorkerState::Finished) => break,
                Ok(WorkerState::Ready) | Err(_) => continue,
            }
        }
    }
}
