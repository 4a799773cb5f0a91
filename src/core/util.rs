// Copyright 2024 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

use std::ptr::NonNull;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};

/// An ergonomic wrapper around a [`Mutex`]-[`Condvar`] pair.
pub struct Status<T> {
    mutex: Mutex<T>,
    condvar: Condvar,
}

impl<T> Status<T> {
    /// Creates a new status initialized with the given value.
    pub fn new(t: T) -> Self {
        Self {
            mutex: Mutex::new(t),
            condvar: Condvar::new(),
        }
    }

    /// Attempts to set the status to the given value and notifies one waiting
    /// thread.
    ///
    /// Fails if the [`Mutex`] is poisoned.
    pub fn try_notify_one(&self, t: T) -> Result<(), PoisonError<MutexGuard<'_, T>>> {
        *self.mutex.lock()? = t;
        self.condvar.notify_one();
        Ok(())
    }

    /// Sets the status to the given value and notifies all waiting threads.
    pub fn notify_all(&self, t: T) {
        *self.mutex.lock().unwrap() = t;
        self.condvar.notify_all();
    }

    /// Waits until the predicate is false on this status.
    ///
    /// This returns a [`MutexGuard`], allowing to further inspect or modify the
    /// status.
    pub fn wait_while(&self, predicate: impl FnMut(&mut T) -> bool) -> MutexGuard<'_, T> {
        self.condvar
            .wait_while(self.mutex.lock().unwrap(), predicate)
            .unwrap()
    }
}

/// Work executed by every worker thread of a pool during a parallel region.
pub trait RegionTask {
    /// Runs the task on the worker thread with the given index.
    fn run(&self, worker_id: usize);
}

/// A lifetime-erased `&'a (dyn RegionTask + Sync + 'a)`, whose lifetime can be
/// recovered via the `unsafe` function [`get()`](Self::get).
pub struct TaskSlot {
    ptr: Option<NonNull<dyn RegionTask + Sync>>,
}

impl TaskSlot {
    /// Creates a new empty slot.
    pub fn empty() -> Self {
        Self { ptr: None }
    }

    /// Stores the given task. Subsequent calls to [`get()`](Self::get) must
    /// ensure that the obtained reference doesn't outlive the reference that was
    /// set here.
    pub fn set<'a>(&mut self, task: &'a (dyn RegionTask + Sync + 'a)) {
        let ptr: NonNull<dyn RegionTask + Sync + 'a> = NonNull::from(task);
        // SAFETY: Both types are the same fat pointer, only the lifetime bound of
        // the trait object differs. The pointer is never dereferenced beyond `'a`,
        // as ensured by the callers of `get()`.
        let ptr = unsafe {
            std::mem::transmute::<
                NonNull<dyn RegionTask + Sync + 'a>,
                NonNull<dyn RegionTask + Sync + 'static>,
            >(ptr)
        };
        self.ptr = Some(ptr);
    }

    /// Clears the slot. Subsequent calls to [`get()`](Self::get) will obtain
    /// [`None`].
    pub fn clear(&mut self) {
        self.ptr = None;
    }

    /// Returns the task that was previously set with [`set()`](Self::set), or
    /// [`None`] if the slot is empty.
    ///
    /// # Safety
    ///
    /// The underlying task must be valid and not mutated during the whole
    /// output lifetime.
    pub unsafe fn get<'a>(&self) -> Option<&'a (dyn RegionTask + Sync + 'a)> {
        self.ptr.map(|ptr| {
            // SAFETY:
            // - This pointer points to a valid task, as previously set via `set()`.
            // - The task outlives the output lifetime and isn't mutated in the meantime,
            //   as ensured by the caller.
            let task: &'a (dyn RegionTask + Sync + 'static) = unsafe { &*ptr.as_ptr() };
            task
        })
    }
}

/// SAFETY:
///
/// A [`TaskSlot`] acts as a `&(dyn RegionTask + Sync)`, which is [`Send`].
unsafe impl Send for TaskSlot {}
/// SAFETY:
///
/// A [`TaskSlot`] acts as a `&(dyn RegionTask + Sync)`, which is [`Sync`].
unsafe impl Sync for TaskSlot {}
