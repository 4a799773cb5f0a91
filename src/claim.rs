// Copyright 2024 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Lock-free claiming of indices from a shared counter.
//!
//! This is the fine-grained counterpart of the
//! [`RangeLoadBalancer`](crate::RangeLoadBalancer): each claim hands out a
//! single index (or a single stride-aligned value), which suits loops whose
//! per-iteration cost is too irregular for coarse ranges to balance well.

use crate::macros::log_debug;
use crossbeam_utils::CachePadded;
use std::sync::atomic::{
    AtomicI32, AtomicI64, AtomicIsize, AtomicU32, AtomicU64, AtomicUsize, Ordering,
};

/// An integer type whose values can be claimed from a [`WorkCounter`].
///
/// This is implemented for the 32-bit, 64-bit and pointer-sized signed and
/// unsigned integers.
pub trait ClaimIndex: Copy + Ord + std::fmt::Debug {
    /// Atomic counterpart of this type.
    type Atomic: Send + Sync;

    /// Value stored in a counter from which nothing was claimed yet. Claimed
    /// values are always smaller than this.
    const SENTINEL: Self;

    /// Creates a new atomic holding the given value.
    fn new_atomic(value: Self) -> Self::Atomic;

    /// Atomically replaces `current` by `new`, returning whether the exchange
    /// happened.
    fn compare_exchange(atomic: &Self::Atomic, current: Self, new: Self) -> bool;

    /// Atomically adds `inc`, returning the previous value.
    fn fetch_add(atomic: &Self::Atomic, inc: Self) -> Self;

    /// Adds `inc`, returning [`None`] on overflow.
    fn checked_add(self, inc: Self) -> Option<Self>;

    /// Returns whether this is a valid stride, i.e. strictly positive.
    fn is_positive(self) -> bool;

    /// Returns the stride of 1.
    fn one() -> Self;
}

macro_rules! claim_index_impl {
    ( $( $t:ty => $atomic:ty ),* $(,)? ) => {
        $(
            impl ClaimIndex for $t {
                type Atomic = $atomic;

                const SENTINEL: Self = <$t>::MAX;

                #[inline(always)]
                fn new_atomic(value: Self) -> $atomic {
                    <$atomic>::new(value)
                }

                #[inline(always)]
                fn compare_exchange(atomic: &$atomic, current: Self, new: Self) -> bool {
                    atomic
                        .compare_exchange(current, new, Ordering::Relaxed, Ordering::Relaxed)
                        .is_ok()
                }

                #[inline(always)]
                fn fetch_add(atomic: &$atomic, inc: Self) -> Self {
                    atomic.fetch_add(inc, Ordering::Relaxed)
                }

                #[inline(always)]
                fn checked_add(self, inc: Self) -> Option<Self> {
                    <$t>::checked_add(self, inc)
                }

                #[inline(always)]
                fn is_positive(self) -> bool {
                    self > 0
                }

                #[inline(always)]
                fn one() -> Self {
                    1
                }
            }
        )*
    };
}

claim_index_impl!(
    u32 => AtomicU32,
    u64 => AtomicU64,
    usize => AtomicUsize,
    i32 => AtomicI32,
    i64 => AtomicI64,
    isize => AtomicIsize,
);

/// A shared cursor from which threads claim the next unit of work.
///
/// All the threads that take part in a loop build their own [`Claims`]
/// iterator over the same counter with the same parameters. The first claim
/// of the whole loop publishes the start value with a compare-and-swap
/// against the sentinel; every other claim is a single fetch-and-add. Each
/// value of the loop is therefore claimed by exactly one thread, without any
/// lock.
///
/// ```
/// # use sievework::WorkCounter;
/// # use std::sync::Mutex;
/// let counter = WorkCounter::<u64>::new();
/// let claimed = Mutex::new(Vec::new());
/// std::thread::scope(|scope| {
///     for _ in 0..4 {
///         scope.spawn(|| {
///             for b in counter.claims(10, 20) {
///                 claimed.lock().unwrap().push(b);
///             }
///         });
///     }
/// });
/// let mut claimed = claimed.into_inner().unwrap();
/// claimed.sort();
/// assert_eq!(claimed, (10..20).collect::<Vec<_>>());
/// ```
pub struct WorkCounter<I: ClaimIndex> {
    /// Next value to claim, or the sentinel before the first claim.
    next: CachePadded<I::Atomic>,
}

impl<I: ClaimIndex> Default for WorkCounter<I> {
    fn default() -> Self {
        Self::new()
    }
}

impl<I: ClaimIndex> WorkCounter<I> {
    /// Creates a counter from which nothing was claimed yet.
    pub fn new() -> Self {
        Self {
            next: CachePadded::new(I::new_atomic(I::SENTINEL)),
        }
    }

    /// Rewinds this counter so that it can drive another loop.
    ///
    /// Taking `&mut self` guarantees that no [`Claims`] iterator is alive.
    pub fn reset(&mut self) {
        log_debug!("Resetting work counter");
        *self.next = I::new_atomic(I::SENTINEL);
    }

    /// Returns an iterator claiming the values of `start..end`.
    pub fn claims(&self, start: I, end: I) -> Claims<'_, I> {
        self.claims_step_by(start, end, I::one())
    }

    /// Returns an iterator claiming the values `start, start + inc, ...` that
    /// are smaller than `end`.
    ///
    /// Each claim advances the counter by `inc`, so the counter overshoots
    /// `end` by up to one stride per participating thread. Callers must pick
    /// an integer type wide enough for that.
    ///
    /// # Panics
    ///
    /// Panics if `inc` isn't strictly positive, or if `start + inc` doesn't
    /// fit below [`ClaimIndex::SENTINEL`].
    pub fn claims_step_by(&self, start: I, end: I, inc: I) -> Claims<'_, I> {
        if !inc.is_positive() {
            panic!("cannot claim values with a non-positive stride ({inc:?})");
        }
        // Publishing the sentinel would let the next claimant start over.
        let second = match start.checked_add(inc) {
            Some(second) if second < I::SENTINEL => second,
            _ => panic!(
                "cannot claim values from {start:?} with stride {inc:?}: the counter would reach its sentinel"
            ),
        };
        Claims {
            counter: self,
            start,
            second,
            end,
            inc,
            state: ClaimState::First,
        }
    }
}

/// Progress of a [`Claims`] iterator.
#[derive(Clone, Copy, PartialEq, Eq)]
enum ClaimState {
    /// Nothing was claimed by this iterator yet.
    First,
    /// At least one value was claimed.
    Claiming,
    /// A value past the end was claimed.
    Done,
}

/// Iterator over the values claimed by one thread from a [`WorkCounter`].
///
/// This struct is created by [`WorkCounter::claims()`] and
/// [`WorkCounter::claims_step_by()`]. Claimed values are increasing for a
/// given thread but usually not contiguous, as other threads claim values in
/// between.
#[must_use = "iterators are lazy and do nothing unless consumed"]
pub struct Claims<'a, I: ClaimIndex> {
    /// Shared counter.
    counter: &'a WorkCounter<I>,
    /// First value of the loop.
    start: I,
    /// Value published by the first claim of the loop, `start + inc`.
    second: I,
    /// Exclusive bound of the loop.
    end: I,
    /// Stride between successive values.
    inc: I,
    /// Progress of this iterator.
    state: ClaimState,
}

impl<I: ClaimIndex> Iterator for Claims<'_, I> {
    type Item = I;

    #[inline]
    fn next(&mut self) -> Option<I> {
        let atomic = &*self.counter.next;
        let claimed = match self.state {
            ClaimState::Done => return None,
            ClaimState::First => {
                self.state = ClaimState::Claiming;
                if I::compare_exchange(atomic, I::SENTINEL, self.second) {
                    self.start
                } else {
                    I::fetch_add(atomic, self.inc)
                }
            }
            ClaimState::Claiming => I::fetch_add(atomic, self.inc),
        };

        if claimed < self.end {
            Some(claimed)
        } else {
            self.state = ClaimState::Done;
            None
        }
    }
}

impl<I: ClaimIndex> std::iter::FusedIterator for Claims<'_, I> {}

#[cfg(test)]
mod test {
    use super::*;
    use rand::seq::IndexedRandom;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;
    use std::sync::Mutex;

    /// Drives the given number of claimants on the current thread, picking the
    /// claimant that makes the next claim at random.
    fn interleaved_claims<I: ClaimIndex>(
        rng: &mut ChaCha8Rng,
        counter: &WorkCounter<I>,
        claimants: usize,
        start: I,
        end: I,
        inc: I,
    ) -> Vec<I> {
        let mut iters: Vec<_> = (0..claimants)
            .map(|_| counter.claims_step_by(start, end, inc))
            .collect();
        let mut active: Vec<usize> = (0..claimants).collect();
        let mut claimed = Vec::new();
        while let Some(&i) = active.choose(rng) {
            match iters[i].next() {
                Some(value) => claimed.push(value),
                None => active.retain(|&j| j != i),
            }
        }
        claimed
    }

    #[test]
    fn test_single_claimant() {
        let counter = WorkCounter::<u64>::new();
        let claimed = counter.claims(10, 20).collect::<Vec<_>>();
        assert_eq!(claimed, (10..20).collect::<Vec<_>>());
    }

    #[test]
    fn test_empty_range() {
        let counter = WorkCounter::<u64>::new();
        assert_eq!(counter.claims(5, 5).next(), None);

        let counter = WorkCounter::<i64>::new();
        assert_eq!(counter.claims(5, 2).next(), None);
    }

    #[test]
    fn test_fused() {
        let counter = WorkCounter::<u32>::new();
        let mut iter = counter.claims(0, 2);
        assert_eq!(iter.next(), Some(0));
        assert_eq!(iter.next(), Some(1));
        assert_eq!(iter.next(), None);
        assert_eq!(iter.next(), None);
        // A fused iterator stops touching the counter.
        assert_eq!(counter.claims(0, 4).next(), Some(3));
    }

    #[test]
    fn test_first_claim_publishes_start() {
        let counter = WorkCounter::<i64>::new();
        let mut a = counter.claims(-3, 3);
        let mut b = counter.claims(-3, 3);
        // Whichever iterator claims first gets the start value.
        assert_eq!(b.next(), Some(-3));
        assert_eq!(a.next(), Some(-2));
        assert_eq!(a.next(), Some(-1));
        assert_eq!(b.next(), Some(0));
    }

    #[test]
    fn test_interleavings_cover_range() {
        let mut rng = ChaCha8Rng::seed_from_u64(42);
        for _ in 0..1_000 {
            let counter = WorkCounter::<u64>::new();
            let mut claimed = interleaved_claims(&mut rng, &counter, 3, 10, 20, 1);
            claimed.sort_unstable();
            assert_eq!(claimed, (10..20).collect::<Vec<_>>());
        }
    }

    #[test]
    fn test_interleavings_with_stride() {
        let mut rng = ChaCha8Rng::seed_from_u64(42);
        for inc in 1..8i32 {
            for claimants in 1..6 {
                let counter = WorkCounter::<i32>::new();
                let mut claimed = interleaved_claims(&mut rng, &counter, claimants, -7, 50, inc);
                claimed.sort_unstable();
                assert_eq!(claimed, (-7..50).step_by(inc as usize).collect::<Vec<_>>());
            }
        }
    }

    #[test]
    fn test_reset() {
        let mut counter = WorkCounter::<usize>::new();
        assert_eq!(counter.claims(0, 100).count(), 100);
        assert_eq!(counter.claims(0, 100).count(), 0);
        counter.reset();
        assert_eq!(counter.claims(50, 100).count(), 50);
    }

    #[test]
    fn test_multi_threaded() {
        const NUM_THREADS: usize = 8;
        const END: u64 = 100_000;

        let counter = WorkCounter::<u64>::new();
        let claimed = Mutex::new(Vec::new());
        std::thread::scope(|scope| {
            for _ in 0..NUM_THREADS {
                scope.spawn(|| {
                    let local = counter.claims_step_by(1, END, 3).collect::<Vec<_>>();
                    // Values claimed by a single thread are increasing.
                    assert!(local.windows(2).all(|w| w[0] < w[1]));
                    claimed.lock().unwrap().extend(local);
                });
            }
        });

        let mut claimed = claimed.into_inner().unwrap();
        claimed.sort_unstable();
        assert_eq!(claimed, (1..END).step_by(3).collect::<Vec<_>>());
    }

    #[test]
    #[should_panic = "cannot claim values with a non-positive stride (0)"]
    fn test_zero_stride() {
        let counter = WorkCounter::<u64>::new();
        let _ = counter.claims_step_by(0, 10, 0);
    }

    #[test]
    #[should_panic = "cannot claim values from 4294967290 with stride 10: the counter would reach its sentinel"]
    fn test_stride_overflows_sentinel() {
        let counter = WorkCounter::<u32>::new();
        let _ = counter.claims_step_by(u32::MAX - 5, u32::MAX, 10);
    }

    #[test]
    #[should_panic = "the counter would reach its sentinel"]
    fn test_start_next_to_sentinel() {
        let counter = WorkCounter::<u64>::new();
        let _ = counter.claims(u64::MAX - 1, u64::MAX);
    }

    #[test]
    fn test_start_claimed_once_near_sentinel() {
        let counter = WorkCounter::<u64>::new();
        let mut a = counter.claims(u64::MAX - 2, u64::MAX - 1);
        let mut b = counter.claims(u64::MAX - 2, u64::MAX - 1);
        assert_eq!(a.next(), Some(u64::MAX - 2));
        assert_eq!(b.next(), None);
        assert_eq!(a.next(), None);
    }
}
