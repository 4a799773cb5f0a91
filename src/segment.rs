// Copyright 2024 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! A coordinator handing out cache-sized segments of `[0, sqrt(x))`.
//!
//! Unlike the [`RangeLoadBalancer`](crate::RangeLoadBalancer), whose chunks
//! shrink towards the end, segments here start tiny (about `x^(1/4)`) so that
//! the dense region below `y` is spread evenly, and then grow towards the CPU
//! cache sizes once sieving is past `y`.

use crate::macros::log_debug;
#[cfg(feature = "log_balancing")]
use crate::macros::{log_info, log_trace};
use crate::status::ProgressReporter;
use crate::util::isqrt;
use crate::ThreadCount;
use std::io::{Stdout, Write};
use std::num::NonZeroUsize;
use std::ops::Range;
use std::sync::Mutex;

/// Number of integers represented by one byte of a sieve segment.
pub const NUMBERS_PER_BYTE: u64 = 30;

/// Segment widths are rounded up to a multiple of this, i.e. a whole number of
/// 64-bit sieve words.
pub const SEGMENT_ALIGNMENT: u64 = 8 * NUMBERS_PER_BYTE;

/// Smallest segment width (1 KiB of sieve).
pub const MIN_SEGMENT_SIZE: u64 = (1 << 10) * NUMBERS_PER_BYTE;

/// Segment width filling a 32 KiB L1 data cache.
const L1_SEGMENT_SIZE: u64 = (32 << 10) * NUMBERS_PER_BYTE;

/// Segment width filling a 256 KiB L2 cache.
const L2_SEGMENT_SIZE: u64 = (256 << 10) * NUMBERS_PER_BYTE;

/// A builder for [`SegmentLoadBalancer`].
pub struct SegmentBalancerBuilder {
    /// Exclusive upper bound of the segmented interval, usually `sqrt(x)`.
    pub sqrtx: u64,
    /// Segments stay small up to this bound, usually `x^(1/3) * log(x)`.
    pub y: u64,
    /// Number of threads that will request work.
    pub num_threads: ThreadCount,
    /// Whether worker 0 prints a `Segment: i/n` line.
    pub print: bool,
}

impl SegmentBalancerBuilder {
    /// Creates a balancer printing its status to the standard output.
    ///
    /// ```
    /// # use sievework::{SegmentBalancerBuilder, ThreadCount};
    /// let balancer = SegmentBalancerBuilder {
    ///     sqrtx: 100_000,
    ///     y: 100_000,
    ///     num_threads: ThreadCount::try_from(4).unwrap(),
    ///     print: false,
    /// }
    /// .build();
    ///
    /// assert_eq!(balancer.segment_size(), 30_720);
    /// assert_eq!(balancer.get_work(0), Some(0..30_720));
    /// ```
    pub fn build(&self) -> SegmentLoadBalancer<Stdout> {
        self.build_with_output(std::io::stdout())
    }

    /// Creates a balancer printing its status to the given output.
    pub fn build_with_output<W: Write>(&self, out: W) -> SegmentLoadBalancer<W> {
        SegmentLoadBalancer::from_parts(
            self.sqrtx,
            self.y,
            self.num_threads.count(),
            ProgressReporter::new(self.print, 0, out),
        )
    }
}

/// Hands out the interval `[0, sqrtx)` to worker threads, one segment at a
/// time.
///
/// Segments are always at least [`MIN_SEGMENT_SIZE`] wide and a multiple of
/// [`SEGMENT_ALIGNMENT`], except for the final one which is cut at `sqrtx`.
/// Their width never decreases.
///
/// ```
/// # use sievework::SegmentLoadBalancer;
/// # use std::num::NonZeroUsize;
/// let balancer = SegmentLoadBalancer::new(10_000, 0, NonZeroUsize::MIN, false);
/// assert_eq!(balancer.get_work(0), Some(0..10_000));
/// assert_eq!(balancer.get_work(0), None);
/// ```
pub struct SegmentLoadBalancer<W: Write = Stdout> {
    /// Exclusive bound of the interval.
    sqrtx: u64,
    /// Segments only grow above this bound.
    y: u64,
    /// Number of threads that request work.
    threads: NonZeroUsize,
    state: Mutex<SegmentState<W>>,
}

struct SegmentState<W: Write> {
    /// Next value to hand out.
    low: u64,
    /// Width of the next segment.
    segment_size: u64,
    reporter: ProgressReporter<W>,
    #[cfg(feature = "log_balancing")]
    segments: u64,
    #[cfg(feature = "log_balancing")]
    grows: u64,
}

impl SegmentLoadBalancer<Stdout> {
    /// Creates a balancer for `[0, sqrtx)` split among `threads` threads,
    /// printing the status to the standard output if `is_print` is true.
    pub fn new(sqrtx: u64, y: u64, threads: NonZeroUsize, is_print: bool) -> Self {
        SegmentBalancerBuilder {
            sqrtx,
            y,
            num_threads: ThreadCount::Count(threads),
            print: is_print,
        }
        .build()
    }
}

impl<W: Write> SegmentLoadBalancer<W> {
    fn from_parts(
        sqrtx: u64,
        y: u64,
        threads: NonZeroUsize,
        reporter: ProgressReporter<W>,
    ) -> Self {
        let x14 = isqrt(sqrtx as u128);
        // A single thread has nothing to balance, so it starts cache-sized.
        let segment_size = if threads.get() == 1 {
            x14.max(L2_SEGMENT_SIZE)
        } else {
            x14
        };
        let segment_size = align_segment_size(segment_size);

        log_debug!(
            "Segmenting [0, {sqrtx}) over {threads} thread(s): y = {y}, segment_size = {segment_size}"
        );

        Self {
            sqrtx,
            y,
            threads,
            state: Mutex::new(SegmentState {
                low: 0,
                segment_size,
                reporter,
                #[cfg(feature = "log_balancing")]
                segments: 0,
                #[cfg(feature = "log_balancing")]
                grows: 0,
            }),
        }
    }

    /// Returns the number of threads that should request work.
    pub fn threads(&self) -> NonZeroUsize {
        self.threads
    }

    /// Returns the exclusive bound of the interval.
    pub fn sqrtx(&self) -> u64 {
        self.sqrtx
    }

    /// Returns the bound above which segments may grow.
    pub fn y(&self) -> u64 {
        self.y
    }

    /// Returns the current segment width.
    pub fn segment_size(&self) -> u64 {
        self.state.lock().unwrap().segment_size
    }

    /// Returns the next segment to process, or [`None`] once the whole interval
    /// has been handed out.
    ///
    /// Only the worker with index 0 prints the status line.
    pub fn get_work(&self, worker_id: usize) -> Option<Range<u64>> {
        let mut state = self.state.lock().unwrap();
        let state = &mut *state;

        if state.low > self.y {
            let grown =
                grow_segment_size(state.low, state.segment_size, self.sqrtx, self.threads);
            if grown != state.segment_size {
                #[cfg(feature = "log_balancing")]
                {
                    state.grows += 1;
                    log_trace!(
                        "Segment width grown from {} to {grown} at {}",
                        state.segment_size,
                        state.low
                    );
                }
                state.segment_size = align_segment_size(grown);
            }
        }

        let low = state.low;
        let high = low.saturating_add(state.segment_size).min(self.sqrtx);
        state.low = state.low.max(high);

        if low >= high {
            return None;
        }
        if worker_id == 0 {
            state
                .reporter
                .print_segment(low, self.sqrtx, state.segment_size);
        }
        #[cfg(feature = "log_balancing")]
        {
            state.segments += 1;
        }
        Some(low..high)
    }
}

#[cfg(feature = "log_balancing")]
impl<W: Write> Drop for SegmentLoadBalancer<W> {
    fn drop(&mut self) {
        if let Ok(state) = self.state.get_mut() {
            log_info!(
                "Segmented [0, {}) in {} segment(s), growing {} time(s) up to width {}",
                self.sqrtx,
                state.segments,
                state.grows,
                state.segment_size
            );
        }
    }
}

/// Clamps a segment width to [`MIN_SEGMENT_SIZE`] and rounds it up to a
/// multiple of [`SEGMENT_ALIGNMENT`].
fn align_segment_size(size: u64) -> u64 {
    size.max(MIN_SEGMENT_SIZE)
        .checked_next_multiple_of(SEGMENT_ALIGNMENT)
        .unwrap_or(u64::MAX / SEGMENT_ALIGNMENT * SEGMENT_ALIGNMENT)
}

/// Returns the width of the next segment starting at `low`, above `y`.
///
/// Segments jump to the L2 size (or else the L1 size), or quadruple while
/// below the L1 size, but only if enough of the interval remains for every
/// thread to get a few segments of the new width.
fn grow_segment_size(low: u64, size: u64, sqrtx: u64, threads: NonZeroUsize) -> u64 {
    let threads = u64::try_from(threads.get()).unwrap_or(u64::MAX);
    let fits = |width: u64, per: u64| {
        low.saturating_add(width.saturating_mul(threads) / per) <= sqrtx
    };

    if size <= L2_SEGMENT_SIZE && fits(L2_SEGMENT_SIZE, 4) {
        L2_SEGMENT_SIZE
    } else if size <= L1_SEGMENT_SIZE && fits(L1_SEGMENT_SIZE, 2) {
        L1_SEGMENT_SIZE
    } else if size.saturating_mul(4) <= L1_SEGMENT_SIZE && fits(size * 4, 2) {
        size * 4
    } else {
        size
    }
}
