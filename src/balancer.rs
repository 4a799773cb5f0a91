// Copyright 2024 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! A coordinator handing out ranges of a sieving interval to worker threads.

use crate::macros::log_debug;
#[cfg(feature = "log_balancing")]
use crate::macros::{log_info, log_trace};
use crate::status::{status_precision, ProgressReporter};
use crate::util::{isqrt, pow_two_thirds};
use crate::ThreadCount;
use std::io::{Stdout, Write};
use std::num::{NonZeroU64, NonZeroUsize};
use std::ops::Range;
use std::sync::Mutex;

/// Smallest chunk width picked by [`MinChunk::Estimate`].
const MIN_CHUNK_FLOOR: u64 = 1 << 22;

/// Number of chunks per thread at the beginning of a computation.
const CHUNKS_PER_THREAD: u64 = 8;

/// Returns how many threads to use so that each one gets at least one chunk of
/// `min_chunk` items out of `total` items.
///
/// The result is always in `1..=requested`.
///
/// ```
/// # use sievework::ideal_num_threads;
/// # use std::num::NonZeroUsize;
/// let eight = NonZeroUsize::try_from(8).unwrap();
/// assert_eq!(ideal_num_threads(eight, 1_000, 10).get(), 8);
/// assert_eq!(ideal_num_threads(eight, 1_000, 250).get(), 4);
/// assert_eq!(ideal_num_threads(eight, 10, 250).get(), 1);
/// ```
pub fn ideal_num_threads(requested: NonZeroUsize, total: u64, min_chunk: u64) -> NonZeroUsize {
    let chunks = total / min_chunk.max(1);
    let threads = usize::try_from(chunks).unwrap_or(usize::MAX);
    NonZeroUsize::new(threads.clamp(1, requested.get())).unwrap_or(NonZeroUsize::MIN)
}

/// Minimum width of the chunks handed out by a [`RangeLoadBalancer`], except
/// for the final chunk.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MinChunk {
    /// Derive the minimum width from the sieving limit, so that initializing a
    /// thread (computing `PrimePi(low)` in `O(sieve_limit^(2/3))`) stays small
    /// compared to sieving its chunk.
    Estimate,
    /// Use the given minimum width.
    Fixed(NonZeroU64),
}

impl MinChunk {
    /// Resolves the minimum chunk width for the given sieving limit.
    pub fn resolve(self, sieve_limit: u64) -> u64 {
        match self {
            MinChunk::Estimate => pow_two_thirds(sieve_limit).max(MIN_CHUNK_FLOOR),
            MinChunk::Fixed(width) => width.get(),
        }
    }
}

/// A builder for [`RangeLoadBalancer`].
pub struct LoadBalancerBuilder {
    /// Magnitude of the computation's input. Sieving starts at `sqrt(x)`.
    pub x: u128,
    /// Exclusive upper bound of the sieving interval.
    pub sieve_limit: u64,
    /// Maximal number of threads that will request work.
    pub num_threads: ThreadCount,
    /// Minimum chunk width.
    pub min_chunk: MinChunk,
    /// Whether to print a status line while handing out chunks.
    pub print: bool,
    /// Number of decimal digits of the status percentage, or [`None`] to derive
    /// it from `x`.
    pub precision: Option<usize>,
}

impl LoadBalancerBuilder {
    /// Creates a balancer printing its status to the standard output.
    ///
    /// ```
    /// # use sievework::{LoadBalancerBuilder, MinChunk, ThreadCount};
    /// # use std::num::NonZeroU64;
    /// let balancer = LoadBalancerBuilder {
    ///     x: 10_000,
    ///     sieve_limit: 1_000,
    ///     num_threads: ThreadCount::try_from(4).unwrap(),
    ///     min_chunk: MinChunk::Fixed(NonZeroU64::new(100).unwrap()),
    ///     print: false,
    ///     precision: None,
    /// }
    /// .build();
    ///
    /// assert_eq!(balancer.start(), 100);
    /// assert_eq!(balancer.threads().get(), 4);
    /// assert_eq!(balancer.get_work(), Some(100..200));
    /// ```
    pub fn build(&self) -> RangeLoadBalancer<Stdout> {
        self.build_with_output(std::io::stdout())
    }

    /// Creates a balancer printing its status to the given output.
    pub fn build_with_output<W: Write>(&self, out: W) -> RangeLoadBalancer<W> {
        let precision = self.precision.unwrap_or_else(|| status_precision(self.x));
        RangeLoadBalancer::from_parts(
            isqrt(self.x),
            self.sieve_limit,
            self.num_threads.count(),
            self.min_chunk.resolve(self.sieve_limit),
            ProgressReporter::new(self.print, precision, out),
        )
    }
}

/// Hands out the interval `[sqrt(x), sieve_limit)` to worker threads, one
/// chunk at a time.
///
/// Chunks start large (about 8 per thread) and shrink near the end of the
/// interval so that all threads finish at about the same time, but never below
/// a minimum width at which thread initialization would dominate. The chunks
/// returned by successive calls to [`get_work()`](Self::get_work) are
/// increasing, disjoint, and cover the interval exactly.
///
/// ```
/// # use sievework::RangeLoadBalancer;
/// # use std::num::NonZeroUsize;
/// // Single-threaded without status: the whole interval is a single chunk.
/// let balancer = RangeLoadBalancer::new(100, 1_000, NonZeroUsize::MIN, false);
/// assert_eq!(balancer.get_work(), Some(10..1_000));
/// assert_eq!(balancer.get_work(), None);
/// ```
pub struct RangeLoadBalancer<W: Write = Stdout> {
    /// First value of the interval.
    start: u64,
    /// Exclusive bound of the interval.
    sieve_limit: u64,
    /// Minimum chunk width, except for the final chunk.
    min_thread_dist: u64,
    /// Number of threads that request work.
    threads: NonZeroUsize,
    /// Mutable state, only accessed inside [`get_work()`](Self::get_work).
    state: Mutex<BalancerState<W>>,
}

/// State of a [`RangeLoadBalancer`], guarded by its lock.
struct BalancerState<W: Write> {
    /// Next value to hand out.
    low: u64,
    /// Current chunk width.
    thread_dist: u64,
    /// Status line.
    reporter: ProgressReporter<W>,
    /// Load-balancing statistics.
    #[cfg(feature = "log_balancing")]
    stats: BalancerStats,
}

/// Statistics about the chunks handed out by a [`RangeLoadBalancer`].
#[cfg(feature = "log_balancing")]
#[derive(Default)]
struct BalancerStats {
    /// Number of non-empty chunks.
    chunks: u64,
    /// Width of the smallest non-empty chunk.
    min_width: Option<u64>,
    /// Width of the largest chunk.
    max_width: u64,
    /// Number of times the chunk width was reduced.
    shrinks: u64,
}

impl RangeLoadBalancer<Stdout> {
    /// Creates a balancer for the interval `[sqrt(x), sieve_limit)`, split
    /// among at most `threads` threads.
    ///
    /// If `is_print` is true, each call to [`get_work()`](Self::get_work)
    /// may print the status to the standard output.
    pub fn new(x: u128, sieve_limit: u64, threads: NonZeroUsize, is_print: bool) -> Self {
        LoadBalancerBuilder {
            x,
            sieve_limit,
            num_threads: ThreadCount::Count(threads),
            min_chunk: MinChunk::Estimate,
            print: is_print,
            precision: None,
        }
        .build()
    }
}

impl<W: Write> RangeLoadBalancer<W> {
    fn from_parts(
        low: u64,
        sieve_limit: u64,
        requested: NonZeroUsize,
        min_thread_dist: u64,
        reporter: ProgressReporter<W>,
    ) -> Self {
        let low = low.min(sieve_limit);
        let dist = sieve_limit - low;

        let requested_u64 = u64::try_from(requested.get()).unwrap_or(u64::MAX);
        let thread_dist = (dist / requested_u64.saturating_mul(CHUNKS_PER_THREAD))
            .max(min_thread_dist);
        let threads = ideal_num_threads(requested, dist, min_thread_dist);

        log_debug!(
            "Balancing [{low}, {sieve_limit}) over {threads} thread(s) (requested {requested}): min_thread_dist = {min_thread_dist}, thread_dist = {thread_dist}"
        );

        Self {
            start: low,
            sieve_limit,
            min_thread_dist,
            threads,
            state: Mutex::new(BalancerState {
                low,
                thread_dist,
                reporter,
                #[cfg(feature = "log_balancing")]
                stats: BalancerStats::default(),
            }),
        }
    }

    /// Returns the number of threads that should request work.
    pub fn threads(&self) -> NonZeroUsize {
        self.threads
    }

    /// Returns the first value of the interval.
    pub fn start(&self) -> u64 {
        self.start
    }

    /// Returns the exclusive bound of the interval.
    pub fn sieve_limit(&self) -> u64 {
        self.sieve_limit
    }

    /// Returns the minimum chunk width.
    pub fn min_thread_dist(&self) -> u64 {
        self.min_thread_dist
    }

    /// Returns the next chunk to process, or [`None`] once the whole interval
    /// has been handed out.
    ///
    /// Once this has returned [`None`], all subsequent calls return [`None`]
    /// as well. The lock is only held for a constant number of operations.
    pub fn get_work(&self) -> Option<Range<u64>> {
        let mut state = self.state.lock().unwrap();
        let state = &mut *state;

        state.reporter.print(state.low, self.sieve_limit);

        state.low = state.low.min(self.sieve_limit);
        let dist = self.sieve_limit - state.low;

        if self.threads.get() == 1 {
            // Splitting is only useful to keep the status line moving.
            if !state.reporter.is_enabled() {
                state.thread_dist = dist;
            }
        } else {
            let threads = self.threads.get() as u64;
            let max_thread_dist = dist / threads;

            // Reduce the chunk width near the end so that all threads stay busy
            // until the computation finishes.
            if state.thread_dist > max_thread_dist {
                state.thread_dist = max_thread_dist.max(self.min_thread_dist);
                #[cfg(feature = "log_balancing")]
                {
                    state.stats.shrinks += 1;
                    log_trace!(
                        "Chunk width reduced to {} with {dist} remaining",
                        state.thread_dist
                    );
                }
            }
        }

        let low = state.low;
        let high = low.saturating_add(state.thread_dist).min(self.sieve_limit);
        state.low = high;

        if low < high {
            #[cfg(feature = "log_balancing")]
            {
                let width = high - low;
                let stats = &mut state.stats;
                stats.chunks += 1;
                stats.min_width = Some(stats.min_width.map_or(width, |w| w.min(width)));
                stats.max_width = stats.max_width.max(width);
                log_trace!("Handing out chunk [{low}, {high})");
            }
            Some(low..high)
        } else {
            None
        }
    }

    /// Replaces the status line by a final `Status: 100%`, if printing is
    /// enabled.
    pub fn finish_status(&self) {
        self.state.lock().unwrap().reporter.finish();
    }
}

#[cfg(feature = "log_balancing")]
impl<W: Write> Drop for RangeLoadBalancer<W> {
    fn drop(&mut self) {
        if let Ok(state) = self.state.get_mut() {
            let stats = &state.stats;
            log_info!(
                "Balanced [{}, {}) in {} chunk(s) of width {}..={}, shrinking {} time(s)",
                self.start,
                self.sieve_limit,
                stats.chunks,
                stats.min_width.unwrap_or(0),
                stats.max_width,
                stats.shrinks
            );
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::status::percent;
    use rand::{Rng, SeedableRng};
    use rand_chacha::ChaCha8Rng;
    use std::io::Sink;

    fn builder(x: u128, sieve_limit: u64, threads: usize, min_chunk: u64) -> LoadBalancerBuilder {
        LoadBalancerBuilder {
            x,
            sieve_limit,
            num_threads: ThreadCount::try_from(threads).unwrap(),
            min_chunk: MinChunk::Fixed(NonZeroU64::new(min_chunk).unwrap()),
            print: false,
            precision: None,
        }
    }

    fn quiet(x: u128, sieve_limit: u64, threads: usize, min_chunk: u64) -> RangeLoadBalancer<Sink> {
        builder(x, sieve_limit, threads, min_chunk).build_with_output(std::io::sink())
    }

    fn drain<W: Write>(balancer: &RangeLoadBalancer<W>) -> Vec<Range<u64>> {
        std::iter::from_fn(|| balancer.get_work()).collect()
    }

    fn assert_partition(chunks: &[Range<u64>], start: u64, end: u64) {
        if start == end {
            assert!(chunks.is_empty());
            return;
        }
        assert_eq!(chunks.first().unwrap().start, start);
        assert_eq!(chunks.last().unwrap().end, end);
        for chunk in chunks {
            assert!(chunk.start < chunk.end, "empty chunk {chunk:?}");
        }
        for pair in chunks.windows(2) {
            assert_eq!(pair[0].end, pair[1].start);
        }
    }

    #[test]
    fn test_ideal_num_threads() {
        let eight = NonZeroUsize::try_from(8).unwrap();
        assert_eq!(ideal_num_threads(eight, 0, 10).get(), 1);
        assert_eq!(ideal_num_threads(eight, 79, 10).get(), 7);
        assert_eq!(ideal_num_threads(eight, 80, 10).get(), 8);
        assert_eq!(ideal_num_threads(eight, 100, 0).get(), 8);
        assert_eq!(ideal_num_threads(NonZeroUsize::MIN, u64::MAX, 1).get(), 1);
    }

    #[test]
    fn test_min_chunk_estimate() {
        assert_eq!(MinChunk::Estimate.resolve(0), 1 << 22);
        assert_eq!(MinChunk::Estimate.resolve(1_000_000), 1 << 22);
        let large = MinChunk::Estimate.resolve(1_000_000_000_000_000);
        assert!((9_999_999_000..=10_000_001_000).contains(&large));
        assert_eq!(MinChunk::Fixed(NonZeroU64::MIN).resolve(123_456), 1);
    }

    #[test]
    fn test_accessors() {
        let balancer = quiet(10_000, 5_000, 4, 100);
        assert_eq!(balancer.start(), 100);
        assert_eq!(balancer.sieve_limit(), 5_000);
        assert_eq!(balancer.min_thread_dist(), 100);
        assert_eq!(balancer.threads().get(), 4);
    }

    #[test]
    fn test_fixed_width_chunks() {
        let balancer = quiet(0, 1_000, 4, 50);
        assert_eq!(balancer.threads().get(), 4);

        let chunks = drain(&balancer);
        assert_partition(&chunks, 0, 1_000);
        assert_eq!(chunks.len(), 20);
        assert!(chunks.iter().all(|c| c.end - c.start == 50));
        assert_eq!(chunks.iter().map(|c| c.end - c.start).sum::<u64>(), 1_000);
    }

    #[test]
    fn test_single_thread_takes_everything() {
        let balancer = RangeLoadBalancer::new(10_000, 1_000_000, NonZeroUsize::MIN, false);
        assert_eq!(balancer.get_work(), Some(100..1_000_000));
        assert_eq!(balancer.get_work(), None);
    }

    #[test]
    fn test_single_thread_with_status_keeps_splitting() {
        let mut out = Vec::new();
        let mut builder = builder(0, 1_000, 1, 100);
        builder.print = true;
        let balancer = builder.build_with_output(&mut out);

        let chunks = drain(&balancer);
        assert_partition(&chunks, 0, 1_000);
        assert_eq!(chunks.len(), 8);
        assert!(chunks.iter().all(|c| c.end - c.start == 125));

        balancer.finish_status();
        drop(balancer);

        let out = String::from_utf8(out).unwrap();
        assert!(out.starts_with("\rStatus: 0%"), "{out:?}");
        assert!(out.ends_with("\rStatus: 100%\n"), "{out:?}");
    }

    #[test]
    fn test_chunks_shrink_near_the_end() {
        let balancer = quiet(0, 10_000, 4, 10);
        let widths = drain(&balancer)
            .iter()
            .map(|c| c.end - c.start)
            .collect::<Vec<_>>();

        assert_eq!(widths[0], 10_000 / 32);
        assert!(widths.iter().any(|&w| w < 10_000 / 32));
        for pair in widths.windows(2) {
            assert!(pair[0] >= pair[1]);
        }
        assert!(widths[..widths.len() - 1].iter().all(|&w| w >= 10));
        assert_eq!(widths.iter().sum::<u64>(), 10_000);
    }

    #[test]
    fn test_empty_interval() {
        // sqrt(x) is above the sieving limit.
        let balancer = quiet(100_000_000, 1_000, 8, 10);
        assert_eq!(balancer.start(), 1_000);
        assert_eq!(balancer.threads().get(), 1);
        assert_eq!(balancer.get_work(), None);
    }

    #[test]
    fn test_termination_is_sticky() {
        let balancer = quiet(0, 1_000, 3, 7);
        drain(&balancer);
        for _ in 0..10 {
            assert_eq!(balancer.get_work(), None);
        }
    }

    #[test]
    fn test_thread_bound() {
        assert_eq!(quiet(0, 1_000, 8, 300).threads().get(), 3);
        assert_eq!(quiet(0, 1_000, 8, 2_000).threads().get(), 1);
        assert_eq!(quiet(0, 1_000, 8, 1).threads().get(), 8);
        // Exactly one minimum-sized chunk per thread.
        assert_eq!(quiet(0, 1_000, 8, 1_000).threads().get(), 1);
        assert_eq!(quiet(0, 1_000, 8, 500).threads().get(), 2);
        assert_eq!(quiet(0, 1_000, 8, 125).threads().get(), 8);
        assert_eq!(quiet(0, 1_000, 8, 1_001).threads().get(), 1);

        let eight = NonZeroUsize::try_from(8).unwrap();
        // The estimated minimum width is 2^22 here.
        assert_eq!(RangeLoadBalancer::new(0, 1 << 24, eight, false).threads().get(), 4);
        assert_eq!(RangeLoadBalancer::new(0, 1 << 20, eight, false).threads().get(), 1);
    }

    #[test]
    fn test_random_parameters() {
        let mut rng = ChaCha8Rng::seed_from_u64(42);
        for _ in 0..300 {
            let low = rng.random_range(0..10_000u64);
            let dist = rng.random_range(0..200_000u64);
            let requested = rng.random_range(1..=16usize);
            let min_chunk = rng.random_range(1..=5_000u64);
            let sieve_limit = low + dist;

            let x = (low as u128) * (low as u128);
            let balancer = quiet(x, sieve_limit, requested, min_chunk);
            assert_eq!(balancer.start(), low);
            assert!(balancer.threads().get() <= requested);

            let chunks = drain(&balancer);
            assert_partition(&chunks, low, sieve_limit);
            if let Some((_, init)) = chunks.split_last() {
                assert!(init.iter().all(|c| c.end - c.start >= min_chunk));
            }
            for pair in chunks.windows(2) {
                assert!(pair[0].end - pair[0].start >= pair[1].end - pair[1].start);
                assert!(
                    percent(pair[0].start, sieve_limit) <= percent(pair[1].start, sieve_limit)
                );
            }
            assert_eq!(balancer.get_work(), None);
        }
    }

    #[test]
    fn test_multi_threaded_partition() {
        let balancer = quiet(0, 1_000_000, 8, 1_000);
        let chunks = std::sync::Mutex::new(Vec::new());

        std::thread::scope(|scope| {
            for _ in 0..balancer.threads().get() {
                scope.spawn(|| {
                    let mut local = Vec::new();
                    while let Some(range) = balancer.get_work() {
                        local.push(range);
                    }
                    chunks.lock().unwrap().extend(local);
                });
            }
        });

        let mut chunks = chunks.into_inner().unwrap();
        chunks.sort_unstable_by_key(|c| c.start);
        assert_partition(&chunks, 0, 1_000_000);
    }
}
