// Copyright 2024 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Running kernels over a [`ThreadPool`], with work distributed by a
//! [`RangeLoadBalancer`], a [`SegmentLoadBalancer`] or a [`WorkCounter`].

use crate::balancer::RangeLoadBalancer;
use crate::claim::{ClaimIndex, WorkCounter};
use crate::segment::SegmentLoadBalancer;
use crate::ThreadPool;
use std::io::Write;
use std::ops::{Add, Range};

impl ThreadPool {
    /// Runs `kernel` on every chunk handed out by the balancer, and reduces
    /// the results.
    ///
    /// [`balancer.threads()`](RangeLoadBalancer::threads) workers (at most the
    /// size of this pool) each fold the outputs of their chunks with `reduce`,
    /// starting from `init()`. The per-worker results are then folded with
    /// `reduce` as well.
    ///
    /// The final `Status: 100%` line is left to the caller, via
    /// [`finish_status()`](RangeLoadBalancer::finish_status).
    ///
    /// ```
    /// # use sievework::{CpuPinningPolicy, LoadBalancerBuilder, MinChunk, ThreadCount, ThreadPoolBuilder};
    /// # use std::num::NonZeroU64;
    /// let mut thread_pool = ThreadPoolBuilder {
    ///     num_threads: ThreadCount::try_from(4).unwrap(),
    ///     cpu_pinning: CpuPinningPolicy::No,
    /// }
    /// .build();
    /// let balancer = LoadBalancerBuilder {
    ///     x: 0,
    ///     sieve_limit: 1_000,
    ///     num_threads: ThreadCount::try_from(4).unwrap(),
    ///     min_chunk: MinChunk::Fixed(NonZeroU64::new(10).unwrap()),
    ///     print: false,
    ///     precision: None,
    /// }
    /// .build();
    ///
    /// let chunks = thread_pool.map_reduce_ranges(&balancer, || 0, |_| 1, |a, b| a + b);
    /// assert!(chunks >= 4);
    /// ```
    pub fn map_reduce_ranges<W, T>(
        &mut self,
        balancer: &RangeLoadBalancer<W>,
        init: impl Fn() -> T + Sync,
        kernel: impl Fn(Range<u64>) -> T + Sync,
        reduce: impl Fn(T, T) -> T + Sync,
    ) -> T
    where
        W: Write + Send,
        T: Send,
    {
        self.region(
            balancer.threads(),
            |_worker_id| {
                let mut acc = init();
                while let Some(range) = balancer.get_work() {
                    acc = reduce(acc, kernel(range));
                }
                acc
            },
            &reduce,
        )
    }

    /// Sums the outputs of `kernel` on every chunk handed out by the balancer.
    ///
    /// ```
    /// # use sievework::{CpuPinningPolicy, RangeLoadBalancer, ThreadCount, ThreadPoolBuilder};
    /// let mut thread_pool = ThreadPoolBuilder {
    ///     num_threads: ThreadCount::AvailableParallelism,
    ///     cpu_pinning: CpuPinningPolicy::No,
    /// }
    /// .build();
    /// let balancer = RangeLoadBalancer::new(0, 10_000, thread_pool.num_threads(), false);
    ///
    /// let sum = thread_pool.sum_ranges(&balancer, |range| range.sum::<u64>());
    /// assert_eq!(sum, 5_000 * 9_999);
    /// ```
    pub fn sum_ranges<W, T>(
        &mut self,
        balancer: &RangeLoadBalancer<W>,
        kernel: impl Fn(Range<u64>) -> T + Sync,
    ) -> T
    where
        W: Write + Send,
        T: Default + Add<Output = T> + Send,
    {
        self.map_reduce_ranges(balancer, T::default, kernel, |a, b| a + b)
    }

    /// Runs `kernel` on every segment handed out by the balancer, and reduces
    /// the results the same way as
    /// [`map_reduce_ranges()`](Self::map_reduce_ranges).
    ///
    /// Each worker requests segments with its own index, so only worker 0
    /// prints the segment status.
    pub fn map_reduce_segments<W, T>(
        &mut self,
        balancer: &SegmentLoadBalancer<W>,
        init: impl Fn() -> T + Sync,
        kernel: impl Fn(Range<u64>) -> T + Sync,
        reduce: impl Fn(T, T) -> T + Sync,
    ) -> T
    where
        W: Write + Send,
        T: Send,
    {
        self.region(
            balancer.threads(),
            |worker_id| {
                let mut acc = init();
                while let Some(segment) = balancer.get_work(worker_id) {
                    acc = reduce(acc, kernel(segment));
                }
                acc
            },
            &reduce,
        )
    }

    /// Sums the outputs of `kernel` on every segment handed out by the
    /// balancer.
    ///
    /// ```
    /// # use sievework::{CpuPinningPolicy, SegmentLoadBalancer, ThreadCount, ThreadPoolBuilder};
    /// let mut thread_pool = ThreadPoolBuilder {
    ///     num_threads: ThreadCount::try_from(4).unwrap(),
    ///     cpu_pinning: CpuPinningPolicy::No,
    /// }
    /// .build();
    /// let balancer = SegmentLoadBalancer::new(1_000_000, 10_000, thread_pool.num_threads(), false);
    ///
    /// let items = thread_pool.sum_segments(&balancer, |segment| segment.end - segment.start);
    /// assert_eq!(items, 1_000_000);
    /// ```
    pub fn sum_segments<W, T>(
        &mut self,
        balancer: &SegmentLoadBalancer<W>,
        kernel: impl Fn(Range<u64>) -> T + Sync,
    ) -> T
    where
        W: Write + Send,
        T: Default + Add<Output = T> + Send,
    {
        self.map_reduce_segments(balancer, T::default, kernel, |a, b| a + b)
    }

    /// Runs `kernel` on every value `start + k * inc < end`, claimed one at a
    /// time from the counter by all the workers of this pool, and reduces the
    /// results.
    ///
    /// The counter is reset before the workers start claiming, so it can be
    /// reused across calls.
    ///
    /// # Panics
    ///
    /// Panics if `inc` isn't strictly positive.
    #[allow(clippy::too_many_arguments)]
    pub fn map_reduce_claims<I, T>(
        &mut self,
        counter: &mut WorkCounter<I>,
        start: I,
        end: I,
        inc: I,
        init: impl Fn() -> T + Sync,
        kernel: impl Fn(I) -> T + Sync,
        reduce: impl Fn(T, T) -> T + Sync,
    ) -> T
    where
        I: ClaimIndex + Send + Sync,
        T: Send,
    {
        assert!(
            inc.is_positive(),
            "cannot claim values with a non-positive stride ({inc:?})"
        );
        counter.reset();
        let counter = &*counter;

        self.region(
            self.num_threads(),
            |_worker_id| {
                counter
                    .claims_step_by(start, end, inc)
                    .fold(init(), |acc, i| reduce(acc, kernel(i)))
            },
            &reduce,
        )
    }

    /// Sums the outputs of `kernel` on every value `start + k * inc < end`,
    /// claimed one at a time from the counter.
    ///
    /// ```
    /// # use sievework::{CpuPinningPolicy, ThreadCount, ThreadPoolBuilder, WorkCounter};
    /// let mut thread_pool = ThreadPoolBuilder {
    ///     num_threads: ThreadCount::try_from(4).unwrap(),
    ///     cpu_pinning: CpuPinningPolicy::No,
    /// }
    /// .build();
    /// let mut counter = WorkCounter::new();
    ///
    /// let sum = thread_pool.sum_claims(&mut counter, 1u64, 101, 1, |i| i);
    /// assert_eq!(sum, 5_050);
    /// // Odd values only.
    /// let sum = thread_pool.sum_claims(&mut counter, 1u64, 101, 2, |i| i);
    /// assert_eq!(sum, 2_500);
    /// ```
    pub fn sum_claims<I, T>(
        &mut self,
        counter: &mut WorkCounter<I>,
        start: I,
        end: I,
        inc: I,
        kernel: impl Fn(I) -> T + Sync,
    ) -> T
    where
        I: ClaimIndex + Send + Sync,
        T: Default + Add<Output = T> + Send,
    {
        self.map_reduce_claims(counter, start, end, inc, T::default, kernel, |a, b| a + b)
    }
}

#[cfg(test)]
mod test {
    use crate::{
        CpuPinningPolicy, LoadBalancerBuilder, MinChunk, SegmentBalancerBuilder, ThreadCount,
        ThreadPool, ThreadPoolBuilder, WorkCounter,
    };
    use std::num::NonZeroU64;
    use std::ops::Range;

    fn pool(threads: usize) -> ThreadPool {
        ThreadPoolBuilder {
            num_threads: ThreadCount::try_from(threads).unwrap(),
            cpu_pinning: CpuPinningPolicy::No,
        }
        .build()
    }

    fn builder(sieve_limit: u64, threads: usize, min_chunk: u64) -> LoadBalancerBuilder {
        LoadBalancerBuilder {
            x: 0,
            sieve_limit,
            num_threads: ThreadCount::try_from(threads).unwrap(),
            min_chunk: MinChunk::Fixed(NonZeroU64::new(min_chunk).unwrap()),
            print: false,
            precision: None,
        }
    }

    #[test]
    fn test_map_reduce_ranges_collects_partition() {
        let mut thread_pool = pool(4);
        let balancer = builder(100_000, 4, 100).build_with_output(std::io::sink());

        let mut chunks = thread_pool.map_reduce_ranges(
            &balancer,
            Vec::new,
            |range| vec![range],
            |mut a: Vec<Range<u64>>, b| {
                a.extend(b);
                a
            },
        );
        chunks.sort_unstable_by_key(|c| c.start);

        assert_eq!(chunks.first().unwrap().start, 0);
        assert_eq!(chunks.last().unwrap().end, 100_000);
        for pair in chunks.windows(2) {
            assert_eq!(pair[0].end, pair[1].start);
        }
    }

    #[test]
    fn test_sum_ranges_more_balancer_threads_than_pool() {
        let mut thread_pool = pool(2);
        let balancer = builder(10_000, 8, 10).build_with_output(std::io::sink());
        assert_eq!(balancer.threads().get(), 8);

        let sum = thread_pool.sum_ranges(&balancer, |range| range.sum::<u64>());
        assert_eq!(sum, 5_000 * 9_999);
    }

    #[test]
    fn test_sum_ranges_empty() {
        let mut thread_pool = pool(3);
        let balancer = builder(0, 3, 10).build_with_output(std::io::sink());
        assert_eq!(thread_pool.sum_ranges(&balancer, |range| range.count()), 0);
    }

    #[test]
    fn test_map_reduce_segments_collects_partition() {
        let mut thread_pool = pool(4);
        let balancer = SegmentBalancerBuilder {
            sqrtx: 10_000_000,
            y: 1_000_000,
            num_threads: ThreadCount::try_from(4).unwrap(),
            print: false,
        }
        .build_with_output(std::io::sink());

        let mut segments = thread_pool.map_reduce_segments(
            &balancer,
            Vec::new,
            |segment| vec![segment],
            |mut a: Vec<Range<u64>>, b| {
                a.extend(b);
                a
            },
        );
        segments.sort_unstable_by_key(|s| s.start);

        assert_eq!(segments.first().unwrap().start, 0);
        assert_eq!(segments.last().unwrap().end, 10_000_000);
        for pair in segments.windows(2) {
            assert_eq!(pair[0].end, pair[1].start);
        }
    }

    #[test]
    fn test_sum_segments_status_line() {
        let mut out = Vec::new();
        let balancer = SegmentBalancerBuilder {
            sqrtx: 100_000,
            y: 100_000,
            num_threads: ThreadCount::try_from(3).unwrap(),
            print: true,
        }
        .build_with_output(&mut out);

        // A single worker, which is worker 0, processes all 4 segments.
        let mut thread_pool = pool(1);
        let sum = thread_pool.sum_segments(&balancer, |segment| segment.sum::<u64>());
        drop(balancer);
        assert_eq!(sum, 50_000 * 99_999);

        let out = String::from_utf8(out).unwrap();
        assert!(out.starts_with("\rSegment: 1/4"), "{out:?}");
    }

    #[test]
    fn test_map_reduce_claims_each_value_once() {
        let mut thread_pool = pool(4);
        let mut counter = WorkCounter::new();

        for inc in 1..=5i64 {
            let mut claimed = thread_pool.map_reduce_claims(
                &mut counter,
                -100,
                1_000,
                inc,
                Vec::new,
                |i| vec![i],
                |mut a: Vec<i64>, b| {
                    a.extend(b);
                    a
                },
            );
            claimed.sort_unstable();
            assert_eq!(claimed, (-100..1_000).step_by(inc as usize).collect::<Vec<_>>());
        }
    }

    #[test]
    fn test_sum_claims_irregular_cost() {
        let mut thread_pool = pool(4);
        let mut counter = WorkCounter::new();

        // The cost of each value grows with the value itself.
        let sum = thread_pool.sum_claims(&mut counter, 0usize, 200, 1, |i| {
            (0..i * 100).map(|j| (j % 3) as u64).sum::<u64>()
        });
        let expected = (0..200usize)
            .map(|i| (0..i * 100).map(|j| (j % 3) as u64).sum::<u64>())
            .sum::<u64>();
        assert_eq!(sum, expected);
    }

    #[test]
    #[should_panic = "cannot claim values with a non-positive stride (0)"]
    fn test_sum_claims_zero_stride() {
        let mut thread_pool = pool(2);
        let mut counter = WorkCounter::new();
        thread_pool.sum_claims(&mut counter, 0u32, 10, 0, |i| i);
    }
}
