// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! CLI tool to run sieve-like computations in parallel.
//!
//! Run with `RUST_LOG=debug` and `--features log_balancing` to see how the
//! work is distributed.

use clap::{Parser, ValueEnum};
use sievework::{
    isqrt, CpuPinningPolicy, LoadBalancerBuilder, MinChunk, SegmentBalancerBuilder, ThreadCount,
    ThreadPoolBuilder, WorkCounter,
};
use std::hint::black_box;
use std::num::{NonZeroU64, NonZeroUsize};
use std::ops::Range;
use std::time::Instant;

fn main() {
    env_logger::init();
    let cli = Cli::parse();

    let num_threads = match cli.num_threads {
        Some(num_threads) => ThreadCount::Count(num_threads),
        None => ThreadCount::AvailableParallelism,
    };
    let mut thread_pool = ThreadPoolBuilder {
        num_threads,
        cpu_pinning: CpuPinningPolicy::IfSupported,
    }
    .build();

    let start = Instant::now();
    match cli.scenario {
        Scenario::Primes => {
            let balancer = LoadBalancerBuilder {
                x: cli.x,
                sieve_limit: cli.sieve_limit,
                num_threads,
                min_chunk: match cli.min_chunk {
                    Some(width) => MinChunk::Fixed(width),
                    None => MinChunk::Estimate,
                },
                print: cli.status,
                precision: None,
            }
            .build();
            println!(
                "Counting primes in [{}, {}) over {} thread(s), min chunk = {}",
                balancer.start(),
                balancer.sieve_limit(),
                balancer.threads(),
                balancer.min_thread_dist()
            );

            let sieving_primes = primes_below(isqrt(cli.sieve_limit as u128) + 1);
            let count = thread_pool.sum_ranges(&balancer, |range| {
                count_primes_in(black_box(range), &sieving_primes)
            });
            balancer.finish_status();
            println!("primes = {count}");
        }
        Scenario::Segments => {
            let sqrtx = isqrt(cli.x);
            let balancer = SegmentBalancerBuilder {
                sqrtx,
                y: (cli.x as f64).cbrt() as u64,
                num_threads,
                print: cli.status,
            }
            .build();
            println!(
                "Counting primes in [0, {sqrtx}) over {} thread(s), y = {}",
                balancer.threads(),
                balancer.y()
            );

            let sieving_primes = primes_below(isqrt(sqrtx as u128) + 1);
            let count = thread_pool.sum_segments(&balancer, |segment| {
                count_primes_in(black_box(segment), &sieving_primes)
            });
            println!("\nprimes = {count}");
        }
        Scenario::Leaves => {
            let n = cli.sieve_limit;
            let mut counter = WorkCounter::new();
            // The cost of each claimed value `b` is proportional to `n / b`.
            let sum = thread_pool.sum_claims(&mut counter, 1u64, isqrt(n as u128) + 1, 1, |b| {
                (1..=n / b).map(|k| n / (b * k)).sum::<u64>()
            });
            println!("leaves = {sum}");
        }
    }
    println!("Elapsed: {:?}", start.elapsed());
}

/// Returns the primes below `limit`.
fn primes_below(limit: u64) -> Vec<u64> {
    let mut is_composite = vec![false; limit as usize];
    let mut primes = Vec::new();
    for i in 2..limit {
        if !is_composite[i as usize] {
            primes.push(i);
            for j in (i * i..limit).step_by(i as usize) {
                is_composite[j as usize] = true;
            }
        }
    }
    primes
}

/// Counts the primes in a segment, sieving with all the primes up to
/// `sqrt(range.end)`.
fn count_primes_in(range: Range<u64>, sieving_primes: &[u64]) -> u64 {
    let mut is_composite = vec![false; (range.end - range.start) as usize];
    for &p in sieving_primes.iter().take_while(|&&p| p * p < range.end) {
        let first = (range.start.div_ceil(p) * p).max(p * p);
        for j in (first..range.end).step_by(p as usize) {
            is_composite[(j - range.start) as usize] = true;
        }
    }
    is_composite
        .iter()
        .zip(range)
        .filter(|&(&composite, n)| !composite && n >= 2)
        .count() as u64
}

#[derive(Parser, Debug, PartialEq, Eq)]
#[command(version, about, long_about = None)]
struct Cli {
    /// Number of worker threads. Default to the available parallelism.
    #[arg(long)]
    num_threads: Option<NonZeroUsize>,

    /// Scenario to run in parallel.
    #[arg(long, value_enum)]
    scenario: Scenario,

    /// Magnitude of the computation. Sieving starts at its square root.
    #[arg(long, default_value_t = 1_000_000_000_000)]
    x: u128,

    /// Exclusive upper bound of the sieving interval.
    #[arg(long, default_value_t = 100_000_000)]
    sieve_limit: u64,

    /// Minimum chunk width. Default to an estimate based on the sieving limit.
    #[arg(long)]
    min_chunk: Option<NonZeroU64>,

    /// Whether to print the status while computing.
    #[arg(long, default_value_t = false)]
    status: bool,
}

/// Scenario to run.
#[derive(ValueEnum, Clone, Debug, PartialEq, Eq)]
enum Scenario {
    /// Count primes in `[sqrt(x), sieve-limit)` with a segmented sieve, split
    /// into ranges by the load balancer.
    Primes,
    /// Count primes in `[0, sqrt(x))` with a segmented sieve, split into
    /// cache-sized segments.
    Segments,
    /// Sum an irregular-cost kernel over values claimed one at a time.
    Leaves,
}
