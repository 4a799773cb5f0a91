// Copyright 2024 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Integer helpers shared by the balancer and the status line.

/// Returns the integer square root of `x`, i.e. the largest `r` such that
/// `r * r <= x`.
///
/// This is where sieving starts for an input of magnitude `x`: no partial
/// sieve work exists below `sqrt(x)`.
///
/// ```
/// # use sievework::isqrt;
/// assert_eq!(isqrt(0), 0);
/// assert_eq!(isqrt(99), 9);
/// assert_eq!(isqrt(100), 10);
/// assert_eq!(isqrt(u128::MAX), u64::MAX);
/// ```
pub fn isqrt(x: u128) -> u64 {
    // The f64 estimate is off by at most one below 2^104 and by a few thousand
    // near u128::MAX, so the correction loops stay short.
    let mut r = ((x as f64).sqrt() as u128).min(u64::MAX as u128);

    while r * r > x {
        r -= 1;
    }
    // `r < u64::MAX` guarantees that `(r + 1)^2` fits in u128.
    while r < u64::MAX as u128 && (r + 1) * (r + 1) <= x {
        r += 1;
    }

    r as u64
}

/// Computes `sieve_limit^(2/3)`, the order of magnitude of the work needed to
/// initialize a thread (i.e. computing `PrimePi(low)`) near `sieve_limit`.
pub(crate) fn pow_two_thirds(sieve_limit: u64) -> u64 {
    (sieve_limit as f64).powf(2.0 / 3.0) as u64
}
