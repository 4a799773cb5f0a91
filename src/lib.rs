// Copyright 2024 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

#![doc = include_str!("../README.md")]
#![forbid(missing_docs)]
#![deny(unsafe_op_in_unsafe_fn)]

mod balancer;
mod claim;
mod core;
mod drive;
mod macros;
mod segment;
mod status;
mod util;

pub use balancer::{ideal_num_threads, LoadBalancerBuilder, MinChunk, RangeLoadBalancer};
pub use claim::{ClaimIndex, Claims, WorkCounter};
pub use self::core::{CpuPinningPolicy, ThreadCount, ThreadPool, ThreadPoolBuilder};
pub use segment::{
    SegmentBalancerBuilder, SegmentLoadBalancer, MIN_SEGMENT_SIZE, NUMBERS_PER_BYTE,
    SEGMENT_ALIGNMENT,
};
pub use status::{percent, status_precision, ProgressReporter, PRINT_INTERVAL};
pub use util::isqrt;
