// Copyright 2024 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! A throttled status line reporting the progress of a computation.

use std::io::{Stdout, Write};
use std::time::{Duration, Instant};

/// Minimum delay between two status lines.
pub const PRINT_INTERVAL: Duration = Duration::from_millis(100);

/// Width of the blank run used to erase a previous status line.
const CLEAR_WIDTH: usize = 50;

/// Returns the completion percentage `100 * progress / total`, clamped to
/// `[0, 100]`.
///
/// A `total` of zero is treated as one, so this never divides by zero.
///
/// ```
/// # use sievework::percent;
/// assert_eq!(percent(0, 200), 0.0);
/// assert_eq!(percent(50, 200), 25.0);
/// assert_eq!(percent(300, 200), 100.0);
/// assert_eq!(percent(0, 0), 0.0);
/// ```
pub fn percent(progress: u64, total: u64) -> f64 {
    let percent = 100.0 * progress as f64 / total.max(1) as f64;
    percent.clamp(0.0, 100.0)
}

/// Returns the number of decimal digits of the percentage to display for an
/// input of magnitude `x`.
///
/// Larger computations take longer, so they get a finer-grained status.
pub fn status_precision(x: u128) -> usize {
    let x = x as f64;
    if x >= 1e23 {
        2
    } else if x >= 1e21 {
        1
    } else {
        0
    }
}

/// Best-effort emitter of an overwritable `Status: <percent>%` (or `Segment:
/// <index>/<count>`) line.
///
/// Lines of both kinds are throttled together, to at most one per
/// [`PRINT_INTERVAL`], except for the very first one which is emitted
/// immediately. Errors from the underlying writer are ignored: losing a status
/// line never affects the computation.
pub struct ProgressReporter<W: Write = Stdout> {
    /// Whether status lines are emitted at all.
    enabled: bool,
    /// Number of decimal digits of the percentage.
    precision: usize,
    /// Time of the last emitted line, or [`None`] if nothing was printed yet.
    last_print: Option<Instant>,
    /// Output channel.
    out: W,
}

impl ProgressReporter<Stdout> {
    /// Creates a reporter writing to the standard output.
    pub fn stdout(enabled: bool, precision: usize) -> Self {
        Self::new(enabled, precision, std::io::stdout())
    }
}

impl<W: Write> ProgressReporter<W> {
    /// Creates a reporter writing to the given output.
    pub fn new(enabled: bool, precision: usize, out: W) -> Self {
        Self {
            enabled,
            precision,
            last_print: None,
            out,
        }
    }

    /// Returns whether this reporter emits anything.
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Returns the number of decimal digits of the displayed percentage.
    pub fn precision(&self) -> usize {
        self.precision
    }

    /// Emits the status for the given progress, unless disabled or a line was
    /// emitted less than [`PRINT_INTERVAL`] ago.
    ///
    /// Returns whether a line was emitted.
    pub fn print(&mut self, progress: u64, total: u64) -> bool {
        if !self.enabled {
            return false;
        }
        self.print_at(Instant::now(), progress, total)
    }

    /// Same as [`print()`](Self::print), taking the current time as a
    /// parameter.
    pub(crate) fn print_at(&mut self, now: Instant, progress: u64, total: u64) -> bool {
        if !self.take_slot(now) {
            return false;
        }
        let _ = write!(
            self.out,
            "\rStatus: {:.*}%",
            self.precision,
            percent(progress, total)
        );
        let _ = self.out.flush();
        true
    }

    /// Emits a `Segment: <index>/<count>` line for the segment starting at
    /// `low`, out of the segments of width `segment_size` covering `[0,
    /// limit)`. Throttled like [`print()`](Self::print).
    ///
    /// Returns whether a line was emitted.
    pub fn print_segment(&mut self, low: u64, limit: u64, segment_size: u64) -> bool {
        if !self.enabled {
            return false;
        }
        self.print_segment_at(Instant::now(), low, limit, segment_size)
    }

    /// Same as [`print_segment()`](Self::print_segment), taking the current
    /// time as a parameter.
    pub(crate) fn print_segment_at(
        &mut self,
        now: Instant,
        low: u64,
        limit: u64,
        segment_size: u64,
    ) -> bool {
        if !self.take_slot(now) {
            return false;
        }
        let segment_size = segment_size.max(1);
        let _ = write!(
            self.out,
            "\rSegment: {}/{}",
            low.saturating_add(segment_size) / segment_size,
            limit.div_ceil(segment_size)
        );
        let _ = self.out.flush();
        true
    }

    /// Returns whether a line may be emitted at `now`, and if so records `now`
    /// as the time of the last line.
    fn take_slot(&mut self, now: Instant) -> bool {
        if !self.enabled {
            return false;
        }
        let due = match self.last_print {
            None => true,
            Some(last) => now.saturating_duration_since(last) >= PRINT_INTERVAL,
        };
        if due {
            self.last_print = Some(now);
        }
        due
    }

    /// Erases the status line and replaces it with a final `Status: 100%`
    /// line. Does nothing if disabled.
    pub fn finish(&mut self) {
        if !self.enabled {
            return;
        }
        let _ = write!(self.out, "\r{:1$}\r", "", CLEAR_WIDTH);
        let _ = writeln!(self.out, "Status: 100%");
        let _ = self.out.flush();
    }

    /// Consumes this reporter, returning the underlying output.
    pub fn into_inner(self) -> W {
        self.out
    }
}
