/* Copyright (c) 2018 University of Utah
 *
 * Permission to use, copy, modify, and distribute this software for any
 * purpose with or without fee is hereby granted, provided that the above
 * copyright notice and this permission notice appear in all copies.
 *
 * THE SOFTWARE IS PROVIDED "AS IS" AND THE AUTHOR(S) DISCLAIM ALL WARRANTIES
 * WITH REGARD TO THIS SOFTWARE INCLUDING ALL IMPLIED WARRANTIES OF
 * MERCHANTABILITY AND FITNESS. IN NO EVENT SHALL AUTHORS BE LIABLE FOR
 * ANY SPECIAL, DIRECT, INDIRECT, OR CONSEQUENTIAL DAMAGES OR ANY DAMAGES
 * WHATSOEVER RESULTING FROM LOSS OF USE, DATA OR PROFITS, WHETHER IN AN
 * ACTION OF CONTRACT, NEGLIGENCE OR OTHER TORTIOUS ACTION, ARISING OUT OF
 * OR IN CONNECTION WITH THE USE OR PERFORMANCE OF THIS SOFTWARE.
 */

//! A monotonic nanosecond clock.
//!
//! The teacher's `sandstorm::cycles` reads the TSC directly with an inline
//! `rdtsc`, which requires nightly's `asm!` and is x86-only. We keep the
//! same contract — a monotonic counter the scheduler never confuses with
//! wall-clock time — but source it from `std::time::Instant`, which is
//! monotonic on every platform stable Rust targets.

use std::time::Instant;

/// Nanoseconds since some unspecified but fixed starting point. Only
/// differences between two `now()` calls are meaningful.
pub type Nanos = u64;

/// A monotonic clock. Cheap to clone; all instances share the same epoch
/// for the lifetime of the process.
#[derive(Clone, Copy)]
pub struct Clock {
    epoch: Instant,
}

impl Clock {
    pub fn new() -> Clock {
        Clock {
            epoch: Instant::now(),
        }
    }

    /// Nanoseconds elapsed since this clock was created.
    #[inline]
    pub fn now(&self) -> Nanos {
        self.epoch.elapsed().as_nanos() as Nanos
    }
}

impl Default for Clock {
    fn default() -> Clock {
        Clock::new()
    }
}

/// Wall-clock nanoseconds since the Unix epoch, used only for the
/// `timestamp_ns` message header field (never for scheduling decisions).
pub fn unix_nanos() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}

/// Accumulates elapsed time across repeated start/stop spans and logs a
/// running average every `measurement_count` samples. Grounded on
/// `db/src/cyclecounter.rs`'s `CycleCounter`, translated from TSC cycles to
/// nanoseconds.
pub struct Stopwatch {
    clock: Clock,
    start: Nanos,
    total: u64,
    run_count: u64,
    measurement_count: u64,
    label: &'static str,
}

impl Stopwatch {
    pub fn new(label: &'static str, measurement_count: u64) -> Stopwatch {
        Stopwatch {
            clock: Clock::new(),
            start: 0,
            total: 0,
            run_count: 0,
            measurement_count,
            label,
        }
    }

    pub fn start(&mut self) {
        self.start = self.clock.now();
    }

    /// Stops the span, returning its elapsed nanoseconds. Logs and resets
    /// the running average once `measurement_count` spans have elapsed.
    pub fn stop(&mut self) -> u64 {
        let elapsed = self.clock.now().saturating_sub(self.start);
        self.total += elapsed;
        self.run_count += 1;
        if self.run_count == self.measurement_count {
            log::info!(
                "{}: avg {} ns/op over {} samples",
                self.label,
                self.total / self.run_count,
                self.run_count
            );
            self.run_count = 0;
            self.total = 0;
        }
        elapsed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clock_is_monotonic_non_decreasing() {
        let clock = Clock::new();
        let a = clock.now();
        let b = clock.now();
        assert!(b >= a);
    }

    #[test]
    fn stopwatch_accumulates() {
        let mut sw = Stopwatch::new("test", 2);
        sw.start();
        assert!(sw.stop() < 1_000_000_000);
        sw.start();
        assert!(sw.stop() < 1_000_000_000);
    }
}
