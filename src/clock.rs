//! Monotonic millisecond clock and the entropy source feeding the delay
//! sampler.

use std::time::Instant;

use rand::{rngs::OsRng, RngCore};
use thiserror::Error;

#[derive(Debug, Error)]
#[error("monotonic clock crossed the 32-bit millisecond boundary; restart required")]
pub struct ClockOverflow;

/// Millisecond clock whose epoch is its construction time. Keeping the
/// epoch late keeps emitted timestamps far below the 32-bit wrap for any
/// plausible uptime; crossing it anyway is reported as an error because
/// release times travel to the compositor as 32-bit quantities.
pub struct Clock {
    epoch: Instant,
}

impl Clock {
    pub fn new() -> Self {
        Self {
            epoch: Instant::now(),
        }
    }

    pub fn now_ms(&self) -> Result<u64, ClockOverflow> {
        let now = self.epoch.elapsed().as_millis();
        if now > u128::from(u32::MAX) {
            return Err(ClockOverflow);
        }
        Ok(now as u64)
    }
}

/// Uniform integers from a cryptographic source.
pub struct Entropy<R = OsRng> {
    rng: R,
}

impl Entropy<OsRng> {
    pub fn new() -> Self {
        Self { rng: OsRng }
    }
}

impl<R: RngCore> Entropy<R> {
    #[cfg(test)]
    pub fn with_rng(rng: R) -> Self {
        Self { rng }
    }

    /// Uniform draw on `[lo, hi]` inclusive. Biased raw draws are rejected;
    /// `lo >= hi` returns `hi`.
    pub fn uniform(&mut self, lo: u64, hi: u64) -> u64 {
        if lo >= hi {
            return hi;
        }
        let span = hi - lo;
        if span == u64::MAX {
            return self.rng.next_u64();
        }
        let range = span + 1;
        // 2^64 mod range, computed without overflowing
        let rem = (u64::MAX % range + 1) % range;
        let limit = u64::MAX - rem;
        loop {
            let raw = self.rng.next_u64();
            if raw <= limit {
                return lo + raw % range;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::mock::StepRng;

    #[test]
    fn degenerate_ranges_return_hi() {
        let mut entropy = Entropy::with_rng(StepRng::new(7, 1));
        assert_eq!(entropy.uniform(5, 5), 5);
        assert_eq!(entropy.uniform(6, 5), 5);
    }

    #[test]
    fn draws_stay_inside_the_range() {
        let mut entropy = Entropy::with_rng(StepRng::new(0, 0x9e3779b97f4a7c15));
        for _ in 0..1000 {
            let v = entropy.uniform(10, 110);
            assert!((10..=110).contains(&v));
        }
    }

    #[test]
    fn biased_draws_are_rejected() {
        // first draw is u64::MAX, which is biased for a range of 3 and must
        // be skipped; the wrapped second draw (0) maps to lo
        let mut entropy = Entropy::with_rng(StepRng::new(u64::MAX, 1));
        assert_eq!(entropy.uniform(0, 2), 0);
    }

    #[test]
    fn full_span_passes_raw_draws_through() {
        let mut entropy = Entropy::with_rng(StepRng::new(42, 0));
        assert_eq!(entropy.uniform(0, u64::MAX), 42);
    }

    #[test]
    fn clock_is_monotonic() {
        let clock = Clock::new();
        let a = clock.now_ms().unwrap();
        let b = clock.now_ms().unwrap();
        assert!(b >= a);
    }
}
