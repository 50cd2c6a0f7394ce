//! Exponential backoff with jitter.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

pub const DEFAULT_MIN: Duration = Duration::from_millis(100);
pub const DEFAULT_MAX: Duration = Duration::from_secs(30);
pub const DEFAULT_FACTOR: f64 = 2.0;

/// Retry delay generator.
///
/// The un-jittered delay of attempt `n` is `min * factor^n`, clamped to
/// `[min, max]`. With jitter, attempt `n` draws uniformly between the
/// un-jittered delays of attempts `n - 1` and `n`, so consecutive delays
/// never decrease.
#[derive(Debug)]
pub struct Backoff {
    attempt: AtomicU64,
    min: Duration,
    max: Duration,
    factor: f64,
    jitter: bool,
    rng: Mutex<StdRng>,
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(DEFAULT_MIN, DEFAULT_MAX, DEFAULT_FACTOR, false)
    }
}

impl Backoff {
    pub fn new(min: Duration, max: Duration, factor: f64, jitter: bool) -> Self {
        Self::with_rng(min, max, factor, jitter, StdRng::from_entropy())
    }

    /// Same as [`Backoff::new`], with a deterministic jitter source.
    pub fn with_seed(min: Duration, max: Duration, factor: f64, jitter: bool, seed: u64) -> Self {
        Self::with_rng(min, max, factor, jitter, StdRng::seed_from_u64(seed))
    }

    fn with_rng(min: Duration, max: Duration, factor: f64, jitter: bool, rng: StdRng) -> Self {
        let min = if min.is_zero() { DEFAULT_MIN } else { min };
        let max = if max.is_zero() { DEFAULT_MAX } else { max };
        let factor = if factor <= 0.0 { DEFAULT_FACTOR } else { factor };
        Self {
            attempt: AtomicU64::new(0),
            min,
            max,
            factor,
            jitter,
            rng: Mutex::new(rng),
        }
    }

    pub const fn min(&self) -> Duration {
        self.min
    }

    pub const fn max(&self) -> Duration {
        self.max
    }

    /// Delay for the next attempt, advancing the attempt counter.
    pub fn duration(&self) -> Duration {
        let attempt = self.attempt.fetch_add(1, Ordering::Relaxed);
        self.for_attempt(attempt)
    }

    /// Delay for the given attempt, without touching the counter.
    pub fn for_attempt(&self, attempt: u64) -> Duration {
        if self.min >= self.max {
            return self.max;
        }

        let upper = self.exponential(attempt);
        if !self.jitter || attempt == 0 {
            return upper;
        }

        let lower = self.exponential(attempt - 1);
        if lower >= upper {
            return upper;
        }

        let unit: f64 = {
            let mut rng = match self.rng.lock() {
                Ok(x) => x,
                Err(e) => e.into_inner(),
            };
            rng.gen()
        };
        lower + (upper - lower).mul_f64(unit)
    }

    pub fn attempt(&self) -> u64 {
        self.attempt.load(Ordering::Relaxed)
    }

    pub fn reset(&self) {
        self.attempt.store(0, Ordering::Relaxed);
    }

    fn exponential(&self, attempt: u64) -> Duration {
        let exp = attempt.min(i32::MAX as u64) as i32;
        let secs = self.min.as_secs_f64() * self.factor.powi(exp);
        if !secs.is_finite() || secs >= self.max.as_secs_f64() {
            return self.max;
        }
        Duration::from_secs_f64(secs).max(self.min)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(v: u64) -> Duration {
        Duration::from_millis(v)
    }

    #[test]
    fn grows_exponentially_up_to_max() {
        let b = Backoff::new(ms(100), ms(1000), 2.0, false);
        let got: Vec<_> = (0..6).map(|_| b.duration()).collect();
        assert_eq!(got, vec![ms(100), ms(200), ms(400), ms(800), ms(1000), ms(1000)]);
        assert_eq!(b.attempt(), 6);
    }

    #[test]
    fn reset_restarts_from_min() {
        let b = Backoff::new(ms(10), ms(1000), 2.0, false);
        b.duration();
        b.duration();
        b.reset();
        assert_eq!(b.duration(), ms(10));
    }

    #[test]
    fn min_not_below_max() {
        let b = Backoff::new(ms(500), ms(100), 2.0, false);
        assert_eq!(b.for_attempt(0), ms(100));
        assert_eq!(b.for_attempt(7), ms(100));
    }

    #[test]
    fn huge_attempt_saturates() {
        let b = Backoff::new(ms(100), Duration::from_secs(10), 2.0, true);
        assert_eq!(b.for_attempt(u64::MAX), Duration::from_secs(10));
    }

    #[test]
    fn jitter_stays_bounded_and_non_decreasing() {
        let b = Backoff::with_seed(ms(100), Duration::from_secs(10), 2.0, true, 7);
        let mut last = Duration::ZERO;
        for _ in 0..20 {
            let d = b.duration();
            assert!(d >= ms(100) && d <= Duration::from_secs(10), "{:?}", d);
            assert!(d >= last, "{:?} < {:?}", d, last);
            last = d;
        }
        assert_eq!(last, Duration::from_secs(10));
    }

    #[test]
    fn seeded_jitter_is_deterministic() {
        let a = Backoff::with_seed(ms(100), ms(5000), 2.0, true, 42);
        let b = Backoff::with_seed(ms(100), ms(5000), 2.0, true, 42);
        for _ in 0..8 {
            assert_eq!(a.duration(), b.duration());
        }
    }
}
