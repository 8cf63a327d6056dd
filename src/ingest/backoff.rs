//! Capped exponential backoff with jitter for per-source retry scheduling:
//! base 30 s, factor 2, cap 1 h, jitter +/-20 %.

use rand::Rng;
use std::time::Duration;

pub const BACKOFF_BASE_SECS: u64 = 30;
pub const BACKOFF_FACTOR: f64 = 2.0;
pub const BACKOFF_CAP_SECS: u64 = 3600;
pub const BACKOFF_JITTER: f64 = 0.2;

/// Deterministic delay for the nth retry (0-based), before jitter.
pub fn delay_for_attempt(attempt: u32) -> Duration {
    let secs = BACKOFF_BASE_SECS as f64 * BACKOFF_FACTOR.powi(attempt.min(30) as i32);
    Duration::from_secs_f64(secs.min(BACKOFF_CAP_SECS as f64))
}

/// Apply a jitter factor in [-1, 1] scaled by [`BACKOFF_JITTER`].
pub fn apply_jitter(delay: Duration, unit: f64) -> Duration {
    let unit = unit.clamp(-1.0, 1.0);
    Duration::from_secs_f64(delay.as_secs_f64() * (1.0 + unit * BACKOFF_JITTER))
}

#[derive(Debug, Default)]
pub struct Backoff {
    attempt: u32,
}

impl Backoff {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Next jittered delay; advances the attempt counter.
    pub fn next_delay(&mut self) -> Duration {
        let base = delay_for_attempt(self.attempt);
        self.attempt += 1;
        let unit = rand::thread_rng().gen_range(-1.0..=1.0);
        apply_jitter(base, unit)
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delays_double_until_the_cap() {
        assert_eq!(delay_for_attempt(0), Duration::from_secs(30));
        assert_eq!(delay_for_attempt(1), Duration::from_secs(60));
        assert_eq!(delay_for_attempt(2), Duration::from_secs(120));
        assert_eq!(delay_for_attempt(7), Duration::from_secs(3600));
        assert_eq!(delay_for_attempt(20), Duration::from_secs(3600));
    }

    #[test]
    fn jitter_stays_within_twenty_percent() {
        let d = Duration::from_secs(100);
        assert_eq!(apply_jitter(d, 1.0), Duration::from_secs(120));
        assert_eq!(apply_jitter(d, -1.0), Duration::from_secs(80));
        assert_eq!(apply_jitter(d, 0.0), d);
        // out-of-range factors clamp rather than overshoot
        assert_eq!(apply_jitter(d, 5.0), Duration::from_secs(120));
    }

    #[test]
    fn backoff_advances_and_resets() {
        let mut b = Backoff::new();
        let first = b.next_delay();
        assert!(first >= Duration::from_secs(24) && first <= Duration::from_secs(36));
        assert_eq!(b.attempt(), 1);
        b.reset();
        assert_eq!(b.attempt(), 0);
    }
}
