//! Per-source token bucket. Tokens regenerate monotonically at the
//! per-minute rate; bursts draw down to the burst capacity; callers past
//! the burst block until a token accrues.

use std::time::{Duration, Instant};
use tokio::sync::Mutex;

#[derive(Debug)]
pub struct TokenBucket {
    capacity: f64,
    tokens: f64,
    refill_per_sec: f64,
    last_refill: Instant,
}

impl TokenBucket {
    pub fn new(per_minute: u32, burst: u32, now: Instant) -> Self {
        let capacity = burst.max(1) as f64;
        Self {
            capacity,
            tokens: capacity,
            refill_per_sec: per_minute.max(1) as f64 / 60.0,
            last_refill: now,
        }
    }

    fn refill(&mut self, now: Instant) {
        // saturating: a non-monotonic clock reading never drains the bucket
        let elapsed = now.saturating_duration_since(self.last_refill);
        self.tokens =
            (self.tokens + elapsed.as_secs_f64() * self.refill_per_sec).min(self.capacity);
        self.last_refill = now;
    }

    /// Take one token. None on success; Some(wait) tells the caller how long
    /// until a token accrues.
    pub fn try_acquire(&mut self, now: Instant) -> Option<Duration> {
        self.refill(now);
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            None
        } else {
            let deficit = 1.0 - self.tokens;
            Some(Duration::from_secs_f64(deficit / self.refill_per_sec))
        }
    }
}

pub struct RateLimiter {
    bucket: Mutex<TokenBucket>,
}

impl RateLimiter {
    pub fn new(per_minute: u32, burst: u32) -> Self {
        Self {
            bucket: Mutex::new(TokenBucket::new(per_minute, burst, Instant::now())),
        }
    }

    /// Block until a token is available.
    pub async fn acquire(&self) {
        loop {
            let wait = self.bucket.lock().await.try_acquire(Instant::now());
            match wait {
                None => return,
                Some(d) => tokio::time::sleep(d).await,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn burst_tokens_are_available_immediately() {
        let now = Instant::now();
        let mut b = TokenBucket::new(60, 10, now);
        for _ in 0..10 {
            assert!(b.try_acquire(now).is_none());
        }
        assert!(b.try_acquire(now).is_some());
    }

    #[test]
    fn tokens_regenerate_at_the_per_minute_rate() {
        let now = Instant::now();
        let mut b = TokenBucket::new(60, 1, now);
        assert!(b.try_acquire(now).is_none());
        // 60/min = 1/sec: after one second exactly one token is back.
        assert!(b.try_acquire(now + Duration::from_secs(1)).is_none());
        assert!(b.try_acquire(now + Duration::from_secs(1)).is_some());
    }

    #[test]
    fn wait_hint_matches_the_deficit() {
        let now = Instant::now();
        let mut b = TokenBucket::new(60, 1, now);
        assert!(b.try_acquire(now).is_none());
        let wait = b.try_acquire(now).unwrap();
        assert!(wait <= Duration::from_secs(1));
        assert!(wait >= Duration::from_millis(900));
    }

    #[test]
    fn bucket_never_exceeds_capacity() {
        let now = Instant::now();
        let mut b = TokenBucket::new(600, 5, now);
        // A long idle period refills to capacity, not beyond.
        let later = now + Duration::from_secs(3600);
        for _ in 0..5 {
            assert!(b.try_acquire(later).is_none());
        }
        assert!(b.try_acquire(later).is_some());
    }
}
