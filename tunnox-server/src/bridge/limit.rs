//! # Rate Limiting
//!
//! A token-bucket limiter enforcing a mapping's `bandwidth_bps` per
//! forwarding direction. Acquiring delays the caller until enough tokens
//! have refilled; traffic is never dropped to satisfy the limit.

use std::sync::Mutex;
use std::time::{Duration, Instant};

struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

/// Token bucket over bytes. A rate of zero disables limiting.
pub struct RateLimiter {
    rate_bps: u64,
    capacity: f64,
    bucket: Mutex<Bucket>,
}

impl RateLimiter {
    /// One second of burst capacity at the configured rate.
    pub fn new(rate_bps: u64) -> Self {
        let capacity = (rate_bps as f64 / 8.0).max(1.0);
        Self {
            rate_bps,
            capacity,
            bucket: Mutex::new(Bucket {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    pub fn is_unlimited(&self) -> bool {
        self.rate_bps == 0
    }

    /// Waits until `bytes` tokens are available, then takes them.
    pub async fn acquire(&self, bytes: usize) {
        if self.is_unlimited() || bytes == 0 {
            return;
        }
        let bytes_per_sec = self.rate_bps as f64 / 8.0;
        // Oversize bursts drain the bucket fully and pay the remainder.
        let needed = (bytes as f64).min(self.capacity);

        loop {
            let wait = {
                let mut bucket = self.bucket.lock().expect("rate bucket poisoned");
                let elapsed = bucket.last_refill.elapsed().as_secs_f64();
                bucket.tokens = (bucket.tokens + elapsed * bytes_per_sec).min(self.capacity);
                bucket.last_refill = Instant::now();

                if bucket.tokens >= needed {
                    bucket.tokens -= needed;
                    None
                } else {
                    Some(Duration::from_secs_f64(
                        (needed - bucket.tokens) / bytes_per_sec,
                    ))
                }
            };
            match wait {
                None => return,
                Some(wait) => tokio::time::sleep(wait).await,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unlimited_never_waits() {
        let limiter = RateLimiter::new(0);
        let start = Instant::now();
        for _ in 0..100 {
            limiter.acquire(1_000_000).await;
        }
        assert!(start.elapsed() < Duration::from_millis(50));
    }

    #[tokio::test]
    async fn limited_acquire_paces_the_caller() {
        // 8000 bps = 1000 bytes/sec, bucket starts full at 1000 tokens.
        let limiter = RateLimiter::new(8_000);
        limiter.acquire(1_000).await; // drains the initial burst

        let start = Instant::now();
        limiter.acquire(100).await; // needs ~100ms of refill
        let waited = start.elapsed();
        assert!(waited >= Duration::from_millis(80), "waited {waited:?}");
    }
}
