//! Token-bucket rate limiter

use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::backend::{BackendError, BackendResult};

/// Refill `rate` tokens per second up to `burst`
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RateLimitConfig {
    pub rate: f64,
    pub burst: u32,
}

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

#[derive(Debug)]
pub struct RateLimiter {
    rate: f64,
    burst: f64,
    bucket: Mutex<Bucket>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        let burst = f64::from(config.burst.max(1));
        Self {
            rate: if config.rate > 0.0 { config.rate } else { 1.0 },
            burst,
            bucket: Mutex::new(Bucket {
                tokens: burst,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Consume one token or fail with the time until the next one
    pub fn try_acquire(&self) -> BackendResult<()> {
        let mut bucket = self.bucket.lock();
        let now = Instant::now();
        let refill = now.duration_since(bucket.last_refill).as_secs_f64() * self.rate;
        bucket.tokens = (bucket.tokens + refill).min(self.burst);
        bucket.last_refill = now;

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            Ok(())
        } else {
            let retry_after = Duration::from_secs_f64((1.0 - bucket.tokens) / self.rate);
            Err(BackendError::RateLimited { retry_after })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_burst_then_reject() {
        let limiter = RateLimiter::new(RateLimitConfig {
            rate: 1.0,
            burst: 3,
        });
        for _ in 0..3 {
            limiter.try_acquire().unwrap();
        }

        match limiter.try_acquire() {
            Err(BackendError::RateLimited { retry_after }) => {
                assert!(retry_after > Duration::ZERO);
                assert!(retry_after <= Duration::from_secs(1));
            }
            other => panic!("expected RateLimited, got {:?}", other),
        }
    }

    #[test]
    fn test_refills_over_time() {
        let limiter = RateLimiter::new(RateLimitConfig {
            rate: 100.0,
            burst: 1,
        });
        limiter.try_acquire().unwrap();
        assert!(limiter.try_acquire().is_err());

        std::thread::sleep(Duration::from_millis(20));
        assert!(limiter.try_acquire().is_ok());
    }
}
