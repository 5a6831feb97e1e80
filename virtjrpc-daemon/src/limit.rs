//! Global admission control: a token bucket in front of the whole HTTP
//! surface. Five requests per second with a burst of ten; everything above
//! that is answered 429 before dispatch.

use std::time::Instant;

use parking_lot::Mutex;

pub struct TokenBucket {
    state: Mutex<BucketState>,
    rate_per_sec: f64,
    burst: f64,
}

struct BucketState {
    tokens: f64,
    refilled_at: Instant,
}

impl TokenBucket {
    pub fn new(rate_per_sec: f64, burst: u32) -> Self {
        TokenBucket {
            state: Mutex::new(BucketState {
                tokens: f64::from(burst),
                refilled_at: Instant::now(),
            }),
            rate_per_sec,
            burst: f64::from(burst),
        }
    }

    /// Take one token if available.
    pub fn allow(&self) -> bool {
        let mut state = self.state.lock();
        let now = Instant::now();
        let elapsed = now.duration_since(state.refilled_at).as_secs_f64();
        state.tokens = (state.tokens + elapsed * self.rate_per_sec).min(self.burst);
        state.refilled_at = now;

        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

impl Default for TokenBucket {
    fn default() -> Self {
        TokenBucket::new(5.0, 10)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn burst_then_refusals() {
        let bucket = TokenBucket::default();
        let admitted = (0..100).filter(|_| bucket.allow()).count();
        // the burst admits ten; the refill over a few microseconds admits
        // at most one more
        assert!(admitted >= 10 && admitted <= 11, "admitted {}", admitted);
    }

    #[test]
    fn refills_over_time() {
        let bucket = TokenBucket::new(1000.0, 1);
        assert!(bucket.allow());
        assert!(!bucket.allow());
        std::thread::sleep(std::time::Duration::from_millis(5));
        assert!(bucket.allow());
    }
}
