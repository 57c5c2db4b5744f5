use std::time::{Duration, Instant};

use tokio::sync::Mutex;
use tokio::time::sleep;

/// A per-provider token bucket (§4.2 "Rate limiting via a per-provider
/// token-bucket; requests that would exceed capacity wait up to a
/// configured budget before failing as `Transient`").
///
/// Cross-process coordination is advisory only (§5): each process runs
/// its own bucket, refilled locally.
pub struct TokenBucket {
    capacity: f64,
    refill_per_sec: f64,
    state: Mutex<BucketState>,
}

struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    pub fn new(capacity: f64, refill_per_sec: f64) -> Self {
        Self {
            capacity,
            refill_per_sec,
            state: Mutex::new(BucketState {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Waits until at least one token is available, up to `max_wait`.
    /// Returns `false` if the budget was exhausted without acquiring a
    /// token, which the caller maps to a `Transient` gateway error.
    pub async fn acquire(&self, max_wait: Duration) -> bool {
        let deadline = Instant::now() + max_wait;
        loop {
            {
                let mut state = self.state.lock().await;
                self.refill(&mut state);
                if state.tokens >= 1.0 {
                    state.tokens -= 1.0;
                    return true;
                }
            }
            if Instant::now() >= deadline {
                return false;
            }
            sleep(Duration::from_millis(25)).await;
        }
    }

    fn refill(&self, state: &mut BucketState) {
        let now = Instant::now();
        let elapsed = now.duration_since(state.last_refill).as_secs_f64();
        state.tokens = (state.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        state.last_refill = now;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn acquires_immediately_when_tokens_available() {
        let bucket = TokenBucket::new(2.0, 1.0);
        assert!(bucket.acquire(Duration::from_millis(10)).await);
        assert!(bucket.acquire(Duration::from_millis(10)).await);
    }

    #[tokio::test]
    async fn times_out_when_exhausted() {
        let bucket = TokenBucket::new(1.0, 0.001);
        assert!(bucket.acquire(Duration::from_millis(10)).await);
        assert!(!bucket.acquire(Duration::from_millis(50)).await);
    }
}
