use std::time::Duration;

use rand::Rng;

/// Every retryable stage gets at most this many attempts, whether the
/// failure is a transient gateway error or a structured-output/Sigma
/// validation failure fed back into the next prompt (§4.1 retry table).
pub const MAX_ATTEMPTS: u32 = 3;

const BASE_DELAY_MS: u64 = 250;
const MAX_DELAY_MS: u64 = 8_000;

/// Exponential backoff with full jitter: `base * 2^(attempt-1)`, capped,
/// then a uniformly random delay in `[0, cap]` (§4.1 "exponential backoff
/// with jitter").
pub fn backoff_delay(attempt: u32) -> Duration {
    let exp = BASE_DELAY_MS.saturating_mul(1u64 << attempt.saturating_sub(1).min(10));
    let cap = exp.min(MAX_DELAY_MS);
    let jittered = rand::thread_rng().gen_range(0..=cap);
    Duration::from_millis(jittered)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_and_stays_capped() {
        for attempt in 1..=6 {
            let delay = backoff_delay(attempt);
            assert!(delay.as_millis() as u64 <= MAX_DELAY_MS);
        }
    }
}
