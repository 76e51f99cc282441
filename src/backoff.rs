use std::time::Duration;

use rand::Rng;

/// Exponential backoff: `base * factor^(attempt-1)`, capped, with optional jitter.
#[derive(Clone, Debug)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_ms: u64,
    pub factor: f64,
    pub jitter: f64,
    pub cap_ms: u64,
}

impl RetryPolicy {
    /// Provider reads: three retries at 250 ms, 750 ms, 2250 ms.
    pub fn provider_reads() -> Self {
        Self {
            max_attempts: 4,
            base_ms: 250,
            factor: 3.0,
            jitter: 0.0,
            cap_ms: 2_250,
        }
    }

    /// Provider writes carrying an idempotency key: one retry.
    pub fn provider_keyed_writes() -> Self {
        Self {
            max_attempts: 2,
            base_ms: 250,
            factor: 3.0,
            jitter: 0.0,
            cap_ms: 250,
        }
    }

    /// Writes without an idempotency guarantee are never retried.
    pub fn once() -> Self {
        Self {
            max_attempts: 1,
            base_ms: 0,
            factor: 1.0,
            jitter: 0.0,
            cap_ms: 0,
        }
    }

    /// Outbox delivery: 4, 8, 16, 32, 64 minutes between the six attempts.
    pub fn outbox() -> Self {
        Self {
            max_attempts: 6,
            base_ms: 4 * 60 * 1000,
            factor: 2.0,
            jitter: 0.1,
            cap_ms: 2 * 60 * 60 * 1000,
        }
    }

    /// Delay before the attempt following `attempt` (1-based) failures.
    pub fn next_delay(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let exp = (attempt - 1) as f64;
        let mut delay = (self.base_ms as f64) * self.factor.powf(exp);
        if delay > self.cap_ms as f64 {
            delay = self.cap_ms as f64;
        }
        if self.jitter > 0.0 {
            let mut rng = rand::thread_rng();
            let jitter = rng.gen_range(-(self.jitter)..self.jitter);
            delay *= 1.0 + jitter;
            if delay < 0.0 {
                delay = self.base_ms as f64;
            }
        }
        Duration::from_millis(delay.round() as u64)
    }

    pub fn exhausted(&self, attempts: u32) -> bool {
        attempts >= self.max_attempts
    }
}
