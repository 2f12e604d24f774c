use std::time::Duration;

/// Exponential backoff schedule shared by the feed fetcher and the Prom client.
///
/// Attempt `n` (0-based) waits `base_delay * 2^n` before retrying, so the
/// default schedule is 2s, 4s, 8s.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt. Total attempts = `max_retries + 1`.
    pub max_retries: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(2),
        }
    }
}

impl RetryPolicy {
    pub const fn new(max_retries: u32, base_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
        }
    }

    /// Delay before retry number `retry_count` (0-based).
    pub fn delay(&self, retry_count: u32) -> Duration {
        // Cap the shift so a misconfigured policy cannot overflow
        self.base_delay
            .saturating_mul(1u32 << retry_count.min(16))
    }

    pub fn can_retry(&self, retry_count: u32) -> bool {
        retry_count < self.max_retries
    }
}
