/// Capped exponential backoff.
///
/// Pure arithmetic only. Every state machine that retries keeps its own
/// attempt counter and asks this module for the delay.
use std::time::Duration;

/// `base_ms * 2^attempt`, clamped to `cap_ms`. Attempt 0 yields `base_ms`
/// (or `cap_ms` if the base already exceeds it).
pub fn backoff_delay_ms(base_ms: u64, attempt: u32, cap_ms: u64) -> u64 {
    let factor = 1u64.checked_shl(attempt).unwrap_or(u64::MAX);
    base_ms.saturating_mul(factor).min(cap_ms)
}

/// [`backoff_delay_ms`] over `Duration`s.
pub fn backoff_delay(base: Duration, attempt: u32, cap: Duration) -> Duration {
    let base_ms = u64::try_from(base.as_millis()).unwrap_or(u64::MAX);
    let cap_ms = u64::try_from(cap.as_millis()).unwrap_or(u64::MAX);
    Duration::from_millis(backoff_delay_ms(base_ms, attempt, cap_ms))
}
