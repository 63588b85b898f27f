//! Backoff helpers shared by the worker pool and the retry policy.

use rand::Rng;
use std::time::Duration;

/// Exponential backoff for polling loops.
///
/// Doubles `initial` for every consecutive miss (`count` starts at 1) and
/// never exceeds `max`.
pub fn calculate_backoff(count: u32, initial: Duration, max: Duration) -> Duration {
    let shift = count.saturating_sub(1).min(16);
    initial
        .checked_mul(1u32 << shift)
        .unwrap_or(max)
        .min(max)
}

/// Add up to 10% random jitter on top of `delay`.
pub fn with_jitter(delay: Duration) -> Duration {
    let max_jitter = delay.as_millis() as u64 / 10;
    if max_jitter == 0 {
        return delay;
    }
    let jitter = rand::thread_rng().gen_range(0..=max_jitter);
    delay + Duration::from_millis(jitter)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_calculate_backoff_doubles_then_caps() {
        let initial = Duration::from_millis(10);
        let max = Duration::from_millis(70);

        assert_eq!(calculate_backoff(1, initial, max), Duration::from_millis(10));
        assert_eq!(calculate_backoff(2, initial, max), Duration::from_millis(20));
        assert_eq!(calculate_backoff(3, initial, max), Duration::from_millis(40));
        assert_eq!(calculate_backoff(4, initial, max), max);
        assert_eq!(calculate_backoff(u32::MAX, initial, max), max);
    }

    #[test]
    fn test_zero_count_uses_initial() {
        let initial = Duration::from_millis(10);
        assert_eq!(
            calculate_backoff(0, initial, Duration::from_secs(1)),
            initial
        );
    }

    #[test]
    fn test_jitter_on_tiny_delay_is_noop() {
        assert_eq!(with_jitter(Duration::from_millis(5)), Duration::from_millis(5));
    }
}
