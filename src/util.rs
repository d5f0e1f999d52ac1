use rand::Rng;
use tokio::time::{sleep, Duration};
use tracing::debug;

/// Exponential backoff with symmetric jitter: `base * 2^attempt * (1 ± jitter)`.
///
/// `unit` is a sample from `[-1.0, 1.0]`; callers pass a random value, tests pass a fixed one.
pub fn backoff_delay(base: Duration, attempt: u32, jitter: f64, unit: f64) -> Duration {
    let exponent = attempt.min(16);
    let nominal = base.as_secs_f64() * f64::from(2u32.pow(exponent));
    let factor = 1.0 + jitter.clamp(0.0, 1.0) * unit.clamp(-1.0, 1.0);
    Duration::from_secs_f64((nominal * factor).max(0.0))
}

/// [`backoff_delay`] with a random jitter sample.
pub fn jittered_backoff(base: Duration, attempt: u32, jitter: f64) -> Duration {
    let unit = rand::rng().random_range(-1.0..=1.0);
    backoff_delay(base, attempt, jitter, unit)
}

/// Picks a duration uniformly between `min` and `max`.
pub fn jittered_interval(min: Duration, max: Duration) -> Duration {
    if max <= min {
        return min;
    }
    let millis = rand::rng().random_range(min.as_millis() as u64..=max.as_millis() as u64);
    Duration::from_millis(millis)
}

// Used by idle workers so several processes polling an empty queue drift apart.
pub async fn jittered_sleep(min: Duration, max: Duration) {
    let sleep_duration = jittered_interval(min, max);
    debug!("Sleeping for {:?}", sleep_duration);
    sleep(sleep_duration).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_per_attempt() {
        let base = Duration::from_secs(2);
        assert_eq!(backoff_delay(base, 0, 0.25, 0.0), Duration::from_secs(2));
        assert_eq!(backoff_delay(base, 1, 0.25, 0.0), Duration::from_secs(4));
        assert_eq!(backoff_delay(base, 3, 0.25, 0.0), Duration::from_secs(16));
    }

    #[test]
    fn test_backoff_jitter_band() {
        let base = Duration::from_secs(4);
        assert_eq!(backoff_delay(base, 0, 0.25, 1.0), Duration::from_secs(5));
        assert_eq!(backoff_delay(base, 0, 0.25, -1.0), Duration::from_secs(3));

        for attempt in 0..4 {
            let delay = jittered_backoff(base, attempt, 0.5);
            let nominal = 4.0 * f64::from(2u32.pow(attempt));
            assert!(delay.as_secs_f64() >= nominal * 0.5 - 1e-9);
            assert!(delay.as_secs_f64() <= nominal * 1.5 + 1e-9);
        }
    }

    #[test]
    fn test_jittered_interval_bounds() {
        let min = Duration::from_secs(1);
        let max = Duration::from_secs(3);
        for _ in 0..50 {
            let interval = jittered_interval(min, max);
            assert!(interval >= min && interval <= max);
        }
        assert_eq!(jittered_interval(max, min), max);
    }
}
