use std::future::Future;
use std::time::Duration;

use rand::Rng;

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    /// Lower bound of the random factor applied to each delay; `1.0` disables jitter.
    pub jitter_floor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_millis(5),
            max_delay: Duration::from_millis(500),
            jitter_floor: 0.5,
        }
    }
}

impl RetryPolicy {
    pub fn from_millis(max_attempts: u32, initial_ms: u64, max_ms: u64) -> Self {
        Self {
            max_attempts,
            initial_delay: Duration::from_millis(initial_ms),
            max_delay: Duration::from_millis(max_ms.max(initial_ms)),
            ..Self::default()
        }
    }

    /// Delay before retry number `attempt` (zero based), capped at `max_delay`.
    pub fn delay(&self, attempt: u32) -> Duration {
        let multiplier = 1_u64 << attempt.min(16);
        let base_ms = (self.initial_delay.as_millis() as u64).saturating_mul(multiplier);
        let floor = self.jitter_floor.clamp(0.0, 1.0);
        let factor = if floor >= 1.0 { 1.0 } else { rand::thread_rng().gen_range(floor..=1.0) };
        let jittered = Duration::from_millis((base_ms as f64 * factor) as u64);
        jittered.min(self.max_delay)
    }
}

/// Runs `op` until it succeeds, fails with a non-retryable error, or attempts run out.
pub async fn with_retries<T, E, F, Fut>(
    policy: RetryPolicy,
    is_retryable: impl Fn(&E) -> bool,
    mut op: F,
) -> Result<T, E>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let attempts = policy.max_attempts.max(1);
    let mut attempt = 0;
    loop {
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(error) if attempt + 1 < attempts && is_retryable(&error) => {
                tokio::time::sleep(policy.delay(attempt)).await;
                attempt += 1;
            }
            Err(error) => return Err(error),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    use super::{with_retries, RetryPolicy};

    fn policy() -> RetryPolicy {
        RetryPolicy { jitter_floor: 1.0, ..RetryPolicy::default() }
    }

    #[test]
    fn delays_grow_exponentially_up_to_the_cap() {
        let policy = policy();
        assert_eq!(policy.delay(0), Duration::from_millis(5));
        assert_eq!(policy.delay(3), Duration::from_millis(40));
        assert_eq!(policy.delay(10), Duration::from_millis(500));
    }

    #[test]
    fn jittered_delay_stays_within_bounds() {
        let policy = RetryPolicy::default();
        for _ in 0..50 {
            let delay = policy.delay(2);
            assert!(delay >= Duration::from_millis(10) && delay <= Duration::from_millis(20));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn retries_until_attempts_are_exhausted() {
        let calls = AtomicU32::new(0);
        let result: Result<(), &str> = with_retries(policy(), |_| true, |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err("network down") }
        })
        .await;

        assert_eq!(result, Err("network down"));
        assert_eq!(calls.load(Ordering::SeqCst), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn permanent_errors_are_not_retried() {
        let calls = AtomicU32::new(0);
        let result: Result<(), &str> = with_retries(policy(), |error| *error != "404", |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err("404") }
        })
        .await;

        assert_eq!(result, Err("404"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn returns_first_success() {
        let result: Result<u32, &str> = with_retries(policy(), |_| true, |attempt| async move {
            if attempt < 2 {
                Err("flaky")
            } else {
                Ok(attempt)
            }
        })
        .await;

        assert_eq!(result, Ok(2));
    }
}
