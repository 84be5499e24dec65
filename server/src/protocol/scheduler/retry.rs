use std::{future::Future, time::Duration};

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

/// Bounded exponential backoff.
///
/// Used both for redelivery of failed envelopes and for retrying store calls.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Attempts allowed in total, the first one included.
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub multiplier: u32,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    /// 5 attempts, starting at 1s and doubling up to 5min.
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_secs(1),
            multiplier: 2,
            max_backoff: Duration::from_secs(300),
        }
    }
}

impl RetryPolicy {
    /// 3 attempts, starting at 50ms and doubling up to 1s.
    pub fn storage_default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(50),
            multiplier: 2,
            max_backoff: Duration::from_secs(1),
        }
    }
    pub fn new(max_attempts: u32, initial_backoff: Duration) -> Self {
        Self {
            max_attempts,
            initial_backoff,
            ..Default::default()
        }
    }
    pub fn with_multiplier(mut self, multiplier: u32) -> Self {
        self.multiplier = multiplier;
        self
    }
    pub fn with_max_backoff(mut self, max_backoff: Duration) -> Self {
        self.max_backoff = max_backoff;
        self
    }
    /// Delay after the `attempts`-th failed attempt.
    pub fn backoff(&self, attempts: u32) -> Duration {
        let factor = self.multiplier.saturating_pow(attempts.saturating_sub(1));
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }
    /// When the next attempt is due, or `None` once `attempts` reached the bound.
    pub fn next_attempt_time(&self, attempts: u32, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        if attempts >= self.max_attempts {
            return None;
        }
        let delay = TimeDelta::from_std(self.backoff(attempts)).ok()?;
        now.checked_add_signed(delay)
    }
    /// Run `operation` until it succeeds or the attempts are used up, the last error is returned.
    pub async fn retry<T, E, F, Fut>(&self, operation: &'static str, mut f: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        let mut attempt = 1;
        loop {
            match f().await {
                Ok(value) => return Ok(value),
                Err(error) if attempt >= self.max_attempts => {
                    tracing::error!(%error, attempt, operation, "attempts exhausted");
                    return Err(error);
                }
                Err(error) => {
                    let backoff = self.backoff(attempt);
                    tracing::warn!(%error, attempt, ?backoff, operation, "attempt failed, retrying");
                    tokio::time::sleep(backoff).await;
                    attempt += 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    #[test]
    fn test_backoff_grows_and_caps() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff(1), Duration::from_secs(1));
        assert_eq!(policy.backoff(2), Duration::from_secs(2));
        assert_eq!(policy.backoff(4), Duration::from_secs(8));
        assert_eq!(policy.backoff(40), Duration::from_secs(300));
    }

    #[test]
    fn test_next_attempt_time_is_bounded() {
        let policy = RetryPolicy::new(3, Duration::from_millis(10));
        let now = Utc::now();
        assert_eq!(
            policy.next_attempt_time(1, now),
            Some(now + TimeDelta::milliseconds(10))
        );
        assert_eq!(
            policy.next_attempt_time(2, now),
            Some(now + TimeDelta::milliseconds(20))
        );
        assert_eq!(policy.next_attempt_time(3, now), None);
        assert_eq!(policy.next_attempt_time(4, now), None);
    }

    #[tokio::test]
    async fn test_retry_gives_up() {
        let policy = RetryPolicy::storage_default().with_max_backoff(Duration::from_millis(1));
        let calls = AtomicU32::new(0);
        let result: Result<(), String> = policy
            .retry("always fails", || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err("nope".to_string()) }
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        let calls = AtomicU32::new(0);
        let result: Result<u32, String> = policy
            .retry("fails once", || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n == 0 {
                        Err("once".to_string())
                    } else {
                        Ok(n)
                    }
                }
            })
            .await;
        assert_eq!(result, Ok(1));
    }
}
