//! Retry policy and backoff for action execution.

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::sleep;
use tracing::debug;

use crate::error::ActionError;

/// Upper bound on a single backoff delay.
pub const MAX_BACKOFF_DELAY: Duration = Duration::from_secs(300);

/// How the delay between attempts evolves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DelayType {
    /// The same delay before every retry.
    #[default]
    Fixed,
    /// The delay doubles after each attempt, capped at [`MAX_BACKOFF_DELAY`].
    Backoff,
}

/// Retry configuration attached to every action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total number of attempts, including the first one.
    #[serde(default = "default_attempts")]
    pub attempts: u32,
    /// Base delay between attempts.
    #[serde(default, with = "humantime_serde")]
    pub delay: Duration,
    /// Fixed or exponential delay.
    #[serde(default)]
    pub delay_type: DelayType,
}

const fn default_attempts() -> u32 {
    1
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: default_attempts(),
            delay: Duration::ZERO,
            delay_type: DelayType::Fixed,
        }
    }
}

impl RetryPolicy {
    /// Delay to wait after the given (1-based) failed attempt.
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        match self.delay_type {
            DelayType::Fixed => self.delay,
            DelayType::Backoff => {
                let exponent = attempt.saturating_sub(1).min(31);
                self.delay
                    .saturating_mul(1u32 << exponent)
                    .min(MAX_BACKOFF_DELAY)
            }
        }
    }

    /// Returns true if another attempt is allowed after `attempt`.
    #[must_use]
    pub const fn should_retry(&self, attempt: u32) -> bool {
        let max = if self.attempts == 0 { 1 } else { self.attempts };
        attempt < max
    }
}

/// Runs `op` until it succeeds, fails permanently or attempts run out.
///
/// `op` receives the 1-based attempt number.
pub async fn retry_with_policy<F, Fut, T>(policy: &RetryPolicy, mut op: F) -> Result<T, ActionError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, ActionError>>,
{
    let mut attempt = 0;

    loop {
        attempt += 1;

        match op(attempt).await {
            Ok(result) => return Ok(result),
            Err(e) => {
                if !e.is_transient() || !policy.should_retry(attempt) {
                    return Err(e);
                }

                let delay = policy.delay_for_attempt(attempt);
                debug!(attempt, delay_ms = delay.as_millis() as u64, error = %e, "retrying action");
                sleep(delay).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn backoff(delay_secs: u64) -> RetryPolicy {
        RetryPolicy {
            attempts: 10,
            delay: Duration::from_secs(delay_secs),
            delay_type: DelayType::Backoff,
        }
    }

    mod policy_tests {
        use super::*;
        use test_case::test_case;

        #[test]
        fn test_retry_policy_default() {
            let policy = RetryPolicy::default();
            assert_eq!(policy.attempts, 1);
            assert_eq!(policy.delay, Duration::ZERO);
            assert_eq!(policy.delay_type, DelayType::Fixed);
        }

        #[test_case(1, 1 ; "first")]
        #[test_case(2, 2 ; "second")]
        #[test_case(3, 4 ; "third")]
        #[test_case(8, 128 ; "eighth")]
        #[test_case(9, 256 ; "ninth")]
        #[test_case(10, 300 ; "capped")]
        #[test_case(40, 300 ; "far past cap")]
        fn test_backoff_delay(attempt: u32, expected_secs: u64) {
            assert_eq!(
                backoff(1).delay_for_attempt(attempt),
                Duration::from_secs(expected_secs)
            );
        }

        #[test]
        fn test_fixed_delay() {
            let policy = RetryPolicy {
                attempts: 3,
                delay: Duration::from_secs(2),
                delay_type: DelayType::Fixed,
            };
            assert_eq!(policy.delay_for_attempt(1), Duration::from_secs(2));
            assert_eq!(policy.delay_for_attempt(5), Duration::from_secs(2));
        }

        #[test]
        fn test_should_retry() {
            let policy = RetryPolicy {
                attempts: 3,
                ..Default::default()
            };
            assert!(policy.should_retry(1));
            assert!(policy.should_retry(2));
            assert!(!policy.should_retry(3));

            let zero = RetryPolicy {
                attempts: 0,
                ..Default::default()
            };
            assert!(!zero.should_retry(1));
        }

        #[test]
        fn test_policy_from_json() {
            let policy: RetryPolicy =
                serde_json::from_str(r#"{"attempts":4,"delay":"1s","delay_type":"backoff"}"#).unwrap();
            assert_eq!(policy, backoff(1).with_attempts(4));

            let minimal: RetryPolicy = serde_json::from_str("{}").unwrap();
            assert_eq!(minimal, RetryPolicy::default());
        }
    }

    impl RetryPolicy {
        fn with_attempts(mut self, attempts: u32) -> Self {
            self.attempts = attempts;
            self
        }
    }

    mod retry_tests {
        use super::*;

        #[tokio::test(start_paused = true)]
        async fn test_retry_transient_until_success() {
            let calls = Arc::new(AtomicU32::new(0));
            let policy = RetryPolicy {
                attempts: 3,
                delay: Duration::from_secs(1),
                delay_type: DelayType::Backoff,
            };

            let counter = Arc::clone(&calls);
            let start = tokio::time::Instant::now();
            let result = retry_with_policy(&policy, |_| {
                let counter = Arc::clone(&counter);
                async move {
                    if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(ActionError::Transient("timeout".into()))
                    } else {
                        Ok(42)
                    }
                }
            })
            .await;

            assert_eq!(result, Ok(42));
            assert_eq!(calls.load(Ordering::SeqCst), 3);
            // 1s + 2s of backoff
            assert_eq!(start.elapsed(), Duration::from_secs(3));
        }

        #[tokio::test(start_paused = true)]
        async fn test_retry_gives_up_after_attempts() {
            let calls = Arc::new(AtomicU32::new(0));
            let policy = RetryPolicy {
                attempts: 3,
                delay: Duration::from_millis(10),
                delay_type: DelayType::Fixed,
            };

            let counter = Arc::clone(&calls);
            let result: Result<(), _> = retry_with_policy(&policy, |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Err(ActionError::Transient("refused".into())) }
            })
            .await;

            assert!(result.is_err());
            assert_eq!(calls.load(Ordering::SeqCst), 3);
        }

        #[tokio::test]
        async fn test_permanent_error_is_not_retried() {
            let calls = Arc::new(AtomicU32::new(0));
            let policy = RetryPolicy {
                attempts: 5,
                ..Default::default()
            };

            let counter = Arc::clone(&calls);
            let result: Result<(), _> = retry_with_policy(&policy, |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Err(ActionError::Permanent("bad request".into())) }
            })
            .await;

            assert_eq!(result, Err(ActionError::Permanent("bad request".into())));
            assert_eq!(calls.load(Ordering::SeqCst), 1);
        }

        #[tokio::test]
        async fn test_op_receives_attempt_number() {
            let seen = parking_lot::Mutex::new(Vec::new());
            let policy = RetryPolicy {
                attempts: 3,
                ..Default::default()
            };

            let _: Result<(), _> = retry_with_policy(&policy, |attempt| {
                seen.lock().push(attempt);
                async { Err(ActionError::Transient("again".into())) }
            })
            .await;

            assert_eq!(*seen.lock(), vec![1, 2, 3]);
        }
    }
}
