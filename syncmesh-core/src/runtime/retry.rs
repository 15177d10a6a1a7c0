//! Bounded retry
//!
//! Lease renewal, channel publishes and heartbeats all retry a fixed number
//! of times before giving up. Sleeping between attempts is interrupted by
//! shutdown.

use std::future::Future;
use std::time::Duration;

use tracing::warn;

use super::shutdown::ShutdownSignal;
use crate::error::{Result, SyncError};

/// Delay schedule between attempts
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Backoff {
    Fixed(Duration),
    /// `base * failures`, capped at `max`
    Linear { base: Duration, max: Duration },
    /// `base * 2^(failures-1)`, capped at `max`
    Exponential { base: Duration, max: Duration },
}

impl Backoff {
    /// Delay after the given number of consecutive failures (1-based)
    pub fn delay(&self, failures: u32) -> Duration {
        let failures = failures.max(1);
        match *self {
            Backoff::Fixed(delay) => delay,
            Backoff::Linear { base, max } => base.saturating_mul(failures).min(max),
            Backoff::Exponential { base, max } => {
                let factor = 1u32.checked_shl(failures - 1).unwrap_or(u32::MAX);
                base.saturating_mul(factor).min(max)
            }
        }
    }
}

/// Attempt budget plus delay schedule
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: Backoff,
}

impl RetryPolicy {
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff: Backoff::Fixed(delay),
        }
    }

    /// Run `op` until it succeeds, fails with a non-retryable error, or the
    /// attempt budget runs out.
    pub async fn run<T, F, Fut>(
        &self,
        operation: &str,
        shutdown: Option<&ShutdownSignal>,
        mut op: F,
    ) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 0;

        loop {
            attempt += 1;
            let err = match op().await {
                Ok(value) => return Ok(value),
                Err(err) if !err.is_retryable() => return Err(err),
                Err(err) => err,
            };

            if attempt >= max_attempts {
                return Err(SyncError::RetryExhausted {
                    operation: operation.to_string(),
                    attempts: attempt,
                    last_error: err.to_string(),
                });
            }

            let delay = self.backoff.delay(attempt);
            warn!(
                "{} failed (attempt {}/{}), retrying in {:?}: {}",
                operation, attempt, max_attempts, delay, err
            );

            match shutdown {
                Some(signal) => {
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = signal.cancelled() => return Err(SyncError::ShutdownInProgress),
                    }
                }
                None => tokio::time::sleep(delay).await,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn transient() -> SyncError {
        SyncError::Store {
            message: "connection reset".into(),
        }
    }

    #[test]
    fn test_backoff_schedules() {
        let base = Duration::from_secs(3);
        assert_eq!(Backoff::Fixed(base).delay(5), base);

        let linear = Backoff::Linear {
            base,
            max: Duration::from_secs(10),
        };
        assert_eq!(linear.delay(2), Duration::from_secs(6));
        assert_eq!(linear.delay(6), Duration::from_secs(10));

        let exp = Backoff::Exponential {
            base: Duration::from_millis(100),
            max: Duration::from_secs(1),
        };
        assert_eq!(exp.delay(1), Duration::from_millis(100));
        assert_eq!(exp.delay(3), Duration::from_millis(400));
        assert_eq!(exp.delay(40), Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_succeeds_after_transient_failures() {
        let calls = Arc::new(AtomicU32::new(0));
        let policy = RetryPolicy::fixed(6, Duration::from_secs(3));

        let counter = calls.clone();
        let value = policy
            .run("renew", None, || {
                let counter = counter.clone();
                async move {
                    if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(transient())
                    } else {
                        Ok(7)
                    }
                }
            })
            .await
            .unwrap();

        assert_eq!(value, 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausts_attempts() {
        let calls = Arc::new(AtomicU32::new(0));
        let policy = RetryPolicy::fixed(6, Duration::from_secs(3));

        let counter = calls.clone();
        let err = policy
            .run("publish", None, || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>(transient())
                }
            })
            .await
            .unwrap_err();

        assert!(matches!(err, SyncError::RetryExhausted { attempts: 6, .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 6);
    }

    #[tokio::test]
    async fn test_non_retryable_error_returns_immediately() {
        let policy = RetryPolicy::fixed(6, Duration::from_secs(3));
        let err = policy
            .run("decode", None, || async {
                Err::<(), _>(SyncError::InvalidMessage {
                    reason: "bad json".into(),
                })
            })
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::InvalidMessage { .. }));
    }

    #[tokio::test]
    async fn test_shutdown_interrupts_backoff() {
        let signal = ShutdownSignal::new();
        signal.shutdown();
        let policy = RetryPolicy::fixed(6, Duration::from_secs(3600));

        let err = policy
            .run("renew", Some(&signal), || async { Err::<(), _>(transient()) })
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::ShutdownInProgress));
    }
}
