//! Deadlines and retry pacing for blocking acquisitions.

use latchkey_core::{BackoffConfig, LatchkeyResult, LockError};
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;

/// Optional deadline measured from the start of an acquisition.
/// `None` means wait indefinitely.
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    started: Instant,
    timeout: Option<Duration>,
}

impl Deadline {
    pub fn start(timeout: Option<Duration>) -> Self {
        Self {
            started: Instant::now(),
            timeout,
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn is_expired(&self) -> bool {
        self.timeout.is_some_and(|t| self.elapsed() >= t)
    }

    /// Time left, or `None` when unbounded.
    pub fn remaining(&self) -> Option<Duration> {
        self.timeout.map(|t| t.saturating_sub(self.elapsed()))
    }

    /// Shorten `delay` so a sleep never overshoots the deadline.
    pub fn clamp(&self, delay: Duration) -> Duration {
        match self.remaining() {
            Some(left) => delay.min(left),
            None => delay,
        }
    }

    pub fn timeout_error(&self, resource: &str) -> LockError {
        LockError::AcquisitionTimeout {
            resource: resource.to_string(),
            waited: self.elapsed(),
        }
    }
}

/// How long to sleep between attempts.
#[derive(Debug, Clone, PartialEq)]
pub enum RetryPolicy {
    Fixed(Duration),
    Exponential(BackoffConfig),
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (zero-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        match self {
            RetryPolicy::Fixed(interval) => *interval,
            RetryPolicy::Exponential(backoff) => backoff.delay_for(attempt),
        }
    }
}

/// Run `attempt` until it reports success or the deadline passes.
///
/// Errors from `attempt` abort the loop immediately. On timeout returns
/// [`LockError::AcquisitionTimeout`].
pub async fn retry_until<F, Fut>(
    resource: &str,
    timeout: Option<Duration>,
    policy: &RetryPolicy,
    mut attempt: F,
) -> LatchkeyResult<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = LatchkeyResult<bool>>,
{
    let deadline = Deadline::start(timeout);
    let mut retries = 0u32;
    loop {
        if attempt().await? {
            return Ok(());
        }
        if deadline.is_expired() {
            return Err(deadline.timeout_error(resource).into());
        }
        let delay = deadline.clamp(policy.delay_for(retries));
        retries = retries.saturating_add(1);
        tokio::time::sleep(delay).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use latchkey_core::LatchkeyError;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test(start_paused = true)]
    async fn test_succeeds_after_retries() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::Fixed(Duration::from_millis(100));
        retry_until("r", Some(Duration::from_secs(1)), &policy, || async {
            Ok(calls.fetch_add(1, Ordering::SeqCst) >= 2)
        })
        .await
        .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_times_out_with_waited_duration() {
        let policy = RetryPolicy::Fixed(Duration::from_millis(300));
        let err = retry_until("grades", Some(Duration::from_secs(1)), &policy, || async {
            Ok(false)
        })
        .await
        .unwrap_err();
        match err {
            LatchkeyError::Lock(LockError::AcquisitionTimeout { resource, waited }) => {
                assert_eq!(resource, "grades");
                assert!(waited >= Duration::from_secs(1));
                assert!(waited < Duration::from_millis(1300));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_timeout_tries_once() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::Fixed(Duration::from_millis(10));
        let result = retry_until("r", Some(Duration::ZERO), &policy, || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(false)
        })
        .await;
        assert!(result.unwrap_err().is_timeout());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_exponential_policy_caps() {
        let policy = RetryPolicy::Exponential(BackoffConfig {
            initial_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(500),
            backoff_multiplier: 2.0,
        });
        assert_eq!(policy.delay_for(0), Duration::from_millis(10));
        assert_eq!(policy.delay_for(3), Duration::from_millis(80));
        assert_eq!(policy.delay_for(20), Duration::from_millis(500));
    }
}
