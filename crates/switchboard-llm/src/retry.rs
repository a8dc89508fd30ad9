//! Bounded retry with configurable backoff, shared by the embedding batcher
//! and the OAuth token exchange.

use std::future::Future;
use std::time::Duration;

use switchboard_types::{GatewayError, Result};

/// Backoff policy controlling the delay between retry attempts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackoffPolicy {
    /// Linear backoff: `base * (attempt + 1)`.
    Linear(Duration),
    /// No delay between retries.
    None,
}

impl BackoffPolicy {
    /// Compute the delay after a failed attempt (0-indexed).
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        match self {
            BackoffPolicy::Linear(base) => base.saturating_mul(attempt as u32 + 1),
            BackoffPolicy::None => Duration::ZERO,
        }
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        BackoffPolicy::Linear(Duration::from_millis(500))
    }
}

/// Call `f` up to `max_attempts` times, sleeping per `policy` between failures.
///
/// `f` receives the 0-indexed attempt number. Errors that cannot clear up on
/// their own (see [`gives_up_on`]) end the loop at once; otherwise the error
/// from the final attempt is returned.
pub async fn execute_with_retry<F, Fut, T>(
    mut f: F,
    max_attempts: usize,
    policy: &BackoffPolicy,
    what: &str,
) -> Result<T>
where
    F: FnMut(usize) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let max_attempts = max_attempts.max(1);
    let mut attempt = 0;
    loop {
        match f(attempt).await {
            Ok(value) => return Ok(value),
            Err(e) if attempt + 1 < max_attempts && !gives_up_on(&e) => {
                let delay = policy.delay_for_attempt(attempt);
                tracing::warn!(
                    what,
                    attempt = attempt + 1,
                    max_attempts,
                    delay_ms = %delay.as_millis(),
                    error = %e,
                    "attempt failed, retrying"
                );
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Terminal errors and upstream rejections flagged non-retryable (4xx other
/// than 429) fail the same way on every attempt.
pub fn gives_up_on(err: &GatewayError) -> bool {
    err.is_terminal() || matches!(err, GatewayError::UpstreamError { retryable: false, .. })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn flaky(msg: &str) -> GatewayError {
        GatewayError::UpstreamError {
            provider: "test".into(),
            status: 500,
            message: msg.into(),
            retryable: true,
        }
    }

    #[test]
    fn linear_delays() {
        let policy = BackoffPolicy::Linear(Duration::from_millis(500));
        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(500));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(1000));
        assert_eq!(policy.delay_for_attempt(4), Duration::from_millis(2500));
        assert_eq!(BackoffPolicy::None.delay_for_attempt(3), Duration::ZERO);
    }

    #[tokio::test]
    async fn success_on_first_try() {
        let result = execute_with_retry(|_| async { Ok(7) }, 5, &BackoffPolicy::None, "op").await;
        assert_eq!(result.unwrap(), 7);
    }

    #[tokio::test]
    async fn succeeds_after_failures() {
        let calls = Arc::new(AtomicUsize::new(0));
        let c = calls.clone();
        let result = execute_with_retry(
            move |attempt| {
                c.fetch_add(1, Ordering::SeqCst);
                async move {
                    if attempt < 2 {
                        Err(flaky("busy"))
                    } else {
                        Ok("ok")
                    }
                }
            },
            5,
            &BackoffPolicy::None,
            "op",
        )
        .await;
        assert_eq!(result.unwrap(), "ok");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn exhaustion_returns_last_error() {
        let calls = Arc::new(AtomicUsize::new(0));
        let c = calls.clone();
        let result: Result<()> = execute_with_retry(
            move |attempt| {
                c.fetch_add(1, Ordering::SeqCst);
                async move { Err(flaky(&format!("failure {attempt}"))) }
            },
            5,
            &BackoffPolicy::None,
            "op",
        )
        .await;
        assert_eq!(calls.load(Ordering::SeqCst), 5);
        assert!(result.unwrap_err().to_string().ends_with("failure 4"));
    }

    #[tokio::test]
    async fn rejected_request_is_not_repeated() {
        let calls = Arc::new(AtomicUsize::new(0));
        let c = calls.clone();
        let result: Result<()> = execute_with_retry(
            move |_| {
                c.fetch_add(1, Ordering::SeqCst);
                async {
                    Err(GatewayError::UpstreamError {
                        provider: "test".into(),
                        status: 400,
                        message: "bad input".into(),
                        retryable: false,
                    })
                }
            },
            5,
            &BackoffPolicy::None,
            "op",
        )
        .await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(matches!(result, Err(GatewayError::UpstreamError { status: 400, .. })));
    }

    #[tokio::test]
    async fn terminal_error_is_not_repeated() {
        let calls = Arc::new(AtomicUsize::new(0));
        let c = calls.clone();
        let result: Result<()> = execute_with_retry(
            move |_| {
                c.fetch_add(1, Ordering::SeqCst);
                async { Err(GatewayError::validation("text is required")) }
            },
            5,
            &BackoffPolicy::None,
            "op",
        )
        .await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(result.unwrap_err().is_terminal());
    }

    #[test]
    fn throttling_and_server_errors_are_retried() {
        assert!(!gives_up_on(&flaky("busy")));
        let throttled = GatewayError::UpstreamError {
            provider: "test".into(),
            status: 429,
            message: "slow down".into(),
            retryable: true,
        };
        assert!(!gives_up_on(&throttled));
        let auth = GatewayError::AuthError {
            provider: "test".into(),
            message: "token endpoint down".into(),
        };
        assert!(!gives_up_on(&auth));
    }

    #[tokio::test(start_paused = true)]
    async fn sleeps_between_attempts() {
        let start = tokio::time::Instant::now();
        let _: Result<()> = execute_with_retry(
            |_| async { Err(flaky("down")) },
            3,
            &BackoffPolicy::Linear(Duration::from_millis(100)),
            "op",
        )
        .await;
        // 100ms + 200ms; no sleep after the final attempt.
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(300));
        assert!(elapsed < Duration::from_millis(400));
    }
}
