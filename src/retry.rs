//! Retry with exponential backoff for network transfers.

use std::future::Future;
use std::time::Duration;
use tracing::warn;

use crate::error::PluginError;

/// Classification of a failed attempt for retry purposes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The explicit download timeout fired. Never retried.
    Timeout,
    /// Server asked us to slow down (429)
    Throttled,
    /// Connection reset, DNS failure, truncated body
    Connection,
    /// Retryable server-side status
    Http5xx(u16),
    /// Client errors, security violations, local filesystem failures
    Fatal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    NoRetry,
    RetryAfter(Duration),
}

/// Exponential backoff policy with caps
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Maximum number of attempts (including the first)
    pub max_attempts: u32,
    /// Delay before the second attempt; doubles after every failure
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// A policy that runs exactly once
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    /// `attempt` is 1-based (1 = first attempt)
    pub fn decide(&self, attempt: u32, kind: ErrorKind) -> RetryDecision {
        if attempt >= self.max_attempts {
            return RetryDecision::NoRetry;
        }

        match kind {
            ErrorKind::Timeout | ErrorKind::Fatal => RetryDecision::NoRetry,
            ErrorKind::Connection | ErrorKind::Throttled | ErrorKind::Http5xx(_) => {
                // base * 2^(attempt-1), capped
                let exp = 1u32 << attempt.saturating_sub(1).min(16);
                let delay = self.base_delay.saturating_mul(exp).min(self.max_delay);
                RetryDecision::RetryAfter(delay)
            }
        }
    }
}

/// Classify an HTTP status code
pub fn classify_status(status: reqwest::StatusCode) -> ErrorKind {
    match status.as_u16() {
        429 => ErrorKind::Throttled,
        code @ 500..=599 => ErrorKind::Http5xx(code),
        _ => ErrorKind::Fatal,
    }
}

/// Classify a transport-level error
pub fn classify_transport(err: &reqwest::Error) -> ErrorKind {
    if err.is_timeout() {
        ErrorKind::Timeout
    } else if let Some(status) = err.status() {
        classify_status(status)
    } else if err.is_connect() || err.is_request() || err.is_body() || err.is_decode() {
        ErrorKind::Connection
    } else {
        ErrorKind::Fatal
    }
}

/// One failed attempt, classified so the loop can decide what to do next
#[derive(Debug)]
pub struct AttemptError {
    pub kind: ErrorKind,
    pub error: PluginError,
}

impl AttemptError {
    pub fn new(kind: ErrorKind, error: PluginError) -> Self {
        Self { kind, error }
    }

    pub fn fatal(error: PluginError) -> Self {
        Self::new(ErrorKind::Fatal, error)
    }
}

impl From<reqwest::Error> for AttemptError {
    fn from(err: reqwest::Error) -> Self {
        Self::new(classify_transport(&err), err.into())
    }
}

/// Runs `op` until it succeeds or the policy says to stop, sleeping between
/// attempts. `op` receives the 1-based attempt number.
pub async fn run_with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    what: &str,
    mut op: F,
) -> Result<T, PluginError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, AttemptError>>,
{
    let mut attempt = 1u32;
    loop {
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(failure) => match policy.decide(attempt, failure.kind) {
                RetryDecision::NoRetry => return Err(failure.error),
                RetryDecision::RetryAfter(delay) => {
                    warn!(
                        what = %what,
                        attempt,
                        max_attempts = policy.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %failure.error,
                        "Attempt failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
        }
    }

    #[test]
    fn test_backoff_doubles_from_one_second() {
        let p = RetryPolicy::default();
        assert_eq!(
            p.decide(1, ErrorKind::Connection),
            RetryDecision::RetryAfter(Duration::from_secs(1))
        );
        assert_eq!(
            p.decide(2, ErrorKind::Http5xx(503)),
            RetryDecision::RetryAfter(Duration::from_secs(2))
        );
        assert_eq!(p.decide(3, ErrorKind::Connection), RetryDecision::NoRetry);
    }

    #[test]
    fn test_backoff_is_capped() {
        let p = RetryPolicy {
            max_attempts: 40,
            ..Default::default()
        };
        match p.decide(30, ErrorKind::Throttled) {
            RetryDecision::RetryAfter(d) => assert_eq!(d, p.max_delay),
            other => panic!("expected retry, got {:?}", other),
        }
    }

    #[test]
    fn test_timeout_and_fatal_abort() {
        let p = RetryPolicy::default();
        assert_eq!(p.decide(1, ErrorKind::Timeout), RetryDecision::NoRetry);
        assert_eq!(p.decide(1, ErrorKind::Fatal), RetryDecision::NoRetry);
    }

    #[test]
    fn test_classify_status() {
        use reqwest::StatusCode;
        assert_eq!(classify_status(StatusCode::TOO_MANY_REQUESTS), ErrorKind::Throttled);
        assert_eq!(classify_status(StatusCode::BAD_GATEWAY), ErrorKind::Http5xx(502));
        assert_eq!(classify_status(StatusCode::NOT_FOUND), ErrorKind::Fatal);
    }

    #[tokio::test]
    async fn test_retries_until_success() {
        let calls = AtomicU32::new(0);
        let result = run_with_retry(&fast_policy(3), "test", |_| {
            let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
            async move {
                if n < 3 {
                    Err(AttemptError::new(
                        ErrorKind::Connection,
                        PluginError::Network("reset".into()),
                    ))
                } else {
                    Ok(n)
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(result, 3);
    }

    #[tokio::test]
    async fn test_fatal_stops_immediately() {
        let calls = AtomicU32::new(0);
        let err = run_with_retry(&fast_policy(3), "test", |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err::<(), _>(AttemptError::fatal(PluginError::Security("too big".into()))) }
        })
        .await
        .unwrap_err();
        assert!(matches!(err, PluginError::Security(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_attempts() {
        let calls = AtomicU32::new(0);
        let err = run_with_retry(&fast_policy(3), "test", |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async {
                Err::<(), _>(AttemptError::new(
                    ErrorKind::Http5xx(500),
                    PluginError::Network("HTTP 500".into()),
                ))
            }
        })
        .await
        .unwrap_err();
        assert!(matches!(err, PluginError::Network(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
