use std::future::Future;
use std::time::Duration;

use rand::Rng;
use serde::Serialize;

use crate::config::DispatchConfig;
use crate::services::provider::ProviderError;

/// How a provider failure should be treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ErrorClass {
    /// Permanent, and the routing handle no longer exists. Triggers cleanup.
    TargetGone,
    /// Permanent for any other reason (bad request, auth).
    Permanent,
    /// Transient; worth another attempt.
    Retryable,
}

impl ErrorClass {
    pub fn is_retryable(self) -> bool {
        matches!(self, ErrorClass::Retryable)
    }
}

/// Symbolic codes meaning the device/registration is gone for good.
const TARGET_GONE_CODES: &[&str] = &[
    "UNREGISTERED",
    "NOT_FOUND",
    "NOT_REGISTERED",
    "INVALID_REGISTRATION",
    "BADDEVICETOKEN",
    "messaging/registration-token-not-registered",
    "messaging/invalid-registration-token",
];

/// Symbolic codes meaning the request itself can never succeed.
const PERMANENT_CODES: &[&str] = &[
    "INVALID_ARGUMENT",
    "SENDER_ID_MISMATCH",
    "THIRD_PARTY_AUTH_ERROR",
    "PERMISSION_DENIED",
    "UNAUTHENTICATED",
    "messaging/invalid-argument",
    "messaging/invalid-payload",
    "messaging/mismatched-credential",
];

fn code_in(code: &str, table: &[&str]) -> bool {
    table.iter().any(|c| c.eq_ignore_ascii_case(code))
}

/// Classify a provider error. Structured hints decide: the symbolic code
/// first, then the status. The free-text message is only inspected when the
/// provider gave neither.
pub fn classify(err: &ProviderError) -> ErrorClass {
    if let Some(code) = err.code.as_deref() {
        if code_in(code, TARGET_GONE_CODES) {
            return ErrorClass::TargetGone;
        }
        if code_in(code, PERMANENT_CODES) {
            return ErrorClass::Permanent;
        }
    }

    if let Some(status) = err.status {
        return match status {
            404 => ErrorClass::TargetGone,
            400 | 401 | 403 => ErrorClass::Permanent,
            _ => ErrorClass::Retryable,
        };
    }

    if err.code.is_some() {
        return ErrorClass::Retryable;
    }

    classify_message(&err.message)
}

fn classify_message(message: &str) -> ErrorClass {
    let m = message.to_lowercase();

    if m.contains("not registered")
        || m.contains("not-registered")
        || m.contains("unregistered")
        || m.contains("invalid registration")
        || m.contains("invalid-registration")
        || m.contains("not found")
    {
        return ErrorClass::TargetGone;
    }

    if m.contains("invalid argument") || m.contains("unauthorized") || m.contains("forbidden") {
        return ErrorClass::Permanent;
    }

    ErrorClass::Retryable
}

/// A provider error tagged with its classification, so callers can branch
/// without re-inspecting provider error shapes.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{source} ({class:?} after {attempts} attempt(s))")]
pub struct ClassifiedError {
    pub class: ErrorClass,
    pub attempts: u32,
    pub source: ProviderError,
}

/// Bounded retries with exponential backoff for a single provider call.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_retries: u32,
    initial_delay: Duration,
    max_delay: Duration,
    jitter: Duration,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, initial_delay: Duration) -> Self {
        Self {
            max_retries,
            initial_delay,
            max_delay: Duration::from_secs(10),
            jitter: Duration::ZERO,
        }
    }

    pub fn from_config(cfg: &DispatchConfig) -> Self {
        Self::new(cfg.max_retries, Duration::from_millis(cfg.initial_retry_delay_ms))
            .with_max_delay(Duration::from_millis(cfg.max_retry_delay_ms))
            .with_jitter(Duration::from_millis(cfg.retry_jitter_ms))
    }

    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    pub fn with_jitter(mut self, jitter: Duration) -> Self {
        self.jitter = jitter;
        self
    }

    /// Delay before retry number `attempt` (0-based):
    /// `min(max_delay, initial_delay * 2^attempt)`, without jitter.
    pub fn backoff(&self, attempt: u32) -> Duration {
        self.initial_delay
            .saturating_mul(2u32.saturating_pow(attempt))
            .min(self.max_delay)
    }

    fn jittered(&self, delay: Duration) -> Duration {
        if self.jitter.is_zero() {
            return delay;
        }
        let extra = rand::thread_rng().gen_range(0..=self.jitter.as_millis() as u64);
        delay + Duration::from_millis(extra)
    }

    /// Invoke `call` up to `max_retries + 1` times. Returns the value and the
    /// number of attempts made, or the last error with its classification.
    pub async fn execute<T, F, Fut>(&self, mut call: F) -> Result<(T, u32), ClassifiedError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ProviderError>>,
    {
        let mut attempt: u32 = 0;
        loop {
            let err = match call().await {
                Ok(value) => return Ok((value, attempt + 1)),
                Err(e) => e,
            };

            let class = classify(&err);
            if !class.is_retryable() || attempt >= self.max_retries {
                return Err(ClassifiedError {
                    class,
                    attempts: attempt + 1,
                    source: err,
                });
            }

            let delay = self.jittered(self.backoff(attempt));
            tracing::debug!(
                "Retryable provider error on attempt {}: {}; retrying in {:?}",
                attempt + 1,
                err,
                delay
            );
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use tokio::time::Instant;

    fn err(status: Option<u16>, code: Option<&str>, message: &str) -> ProviderError {
        ProviderError::new(status, code, message)
    }

    #[test]
    fn classification_from_codes_alone() {
        let gone = err(None, Some("messaging/registration-token-not-registered"), "");
        assert_eq!(classify(&gone), ErrorClass::TargetGone);
        assert_eq!(classify(&err(None, Some("unregistered"), "")), ErrorClass::TargetGone);
        assert_eq!(classify(&err(None, Some("INVALID_ARGUMENT"), "")), ErrorClass::Permanent);
        assert_eq!(classify(&err(None, Some("UNAVAILABLE"), "")), ErrorClass::Retryable);
    }

    #[test]
    fn classification_from_status_alone() {
        assert_eq!(classify(&err(Some(404), None, "")), ErrorClass::TargetGone);
        for status in [400, 401, 403] {
            assert_eq!(classify(&err(Some(status), None, "")), ErrorClass::Permanent);
        }
        for status in [429, 500, 502, 503] {
            assert_eq!(classify(&err(Some(status), None, "")), ErrorClass::Retryable);
        }
    }

    #[test]
    fn structured_hints_override_message_text() {
        // Message text says "not registered" but the code says transient.
        let e = err(Some(503), Some("UNAVAILABLE"), "token not registered?");
        assert_eq!(classify(&e), ErrorClass::Retryable);

        // No structured hint at all: fall back to the message.
        let e = err(None, None, "Requested entity was not found.");
        assert_eq!(classify(&e), ErrorClass::TargetGone);
        let e = err(None, None, "connection reset by peer");
        assert_eq!(classify(&e), ErrorClass::Retryable);
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = RetryPolicy::new(5, Duration::from_millis(100))
            .with_max_delay(Duration::from_millis(500));
        assert_eq!(policy.backoff(0), Duration::from_millis(100));
        assert_eq!(policy.backoff(1), Duration::from_millis(200));
        assert_eq!(policy.backoff(2), Duration::from_millis(400));
        assert_eq!(policy.backoff(3), Duration::from_millis(500));
        assert_eq!(policy.backoff(40), Duration::from_millis(500));
    }

    #[tokio::test(start_paused = true)]
    async fn not_found_is_attempted_exactly_once() {
        let policy = RetryPolicy::new(3, Duration::from_millis(100));
        let calls = Arc::new(AtomicU32::new(0));

        let result: Result<((), u32), _> = policy
            .execute(|| {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(err(Some(404), None, "not found"))
                }
            })
            .await;

        let e = result.unwrap_err();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(e.class, ErrorClass::TargetGone);
        assert_eq!(e.attempts, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_then_success() {
        let max_retries = 3;
        let policy = RetryPolicy::new(max_retries, Duration::from_millis(100));
        let calls = Arc::new(AtomicU32::new(0));
        let start = Instant::now();

        let (value, attempts) = policy
            .execute(|| {
                let calls = calls.clone();
                async move {
                    let n = calls.fetch_add(1, Ordering::SeqCst);
                    if n < max_retries {
                        Err(err(Some(503), None, "unavailable"))
                    } else {
                        Ok("msg-1")
                    }
                }
            })
            .await
            .unwrap();

        assert_eq!(value, "msg-1");
        assert_eq!(attempts, max_retries + 1);
        assert_eq!(calls.load(Ordering::SeqCst), max_retries + 1);
        // 100 + 200 + 400 ms of backoff.
        assert!(start.elapsed() >= Duration::from_millis(700));
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retries_return_last_error_tagged() {
        let policy = RetryPolicy::new(2, Duration::from_millis(10));
        let calls = Arc::new(AtomicU32::new(0));

        let e = policy
            .execute(|| {
                let calls = calls.clone();
                async move {
                    let n = calls.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>(err(None, Some("TIMEOUT"), &format!("attempt {}", n)))
                }
            })
            .await
            .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(e.class, ErrorClass::Retryable);
        assert_eq!(e.attempts, 3);
        assert_eq!(e.source.message, "attempt 2");
    }
}
