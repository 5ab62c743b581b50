//! Attempt loop shared by the search/extract/context operations.

use agentpipe_core::{classify_status, ApiError, ErrorKind, RetryPolicy};
use std::future::Future;

/// One classified failed attempt. Never leaves this crate.
#[derive(Debug, Clone)]
pub(crate) struct Failure {
    pub kind: ErrorKind,
    pub retryable: bool,
    pub status: Option<u16>,
    pub message: String,
}

/// Typed success payload or a classified failure.
pub(crate) type AttemptOutcome<T> = std::result::Result<T, Failure>;

impl Failure {
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        let kind = classify_status(status);
        Self {
            kind,
            retryable: kind.is_retryable(),
            status: Some(status),
            message: message.into(),
        }
    }

    /// Timeouts and connect failures are transient; decode/builder errors are not.
    pub fn from_transport(e: &reqwest::Error) -> Self {
        if e.is_timeout() {
            return Self {
                kind: ErrorKind::Timeout,
                retryable: true,
                status: None,
                message: format!("request timed out: {e}"),
            };
        }
        let retryable = e.is_connect() || e.is_request();
        Self {
            kind: ErrorKind::Api,
            retryable,
            status: None,
            message: format!("transport error: {e}"),
        }
    }

    pub fn invalid_body(message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::Api,
            retryable: false,
            status: None,
            message: message.into(),
        }
    }

    fn into_api_error(self, kind: ErrorKind, attempts: u32) -> ApiError {
        let mut e = ApiError::new(kind, self.message).with_attempts(attempts);
        e.status = self.status;
        e
    }
}

/// Run `attempt` until it succeeds, fails non-retryably, or the policy runs out.
///
/// Returns the payload and the number of attempts it took. `op` only labels log records.
pub(crate) async fn with_backoff<T, F, Fut>(
    policy: &RetryPolicy,
    op: &'static str,
    mut attempt: F,
) -> std::result::Result<(T, u32), ApiError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = AttemptOutcome<T>>,
{
    let mut index: u32 = 0;
    loop {
        let n = index + 1;
        match attempt(index).await {
            Ok(v) => return Ok((v, n)),
            Err(f) if !f.retryable => {
                tracing::debug!(op, attempt = n, kind = %f.kind, "non-retryable failure");
                let kind = f.kind;
                return Err(f.into_api_error(kind, n));
            }
            Err(f) if !policy.has_attempts_left(n) => {
                tracing::warn!(op, attempts = n, kind = %f.kind, "retries exhausted");
                let kind = f.kind.exhausted();
                let mut e = f.into_api_error(kind, n);
                e.message = format!("{} (gave up after {n} attempts)", e.message);
                return Err(e);
            }
            Err(f) => {
                let delay = policy.delay(index);
                tracing::warn!(
                    op,
                    attempt = n,
                    kind = %f.kind,
                    status = ?f.status,
                    delay_ms = delay.as_millis() as u64,
                    "attempt failed; backing off"
                );
                tokio::time::sleep(delay).await;
            }
        }
        index += 1;
    }
}
