//! Error taxonomy and backoff arithmetic shared by the retrying tool engines.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Classified failure kinds for the search/extract/context provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    Auth,
    RateLimit,
    Server,
    ServiceUnavailable,
    Timeout,
    RetryExhausted,
    Api,
}

impl ErrorKind {
    /// Default verdict for a failure of this kind.
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            ErrorKind::RateLimit
                | ErrorKind::Server
                | ErrorKind::ServiceUnavailable
                | ErrorKind::Timeout
        )
    }

    pub fn code(self) -> ErrorCode {
        match self {
            ErrorKind::Validation => ErrorCode::Validation,
            ErrorKind::Auth => ErrorCode::Auth,
            ErrorKind::RateLimit => ErrorCode::RateLimit,
            ErrorKind::Server => ErrorCode::Server,
            ErrorKind::ServiceUnavailable => ErrorCode::ServiceUnavailable,
            ErrorKind::Timeout => ErrorCode::Timeout,
            ErrorKind::RetryExhausted => ErrorCode::RetryExhausted,
            ErrorKind::Api => ErrorCode::Api,
        }
    }

    /// Kind reported once every attempt failed with a retryable failure of this kind.
    ///
    /// Status-derived kinds keep their identity; transport failures that were retried
    /// under the generic `Api` kind become `RetryExhausted`.
    pub fn exhausted(self) -> ErrorKind {
        match self {
            ErrorKind::Timeout
            | ErrorKind::RateLimit
            | ErrorKind::Server
            | ErrorKind::ServiceUnavailable => self,
            _ => ErrorKind::RetryExhausted,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code().as_str())
    }
}

/// Map an HTTP status from the provider to a failure kind.
pub fn classify_status(status: u16) -> ErrorKind {
    match status {
        400 | 422 => ErrorKind::Validation,
        401 | 403 => ErrorKind::Auth,
        408 => ErrorKind::Timeout,
        429 => ErrorKind::RateLimit,
        503 => ErrorKind::ServiceUnavailable,
        500..=599 => ErrorKind::Server,
        _ => ErrorKind::Api,
    }
}

/// Stable machine-readable codes surfaced to callers. Callers branch on these, not on
/// message text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorCode {
    #[serde(rename = "EMPTY_TASK")]
    EmptyTask,
    #[serde(rename = "VALIDATION_ERROR")]
    Validation,
    #[serde(rename = "AUTH_ERROR")]
    Auth,
    #[serde(rename = "RATE_LIMIT_ERROR")]
    RateLimit,
    #[serde(rename = "SERVER_ERROR")]
    Server,
    #[serde(rename = "SERVICE_UNAVAILABLE")]
    ServiceUnavailable,
    #[serde(rename = "TIMEOUT_ERROR")]
    Timeout,
    #[serde(rename = "RETRY_EXHAUSTED")]
    RetryExhausted,
    #[serde(rename = "API_ERROR")]
    Api,
    #[serde(rename = "FETCH_ERROR")]
    Fetch,
    #[serde(rename = "CONVERSION_ERROR")]
    Conversion,
    #[serde(rename = "EXECUTION_ERROR")]
    Execution,
}

impl ErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::EmptyTask => "EMPTY_TASK",
            ErrorCode::Validation => "VALIDATION_ERROR",
            ErrorCode::Auth => "AUTH_ERROR",
            ErrorCode::RateLimit => "RATE_LIMIT_ERROR",
            ErrorCode::Server => "SERVER_ERROR",
            ErrorCode::ServiceUnavailable => "SERVICE_UNAVAILABLE",
            ErrorCode::Timeout => "TIMEOUT_ERROR",
            ErrorCode::RetryExhausted => "RETRY_EXHAUSTED",
            ErrorCode::Api => "API_ERROR",
            ErrorCode::Fetch => "FETCH_ERROR",
            ErrorCode::Conversion => "CONVERSION_ERROR",
            ErrorCode::Execution => "EXECUTION_ERROR",
        }
    }

    /// Whether the same call might succeed later without changing anything.
    pub fn retryable(self) -> bool {
        matches!(
            self,
            ErrorCode::RateLimit
                | ErrorCode::Server
                | ErrorCode::ServiceUnavailable
                | ErrorCode::Timeout
                | ErrorCode::Fetch
        )
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Terminal, typed error from the search/extract/context client.
#[derive(thiserror::Error, Debug, Clone)]
#[error("{kind}: {message}")]
pub struct ApiError {
    pub kind: ErrorKind,
    pub message: String,
    pub status: Option<u16>,
    pub attempts: u32,
}

impl ApiError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            status: None,
            attempts: 1,
        }
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts;
        self
    }
}

/// Bounded exponential backoff: `delay(i) = min(base * 2^i, max)`.
///
/// Pure configuration; shared by value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first. Always at least 1.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(10),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            ..Self::default()
        }
    }

    /// No cap on the delay (page-fetch schedule).
    pub fn uncapped(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            max_delay: Duration::MAX,
        }
    }

    pub fn with_base_delay(mut self, base_delay: Duration) -> Self {
        self.base_delay = base_delay;
        self
    }

    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    /// Delay to sleep after the failed attempt with the given 0-based index.
    pub fn delay(&self, attempt_index: u32) -> Duration {
        let factor = 2u32.checked_pow(attempt_index).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(Duration::MAX)
            .min(self.max_delay)
    }

    /// The full sleep schedule for a call that fails every attempt (N-1 entries).
    pub fn delays(&self) -> Vec<Duration> {
        (0..self.max_attempts.saturating_sub(1))
            .map(|i| self.delay(i))
            .collect()
    }

    pub fn has_attempts_left(&self, attempts_made: u32) -> bool {
        attempts_made < self.max_attempts
    }
}
