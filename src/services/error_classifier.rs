//! Failure classification and retry decisions.
//!
//! Maps raw failures (HTTP statuses, transport errors, arbitrary error
//! values, bare messages) onto [`ErrorKind`] and decides whether another
//! attempt is worthwhile. Everything here is pure: no I/O, no clocks, and
//! every function is total over its input.

use std::error::Error as StdError;
use std::time::Duration;

use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::StatusCode;

use crate::domain::{ClassifiedError, ErrorKind, FailureStatus};
use crate::providers::ProviderError;
use crate::storage::DatabaseError;

/// Statuses worth retrying.
pub const TRANSIENT_STATUSES: [u16; 6] = [408, 429, 500, 502, 503, 504];

/// Statuses that retrying cannot fix.
pub const PERMANENT_STATUSES: [u16; 5] = [400, 401, 403, 404, 410];

/// Classifies an HTTP status, reading `Retry-After` (delta-seconds) from
/// `headers` when present.
pub fn classify_http_error(status: u16, headers: Option<&HeaderMap>) -> ClassifiedError {
    let retry_after_secs = headers
        .and_then(|h| h.get(RETRY_AFTER))
        .and_then(|v| v.to_str().ok())
        .and_then(parse_retry_after);

    classify_status(status, retry_after_secs, None)
}

fn classify_status(
    status: u16,
    retry_after_secs: Option<u64>,
    message: Option<&str>,
) -> ClassifiedError {
    let kind = if TRANSIENT_STATUSES.contains(&status) {
        ErrorKind::Transient
    } else if PERMANENT_STATUSES.contains(&status) {
        ErrorKind::Permanent
    } else {
        ErrorKind::Unknown
    };

    let message = match message {
        Some(m) if !m.is_empty() => m.to_string(),
        _ => {
            let reason = StatusCode::from_u16(status)
                .ok()
                .and_then(|s| s.canonical_reason());
            match reason {
                Some(reason) => format!("HTTP {status} {reason}"),
                None => format!("HTTP {status}"),
            }
        }
    };

    let mut classified = ClassifiedError::new(kind, message).with_status(status);
    if let Some(secs) = retry_after_secs {
        classified = classified.with_retry_after_ms(secs.saturating_mul(1000));
    }
    classified
}

fn parse_retry_after(value: &str) -> Option<u64> {
    // HTTP-date values are ignored; only delta-seconds are honoured.
    value.trim().parse::<u64>().ok()
}

/// Classifies a provider error.
pub fn classify_provider_error(err: &ProviderError) -> ClassifiedError {
    let message = err.to_string();
    match err {
        ProviderError::Connection(_) | ProviderError::Timeout(_) => {
            ClassifiedError::new(ErrorKind::Transient, message)
        }
        ProviderError::RateLimited { retry_after_secs } => {
            classify_status(429, *retry_after_secs, Some(&message))
        }
        ProviderError::Http {
            status,
            retry_after_secs,
            message: body,
        } => classify_status(*status, *retry_after_secs, Some(body)),
        ProviderError::Authentication(_) => classify_status(401, None, Some(&message)),
        ProviderError::NotFound(_) => classify_status(404, None, Some(&message)),
        ProviderError::InvalidRequest(_) => classify_status(400, None, Some(&message)),
        ProviderError::Provider(_) => classify_message(&message),
        ProviderError::Transport(inner) => classify_reqwest_error(inner),
    }
}

/// Classifies an HTTP client error.
pub fn classify_reqwest_error(err: &reqwest::Error) -> ClassifiedError {
    if let Some(status) = err.status() {
        return classify_status(status.as_u16(), None, Some(&err.to_string()));
    }
    if err.is_connect() || err.is_timeout() || err.is_request() {
        return ClassifiedError::new(ErrorKind::Transient, err.to_string());
    }
    classify_message(&err.to_string())
}

fn classify_io_error(err: &std::io::Error) -> ClassifiedError {
    use std::io::ErrorKind as Io;

    let kind = match err.kind() {
        Io::ConnectionRefused
        | Io::ConnectionReset
        | Io::ConnectionAborted
        | Io::NotConnected
        | Io::BrokenPipe
        | Io::TimedOut
        | Io::Interrupted
        | Io::UnexpectedEof => ErrorKind::Transient,
        Io::NotFound => return classify_status(404, None, Some(&err.to_string())),
        Io::PermissionDenied => return classify_status(403, None, Some(&err.to_string())),
        _ => return classify_message(&err.to_string()),
    };
    ClassifiedError::new(kind, err.to_string())
}

fn classify_database_error(err: &DatabaseError) -> ClassifiedError {
    match err {
        DatabaseError::Sqlite(rusqlite::Error::SqliteFailure(code, _))
            if matches!(
                code.code,
                rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
            ) =>
        {
            ClassifiedError::new(ErrorKind::Transient, err.to_string())
        }
        _ => ClassifiedError::new(ErrorKind::Unknown, err.to_string()),
    }
}

/// Classifies a bare message using wording heuristics.
///
/// Unmatched messages classify as [`ErrorKind::Unknown`] with the message
/// preserved.
pub fn classify_message(message: &str) -> ClassifiedError {
    let lower = message.to_lowercase();

    if contains_any(&lower, &["rate limit", "too many requests"]) {
        classify_status(429, None, Some(message))
    } else if contains_any(&lower, &["not found"]) {
        classify_status(404, None, Some(message))
    } else if contains_any(&lower, &AUTH_WORDING) {
        classify_status(401, None, Some(message))
    } else if contains_any(&lower, &NETWORK_WORDING) {
        ClassifiedError::new(ErrorKind::Transient, message)
    } else {
        ClassifiedError::new(ErrorKind::Unknown, message)
    }
}

const AUTH_WORDING: [&str; 4] = [
    "unauthorized",
    "unauthenticated",
    "authentication",
    "invalid credentials",
];

const NETWORK_WORDING: [&str; 5] = [
    "network",
    "failed to fetch",
    "connection refused",
    "connection reset",
    "timed out",
];

fn contains_any(haystack: &str, needles: &[&str]) -> bool {
    needles.iter().any(|n| haystack.contains(n))
}

/// Classifies any error value.
///
/// Walks the source chain looking for a known error type (provider, HTTP
/// client, I/O, storage); falls back to message heuristics over the whole
/// chain.
pub fn classify_error(err: &(dyn StdError + 'static)) -> ClassifiedError {
    let mut current: Option<&(dyn StdError + 'static)> = Some(err);
    while let Some(e) = current {
        if let Some(provider) = e.downcast_ref::<ProviderError>() {
            return classify_provider_error(provider);
        }
        if let Some(http) = e.downcast_ref::<reqwest::Error>() {
            return classify_reqwest_error(http);
        }
        if let Some(io) = e.downcast_ref::<std::io::Error>() {
            return classify_io_error(io);
        }
        if let Some(db) = e.downcast_ref::<DatabaseError>() {
            return classify_database_error(db);
        }
        current = e.source();
    }

    let mut message = err.to_string();
    let mut source = err.source();
    while let Some(e) = source {
        message.push_str(": ");
        message.push_str(&e.to_string());
        source = e.source();
    }
    classify_message(&message)
}

/// Classifies an [`anyhow::Error`].
pub fn classify_anyhow(err: &anyhow::Error) -> ClassifiedError {
    let inner: &(dyn StdError + Send + Sync + 'static) = err.as_ref();
    classify_error(inner)
}

/// Whether another attempt should be made after `attempt` failures.
///
/// Permanent errors are never retried; everything else is retried while
/// `attempt < max_retries`.
pub fn should_retry(classified: &ClassifiedError, attempt: u32, max_retries: u32) -> bool {
    match classified.kind {
        ErrorKind::Permanent => false,
        ErrorKind::Transient | ErrorKind::Unknown => attempt < max_retries,
    }
}

/// Status to persist for a failure after `attempt` failed attempts.
pub fn failure_status(classified: &ClassifiedError, attempt: u32, max_retries: u32) -> FailureStatus {
    if classified.is_permanent() {
        FailureStatus::Permanent
    } else if attempt >= max_retries {
        FailureStatus::Exhausted
    } else {
        FailureStatus::Pending
    }
}

/// Retry timing parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Attempts allowed before a failure is exhausted.
    pub max_retries: u32,
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// Upper bound for any delay.
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(300),
        }
    }
}

impl RetryPolicy {
    /// Delay before retrying after `attempt` failures (1-based).
    ///
    /// Exponential from `base_delay`, doubled per attempt. A `Retry-After`
    /// hint replaces the exponential value. Both are bounded by `max_delay`.
    pub fn backoff(&self, classified: &ClassifiedError, attempt: u32) -> Duration {
        let delay = match classified.retry_after_ms {
            Some(ms) => Duration::from_millis(ms),
            None => {
                let exponent = attempt.saturating_sub(1).min(31);
                self.base_delay.saturating_mul(1u32 << exponent)
            }
        };
        delay.min(self.max_delay)
    }

    /// Shorthand for [`should_retry`] with this policy's limit.
    pub fn should_retry(&self, classified: &ClassifiedError, attempt: u32) -> bool {
        should_retry(classified, attempt, self.max_retries)
    }

    /// Shorthand for [`failure_status`] with this policy's limit.
    pub fn failure_status(&self, classified: &ClassifiedError, attempt: u32) -> FailureStatus {
        failure_status(classified, attempt, self.max_retries)
    }
}
