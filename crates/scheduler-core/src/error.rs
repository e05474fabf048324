//! Crate error type and handler-outcome classification.
//!
//! `SchedulerError` is the caller-facing error surface (bad input, store
//! failure, timeout). `FailureKind` is a separate axis: how a job handler's
//! outcome should be treated by the retry-evaluation step. Keeping these
//! distinct mirrors the split between `ErrorKind` (handler classification)
//! and ordinary `Result` propagation seen in the jobs subsystem this crate
//! is descended from.

use thiserror::Error;

/// Errors surfaced to callers of the scheduler's public API.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("invalid state: {0}")]
    State(String),

    #[error("operation timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("store error: {0}")]
    Store(#[source] Box<dyn std::error::Error + Send + Sync>),
}

impl SchedulerError {
    pub fn kind(&self) -> ErrorKindTag {
        match self {
            SchedulerError::NotFound(_) => ErrorKindTag::NotFound,
            SchedulerError::Configuration(_) => ErrorKindTag::Configuration,
            SchedulerError::State(_) => ErrorKindTag::State,
            SchedulerError::Timeout(_) => ErrorKindTag::Timeout,
            SchedulerError::Store(_) => ErrorKindTag::Store,
        }
    }

    pub fn store<E: std::error::Error + Send + Sync + 'static>(err: E) -> Self {
        SchedulerError::Store(Box::new(err))
    }
}

/// Stable tag for the five error kinds (`E_NOT_FOUND`, `E_CONFIGURATION`,
/// `E_STATE`, `E_TIMEOUT`, `E_STORE`), useful for metrics labels or matching
/// without destructuring the error's payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKindTag {
    NotFound,
    Configuration,
    State,
    Timeout,
    Store,
}

impl ErrorKindTag {
    pub fn as_code(&self) -> &'static str {
        match self {
            ErrorKindTag::NotFound => "E_NOT_FOUND",
            ErrorKindTag::Configuration => "E_CONFIGURATION",
            ErrorKindTag::State => "E_STATE",
            ErrorKindTag::Timeout => "E_TIMEOUT",
            ErrorKindTag::Store => "E_STORE",
        }
    }
}

/// How a job handler's outcome should be treated by retry evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum FailureKind {
    /// Transient; eligible for retry under the trigger's retry policy.
    Retryable,
    /// Permanent; skip remaining retries and dead-letter immediately.
    NonRetryable,
    /// The run was cancelled by the caller; do not retry or dead-letter.
    Cancelled,
}

impl FailureKind {
    pub fn should_retry(&self) -> bool {
        matches!(self, FailureKind::Retryable)
    }
}

/// Classify a failed run's [`SchedulerError`] into a [`FailureKind`].
///
/// `NotFound`/`Configuration` are always permanent. `State` is the catch-all
/// a handler returns for its own business-logic failures, so it's
/// classified on its *inner* message via [`classify_error_message`] — never
/// on the variant's full `Display` output, which always reads
/// `"invalid state: {0}"` and would flag every `State` error as non-retryable
/// regardless of what it actually says.
pub fn classify_scheduler_error(err: &SchedulerError) -> FailureKind {
    match err {
        SchedulerError::NotFound(_) | SchedulerError::Configuration(_) => FailureKind::NonRetryable,
        SchedulerError::Timeout(_) => FailureKind::Retryable,
        SchedulerError::State(message) => classify_error_message(message),
        SchedulerError::Store(source) => classify_error_message(&source.to_string()),
    }
}

/// Best-effort classification of an opaque error message into a
/// [`FailureKind`]. A `classify_error`-style heuristic: certain substrings
/// ("not found", "invalid", etc.) indicate the input itself was bad and
/// retrying would not help.
pub fn classify_error_message(message: &str) -> FailureKind {
    let lower = message.to_lowercase();
    const NON_RETRYABLE_MARKERS: &[&str] = &[
        "not found",
        "invalid",
        "permission denied",
        "unauthorized",
        "forbidden",
        "deserialize",
        "parse",
    ];
    if NON_RETRYABLE_MARKERS.iter().any(|m| lower.contains(m)) {
        FailureKind::NonRetryable
    } else {
        FailureKind::Retryable
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_tags_map_to_documented_codes() {
        assert_eq!(
            SchedulerError::NotFound("x".into()).kind().as_code(),
            "E_NOT_FOUND"
        );
        assert_eq!(
            SchedulerError::Configuration("x".into()).kind().as_code(),
            "E_CONFIGURATION"
        );
        assert_eq!(
            SchedulerError::State("x".into()).kind().as_code(),
            "E_STATE"
        );
        assert_eq!(
            SchedulerError::Timeout(std::time::Duration::from_secs(1))
                .kind()
                .as_code(),
            "E_TIMEOUT"
        );
    }

    #[test]
    fn classify_error_message_flags_bad_input_as_non_retryable() {
        assert_eq!(
            classify_error_message("job not found"),
            FailureKind::NonRetryable
        );
        assert_eq!(
            classify_error_message("Invalid payload"),
            FailureKind::NonRetryable
        );
    }

    #[test]
    fn classify_error_message_defaults_to_retryable() {
        assert_eq!(
            classify_error_message("connection reset by peer"),
            FailureKind::Retryable
        );
    }

    #[test]
    fn classify_scheduler_error_reads_the_state_variants_inner_message_only() {
        // `State`'s own `Display` always says "invalid state: ...", so
        // classifying on the full rendered string would flag every `State`
        // error as non-retryable no matter what a handler put in it.
        assert_eq!(
            classify_scheduler_error(&SchedulerError::State("simulated failure on attempt 1".into())),
            FailureKind::Retryable
        );
        assert_eq!(
            classify_scheduler_error(&SchedulerError::State("invalid payload shape".into())),
            FailureKind::NonRetryable
        );
    }

    #[test]
    fn classify_scheduler_error_treats_not_found_and_configuration_as_permanent() {
        assert_eq!(
            classify_scheduler_error(&SchedulerError::NotFound("job".into())),
            FailureKind::NonRetryable
        );
        assert_eq!(
            classify_scheduler_error(&SchedulerError::Configuration("bad capacity".into())),
            FailureKind::NonRetryable
        );
        assert_eq!(
            classify_scheduler_error(&SchedulerError::Timeout(std::time::Duration::from_secs(1))),
            FailureKind::Retryable
        );
    }

    #[test]
    fn failure_kind_should_retry() {
        assert!(FailureKind::Retryable.should_retry());
        assert!(!FailureKind::NonRetryable.should_retry());
        assert!(!FailureKind::Cancelled.should_retry());
    }
}
