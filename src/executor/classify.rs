//! Failure classification and retry backoff.
//!
//! Typed errors classify directly; everything else falls through an
//! ordered message-pattern table where the first match wins. Browser-crash
//! patterns sit above timeout patterns so a "Target closed" during a slow
//! page classifies as a crash (recoverable in place) rather than a
//! timeout.

use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;

use crate::error::{
    AdapterError, BudgetError, Error, FailureKind, HandlerError, HitlError, JobError,
};

static MESSAGE_RULES: LazyLock<Vec<(Regex, FailureKind)>> = LazyLock::new(|| {
    vec![
        (
            Regex::new(r"(?i)target closed|browser (crashed|closed|disconnected)|session disconnected")
                .unwrap(),
            FailureKind::BrowserCrashed,
        ),
        (
            Regex::new(r"(?i)rate limit|too many requests|\b429\b").unwrap(),
            FailureKind::RateLimited,
        ),
        (
            Regex::new(r"(?i)captcha|cf-turnstile").unwrap(),
            FailureKind::CaptchaBlocked,
        ),
        (
            Regex::new(r"(?i)\b(sign|log) ?in\b|unauthorized|\b401\b|session (has )?expired")
                .unwrap(),
            FailureKind::LoginRequired,
        ),
        (
            Regex::new(r"(?i)timed? ?out|deadline exceeded").unwrap(),
            FailureKind::Timeout,
        ),
        (
            Regex::new(r"(?i)(element|selector).{0,40}not found|no such element|not (visible|interactable)")
                .unwrap(),
            FailureKind::ElementNotFound,
        ),
        (
            Regex::new(r"(?i)network|connection (refused|reset|failed)|\bdns\b|\btls\b|\bssl\b")
                .unwrap(),
            FailureKind::NetworkError,
        ),
        (
            Regex::new(r"(?i)validation|invalid (input|value)|required field").unwrap(),
            FailureKind::ValidationError,
        ),
    ]
});

/// Classify a raw error message. Unmatched messages are internal errors,
/// which stay retryable.
pub fn classify_message(message: &str) -> FailureKind {
    for (pattern, kind) in MESSAGE_RULES.iter() {
        if pattern.is_match(message) {
            return *kind;
        }
    }
    FailureKind::InternalError
}

/// Classify a typed error. Structured variants map directly; string-bearing
/// variants go through the message table.
pub fn classify_error(error: &Error) -> FailureKind {
    match error {
        Error::Config(_) => FailureKind::ValidationError,

        Error::Budget(BudgetError::BudgetExceeded { .. }) => FailureKind::BudgetExceeded,
        Error::Budget(BudgetError::ActionLimitExceeded { .. }) => FailureKind::ActionLimitExceeded,

        Error::Hitl(HitlError::ResolutionTimeout { .. }) => FailureKind::HitlTimeout,
        Error::Hitl(HitlError::StillBlocked { category, .. }) => match category.as_str() {
            "captcha" | "bot_check" => FailureKind::CaptchaBlocked,
            "login" | "2fa" => FailureKind::LoginRequired,
            other => classify_message(other),
        },
        Error::Hitl(HitlError::MissingResolution { .. }) => FailureKind::HitlTimeout,

        Error::Job(JobError::DeadlineExceeded { .. }) => FailureKind::Timeout,

        Error::Handler(HandlerError::InvalidInput { .. })
        | Error::Handler(HandlerError::UnknownTaskType { .. }) => FailureKind::ValidationError,
        Error::Handler(HandlerError::Failed { reason }) => classify_message(reason),

        Error::Adapter(AdapterError::Disconnected(_)) => FailureKind::BrowserCrashed,
        Error::Adapter(AdapterError::NavigationFailed { reason, .. }) => classify_message(reason),
        Error::Adapter(AdapterError::ActionFailed { reason }) => classify_message(reason),
        Error::Adapter(other) => classify_message(&other.to_string()),

        other => classify_message(&other.to_string()),
    }
}

/// Retry backoff: 5s doubling per attempt, capped at 60s.
pub fn backoff_delay(retry_count: u32) -> Duration {
    let secs = 5u64.saturating_mul(1u64 << retry_count.min(6)).min(60);
    Duration::from_secs(secs)
}
