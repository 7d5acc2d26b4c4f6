//! Error types for FormPilot.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Top-level error type for the orchestrator.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Adapter error: {0}")]
    Adapter(#[from] AdapterError),

    #[error("Budget error: {0}")]
    Budget(#[from] BudgetError),

    #[error("Job error: {0}")]
    Job(#[from] JobError),

    #[error("Handler error: {0}")]
    Handler(#[from] HandlerError),

    #[error("HITL error: {0}")]
    Hitl(#[from] HitlError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Unknown quality preset: {0}")]
    UnknownPreset(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: String, id: String },

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Errors surfaced by the browser-driving adapter.
#[derive(Debug, thiserror::Error)]
pub enum AdapterError {
    #[error("Adapter failed to start: {0}")]
    StartFailed(String),

    #[error("Browser session disconnected: {0}")]
    Disconnected(String),

    #[error("Action failed: {reason}")]
    ActionFailed { reason: String },

    #[error("Extraction failed: {0}")]
    ExtractFailed(String),

    #[error("Navigation to {url} failed: {reason}")]
    NavigationFailed { url: String, reason: String },

    #[error("Screenshot failed: {0}")]
    ScreenshotFailed(String),

    #[error("Adapter protocol error: {0}")]
    Protocol(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Budget ceiling violations, raised synchronously from the event pump.
#[derive(Debug, thiserror::Error)]
pub enum BudgetError {
    #[error("Action limit exceeded: {actions} of {limit} allowed actions")]
    ActionLimitExceeded { actions: u64, limit: u64 },

    #[error("Budget exceeded: spent {spent} of {ceiling} allowed")]
    BudgetExceeded { spent: String, ceiling: String },
}

/// Job lifecycle errors.
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("Job {id} not found")]
    NotFound { id: Uuid },

    #[error("Job {id} cannot transition from {from} to {to}")]
    InvalidTransition { id: Uuid, from: String, to: String },

    #[error("Job {id} claim is held by another worker")]
    ClaimHeld { id: Uuid },

    #[error("Job {id} exceeded its deadline of {timeout:?}")]
    DeadlineExceeded { id: Uuid, timeout: Duration },

    #[error("Job {id} was cancelled")]
    Cancelled { id: Uuid },
}

/// Task handler errors.
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    #[error("No handler registered for task type '{task_type}'")]
    UnknownTaskType { task_type: String },

    #[error("Input validation failed: {reason}")]
    InvalidInput { reason: String },

    #[error("Handler failed: {reason}")]
    Failed { reason: String },
}

/// Human-in-the-loop escalation errors.
#[derive(Debug, thiserror::Error)]
pub enum HitlError {
    #[error("No human resolution arrived within {timeout:?}")]
    ResolutionTimeout { timeout: Duration },

    #[error("Page still blocked by {category} after {attempts} resume attempts")]
    StillBlocked { category: String, attempts: u32 },

    #[error("Resolution payload missing for job {id}")]
    MissingResolution { id: Uuid },
}

/// Terminal failure taxonomy attached to every failed job.
///
/// The wire representation is the snake_case name; see
/// `crate::executor::classify` for how raw error messages map onto it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    BudgetExceeded,
    ActionLimitExceeded,
    CaptchaBlocked,
    LoginRequired,
    Timeout,
    RateLimited,
    ElementNotFound,
    NetworkError,
    BrowserCrashed,
    ValidationError,
    HitlTimeout,
    InternalError,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::BudgetExceeded => "budget_exceeded",
            Self::ActionLimitExceeded => "action_limit_exceeded",
            Self::CaptchaBlocked => "captcha_blocked",
            Self::LoginRequired => "login_required",
            Self::Timeout => "timeout",
            Self::RateLimited => "rate_limited",
            Self::ElementNotFound => "element_not_found",
            Self::NetworkError => "network_error",
            Self::BrowserCrashed => "browser_crashed",
            Self::ValidationError => "validation_error",
            Self::HitlTimeout => "hitl_timeout",
            Self::InternalError => "internal_error",
        }
    }

    /// Whether a job failing with this kind may be requeued for another
    /// attempt. Configuration and validation failures never are.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Timeout
                | Self::RateLimited
                | Self::ElementNotFound
                | Self::NetworkError
                | Self::BrowserCrashed
                | Self::InternalError
        )
    }

    /// Whether this kind should attempt human intervention before failing,
    /// provided a live adapter is still attached.
    pub fn is_hitl_eligible(&self) -> bool {
        matches!(self, Self::CaptchaBlocked | Self::LoginRequired)
    }
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result type alias for the orchestrator.
pub type Result<T> = std::result::Result<T, Error>;
