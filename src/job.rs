//! Job model and lifecycle state machine.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::budget::BudgetSnapshot;
use crate::error::FailureKind;

/// Lifecycle status of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Created, waiting to be claimed by a worker.
    Pending,
    /// Claimed but not yet executing.
    Queued,
    /// Actively executing.
    Running,
    /// Suspended for human intervention.
    Paused,
    /// Finished the automated portion, waiting for the user to review.
    AwaitingUserReview,
    /// Completed successfully.
    Completed,
    /// Failed permanently.
    Failed,
    /// Cancelled by the user.
    Cancelled,
    /// Missed its deadline before completing.
    Expired,
}

impl JobStatus {
    /// Check if this status allows transitioning to another status.
    ///
    /// `Running -> Pending` is the retry requeue: the claim is released and
    /// the job goes back on the queue. Terminal statuses are immutable.
    pub fn can_transition_to(&self, target: JobStatus) -> bool {
        use JobStatus::*;

        matches!(
            (self, target),
            (Pending, Queued) | (Pending, Running) | (Pending, Cancelled) | (Pending, Expired) |
            (Queued, Running) | (Queued, Cancelled) | (Queued, Expired) |
            (Running, Paused) | (Running, AwaitingUserReview) |
            (Running, Completed) | (Running, Failed) |
            (Running, Cancelled) | (Running, Expired) | (Running, Pending) |
            (Paused, Running) | (Paused, Failed) | (Paused, Cancelled) | (Paused, Expired) |
            (AwaitingUserReview, Running) | (AwaitingUserReview, Completed) |
            (AwaitingUserReview, Failed) | (AwaitingUserReview, Cancelled)
        )
    }

    /// Check if this is a terminal status.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled | Self::Expired)
    }

    pub fn is_active(&self) -> bool {
        !self.is_terminal()
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::AwaitingUserReview => "awaiting_user_review",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::Expired => "expired",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "queued" => Ok(Self::Queued),
            "running" => Ok(Self::Running),
            "paused" => Ok(Self::Paused),
            "awaiting_user_review" => Ok(Self::AwaitingUserReview),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            "expired" => Ok(Self::Expired),
            other => Err(format!("unknown job status '{other}'")),
        }
    }
}

/// How a completed job got its work done.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    /// Deterministic replay of a learned manual.
    Cookbook,
    /// LLM-driven execution through the adapter.
    Llm,
}

impl ExecutionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Cookbook => "cookbook",
            Self::Llm => "llm",
        }
    }
}

/// Terminal report attached to a finished job.
///
/// Every terminal status carries a kind (on failure), a human-readable
/// message, and the cost accrued, never a bare stack trace.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobResult {
    pub final_mode: Option<ExecutionMode>,
    pub failure_kind: Option<FailureKind>,
    pub message: String,
    pub cookbook_steps: Option<u32>,
    pub cost: BudgetSnapshot,
}

impl JobResult {
    pub fn completed(mode: ExecutionMode, cost: BudgetSnapshot) -> Self {
        Self {
            final_mode: Some(mode),
            failure_kind: None,
            message: "Job completed successfully".to_string(),
            cookbook_steps: None,
            cost,
        }
    }

    pub fn failed(kind: FailureKind, message: impl Into<String>, cost: BudgetSnapshot) -> Self {
        Self {
            final_mode: None,
            failure_kind: Some(kind),
            message: message.into(),
            cookbook_steps: None,
            cost,
        }
    }

    pub fn with_cookbook_steps(mut self, steps: u32) -> Self {
        self.cookbook_steps = Some(steps);
        self
    }
}

/// A web-form completion job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub status: JobStatus,
    /// Entry URL of the form to complete.
    pub target_url: String,
    /// Handler key, e.g. `form_application`.
    pub task_type: String,
    /// User-supplied answers and profile data for the form.
    pub input_data: serde_json::Value,
    pub user_id: String,
    pub retry_count: u32,
    pub max_retries: u32,
    /// Overall deadline for one execution attempt.
    pub timeout_seconds: u64,
    /// Quality preset name; `None` means the orchestrator default.
    pub preset: Option<String>,
    /// Claim holder. At most one worker holds a non-null claim at a time.
    pub worker_id: Option<String>,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Job {
    /// Create a new pending job.
    pub fn new(
        target_url: impl Into<String>,
        task_type: impl Into<String>,
        input_data: serde_json::Value,
        user_id: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            status: JobStatus::Pending,
            target_url: target_url.into(),
            task_type: task_type.into(),
            input_data,
            user_id: user_id.into(),
            retry_count: 0,
            max_retries: 3,
            timeout_seconds: 20 * 60,
            preset: None,
            worker_id: None,
            last_heartbeat: None,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
        }
    }

    /// Transition to a new status, enforcing the lifecycle table.
    pub fn transition_to(&mut self, target: JobStatus) -> Result<(), crate::error::JobError> {
        if !self.status.can_transition_to(target) {
            return Err(crate::error::JobError::InvalidTransition {
                id: self.id,
                from: self.status.to_string(),
                to: target.to_string(),
            });
        }

        match target {
            JobStatus::Running if self.started_at.is_none() => {
                self.started_at = Some(Utc::now());
            }
            s if s.is_terminal() => {
                self.finished_at = Some(Utc::now());
            }
            _ => {}
        }

        self.status = target;
        Ok(())
    }

    /// Deadline for one execution attempt.
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }

    /// Platform key used for manual lookup, derived from the target host.
    ///
    /// `https://boards.greenhouse.io/acme/jobs/1` -> `greenhouse.io`.
    pub fn platform(&self) -> String {
        let host = self
            .target_url
            .split("//")
            .nth(1)
            .unwrap_or(&self.target_url)
            .split('/')
            .next()
            .unwrap_or("");
        let parts: Vec<&str> = host.split('.').collect();
        if parts.len() >= 2 {
            parts[parts.len() - 2..].join(".")
        } else {
            host.to_string()
        }
    }

    /// Whether another retry is allowed under the job's ceiling.
    pub fn can_retry(&self) -> bool {
        self.retry_count < self.max_retries
    }
}
