//! Store traits: the durable contracts the orchestrator requires.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::ManualConfig;
use crate::error::DatabaseError;
use crate::hitl::ResolutionContext;
use crate::job::{Job, JobResult, JobStatus};
use crate::manual::Manual;

/// A persisted HITL interaction record (blocker hit, resume, review).
///
/// Resolution payloads never live here; they sit in a separate
/// read-and-delete table so nothing secret stays at rest after consumption.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobInteraction {
    pub id: Uuid,
    pub job_id: Uuid,
    /// `blocker`, `resume`, or `review`.
    pub kind: String,
    pub blocker_category: Option<String>,
    pub screenshot_ref: Option<String>,
    pub detail: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl JobInteraction {
    pub fn blocker(
        job_id: Uuid,
        category: &str,
        screenshot_ref: Option<String>,
        detail: serde_json::Value,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            job_id,
            kind: "blocker".to_string(),
            blocker_category: Some(category.to_string()),
            screenshot_ref,
            detail,
            created_at: Utc::now(),
        }
    }

    pub fn resume(job_id: Uuid, detail: serde_json::Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            job_id,
            kind: "resume".to_string(),
            blocker_category: None,
            screenshot_ref: None,
            detail,
            created_at: Utc::now(),
        }
    }
}

/// Append-only audit record. Write-only from the core's perspective; a
/// failed write must never abort the job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobEvent {
    pub job_id: Uuid,
    pub event_type: String,
    pub metadata: serde_json::Value,
    pub actor: String,
}

impl JobEvent {
    pub fn new(job_id: Uuid, event_type: &str, metadata: serde_json::Value) -> Self {
        Self {
            job_id,
            event_type: event_type.to_string(),
            metadata,
            actor: "orchestrator".to_string(),
        }
    }
}

/// Durable job rows, claims, interactions, and the audit log.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Run all pending schema migrations.
    async fn run_migrations(&self) -> Result<(), DatabaseError>;

    // ── Jobs ────────────────────────────────────────────────────────

    async fn insert_job(&self, job: &Job) -> Result<(), DatabaseError>;

    async fn get_job(&self, id: Uuid) -> Result<Option<Job>, DatabaseError>;

    /// Current status only, the polling fallback for resume signals.
    async fn get_status(&self, id: Uuid) -> Result<Option<JobStatus>, DatabaseError>;

    async fn update_status(&self, id: Uuid, status: JobStatus) -> Result<(), DatabaseError>;

    /// Atomically claim the oldest runnable pending job for `worker_id`:
    /// sets `worker_id`, bumps the heartbeat, and moves it to `queued`.
    /// Returns `None` when the queue is empty.
    async fn claim_next_pending(&self, worker_id: &str) -> Result<Option<Job>, DatabaseError>;

    /// Release the worker claim (`worker_id = NULL`) without touching status.
    async fn release_claim(&self, id: Uuid) -> Result<(), DatabaseError>;

    /// Requeue after a retryable failure: release the claim, set
    /// `retry_count`, move back to `pending`, and record the earliest next
    /// attempt time (the backoff).
    async fn requeue_for_retry(
        &self,
        id: Uuid,
        retry_count: u32,
        next_attempt_at: DateTime<Utc>,
    ) -> Result<(), DatabaseError>;

    async fn heartbeat(&self, id: Uuid, worker_id: &str) -> Result<(), DatabaseError>;

    /// Persist the terminal (or partial-failure) result summary and cost.
    async fn save_result(&self, id: Uuid, result: &JobResult) -> Result<(), DatabaseError>;

    /// Mark jobs past their deadline as `expired`. Returns how many.
    async fn expire_overdue(&self, now: DateTime<Utc>) -> Result<usize, DatabaseError>;

    // ── HITL ────────────────────────────────────────────────────────

    async fn save_interaction(&self, interaction: &JobInteraction) -> Result<(), DatabaseError>;

    async fn list_interactions(&self, job_id: Uuid)
    -> Result<Vec<JobInteraction>, DatabaseError>;

    /// Store a resolution payload for a paused job (written by the external
    /// review surface; exposed here for tests and local tooling).
    async fn put_resolution(
        &self,
        job_id: Uuid,
        resolution: &ResolutionContext,
    ) -> Result<(), DatabaseError>;

    /// Atomically read **and delete** the resolution payload. The payload may
    /// carry secrets and must never remain at rest after being read.
    async fn take_resolution(
        &self,
        job_id: Uuid,
    ) -> Result<Option<ResolutionContext>, DatabaseError>;

    /// Store screenshot bytes, returning an opaque reference.
    async fn save_screenshot(&self, job_id: Uuid, bytes: &[u8])
    -> Result<String, DatabaseError>;

    // ── Audit log ───────────────────────────────────────────────────

    async fn append_event(&self, event: &JobEvent) -> Result<(), DatabaseError>;
}

/// Durable manual cache. The only cross-job-shared mutable resource in the
/// system; health updates are applied atomically per replay outcome.
#[async_trait]
pub trait ManualStore: Send + Sync {
    /// Usable manuals matching the job coordinates, best health first.
    /// Manuals below `config.usability_threshold` are never returned.
    async fn find_candidates(
        &self,
        target_url: &str,
        task_type: &str,
        platform: &str,
        config: &ManualConfig,
    ) -> Result<Vec<Manual>, DatabaseError>;

    async fn insert_manual(&self, manual: &Manual) -> Result<(), DatabaseError>;

    async fn get_manual(&self, id: Uuid) -> Result<Option<Manual>, DatabaseError>;

    /// Atomically apply a replay outcome to the manual's health score,
    /// returning the new score. Concurrent replays of the same manual by
    /// different workers must not lose updates.
    async fn apply_replay_outcome(
        &self,
        id: Uuid,
        success: bool,
        config: &ManualConfig,
    ) -> Result<f64, DatabaseError>;
}
