//! Replay-first execution: consult the manual cache before spending LLM
//! budget.
//!
//! Only the single best candidate is tried. Chaining fallbacks through
//! several half-healthy manuals burns actions against the same form and
//! risks duplicate partial submissions; one failed replay means the page
//! has drifted and LLM execution re-learns it.

use std::sync::Arc;

use uuid::Uuid;

use crate::adapter::Adapter;
use crate::config::ManualConfig;
use crate::cookbook::{CookbookExecutor, ReplayOutcome};
use crate::error::Error;
use crate::job::Job;
use crate::store::ManualStore;

/// How the cache lookup and replay went.
#[derive(Debug, Clone)]
pub enum EngineOutcome {
    /// The best manual replayed end to end; the job is done.
    Completed { manual_id: Uuid, steps: u32 },
    /// Nothing usable in the cache for this job's coordinates.
    NoManual,
    /// The best candidate failed mid-replay; its health was decayed.
    ReplayFailed {
        manual_id: Uuid,
        step_order: u32,
        reason: String,
    },
}

/// Chooses and replays cached manuals.
pub struct ExecutionEngine {
    manuals: Arc<dyn ManualStore>,
    cookbook: CookbookExecutor,
    config: ManualConfig,
}

impl ExecutionEngine {
    pub fn new(manuals: Arc<dyn ManualStore>, config: ManualConfig) -> Self {
        let cookbook = CookbookExecutor::new(Arc::clone(&manuals), config.clone());
        Self {
            manuals,
            cookbook,
            config,
        }
    }

    /// Look up the best usable manual for `job` and replay it.
    pub async fn try_replay(
        &self,
        job: &Job,
        adapter: &dyn Adapter,
    ) -> Result<EngineOutcome, Error> {
        let candidates = self
            .manuals
            .find_candidates(&job.target_url, &job.task_type, &job.platform(), &self.config)
            .await?;

        let Some(best) = candidates.first() else {
            tracing::debug!(job_id = %job.id, "No usable manual, falling through to LLM");
            return Ok(EngineOutcome::NoManual);
        };

        tracing::info!(
            job_id = %job.id,
            manual = %best.id,
            health = best.health_score,
            candidates = candidates.len(),
            "Replaying cached manual"
        );

        match self.cookbook.replay(best, adapter, &job.input_data).await? {
            ReplayOutcome::Completed { steps, .. } => Ok(EngineOutcome::Completed {
                manual_id: best.id,
                steps,
            }),
            ReplayOutcome::StepFailed {
                step_order, reason, ..
            } => Ok(EngineOutcome::ReplayFailed {
                manual_id: best.id,
                step_order,
                reason,
            }),
        }
    }
}
