//! Deterministic replay of a manual against a live adapter.
//!
//! Replay is all-or-nothing: a step failure aborts the remainder and decays
//! the manual's health; only a full run reinforces it. Mixing a partial
//! replay with LLM improvisation would leave the form in a state neither
//! side can reason about, so the caller falls back for the whole job.

use std::sync::Arc;

use regex::Regex;

use crate::adapter::Adapter;
use crate::config::ManualConfig;
use crate::error::{AdapterError, Error};
use crate::manual::{Manual, ManualStep, StepAction};
use crate::store::ManualStore;

/// Result of one replay attempt. Health has already been updated in the
/// store by the time this is returned.
#[derive(Debug, Clone)]
pub enum ReplayOutcome {
    Completed {
        steps: u32,
        new_health: f64,
    },
    StepFailed {
        step_order: u32,
        reason: String,
        new_health: f64,
    },
}

/// Replays manuals and applies outcome-driven health updates.
pub struct CookbookExecutor {
    manuals: Arc<dyn ManualStore>,
    config: ManualConfig,
}

impl CookbookExecutor {
    pub fn new(manuals: Arc<dyn ManualStore>, config: ManualConfig) -> Self {
        Self { manuals, config }
    }

    /// Replay every step of `manual` in order against `adapter`, resolving
    /// `{{field}}` placeholders from `input`.
    pub async fn replay(
        &self,
        manual: &Manual,
        adapter: &dyn Adapter,
        input: &serde_json::Value,
    ) -> Result<ReplayOutcome, Error> {
        let mut steps: Vec<&ManualStep> = manual.steps.iter().collect();
        steps.sort_by_key(|s| s.order);

        for step in &steps {
            if let Err(e) = self.run_step(step, adapter, input).await {
                // A dead browser says nothing about the manual itself;
                // surface the fault and leave the health score alone.
                if matches!(e, AdapterError::Disconnected(_)) {
                    return Err(e.into());
                }
                tracing::info!(
                    manual = %manual.id,
                    step = step.order,
                    error = %e,
                    "Replay step failed, abandoning manual"
                );
                let new_health = self
                    .manuals
                    .apply_replay_outcome(manual.id, false, &self.config)
                    .await?;
                return Ok(ReplayOutcome::StepFailed {
                    step_order: step.order,
                    reason: e.to_string(),
                    new_health,
                });
            }
        }

        let new_health = self
            .manuals
            .apply_replay_outcome(manual.id, true, &self.config)
            .await?;
        tracing::info!(
            manual = %manual.id,
            steps = steps.len(),
            health = new_health,
            "Manual replayed successfully"
        );
        Ok(ReplayOutcome::Completed {
            steps: steps.len() as u32,
            new_health,
        })
    }

    async fn run_step(
        &self,
        step: &ManualStep,
        adapter: &dyn Adapter,
        input: &serde_json::Value,
    ) -> Result<(), AdapterError> {
        let value = step
            .value
            .as_deref()
            .map(|template| resolve_placeholders(template, input));

        match step.action {
            StepAction::Navigate => adapter.navigate(&step.locator).await,
            StepAction::Fill | StepAction::Select => {
                let ctx = serde_json::json!({
                    "selector": step.locator,
                    "value": value,
                });
                let result = adapter
                    .act(
                        &format!("{} the element {}", step.action.as_str(), step.locator),
                        Some(ctx),
                    )
                    .await?;
                if result.success {
                    Ok(())
                } else {
                    Err(AdapterError::ActionFailed {
                        reason: result.message,
                    })
                }
            }
            StepAction::Click | StepAction::Submit => {
                let ctx = serde_json::json!({ "selector": step.locator });
                let result = adapter
                    .act(
                        &format!("{} {}", step.action.as_str(), step.locator),
                        Some(ctx),
                    )
                    .await?;
                if result.success {
                    Ok(())
                } else {
                    Err(AdapterError::ActionFailed {
                        reason: result.message,
                    })
                }
            }
        }
    }
}

/// Replace `{{field}}` placeholders with string values from the job input.
/// Unknown fields are left in place so the failure is visible downstream.
fn resolve_placeholders(template: &str, input: &serde_json::Value) -> String {
    let re = Regex::new(r"\{\{(\w+)\}\}").expect("static placeholder regex");
    re.replace_all(template, |caps: &regex::Captures<'_>| {
        let key = &caps[1];
        match input.get(key) {
            Some(serde_json::Value::String(s)) => s.clone(),
            Some(other) if !other.is_null() => other.to_string(),
            _ => caps[0].to_string(),
        }
    })
    .into_owned()
}
