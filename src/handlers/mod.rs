//! Task handlers: the per-task-type LLM-driven execution strategies.
//!
//! A handler drives the adapter through one kind of task. It never touches
//! the store, the budget, or the lifecycle; the executor owns those. All
//! page work goes through [`HandlerContext`] so every structured action is
//! traced for the learning loop.

pub mod form_application;

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;

use crate::adapter::{Adapter, ObservedElement};
use crate::cookbook::TraceRecorder;
use crate::error::{AdapterError, Error, HandlerError};
use crate::job::Job;
use crate::manual::StepAction;

pub use form_application::FormApplicationHandler;

/// Everything a handler may touch while running one job attempt.
///
/// The fill/select helpers record `{{field}}` placeholders into the trace,
/// not the user's values, so learned manuals never contain applicant data.
pub struct HandlerContext {
    pub adapter: Arc<dyn Adapter>,
    pub job: Job,
    pub trace: Arc<TraceRecorder>,
}

impl HandlerContext {
    pub fn new(adapter: Arc<dyn Adapter>, job: Job, trace: Arc<TraceRecorder>) -> Self {
        Self {
            adapter,
            job,
            trace,
        }
    }

    pub fn input(&self) -> &serde_json::Value {
        &self.job.input_data
    }

    pub async fn navigate(&self, url: &str) -> Result<(), AdapterError> {
        self.adapter.navigate(url).await?;
        self.trace.record(StepAction::Navigate, url, None);
        Ok(())
    }

    /// Fill one field from the job input. Filling overwrites whatever is in
    /// the field already, so re-running after a crash is safe.
    pub async fn fill(&self, selector: &str, field: &str) -> Result<(), AdapterError> {
        self.write_field(StepAction::Fill, "fill", selector, field).await
    }

    /// Choose an option in a dropdown from the job input.
    pub async fn select(&self, selector: &str, field: &str) -> Result<(), AdapterError> {
        self.write_field(StepAction::Select, "select", selector, field)
            .await
    }

    async fn write_field(
        &self,
        action: StepAction,
        verb: &str,
        selector: &str,
        field: &str,
    ) -> Result<(), AdapterError> {
        let value = match self.job.input_data.get(field) {
            Some(serde_json::Value::String(s)) => s.clone(),
            Some(v) if !v.is_null() => v.to_string(),
            _ => {
                return Err(AdapterError::ActionFailed {
                    reason: format!("no input value for field '{field}'"),
                });
            }
        };

        let result = self
            .adapter
            .act(
                &format!("{verb} the element {selector}"),
                Some(serde_json::json!({ "selector": selector, "value": value })),
            )
            .await?;
        if !result.success {
            return Err(AdapterError::ActionFailed {
                reason: result.message,
            });
        }

        self.trace
            .record(action, selector, Some(&format!("{{{{{field}}}}}")));
        Ok(())
    }

    pub async fn click(&self, selector: &str) -> Result<(), AdapterError> {
        self.press(StepAction::Click, "click", selector).await
    }

    pub async fn submit(&self, selector: &str) -> Result<(), AdapterError> {
        self.press(StepAction::Submit, "submit", selector).await
    }

    async fn press(
        &self,
        action: StepAction,
        verb: &str,
        selector: &str,
    ) -> Result<(), AdapterError> {
        let result = self
            .adapter
            .act(
                &format!("{verb} {selector}"),
                Some(serde_json::json!({ "selector": selector })),
            )
            .await?;
        if !result.success {
            return Err(AdapterError::ActionFailed {
                reason: result.message,
            });
        }
        self.trace.record(action, selector, None);
        Ok(())
    }

    pub async fn extract(
        &self,
        instruction: &str,
        schema: &serde_json::Value,
    ) -> Result<serde_json::Value, AdapterError> {
        self.adapter.extract(instruction, schema).await
    }

    pub async fn observe(&self, instruction: &str) -> Result<Vec<ObservedElement>, AdapterError> {
        self.adapter.observe(instruction).await
    }
}

/// One task-type strategy.
#[async_trait]
pub trait TaskHandler: Send + Sync + std::fmt::Debug {
    /// The task-type key this handler serves, e.g. `form_application`.
    fn task_type(&self) -> &'static str;

    /// Cheap preflight validation of the job input, before any browser
    /// session exists.
    fn validate(&self, input: &serde_json::Value) -> Result<(), HandlerError>;

    /// Drive the adapter through the task. Must be restartable from the
    /// beginning after a crash recovery.
    async fn run(&self, ctx: &HandlerContext) -> Result<(), Error>;
}

/// Registry of task handlers, keyed by task type.
pub struct HandlerRegistry {
    handlers: RwLock<HashMap<String, Arc<dyn TaskHandler>>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self {
            handlers: RwLock::new(HashMap::new()),
        }
    }

    pub fn register(&self, handler: Arc<dyn TaskHandler>) {
        self.handlers
            .write()
            .unwrap()
            .insert(handler.task_type().to_string(), handler);
    }

    pub fn get(&self, task_type: &str) -> Result<Arc<dyn TaskHandler>, HandlerError> {
        self.handlers
            .read()
            .unwrap()
            .get(task_type)
            .cloned()
            .ok_or_else(|| HandlerError::UnknownTaskType {
                task_type: task_type.to_string(),
            })
    }

    pub fn task_types(&self) -> Vec<String> {
        self.handlers.read().unwrap().keys().cloned().collect()
    }
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::new()
    }
}
