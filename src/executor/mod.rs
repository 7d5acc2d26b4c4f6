//! Job execution: preflight, replay-first attempt, LLM fallback with crash
//! recovery, HITL routing, classification, and retry.
//!
//! `execute` owns the whole lifecycle of one claimed job. All persistence
//! and notification happen here; handlers and the engine only drive the
//! page.

pub mod classify;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use secrecy::SecretString;
use tokio::sync::broadcast;
use tokio::time::Instant;

use crate::adapter::{Adapter, AdapterEvent, AdapterFactory, StartOptions};
use crate::blocker::BlockerDetector;
use crate::budget::BudgetLedger;
use crate::config::OrchestratorConfig;
use crate::cookbook::TraceRecorder;
use crate::engine::{EngineOutcome, ExecutionEngine};
use crate::error::{Error, FailureKind, HitlError, JobError};
use crate::handlers::{HandlerContext, HandlerRegistry, TaskHandler};
use crate::hitl::{HitlCoordinator, HitlOutcome};
use crate::job::{ExecutionMode, Job, JobResult, JobStatus};
use crate::notify::{CallbackEvent, CallbackNotifier};
use crate::signal::ResumeSignal;
use crate::store::{JobEvent, JobStore, ManualStore};

/// How a successful run got its work done.
enum RunSuccess {
    Cookbook { steps: u32 },
    Llm { trace: Arc<TraceRecorder> },
}

/// Stored inputs for a job's initial browser session.
#[derive(Default)]
pub struct SessionInputs {
    /// Site credentials the user has stored with the external vault.
    pub credentials: Option<SecretString>,
    /// Serialized browser state saved from an earlier session.
    pub session_state: Option<String>,
}

/// Loads a job's stored credentials and prior session state. The store
/// behind it is external; the orchestrator treats both as read-only inputs
/// to the adapter.
#[async_trait]
pub trait SessionInputSource: Send + Sync {
    async fn load(&self, job: &Job) -> SessionInputs;
}

/// Executes claimed jobs end to end.
pub struct JobExecutor {
    store: Arc<dyn JobStore>,
    manuals: Arc<dyn ManualStore>,
    factory: Arc<dyn AdapterFactory>,
    handlers: Arc<HandlerRegistry>,
    notifier: Arc<dyn CallbackNotifier>,
    engine: ExecutionEngine,
    detector: BlockerDetector,
    hitl: HitlCoordinator,
    session_inputs: Option<Arc<dyn SessionInputSource>>,
    config: OrchestratorConfig,
}

impl JobExecutor {
    pub fn new(
        store: Arc<dyn JobStore>,
        manuals: Arc<dyn ManualStore>,
        factory: Arc<dyn AdapterFactory>,
        handlers: Arc<HandlerRegistry>,
        notifier: Arc<dyn CallbackNotifier>,
        signals: Arc<dyn ResumeSignal>,
        config: OrchestratorConfig,
    ) -> Self {
        let engine = ExecutionEngine::new(Arc::clone(&manuals), config.manual.clone());
        let detector = BlockerDetector::new(config.blocker.clone());
        let hitl = HitlCoordinator::new(
            Arc::clone(&store),
            Arc::clone(&notifier),
            signals,
            config.hitl.clone(),
        );
        Self {
            store,
            manuals,
            factory,
            handlers,
            notifier,
            engine,
            detector,
            hitl,
            session_inputs: None,
            config,
        }
    }

    /// Attach a loader for stored credentials and prior browser state.
    /// Without one, every session starts cold.
    pub fn with_session_inputs(mut self, source: Arc<dyn SessionInputSource>) -> Self {
        self.session_inputs = Some(source);
        self
    }

    /// Run one claimed job to a settled state: terminal, or requeued for
    /// retry. Returns the result summary that was persisted.
    pub async fn execute(&self, mut job: Job) -> JobResult {
        tracing::info!(
            job_id = %job.id,
            task_type = %job.task_type,
            url = %job.target_url,
            retry = job.retry_count,
            "Executing job"
        );

        if let Err(e) = self.mark_running(&mut job).await {
            let cost = crate::budget::BudgetSnapshot::default();
            return self.finish_failure(&mut job, e, cost).await;
        }

        // Preflight: handler, input, and budget are checked before any
        // browser session exists. All rejections are zero-cost.
        let (handler, mut ledger) = match self.preflight(&job) {
            Ok(parts) => parts,
            Err(e) => {
                let cost = crate::budget::BudgetSnapshot::default();
                return self.finish_failure(&mut job, e, cost).await;
            }
        };

        let heartbeat = self.spawn_heartbeat(&job);

        let outcome = self.run(&mut job, &handler, &mut ledger).await;

        if let Some(task) = heartbeat {
            task.abort();
        }

        match outcome {
            Ok(RunSuccess::Cookbook { steps }) => {
                let result = JobResult::completed(ExecutionMode::Cookbook, ledger.snapshot())
                    .with_cookbook_steps(steps);
                self.finish_success(&mut job, result).await
            }
            Ok(RunSuccess::Llm { trace }) => {
                self.learn_manual(&job, &trace).await;
                let result = JobResult::completed(ExecutionMode::Llm, ledger.snapshot());
                self.finish_success(&mut job, result).await
            }
            Err(e) => self.finish_failure(&mut job, e, ledger.snapshot()).await,
        }
    }

    async fn mark_running(&self, job: &mut Job) -> Result<(), Error> {
        job.transition_to(JobStatus::Running)?;
        self.store.update_status(job.id, JobStatus::Running).await?;
        self.append_event(JobEvent::new(
            job.id,
            "started",
            serde_json::json!({ "retry_count": job.retry_count }),
        ));
        self.notifier
            .notify(CallbackEvent::JobRunning { job_id: job.id })
            .await;
        Ok(())
    }

    fn preflight(&self, job: &Job) -> Result<(Arc<dyn TaskHandler>, BudgetLedger), Error> {
        let preset = match job.preset.as_deref() {
            Some(name) => name.parse()?,
            None => self.config.default_preset,
        };
        let ledger = BudgetLedger::for_preset(preset);
        ledger.preflight()?;

        let handler = self.handlers.get(&job.task_type)?;
        handler.validate(&job.input_data)?;

        Ok((handler, ledger))
    }

    /// Adapter lifetime wrapper: session start, deadline race, failure-path
    /// HITL routing, and unconditional stop.
    async fn run(
        &self,
        job: &mut Job,
        handler: &Arc<dyn TaskHandler>,
        ledger: &mut BudgetLedger,
    ) -> Result<RunSuccess, Error> {
        let mut adapter = self.factory.create().await?;
        let inputs = match &self.session_inputs {
            Some(source) => source.load(job).await,
            None => SessionInputs::default(),
        };
        let opts = StartOptions {
            url: job.target_url.clone(),
            engine: self.config.browser_engine,
            credentials: inputs.credentials,
            session_state: inputs.session_state,
        };
        adapter.start(opts.clone()).await?;

        let deadline = Instant::now() + job.timeout();
        let mut result = self
            .attempt_with_deadline(job, handler, ledger, &mut adapter, &opts, deadline)
            .await;

        // Failure-path HITL: a captcha/login failure with a live session gets
        // one human round before terminal handling.
        if let Err(e) = &result {
            let kind = classify::classify_error(e);
            if kind.is_hitl_eligible() && adapter.is_active() && adapter.is_connected().await {
                match self.escalate_failure(job, adapter.as_ref()).await {
                    Ok(true) => {
                        result = self
                            .attempt_with_deadline(job, handler, ledger, &mut adapter, &opts, deadline)
                            .await;
                    }
                    Ok(false) => {} // no confirmed blocker; keep the original error
                    Err(hitl_err) => result = Err(hitl_err),
                }
            }
        }

        if let Err(e) = adapter.stop().await {
            tracing::warn!(job_id = %job.id, error = %e, "Failed to stop adapter");
        }
        result
    }

    async fn attempt_with_deadline(
        &self,
        job: &mut Job,
        handler: &Arc<dyn TaskHandler>,
        ledger: &mut BudgetLedger,
        adapter: &mut Arc<dyn Adapter>,
        opts: &StartOptions,
        deadline: Instant,
    ) -> Result<RunSuccess, Error> {
        let timeout = job.timeout();
        let id = job.id;
        match tokio::time::timeout_at(
            deadline,
            self.run_attempt(job, handler, ledger, adapter, opts),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(JobError::DeadlineExceeded { id, timeout }.into()),
        }
    }

    /// One full attempt: replay-first, then LLM fallback with a bounded
    /// crash-recovery loop.
    async fn run_attempt(
        &self,
        job: &mut Job,
        handler: &Arc<dyn TaskHandler>,
        ledger: &mut BudgetLedger,
        adapter: &mut Arc<dyn Adapter>,
        opts: &StartOptions,
    ) -> Result<RunSuccess, Error> {
        match self.engine.try_replay(job, adapter.as_ref()).await? {
            EngineOutcome::Completed { steps, .. } => {
                return Ok(RunSuccess::Cookbook { steps });
            }
            EngineOutcome::NoManual => {}
            EngineOutcome::ReplayFailed {
                manual_id, reason, ..
            } => {
                tracing::info!(
                    job_id = %job.id,
                    manual = %manual_id,
                    reason = %reason,
                    "Replay failed, falling back to LLM execution"
                );
            }
        }

        let trace = Arc::new(TraceRecorder::new());
        let mut recovery_attempts = 0u32;

        loop {
            // A restart redoes the whole task, so the trace restarts with it.
            trace.start();
            let ctx = HandlerContext::new(Arc::clone(adapter), job.clone(), Arc::clone(&trace));

            match self.drive(handler, &ctx, job, ledger, adapter.as_ref()).await {
                Ok(()) => {
                    trace.stop();
                    return Ok(RunSuccess::Llm {
                        trace: Arc::clone(&trace),
                    });
                }
                Err(e) => {
                    let kind = classify::classify_error(&e);
                    let crashed =
                        kind == FailureKind::BrowserCrashed || !adapter.is_connected().await;
                    if !crashed || recovery_attempts >= self.config.max_recovery_attempts {
                        return Err(e);
                    }

                    recovery_attempts += 1;
                    tracing::warn!(
                        job_id = %job.id,
                        attempt = recovery_attempts,
                        error = %e,
                        "Browser crashed, starting replacement session"
                    );

                    let session_state = adapter.get_browser_session().await;
                    if let Err(stop_err) = adapter.stop().await {
                        tracing::debug!(job_id = %job.id, error = %stop_err, "Stopping dead adapter");
                    }

                    let fresh = self.factory.create().await?;
                    let mut fresh_opts = opts.clone();
                    fresh_opts.session_state = session_state.or_else(|| opts.session_state.clone());
                    fresh.start(fresh_opts).await?;

                    // Installing the new adapter here means the next drive()
                    // subscribes to it before any event is pumped; nothing
                    // from the dead session can fire against the new one.
                    *adapter = fresh;
                }
            }
        }
    }

    /// Run the handler while pumping adapter events into the budget ledger
    /// and the blocker checks. Budget overages raise from here, which is
    /// what halts a runaway run mid-flight.
    async fn drive(
        &self,
        handler: &Arc<dyn TaskHandler>,
        ctx: &HandlerContext,
        job: &mut Job,
        ledger: &mut BudgetLedger,
        adapter: &dyn Adapter,
    ) -> Result<(), Error> {
        // Subscribe before the handler starts so no event is missed.
        let mut events = adapter.subscribe();
        let mut events_open = true;
        let mut consecutive_failures = 0u32;
        let mut last_blocker_check: Option<Instant> = None;

        let mut check_timer = tokio::time::interval_at(
            Instant::now() + self.config.blocker.check_interval,
            self.config.blocker.check_interval,
        );
        check_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        let handler_fut = handler.run(ctx);
        tokio::pin!(handler_fut);

        loop {
            tokio::select! {
                result = &mut handler_fut => {
                    // Account for everything the final actions emitted.
                    self.drain_events(&mut events, ledger)?;
                    return result;
                }

                event = events.recv(), if events_open => match event {
                    Ok(event) => {
                        self.apply_event(&event, ledger, &mut consecutive_failures)?;
                        if consecutive_failures >= self.config.blocker.failure_trigger {
                            self.checked_blocker_scan(
                                job, adapter, &mut last_blocker_check, &mut consecutive_failures,
                            ).await?;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        tracing::warn!(job_id = %job.id, missed, "Adapter event stream lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        events_open = false;
                    }
                },

                _ = check_timer.tick() => {
                    self.checked_blocker_scan(
                        job, adapter, &mut last_blocker_check, &mut consecutive_failures,
                    ).await?;
                }
            }
        }
    }

    fn apply_event(
        &self,
        event: &AdapterEvent,
        ledger: &mut BudgetLedger,
        consecutive_failures: &mut u32,
    ) -> Result<(), Error> {
        match event {
            AdapterEvent::ActionStarted { instruction } => {
                tracing::debug!(instruction = %instruction, "Action started");
                ledger.record_action()?;
            }
            AdapterEvent::TokensUsed(usage) => {
                ledger.record_token_usage(usage)?;
            }
            AdapterEvent::ActionDone { success, .. } => {
                if *success {
                    *consecutive_failures = 0;
                } else {
                    *consecutive_failures += 1;
                }
            }
            AdapterEvent::Thought(thought) => {
                tracing::debug!(thought = %thought, "Engine thought");
            }
        }
        Ok(())
    }

    fn drain_events(
        &self,
        events: &mut broadcast::Receiver<AdapterEvent>,
        ledger: &mut BudgetLedger,
    ) -> Result<(), Error> {
        let mut unused = 0u32;
        while let Ok(event) = events.try_recv() {
            self.apply_event(&event, ledger, &mut unused)?;
        }
        Ok(())
    }

    /// Run a blocker scan unless one ran within the floor interval; escalate
    /// when the scan confirms a blocker.
    async fn checked_blocker_scan(
        &self,
        job: &mut Job,
        adapter: &dyn Adapter,
        last_check: &mut Option<Instant>,
        consecutive_failures: &mut u32,
    ) -> Result<(), Error> {
        if let Some(at) = last_check
            && at.elapsed() < self.config.blocker.check_floor
        {
            return Ok(());
        }
        *last_check = Some(Instant::now());
        *consecutive_failures = 0;

        let detection = match self.detector.detect(adapter).await {
            Ok(detection) => detection,
            Err(e) => {
                // A failed scan is not itself fatal; the handler will hit the
                // underlying problem if there is one.
                tracing::warn!(job_id = %job.id, error = %e, "Blocker scan failed");
                return Ok(());
            }
        };

        match detection {
            Some(result) if self.detector.is_blocking(&result) => {
                self.run_escalation(job, &result, adapter).await
            }
            _ => Ok(()),
        }
    }

    /// Detect-and-escalate for the failure path. `true` means a blocker was
    /// confirmed and resolved; `false` means no blocker was found and the
    /// original error stands.
    async fn escalate_failure(&self, job: &mut Job, adapter: &dyn Adapter) -> Result<bool, Error> {
        match self.detector.detect(adapter).await {
            Ok(Some(result)) if self.detector.is_blocking(&result) => {
                self.run_escalation(job, &result, adapter).await?;
                Ok(true)
            }
            Ok(_) => Ok(false),
            Err(e) => {
                tracing::warn!(job_id = %job.id, error = %e, "Blocker scan failed on failure path");
                Ok(false)
            }
        }
    }

    async fn run_escalation(
        &self,
        job: &mut Job,
        blocker: &crate::blocker::BlockerResult,
        adapter: &dyn Adapter,
    ) -> Result<(), Error> {
        match self.hitl.escalate(job, blocker, adapter, &self.detector).await? {
            HitlOutcome::Resolved => Ok(()),
            HitlOutcome::StillBlocked { category, attempts } => {
                Err(HitlError::StillBlocked { category, attempts }.into())
            }
            HitlOutcome::Cancelled => Err(JobError::Cancelled { id: job.id }.into()),
        }
    }

    fn spawn_heartbeat(&self, job: &Job) -> Option<tokio::task::JoinHandle<()>> {
        let worker_id = job.worker_id.clone()?;
        let store = Arc::clone(&self.store);
        let id = job.id;
        let interval = self.config.heartbeat_interval;
        Some(tokio::spawn(async move {
            let mut timer = tokio::time::interval(interval);
            timer.tick().await;
            loop {
                timer.tick().await;
                if let Err(e) = store.heartbeat(id, &worker_id).await {
                    tracing::warn!(job_id = %id, error = %e, "Heartbeat write failed");
                }
            }
        }))
    }

    /// Persist a manual learned from a successful LLM-driven run. Learning
    /// failures never fail the job.
    async fn learn_manual(&self, job: &Job, trace: &TraceRecorder) {
        let Some(manual) = trace.to_manual(
            &job.target_url,
            &job.task_type,
            &job.platform(),
            &self.config.manual,
        ) else {
            return;
        };

        match self.manuals.insert_manual(&manual).await {
            Ok(()) => {
                tracing::info!(
                    job_id = %job.id,
                    manual = %manual.id,
                    steps = manual.steps.len(),
                    "Learned manual from trace"
                );
                self.append_event(JobEvent::new(
                    job.id,
                    "manual_learned",
                    serde_json::json!({
                        "manual_id": manual.id,
                        "steps": manual.steps.len(),
                    }),
                ));
            }
            Err(e) => {
                tracing::warn!(job_id = %job.id, error = %e, "Failed to store learned manual");
            }
        }
    }

    async fn finish_success(&self, job: &mut Job, result: JobResult) -> JobResult {
        if let Err(e) = job.transition_to(JobStatus::Completed) {
            tracing::warn!(job_id = %job.id, error = %e, "Completion transition rejected");
            return result;
        }
        self.persist_status(job.id, JobStatus::Completed).await;
        self.persist_result(job.id, &result).await;
        self.append_event(JobEvent::new(
            job.id,
            "completed",
            serde_json::json!({
                "final_mode": result.final_mode,
                "cookbook_steps": result.cookbook_steps,
            }),
        ));
        self.notifier
            .notify(CallbackEvent::Completed {
                job_id: job.id,
                result: result.clone(),
            })
            .await;
        tracing::info!(
            job_id = %job.id,
            mode = ?result.final_mode,
            cost = %result.cost.total_cost,
            "Job completed"
        );
        result
    }

    /// Classify, decide retry-or-fail, and always record the accrued cost.
    async fn finish_failure(
        &self,
        job: &mut Job,
        error: Error,
        cost: crate::budget::BudgetSnapshot,
    ) -> JobResult {
        if let Error::Job(JobError::Cancelled { .. }) = &error {
            return self.finish_cancelled(job, cost).await;
        }

        let kind = classify::classify_error(&error);
        let result = JobResult::failed(kind, error.to_string(), cost);

        if kind.is_retryable() && job.can_retry() && job.status == JobStatus::Running {
            let backoff = classify::backoff_delay(job.retry_count);
            job.retry_count += 1;
            let next_attempt_at =
                Utc::now() + chrono::Duration::from_std(backoff).unwrap_or_default();

            self.persist_result(job.id, &result).await;
            if let Err(e) = job.transition_to(JobStatus::Pending) {
                tracing::warn!(job_id = %job.id, error = %e, "Retry requeue transition rejected");
            }
            match self
                .store
                .requeue_for_retry(job.id, job.retry_count, next_attempt_at)
                .await
            {
                Ok(()) => {
                    self.append_event(JobEvent::new(
                        job.id,
                        "retry_scheduled",
                        serde_json::json!({
                            "kind": kind.as_str(),
                            "retry_count": job.retry_count,
                            "backoff_secs": backoff.as_secs(),
                        }),
                    ));
                    tracing::info!(
                        job_id = %job.id,
                        kind = kind.as_str(),
                        retry = job.retry_count,
                        backoff_secs = backoff.as_secs(),
                        "Job requeued for retry"
                    );
                }
                Err(e) => {
                    tracing::error!(job_id = %job.id, error = %e, "Failed to requeue job");
                }
            }
            return result;
        }

        if let Err(e) = job.transition_to(JobStatus::Failed) {
            tracing::warn!(job_id = %job.id, error = %e, "Failure transition rejected");
        } else {
            self.persist_status(job.id, JobStatus::Failed).await;
        }
        self.persist_result(job.id, &result).await;
        self.append_event(JobEvent::new(
            job.id,
            "failed",
            serde_json::json!({ "kind": kind.as_str(), "message": result.message }),
        ));
        self.notifier
            .notify(CallbackEvent::Failed {
                job_id: job.id,
                result: result.clone(),
            })
            .await;
        tracing::warn!(
            job_id = %job.id,
            kind = kind.as_str(),
            cost = %result.cost.total_cost,
            "Job failed permanently"
        );
        result
    }

    async fn finish_cancelled(
        &self,
        job: &mut Job,
        cost: crate::budget::BudgetSnapshot,
    ) -> JobResult {
        let mut result = JobResult::failed(
            FailureKind::InternalError,
            "Job cancelled by user",
            cost,
        );
        result.failure_kind = None;
        // The cancelling actor already set the status; only the result and
        // the audit record are ours to write.
        if job.status.can_transition_to(JobStatus::Cancelled) {
            let _ = job.transition_to(JobStatus::Cancelled);
        }
        self.persist_result(job.id, &result).await;
        self.append_event(JobEvent::new(job.id, "cancelled", serde_json::Value::Null));
        tracing::info!(job_id = %job.id, "Job cancelled while in flight");
        result
    }

    async fn persist_status(&self, id: uuid::Uuid, status: JobStatus) {
        if let Err(e) = self.store.update_status(id, status).await {
            tracing::error!(job_id = %id, error = %e, "Failed to persist job status");
        }
    }

    async fn persist_result(&self, id: uuid::Uuid, result: &JobResult) {
        if let Err(e) = self.store.save_result(id, result).await {
            tracing::error!(job_id = %id, error = %e, "Failed to persist job result");
        }
    }

    fn append_event(&self, event: JobEvent) {
        let store = Arc::clone(&self.store);
        tokio::spawn(async move {
            if let Err(e) = store.append_event(&event).await {
                tracing::warn!(error = %e, "Failed to append job event");
            }
        });
    }
}
