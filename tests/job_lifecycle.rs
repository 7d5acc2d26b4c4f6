//! End-to-end lifecycle tests against a file-backed store: claim a job,
//! run it through the executor, and verify the learn-then-replay loop and
//! the retry requeue path.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::broadcast;

use formpilot::adapter::{
    ActResult, Adapter, AdapterEvent, AdapterFactory, ObservedElement, PauseGate, StartOptions,
};
use formpilot::config::OrchestratorConfig;
use formpilot::error::{AdapterError, FailureKind};
use formpilot::executor::JobExecutor;
use formpilot::handlers::{FormApplicationHandler, HandlerRegistry};
use formpilot::job::{ExecutionMode, Job, JobStatus};
use formpilot::notify::{CallbackNotifier, NullNotifier};
use formpilot::signal::LocalResumeBus;
use formpilot::store::{JobStore, LibSqlBackend, ManualStore};

/// Adapter that succeeds at everything unless scripted otherwise.
struct ScriptedAdapter {
    active: AtomicBool,
    connected: AtomicBool,
    gate: PauseGate,
    events: broadcast::Sender<AdapterEvent>,
    performed: Mutex<Vec<String>>,
    extractions: Mutex<VecDeque<serde_json::Value>>,
    act_failures: Mutex<VecDeque<String>>,
}

impl ScriptedAdapter {
    fn new() -> Arc<Self> {
        let (events, _) = broadcast::channel(64);
        Arc::new(Self {
            active: AtomicBool::new(false),
            connected: AtomicBool::new(true),
            gate: PauseGate::new(),
            events,
            performed: Mutex::new(Vec::new()),
            extractions: Mutex::new(VecDeque::new()),
            act_failures: Mutex::new(VecDeque::new()),
        })
    }

    fn push_extract(&self, value: serde_json::Value) {
        self.extractions.lock().unwrap().push_back(value);
    }

    fn fail_next_act(&self, reason: &str) {
        self.act_failures
            .lock()
            .unwrap()
            .push_back(reason.to_string());
    }

    fn performed(&self) -> Vec<String> {
        self.performed.lock().unwrap().clone()
    }
}

#[async_trait]
impl Adapter for ScriptedAdapter {
    async fn start(&self, _opts: StartOptions) -> Result<(), AdapterError> {
        self.active.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn stop(&self) -> Result<(), AdapterError> {
        self.active.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    async fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn act(
        &self,
        instruction: &str,
        _ctx: Option<serde_json::Value>,
    ) -> Result<ActResult, AdapterError> {
        self.gate.wait_if_paused().await;
        let _ = self.events.send(AdapterEvent::ActionStarted {
            instruction: instruction.to_string(),
        });

        if let Some(reason) = self.act_failures.lock().unwrap().pop_front() {
            let _ = self.events.send(AdapterEvent::ActionDone {
                instruction: instruction.to_string(),
                success: false,
                duration_ms: 5,
            });
            return Err(AdapterError::ActionFailed { reason });
        }

        self.performed
            .lock()
            .unwrap()
            .push(format!("act:{instruction}"));
        let _ = self.events.send(AdapterEvent::ActionDone {
            instruction: instruction.to_string(),
            success: true,
            duration_ms: 5,
        });
        Ok(ActResult {
            success: true,
            message: "ok".to_string(),
            duration_ms: 5,
        })
    }

    async fn extract(
        &self,
        _instruction: &str,
        _schema: &serde_json::Value,
    ) -> Result<serde_json::Value, AdapterError> {
        Ok(self
            .extractions
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(serde_json::Value::Null))
    }

    async fn observe(&self, _instruction: &str) -> Result<Vec<ObservedElement>, AdapterError> {
        Ok(Vec::new())
    }

    async fn navigate(&self, url: &str) -> Result<(), AdapterError> {
        self.performed
            .lock()
            .unwrap()
            .push(format!("navigate:{url}"));
        Ok(())
    }

    async fn screenshot(&self) -> Result<Vec<u8>, AdapterError> {
        Ok(vec![0, 1, 2, 3])
    }

    fn pause(&self) {
        self.gate.pause();
    }

    fn resume(&self, _ctx: Option<serde_json::Value>) {
        self.gate.resume();
    }

    fn is_paused(&self) -> bool {
        self.gate.is_paused()
    }

    async fn get_browser_session(&self) -> Option<String> {
        None
    }

    fn subscribe(&self) -> broadcast::Receiver<AdapterEvent> {
        self.events.subscribe()
    }
}

struct ScriptedFactory {
    adapters: Mutex<VecDeque<Arc<ScriptedAdapter>>>,
}

impl ScriptedFactory {
    fn with_adapters(adapters: Vec<Arc<ScriptedAdapter>>) -> Self {
        Self {
            adapters: Mutex::new(adapters.into()),
        }
    }
}

#[async_trait]
impl AdapterFactory for ScriptedFactory {
    async fn create(&self) -> Result<Arc<dyn Adapter>, AdapterError> {
        let adapter = self
            .adapters
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(ScriptedAdapter::new);
        Ok(adapter as Arc<dyn Adapter>)
    }
}

fn form_schema() -> serde_json::Value {
    serde_json::json!({
        "fields": [
            { "selector": "input[name=name]", "field": "name", "kind": "text", "required": true },
            { "selector": "input[name=email]", "field": "email", "kind": "text", "required": true }
        ],
        "submit_selector": "button[type=submit]"
    })
}

fn application_job(url: &str) -> Job {
    Job::new(
        url,
        "form_application",
        serde_json::json!({"name": "Ada Lovelace", "email": "ada@example.com"}),
        "user-1",
    )
}

async fn executor_with(
    store: &Arc<LibSqlBackend>,
    adapters: Vec<Arc<ScriptedAdapter>>,
) -> JobExecutor {
    let handlers = Arc::new(HandlerRegistry::new());
    handlers.register(Arc::new(FormApplicationHandler::new()));
    let notifier: Arc<dyn CallbackNotifier> = Arc::new(NullNotifier);
    JobExecutor::new(
        Arc::clone(store) as Arc<dyn JobStore>,
        Arc::clone(store) as Arc<dyn ManualStore>,
        Arc::new(ScriptedFactory::with_adapters(adapters)),
        handlers,
        notifier,
        Arc::new(LocalResumeBus::new()),
        OrchestratorConfig::default(),
    )
}

#[tokio::test]
async fn first_run_learns_a_manual_and_second_run_replays_it() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("formpilot.db");
    let store = Arc::new(
        LibSqlBackend::new_local(db_path.to_str().unwrap())
            .await
            .unwrap(),
    );

    // First job: no cached manual, the model-driven path fills the form.
    let llm_adapter = ScriptedAdapter::new();
    llm_adapter.push_extract(form_schema());
    let executor = executor_with(&store, vec![Arc::clone(&llm_adapter)]).await;

    let job_a = application_job("https://boards.greenhouse.io/acme/jobs/4021");
    store.insert_job(&job_a).await.unwrap();
    let claimed = store.claim_next_pending("it-worker").await.unwrap().unwrap();
    assert_eq!(claimed.id, job_a.id);

    let result_a = executor.execute(claimed).await;
    assert_eq!(result_a.final_mode, Some(ExecutionMode::Llm));
    assert_eq!(result_a.failure_kind, None);
    assert_eq!(
        store.get_status(job_a.id).await.unwrap(),
        Some(JobStatus::Completed)
    );

    // The run left a manual behind for the whole jobs/* pattern.
    let config = OrchestratorConfig::default();
    let candidates = store
        .find_candidates(
            "https://boards.greenhouse.io/acme/jobs/999",
            "form_application",
            "greenhouse.io",
            &config.manual,
        )
        .await
        .unwrap();
    assert_eq!(candidates.len(), 1);
    let learned = &candidates[0];
    assert!(learned.steps.len() >= 3, "navigate, fills, and submit");

    // Second job on the same platform: replayed from the manual, no
    // extraction needed at all.
    let replay_adapter = ScriptedAdapter::new();
    let executor = executor_with(&store, vec![Arc::clone(&replay_adapter)]).await;

    let job_b = application_job("https://boards.greenhouse.io/acme/jobs/999");
    store.insert_job(&job_b).await.unwrap();
    let claimed = store.claim_next_pending("it-worker").await.unwrap().unwrap();

    let result_b = executor.execute(claimed).await;
    assert_eq!(result_b.final_mode, Some(ExecutionMode::Cookbook));
    assert_eq!(result_b.cookbook_steps, Some(learned.steps.len() as u32));
    assert_eq!(
        store.get_status(job_b.id).await.unwrap(),
        Some(JobStatus::Completed)
    );

    // Replay reinforced the manual's health.
    let reinforced = store.get_manual(learned.id).await.unwrap().unwrap();
    assert!(reinforced.health_score > learned.health_score);
    assert_eq!(reinforced.success_count, 1);

    // The replay adapter navigated first and never consumed a form schema.
    let performed = replay_adapter.performed();
    assert!(performed[0].starts_with("navigate:"));
}

#[tokio::test]
async fn retryable_failure_requeues_with_backoff() {
    let store = Arc::new(LibSqlBackend::new_memory().await.unwrap());

    let adapter = ScriptedAdapter::new();
    adapter.push_extract(form_schema());
    adapter.fail_next_act("connection reset by peer");
    let executor = executor_with(&store, vec![adapter]).await;

    let job = application_job("https://boards.greenhouse.io/acme/jobs/77");
    store.insert_job(&job).await.unwrap();
    let claimed = store.claim_next_pending("it-worker").await.unwrap().unwrap();

    let result = executor.execute(claimed).await;
    assert_eq!(result.failure_kind, Some(FailureKind::NetworkError));

    // Back in the queue with the retry counted and the claim released.
    let requeued = store.get_job(job.id).await.unwrap().unwrap();
    assert_eq!(requeued.status, JobStatus::Pending);
    assert_eq!(requeued.retry_count, 1);
    assert!(requeued.worker_id.is_none());

    // The backoff keeps it unclaimable for now.
    assert!(store.claim_next_pending("it-worker").await.unwrap().is_none());
}
