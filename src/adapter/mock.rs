//! Scripted adapter for unit tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::adapter::{
    ActResult, Adapter, AdapterEvent, AdapterFactory, ObservedElement, PauseGate, StartOptions,
};
use crate::budget::TokenUsage;
use crate::error::AdapterError;

/// One scripted response to an `act` call.
#[derive(Debug, Clone)]
pub enum ScriptedAct {
    Ok(String),
    Fail(String),
    /// Simulates a browser crash: the call errors with `Disconnected` and the
    /// adapter reports `is_connected() == false` afterwards.
    Crash,
}

pub struct MockAdapter {
    started: AtomicBool,
    connected: AtomicBool,
    gate: PauseGate,
    events: broadcast::Sender<AdapterEvent>,
    acts: Mutex<VecDeque<ScriptedAct>>,
    observations: Mutex<Vec<ObservedElement>>,
    extracts: Mutex<VecDeque<serde_json::Value>>,
    performed: Mutex<Vec<String>>,
    usage_per_act: Mutex<Option<TokenUsage>>,
    start_count: Mutex<u32>,
    start_options: Mutex<Vec<StartOptions>>,
}

impl MockAdapter {
    pub fn new() -> Arc<Self> {
        let (events, _) = broadcast::channel(256);
        Arc::new(Self {
            started: AtomicBool::new(false),
            connected: AtomicBool::new(true),
            gate: PauseGate::new(),
            events,
            acts: Mutex::new(VecDeque::new()),
            observations: Mutex::new(Vec::new()),
            extracts: Mutex::new(VecDeque::new()),
            performed: Mutex::new(Vec::new()),
            usage_per_act: Mutex::new(None),
            start_count: Mutex::new(0),
            start_options: Mutex::new(Vec::new()),
        })
    }

    pub fn push_act(&self, act: ScriptedAct) {
        self.acts.lock().unwrap().push_back(act);
    }

    pub fn set_observations(&self, elements: Vec<ObservedElement>) {
        *self.observations.lock().unwrap() = elements;
    }

    pub fn push_extract(&self, value: serde_json::Value) {
        self.extracts.lock().unwrap().push_back(value);
    }

    /// Usage emitted as a `TokensUsed` event after every successful act.
    pub fn set_usage_per_act(&self, usage: TokenUsage) {
        *self.usage_per_act.lock().unwrap() = Some(usage);
    }

    /// Instructions executed so far, in order.
    pub fn performed(&self) -> Vec<String> {
        self.performed.lock().unwrap().clone()
    }

    pub fn start_count(&self) -> u32 {
        *self.start_count.lock().unwrap()
    }

    /// Options passed to each `start` call, in order.
    pub fn start_options(&self) -> Vec<StartOptions> {
        self.start_options.lock().unwrap().clone()
    }

    fn emit(&self, event: AdapterEvent) {
        let _ = self.events.send(event);
    }
}

#[async_trait]
impl Adapter for MockAdapter {
    async fn start(&self, opts: StartOptions) -> Result<(), AdapterError> {
        self.started.store(true, Ordering::SeqCst);
        self.connected.store(true, Ordering::SeqCst);
        *self.start_count.lock().unwrap() += 1;
        self.start_options.lock().unwrap().push(opts);
        Ok(())
    }

    async fn stop(&self) -> Result<(), AdapterError> {
        self.started.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn is_active(&self) -> bool {
        self.started.load(Ordering::SeqCst)
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

        self.emit(AdapterEvent::ActionStarted {
            instruction: instruction.to_string(),
        });
        self.performed.lock().unwrap().push(instruction.to_string());

        let scripted = self
            .acts
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(ScriptedAct::Ok("ok".to_string()));

        match scripted {
            ScriptedAct::Ok(message) => {
                if let Some(usage) = self.usage_per_act.lock().unwrap().clone() {
                    self.emit(AdapterEvent::TokensUsed(usage));
                }
                self.emit(AdapterEvent::ActionDone {
                    instruction: instruction.to_string(),
                    success: true,
                    duration_ms: 5,
                });
                Ok(ActResult {
                    success: true,
                    message,
                    duration_ms: 5,
                })
            }
            ScriptedAct::Fail(reason) => {
                self.emit(AdapterEvent::ActionDone {
                    instruction: instruction.to_string(),
                    success: false,
                    duration_ms: 5,
                });
                Err(AdapterError::ActionFailed { reason })
            }
            ScriptedAct::Crash => {
                self.connected.store(false, Ordering::SeqCst);
                Err(AdapterError::Disconnected("Target closed".to_string()))
            }
        }
    }

    async fn extract(
        &self,
        _instruction: &str,
        _schema: &serde_json::Value,
    ) -> Result<serde_json::Value, AdapterError> {
        self.gate.wait_if_paused().await;
        Ok(self
            .extracts
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(serde_json::Value::Null))
    }

    async fn observe(&self, _instruction: &str) -> Result<Vec<ObservedElement>, AdapterError> {
        Ok(self.observations.lock().unwrap().clone())
    }

    async fn navigate(&self, url: &str) -> Result<(), AdapterError> {
        self.gate.wait_if_paused().await;
        self.performed
            .lock()
            .unwrap()
            .push(format!("navigate:{url}"));
        Ok(())
    }

    async fn screenshot(&self) -> Result<Vec<u8>, AdapterError> {
        Ok(vec![0x89, 0x50, 0x4e, 0x47])
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
        Some("{\"cookies\":[]}".to_string())
    }

    fn subscribe(&self) -> broadcast::Receiver<AdapterEvent> {
        self.events.subscribe()
    }
}

/// Factory handing out pre-built mock adapters in order; creates fresh
/// default ones when the queue is empty.
pub struct MockAdapterFactory {
    queue: Mutex<VecDeque<Arc<MockAdapter>>>,
    pub created: Mutex<Vec<Arc<MockAdapter>>>,
}

impl MockAdapterFactory {
    pub fn new() -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            created: Mutex::new(Vec::new()),
        }
    }

    pub fn with_adapters(adapters: Vec<Arc<MockAdapter>>) -> Self {
        Self {
            queue: Mutex::new(adapters.into()),
            created: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl AdapterFactory for MockAdapterFactory {
    async fn create(&self) -> Result<Arc<dyn Adapter>, AdapterError> {
        let adapter = self
            .queue
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(MockAdapter::new);
        self.created.lock().unwrap().push(Arc::clone(&adapter));
        Ok(adapter)
    }
}
