//! Abstraction over the concrete browser-driving/LLM-action engine.
//!
//! The orchestrator never talks to a browser or an LLM directly; it drives a
//! single [`Adapter`] per job. Events flow back over a broadcast channel so
//! the executor can feed the budget ledger and progress reporting without the
//! adapter knowing about either.

pub mod http;
#[cfg(test)]
pub mod mock;

use async_trait::async_trait;
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, watch};

use crate::budget::TokenUsage;
use crate::config::BrowserEngine;
use crate::error::AdapterError;

/// Options for starting a browser session.
#[derive(Debug, Clone)]
pub struct StartOptions {
    pub url: String,
    pub engine: BrowserEngine,
    /// Site credentials, if the user has stored any. Read-only input.
    pub credentials: Option<SecretString>,
    /// Serialized browser state from a previous session (cookies etc.).
    pub session_state: Option<String>,
}

/// Outcome of one `act` call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActResult {
    pub success: bool,
    pub message: String,
    pub duration_ms: u64,
}

/// An element the adapter observed on the current page.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservedElement {
    pub selector: String,
    pub description: String,
    #[serde(default)]
    pub text: Option<String>,
}

/// Events emitted by an adapter while executing.
#[derive(Debug, Clone)]
pub enum AdapterEvent {
    ActionStarted { instruction: String },
    ActionDone { instruction: String, success: bool, duration_ms: u64 },
    TokensUsed(TokenUsage),
    Thought(String),
}

/// One browser session driven by the engine.
///
/// Exactly one adapter is live per job, except during the brief
/// crash-recovery swap window.
#[async_trait]
pub trait Adapter: Send + Sync {
    /// Start the browser session.
    async fn start(&self, opts: StartOptions) -> Result<(), AdapterError>;

    /// Stop the session. Safe to call on an already-stopped adapter.
    async fn stop(&self) -> Result<(), AdapterError>;

    /// Whether `start` has succeeded and `stop` has not been called.
    fn is_active(&self) -> bool;

    /// Whether the underlying browser connection is still alive.
    async fn is_connected(&self) -> bool;

    /// Perform one natural-language action against the page.
    async fn act(&self, instruction: &str, ctx: Option<serde_json::Value>)
    -> Result<ActResult, AdapterError>;

    /// Extract structured data from the page according to a JSON schema.
    async fn extract(
        &self,
        instruction: &str,
        schema: &serde_json::Value,
    ) -> Result<serde_json::Value, AdapterError>;

    /// Observe elements matching an instruction without acting.
    async fn observe(&self, instruction: &str) -> Result<Vec<ObservedElement>, AdapterError>;

    async fn navigate(&self, url: &str) -> Result<(), AdapterError>;

    async fn screenshot(&self) -> Result<Vec<u8>, AdapterError>;

    /// Set the cooperative pause gate. In-flight actions run to completion;
    /// the next checkpoint blocks.
    fn pause(&self);

    /// Reopen the gate, optionally carrying resolution context.
    fn resume(&self, ctx: Option<serde_json::Value>);

    fn is_paused(&self) -> bool;

    /// Serialized browser state for crash recovery, if available.
    async fn get_browser_session(&self) -> Option<String>;

    /// Subscribe to this adapter instance's event stream.
    ///
    /// Each call returns a fresh receiver; crash recovery subscribes to the
    /// new adapter before pumping any further events, so stale handlers never
    /// fire against the new session.
    fn subscribe(&self) -> broadcast::Receiver<AdapterEvent>;
}

/// Creates adapters, once per job plus once per crash recovery.
#[async_trait]
pub trait AdapterFactory: Send + Sync {
    async fn create(&self) -> Result<std::sync::Arc<dyn Adapter>, AdapterError>;
}

/// Cooperative pause gate shared by all of an adapter's checkpoints.
///
/// `pause` closes the gate; `resume` reopens it. Both are idempotent:
/// double-pause and double-resume are no-ops. Waiters block on the watch
/// channel rather than spinning.
#[derive(Debug)]
pub struct PauseGate {
    tx: watch::Sender<bool>,
}

impl PauseGate {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx }
    }

    pub fn pause(&self) {
        let _ = self.tx.send(true);
    }

    pub fn resume(&self) {
        let _ = self.tx.send(false);
    }

    pub fn is_paused(&self) -> bool {
        *self.tx.borrow()
    }

    /// Block until the gate is open. Returns immediately when not paused.
    pub async fn wait_if_paused(&self) {
        let mut rx = self.tx.subscribe();
        while *rx.borrow_and_update() {
            if rx.changed().await.is_err() {
                break;
            }
        }
    }
}

impl Default for PauseGate {
    fn default() -> Self {
        Self::new()
    }
}
