//! HTTP bridge adapter.
//!
//! Talks to a browser-driving sidecar (the actual LLM-action engine) over a
//! small JSON API: `POST /session`, `POST /act`, `POST /extract`,
//! `POST /observe`, `POST /navigate`, `GET /screenshot`, `DELETE /session`.
//! Token usage reported by the sidecar per call is re-emitted as
//! [`AdapterEvent::TokensUsed`] so the executor's ledger sees it.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use secrecy::ExposeSecret;
use serde::Deserialize;
use tokio::sync::broadcast;

use crate::adapter::{
    ActResult, Adapter, AdapterEvent, ObservedElement, PauseGate, StartOptions,
};
use crate::budget::TokenUsage;
use crate::error::AdapterError;

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Adapter that drives a browser through an HTTP sidecar.
pub struct HttpAdapter {
    client: reqwest::Client,
    base_url: String,
    active: AtomicBool,
    gate: Arc<PauseGate>,
    events: broadcast::Sender<AdapterEvent>,
}

#[derive(Debug, Deserialize)]
struct ActResponse {
    success: bool,
    #[serde(default)]
    message: String,
    #[serde(default)]
    duration_ms: u64,
    #[serde(default)]
    usage: Option<UsageBody>,
}

#[derive(Debug, Deserialize)]
struct UsageBody {
    input_tokens: u64,
    output_tokens: u64,
    cost: String,
}

impl UsageBody {
    fn into_usage(self) -> TokenUsage {
        TokenUsage {
            input_tokens: self.input_tokens,
            output_tokens: self.output_tokens,
            cost: self.cost.parse().unwrap_or_default(),
        }
    }
}

impl HttpAdapter {
    pub fn new(base_url: impl Into<String>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
            active: AtomicBool::new(false),
            gate: Arc::new(PauseGate::new()),
            events,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url.trim_end_matches('/'))
    }

    fn emit(&self, event: AdapterEvent) {
        // No subscribers is fine; events are best-effort fan-out.
        let _ = self.events.send(event);
    }

    async fn post_json(
        &self,
        path: &str,
        body: serde_json::Value,
    ) -> Result<reqwest::Response, AdapterError> {
        let resp = self
            .client
            .post(self.url(path))
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_connect() {
                    AdapterError::Disconnected(e.to_string())
                } else {
                    AdapterError::Protocol(e.to_string())
                }
            })?;

        if !resp.status().is_success() {
            return Err(AdapterError::Protocol(format!(
                "sidecar returned {} for {path}",
                resp.status()
            )));
        }
        Ok(resp)
    }
}

#[async_trait]
impl Adapter for HttpAdapter {
    async fn start(&self, opts: StartOptions) -> Result<(), AdapterError> {
        let mut body = serde_json::json!({
            "url": opts.url,
            "engine": opts.engine.as_str(),
        });
        if let Some(state) = &opts.session_state {
            body["session_state"] = serde_json::Value::String(state.clone());
        }
        if let Some(creds) = &opts.credentials {
            // Forwarded to the sidecar, never logged here.
            body["credentials"] = serde_json::Value::String(creds.expose_secret().to_string());
        }

        self.post_json("/session", body)
            .await
            .map_err(|e| AdapterError::StartFailed(e.to_string()))?;
        self.active.store(true, Ordering::SeqCst);
        tracing::debug!(engine = opts.engine.as_str(), "Browser session started");
        Ok(())
    }

    async fn stop(&self) -> Result<(), AdapterError> {
        if !self.active.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        let _ = self
            .client
            .delete(self.url("/session"))
            .send()
            .await
            .map_err(|e| AdapterError::Protocol(e.to_string()))?;
        Ok(())
    }

    fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    async fn is_connected(&self) -> bool {
        if !self.is_active() {
            return false;
        }
        match self.client.get(self.url("/session")).send().await {
            Ok(resp) => resp.status().is_success(),
            Err(_) => false,
        }
    }

    async fn act(
        &self,
        instruction: &str,
        ctx: Option<serde_json::Value>,
    ) -> Result<ActResult, AdapterError> {
        self.gate.wait_if_paused().await;

        self.emit(AdapterEvent::ActionStarted {
            instruction: instruction.to_string(),
        });

        let body = serde_json::json!({
            "instruction": instruction,
            "context": ctx,
        });
        let resp: ActResponse = self
            .post_json("/act", body)
            .await?
            .json()
            .await
            .map_err(|e| AdapterError::Protocol(e.to_string()))?;

        if let Some(usage) = resp.usage {
            self.emit(AdapterEvent::TokensUsed(usage.into_usage()));
        }
        self.emit(AdapterEvent::ActionDone {
            instruction: instruction.to_string(),
            success: resp.success,
            duration_ms: resp.duration_ms,
        });

        Ok(ActResult {
            success: resp.success,
            message: resp.message,
            duration_ms: resp.duration_ms,
        })
    }

    async fn extract(
        &self,
        instruction: &str,
        schema: &serde_json::Value,
    ) -> Result<serde_json::Value, AdapterError> {
        self.gate.wait_if_paused().await;
        let body = serde_json::json!({
            "instruction": instruction,
            "schema": schema,
        });
        let resp = self.post_json("/extract", body).await?;
        let mut value: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| AdapterError::ExtractFailed(e.to_string()))?;
        if let Some(usage) = value
            .get("usage")
            .cloned()
            .and_then(|u| serde_json::from_value::<UsageBody>(u).ok())
        {
            self.emit(AdapterEvent::TokensUsed(usage.into_usage()));
        }
        Ok(value
            .get_mut("data")
            .map(serde_json::Value::take)
            .unwrap_or(value))
    }

    async fn observe(&self, instruction: &str) -> Result<Vec<ObservedElement>, AdapterError> {
        self.gate.wait_if_paused().await;
        let body = serde_json::json!({ "instruction": instruction });
        let resp = self.post_json("/observe", body).await?;
        let value: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| AdapterError::Protocol(e.to_string()))?;
        let elements = value.get("elements").cloned().unwrap_or(value);
        serde_json::from_value(elements).map_err(AdapterError::Json)
    }

    async fn navigate(&self, url: &str) -> Result<(), AdapterError> {
        self.gate.wait_if_paused().await;
        self.post_json("/navigate", serde_json::json!({ "url": url }))
            .await
            .map_err(|e| AdapterError::NavigationFailed {
                url: url.to_string(),
                reason: e.to_string(),
            })?;
        Ok(())
    }

    async fn screenshot(&self) -> Result<Vec<u8>, AdapterError> {
        let resp = self
            .client
            .get(self.url("/screenshot"))
            .send()
            .await
            .map_err(|e| AdapterError::ScreenshotFailed(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(AdapterError::ScreenshotFailed(format!(
                "sidecar returned {}",
                resp.status()
            )));
        }
        let bytes = resp
            .bytes()
            .await
            .map_err(|e| AdapterError::ScreenshotFailed(e.to_string()))?;
        Ok(bytes.to_vec())
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
        let resp = self
            .client
            .get(self.url("/session/state"))
            .send()
            .await
            .ok()?;
        if !resp.status().is_success() {
            return None;
        }
        resp.text().await.ok()
    }

    fn subscribe(&self) -> broadcast::Receiver<AdapterEvent> {
        self.events.subscribe()
    }
}

/// Factory producing [`HttpAdapter`]s against a fixed sidecar URL.
pub struct HttpAdapterFactory {
    pub base_url: String,
}

#[async_trait]
impl crate::adapter::AdapterFactory for HttpAdapterFactory {
    async fn create(&self) -> Result<Arc<dyn Adapter>, AdapterError> {
        Ok(Arc::new(HttpAdapter::new(self.base_url.clone())))
    }
}
