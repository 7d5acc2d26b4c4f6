//! Lifecycle callbacks to the external collaborator.
//!
//! All notifications are fire-and-forget: delivery failures are logged and
//! never fatal to the job.

use async_trait::async_trait;
use serde::Serialize;
use uuid::Uuid;

use crate::job::JobResult;

/// A lifecycle notification carrying cost/result summaries.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum CallbackEvent {
    JobStarted {
        job_id: Uuid,
        user_id: String,
    },
    JobRunning {
        job_id: Uuid,
    },
    HumanNeeded {
        job_id: Uuid,
        blocker: String,
        screenshot_ref: Option<String>,
        resolution_timeout_secs: u64,
    },
    Resumed {
        job_id: Uuid,
    },
    Completed {
        job_id: Uuid,
        result: JobResult,
    },
    Failed {
        job_id: Uuid,
        result: JobResult,
    },
}

/// External callback collaborator.
#[async_trait]
pub trait CallbackNotifier: Send + Sync {
    /// Deliver one notification. Implementations swallow and log failures.
    async fn notify(&self, event: CallbackEvent);
}

/// Notifier that drops everything. Default when no callback URL is set.
pub struct NullNotifier;

#[async_trait]
impl CallbackNotifier for NullNotifier {
    async fn notify(&self, _event: CallbackEvent) {}
}

/// Posts each event as JSON to a webhook URL.
pub struct WebhookNotifier {
    client: reqwest::Client,
    url: String,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.into(),
        }
    }
}

#[async_trait]
impl CallbackNotifier for WebhookNotifier {
    async fn notify(&self, event: CallbackEvent) {
        let result = self.client.post(&self.url).json(&event).send().await;
        match result {
            Ok(resp) if !resp.status().is_success() => {
                tracing::warn!(status = %resp.status(), "Callback webhook rejected event");
            }
            Err(e) => {
                tracing::warn!(error = %e, "Callback webhook delivery failed");
            }
            _ => {}
        }
    }
}

#[cfg(test)]
pub mod recording {
    //! Test notifier that records delivered events.

    use std::sync::Mutex;

    use super::*;

    #[derive(Default)]
    pub struct RecordingNotifier {
        pub events: Mutex<Vec<CallbackEvent>>,
    }

    impl RecordingNotifier {
        pub fn event_names(&self) -> Vec<String> {
            self.events
                .lock()
                .unwrap()
                .iter()
                .map(|e| {
                    serde_json::to_value(e)
                        .ok()
                        .and_then(|v| v.get("event").and_then(|t| t.as_str().map(String::from)))
                        .unwrap_or_default()
                })
                .collect()
        }
    }

    #[async_trait]
    impl CallbackNotifier for RecordingNotifier {
        async fn notify(&self, event: CallbackEvent) {
            self.events.lock().unwrap().push(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_serialize_with_snake_case_tags() {
        let event = CallbackEvent::HumanNeeded {
            job_id: Uuid::new_v4(),
            blocker: "captcha".to_string(),
            screenshot_ref: None,
            resolution_timeout_secs: 900,
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["event"], "human_needed");
        assert_eq!(value["blocker"], "captcha");
    }
}
