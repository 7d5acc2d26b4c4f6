//! Human-in-the-loop escalation: pause, hand off, resume, verify.
//!
//! When a blocker is confirmed the job pauses in place with the browser
//! session kept alive, and a human is asked to resolve it. The
//! resolution payload may carry secrets (a 2FA code, credentials), so it
//! is read destructively: [`JobStore::take_resolution`] deletes the row in
//! the same operation that returns it, and nothing here ever logs it.

use std::sync::Arc;

use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use tokio::time::Instant;

use crate::adapter::Adapter;
use crate::blocker::{BlockerDetector, BlockerResult};
use crate::config::HitlConfig;
use crate::error::{Error, HitlError};
use crate::job::{Job, JobStatus};
use crate::notify::{CallbackEvent, CallbackNotifier};
use crate::signal::ResumeSignal;
use crate::store::{JobEvent, JobInteraction, JobStore};

/// What the human did about the blocker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionType {
    /// Human solved it directly in the live session (e.g. clicked the
    /// captcha); nothing to inject.
    Manual,
    /// A one-time code to enter into the blocking prompt.
    CodeEntry,
    /// Credentials to complete a login wall.
    Credentials,
    /// Proceed without resolving; the next verification decides.
    Skip,
}

impl ResolutionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Manual => "manual",
            Self::CodeEntry => "code_entry",
            Self::Credentials => "credentials",
            Self::Skip => "skip",
        }
    }
}

impl std::str::FromStr for ResolutionType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "manual" => Ok(Self::Manual),
            "code_entry" => Ok(Self::CodeEntry),
            "credentials" => Ok(Self::Credentials),
            "skip" => Ok(Self::Skip),
            other => Err(format!("unknown resolution type '{other}'")),
        }
    }
}

/// A human's answer to a paused job.
///
/// `data` is secret-bearing: `Debug` redacts it and there is deliberately no
/// `Serialize` impl, so it cannot end up in an event payload or a log line.
#[derive(Debug, Clone)]
pub struct ResolutionContext {
    pub resolution_type: ResolutionType,
    pub data: Option<SecretString>,
}

impl ResolutionContext {
    pub fn manual() -> Self {
        Self {
            resolution_type: ResolutionType::Manual,
            data: None,
        }
    }

    pub fn skip() -> Self {
        Self {
            resolution_type: ResolutionType::Skip,
            data: None,
        }
    }

    pub fn code(code: impl Into<String>) -> Self {
        Self {
            resolution_type: ResolutionType::CodeEntry,
            data: Some(SecretString::from(code.into())),
        }
    }

    pub fn credentials(payload: impl Into<String>) -> Self {
        Self {
            resolution_type: ResolutionType::Credentials,
            data: Some(SecretString::from(payload.into())),
        }
    }
}

/// Outcome of one escalation, covering all verification rounds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HitlOutcome {
    /// The page is workable again.
    Resolved,
    /// Still blocked after every allowed resume attempt.
    StillBlocked { category: String, attempts: u32 },
    /// The job was cancelled while paused.
    Cancelled,
}

/// Runs the pause → resolve → resume → verify protocol for one blocker.
pub struct HitlCoordinator {
    store: Arc<dyn JobStore>,
    notifier: Arc<dyn CallbackNotifier>,
    signals: Arc<dyn ResumeSignal>,
    config: HitlConfig,
}

impl HitlCoordinator {
    pub fn new(
        store: Arc<dyn JobStore>,
        notifier: Arc<dyn CallbackNotifier>,
        signals: Arc<dyn ResumeSignal>,
        config: HitlConfig,
    ) -> Self {
        Self {
            store,
            notifier,
            signals,
            config,
        }
    }

    /// Escalate a confirmed blocker. Pauses the job, waits for a human
    /// resolution, resumes, and verifies the page is workable, retrying
    /// up to `max_verify_attempts` rounds if the blocker reappears.
    ///
    /// A resolution timeout is an error; the caller turns it into a
    /// terminal failure.
    pub async fn escalate(
        &self,
        job: &mut Job,
        blocker: &BlockerResult,
        adapter: &dyn Adapter,
        detector: &BlockerDetector,
    ) -> Result<HitlOutcome, Error> {
        let mut current = blocker.clone();

        for attempt in 1..=self.config.max_verify_attempts {
            self.pause_for(job, &current, adapter).await?;

            let resolution = match self.await_resolution(job).await? {
                Some(resolution) => resolution,
                None => return Ok(HitlOutcome::Cancelled),
            };

            self.resume(job, &resolution, adapter).await?;
            self.inject(&resolution, &current, adapter).await;

            match detector.detect(adapter).await {
                Ok(Some(result)) if detector.is_blocking(&result) => {
                    tracing::info!(
                        job_id = %job.id,
                        category = result.category.as_str(),
                        attempt,
                        "Blocker persists after resume"
                    );
                    current = result;
                }
                Ok(_) => return Ok(HitlOutcome::Resolved),
                Err(e) => {
                    tracing::warn!(job_id = %job.id, error = %e, "Post-resume verification failed");
                    return Err(e.into());
                }
            }
        }

        Ok(HitlOutcome::StillBlocked {
            category: current.category.as_str().to_string(),
            attempts: self.config.max_verify_attempts,
        })
    }

    /// Freeze the job: capture evidence, persist the interaction, pause the
    /// adapter, and notify the outside world.
    async fn pause_for(
        &self,
        job: &mut Job,
        blocker: &BlockerResult,
        adapter: &dyn Adapter,
    ) -> Result<(), Error> {
        // Screenshot is evidence, not a precondition; failures are logged
        // and the pause proceeds without one.
        let screenshot_ref = match adapter.screenshot().await {
            Ok(bytes) => match self.store.save_screenshot(job.id, &bytes).await {
                Ok(reference) => Some(reference),
                Err(e) => {
                    tracing::warn!(job_id = %job.id, error = %e, "Failed to store pause screenshot");
                    None
                }
            },
            Err(e) => {
                tracing::warn!(job_id = %job.id, error = %e, "Failed to capture pause screenshot");
                None
            }
        };

        let interaction = JobInteraction::blocker(
            job.id,
            blocker.category.as_str(),
            screenshot_ref.clone(),
            serde_json::json!({
                "confidence": blocker.confidence,
                "description": blocker.description,
                "source": blocker.source,
            }),
        );
        self.store.save_interaction(&interaction).await?;

        job.transition_to(JobStatus::Paused)?;
        self.store.update_status(job.id, JobStatus::Paused).await?;
        adapter.pause();

        self.append_event(JobEvent::new(
            job.id,
            "paused",
            serde_json::json!({ "blocker": blocker.category.as_str() }),
        ));

        tracing::info!(
            job_id = %job.id,
            blocker = blocker.category.as_str(),
            confidence = blocker.confidence,
            "Job paused for human intervention"
        );

        self.notifier
            .notify(CallbackEvent::HumanNeeded {
                job_id: job.id,
                blocker: blocker.category.as_str().to_string(),
                screenshot_ref,
                resolution_timeout_secs: self.config.resolution_timeout.as_secs(),
            })
            .await;

        Ok(())
    }

    /// Wait for a resolution payload. `Ok(None)` means the job was cancelled
    /// while paused. Consuming the payload deletes it from the store.
    async fn await_resolution(&self, job: &Job) -> Result<Option<ResolutionContext>, Error> {
        let deadline = Instant::now() + self.config.resolution_timeout;

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(HitlError::ResolutionTimeout {
                    timeout: self.config.resolution_timeout,
                }
                .into());
            }

            // Wake on the in-process signal or fall back to polling; either
            // way the store is the source of truth.
            let slice = remaining.min(self.config.poll_interval);
            self.signals.wait(job.id, slice).await;

            if let Some(resolution) = self.store.take_resolution(job.id).await? {
                return Ok(Some(resolution));
            }

            match self.store.get_status(job.id).await? {
                Some(JobStatus::Cancelled) => return Ok(None),
                _ => continue,
            }
        }
    }

    /// Unfreeze: record the resume, flip the status back, reopen the gate.
    /// Only the resolution *type* is persisted; the payload is gone already.
    ///
    /// The gate reopens before injection because injection goes through
    /// `act`, which blocks while paused. The payload travels only in the
    /// injection action context, never in the `resume` call itself.
    async fn resume(
        &self,
        job: &mut Job,
        resolution: &ResolutionContext,
        adapter: &dyn Adapter,
    ) -> Result<(), Error> {
        let interaction = JobInteraction::resume(
            job.id,
            serde_json::json!({ "resolution_type": resolution.resolution_type.as_str() }),
        );
        self.store.save_interaction(&interaction).await?;

        job.transition_to(JobStatus::Running)?;
        self.store.update_status(job.id, JobStatus::Running).await?;
        adapter.resume(None);

        self.append_event(JobEvent::new(job.id, "resumed", serde_json::Value::Null));
        self.notifier
            .notify(CallbackEvent::Resumed { job_id: job.id })
            .await;

        tracing::info!(job_id = %job.id, "Job resumed after human intervention");
        Ok(())
    }

    /// Apply the resolution to the live page. The secret travels only in the
    /// action context, never in the instruction text or a log field.
    async fn inject(
        &self,
        resolution: &ResolutionContext,
        blocker: &BlockerResult,
        adapter: &dyn Adapter,
    ) {
        let (instruction, ctx) = match resolution.resolution_type {
            ResolutionType::Manual | ResolutionType::Skip => return,
            ResolutionType::CodeEntry => (
                "Enter the provided verification code into the blocking prompt and submit it",
                serde_json::json!({
                    "selector": blocker.selector,
                    "value": resolution.data.as_ref().map(|s| s.expose_secret()),
                }),
            ),
            ResolutionType::Credentials => (
                "Complete the login form using the provided credentials",
                serde_json::json!({
                    "selector": blocker.selector,
                    "credentials": resolution.data.as_ref().map(|s| s.expose_secret()),
                }),
            ),
        };

        if let Err(e) = adapter.act(instruction, Some(ctx)).await {
            // Verification decides whether this matters.
            tracing::warn!(error = %e, "Resolution injection action failed");
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

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::adapter::mock::MockAdapter;
    use crate::blocker::{BlockerCategory, BlockerSource};
    use crate::config::BlockerConfig;
    use crate::notify::recording::RecordingNotifier;
    use crate::signal::LocalResumeBus;
    use crate::store::LibSqlBackend;

    fn captcha_blocker() -> BlockerResult {
        BlockerResult {
            category: BlockerCategory::Captcha,
            confidence: 0.95,
            selector: Some("iframe.captcha".to_string()),
            description: "captcha frame".to_string(),
            source: BlockerSource::Heuristic,
        }
    }

    #[test]
    fn resolution_debug_redacts_secret() {
        let ctx = ResolutionContext::code("438291");
        let debug = format!("{ctx:?}");
        assert!(!debug.contains("438291"));
    }

    #[test]
    fn resolution_type_roundtrip() {
        for t in [
            ResolutionType::Manual,
            ResolutionType::CodeEntry,
            ResolutionType::Credentials,
            ResolutionType::Skip,
        ] {
            assert_eq!(t.as_str().parse::<ResolutionType>().unwrap(), t);
        }
    }

    async fn setup() -> (
        Arc<LibSqlBackend>,
        Arc<RecordingNotifier>,
        Arc<LocalResumeBus>,
        Job,
    ) {
        let store = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let mut job = Job::new(
            "https://boards.greenhouse.io/acme/jobs/1",
            "form_application",
            serde_json::json!({}),
            "user-1",
        );
        job.transition_to(JobStatus::Running).unwrap();
        crate::store::JobStore::insert_job(store.as_ref(), &job)
            .await
            .unwrap();
        (
            store,
            Arc::new(RecordingNotifier::default()),
            Arc::new(LocalResumeBus::new()),
            job,
        )
    }

    fn coordinator(
        store: Arc<LibSqlBackend>,
        notifier: Arc<RecordingNotifier>,
        bus: Arc<LocalResumeBus>,
    ) -> HitlCoordinator {
        HitlCoordinator::new(
            store,
            notifier,
            bus,
            HitlConfig {
                resolution_timeout: Duration::from_secs(2),
                poll_interval: Duration::from_millis(10),
                max_verify_attempts: 2,
            },
        )
    }

    #[tokio::test]
    async fn escalation_resolves_after_human_fix() {
        let (store, notifier, bus, mut job) = setup().await;
        let coord = coordinator(store.clone(), notifier.clone(), bus.clone());
        let adapter = MockAdapter::new();
        // Verification sees a clean page.
        adapter.set_observations(vec![]);
        let detector = BlockerDetector::new(BlockerConfig::default());

        let job_id = job.id;
        let resolver = {
            let store = store.clone();
            let bus = bus.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(50)).await;
                crate::store::JobStore::put_resolution(
                    store.as_ref(),
                    job_id,
                    &ResolutionContext::manual(),
                )
                .await
                .unwrap();
                bus.notify(job_id);
            })
        };

        let outcome = coord
            .escalate(&mut job, &captcha_blocker(), adapter.as_ref(), &detector)
            .await
            .unwrap();
        resolver.await.unwrap();

        assert_eq!(outcome, HitlOutcome::Resolved);
        assert_eq!(job.status, JobStatus::Running);
        assert!(!adapter.is_paused());

        // Reading the resolution deleted it.
        let leftover = crate::store::JobStore::take_resolution(store.as_ref(), job_id)
            .await
            .unwrap();
        assert!(leftover.is_none());

        let names = notifier.event_names();
        assert!(names.contains(&"human_needed".to_string()));
        assert!(names.contains(&"resumed".to_string()));

        let interactions = crate::store::JobStore::list_interactions(store.as_ref(), job_id)
            .await
            .unwrap();
        assert!(interactions.iter().any(|i| i.kind == "blocker"));
    }

    #[tokio::test]
    async fn escalation_times_out_without_resolution() {
        let (store, notifier, bus, mut job) = setup().await;
        let coord = HitlCoordinator::new(
            store,
            notifier,
            bus,
            HitlConfig {
                resolution_timeout: Duration::from_millis(50),
                poll_interval: Duration::from_millis(10),
                max_verify_attempts: 2,
            },
        );
        let adapter = MockAdapter::new();
        let detector = BlockerDetector::new(BlockerConfig::default());

        let err = coord
            .escalate(&mut job, &captcha_blocker(), adapter.as_ref(), &detector)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Hitl(HitlError::ResolutionTimeout { .. })
        ));
        assert_eq!(job.status, JobStatus::Paused);
    }

    #[tokio::test]
    async fn persistent_blocker_reports_still_blocked() {
        let (store, notifier, bus, mut job) = setup().await;
        let coord = coordinator(store.clone(), notifier, bus.clone());
        let adapter = MockAdapter::new();
        // Every verification round still sees the captcha.
        adapter.set_observations(vec![crate::adapter::ObservedElement {
            selector: "iframe.captcha".to_string(),
            description: "reCAPTCHA challenge".to_string(),
            text: None,
        }]);
        let detector = BlockerDetector::new(BlockerConfig::default());

        let job_id = job.id;
        let resolver = {
            let store = store.clone();
            let bus = bus.clone();
            tokio::spawn(async move {
                for _ in 0..2 {
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    crate::store::JobStore::put_resolution(
                        store.as_ref(),
                        job_id,
                        &ResolutionContext::skip(),
                    )
                    .await
                    .unwrap();
                    bus.notify(job_id);
                }
            })
        };

        let outcome = coord
            .escalate(&mut job, &captcha_blocker(), adapter.as_ref(), &detector)
            .await
            .unwrap();
        resolver.await.unwrap();

        assert_eq!(
            outcome,
            HitlOutcome::StillBlocked {
                category: "captcha".to_string(),
                attempts: 2,
            }
        );
    }
}
