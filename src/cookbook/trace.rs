//! Trace recording: the learning half of the cache.
//!
//! While a job runs LLM-driven, the handler's structured actions are
//! recorded here. On successful completion the trace becomes a manual;
//! on failure it is discarded. A recorder belongs to exactly one run.
//!
//! Values recorded for fill/select steps are `{{field}}` placeholders, not
//! the user's actual input, so manuals never store applicant data.

use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::Utc;
use uuid::Uuid;

use crate::config::ManualConfig;
use crate::manual::{Manual, ManualSource, ManualStep, StepAction};

/// One executed action captured during an LLM-driven run.
#[derive(Debug, Clone)]
pub struct TracedAction {
    pub action: StepAction,
    pub locator: String,
    pub value: Option<String>,
}

/// Append-only action log for one run.
pub struct TraceRecorder {
    recording: AtomicBool,
    actions: Mutex<Vec<TracedAction>>,
}

impl TraceRecorder {
    pub fn new() -> Self {
        Self {
            recording: AtomicBool::new(false),
            actions: Mutex::new(Vec::new()),
        }
    }

    /// Begin recording, discarding anything from a previous aborted attempt.
    /// Crash recovery restarts the handler from the beginning, so the trace
    /// restarts with it.
    pub fn start(&self) {
        self.actions.lock().unwrap().clear();
        self.recording.store(true, Ordering::SeqCst);
    }

    pub fn stop(&self) {
        self.recording.store(false, Ordering::SeqCst);
    }

    pub fn is_recording(&self) -> bool {
        self.recording.load(Ordering::SeqCst)
    }

    /// Append one action. Ignored when not recording.
    pub fn record(&self, action: StepAction, locator: &str, value: Option<&str>) {
        if !self.is_recording() {
            return;
        }
        self.actions.lock().unwrap().push(TracedAction {
            action,
            locator: locator.to_string(),
            value: value.map(String::from),
        });
    }

    pub fn len(&self) -> usize {
        self.actions.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Convert the trace into a manual for future replay. Returns `None`
    /// for an empty trace.
    pub fn to_manual(
        &self,
        target_url: &str,
        task_type: &str,
        platform: &str,
        config: &ManualConfig,
    ) -> Option<Manual> {
        let actions = self.actions.lock().unwrap();
        if actions.is_empty() {
            return None;
        }

        let steps = actions
            .iter()
            .enumerate()
            .map(|(i, a)| ManualStep {
                order: (i + 1) as u32,
                action: a.action,
                locator: a.locator.clone(),
                value: a.value.clone(),
                health_score: 1.0,
            })
            .collect();

        let now = Utc::now();
        Some(Manual {
            id: Uuid::new_v4(),
            url_pattern: url_pattern_for(target_url),
            task_pattern: task_type.to_string(),
            platform: platform.to_string(),
            steps,
            health_score: config.initial_score,
            source: ManualSource::Trace,
            success_count: 0,
            failure_count: 0,
            created_at: now,
            updated_at: now,
        })
    }
}

impl Default for TraceRecorder {
    fn default() -> Self {
        Self::new()
    }
}

/// Generalize a concrete URL into a lookup pattern: purely numeric path
/// segments (posting ids) become `*`; query strings are dropped.
pub fn url_pattern_for(url: &str) -> String {
    let url = url.split(['?', '#']).next().unwrap_or(url);
    let Some(scheme_end) = url.find("//") else {
        return url.to_string();
    };
    let (scheme, rest) = url.split_at(scheme_end + 2);
    let mut parts = rest.split('/');
    let host = parts.next().unwrap_or("");

    let mut pattern = format!("{scheme}{host}");
    for segment in parts {
        pattern.push('/');
        if !segment.is_empty() && segment.chars().all(|c| c.is_ascii_digit()) {
            pattern.push('*');
        } else {
            pattern.push_str(segment);
        }
    }
    pattern
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manual::pattern_matches;

    #[test]
    fn records_only_while_recording() {
        let trace = TraceRecorder::new();
        trace.record(StepAction::Click, "button", None);
        assert!(trace.is_empty());

        trace.start();
        trace.record(StepAction::Fill, "input[name=email]", Some("{{email}}"));
        trace.stop();
        trace.record(StepAction::Click, "button.submit", None);
        assert_eq!(trace.len(), 1);
    }

    #[test]
    fn start_discards_aborted_attempt() {
        let trace = TraceRecorder::new();
        trace.start();
        trace.record(StepAction::Fill, "input", Some("{{a}}"));
        // Crash recovery restarts the handler.
        trace.start();
        assert!(trace.is_empty());
    }

    #[test]
    fn to_manual_builds_ordered_steps() {
        let trace = TraceRecorder::new();
        trace.start();
        trace.record(StepAction::Navigate, "https://boards.greenhouse.io/acme/jobs/77", None);
        trace.record(StepAction::Fill, "input[name=name]", Some("{{name}}"));
        trace.record(StepAction::Submit, "button[type=submit]", None);

        let config = ManualConfig::default();
        let manual = trace
            .to_manual(
                "https://boards.greenhouse.io/acme/jobs/77",
                "form_application",
                "greenhouse.io",
                &config,
            )
            .unwrap();

        assert_eq!(manual.steps.len(), 3);
        assert_eq!(manual.steps[0].order, 1);
        assert_eq!(manual.steps[2].order, 3);
        assert_eq!(manual.health_score, config.initial_score);
        assert!(manual.matches("https://boards.greenhouse.io/acme/jobs/4021", "form_application"));
    }

    #[test]
    fn empty_trace_yields_no_manual() {
        let trace = TraceRecorder::new();
        trace.start();
        assert!(
            trace
                .to_manual("https://x.test/a", "form_application", "x.test", &ManualConfig::default())
                .is_none()
        );
    }

    #[test]
    fn url_pattern_generalizes_numeric_segments() {
        assert_eq!(
            url_pattern_for("https://boards.greenhouse.io/acme/jobs/4021?src=li"),
            "https://boards.greenhouse.io/acme/jobs/*"
        );
        assert_eq!(
            url_pattern_for("https://jobs.lever.co/acme/apply"),
            "https://jobs.lever.co/acme/apply"
        );
        let pattern = url_pattern_for("https://boards.greenhouse.io/acme/jobs/4021");
        assert!(pattern_matches(&pattern, "https://boards.greenhouse.io/acme/jobs/9999"));
    }
}
