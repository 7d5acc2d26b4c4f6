//! Learned manuals ("cookbooks"): replayable action sequences.
//!
//! A manual is a persisted, ordered sequence of browser actions previously
//! proven to accomplish a task on a given site. Its health score is a
//! confidence metric in [0,1]: reinforced by successful replays, decayed by
//! failed ones, and gating future replay eligibility. Eviction is by
//! confidence, not by time.

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::ManualConfig;

/// The kind of browser action a step performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepAction {
    Navigate,
    Fill,
    Click,
    Select,
    Submit,
}

impl StepAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Navigate => "navigate",
            Self::Fill => "fill",
            Self::Click => "click",
            Self::Select => "select",
            Self::Submit => "submit",
        }
    }
}

/// One step of a manual. Steps are totally ordered by `order`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManualStep {
    pub order: u32,
    pub action: StepAction,
    /// Selector or URL the action targets.
    pub locator: String,
    /// Value to fill/select, when the action takes one. Placeholders of the
    /// form `{{field}}` are resolved against the job's input data at replay.
    pub value: Option<String>,
    /// Per-step confidence, informational only.
    pub health_score: f64,
}

/// Where a manual came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ManualSource {
    /// Learned from the trace of a successful LLM-driven run.
    Trace,
    /// Hand-authored or imported.
    Imported,
}

/// A replayable action sequence for one (site, task) pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manual {
    pub id: Uuid,
    /// Glob over target URLs, e.g. `https://boards.greenhouse.io/*/jobs/*`.
    pub url_pattern: String,
    /// Glob over task types, usually exact.
    pub task_pattern: String,
    pub platform: String,
    pub steps: Vec<ManualStep>,
    pub health_score: f64,
    pub source: ManualSource,
    pub success_count: u32,
    pub failure_count: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Manual {
    /// Whether this manual applies to the given job coordinates.
    pub fn matches(&self, target_url: &str, task_type: &str) -> bool {
        pattern_matches(&self.url_pattern, target_url)
            && pattern_matches(&self.task_pattern, task_type)
    }

    /// Whether the manual may be offered for replay.
    pub fn is_usable(&self, config: &ManualConfig) -> bool {
        self.health_score >= config.usability_threshold
    }

    /// Reinforce after a fully successful replay: the score moves toward 1.0
    /// by a fraction of the remaining headroom.
    pub fn apply_success(&mut self, config: &ManualConfig) {
        self.health_score =
            clamp01(self.health_score + config.reinforce_gain * (1.0 - self.health_score));
        self.success_count += 1;
        self.updated_at = Utc::now();
    }

    /// Decay after a failed replay.
    pub fn apply_failure(&mut self, config: &ManualConfig) {
        self.health_score = clamp01(self.health_score * config.failure_decay);
        self.failure_count += 1;
        self.updated_at = Utc::now();
    }
}

/// Match a `*`-glob pattern against a value. `*` spans any characters,
/// including `/`. Matching is case-sensitive and anchored at both ends.
pub fn pattern_matches(pattern: &str, value: &str) -> bool {
    let mut regex_src = String::with_capacity(pattern.len() + 8);
    regex_src.push('^');
    for (i, part) in pattern.split('*').enumerate() {
        if i > 0 {
            regex_src.push_str(".*");
        }
        regex_src.push_str(&regex::escape(part));
    }
    regex_src.push('$');

    match Regex::new(&regex_src) {
        Ok(re) => re.is_match(value),
        Err(_) => pattern == value,
    }
}

fn clamp01(value: f64) -> f64 {
    value.clamp(0.0, 1.0)
}
