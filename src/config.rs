//! Configuration types.
//!
//! Everything the orchestrator tunes lives here as an explicit value; core
//! modules never read the process environment. The binary builds an
//! [`OrchestratorConfig`] from `FORMPILOT_*` variables via [`from_env`].
//!
//! [`from_env`]: OrchestratorConfig::from_env

use std::time::Duration;

use rust_decimal::Decimal;
use rust_decimal_macros::dec;

use crate::error::ConfigError;

/// Which browser engine the adapter should drive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrowserEngine {
    Chromium,
    Firefox,
    Webkit,
}

impl BrowserEngine {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Chromium => "chromium",
            Self::Firefox => "firefox",
            Self::Webkit => "webkit",
        }
    }
}

impl std::str::FromStr for BrowserEngine {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "chromium" | "chrome" => Ok(Self::Chromium),
            "firefox" => Ok(Self::Firefox),
            "webkit" | "safari" => Ok(Self::Webkit),
            other => Err(ConfigError::InvalidValue {
                key: "browser_engine".to_string(),
                message: format!("unknown engine '{other}'"),
            }),
        }
    }
}

/// Named per-job cost/action ceiling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QualityPreset {
    /// Cheap runs: tight ceilings, suitable for well-cached sites.
    Economy,
    /// Default ceilings.
    Standard,
    /// Generous ceilings for long multi-page applications.
    Thorough,
}

impl QualityPreset {
    /// Maximum spend for one job under this preset.
    pub fn cost_ceiling(&self) -> Decimal {
        match self {
            Self::Economy => dec!(0.50),
            Self::Standard => dec!(2.00),
            Self::Thorough => dec!(8.00),
        }
    }

    /// Maximum adapter actions for one job under this preset.
    pub fn action_limit(&self) -> u64 {
        match self {
            Self::Economy => 60,
            Self::Standard => 200,
            Self::Thorough => 600,
        }
    }
}

impl std::str::FromStr for QualityPreset {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "economy" => Ok(Self::Economy),
            "standard" => Ok(Self::Standard),
            "thorough" => Ok(Self::Thorough),
            other => Err(ConfigError::UnknownPreset(other.to_string())),
        }
    }
}

/// Tunables for manual health scoring and replay eligibility.
#[derive(Debug, Clone)]
pub struct ManualConfig {
    /// Manuals scoring below this are never offered for replay.
    pub usability_threshold: f64,
    /// Successful replay moves the score toward 1.0 by this fraction of the
    /// remaining headroom.
    pub reinforce_gain: f64,
    /// Failed replay multiplies the score by this factor.
    pub failure_decay: f64,
    /// Score assigned to a manual freshly learned from a trace.
    pub initial_score: f64,
}

impl Default for ManualConfig {
    fn default() -> Self {
        Self {
            usability_threshold: 0.3,
            reinforce_gain: 0.1,
            failure_decay: 0.7,
            initial_score: 0.8,
        }
    }
}

/// Tunables for blocker detection.
#[derive(Debug, Clone)]
pub struct BlockerConfig {
    /// Minimum confidence before a detection escalates to HITL.
    pub confidence_threshold: f64,
    /// Consecutive action failures that trigger an immediate check.
    pub failure_trigger: u32,
    /// Wall-clock interval between periodic checks.
    pub check_interval: Duration,
    /// Checks never run more often than this, whatever triggers them.
    pub check_floor: Duration,
}

impl Default for BlockerConfig {
    fn default() -> Self {
        Self {
            confidence_threshold: 0.75,
            failure_trigger: 3,
            check_interval: Duration::from_secs(45),
            check_floor: Duration::from_secs(10),
        }
    }
}

/// Tunables for the human-in-the-loop pause/resume protocol.
#[derive(Debug, Clone)]
pub struct HitlConfig {
    /// How long to wait for a human resolution before failing the job.
    pub resolution_timeout: Duration,
    /// Polling interval when no resume signal channel is available.
    pub poll_interval: Duration,
    /// Post-resume verification attempts before reporting "still blocked".
    pub max_verify_attempts: u32,
}

impl Default for HitlConfig {
    fn default() -> Self {
        Self {
            resolution_timeout: Duration::from_secs(15 * 60),
            poll_interval: Duration::from_secs(5),
            max_verify_attempts: 3,
        }
    }
}

/// Orchestrator configuration.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Browser engine the adapter factory should drive.
    pub browser_engine: BrowserEngine,
    /// Default quality preset for jobs that don't carry one.
    pub default_preset: QualityPreset,
    /// Maximum in-place adapter restarts after a browser crash.
    pub max_recovery_attempts: u32,
    /// Default per-job deadline when the job row doesn't carry one.
    pub default_timeout: Duration,
    /// Default retry ceiling for jobs that don't carry one.
    pub default_max_retries: u32,
    /// Heartbeat interval while a job is running.
    pub heartbeat_interval: Duration,
    /// Maximum jobs one worker process executes concurrently.
    pub max_parallel_jobs: usize,
    /// Queue poll interval for the claim loop.
    pub claim_poll_interval: Duration,
    pub manual: ManualConfig,
    pub blocker: BlockerConfig,
    pub hitl: HitlConfig,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            browser_engine: BrowserEngine::Chromium,
            default_preset: QualityPreset::Standard,
            max_recovery_attempts: 2,
            default_timeout: Duration::from_secs(20 * 60),
            default_max_retries: 3,
            heartbeat_interval: Duration::from_secs(15),
            max_parallel_jobs: 4,
            claim_poll_interval: Duration::from_secs(3),
            manual: ManualConfig::default(),
            blocker: BlockerConfig::default(),
            hitl: HitlConfig::default(),
        }
    }
}

impl OrchestratorConfig {
    /// Build a config from `FORMPILOT_*` environment variables, falling back
    /// to defaults. Only the binary calls this.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Ok(engine) = std::env::var("FORMPILOT_BROWSER_ENGINE") {
            config.browser_engine = engine.parse()?;
        }
        if let Ok(preset) = std::env::var("FORMPILOT_QUALITY_PRESET") {
            config.default_preset = preset.parse()?;
        }
        if let Ok(v) = std::env::var("FORMPILOT_MAX_PARALLEL_JOBS") {
            config.max_parallel_jobs =
                v.parse().map_err(|_| ConfigError::InvalidValue {
                    key: "FORMPILOT_MAX_PARALLEL_JOBS".to_string(),
                    message: format!("not a number: {v}"),
                })?;
        }
        if let Ok(v) = std::env::var("FORMPILOT_HITL_TIMEOUT_SECS") {
            let secs: u64 = v.parse().map_err(|_| ConfigError::InvalidValue {
                key: "FORMPILOT_HITL_TIMEOUT_SECS".to_string(),
                message: format!("not a number: {v}"),
            })?;
            config.hitl.resolution_timeout = Duration::from_secs(secs);
        }
        if let Ok(v) = std::env::var("FORMPILOT_MANUAL_THRESHOLD") {
            config.manual.usability_threshold =
                v.parse().map_err(|_| ConfigError::InvalidValue {
                    key: "FORMPILOT_MANUAL_THRESHOLD".to_string(),
                    message: format!("not a number: {v}"),
                })?;
        }

        Ok(config)
    }
}
