//! Blocker detection: classifies the current page state into a category
//! automated action cannot safely proceed past.
//!
//! Detection is two-stage: cheap DOM heuristics over an `observe()` call
//! first, then an adapter `extract()` observation when the heuristics see
//! nothing but the caller suspects a stall.

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::adapter::{Adapter, ObservedElement};
use crate::config::BlockerConfig;
use crate::error::AdapterError;

/// What is blocking the page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockerCategory {
    Captcha,
    Login,
    TwoFactor,
    BotCheck,
    RateLimited,
    Verification,
    Unknown,
}

impl BlockerCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Captcha => "captcha",
            Self::Login => "login",
            Self::TwoFactor => "2fa",
            Self::BotCheck => "bot_check",
            Self::RateLimited => "rate_limited",
            Self::Verification => "verification",
            Self::Unknown => "unknown",
        }
    }
}

impl std::str::FromStr for BlockerCategory {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "captcha" => Self::Captcha,
            "login" => Self::Login,
            "2fa" | "two_factor" => Self::TwoFactor,
            "bot_check" => Self::BotCheck,
            "rate_limited" => Self::RateLimited,
            "verification" => Self::Verification,
            _ => Self::Unknown,
        })
    }
}

/// How the classification was produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockerSource {
    Heuristic,
    Observation,
}

/// One classification of the current page state. Ephemeral, persisted only
/// as part of the pause interaction record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockerResult {
    pub category: BlockerCategory,
    pub confidence: f64,
    pub selector: Option<String>,
    pub description: String,
    pub source: BlockerSource,
}

/// One DOM heuristic: a pattern over observed element text/selectors.
struct Heuristic {
    name: &'static str,
    regex: Regex,
    category: BlockerCategory,
    confidence: f64,
}

/// Classifies page state using DOM heuristics and adapter observation.
pub struct BlockerDetector {
    config: BlockerConfig,
    heuristics: Vec<Heuristic>,
}

impl BlockerDetector {
    pub fn new(config: BlockerConfig) -> Self {
        let heuristics = vec![
            Heuristic {
                name: "captcha_widget",
                regex: Regex::new(r"(?i)\b(re|h)?captcha\b|cf-turnstile").unwrap(),
                category: BlockerCategory::Captcha,
                confidence: 0.95,
            },
            Heuristic {
                name: "two_factor_prompt",
                regex: Regex::new(r"(?i)verification code|one[\s-]?time (code|password)|\b2fa\b|authenticator app").unwrap(),
                category: BlockerCategory::TwoFactor,
                confidence: 0.85,
            },
            Heuristic {
                name: "bot_interstitial",
                regex: Regex::new(r"(?i)are you a (ro)?bot|unusual traffic|checking your browser|prove you'?re human").unwrap(),
                category: BlockerCategory::BotCheck,
                confidence: 0.85,
            },
            Heuristic {
                name: "rate_limit_page",
                regex: Regex::new(r"(?i)rate limit|too many requests|try again later").unwrap(),
                category: BlockerCategory::RateLimited,
                confidence: 0.8,
            },
            Heuristic {
                name: "login_form",
                regex: Regex::new(r"(?i)\b(sign|log)\s?in\b|\bpassword\b|session (has )?expired").unwrap(),
                category: BlockerCategory::Login,
                confidence: 0.75,
            },
            Heuristic {
                name: "verification_notice",
                regex: Regex::new(r"(?i)verify your (email|identity|account)|confirmation (link|email)").unwrap(),
                category: BlockerCategory::Verification,
                confidence: 0.7,
            },
        ];
        Self { config, heuristics }
    }

    pub fn confidence_threshold(&self) -> f64 {
        self.config.confidence_threshold
    }

    /// Whether a result is confident enough to escalate.
    pub fn is_blocking(&self, result: &BlockerResult) -> bool {
        result.category != BlockerCategory::Unknown
            && result.confidence >= self.config.confidence_threshold
    }

    /// Classify the current page. `None` means nothing suspicious was seen.
    pub async fn detect(
        &self,
        adapter: &dyn Adapter,
    ) -> Result<Option<BlockerResult>, AdapterError> {
        let elements = adapter
            .observe("any blocking prompts, overlays, login forms, or verification widgets")
            .await?;

        if let Some(result) = self.match_heuristics(&elements) {
            return Ok(Some(result));
        }

        // Heuristics saw nothing conclusive; ask the engine for a judgement.
        self.observe_classification(adapter).await
    }

    /// First matching heuristic wins; the table is ordered most-specific
    /// first so a captcha inside a login form classifies as captcha.
    fn match_heuristics(&self, elements: &[ObservedElement]) -> Option<BlockerResult> {
        for element in elements {
            let haystack = format!(
                "{} {} {}",
                element.selector,
                element.description,
                element.text.as_deref().unwrap_or("")
            );
            for heuristic in &self.heuristics {
                if heuristic.regex.is_match(&haystack) {
                    return Some(BlockerResult {
                        category: heuristic.category,
                        confidence: heuristic.confidence,
                        selector: Some(element.selector.clone()),
                        description: format!(
                            "{} matched on '{}'",
                            heuristic.name, element.description
                        ),
                        source: BlockerSource::Heuristic,
                    });
                }
            }
        }
        None
    }

    async fn observe_classification(
        &self,
        adapter: &dyn Adapter,
    ) -> Result<Option<BlockerResult>, AdapterError> {
        let schema = serde_json::json!({
            "type": "object",
            "properties": {
                "category": {
                    "type": "string",
                    "enum": ["captcha", "login", "2fa", "bot_check",
                             "rate_limited", "verification", "none"]
                },
                "confidence": { "type": "number" },
                "description": { "type": "string" }
            },
            "required": ["category", "confidence"]
        });

        let value = adapter
            .extract(
                "Is anything preventing automated form completion on this page? \
                 Classify the blocker, or 'none' if the form is workable.",
                &schema,
            )
            .await?;

        let category_str = value
            .get("category")
            .and_then(|v| v.as_str())
            .unwrap_or("none");
        if category_str == "none" {
            return Ok(None);
        }

        let category: BlockerCategory = category_str.parse().unwrap_or(BlockerCategory::Unknown);
        let confidence = value
            .get("confidence")
            .and_then(|v| v.as_f64())
            .unwrap_or(0.0)
            .clamp(0.0, 1.0);
        let description = value
            .get("description")
            .and_then(|v| v.as_str())
            .unwrap_or("engine-reported blocker")
            .to_string();

        Ok(Some(BlockerResult {
            category,
            confidence,
            selector: None,
            description,
            source: BlockerSource::Observation,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::mock::MockAdapter;

    fn element(selector: &str, description: &str, text: Option<&str>) -> ObservedElement {
        ObservedElement {
            selector: selector.to_string(),
            description: description.to_string(),
            text: text.map(String::from),
        }
    }

    fn detector() -> BlockerDetector {
        BlockerDetector::new(BlockerConfig::default())
    }

    #[tokio::test]
    async fn captcha_detected_by_heuristic() {
        let adapter = MockAdapter::new();
        adapter.set_observations(vec![element(
            "iframe[title='reCAPTCHA']",
            "reCAPTCHA challenge frame",
            None,
        )]);

        let result = detector().detect(adapter.as_ref()).await.unwrap().unwrap();
        assert_eq!(result.category, BlockerCategory::Captcha);
        assert_eq!(result.source, BlockerSource::Heuristic);
        assert!(result.confidence >= 0.9);
        assert!(result.selector.is_some());
    }

    #[tokio::test]
    async fn captcha_wins_over_login_on_same_page() {
        let adapter = MockAdapter::new();
        adapter.set_observations(vec![element(
            "div.challenge",
            "Sign in form protected by hCaptcha",
            Some("Sign in"),
        )]);

        let result = detector().detect(adapter.as_ref()).await.unwrap().unwrap();
        assert_eq!(result.category, BlockerCategory::Captcha);
    }

    #[tokio::test]
    async fn login_form_detected() {
        let adapter = MockAdapter::new();
        adapter.set_observations(vec![element(
            "input[type=password]",
            "Password field",
            Some("Log in to continue"),
        )]);

        let result = detector().detect(adapter.as_ref()).await.unwrap().unwrap();
        assert_eq!(result.category, BlockerCategory::Login);
    }

    #[tokio::test]
    async fn clean_page_falls_back_to_observation_none() {
        let adapter = MockAdapter::new();
        adapter.set_observations(vec![element(
            "input[name=email]",
            "Email address field",
            None,
        )]);
        adapter.push_extract(serde_json::json!({"category": "none", "confidence": 0.0}));

        let result = detector().detect(adapter.as_ref()).await.unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn observation_classification_parsed() {
        let adapter = MockAdapter::new();
        adapter.push_extract(serde_json::json!({
            "category": "bot_check",
            "confidence": 0.88,
            "description": "Cloudflare interstitial"
        }));

        let result = detector().detect(adapter.as_ref()).await.unwrap().unwrap();
        assert_eq!(result.category, BlockerCategory::BotCheck);
        assert_eq!(result.source, BlockerSource::Observation);
        assert!((result.confidence - 0.88).abs() < f64::EPSILON);
    }

    #[test]
    fn blocking_requires_threshold_and_known_category() {
        let d = detector();
        let mut result = BlockerResult {
            category: BlockerCategory::Captcha,
            confidence: 0.95,
            selector: None,
            description: String::new(),
            source: BlockerSource::Heuristic,
        };
        assert!(d.is_blocking(&result));
        result.confidence = 0.5;
        assert!(!d.is_blocking(&result));
        result.confidence = 0.95;
        result.category = BlockerCategory::Unknown;
        assert!(!d.is_blocking(&result));
    }
}
