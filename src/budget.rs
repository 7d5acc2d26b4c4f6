//! Per-job cost tracking and ceilings.
//!
//! The ledger is owned by a single job's execution; counters are monotone for
//! the job's lifetime and a snapshot can be read at any point for
//! partial-failure cost accounting. Overages raise synchronously from the
//! adapter event pump, which is what halts runaway LLM usage mid-run.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::config::QualityPreset;
use crate::error::BudgetError;

/// Token/cost usage reported by one adapter action.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    /// Provider-priced cost of this call.
    #[serde(with = "rust_decimal::serde::str")]
    pub cost: Decimal,
}

/// Point-in-time view of a job's accrued cost.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BudgetSnapshot {
    pub action_count: u64,
    pub input_tokens: u64,
    pub output_tokens: u64,
    #[serde(with = "rust_decimal::serde::str")]
    pub total_cost: Decimal,
}

/// Monotone cost ledger for one job.
#[derive(Debug)]
pub struct BudgetLedger {
    action_count: u64,
    input_tokens: u64,
    output_tokens: u64,
    total_cost: Decimal,
    action_limit: u64,
    cost_ceiling: Decimal,
}

impl BudgetLedger {
    /// Create a ledger with ceilings from a quality preset.
    pub fn for_preset(preset: QualityPreset) -> Self {
        Self {
            action_count: 0,
            input_tokens: 0,
            output_tokens: 0,
            total_cost: Decimal::ZERO,
            action_limit: preset.action_limit(),
            cost_ceiling: preset.cost_ceiling(),
        }
    }

    /// Preflight check: would this job be allowed to run at all?
    ///
    /// Rejects jobs whose preset allows no actions or no spend, before any
    /// adapter is started.
    pub fn preflight(&self) -> Result<(), BudgetError> {
        if self.action_limit == 0 {
            return Err(BudgetError::ActionLimitExceeded {
                actions: 0,
                limit: 0,
            });
        }
        if self.cost_ceiling <= Decimal::ZERO {
            return Err(BudgetError::BudgetExceeded {
                spent: self.total_cost.to_string(),
                ceiling: self.cost_ceiling.to_string(),
            });
        }
        Ok(())
    }

    /// Record one adapter action; raises once the action ceiling is crossed.
    pub fn record_action(&mut self) -> Result<(), BudgetError> {
        self.action_count += 1;
        if self.action_count > self.action_limit {
            return Err(BudgetError::ActionLimitExceeded {
                actions: self.action_count,
                limit: self.action_limit,
            });
        }
        Ok(())
    }

    /// Accumulate token usage; raises once the cost ceiling is crossed.
    ///
    /// The usage is recorded *before* the check so the snapshot reflects the
    /// exact partial cost at the moment of the overage.
    pub fn record_token_usage(&mut self, usage: &TokenUsage) -> Result<(), BudgetError> {
        self.input_tokens += usage.input_tokens;
        self.output_tokens += usage.output_tokens;
        self.total_cost += usage.cost;
        if self.total_cost > self.cost_ceiling {
            return Err(BudgetError::BudgetExceeded {
                spent: self.total_cost.to_string(),
                ceiling: self.cost_ceiling.to_string(),
            });
        }
        Ok(())
    }

    pub fn snapshot(&self) -> BudgetSnapshot {
        BudgetSnapshot {
            action_count: self.action_count,
            input_tokens: self.input_tokens,
            output_tokens: self.output_tokens,
            total_cost: self.total_cost,
        }
    }
}
