//! Token budget arithmetic: category-partitioned spend, derived cost, estimates.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::plan::Plan;
use crate::core::types::SpendCategory;

/// Cost per 1,000 tokens for each spend category.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Rates {
    pub plan: f64,
    pub code: f64,
    pub chat: f64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokensUsed {
    pub total: u64,
    pub plan: u64,
    pub code: u64,
    pub chat: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct CostByCategory {
    pub plan: f64,
    pub code: f64,
    pub chat: f64,
    pub total: f64,
}

/// Persisted spend record. Only grows, except on explicit reset.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BudgetState {
    pub tokens_used: TokensUsed,
    pub cost_by_category: CostByCategory,
    pub last_updated: Option<DateTime<Utc>>,
}

impl BudgetState {
    pub fn track(&mut self, tokens: u64, category: SpendCategory, rates: &Rates) {
        let used = &mut self.tokens_used;
        match category {
            SpendCategory::Plan => used.plan = used.plan.saturating_add(tokens),
            SpendCategory::Code => used.code = used.code.saturating_add(tokens),
            SpendCategory::Chat => used.chat = used.chat.saturating_add(tokens),
        }
        used.total = used.total.saturating_add(tokens);
        self.cost_by_category = derive_cost(&self.tokens_used, rates);
        self.last_updated = Some(Utc::now());
    }

    /// True while another generation call is still allowed.
    pub fn within(&self, max_tokens: u64) -> bool {
        self.tokens_used.total < max_tokens
    }

    pub fn usage_ratio(&self, max_tokens: u64) -> f64 {
        if max_tokens == 0 {
            return 1.0;
        }
        self.tokens_used.total as f64 / max_tokens as f64
    }

    pub fn is_warning(&self, max_tokens: u64, threshold: f64) -> bool {
        self.usage_ratio(max_tokens) >= threshold
    }

    pub fn reset(&mut self) {
        *self = BudgetState {
            last_updated: Some(Utc::now()),
            ..BudgetState::default()
        };
    }
}

/// Recompute cost from token counts; cost is never mutated directly.
pub fn derive_cost(tokens: &TokensUsed, rates: &Rates) -> CostByCategory {
    let plan = tokens.plan as f64 / 1000.0 * rates.plan;
    let code = tokens.code as f64 / 1000.0 * rates.code;
    let chat = tokens.chat as f64 / 1000.0 * rates.chat;
    CostByCategory {
        plan,
        code,
        chat,
        total: plan + code + chat,
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectEstimate {
    pub steps: usize,
    pub estimated_tokens: u64,
    pub estimated_cost: f64,
    pub exceeds_budget: bool,
}

/// Estimate the spend needed to implement `plan` from scratch.
pub fn estimate_project(
    plan: &Plan,
    plan_tokens: u64,
    tokens_per_step: u64,
    rates: &Rates,
    max_tokens: u64,
) -> ProjectEstimate {
    let steps = plan.step_count();
    let code_tokens = tokens_per_step.saturating_mul(steps as u64);
    let estimated_tokens = plan_tokens.saturating_add(code_tokens);
    let estimated_cost = plan_tokens as f64 / 1000.0 * rates.plan
        + code_tokens as f64 / 1000.0 * rates.code;
    ProjectEstimate {
        steps,
        estimated_tokens,
        estimated_cost,
        exceeds_budget: estimated_tokens > max_tokens,
    }
}

/// Rough token count for text when the collaborator reports no usage.
pub fn estimate_tokens(chars: usize) -> u64 {
    (chars as u64).div_ceil(4)
}
