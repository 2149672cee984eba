//! Persisted token budget (`.autobuild/budget.json`).

use std::path::PathBuf;

use anyhow::Result;
use tracing::{debug, warn};

use crate::core::budget::{BudgetState, CostByCategory, ProjectEstimate, estimate_project};
use crate::core::plan::Plan;
use crate::core::types::SpendCategory;
use crate::error::EngineError;
use crate::io::atomic::{read_json_or_default, write_json};
use crate::io::config::BudgetConfig;

/// Result of recording spend.
#[derive(Debug, Clone, PartialEq)]
pub struct UsageUpdate {
    pub state: BudgetState,
    /// True when this call moved usage across the warning threshold.
    pub crossed_warning: bool,
}

#[derive(Debug, Clone)]
pub struct BudgetService {
    path: PathBuf,
    config: BudgetConfig,
}

impl BudgetService {
    pub fn new(path: impl Into<PathBuf>, config: BudgetConfig) -> Self {
        Self {
            path: path.into(),
            config,
        }
    }

    pub fn config(&self) -> &BudgetConfig {
        &self.config
    }

    pub fn load(&self) -> Result<BudgetState> {
        read_json_or_default(&self.path)
    }

    pub fn track_usage(&self, tokens: u64, category: SpendCategory) -> Result<UsageUpdate> {
        let mut state = self.load()?;
        let max = self.config.max_tokens_per_project;
        let was_warning = state.is_warning(max, self.config.warning_threshold);
        state.track(tokens, category, &self.config.rates());
        write_json(&self.path, &state)?;

        let crossed_warning = !was_warning && state.is_warning(max, self.config.warning_threshold);
        if crossed_warning {
            warn!(
                used = state.tokens_used.total,
                limit = max,
                "token budget warning threshold reached"
            );
        }
        debug!(tokens, category = category.as_str(), total = state.tokens_used.total, "usage tracked");
        Ok(UsageUpdate {
            state,
            crossed_warning,
        })
    }

    pub fn check_budget(&self) -> Result<bool> {
        Ok(self.load()?.within(self.config.max_tokens_per_project))
    }

    /// Fail with [`EngineError::BudgetExceeded`] once the project limit is used up.
    pub fn enforce_budget(&self) -> Result<()> {
        let state = self.load()?;
        let limit = self.config.max_tokens_per_project;
        if !state.within(limit) {
            return Err(EngineError::BudgetExceeded {
                used: state.tokens_used.total,
                limit,
            }
            .into());
        }
        Ok(())
    }

    pub fn cost_estimate(&self) -> Result<CostByCategory> {
        Ok(self.load()?.cost_by_category)
    }

    pub fn is_warning_threshold(&self) -> Result<bool> {
        Ok(self.load()?.is_warning(
            self.config.max_tokens_per_project,
            self.config.warning_threshold,
        ))
    }

    pub fn reset_budget(&self) -> Result<BudgetState> {
        let mut state = self.load()?;
        state.reset();
        write_json(&self.path, &state)?;
        Ok(state)
    }

    pub fn estimate_project(&self, plan: &Plan) -> ProjectEstimate {
        estimate_project(
            plan,
            self.config.estimated_plan_tokens,
            self.config.estimated_tokens_per_step,
            &self.config.rates(),
            self.config.max_tokens_per_project,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ErrorCategory, categorize};

    fn service(dir: &std::path::Path, max: u64) -> BudgetService {
        let config = BudgetConfig {
            max_tokens_per_project: max,
            ..BudgetConfig::default()
        };
        BudgetService::new(dir.join("budget.json"), config)
    }

    #[test]
    fn exceeding_limit_fails_enforcement_until_reset() {
        let temp = tempfile::tempdir().expect("tempdir");
        let budget = service(temp.path(), 1_000);

        budget.enforce_budget().expect("fresh budget");
        budget.track_usage(1_001, SpendCategory::Code).expect("track");
        let err = budget.enforce_budget().expect_err("over budget");
        assert_eq!(categorize(&err), ErrorCategory::BudgetExceeded);
        assert!(!budget.check_budget().expect("check"));

        let state = budget.reset_budget().expect("reset");
        assert_eq!(state.tokens_used.total, 0);
        budget.enforce_budget().expect("after reset");
    }

    #[test]
    fn warning_is_reported_once_when_crossed() {
        let temp = tempfile::tempdir().expect("tempdir");
        let budget = service(temp.path(), 1_000);
        assert!(!budget.track_usage(500, SpendCategory::Plan).expect("a").crossed_warning);
        assert!(budget.track_usage(300, SpendCategory::Code).expect("b").crossed_warning);
        assert!(!budget.track_usage(10, SpendCategory::Chat).expect("c").crossed_warning);
        assert!(budget.is_warning_threshold().expect("warning"));
        assert!(budget.cost_estimate().expect("cost").total > 0.0);
    }
}
