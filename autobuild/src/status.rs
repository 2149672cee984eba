//! Read-only status snapshot for the CLI.

use std::fmt::Write as _;
use std::path::Path;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use serde::Serialize;

use crate::core::budget::BudgetState;
use crate::core::types::ExecutionState;
use crate::io::budget::BudgetService;
use crate::io::checkpoint::{Checkpoint, CheckpointStore};
use crate::io::config::load_config;
use crate::io::documents::Documents;
use crate::io::init::ControlPaths;
use crate::io::lock::{Lease, LockManager};
use crate::io::questions::QuestionsDoc;
use crate::io::state_store::StateStore;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LeaseStatus {
    #[serde(flatten)]
    pub lease: Lease,
    pub age_secs: i64,
    pub stale: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StepCounts {
    pub total: usize,
    pub completed: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusSnapshot {
    pub state: ExecutionState,
    pub app_name: Option<String>,
    pub lease: Option<LeaseStatus>,
    pub latest_checkpoint: Option<Checkpoint>,
    pub steps: StepCounts,
    pub budget: BudgetState,
    pub budget_limit: u64,
    pub open_questions: Vec<String>,
}

/// Collect the snapshot without touching the lease.
pub fn collect(root: &Path) -> Result<StatusSnapshot> {
    let paths = ControlPaths::new(root);
    paths.ensure_initialized()?;
    let config = load_config(&paths.config_path)?;

    let state = StateStore::new(&paths.state_path).read()?;
    let stale_after = config.lease_stale();
    let lease = LockManager::new(&paths.lock_path, stale_after)
        .read_lease()
        .map(|lease| lease_status(lease, stale_after));
    let latest_checkpoint = CheckpointStore::new(&paths.checkpoints_dir).latest()?;
    let open_questions = QuestionsDoc::new(&paths.questions_path).open_questions()?;
    let budget = BudgetService::new(&paths.budget_path, config.budget.clone()).load()?;

    let docs = Documents::new(paths);
    let plan = docs.load_plan()?;
    let ledger = docs.load_progress()?;
    let mut steps = StepCounts::default();
    if let Some(plan) = &plan {
        for step in plan.steps() {
            steps.total += 1;
            if ledger.is_completed(&step.id) {
                steps.completed += 1;
            } else if ledger.is_failed(&step.id) {
                steps.failed += 1;
            }
        }
    }

    Ok(StatusSnapshot {
        state,
        app_name: plan.and_then(|plan| plan.app_name),
        lease,
        latest_checkpoint,
        steps,
        budget,
        budget_limit: config.budget.max_tokens_per_project,
        open_questions,
    })
}

fn lease_status(lease: Lease, stale_after: Duration) -> LeaseStatus {
    let now = Utc::now();
    LeaseStatus {
        age_secs: lease.age(now).as_secs() as i64,
        stale: lease.is_stale(stale_after, now),
        lease,
    }
}

impl StatusSnapshot {
    /// Plain-text rendering for terminals.
    pub fn render(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "state: {}", self.state);
        if let Some(app) = &self.app_name {
            let _ = writeln!(out, "app: {app}");
        }
        match &self.lease {
            Some(lease) => {
                let _ = writeln!(
                    out,
                    "lease: {} ({}s{})",
                    lease.lease.owner,
                    lease.age_secs,
                    if lease.stale { ", stale" } else { "" }
                );
            }
            None => out.push_str("lease: free\n"),
        }
        if let Some(cp) = &self.latest_checkpoint {
            let _ = writeln!(out, "checkpoint: {} ({})", cp.id, cp.state);
        }
        let _ = writeln!(
            out,
            "steps: {}/{} completed, {} failed",
            self.steps.completed, self.steps.total, self.steps.failed
        );
        let _ = writeln!(
            out,
            "tokens: {} of {} (${:.2})",
            self.budget.tokens_used.total, self.budget_limit, self.budget.cost_by_category.total
        );
        if !self.open_questions.is_empty() {
            let _ = writeln!(out, "open questions: {}", self.open_questions.len());
            for question in &self.open_questions {
                let _ = writeln!(out, "  - {question}");
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ledger::ProgressLedger;
    use crate::test_support::{TestWorkspace, plan_response, generated_step};

    #[test]
    fn fresh_workspace_reports_plan_and_free_lease() {
        let workspace = TestWorkspace::new();
        let status = collect(workspace.root()).expect("status");
        assert_eq!(status.state, ExecutionState::Plan);
        assert!(status.lease.is_none());
        assert_eq!(status.steps, StepCounts::default());
        assert!(status.render().contains("lease: free"));
    }

    #[test]
    fn counts_steps_questions_and_lease() {
        let workspace = TestWorkspace::new();
        let ctx = workspace.context();
        let plan = plan_response(vec![
            generated_step("s1", &["src/a.ts"], &[]),
            generated_step("s2", &["src/b.ts"], &[]),
            generated_step("s3", &["src/c.ts"], &[]),
        ])
        .to_plan(Some("todo".to_string()), "hash".to_string())
        .expect("plan");
        ctx.docs.write_plan(&plan).expect("write plan");
        let mut ledger = ProgressLedger::default();
        ledger.mark_completed("s1");
        ledger.mark_failed("s2");
        ctx.docs.write_progress(&ledger).expect("progress");
        ctx.questions.append(&["Which colors?".to_string()]).expect("question");
        let lock = LockManager::with_owner(
            &workspace.paths().lock_path,
            "engine-test",
            Duration::from_secs(300),
        );
        assert!(lock.acquire());

        let status = collect(workspace.root()).expect("status");
        assert_eq!(
            status.steps,
            StepCounts {
                total: 3,
                completed: 1,
                failed: 1,
            }
        );
        assert_eq!(status.app_name.as_deref(), Some("todo"));
        assert_eq!(status.open_questions, vec!["Which colors?".to_string()]);
        let lease = status.lease.as_ref().expect("lease");
        assert_eq!(lease.lease.owner, "engine-test");
        assert!(!lease.stale);

        let json = serde_json::to_value(&status).expect("json");
        assert_eq!(json["state"], "PLAN");
        assert_eq!(json["lease"]["owner"], "engine-test");
    }
}
