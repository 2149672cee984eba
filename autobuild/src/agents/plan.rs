//! `PLAN`: turn the intent document into a phased plan.

use anyhow::Result;
use chrono::Utc;
use serde_json::json;
use tracing::{info, instrument, warn};

use crate::agents::{Agent, AgentContext};
use crate::core::intent::{IntentSnapshot, ParsedIntent, content_overlap, derive_app_name};
use crate::core::ledger::ProgressLedger;
use crate::core::plan::{Plan, parse_plan, validate_plan};
use crate::core::trace::TraceabilityLedger;
use crate::core::types::{ExecutionState, SpendCategory};
use crate::error::EngineError;
use crate::io::audit::{AuditEvent, AuditKind};
use crate::io::llm::{PlanRequest, tokens_for_exchange};

#[derive(Debug, Default)]
pub struct PlanAgent;

impl PlanAgent {
    pub fn new() -> Self {
        Self
    }
}

/// Why an existing plan can be kept, if it can.
fn reuse_reason(plan: &Plan, plan_text: &str, intent: &ParsedIntent, threshold: f64) -> Option<String> {
    if !validate_plan(plan).is_empty() || plan.app_name.is_none() {
        return None;
    }
    if plan.intent_hash.as_deref() == Some(intent.hash.as_str()) {
        return Some("plan references the current intent hash".to_string());
    }
    let overlap = content_overlap(&intent_text(intent), plan_text);
    (overlap >= threshold).then(|| format!("plan covers {:.0}% of the intent", overlap * 100.0))
}

fn intent_text(intent: &ParsedIntent) -> String {
    let mut text = intent.goal.clone();
    for requirement in &intent.requirements {
        text.push('\n');
        text.push_str(&requirement.description);
    }
    text.push('\n');
    text.push_str(&intent.body);
    text
}

impl Agent for PlanAgent {
    fn name(&self) -> &'static str {
        "plan"
    }

    fn validate(&self, ctx: &AgentContext) -> Result<bool> {
        if !ctx.paths().intent_path.is_file() {
            warn!("intent document missing");
            return Ok(false);
        }
        let intent = ctx.docs.load_intent()?;
        Ok(!intent.goal.is_empty() || !intent.requirements.is_empty())
    }

    #[instrument(skip_all)]
    fn execute(&mut self, ctx: &AgentContext) -> Result<ExecutionState> {
        ctx.wait_for_open_questions()?;
        let intent = ctx.docs.load_intent()?;
        let rules = ctx.docs.load_rules()?;

        let previous_text = ctx.docs.load_plan_text()?;
        let previous = previous_text.as_deref().map(parse_plan);
        if let (Some(plan), Some(text)) = (&previous, &previous_text)
            && let Some(reason) =
                reuse_reason(plan, text, &intent, ctx.config.plan.overlap_threshold)
        {
            info!(%reason, "keeping existing plan");
            return Ok(ExecutionState::Implement);
        }

        ctx.budget.enforce_budget()?;
        let request = PlanRequest {
            intent: intent.body.clone(),
            goal: intent.goal.clone(),
            requirements: intent.requirements.clone(),
            rules,
            previous_plan: previous_text.clone(),
        };
        let response = ctx.llm.generate_plan(&request)?;
        ctx.spend(
            tokens_for_exchange(response.usage, &request, &response),
            SpendCategory::Plan,
        )?;

        let app_name = previous
            .and_then(|plan| plan.app_name)
            .unwrap_or_else(|| derive_app_name(&intent.goal, Utc::now()));
        let plan = response.to_plan(Some(app_name.clone()), intent.hash.clone())?;
        let errors = validate_plan(&plan);
        if !errors.is_empty() {
            return Err(EngineError::Validation(format!(
                "generated plan is malformed: {}",
                errors.join("; ")
            ))
            .into());
        }

        ctx.docs.write_plan(&plan)?;
        ctx.docs.write_snapshot(&IntentSnapshot::capture(&intent))?;
        ctx.docs.write_progress(&ProgressLedger::default())?;
        ctx.docs.write_traceability(&TraceabilityLedger::default())?;

        let estimate = ctx.budget.estimate_project(&plan);
        if estimate.exceeds_budget {
            warn!(
                estimated = estimate.estimated_tokens,
                limit = ctx.budget.config().max_tokens_per_project,
                "project estimate exceeds the token budget"
            );
        }
        ctx.audit.record(
            AuditEvent::new(
                AuditKind::ProjectEstimate,
                format!(
                    "{} steps, about {} tokens",
                    estimate.steps, estimate.estimated_tokens
                ),
            )
            .with_state(ExecutionState::Plan)
            .with_details(json!(estimate)),
        );
        info!(app = %app_name, phases = plan.phases.len(), steps = plan.step_count(), "plan written");
        Ok(ExecutionState::Implement)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::llm::{GeneratedPhase, GeneratedStep, PlanResponse};
    use crate::test_support::{ScriptedLlm, TestWorkspace, generated_step, plan_response};

    const INTENT: &str = "# Goal\n\nBuild a todo list app\n\n## Requirements\n\n- Add items\n- Remove items\n";

    #[test]
    fn generates_plan_snapshot_and_estimate() {
        let llm = ScriptedLlm::new();
        llm.push_plan(plan_response(vec![generated_step("s1", &["src/index.ts"], &["REQ-001"])]));
        let workspace = TestWorkspace::with_llm(llm.clone());
        workspace.write_intent(INTENT);
        let ctx = workspace.context();

        let mut agent = PlanAgent::new();
        assert!(agent.validate(&ctx).expect("validate"));
        let next = agent.execute(&ctx).expect("execute");
        assert_eq!(next, ExecutionState::Implement);

        let plan = ctx.docs.load_plan().expect("load").expect("plan");
        assert_eq!(plan.app_name.as_deref(), Some("todo-list"));
        let intent = ctx.docs.load_intent().expect("intent");
        assert_eq!(plan.intent_hash.as_deref(), Some(intent.hash.as_str()));
        let snapshot = ctx.docs.load_snapshot().expect("snapshot").expect("present");
        assert_eq!(snapshot.requirements.len(), 2);
        assert!(ctx.budget.load().expect("budget").tokens_used.plan > 0);
        let kinds: Vec<_> = ctx.audit.events().expect("events").iter().map(|e| e.kind).collect();
        assert!(kinds.contains(&AuditKind::ProjectEstimate));
        llm.assert_drained();
    }

    #[test]
    fn skips_generation_when_plan_matches_intent_hash() {
        let llm = ScriptedLlm::new();
        llm.push_plan(plan_response(vec![generated_step("s1", &["src/index.ts"], &[])]));
        let workspace = TestWorkspace::with_llm(llm.clone());
        workspace.write_intent(INTENT);
        let ctx = workspace.context();

        PlanAgent::new().execute(&ctx).expect("first run");
        let next = PlanAgent::new().execute(&ctx).expect("second run");
        assert_eq!(next, ExecutionState::Implement);
        assert_eq!(llm.plan_calls(), 1);
    }

    #[test]
    fn malformed_plan_is_a_validation_failure() {
        let llm = ScriptedLlm::new();
        llm.push_plan(PlanResponse {
            phases: vec![GeneratedPhase {
                name: "Build".to_string(),
                steps: vec![GeneratedStep {
                    id: "s1".to_string(),
                    description: "write code".to_string(),
                    operation: Some("create".to_string()),
                    files: vec![],
                    requirements: vec![],
                }],
            }],
            usage: None,
        });
        let workspace = TestWorkspace::with_llm(llm);
        workspace.write_intent(INTENT);
        let ctx = workspace.context();

        let err = PlanAgent::new().execute(&ctx).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<EngineError>(),
            Some(EngineError::Validation(_))
        ));
        assert!(ctx.docs.load_plan().expect("load").is_none());
    }

    #[test]
    fn placeholder_intent_fails_validation() {
        let workspace = TestWorkspace::new();
        workspace.write_intent("# Intent\n\n");
        let ctx = workspace.context();
        assert!(!PlanAgent::new().validate(&ctx).expect("validate"));
    }

    #[test]
    fn overlap_reuse_requires_a_valid_named_plan() {
        let intent = crate::core::intent::parse_intent(INTENT).expect("intent");
        let text = "# Plan: todo\n\n## Phase 1: Build\n\n- [ ] s1: todo list items add remove\n  - files: src/a.ts\n";
        let mut plan = parse_plan(text);
        plan.app_name = Some("todo".to_string());
        assert!(reuse_reason(&plan, text, &intent, 0.5).is_some());
        plan.app_name = None;
        assert!(reuse_reason(&plan, text, &intent, 0.5).is_none());
    }
}
