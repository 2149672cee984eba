//! `IMPLEMENT`: generate and commit each plan step.
//!
//! Retry policy per step:
//! - a correctable policy violation (forbidden type) is regenerated with a
//!   corrective instruction up to `max_policy_corrections` times;
//! - the same violation `repeat_threshold` times in a row escalates and halts;
//! - transient or I/O errors are retried; `repeat_threshold` identical
//!   failures mark the step skipped-complete, differing ones mark it failed.
//!
//! Isolation, validation, and budget failures fail the whole state.

use anyhow::Result;
use serde_json::json;
use tracing::{debug, info, instrument, warn};

use crate::agents::{Agent, AgentContext};
use crate::core::intent::{IntentDelta, IntentSnapshot, compute_intent_delta};
use crate::core::ledger::ProgressLedger;
use crate::core::path::normalize_app_path;
use crate::core::plan::{Plan, Step, validate_plan};
use crate::core::policy::{PolicyRules, PolicyValidator, PolicyViolation};
use crate::core::trace::TraceabilityLedger;
use crate::core::types::{ExecutionState, SpendCategory};
use crate::error::{EngineError, ErrorCategory};
use crate::io::audit::{AuditEvent, AuditKind};
use crate::io::context::{ContextLimits, select_context};
use crate::io::git::CommitOutcome;
use crate::io::llm::{CodeRequest, CodeResponse, FileAction, tokens_for_exchange};
use crate::io::transaction::{CommitSummary, FileOperation, FileTransaction};

#[derive(Debug, Default)]
pub struct ImplementAgent;

impl ImplementAgent {
    pub fn new() -> Self {
        Self
    }
}

/// Per-run settings shared by every step.
struct StepScope {
    app_name: String,
    app_prefix: String,
    validator: PolicyValidator,
    constraints: Vec<String>,
}

#[derive(Debug)]
enum StepOutcome {
    Completed(CommitSummary),
    Skipped(String),
    Failed(String),
}

impl Agent for ImplementAgent {
    fn name(&self) -> &'static str {
        "implement"
    }

    fn validate(&self, ctx: &AgentContext) -> Result<bool> {
        Ok(ctx.paths().plan_path.is_file())
    }

    #[instrument(skip_all)]
    fn execute(&mut self, ctx: &AgentContext) -> Result<ExecutionState> {
        ctx.wait_for_open_questions()?;
        let mut plan = ctx
            .docs
            .load_plan()?
            .ok_or_else(|| EngineError::Validation("no plan document".to_string()))?;
        let errors = validate_plan(&plan);
        if !errors.is_empty() {
            return Err(EngineError::Validation(format!("plan is malformed: {}", errors.join("; "))).into());
        }
        let app_name = plan
            .app_name
            .clone()
            .ok_or_else(|| EngineError::Validation("plan names no application".to_string()))?;

        let intent = ctx.docs.load_intent()?;
        let rules = ctx.docs.load_rules()?;
        let scope = StepScope {
            app_prefix: ctx.app_prefix(&app_name),
            app_name,
            constraints: constraints_from_rules(&rules),
            validator: PolicyValidator::new(rules)?,
        };
        let mut ledger = ctx.docs.load_progress()?;
        let mut trace = ctx.docs.load_traceability()?;

        if let Some(snapshot) = ctx.docs.load_snapshot()?
            && snapshot.intent_hash != intent.hash
        {
            let delta = compute_intent_delta(&snapshot.requirements, &intent.requirements);
            info!(%delta, "intent changed since the last implementation pass");
            reopen_changed_steps(ctx, &plan, &delta, &mut ledger)?;
        }

        for step in plan.steps() {
            if ledger.is_completed(&step.id) {
                debug!(step = %step.id, "already complete");
                continue;
            }
            if ledger.retry(&step.id) {
                ctx.audit.record(
                    AuditEvent::new(AuditKind::StepRetried, format!("retrying failed step {}", step.id))
                        .with_state(ExecutionState::Implement)
                        .with_details(json!({ "step": step.id })),
                );
            }
            ctx.wait_for_open_questions()?;

            match run_step(ctx, &scope, step)? {
                StepOutcome::Completed(summary) => {
                    ledger.mark_completed(&step.id);
                    trace.merge_step(&step.id, &summary.written, &step.requirements);
                    for deleted in &summary.deleted {
                        trace.forget_file(deleted);
                    }
                    ctx.docs.write_traceability(&trace)?;
                    commit_step(ctx, step, &summary);
                    info!(step = %step.id, written = summary.written.len(), "step complete");
                }
                StepOutcome::Skipped(reason) => {
                    warn!(step = %step.id, %reason, "step skipped after repeated failures");
                    ledger.mark_completed(&step.id);
                    ctx.audit.record(
                        AuditEvent::new(AuditKind::StepSkipped, reason)
                            .with_state(ExecutionState::Implement)
                            .with_details(json!({ "step": step.id })),
                    );
                }
                StepOutcome::Failed(reason) => {
                    warn!(step = %step.id, %reason, "step failed");
                    ledger.mark_failed(&step.id);
                    ctx.audit.record(
                        AuditEvent::new(AuditKind::StepFailed, reason)
                            .with_state(ExecutionState::Implement)
                            .with_details(json!({ "step": step.id })),
                    );
                }
            }
            ctx.docs.write_progress(&ledger)?;
        }

        plan.sync_checkboxes(|id| ledger.is_completed(id));
        ctx.docs.write_plan(&plan)?;

        let failed: Vec<&str> = plan
            .steps()
            .filter(|step| ledger.is_failed(&step.id))
            .map(|step| step.id.as_str())
            .collect();
        if !failed.is_empty() {
            return Err(EngineError::Validation(format!(
                "implementation incomplete, failed steps: {}",
                failed.join(", ")
            ))
            .into());
        }

        ctx.docs.write_snapshot(&IntentSnapshot::capture(&intent))?;
        info!(steps = plan.step_count(), "all steps complete");
        Ok(ExecutionState::Verify)
    }
}

/// Reopen completed steps that declare an added or changed requirement.
/// Steps whose requirements are all unchanged keep their ledger status.
fn reopen_changed_steps(
    ctx: &AgentContext,
    plan: &Plan,
    delta: &IntentDelta,
    ledger: &mut ProgressLedger,
) -> Result<()> {
    let changed = delta.touched();
    let mut reopened = 0;
    for step in plan.steps() {
        let touched: Vec<&String> = step
            .requirements
            .iter()
            .filter(|id| changed.contains(id.as_str()))
            .collect();
        if touched.is_empty() {
            continue;
        }
        if ledger.retry(&step.id) {
            reopened += 1;
            ctx.audit.record(
                AuditEvent::new(
                    AuditKind::StepRetried,
                    format!("requirements changed for step {}", step.id),
                )
                .with_state(ExecutionState::Implement)
                .with_details(json!({ "step": step.id, "requirements": touched })),
            );
        }
    }
    if reopened > 0 {
        ctx.docs.write_progress(ledger)?;
    }
    debug!(reopened, "incremental scope computed");
    Ok(())
}

fn run_step(ctx: &AgentContext, scope: &StepScope, step: &Step) -> Result<StepOutcome> {
    let threshold = ctx.config.implement.repeat_threshold.max(1) as usize;
    let max_corrections = ctx.config.implement.max_policy_corrections;
    let mut corrections = 0;
    let mut correction = None;
    let mut violations: Vec<String> = Vec::new();
    let mut failures: Vec<String> = Vec::new();

    loop {
        let err = match attempt_step(ctx, scope, step, correction.take()) {
            Ok(summary) => return Ok(StepOutcome::Completed(summary)),
            Err(err) => err,
        };
        let category = err
            .downcast_ref::<EngineError>()
            .map_or(ErrorCategory::Internal, EngineError::category);
        let violation = match err.downcast_ref::<EngineError>() {
            Some(EngineError::PolicyViolation(violation)) => Some(violation.clone()),
            _ => None,
        };

        match (category, violation) {
            (ErrorCategory::PolicyViolation, Some(violation)) => {
                ctx.audit.record(
                    AuditEvent::from_error(AuditKind::PolicyViolation, &err)
                        .with_state(ExecutionState::Implement),
                );
                violations.push(violation.signature());
                if repeats_tail(&violations, threshold) {
                    return Err(EngineError::Escalation {
                        step_id: step.id.clone(),
                        reason: format!("same policy violation {threshold} times: {violation}"),
                    }
                    .into());
                }
                if violation.violation_type.is_correctable() && corrections < max_corrections {
                    corrections += 1;
                    info!(step = %step.id, attempt = corrections, "regenerating with correction");
                    correction = Some(correction_text(&violation));
                    continue;
                }
                return Ok(StepOutcome::Failed(format!("{err:#}")));
            }
            (ErrorCategory::Transient | ErrorCategory::Internal, _) => {
                let message = format!("{err:#}");
                warn!(step = %step.id, err = %message, "step attempt failed");
                failures.push(message.clone());
                if failures.len() >= threshold {
                    return Ok(if repeats_tail(&failures, threshold) {
                        StepOutcome::Skipped(format!(
                            "step {} skipped after {threshold} identical failures: {message}",
                            step.id
                        ))
                    } else {
                        StepOutcome::Failed(message)
                    });
                }
            }
            _ => return Err(err),
        }
    }
}

fn attempt_step(
    ctx: &AgentContext,
    scope: &StepScope,
    step: &Step,
    correction: Option<String>,
) -> Result<CommitSummary> {
    ctx.budget.enforce_budget()?;
    let limits = ContextLimits {
        max_files: ctx.config.implement.context_max_files,
        max_bytes: ctx.config.implement.context_max_bytes,
    };
    let request = CodeRequest {
        app_name: scope.app_name.clone(),
        step: step.clone(),
        context_files: select_context(ctx.root(), &scope.app_prefix, step, limits)?,
        constraints: scope.constraints.clone(),
        correction,
    };
    let response = ctx.llm.generate_code(&request)?;
    ctx.spend(
        tokens_for_exchange(response.usage, &request, &response),
        SpendCategory::Code,
    )?;

    let operations = file_operations(ctx, &scope.app_prefix, step, &response)?;
    if operations.is_empty() {
        return Ok(CommitSummary::default());
    }
    let mut txn = FileTransaction::new(ctx.root(), &ctx.paths().backups_dir, Some(&scope.validator));
    for operation in operations {
        txn.add_operation(operation);
    }
    txn.commit()
}

/// Map generated files to transaction operations inside the app subtree.
fn file_operations(
    ctx: &AgentContext,
    app_prefix: &str,
    step: &Step,
    response: &CodeResponse,
) -> Result<Vec<FileOperation>> {
    if response.files.is_empty() && step.operation.touches_files() {
        return Err(EngineError::Transient(format!(
            "code generation returned no files for step {}",
            step.id
        ))
        .into());
    }
    let mut operations = Vec::with_capacity(response.files.len());
    for file in &response.files {
        let path = normalize_app_path(app_prefix, &file.path)?;
        let action = file.operation.unwrap_or_else(|| {
            if ctx.root().join(&path).exists() {
                FileAction::Modify
            } else {
                FileAction::Create
            }
        });
        let content = || {
            file.content.clone().ok_or_else(|| {
                EngineError::Validation(format!("generated file '{}' has no content", file.path))
            })
        };
        operations.push(match action {
            FileAction::Create => FileOperation::Create {
                path,
                content: content()?,
            },
            FileAction::Modify => FileOperation::Modify {
                path,
                content: content()?,
            },
            FileAction::Delete => FileOperation::Delete { path },
        });
    }
    Ok(operations)
}

/// Best effort: failures are logged and audited, never returned.
fn commit_step(ctx: &AgentContext, step: &Step, summary: &CommitSummary) {
    let files: Vec<String> = summary
        .written
        .iter()
        .chain(&summary.deleted)
        .cloned()
        .collect();
    if files.is_empty() {
        return;
    }
    let message = format!("{}: {}", step.id, step.description);
    match ctx.vcs.commit(&message, &files) {
        Ok(CommitOutcome::Committed(hash)) => {
            debug!(step = %step.id, %hash, "step committed");
            if ctx.config.vcs.push
                && let Err(err) = ctx.vcs.push(&ctx.config.vcs.remote)
            {
                warn!(err = %format!("{err:#}"), "push failed");
                ctx.audit.record(
                    AuditEvent::from_error(AuditKind::VcsFailed, &err)
                        .with_state(ExecutionState::Implement),
                );
            }
        }
        Ok(CommitOutcome::NoChanges) => debug!(step = %step.id, "nothing to commit"),
        Err(err) => {
            warn!(err = %format!("{err:#}"), "commit failed");
            ctx.audit.record(
                AuditEvent::from_error(AuditKind::VcsFailed, &err)
                    .with_state(ExecutionState::Implement)
                    .with_details(json!({ "step": step.id })),
            );
        }
    }
}

/// True when the last `n` entries exist and are all equal.
fn repeats_tail(history: &[String], n: usize) -> bool {
    if n == 0 || history.len() < n {
        return false;
    }
    let tail = &history[history.len() - n..];
    tail.iter().all(|entry| entry == &tail[0])
}

fn correction_text(violation: &PolicyViolation) -> String {
    let mut text = format!("Policy violation: {violation}.");
    if !violation.suggested_fix.is_empty() {
        text.push_str("\nSuggested fix: ");
        text.push_str(&violation.suggested_fix);
    }
    text
}

fn constraints_from_rules(rules: &PolicyRules) -> Vec<String> {
    let mut constraints = vec!["Write files only inside the application directory.".to_string()];
    for name in &rules.forbidden_types {
        constraints.push(format!("Never use the `{name}` type."));
    }
    for module in &rules.forbidden_imports {
        constraints.push(format!("Never import `{module}`."));
    }
    for pattern in &rules.security_patterns {
        constraints.push(format!("Avoid: {}.", pattern.message));
    }
    for rule in &rules.cleanup {
        constraints.push(format!(
            "Every `{}` needs a matching `{}`.",
            rule.acquire, rule.release
        ));
    }
    let guidance = rules.guidance.trim();
    if !guidance.is_empty() {
        constraints.push(guidance.to_string());
    }
    constraints
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repeat_detection_looks_at_the_tail() {
        let history: Vec<String> = ["a", "b", "b", "b"].iter().map(|s| s.to_string()).collect();
        assert!(repeats_tail(&history, 3));
        assert!(!repeats_tail(&history, 4));
        assert!(!repeats_tail(&history[..2], 3));
    }

    #[test]
    fn constraints_mention_every_rule() {
        let constraints = constraints_from_rules(&PolicyRules {
            forbidden_imports: vec!["lodash".to_string()],
            guidance: "Keep components small.".to_string(),
            ..PolicyRules::default()
        });
        assert!(constraints.iter().any(|c| c.contains("`any`")));
        assert!(constraints.iter().any(|c| c.contains("`lodash`")));
        assert!(constraints.iter().any(|c| c.contains("clearInterval")));
        assert_eq!(constraints.last().map(String::as_str), Some("Keep components small."));
    }

    #[test]
    fn completed_steps_are_never_regenerated() {
        use crate::test_support::{ScriptedLlm, TestWorkspace, code_response, plan_response, generated_step};

        let llm = ScriptedLlm::new();
        llm.push_code(code_response(&[("src/b.ts", "export const b = 2;\n")]));
        let workspace = TestWorkspace::with_llm(llm.clone());
        workspace.write_intent("# Goal\n\nBuild a counter app\n");
        let ctx = workspace.context();
        let plan = plan_response(vec![
            generated_step("s1", &["src/a.ts"], &[]),
            generated_step("s2", &["src/b.ts"], &[]),
        ])
        .to_plan(Some("counter".to_string()), "hash".to_string())
        .expect("plan");
        ctx.docs.write_plan(&plan).expect("write plan");
        let mut ledger = ProgressLedger::default();
        ledger.mark_completed("s1");
        ctx.docs.write_progress(&ledger).expect("progress");

        let next = ImplementAgent::new().execute(&ctx).expect("execute");
        assert_eq!(next, ExecutionState::Verify);
        let requests = llm.code_requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].step.id, "s2");
        assert!(workspace.root().join("apps/counter/src/b.ts").is_file());
        let plan = ctx.docs.load_plan().expect("load").expect("plan");
        assert!(plan.steps().all(|step| step.completed));
    }
}
