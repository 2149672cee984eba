//! `VERIFY`: run the check battery and write `report.md`.
//!
//! Any failing check moves to `FAIL`, never back to `PLAN`.

use std::fs;

use anyhow::Result;
use chrono::Utc;
use tracing::{info, instrument, warn};
use walkdir::WalkDir;

use crate::agents::{Agent, AgentContext};
use crate::core::intent::ParsedIntent;
use crate::core::ledger::ProgressLedger;
use crate::core::plan::Plan;
use crate::core::policy::PolicyValidator;
use crate::core::trace::TraceabilityLedger;
use crate::core::types::ExecutionState;
use crate::error::EngineError;
use crate::io::context::SKIPPED_DIRS;
use crate::io::report::{CheckResult, CheckStatus, VerificationReport, write_report};

/// Cap on the names listed in one check's detail.
const DETAIL_LIMIT: usize = 10;

#[derive(Debug, Default)]
pub struct VerifyAgent;

impl VerifyAgent {
    pub fn new() -> Self {
        Self
    }
}

impl Agent for VerifyAgent {
    fn name(&self) -> &'static str {
        "verify"
    }

    fn validate(&self, ctx: &AgentContext) -> Result<bool> {
        Ok(ctx.paths().plan_path.is_file())
    }

    #[instrument(skip_all)]
    fn execute(&mut self, ctx: &AgentContext) -> Result<ExecutionState> {
        ctx.wait_for_open_questions()?;
        let plan = ctx
            .docs
            .load_plan()?
            .ok_or_else(|| EngineError::Validation("no plan document".to_string()))?;
        let intent = ctx.docs.load_intent()?;
        let ledger = ctx.docs.load_progress()?;
        let trace = ctx.docs.load_traceability()?;
        let validator = PolicyValidator::new(ctx.docs.load_rules()?)?;

        let mut checks = vec![
            plan_completeness(&plan, &ledger),
            requirement_traceability(&intent, &trace),
            structure(ctx, &trace),
        ];
        match &plan.app_name {
            Some(app) => {
                checks.push(rules(ctx, app, &validator));
                checks.push(command_check(ctx, app, "types", ctx.config.verify.type_check_command.as_deref())?);
                checks.push(command_check(ctx, app, "build", ctx.config.verify.build_command.as_deref())?);
            }
            None => {
                for name in ["rules", "types", "build"] {
                    checks.push(CheckResult::new(name, CheckStatus::Fail, "plan names no application"));
                }
            }
        }

        let report = VerificationReport {
            generated_at: Utc::now(),
            app_name: plan.app_name.clone(),
            checks,
        };
        write_report(&ctx.paths().report_path, &report)?;
        for check in report.checks.iter().filter(|check| !check.status.is_passing()) {
            warn!(check = %check.name, detail = %check.detail, "check failed");
        }

        let next = if report.passed() {
            ExecutionState::Done
        } else {
            ExecutionState::Fail
        };
        info!(next = %next, "verification finished");
        Ok(next)
    }
}

fn plan_completeness(plan: &Plan, ledger: &ProgressLedger) -> CheckResult {
    let pending: Vec<&str> = plan
        .steps()
        .filter(|step| !ledger.is_completed(&step.id))
        .map(|step| step.id.as_str())
        .collect();
    if pending.is_empty() {
        CheckResult::new(
            "plan_completeness",
            CheckStatus::Pass,
            format!("{} steps complete", plan.step_count()),
        )
    } else {
        CheckResult::new(
            "plan_completeness",
            CheckStatus::Fail,
            format!("incomplete steps: {}", summarize(&pending)),
        )
    }
}

fn requirement_traceability(intent: &ParsedIntent, trace: &TraceabilityLedger) -> CheckResult {
    if intent.requirements.is_empty() {
        return CheckResult::new(
            "requirement_traceability",
            CheckStatus::Skip,
            "intent declares no requirements",
        );
    }
    let uncovered = trace.uncovered(intent.requirements.iter().map(|req| req.id.as_str()));
    if uncovered.is_empty() {
        CheckResult::new(
            "requirement_traceability",
            CheckStatus::Pass,
            format!("{} requirements traced to files", intent.requirements.len()),
        )
    } else {
        let ids: Vec<&str> = uncovered.iter().map(String::as_str).collect();
        CheckResult::new(
            "requirement_traceability",
            CheckStatus::Fail,
            format!("requirements without files: {}", summarize(&ids)),
        )
    }
}

fn structure(ctx: &AgentContext, trace: &TraceabilityLedger) -> CheckResult {
    let missing: Vec<&str> = trace
        .files
        .keys()
        .filter(|file| !ctx.root().join(file.as_str()).is_file())
        .map(String::as_str)
        .collect();
    if missing.is_empty() {
        CheckResult::new(
            "structure",
            CheckStatus::Pass,
            format!("{} traced files present", trace.files.len()),
        )
    } else {
        CheckResult::new(
            "structure",
            CheckStatus::Fail,
            format!("missing files: {}", summarize(&missing)),
        )
    }
}

/// Re-validate every file under the application directory.
fn rules(ctx: &AgentContext, app_name: &str, validator: &PolicyValidator) -> CheckResult {
    let app_dir = ctx.app_dir(app_name);
    if !app_dir.is_dir() {
        return CheckResult::new("rules", CheckStatus::Skip, "application directory not created");
    }
    let mut scanned = 0usize;
    let mut findings = Vec::new();
    let walker = WalkDir::new(&app_dir)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|entry| {
            !(entry.file_type().is_dir()
                && SKIPPED_DIRS.iter().any(|skip| entry.file_name() == *skip))
        });
    for entry in walker.filter_map(|entry| entry.ok()) {
        if !entry.file_type().is_file() {
            continue;
        }
        let Ok(content) = fs::read_to_string(entry.path()) else {
            continue;
        };
        let relative = entry
            .path()
            .strip_prefix(ctx.root())
            .unwrap_or(entry.path())
            .to_string_lossy()
            .replace('\\', "/");
        scanned += 1;
        findings.extend(
            validator
                .check_all(&relative, &content)
                .into_iter()
                .map(|violation| violation.to_string()),
        );
    }
    if findings.is_empty() {
        CheckResult::new("rules", CheckStatus::Pass, format!("{scanned} files clean"))
    } else {
        let shown: Vec<&str> = findings.iter().map(String::as_str).collect();
        CheckResult::new("rules", CheckStatus::Fail, summarize(&shown))
    }
}

fn command_check(
    ctx: &AgentContext,
    app_name: &str,
    name: &str,
    command: Option<&[String]>,
) -> Result<CheckResult> {
    let Some(command) = command.filter(|command| !command.is_empty()) else {
        return Ok(CheckResult::new(name, CheckStatus::Skip, "no command configured"));
    };
    let app_dir = ctx.app_dir(app_name);
    if !app_dir.is_dir() {
        return Ok(CheckResult::new(name, CheckStatus::Fail, "application directory missing"));
    }
    let outcome = ctx.checks.run_check(name, command, &app_dir)?;
    let status = if outcome.passed {
        CheckStatus::Pass
    } else {
        CheckStatus::Fail
    };
    Ok(CheckResult::new(name, status, outcome.summary))
}

fn summarize(items: &[&str]) -> String {
    let mut text = items
        .iter()
        .take(DETAIL_LIMIT)
        .copied()
        .collect::<Vec<_>>()
        .join(", ");
    if items.len() > DETAIL_LIMIT {
        text.push_str(&format!(" (+{} more)", items.len() - DETAIL_LIMIT));
    }
    text
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::plan::{Phase, Step};
    use crate::core::types::OperationKind;
    use crate::test_support::{StaticCheckRunner, TestWorkspace};

    const INTENT: &str = "# Goal\n\nBuild a todo list app\n\n## Requirements\n\n- Add items\n";

    fn one_step_plan() -> Plan {
        Plan {
            app_name: Some("todo".to_string()),
            intent_hash: None,
            phases: vec![Phase {
                name: "Build".to_string(),
                steps: vec![Step {
                    id: "s1".to_string(),
                    description: "entry point".to_string(),
                    operation: OperationKind::Create,
                    files: vec!["src/index.ts".to_string()],
                    requirements: vec!["REQ-001".to_string()],
                    completed: false,
                }],
            }],
        }
    }

    fn seed_completed(workspace: &TestWorkspace, content: &str) {
        let ctx = workspace.context();
        ctx.docs.write_plan(&one_step_plan()).expect("plan");
        let mut ledger = ProgressLedger::default();
        ledger.mark_completed("s1");
        ctx.docs.write_progress(&ledger).expect("progress");
        let mut trace = TraceabilityLedger::default();
        trace.record_file("apps/todo/src/index.ts", "s1", &["REQ-001".to_string()]);
        ctx.docs.write_traceability(&trace).expect("trace");
        workspace.write_file("apps/todo/src/index.ts", content);
    }

    #[test]
    fn clean_workspace_passes_to_done() {
        let workspace = TestWorkspace::new();
        workspace.write_intent(INTENT);
        seed_completed(&workspace, "export const items: string[] = [];\n");
        let ctx = workspace.context();

        let next = VerifyAgent::new().execute(&ctx).expect("verify");
        assert_eq!(next, ExecutionState::Done);
        let report = std::fs::read_to_string(&ctx.paths().report_path).expect("report");
        assert!(report.contains("Result: PASS"));
        assert!(report.contains("| types | SKIP |"));
    }

    #[test]
    fn policy_finding_fails_the_rules_check() {
        let workspace = TestWorkspace::new();
        workspace.write_intent(INTENT);
        seed_completed(&workspace, "export const items: any[] = [];\n");
        let ctx = workspace.context();

        let next = VerifyAgent::new().execute(&ctx).expect("verify");
        assert_eq!(next, ExecutionState::Fail);
        let report = std::fs::read_to_string(&ctx.paths().report_path).expect("report");
        assert!(report.contains("| rules | FAIL |"));
    }

    #[test]
    fn configured_command_check_uses_the_runner() {
        let mut workspace = TestWorkspace::new();
        workspace.config_mut().verify.build_command = Some(vec!["npm".to_string(), "run".to_string(), "build".to_string()]);
        workspace.set_checks(StaticCheckRunner::failing("build", "exit Some(1)"));
        workspace.write_intent(INTENT);
        seed_completed(&workspace, "export const items: string[] = [];\n");
        let ctx = workspace.context();

        let next = VerifyAgent::new().execute(&ctx).expect("verify");
        assert_eq!(next, ExecutionState::Fail);
        let report = std::fs::read_to_string(&ctx.paths().report_path).expect("report");
        assert!(report.contains("| build | FAIL | exit Some(1) |"));
    }

    #[test]
    fn incomplete_and_untraced_work_fails() {
        let workspace = TestWorkspace::new();
        workspace.write_intent(INTENT);
        let ctx = workspace.context();
        ctx.docs.write_plan(&one_step_plan()).expect("plan");

        let plan = one_step_plan();
        let check = plan_completeness(&plan, &ProgressLedger::default());
        assert_eq!(check.status, CheckStatus::Fail);
        let intent = ctx.docs.load_intent().expect("intent");
        let check = requirement_traceability(&intent, &TraceabilityLedger::default());
        assert_eq!(check.status, CheckStatus::Fail);
        assert!(check.detail.contains("REQ-001"));
    }

    #[test]
    fn long_lists_are_capped() {
        let ids: Vec<String> = (0..12).map(|i| format!("s{i}")).collect();
        let refs: Vec<&str> = ids.iter().map(String::as_str).collect();
        assert!(summarize(&refs).ends_with("(+2 more)"));
    }
}
