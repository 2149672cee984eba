use std::time::Duration;

use autobuild::core::types::ExecutionState;
use autobuild::io::audit::{AuditKind, JsonLines, Outcome, ProvenanceRecord};
use autobuild::io::atomic::write_json;
use autobuild::io::lock::{Lease, LockManager};
use chrono::Utc;
use autobuild::test_support::{
    RecordingVcs, ScriptedLlm, TestWorkspace, code_response, generated_step, plan_response,
};

const INTENT: &str = "# Goal\n\nBuild a todo list app\n\n## Requirements\n\n- Add items\n- Remove items\n";

fn script_todo(llm: &ScriptedLlm) {
    llm.push_plan(plan_response(vec![
        generated_step("s1", &["src/store.ts"], &["REQ-001"]),
        generated_step("s2", &["src/index.ts"], &["REQ-002"]),
    ]));
    llm.push_code(code_response(&[(
        "src/store.ts",
        "export const items: string[] = [];\n\nexport function add(item: string): void {\n  items.push(item);\n}\n",
    )]));
    llm.push_code(code_response(&[(
        "src/index.ts",
        "import { items } from './store';\n\nexport function remove(index: number): void {\n  items.splice(index, 1);\n}\n",
    )]));
}

fn audit_kinds(workspace: &TestWorkspace) -> Vec<AuditKind> {
    workspace
        .context()
        .audit
        .events()
        .expect("events")
        .into_iter()
        .map(|event| event.kind)
        .collect()
}

#[test]
fn intent_runs_through_to_done() {
    let llm = ScriptedLlm::new();
    script_todo(&llm);
    let mut workspace = TestWorkspace::with_llm(llm.clone());
    let vcs = RecordingVcs::new();
    workspace.set_vcs(vcs.clone());
    workspace.write_intent(INTENT);

    let final_state = workspace.engine().run(true).expect("run");
    assert_eq!(final_state, ExecutionState::Done);
    llm.assert_drained();

    assert!(workspace.root().join("apps/todo-list/src/store.ts").is_file());
    assert!(workspace.root().join("apps/todo-list/src/index.ts").is_file());
    let plan = workspace.read_file(".autobuild/plan.md");
    assert!(plan.contains("[x]"), "{plan}");
    assert!(!plan.contains("[ ]"), "{plan}");
    let report = workspace.read_file(".autobuild/report.md");
    assert!(report.contains("Result: PASS"), "{report}");

    let commits = vcs.commits();
    assert_eq!(commits.len(), 2);
    assert_eq!(commits[0].1, vec!["apps/todo-list/src/store.ts".to_string()]);

    let records: Vec<ProvenanceRecord> = JsonLines::new(&workspace.paths().provenance_path)
        .read_all()
        .expect("provenance");
    let states: Vec<_> = records.iter().map(|record| record.state).collect();
    assert_eq!(
        states,
        [
            ExecutionState::Plan,
            ExecutionState::Implement,
            ExecutionState::Verify
        ]
    );
    assert!(records.iter().all(|record| record.outcome == Outcome::Success));
    assert!(records[2].git_commit.is_some(), "verify ran after commits");

    let budget = workspace.context().budget.load().expect("budget");
    assert!(budget.tokens_used.plan > 0);
    assert!(budget.tokens_used.code > 0);
}

#[test]
fn restart_after_done_skips_completed_work() {
    let llm = ScriptedLlm::new();
    script_todo(&llm);
    let workspace = TestWorkspace::with_llm(llm.clone());
    workspace.write_intent(INTENT);
    assert_eq!(workspace.engine().run(true).expect("run"), ExecutionState::Done);
    let before = workspace.read_file("apps/todo-list/src/store.ts");

    workspace.set_state(ExecutionState::Plan);
    assert_eq!(workspace.engine().run(true).expect("rerun"), ExecutionState::Done);

    assert_eq!(llm.plan_calls(), 1, "plan reused for an unchanged intent");
    assert_eq!(llm.code_calls(), 2, "completed steps are not regenerated");
    assert_eq!(workspace.read_file("apps/todo-list/src/store.ts"), before);
}

#[test]
fn abandoned_lease_is_recovered_at_startup() {
    let llm = ScriptedLlm::new();
    script_todo(&llm);
    let workspace = TestWorkspace::with_llm(llm);
    workspace.write_intent(INTENT);
    let crashed = LockManager::with_owner(
        &workspace.paths().lock_path,
        "engine-crashed",
        Duration::from_secs(300),
    );
    let abandoned = Lease {
        owner: "engine-crashed".to_string(),
        acquired_at: Utc::now() - chrono::Duration::minutes(30),
    };
    write_json(&workspace.paths().lock_path, &abandoned).expect("write lease");

    assert_eq!(workspace.engine().run(true).expect("run"), ExecutionState::Done);
    assert!(audit_kinds(&workspace).contains(&AuditKind::CrashDetected));
    assert!(crashed.read_lease().is_none());
}

#[test]
fn changed_requirement_reopens_only_its_step() {
    let llm = ScriptedLlm::new();
    script_todo(&llm);
    let mut workspace = TestWorkspace::with_llm(llm.clone());
    // Keep the existing plan across the intent edit.
    workspace.config_mut().plan.overlap_threshold = 0.0;
    workspace.write_intent(INTENT);
    assert_eq!(workspace.engine().run(true).expect("run"), ExecutionState::Done);

    workspace.write_intent(
        "# Goal\n\nBuild a todo list app\n\n## Requirements\n\n- Add items\n- Remove items by index\n",
    );
    llm.push_code(code_response(&[(
        "src/index.ts",
        "import { items } from './store';\n\nexport function remove(index: number): void {\n  if (index >= 0) {\n    items.splice(index, 1);\n  }\n}\n",
    )]));
    workspace.set_state(ExecutionState::Plan);
    assert_eq!(workspace.engine().run(true).expect("rerun"), ExecutionState::Done);

    assert_eq!(llm.plan_calls(), 1);
    let requests = llm.code_requests();
    assert_eq!(requests.len(), 3);
    assert_eq!(requests[2].step.id, "s2");
    assert!(workspace.read_file("apps/todo-list/src/index.ts").contains("index >= 0"));
    assert!(audit_kinds(&workspace).contains(&AuditKind::StepRetried));
    llm.assert_drained();
}
