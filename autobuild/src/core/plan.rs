//! Plan model and its markdown codec.
//!
//! Phases are `##` headings and steps are checklist items
//! (`- [ ] step-id: description`) with optional indented metadata bullets.
//! The checkbox is cosmetic: completion truth lives in the progress ledger.

use std::collections::HashSet;
use std::fmt::Write as _;

use serde::{Deserialize, Serialize};

use crate::core::types::OperationKind;

const HASH_MARKER: &str = "intent-hash:";
const APP_MARKER: &str = "app:";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Step {
    pub id: String,
    pub description: String,
    pub operation: OperationKind,
    pub files: Vec<String>,
    #[serde(default)]
    pub requirements: Vec<String>,
    #[serde(default)]
    pub completed: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Phase {
    pub name: String,
    pub steps: Vec<Step>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Plan {
    pub app_name: Option<String>,
    pub intent_hash: Option<String>,
    pub phases: Vec<Phase>,
}

impl Plan {
    pub fn steps(&self) -> impl Iterator<Item = &Step> {
        self.phases.iter().flat_map(|phase| phase.steps.iter())
    }

    pub fn step_count(&self) -> usize {
        self.steps().count()
    }

    /// Mark the checkbox of each step whose id is in `completed`.
    pub fn sync_checkboxes(&mut self, completed: impl Fn(&str) -> bool) {
        for phase in &mut self.phases {
            for step in &mut phase.steps {
                step.completed = completed(&step.id);
            }
        }
    }
}

/// Check structural invariants not enforced by the parser.
///
/// Returns a list of human-readable errors (empty when valid).
pub fn validate_plan(plan: &Plan) -> Vec<String> {
    let mut errors = Vec::new();
    if plan.phases.is_empty() {
        errors.push("plan has no phases".to_string());
    }
    let mut seen = HashSet::new();
    for (index, phase) in plan.phases.iter().enumerate() {
        if phase.steps.is_empty() {
            errors.push(format!("phase {} ('{}') has no steps", index + 1, phase.name));
        }
        for step in &phase.steps {
            if step.id.trim().is_empty() {
                errors.push(format!("phase '{}' has a step with an empty id", phase.name));
                continue;
            }
            if step.id.contains(char::is_whitespace) {
                errors.push(format!("step id '{}' contains whitespace", step.id));
            }
            if !seen.insert(step.id.as_str()) {
                errors.push(format!("duplicate step id '{}'", step.id));
            }
            if step.operation.touches_files() && step.files.is_empty() {
                errors.push(format!(
                    "step '{}' ({}) names no target files",
                    step.id,
                    step.operation.as_str()
                ));
            }
        }
    }
    errors
}

/// Parse a plan document. Unknown lines are ignored.
pub fn parse_plan(contents: &str) -> Plan {
    let mut plan = Plan::default();
    let mut current_step: Option<Step> = None;

    for raw in contents.lines() {
        let line = raw.trim_end();
        let trimmed = line.trim();

        if let Some(comment) = trimmed
            .strip_prefix("<!--")
            .and_then(|rest| rest.strip_suffix("-->"))
        {
            let comment = comment.trim();
            if let Some(hash) = comment.strip_prefix(HASH_MARKER) {
                plan.intent_hash = non_empty(hash);
            } else if let Some(app) = comment.strip_prefix(APP_MARKER) {
                plan.app_name = non_empty(app);
            }
            continue;
        }

        if let Some(title) = trimmed.strip_prefix("# Plan:") {
            if plan.app_name.is_none() {
                plan.app_name = non_empty(title);
            }
            continue;
        }

        if let Some(heading) = trimmed.strip_prefix("## ") {
            flush_step(&mut plan, &mut current_step);
            plan.phases.push(Phase {
                name: phase_name(heading),
                steps: Vec::new(),
            });
            continue;
        }

        let indented = line.starts_with("  ") || line.starts_with('\t');
        if !indented && let Some((done, body)) = parse_checkbox(trimmed) {
            flush_step(&mut plan, &mut current_step);
            let (id, description) = match body.split_once(':') {
                Some((id, description)) => (id.trim().to_string(), description.trim().to_string()),
                None => (body.trim().to_string(), String::new()),
            };
            current_step = Some(Step {
                id,
                description,
                operation: OperationKind::Create,
                files: Vec::new(),
                requirements: Vec::new(),
                completed: done,
            });
            continue;
        }

        if indented
            && let Some(step) = current_step.as_mut()
            && let Some(meta) = trimmed.strip_prefix("- ")
            && let Some((key, value)) = meta.split_once(':')
        {
            apply_metadata(step, key.trim(), value.trim());
        }
    }
    flush_step(&mut plan, &mut current_step);
    plan
}

/// Render the canonical plan document.
pub fn render_plan(plan: &Plan) -> String {
    let mut buf = String::new();
    let title = plan.app_name.as_deref().unwrap_or("application");
    let _ = writeln!(buf, "# Plan: {title}\n");
    if let Some(hash) = &plan.intent_hash {
        let _ = writeln!(buf, "<!-- {HASH_MARKER} {hash} -->");
    }
    if let Some(app) = &plan.app_name {
        let _ = writeln!(buf, "<!-- {APP_MARKER} {app} -->");
    }
    for (index, phase) in plan.phases.iter().enumerate() {
        let _ = writeln!(buf, "\n## Phase {}: {}\n", index + 1, phase.name);
        for step in &phase.steps {
            let mark = if step.completed { 'x' } else { ' ' };
            let _ = writeln!(buf, "- [{mark}] {}: {}", step.id, step.description);
            let _ = writeln!(buf, "  - operation: {}", step.operation.as_str());
            if !step.files.is_empty() {
                let _ = writeln!(buf, "  - files: {}", step.files.join(", "));
            }
            if !step.requirements.is_empty() {
                let _ = writeln!(buf, "  - requirements: {}", step.requirements.join(", "));
            }
        }
    }
    buf
}

fn flush_step(plan: &mut Plan, step: &mut Option<Step>) {
    let Some(step) = step.take() else {
        return;
    };
    if plan.phases.is_empty() {
        plan.phases.push(Phase {
            name: "Implementation".to_string(),
            steps: Vec::new(),
        });
    }
    if let Some(phase) = plan.phases.last_mut() {
        phase.steps.push(step);
    }
}

fn parse_checkbox(line: &str) -> Option<(bool, &str)> {
    let rest = line.strip_prefix("- [").or_else(|| line.strip_prefix("* ["))?;
    let mut chars = rest.chars();
    let mark = chars.next()?;
    let body = chars.as_str().strip_prefix(']')?;
    Some((matches!(mark, 'x' | 'X'), body.trim()))
}

fn apply_metadata(step: &mut Step, key: &str, value: &str) {
    match key.to_ascii_lowercase().as_str() {
        "operation" | "type" => {
            if let Ok(kind) = value.parse() {
                step.operation = kind;
            }
        }
        "files" | "file" => step.files = split_list(value),
        "requirements" | "requirement" | "reqs" => step.requirements = split_list(value),
        _ => {}
    }
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|item| item.trim().trim_matches('`').to_string())
        .filter(|item| !item.is_empty())
        .collect()
}

fn phase_name(heading: &str) -> String {
    let heading = heading.trim();
    if let Some(rest) = heading.strip_prefix("Phase")
        && let Some((_, name)) = rest.split_once(':')
    {
        return name.trim().to_string();
    }
    heading.to_string()
}

fn non_empty(value: &str) -> Option<String> {
    let value = value.trim();
    (!value.is_empty()).then(|| value.to_string())
}
