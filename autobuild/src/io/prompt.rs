//! Prompt rendering for the generation collaborator.
//!
//! Templates mark sections with `<!-- section:KEY required|droppable -->`.
//! When a rendered prompt exceeds the byte budget, droppable sections go
//! first, then the last section is truncated.

use std::sync::LazyLock;

use anyhow::Result;
use minijinja::{Environment, context};
use regex::Regex;
use tracing::debug;

use crate::io::llm::{ChatRequest, CodeRequest, PlanRequest};

const PLAN_TEMPLATE: &str = include_str!("prompts/plan.md");
const CODE_TEMPLATE: &str = include_str!("prompts/code.md");
const CHAT_TEMPLATE: &str = include_str!("prompts/chat.md");

/// Least important first.
const DROP_ORDER: &[&str] = &["previous", "history", "context", "intent"];

static SECTION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"<!--\s*section:(\w+)\s+(required|droppable)\s*-->")
        .expect("section marker pattern should compile")
});

pub struct PromptEngine {
    env: Environment<'static>,
    budget_bytes: usize,
}

impl PromptEngine {
    pub fn new(budget_bytes: usize) -> Self {
        let mut env = Environment::new();
        env.add_template("plan", PLAN_TEMPLATE)
            .expect("plan template should be valid");
        env.add_template("code", CODE_TEMPLATE)
            .expect("code template should be valid");
        env.add_template("chat", CHAT_TEMPLATE)
            .expect("chat template should be valid");
        Self { env, budget_bytes }
    }

    pub fn render_plan(&self, request: &PlanRequest) -> Result<String> {
        let template = self.env.get_template("plan")?;
        let rendered = template.render(context! {
            goal => request.goal.trim(),
            requirements => &request.requirements,
            forbidden_types => &request.rules.forbidden_types,
            forbidden_imports => &request.rules.forbidden_imports,
            guidance => non_empty(&request.rules.guidance),
            intent => request.intent.trim(),
            previous_plan => request.previous_plan.as_deref().and_then(non_empty),
        })?;
        Ok(self.fit(&rendered))
    }

    pub fn render_code(&self, request: &CodeRequest) -> Result<String> {
        let template = self.env.get_template("code")?;
        let rendered = template.render(context! {
            app_name => &request.app_name,
            step => &request.step,
            constraints => &request.constraints,
            correction => request.correction.as_deref().and_then(non_empty),
            context_files => &request.context_files,
        })?;
        Ok(self.fit(&rendered))
    }

    pub fn render_chat(&self, request: &ChatRequest) -> Result<String> {
        let template = self.env.get_template("chat")?;
        let rendered = template.render(context! {
            intent => request.intent.trim(),
            history => &request.history,
            message => request.message.trim(),
        })?;
        Ok(self.fit(&rendered))
    }

    fn fit(&self, rendered: &str) -> String {
        let mut sections = parse_sections(rendered);
        apply_budget(&mut sections, self.budget_bytes);
        sections
            .iter()
            .map(|section| section.content.as_str())
            .collect::<Vec<_>>()
            .join("\n\n")
    }
}

fn non_empty(text: &str) -> Option<&str> {
    let trimmed = text.trim();
    (!trimmed.is_empty()).then_some(trimmed)
}

#[derive(Debug, Clone)]
struct Section {
    key: String,
    required: bool,
    content: String,
}

fn parse_sections(rendered: &str) -> Vec<Section> {
    let markers: Vec<_> = SECTION_RE.captures_iter(rendered).collect();
    let mut sections = Vec::new();
    for (index, caps) in markers.iter().enumerate() {
        let (Some(whole), Some(key), Some(kind)) = (caps.get(0), caps.get(1), caps.get(2)) else {
            continue;
        };
        let end = markers
            .get(index + 1)
            .and_then(|next| next.get(0))
            .map_or(rendered.len(), |next| next.start());
        let content = rendered[whole.end()..end].trim().to_string();
        let required = kind.as_str() == "required";
        if !content.is_empty() || required {
            sections.push(Section {
                key: key.as_str().to_string(),
                required,
                content,
            });
        }
    }
    sections
}

fn apply_budget(sections: &mut Vec<Section>, budget: usize) {
    let total = |secs: &[Section]| -> usize { secs.iter().map(|s| s.content.len()).sum() };
    for key in DROP_ORDER {
        if total(sections) <= budget {
            return;
        }
        if let Some(index) = sections.iter().position(|s| s.key == *key && !s.required) {
            debug!(section = key, bytes = sections[index].content.len(), "dropped section for budget");
            sections.remove(index);
        }
    }
    if total(sections) <= budget {
        return;
    }
    let others: usize = sections
        .iter()
        .rev()
        .skip(1)
        .map(|s| s.content.len())
        .sum();
    let allowed = budget.saturating_sub(others);
    if let Some(last) = sections.last_mut()
        && last.content.len() > allowed
    {
        let mut cut = allowed.saturating_sub(12);
        while cut > 0 && !last.content.is_char_boundary(cut) {
            cut -= 1;
        }
        last.content.truncate(cut);
        last.content.push_str("\n[truncated]");
        debug!(section = %last.key, "truncated section for budget");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::intent::{Priority, Requirement};
    use crate::core::plan::Step;
    use crate::core::policy::PolicyRules;
    use crate::core::types::OperationKind;
    use crate::io::context::ContextFile;

    fn plan_request() -> PlanRequest {
        PlanRequest {
            intent: "# Goal\n\nTodo app".to_string(),
            goal: "Build a todo app".to_string(),
            requirements: vec![Requirement {
                id: "REQ-001".to_string(),
                description: "Add items".to_string(),
                priority: Priority::High,
            }],
            rules: PolicyRules {
                guidance: "Prefer small modules.".to_string(),
                ..PolicyRules::default()
            },
            previous_plan: None,
        }
    }

    #[test]
    fn plan_prompt_includes_requirements_and_rules() {
        let prompt = PromptEngine::new(100_000)
            .render_plan(&plan_request())
            .expect("render");
        assert!(prompt.contains("REQ-001 (high): Add items"));
        assert!(prompt.contains("Never use these types: any"));
        assert!(prompt.contains("Prefer small modules."));
        assert!(!prompt.contains("section:"));
        assert!(!prompt.contains("Previous plan"));
    }

    #[test]
    fn code_prompt_carries_correction_and_context() {
        let request = CodeRequest {
            app_name: "todo".to_string(),
            step: Step {
                id: "s1".to_string(),
                description: "Create the entry point".to_string(),
                operation: OperationKind::Create,
                files: vec!["src/index.ts".to_string()],
                requirements: vec!["REQ-001".to_string()],
                completed: false,
            },
            context_files: vec![ContextFile {
                path: "apps/todo/package.json".to_string(),
                content: "{}".to_string(),
            }],
            constraints: vec!["Never use `any`".to_string()],
            correction: Some("forbidden type `any` on line 3".to_string()),
        };
        let prompt = PromptEngine::new(100_000).render_code(&request).expect("render");
        assert!(prompt.contains("## Step `s1`"));
        assert!(prompt.contains("- operation: create"));
        assert!(prompt.contains("Correction required"));
        assert!(prompt.contains("### apps/todo/package.json"));
    }

    #[test]
    fn budget_drops_droppable_sections_first() {
        let mut request = plan_request();
        request.intent = "x".repeat(5_000);
        let prompt = PromptEngine::new(2_000).render_plan(&request).expect("render");
        assert!(!prompt.contains("## Intent document"));
        assert!(prompt.contains("## Goal"));
    }
}
