//! Generation collaborator: request/response types, retry, and the
//! subprocess-backed client.
//!
//! The client pipes a rendered prompt to a configured command (stdin), takes
//! the last top-level JSON object from its stdout, and validates it against
//! the embedded schema for that request kind.

use std::path::PathBuf;
use std::process::Command;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use jsonschema::Validator;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use crate::core::budget::estimate_tokens;
use crate::core::intent::Requirement;
use crate::core::plan::{Phase, Plan, Step};
use crate::core::policy::PolicyRules;
use crate::core::types::OperationKind;
use crate::error::{EngineError, ErrorCategory};
use crate::io::config::LlmConfig;
use crate::io::context::ContextFile;
use crate::io::process::run_command_with_timeout;
use crate::io::prompt::PromptEngine;

/// Environment variable carrying the configured model name to the command.
pub const MODEL_ENV: &str = "AUTOBUILD_MODEL";

const PROMPT_BUDGET_BYTES: usize = 400_000;

const PLAN_SCHEMA: &str = include_str!(concat!(
    env!("CARGO_MANIFEST_DIR"),
    "/schemas/plan.schema.json"
));
const CODE_SCHEMA: &str = include_str!(concat!(
    env!("CARGO_MANIFEST_DIR"),
    "/schemas/code.schema.json"
));
const CHAT_SCHEMA: &str = include_str!(concat!(
    env!("CARGO_MANIFEST_DIR"),
    "/schemas/chat.schema.json"
));

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenUsage {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
}

impl TokenUsage {
    pub fn total(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }
}

/// Tokens for one exchange: reported usage, else 4 characters per token
/// over the serialized request and response.
pub fn tokens_for_exchange(
    usage: Option<TokenUsage>,
    request: &impl Serialize,
    response: &impl Serialize,
) -> u64 {
    if let Some(usage) = usage {
        return usage.total();
    }
    estimate_tokens(json_len(request) + json_len(response))
}

fn json_len<T: Serialize + ?Sized>(value: &T) -> usize {
    serde_json::to_string(value).map_or(0, |text| text.len())
}

#[derive(Debug, Clone, Serialize)]
pub struct PlanRequest {
    pub intent: String,
    pub goal: String,
    pub requirements: Vec<Requirement>,
    pub rules: PolicyRules,
    pub previous_plan: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeneratedStep {
    pub id: String,
    pub description: String,
    #[serde(default)]
    pub operation: Option<String>,
    #[serde(default)]
    pub files: Vec<String>,
    #[serde(default)]
    pub requirements: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeneratedPhase {
    pub name: String,
    pub steps: Vec<GeneratedStep>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanResponse {
    pub phases: Vec<GeneratedPhase>,
    #[serde(default)]
    pub usage: Option<TokenUsage>,
}

impl PlanResponse {
    /// Convert to a plan. A step without an operation creates its files, or
    /// verifies when it lists none.
    pub fn to_plan(&self, app_name: Option<String>, intent_hash: String) -> Result<Plan> {
        let mut phases = Vec::with_capacity(self.phases.len());
        for phase in &self.phases {
            let mut steps = Vec::with_capacity(phase.steps.len());
            for step in &phase.steps {
                let operation = match step.operation.as_deref() {
                    Some(op) => op.parse::<OperationKind>().map_err(|_| {
                        EngineError::Validation(format!(
                            "step '{}' has unknown operation '{op}'",
                            step.id
                        ))
                    })?,
                    None if step.files.is_empty() => OperationKind::Verify,
                    None => OperationKind::Create,
                };
                steps.push(Step {
                    id: step.id.trim().to_string(),
                    description: step.description.trim().to_string(),
                    operation,
                    files: step.files.clone(),
                    requirements: step.requirements.clone(),
                    completed: false,
                });
            }
            phases.push(Phase {
                name: phase.name.trim().to_string(),
                steps,
            });
        }
        Ok(Plan {
            app_name,
            intent_hash: Some(intent_hash),
            phases,
        })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CodeRequest {
    pub app_name: String,
    pub step: Step,
    pub context_files: Vec<ContextFile>,
    pub constraints: Vec<String>,
    /// Feedback from a rejected attempt.
    pub correction: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileAction {
    Create,
    Modify,
    Delete,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeneratedFile {
    pub path: String,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub operation: Option<FileAction>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CodeResponse {
    pub files: Vec<GeneratedFile>,
    #[serde(default)]
    pub explanation: String,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub usage: Option<TokenUsage>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatTurn {
    pub role: String,
    pub content: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChatRequest {
    pub intent: String,
    pub history: Vec<ChatTurn>,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatResponse {
    pub response: String,
    #[serde(default)]
    pub suggested_intent: Option<String>,
    #[serde(default)]
    pub questions: Vec<String>,
    #[serde(default)]
    pub usage: Option<TokenUsage>,
}

/// The generation collaborator.
pub trait LlmClient: Send + Sync {
    fn generate_plan(&self, request: &PlanRequest) -> Result<PlanResponse>;
    fn generate_code(&self, request: &CodeRequest) -> Result<CodeResponse>;
    fn chat(&self, request: &ChatRequest) -> Result<ChatResponse>;
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff_base: Duration,
}

impl RetryPolicy {
    pub fn from_config(cfg: &LlmConfig) -> Self {
        Self {
            max_attempts: cfg.max_attempts.max(1),
            backoff_base: Duration::from_millis(cfg.backoff_base_ms),
        }
    }

    /// Exponential: base, 2*base, 4*base, ...
    pub fn delay(&self, attempt: u32) -> Duration {
        self.backoff_base
            .saturating_mul(2u32.saturating_pow(attempt))
    }
}

fn is_retryable(err: &anyhow::Error) -> bool {
    err.downcast_ref::<EngineError>()
        .is_none_or(|engine| engine.category() == ErrorCategory::Transient)
}

/// Run `op` until it succeeds or attempts run out.
///
/// Typed engine errors other than `Transient` are returned immediately.
/// Exhaustion yields `EngineError::Transient` naming the last failure.
pub fn with_retry<T>(
    policy: &RetryPolicy,
    label: &str,
    mut op: impl FnMut() -> Result<T>,
) -> Result<T> {
    let attempts = policy.max_attempts.max(1);
    let mut last = None;
    for attempt in 0..attempts {
        match op() {
            Ok(value) => return Ok(value),
            Err(err) if !is_retryable(&err) => return Err(err),
            Err(err) => {
                warn!(label, attempt = attempt + 1, attempts, err = %format!("{err:#}"), "attempt failed");
                last = Some(err);
                if attempt + 1 < attempts {
                    thread::sleep(policy.delay(attempt));
                }
            }
        }
    }
    let detail = last.map(|err| format!("{err:#}")).unwrap_or_default();
    Err(EngineError::Transient(format!("{label} failed after {attempts} attempts: {detail}")).into())
}

struct Schemas {
    plan: Validator,
    code: Validator,
    chat: Validator,
}

impl Schemas {
    fn compile() -> Result<Self> {
        let compile = |name: &str, text: &str| -> Result<Validator> {
            let value: Value =
                serde_json::from_str(text).with_context(|| format!("parse {name} schema"))?;
            jsonschema::validator_for(&value)
                .map_err(|err| anyhow!("invalid {name} schema: {err}"))
        };
        Ok(Self {
            plan: compile("plan", PLAN_SCHEMA)?,
            code: compile("code", CODE_SCHEMA)?,
            chat: compile("chat", CHAT_SCHEMA)?,
        })
    }
}

/// Runs the configured command once per request.
pub struct CommandLlmClient {
    command: Vec<String>,
    workdir: PathBuf,
    timeout: Duration,
    output_limit: usize,
    retry: RetryPolicy,
    plan_model: Option<String>,
    code_model: Option<String>,
    chat_model: Option<String>,
    prompts: PromptEngine,
    schemas: Schemas,
}

impl CommandLlmClient {
    pub fn new(workdir: impl Into<PathBuf>, cfg: &LlmConfig) -> Result<Self> {
        if cfg.command.is_empty() {
            return Err(anyhow!("llm.command must name a program"));
        }
        Ok(Self {
            command: cfg.command.clone(),
            workdir: workdir.into(),
            timeout: Duration::from_secs(cfg.timeout_secs),
            output_limit: cfg.output_limit_bytes,
            retry: RetryPolicy::from_config(cfg),
            plan_model: cfg.plan_model.clone(),
            code_model: cfg.code_model.clone(),
            chat_model: cfg.chat_model.clone(),
            prompts: PromptEngine::new(PROMPT_BUDGET_BYTES),
            schemas: Schemas::compile()?,
        })
    }

    /// One attempt. Usage the command did not report is estimated from the
    /// prompt and output sizes.
    fn invoke<T: DeserializeOwned + Metered>(
        &self,
        kind: &str,
        prompt: &str,
        model: Option<&str>,
        schema: &Validator,
    ) -> Result<T> {
        let mut cmd = Command::new(&self.command[0]);
        cmd.args(&self.command[1..]).current_dir(&self.workdir);
        if let Some(model) = model {
            cmd.env(MODEL_ENV, model);
        }
        let output =
            run_command_with_timeout(cmd, Some(prompt.as_bytes()), self.timeout, self.output_limit)?;
        if output.timed_out {
            return Err(EngineError::Transient(format!(
                "{kind} generation timed out after {}s",
                self.timeout.as_secs()
            ))
            .into());
        }
        if !output.status.success() {
            return Err(EngineError::Transient(format!(
                "{kind} generation exited with {:?}: {}",
                output.status.code(),
                output.stderr_tail(400)
            ))
            .into());
        }

        let stdout = output.stdout_text();
        let value = extract_json(&stdout).ok_or_else(|| {
            EngineError::Transient(format!("{kind} generation returned no JSON object"))
        })?;
        let messages: Vec<String> = schema.iter_errors(&value).map(|e| e.to_string()).collect();
        if !messages.is_empty() {
            return Err(EngineError::Transient(format!(
                "{kind} output failed schema validation: {}",
                messages.join("; ")
            ))
            .into());
        }
        let mut parsed: T = serde_json::from_value(value).map_err(|err| {
            EngineError::Transient(format!("{kind} output did not decode: {err}"))
        })?;
        let estimated = estimate_tokens(prompt.len() + stdout.len());
        debug!(kind, stdout_bytes = stdout.len(), estimated, "generation output accepted");
        parsed.usage_mut().get_or_insert(TokenUsage {
            input_tokens: estimated,
            output_tokens: 0,
        });
        Ok(parsed)
    }
}

/// Responses that carry optional token usage.
trait Metered {
    fn usage_mut(&mut self) -> &mut Option<TokenUsage>;
}

impl Metered for PlanResponse {
    fn usage_mut(&mut self) -> &mut Option<TokenUsage> {
        &mut self.usage
    }
}

impl Metered for CodeResponse {
    fn usage_mut(&mut self) -> &mut Option<TokenUsage> {
        &mut self.usage
    }
}

impl Metered for ChatResponse {
    fn usage_mut(&mut self) -> &mut Option<TokenUsage> {
        &mut self.usage
    }
}

impl LlmClient for CommandLlmClient {
    #[instrument(skip_all, fields(requirements = request.requirements.len()))]
    fn generate_plan(&self, request: &PlanRequest) -> Result<PlanResponse> {
        let prompt = self.prompts.render_plan(request)?;
        with_retry(&self.retry, "plan generation", || {
            let response: PlanResponse =
                self.invoke("plan", &prompt, self.plan_model.as_deref(), &self.schemas.plan)?;
            info!(phases = response.phases.len(), "plan generated");
            Ok(response)
        })
    }

    #[instrument(skip_all, fields(step = %request.step.id))]
    fn generate_code(&self, request: &CodeRequest) -> Result<CodeResponse> {
        let prompt = self.prompts.render_code(request)?;
        with_retry(&self.retry, "code generation", || {
            let response: CodeResponse =
                self.invoke("code", &prompt, self.code_model.as_deref(), &self.schemas.code)?;
            info!(files = response.files.len(), "code generated");
            Ok(response)
        })
    }

    #[instrument(skip_all)]
    fn chat(&self, request: &ChatRequest) -> Result<ChatResponse> {
        let prompt = self.prompts.render_chat(request)?;
        with_retry(&self.retry, "chat", || {
            self.invoke("chat", &prompt, self.chat_model.as_deref(), &self.schemas.chat)
        })
    }
}

/// Last top-level JSON object in `text`, tolerating surrounding log lines
/// and code fences.
pub fn extract_json(text: &str) -> Option<Value> {
    let trimmed = text.trim();
    if let Ok(value) = serde_json::from_str::<Value>(trimmed)
        && value.is_object()
    {
        return Some(value);
    }
    let mut found = None;
    let mut index = 0;
    while let Some(offset) = trimmed[index..].find('{') {
        let start = index + offset;
        let mut stream = serde_json::Deserializer::from_str(&trimmed[start..]).into_iter::<Value>();
        match stream.next() {
            Some(Ok(value)) if value.is_object() => {
                found = Some(value);
                index = start + stream.byte_offset();
            }
            _ => index = start + 1,
        }
    }
    found
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use super::*;

    fn quick() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            backoff_base: Duration::ZERO,
        }
    }

    #[test]
    fn extracts_last_object_after_logs() {
        let text = "thinking... {not json}\nresult:\n```json\n{\"a\": {\"b\": 1}}\n```\n{\"final\": true}\n";
        assert_eq!(extract_json(text), Some(serde_json::json!({"final": true})));
        assert_eq!(extract_json("no objects here"), None);
        assert_eq!(
            extract_json("  {\"whole\": [1, 2]}  "),
            Some(serde_json::json!({"whole": [1, 2]}))
        );
    }

    #[test]
    fn retries_transient_failures_until_success() {
        let calls = Cell::new(0);
        let value = with_retry(&quick(), "op", || {
            calls.set(calls.get() + 1);
            if calls.get() < 3 {
                Err(EngineError::Transient("flaky".to_string()).into())
            } else {
                Ok(7)
            }
        })
        .expect("third attempt succeeds");
        assert_eq!(value, 7);
        assert_eq!(calls.get(), 3);
    }

    #[test]
    fn exhaustion_is_transient() {
        let err = with_retry::<()>(&quick(), "op", || Err(anyhow!("io broke"))).unwrap_err();
        let engine = err.downcast_ref::<EngineError>().expect("typed");
        assert_eq!(engine.category(), ErrorCategory::Transient);
        assert!(err.to_string().contains("after 3 attempts"));
    }

    #[test]
    fn typed_failures_are_not_retried() {
        let calls = Cell::new(0);
        let err = with_retry::<()>(&quick(), "op", || {
            calls.set(calls.get() + 1);
            Err(EngineError::Validation("bad".to_string()).into())
        })
        .unwrap_err();
        assert_eq!(calls.get(), 1);
        assert!(matches!(
            err.downcast_ref::<EngineError>(),
            Some(EngineError::Validation(_))
        ));
    }

    #[test]
    fn backoff_doubles() {
        let policy = RetryPolicy {
            max_attempts: 3,
            backoff_base: Duration::from_millis(100),
        };
        assert_eq!(policy.delay(0), Duration::from_millis(100));
        assert_eq!(policy.delay(2), Duration::from_millis(400));
    }

    #[test]
    fn plan_response_defaults_operations() {
        let response: PlanResponse = serde_json::from_value(serde_json::json!({
            "phases": [{"name": "Setup", "steps": [
                {"id": "s1", "description": "Scaffold", "files": ["src/index.ts"]},
                {"id": "s2", "description": "Check", "files": []}
            ]}]
        }))
        .expect("decode");
        let plan = response
            .to_plan(Some("todo".to_string()), "abc".to_string())
            .expect("plan");
        let ops: Vec<_> = plan.steps().map(|s| s.operation).collect();
        assert_eq!(ops, vec![OperationKind::Create, OperationKind::Verify]);
        assert_eq!(plan.intent_hash.as_deref(), Some("abc"));
    }

    #[test]
    fn unknown_operation_is_a_validation_error() {
        let response = PlanResponse {
            phases: vec![GeneratedPhase {
                name: "P".to_string(),
                steps: vec![GeneratedStep {
                    id: "s1".to_string(),
                    description: "x".to_string(),
                    operation: Some("explode".to_string()),
                    files: vec![],
                    requirements: vec![],
                }],
            }],
            usage: None,
        };
        let err = response.to_plan(None, "h".to_string()).unwrap_err();
        assert!(err.to_string().contains("unknown operation"));
    }

    #[test]
    fn exchange_tokens_prefer_reported_usage() {
        let usage = TokenUsage {
            input_tokens: 10,
            output_tokens: 5,
        };
        assert_eq!(tokens_for_exchange(Some(usage), &"abc", &"def"), 15);
        // "\"abcd\"" is 6 chars twice -> 12 / 4
        assert_eq!(tokens_for_exchange(None, &"abcd", &"abcd"), 3);
    }

    #[cfg(unix)]
    #[test]
    fn command_client_reads_scripted_output() {
        let cfg = LlmConfig {
            command: vec![
                "sh".to_string(),
                "-c".to_string(),
                "cat >/dev/null; echo 'log line'; echo '{\"response\":\"hi\",\"questions\":[\"why?\"]}'"
                    .to_string(),
            ],
            max_attempts: 1,
            ..LlmConfig::default()
        };
        let dir = tempfile::tempdir().expect("tempdir");
        let client = CommandLlmClient::new(dir.path(), &cfg).expect("client");
        let response = client
            .chat(&ChatRequest {
                intent: "# Goal\n\nx".to_string(),
                history: vec![],
                message: "hello".to_string(),
            })
            .expect("chat");
        assert_eq!(response.response, "hi");
        assert_eq!(response.questions, vec!["why?".to_string()]);
        assert!(response.usage.is_some_and(|u| u.total() > 0));
    }

    #[cfg(unix)]
    #[test]
    fn schema_mismatch_is_transient() {
        let cfg = LlmConfig {
            command: vec![
                "sh".to_string(),
                "-c".to_string(),
                "cat >/dev/null; echo '{\"answer\": 1}'".to_string(),
            ],
            max_attempts: 2,
            backoff_base_ms: 0,
            ..LlmConfig::default()
        };
        let dir = tempfile::tempdir().expect("tempdir");
        let client = CommandLlmClient::new(dir.path(), &cfg).expect("client");
        let err = client
            .chat(&ChatRequest {
                intent: String::new(),
                history: vec![],
                message: "hello".to_string(),
            })
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<EngineError>(),
            Some(EngineError::Transient(_))
        ));
    }
}
