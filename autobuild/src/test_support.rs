//! Test-only collaborators and workspace fixtures.

use std::collections::VecDeque;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::{Result, anyhow};
use tempfile::TempDir;

use crate::agents::{AgentContext, default_registry};
use crate::cancel::CancelToken;
use crate::core::types::ExecutionState;
use crate::engine::Engine;
use crate::error::EngineError;
use crate::io::checks::{CheckOutcome, CheckRunner};
use crate::io::config::{EngineConfig, write_config};
use crate::io::git::{CommitOutcome, NoopVcs, VersionControl};
use crate::io::init::{ControlPaths, InitOptions, init_control};
use crate::io::llm::{
    ChatRequest, ChatResponse, CodeRequest, CodeResponse, FileAction, GeneratedFile,
    GeneratedPhase, GeneratedStep, LlmClient, PlanRequest, PlanResponse,
};
use crate::io::state_store::StateStore;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Default)]
struct Script {
    plans: VecDeque<PlanResponse>,
    code: VecDeque<Result<CodeResponse, String>>,
    chats: VecDeque<ChatResponse>,
    plan_requests: Vec<PlanRequest>,
    code_requests: Vec<CodeRequest>,
    chat_requests: Vec<ChatRequest>,
}

/// An [`LlmClient`] that replays queued responses and records requests.
///
/// Clones share the same script, so a test can keep a handle after giving
/// one to the workspace.
#[derive(Clone, Default)]
pub struct ScriptedLlm {
    script: Arc<Mutex<Script>>,
}

impl ScriptedLlm {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_plan(&self, response: PlanResponse) {
        lock(&self.script).plans.push_back(response);
    }

    pub fn push_code(&self, response: CodeResponse) {
        lock(&self.script).code.push_back(Ok(response));
    }

    /// Queue a transient generation failure.
    pub fn push_code_error(&self, message: &str) {
        lock(&self.script).code.push_back(Err(message.to_string()));
    }

    pub fn push_chat(&self, response: ChatResponse) {
        lock(&self.script).chats.push_back(response);
    }

    pub fn plan_calls(&self) -> usize {
        lock(&self.script).plan_requests.len()
    }

    pub fn code_calls(&self) -> usize {
        lock(&self.script).code_requests.len()
    }

    pub fn code_requests(&self) -> Vec<CodeRequest> {
        lock(&self.script).code_requests.clone()
    }

    pub fn chat_requests(&self) -> Vec<ChatRequest> {
        lock(&self.script).chat_requests.clone()
    }

    /// Panics if any queued response was never requested.
    pub fn assert_drained(&self) {
        let script = lock(&self.script);
        assert!(script.plans.is_empty(), "{} plan responses left", script.plans.len());
        assert!(script.code.is_empty(), "{} code responses left", script.code.len());
        assert!(script.chats.is_empty(), "{} chat responses left", script.chats.len());
    }
}

impl LlmClient for ScriptedLlm {
    fn generate_plan(&self, request: &PlanRequest) -> Result<PlanResponse> {
        let mut script = lock(&self.script);
        script.plan_requests.push(request.clone());
        script
            .plans
            .pop_front()
            .ok_or_else(|| anyhow!("no scripted plan response"))
    }

    fn generate_code(&self, request: &CodeRequest) -> Result<CodeResponse> {
        let mut script = lock(&self.script);
        script.code_requests.push(request.clone());
        match script.code.pop_front() {
            Some(Ok(response)) => Ok(response),
            Some(Err(message)) => Err(EngineError::Transient(message).into()),
            None => Err(anyhow!("no scripted code response for step {}", request.step.id)),
        }
    }

    fn chat(&self, request: &ChatRequest) -> Result<ChatResponse> {
        let mut script = lock(&self.script);
        script.chat_requests.push(request.clone());
        script
            .chats
            .pop_front()
            .ok_or_else(|| anyhow!("no scripted chat response"))
    }
}

/// Records commit requests instead of running git.
#[derive(Clone, Default)]
pub struct RecordingVcs {
    commits: Arc<Mutex<Vec<(String, Vec<String>)>>>,
    fail_commits: bool,
}

impl RecordingVcs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every commit returns an error.
    pub fn failing() -> Self {
        Self {
            fail_commits: true,
            ..Self::default()
        }
    }

    pub fn commits(&self) -> Vec<(String, Vec<String>)> {
        lock(&self.commits).clone()
    }
}

impl VersionControl for RecordingVcs {
    fn commit(&self, message: &str, files: &[String]) -> Result<CommitOutcome> {
        if self.fail_commits {
            return Err(anyhow!("git commit failed: scripted"));
        }
        let mut commits = lock(&self.commits);
        commits.push((message.to_string(), files.to_vec()));
        Ok(CommitOutcome::Committed(format!("{:040x}", commits.len())))
    }

    fn push(&self, _remote: &str) -> Result<()> {
        Ok(())
    }

    fn add_remote(&self, _name: &str, _url: &str) -> Result<()> {
        Ok(())
    }

    fn remote_url(&self, _name: &str) -> Result<Option<String>> {
        Ok(None)
    }

    fn head(&self) -> Result<Option<String>> {
        let count = lock(&self.commits).len();
        Ok((count > 0).then(|| format!("{count:040x}")))
    }
}

/// A [`CheckRunner`] with a fixed result per check name.
#[derive(Debug, Clone, Default)]
pub struct StaticCheckRunner {
    failures: Vec<(String, String)>,
}

impl StaticCheckRunner {
    pub fn passing() -> Self {
        Self::default()
    }

    pub fn failing(name: &str, summary: &str) -> Self {
        Self {
            failures: vec![(name.to_string(), summary.to_string())],
        }
    }
}

impl CheckRunner for StaticCheckRunner {
    fn run_check(&self, name: &str, _command: &[String], _workdir: &Path) -> Result<CheckOutcome> {
        let failure = self.failures.iter().find(|(failing, _)| failing == name);
        Ok(CheckOutcome {
            passed: failure.is_none(),
            summary: failure.map_or_else(|| "ok".to_string(), |(_, summary)| summary.clone()),
            log_path: None,
        })
    }
}

pub fn generated_step(id: &str, files: &[&str], requirements: &[&str]) -> GeneratedStep {
    GeneratedStep {
        id: id.to_string(),
        description: format!("{id} description"),
        operation: None,
        files: files.iter().map(|file| file.to_string()).collect(),
        requirements: requirements.iter().map(|req| req.to_string()).collect(),
    }
}

/// Single-phase plan response.
pub fn plan_response(steps: Vec<GeneratedStep>) -> PlanResponse {
    PlanResponse {
        phases: vec![GeneratedPhase {
            name: "Build".to_string(),
            steps,
        }],
        usage: None,
    }
}

/// Response creating each `(path, content)` pair.
pub fn code_response(files: &[(&str, &str)]) -> CodeResponse {
    CodeResponse {
        files: files
            .iter()
            .map(|(path, content)| GeneratedFile {
                path: path.to_string(),
                content: Some(content.to_string()),
                operation: Some(FileAction::Create),
            })
            .collect(),
        explanation: "generated".to_string(),
        ..CodeResponse::default()
    }
}

/// Config with short poll intervals and no version control.
pub fn fast_config() -> EngineConfig {
    let mut config = EngineConfig::default();
    config.poll_interval_ms = 10;
    config.question_poll_interval_ms = 20;
    config.llm.backoff_base_ms = 0;
    config.vcs.enabled = false;
    config
}

/// An initialized project root in a temporary directory.
pub struct TestWorkspace {
    temp: TempDir,
    paths: ControlPaths,
    config: EngineConfig,
    llm: Arc<dyn LlmClient>,
    vcs: Arc<dyn VersionControl>,
    checks: Arc<dyn CheckRunner>,
    cancel: CancelToken,
}

impl TestWorkspace {
    pub fn new() -> Self {
        Self::with_llm(ScriptedLlm::new())
    }

    pub fn with_llm(llm: impl LlmClient + 'static) -> Self {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = init_control(temp.path(), &InitOptions { force: false }).expect("init");
        let config = fast_config();
        write_config(&paths.config_path, &config).expect("write config");
        Self {
            temp,
            paths,
            config,
            llm: Arc::new(llm),
            vcs: Arc::new(NoopVcs),
            checks: Arc::new(StaticCheckRunner::passing()),
            cancel: CancelToken::new(),
        }
    }

    pub fn root(&self) -> &Path {
        self.temp.path()
    }

    pub fn paths(&self) -> &ControlPaths {
        &self.paths
    }

    pub fn config_mut(&mut self) -> &mut EngineConfig {
        &mut self.config
    }

    /// Write the in-memory config to `config.toml`.
    pub fn persist_config(&self) {
        write_config(&self.paths.config_path, &self.config).expect("write config");
    }

    pub fn set_checks(&mut self, checks: impl CheckRunner + 'static) {
        self.checks = Arc::new(checks);
    }

    pub fn set_vcs(&mut self, vcs: impl VersionControl + 'static) {
        self.vcs = Arc::new(vcs);
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn write_intent(&self, contents: &str) {
        fs::write(&self.paths.intent_path, contents).expect("write intent");
    }

    /// Write a root-relative file, creating parent directories.
    pub fn write_file(&self, rel: &str, contents: &str) -> PathBuf {
        let path = self.root().join(rel);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).expect("create parent");
        }
        fs::write(&path, contents).expect("write file");
        path
    }

    pub fn read_file(&self, rel: &str) -> String {
        fs::read_to_string(self.root().join(rel)).expect("read file")
    }

    pub fn state_store(&self) -> StateStore {
        StateStore::new(&self.paths.state_path)
    }

    pub fn set_state(&self, state: ExecutionState) {
        self.state_store().write_external(state).expect("write state");
    }

    pub fn state(&self) -> ExecutionState {
        self.state_store().read().expect("read state")
    }

    pub fn context(&self) -> AgentContext {
        AgentContext::new(
            self.paths.clone(),
            self.config.clone(),
            Arc::clone(&self.llm),
            Arc::clone(&self.vcs),
            Arc::clone(&self.checks),
            self.cancel.clone(),
        )
    }

    pub fn engine(&self) -> Engine {
        Engine::new(self.context(), default_registry())
    }
}

impl Default for TestWorkspace {
    fn default() -> Self {
        Self::new()
    }
}
