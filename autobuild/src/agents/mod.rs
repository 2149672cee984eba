//! State handlers for `PLAN`, `IMPLEMENT`, and `VERIFY`.
//!
//! The engine owns one [`AgentContext`] and creates a fresh agent from the
//! [`AgentRegistry`] for every execution. An agent returns the state the
//! engine should write next; it never writes the state store itself.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Result;
use serde_json::json;
use tracing::info;

use crate::cancel::CancelToken;
use crate::core::types::{ExecutionState, SpendCategory};
use crate::error::EngineError;
use crate::io::audit::{AuditEvent, AuditKind, AuditLog};
use crate::io::budget::BudgetService;
use crate::io::checks::CheckRunner;
use crate::io::config::EngineConfig;
use crate::io::documents::Documents;
use crate::io::git::VersionControl;
use crate::io::init::ControlPaths;
use crate::io::llm::LlmClient;
use crate::io::questions::QuestionsDoc;

pub mod implement;
pub mod plan;
pub mod verify;

pub use implement::ImplementAgent;
pub use plan::PlanAgent;
pub use verify::VerifyAgent;

/// Lifecycle shared by every state handler.
///
/// `on_enter` and `on_exit` are best-effort: the engine logs their errors
/// and carries on. Only `execute` failures fail the state.
pub trait Agent {
    fn name(&self) -> &'static str;

    fn on_enter(&mut self, _ctx: &AgentContext) -> Result<()> {
        Ok(())
    }

    /// Preconditions checked before `execute`.
    fn validate(&self, _ctx: &AgentContext) -> Result<bool> {
        Ok(true)
    }

    /// Do the state's work and return the next state.
    fn execute(&mut self, ctx: &AgentContext) -> Result<ExecutionState>;

    fn on_exit(&mut self, _ctx: &AgentContext) -> Result<()> {
        Ok(())
    }
}

/// Collaborators and documents available to every agent.
pub struct AgentContext {
    pub config: EngineConfig,
    pub docs: Documents,
    pub budget: BudgetService,
    pub audit: AuditLog,
    pub questions: QuestionsDoc,
    pub llm: Arc<dyn LlmClient>,
    pub vcs: Arc<dyn VersionControl>,
    pub checks: Arc<dyn CheckRunner>,
    pub cancel: CancelToken,
}

impl AgentContext {
    pub fn new(
        paths: ControlPaths,
        config: EngineConfig,
        llm: Arc<dyn LlmClient>,
        vcs: Arc<dyn VersionControl>,
        checks: Arc<dyn CheckRunner>,
        cancel: CancelToken,
    ) -> Self {
        Self {
            budget: BudgetService::new(&paths.budget_path, config.budget.clone()),
            audit: AuditLog::new(&paths.audit_path),
            questions: QuestionsDoc::new(&paths.questions_path),
            docs: Documents::new(paths),
            config,
            llm,
            vcs,
            checks,
            cancel,
        }
    }

    pub fn paths(&self) -> &ControlPaths {
        self.docs.paths()
    }

    pub fn root(&self) -> &Path {
        &self.paths().root
    }

    /// Root-relative directory holding the generated application.
    pub fn app_prefix(&self, app_name: &str) -> String {
        format!(
            "{}/{}",
            self.config.workspace.apps_dir.trim_end_matches('/'),
            app_name
        )
    }

    pub fn app_dir(&self, app_name: &str) -> PathBuf {
        self.root().join(self.app_prefix(app_name))
    }

    /// Record spend and audit a newly crossed warning threshold.
    pub fn spend(&self, tokens: u64, category: SpendCategory) -> Result<()> {
        let update = self.budget.track_usage(tokens, category)?;
        if update.crossed_warning {
            let limit = self.budget.config().max_tokens_per_project;
            self.audit.record(
                AuditEvent::new(
                    AuditKind::BudgetWarning,
                    format!(
                        "token usage {} reached the warning threshold of {limit}",
                        update.state.tokens_used.total
                    ),
                )
                .with_details(json!({
                    "used": update.state.tokens_used.total,
                    "limit": limit,
                    "threshold": self.budget.config().warning_threshold,
                })),
            );
        }
        Ok(())
    }

    /// Block until every question in `questions.md` is answered.
    ///
    /// Polls at `question_poll_interval_ms`; cancellation ends the wait with
    /// [`EngineError::Cancelled`].
    pub fn wait_for_open_questions(&self) -> Result<()> {
        let mut announced = false;
        loop {
            let open = self.questions.open_questions()?;
            if open.is_empty() {
                if announced {
                    info!("open questions answered, resuming");
                }
                return Ok(());
            }
            if !announced {
                info!(open = open.len(), "waiting for open questions to be answered");
                announced = true;
            }
            if !self.cancel.sleep(self.config.question_poll_interval()) {
                return Err(EngineError::Cancelled(
                    "stopped while waiting for open questions".to_string(),
                )
                .into());
            }
        }
    }
}

pub type AgentFactory = Box<dyn Fn() -> Box<dyn Agent> + Send + Sync>;

/// Maps each active state to the factory for its handler.
#[derive(Default)]
pub struct AgentRegistry {
    factories: HashMap<ExecutionState, AgentFactory>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        state: ExecutionState,
        factory: impl Fn() -> Box<dyn Agent> + Send + Sync + 'static,
    ) {
        self.factories.insert(state, Box::new(factory));
    }

    pub fn with(
        mut self,
        state: ExecutionState,
        factory: impl Fn() -> Box<dyn Agent> + Send + Sync + 'static,
    ) -> Self {
        self.register(state, factory);
        self
    }

    pub fn create(&self, state: ExecutionState) -> Option<Box<dyn Agent>> {
        self.factories.get(&state).map(|factory| factory())
    }

    pub fn is_registered(&self, state: ExecutionState) -> bool {
        self.factories.contains_key(&state)
    }
}

/// Plan, Implement, and Verify handlers.
pub fn default_registry() -> AgentRegistry {
    AgentRegistry::new()
        .with(ExecutionState::Plan, || Box::new(PlanAgent::new()))
        .with(ExecutionState::Implement, || Box::new(ImplementAgent::new()))
        .with(ExecutionState::Verify, || Box::new(VerifyAgent::new()))
}
