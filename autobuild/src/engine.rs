//! The execution engine: watches the state store, queues transitions, and
//! runs one agent at a time under the lease.
//!
//! Each [`Engine::tick`] observes the persisted state, then processes at
//! most one queued transition. [`Engine::run`] repeats ticks with an idle
//! poll until cancelled (or until a terminal state, on request).

use std::path::Path;
use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use rand::Rng;
use rand::distributions::Alphanumeric;
use serde_json::json;
use tracing::{debug, error, info, instrument, warn};

use crate::agents::{Agent, AgentContext, AgentRegistry, default_registry};
use crate::cancel::CancelToken;
use crate::core::queue::ExecutionQueue;
use crate::core::types::{Execution, ExecutionState};
use crate::error::{EngineError, ErrorCategory, categorize};
use crate::io::audit::{AuditEvent, AuditKind, JsonLines, ProvenanceRecord};
use crate::io::checkpoint::{CheckpointStore, ProgressCounters};
use crate::io::checks::CommandCheckRunner;
use crate::io::config::load_config;
use crate::io::git::{VersionControl, version_control_for};
use crate::io::init::ControlPaths;
use crate::io::llm::CommandLlmClient;
use crate::io::lock::LockManager;
use crate::io::report::{FailureSection, append_failure};
use crate::io::state_store::StateStore;
use crate::recovery::{CrashReport, recover_on_startup};

/// What one tick did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    /// Nothing queued (or a worker is already busy).
    Idle,
    /// Another owner holds the lease; the request was re-queued.
    Contended,
    Executed {
        state: ExecutionState,
        next: ExecutionState,
    },
    /// Cancelled at a suspension point; the state is left for the next run.
    Interrupted { state: ExecutionState },
    /// The agent failed and the store was forced to `FAIL`.
    Failed {
        state: ExecutionState,
        category: ErrorCategory,
    },
}

/// Build the agent context for `root` from its config, with the
/// subprocess-backed collaborators.
pub fn open_context(root: &Path, cancel: CancelToken) -> Result<AgentContext> {
    let paths = ControlPaths::new(root);
    paths.ensure_initialized()?;
    let config = load_config(&paths.config_path)?;
    let llm = Arc::new(CommandLlmClient::new(root, &config.llm)?);
    let vcs: Arc<dyn VersionControl> = Arc::from(version_control_for(root, config.vcs.enabled));
    let checks = Arc::new(CommandCheckRunner::new(&paths.verify_logs_dir, &config.verify));
    Ok(AgentContext::new(paths, config, llm, vcs, checks, cancel))
}

pub struct Engine {
    ctx: AgentContext,
    registry: AgentRegistry,
    store: StateStore,
    lock: LockManager,
    checkpoints: CheckpointStore,
    provenance: JsonLines,
    queue: ExecutionQueue,
    current: Option<Execution>,
    last_observed: Option<ExecutionState>,
}

impl Engine {
    pub fn new(ctx: AgentContext, registry: AgentRegistry) -> Self {
        let paths = ctx.paths().clone();
        Self {
            store: StateStore::new(&paths.state_path),
            lock: LockManager::new(&paths.lock_path, ctx.config.lease_stale()),
            checkpoints: CheckpointStore::new(&paths.checkpoints_dir),
            provenance: JsonLines::new(&paths.provenance_path),
            queue: ExecutionQueue::new(),
            current: None,
            last_observed: None,
            ctx,
            registry,
        }
    }

    /// Engine for `root` with the default agents.
    pub fn open(root: &Path, cancel: CancelToken) -> Result<Self> {
        Ok(Self::new(open_context(root, cancel)?, default_registry()))
    }

    pub fn register_agent(
        &mut self,
        state: ExecutionState,
        factory: impl Fn() -> Box<dyn Agent> + Send + Sync + 'static,
    ) {
        self.registry.register(state, factory);
    }

    pub fn context(&self) -> &AgentContext {
        &self.ctx
    }

    pub fn lock(&self) -> &LockManager {
        &self.lock
    }

    pub fn queue(&self) -> &ExecutionQueue {
        &self.queue
    }

    pub fn state_store(&self) -> &StateStore {
        &self.store
    }

    pub fn current_execution(&self) -> Option<&Execution> {
        self.current.as_ref()
    }

    pub fn last_observed(&self) -> Option<ExecutionState> {
        self.last_observed
    }

    /// Clear a lease abandoned by a previous process.
    pub fn recover(&self) -> Result<Option<CrashReport>> {
        recover_on_startup(&self.lock, &self.checkpoints, &self.ctx.audit)
    }

    /// Read the store, apply the force-reset edge, and queue an active state.
    pub fn observe(&mut self) -> Result<ExecutionState> {
        let state = self.store.read()?;
        if let Some(previous) = self.last_observed
            && previous.is_terminal()
            && state.is_active()
        {
            self.force_reset(previous, state);
        }
        if self.last_observed != Some(state) {
            debug!(state = %state, "state observed");
        }
        self.last_observed = Some(state);

        let is_current = self
            .current
            .as_ref()
            .is_some_and(|execution| execution.state == state);
        if state.is_active() && !is_current && !self.queue.contains_state(state) {
            let id = self.queue.enqueue(state, 0);
            debug!(state = %state, %id, "transition queued");
        }
        Ok(state)
    }

    /// Terminal → active edge written by an external actor.
    fn force_reset(&mut self, from: ExecutionState, to: ExecutionState) {
        info!(from = %from, to = %to, "force reset");
        if let Err(err) = self.lock.force_clear() {
            warn!(err = %format!("{err:#}"), "could not clear lease during reset");
        }
        let dropped = self.queue.len();
        self.queue.clear();
        self.queue.set_processing(false);
        let discarded = self.current.take().map(|execution| execution.id);
        self.ctx.audit.record(
            AuditEvent::new(AuditKind::ForceReset, format!("{from} -> {to}"))
                .with_state(to)
                .with_details(json!({
                    "from": from,
                    "to": to,
                    "droppedRequests": dropped,
                    "discardedExecution": discarded,
                })),
        );
    }

    /// Dequeue and run at most one transition.
    pub fn process_next(&mut self) -> Result<TickOutcome> {
        if self.queue.is_processing() {
            return Ok(TickOutcome::Idle);
        }
        let Some(item) = self.queue.dequeue() else {
            return Ok(TickOutcome::Idle);
        };
        let stored = self.store.read()?;
        if stored != item.state {
            debug!(queued = %item.state, stored = %stored, "dropping stale request");
            return Ok(TickOutcome::Idle);
        }

        let lock = self.lock.clone();
        let Some(_lease) = lock.guard() else {
            debug!(state = %item.state, retries = item.retry_count, "lease busy, re-queueing");
            self.queue.requeue(item);
            return Ok(TickOutcome::Contended);
        };
        self.queue.set_processing(true);
        let outcome = self.execute(item.state);
        self.queue.set_processing(false);
        outcome
    }

    pub fn tick(&mut self) -> Result<TickOutcome> {
        self.observe()?;
        self.process_next()
    }

    /// Tick until cancelled. With `until_terminal`, also stop once the
    /// store reaches `DONE` or `FAIL` with nothing queued.
    pub fn run(&mut self, until_terminal: bool) -> Result<ExecutionState> {
        info!(owner = %self.lock.owner(), "engine started");
        self.recover()?;
        while !self.ctx.cancel.is_cancelled() {
            let outcome = self.tick()?;
            let settled = self.queue.is_empty()
                && self.current.is_none()
                && self.last_observed.is_some_and(ExecutionState::is_terminal);
            if until_terminal && settled {
                break;
            }
            if matches!(outcome, TickOutcome::Idle | TickOutcome::Contended)
                && !self.ctx.cancel.sleep(self.ctx.config.poll_interval())
            {
                break;
            }
        }
        self.lock.release();
        info!("engine stopped");
        self.store.read()
    }

    /// Ask the loop to halt at its next poll and give up the lease. An
    /// in-flight agent is not interrupted.
    pub fn stop(&mut self) {
        self.ctx.cancel.cancel();
        self.lock.release();
    }

    #[instrument(skip_all, fields(state = %state))]
    fn execute(&mut self, state: ExecutionState) -> Result<TickOutcome> {
        let mut execution = Execution::start(execution_id(), state);
        self.current = Some(execution.clone());
        let git_commit = self.ctx.vcs.head().unwrap_or_else(|err| {
            debug!(err = %format!("{err:#}"), "no head commit");
            None
        });

        let mut checkpoint_id = None;
        let result = self
            .checkpoints
            .create(state, git_commit.clone(), self.progress_counters())
            .and_then(|checkpoint| {
                checkpoint_id = Some(checkpoint.id);
                self.run_agent(state)
            });

        let result = result.and_then(|next| self.write_next(state, next).map(|()| next));
        let outcome = match result {
            Ok(next) => {
                execution.finish(None);
                info!(next = %next, "state complete");
                TickOutcome::Executed { state, next }
            }
            Err(err) if categorize(&err) == ErrorCategory::Cancelled => {
                info!(err = %format!("{err:#}"), "execution interrupted");
                execution.finish(Some(format!("{err:#}")));
                TickOutcome::Interrupted { state }
            }
            Err(err) => {
                let category = categorize(&err);
                self.fail_state(state, &err);
                execution.finish(Some(format!("{err:#}")));
                TickOutcome::Failed { state, category }
            }
        };

        let record = ProvenanceRecord::from_execution(&execution, checkpoint_id, git_commit);
        if let Err(err) = self.provenance.append(&record) {
            warn!(err = %format!("{err:#}"), "failed to record provenance");
        }
        self.current = None;
        Ok(outcome)
    }

    fn run_agent(&self, state: ExecutionState) -> Result<ExecutionState> {
        let mut agent = self
            .registry
            .create(state)
            .ok_or(EngineError::AgentMissing(state))?;
        let name = agent.name();

        if let Err(err) = agent.on_enter(&self.ctx) {
            self.hook_failed(name, "on_enter", state, &err);
        }
        if !agent.validate(&self.ctx)? {
            return Err(EngineError::Validation(format!("{name} agent validation failed")).into());
        }
        let result = agent.execute(&self.ctx);
        if let Err(err) = agent.on_exit(&self.ctx) {
            self.hook_failed(name, "on_exit", state, &err);
        }
        let next = result?;
        if !state.can_transition_to(next) {
            return Err(EngineError::Validation(format!(
                "{name} agent returned illegal transition {state} -> {next}"
            ))
            .into());
        }
        Ok(next)
    }

    fn hook_failed(&self, agent: &str, hook: &str, state: ExecutionState, err: &anyhow::Error) {
        warn!(agent, hook, err = %format!("{err:#}"), "agent hook failed");
        self.ctx.audit.record(
            AuditEvent::from_error(AuditKind::AgentHookFailed, err)
                .with_state(state)
                .with_details(json!({ "agent": agent, "hook": hook })),
        );
    }

    /// Write the agent's next state unless someone rewrote the store while
    /// it ran.
    fn write_next(&self, state: ExecutionState, next: ExecutionState) -> Result<()> {
        let stored = self.store.read()?;
        if stored != state {
            warn!(expected = %state, stored = %stored, next = %next, "state changed externally, not overwriting");
            return Ok(());
        }
        self.store.transition(&self.lock, next)
    }

    fn fail_state(&self, state: ExecutionState, err: &anyhow::Error) {
        error!(err = %format!("{err:#}"), "state failed");
        let event = AuditEvent::from_error(AuditKind::ExecutionFailed, err).with_state(state);
        let failure = FailureSection {
            state,
            category: event.category.as_deref().unwrap_or("internal"),
            message: &event.message,
            details: &event.details,
        };
        if let Err(report_err) = append_failure(&self.ctx.paths().report_path, &failure) {
            warn!(err = %format!("{report_err:#}"), "failed to append failure to report");
        }
        self.ctx.audit.record(event);
        if let Err(write_err) = self.store.transition(&self.lock, ExecutionState::Fail) {
            error!(err = %format!("{write_err:#}"), "failed to write FAIL");
        }
    }

    fn progress_counters(&self) -> Option<ProgressCounters> {
        let plan = self.ctx.docs.load_plan().ok().flatten()?;
        let ledger = self.ctx.docs.load_progress().ok()?;
        let steps: Vec<&str> = plan.steps().map(|step| step.id.as_str()).collect();
        Some(ProgressCounters {
            completed: steps.iter().filter(|id| ledger.is_completed(id)).count(),
            failed: steps.iter().filter(|id| ledger.is_failed(id)).count(),
            total: steps.len(),
        })
    }
}

fn execution_id() -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(6)
        .map(char::from)
        .collect();
    format!("exec-{}-{}", Utc::now().format("%Y%m%dT%H%M%S"), suffix.to_lowercase())
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("owner", &self.lock.owner())
            .field("queued", &self.queue.len())
            .field("current", &self.current)
            .field("last_observed", &self.last_observed)
            .finish_non_exhaustive()
    }
}
