//! The persisted execution state token (`.autobuild/state`).
//!
//! The file is the single source of truth. External actors may rewrite it at
//! any time; the engine re-reads it on every tick.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, info};

use crate::core::types::ExecutionState;
use crate::io::atomic::write_text;
use crate::io::init::state_token;
use crate::io::lock::LockManager;

#[derive(Debug, Clone)]
pub struct StateStore {
    path: PathBuf,
}

impl StateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn read(&self) -> Result<ExecutionState> {
        let contents = fs::read_to_string(&self.path)
            .with_context(|| format!("read state {}", self.path.display()))?;
        contents
            .parse()
            .with_context(|| format!("parse state {}", self.path.display()))
    }

    /// Unguarded write for external actors (CLI reset / set-state).
    pub fn write_external(&self, state: ExecutionState) -> Result<()> {
        info!(state = %state, "state written externally");
        write_text(&self.path, &state_token(state))
    }

    /// Lock-guarded write used by the engine and agents.
    ///
    /// Uses the caller's lease when it holds one; otherwise takes the lease
    /// for the duration of the write.
    pub fn transition(&self, lock: &LockManager, next: ExecutionState) -> Result<()> {
        let _guard = if lock.owns_lease() {
            None
        } else {
            Some(lock.guard().ok_or_else(|| {
                anyhow!("cannot write state {next}: lease held by another owner")
            })?)
        };
        debug!(state = %next, "state transition");
        write_text(&self.path, &state_token(next))
    }
}
