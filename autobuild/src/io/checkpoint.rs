//! Durable execution snapshots under `.autobuild/checkpoints/`.
//!
//! Checkpoint files are immutable; `latest.json` is the only pointer that
//! changes.

use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, Utc};
use rand::Rng;
use rand::distributions::Alphanumeric;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::core::types::ExecutionState;
use crate::io::atomic::{read_json_opt, write_json};

const LATEST: &str = "latest.json";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressCounters {
    pub completed: usize,
    pub failed: usize,
    pub total: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Checkpoint {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub state: ExecutionState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub git_commit: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<ProgressCounters>,
}

#[derive(Debug, Serialize, Deserialize)]
struct LatestPointer {
    id: String,
}

#[derive(Debug, Clone)]
pub struct CheckpointStore {
    dir: PathBuf,
}

impl CheckpointStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn create(
        &self,
        state: ExecutionState,
        git_commit: Option<String>,
        progress: Option<ProgressCounters>,
    ) -> Result<Checkpoint> {
        let created_at = Utc::now();
        let checkpoint = Checkpoint {
            id: checkpoint_id(created_at),
            created_at,
            state,
            git_commit,
            progress,
        };
        let path = self.path_for(&checkpoint.id);
        if path.exists() {
            return Err(anyhow!("checkpoint {} already exists", checkpoint.id));
        }
        write_json(&path, &checkpoint)?;
        write_json(
            &self.dir.join(LATEST),
            &LatestPointer {
                id: checkpoint.id.clone(),
            },
        )?;
        debug!(id = %checkpoint.id, state = %state, "checkpoint created");
        Ok(checkpoint)
    }

    pub fn load(&self, id: &str) -> Result<Option<Checkpoint>> {
        read_json_opt(&self.path_for(id))
    }

    /// Follow the latest pointer. A dangling pointer yields `None`.
    pub fn latest(&self) -> Result<Option<Checkpoint>> {
        let Some(pointer) = read_json_opt::<LatestPointer>(&self.dir.join(LATEST))? else {
            return Ok(None);
        };
        let checkpoint = self.load(&pointer.id)?;
        if checkpoint.is_none() {
            warn!(id = %pointer.id, "latest checkpoint pointer is dangling");
        }
        Ok(checkpoint)
    }

    /// Checkpoint ids in creation order.
    pub fn list(&self) -> Result<Vec<String>> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err).with_context(|| format!("read {}", self.dir.display())),
        };
        let mut ids = Vec::new();
        for entry in entries {
            let entry = entry.with_context(|| format!("read {}", self.dir.display()))?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if name == LATEST || name.starts_with('.') {
                continue;
            }
            if let Some(id) = name.strip_suffix(".json") {
                ids.push(id.to_string());
            }
        }
        ids.sort();
        Ok(ids)
    }

    fn path_for(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{id}.json"))
    }
}

fn checkpoint_id(now: DateTime<Utc>) -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(4)
        .map(char::from)
        .collect();
    format!(
        "cp-{}-{}",
        now.format("%Y%m%dT%H%M%S%3f"),
        suffix.to_lowercase()
    )
}
