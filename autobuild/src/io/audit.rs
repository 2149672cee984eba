//! Append-only JSON-lines records: the audit log and execution provenance.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use crate::core::types::{Execution, ExecutionState};
use crate::error::{EngineError, categorize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditKind {
    ExecutionFailed,
    AgentHookFailed,
    ForceReset,
    CrashDetected,
    StepSkipped,
    StepFailed,
    StepRetried,
    PolicyViolation,
    BudgetWarning,
    ProjectEstimate,
    VcsFailed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEvent {
    pub at: DateTime<Utc>,
    pub kind: AuditKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<ExecutionState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    pub message: String,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub details: Value,
}

impl AuditEvent {
    pub fn new(kind: AuditKind, message: impl Into<String>) -> Self {
        Self {
            at: Utc::now(),
            kind,
            state: None,
            category: None,
            message: message.into(),
            details: Value::Null,
        }
    }

    /// Event carrying an error's category, full message chain, and payload.
    pub fn from_error(kind: AuditKind, err: &anyhow::Error) -> Self {
        let details = err
            .downcast_ref::<EngineError>()
            .map_or(Value::Null, EngineError::details);
        Self {
            category: Some(categorize(err).as_str().to_string()),
            details,
            ..Self::new(kind, format!("{err:#}"))
        }
    }

    pub fn with_state(mut self, state: ExecutionState) -> Self {
        self.state = Some(state);
        self
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = details;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    Success,
    Failure,
}

/// One finished execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProvenanceRecord {
    pub execution_id: String,
    pub state: ExecutionState,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub outcome: Outcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checkpoint_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub git_commit: Option<String>,
}

impl ProvenanceRecord {
    pub fn from_execution(
        execution: &Execution,
        checkpoint_id: Option<String>,
        git_commit: Option<String>,
    ) -> Self {
        Self {
            execution_id: execution.id.clone(),
            state: execution.state,
            started_at: execution.started_at,
            completed_at: execution.completed_at.unwrap_or_else(Utc::now),
            outcome: if execution.error.is_some() {
                Outcome::Failure
            } else {
                Outcome::Success
            },
            error: execution.error.clone(),
            checkpoint_id,
            git_commit,
        }
    }
}

/// A JSON-lines file that only grows.
#[derive(Debug, Clone)]
pub struct JsonLines {
    path: PathBuf,
}

impl JsonLines {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append<T: Serialize>(&self, record: &T) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create directory {}", parent.display()))?;
        }
        let line = serde_json::to_string(record).context("serialize record")?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("open {}", self.path.display()))?;
        writeln!(file, "{line}").with_context(|| format!("append {}", self.path.display()))
    }

    /// Parse every line; unparseable lines are skipped with a warning.
    pub fn read_all<T: DeserializeOwned>(&self) -> Result<Vec<T>> {
        let Some(contents) = crate::io::atomic::read_text_opt(&self.path)? else {
            return Ok(Vec::new());
        };
        let mut records = Vec::new();
        for (index, line) in contents.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str(line) {
                Ok(record) => records.push(record),
                Err(err) => {
                    warn!(path = %self.path.display(), line = index + 1, err = %err, "skipping bad record");
                }
            }
        }
        Ok(records)
    }
}

/// Audit sink that never fails its caller: write errors are logged.
#[derive(Debug, Clone)]
pub struct AuditLog {
    lines: JsonLines,
}

impl AuditLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            lines: JsonLines::new(path),
        }
    }

    pub fn record(&self, event: AuditEvent) {
        if let Err(err) = self.lines.append(&event) {
            warn!(err = %err, kind = ?event.kind, "failed to write audit event");
        }
    }

    pub fn events(&self) -> Result<Vec<AuditEvent>> {
        self.lines.read_all()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::policy::{PolicyViolation, ViolationDetail, ViolationType};

    #[test]
    fn audit_records_error_payload() {
        let temp = tempfile::tempdir().expect("tempdir");
        let log = AuditLog::new(temp.path().join("audit.log"));
        let violation = PolicyViolation {
            file_path: "apps/a/x.ts".to_string(),
            violation_type: ViolationType::ForbiddenType,
            violations: vec![ViolationDetail {
                line: 3,
                message: "forbidden type `any`".to_string(),
                snippet: "let x: any".to_string(),
            }],
            suggested_fix: "use unknown".to_string(),
        };
        let err = anyhow::Error::from(EngineError::PolicyViolation(violation));
        log.record(AuditEvent::from_error(AuditKind::ExecutionFailed, &err).with_state(ExecutionState::Implement));
        log.record(AuditEvent::new(AuditKind::ForceReset, "FAIL -> PLAN"));

        let events = log.events().expect("events");
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].category.as_deref(), Some("policy_violation"));
        assert_eq!(events[0].details["file_path"], "apps/a/x.ts");
        assert_eq!(events[0].details["suggested_fix"], "use unknown");
        assert_eq!(events[1].kind, AuditKind::ForceReset);
    }

    #[test]
    fn provenance_outcome_follows_execution_error() {
        let temp = tempfile::tempdir().expect("tempdir");
        let lines = JsonLines::new(temp.path().join("provenance.jsonl"));
        let mut execution = Execution::start("exec-1", ExecutionState::Verify);
        execution.finish(Some("boom".to_string()));
        lines
            .append(&ProvenanceRecord::from_execution(&execution, Some("cp-1".to_string()), None))
            .expect("append");
        let records: Vec<ProvenanceRecord> = lines.read_all().expect("read");
        assert_eq!(records[0].outcome, Outcome::Failure);
        assert_eq!(records[0].checkpoint_id.as_deref(), Some("cp-1"));
        let raw = fs::read_to_string(lines.path()).expect("raw");
        assert!(raw.contains("\"executionId\":\"exec-1\""));
    }
}
