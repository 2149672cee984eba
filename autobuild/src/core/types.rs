//! Shared types for the execution state machine.

use std::fmt;
use std::str::FromStr;

use anyhow::{Result, anyhow};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The persisted execution state token.
///
/// `Done` and `Fail` are terminal for autonomous progression; writing an
/// active state over them is the "restart" edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ExecutionState {
    Plan,
    Implement,
    Verify,
    Done,
    Fail,
}

impl ExecutionState {
    pub const ALL: [ExecutionState; 5] = [
        ExecutionState::Plan,
        ExecutionState::Implement,
        ExecutionState::Verify,
        ExecutionState::Done,
        ExecutionState::Fail,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ExecutionState::Plan => "PLAN",
            ExecutionState::Implement => "IMPLEMENT",
            ExecutionState::Verify => "VERIFY",
            ExecutionState::Done => "DONE",
            ExecutionState::Fail => "FAIL",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, ExecutionState::Done | ExecutionState::Fail)
    }

    pub fn is_active(self) -> bool {
        !self.is_terminal()
    }

    /// True if the autonomous transition `self -> next` is allowed.
    ///
    /// Writes from outside the engine are not checked against this table.
    pub fn can_transition_to(self, next: ExecutionState) -> bool {
        use ExecutionState::{Done, Fail, Implement, Plan, Verify};
        matches!(
            (self, next),
            (Plan, Implement)
                | (Plan, Fail)
                | (Implement, Verify)
                | (Implement, Fail)
                | (Verify, Done)
                | (Verify, Fail)
                | (Done, Plan)
                | (Fail, Plan)
        )
    }
}

impl fmt::Display for ExecutionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExecutionState {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let token = s.trim();
        ExecutionState::ALL
            .into_iter()
            .find(|state| state.as_str().eq_ignore_ascii_case(token))
            .ok_or_else(|| anyhow!("unknown execution state '{token}'"))
    }
}

/// The in-memory record of the state currently executing.
///
/// At most one exists per engine; it is never persisted except through
/// provenance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Execution {
    pub id: String,
    pub state: ExecutionState,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

impl Execution {
    pub fn start(id: impl Into<String>, state: ExecutionState) -> Self {
        Self {
            id: id.into(),
            state,
            started_at: Utc::now(),
            completed_at: None,
            error: None,
        }
    }

    pub fn finish(&mut self, error: Option<String>) {
        self.completed_at = Some(Utc::now());
        self.error = error;
    }
}

/// Kind of file operation a plan step performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    Create,
    Modify,
    Delete,
    Verify,
}

impl OperationKind {
    pub fn as_str(self) -> &'static str {
        match self {
            OperationKind::Create => "create",
            OperationKind::Modify => "modify",
            OperationKind::Delete => "delete",
            OperationKind::Verify => "verify",
        }
    }

    pub fn touches_files(self) -> bool {
        !matches!(self, OperationKind::Verify)
    }
}

impl FromStr for OperationKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "create" => Ok(OperationKind::Create),
            "modify" | "update" | "edit" => Ok(OperationKind::Modify),
            "delete" | "remove" => Ok(OperationKind::Delete),
            "verify" | "test" => Ok(OperationKind::Verify),
            other => Err(anyhow!("unknown operation kind '{other}'")),
        }
    }
}

/// Spend category for token accounting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SpendCategory {
    Plan,
    Code,
    Chat,
}

impl SpendCategory {
    pub fn as_str(self) -> &'static str {
        match self {
            SpendCategory::Plan => "plan",
            SpendCategory::Code => "code",
            SpendCategory::Chat => "chat",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_parses_case_insensitively_with_whitespace() {
        assert_eq!(
            " implement\n".parse::<ExecutionState>().expect("parse"),
            ExecutionState::Implement
        );
        assert!("WAIT".parse::<ExecutionState>().is_err());
    }

    #[test]
    fn terminal_states_only_restart_into_plan() {
        assert!(ExecutionState::Fail.can_transition_to(ExecutionState::Plan));
        assert!(!ExecutionState::Done.can_transition_to(ExecutionState::Verify));
        assert!(!ExecutionState::Verify.can_transition_to(ExecutionState::Plan));
        assert!(ExecutionState::Implement.can_transition_to(ExecutionState::Fail));
    }

    #[test]
    fn state_serializes_as_uppercase_token() {
        let json = serde_json::to_string(&ExecutionState::Verify).expect("serialize");
        assert_eq!(json, "\"VERIFY\"");
    }
}
