//! Typed failures that drive engine and agent decisions.
//!
//! These travel inside `anyhow::Error` and are recovered with
//! `downcast_ref::<EngineError>()` where the caller must branch on them.

use serde::Serialize;
use thiserror::Error;

use crate::core::policy::PolicyViolation;
use crate::core::types::ExecutionState;

#[derive(Debug, Clone, Error)]
pub enum EngineError {
    #[error("policy violation: {0}")]
    PolicyViolation(PolicyViolation),

    #[error("path '{path}' escapes workspace root {root}")]
    WorkspaceIsolation { path: String, root: String },

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("transient failure: {0}")]
    Transient(String),

    #[error("token budget exceeded: {used} of {limit} tokens used")]
    BudgetExceeded { used: u64, limit: u64 },

    #[error("step '{step_id}' escalated: {reason}")]
    Escalation { step_id: String, reason: String },

    #[error("no agent registered for state {0}")]
    AgentMissing(ExecutionState),

    #[error("cancelled: {0}")]
    Cancelled(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    PolicyViolation,
    WorkspaceIsolation,
    Validation,
    Transient,
    BudgetExceeded,
    Escalation,
    AgentMissing,
    Cancelled,
    /// Untyped failure (I/O, parse, ...).
    Internal,
}

impl ErrorCategory {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCategory::PolicyViolation => "policy_violation",
            ErrorCategory::WorkspaceIsolation => "workspace_isolation",
            ErrorCategory::Validation => "validation",
            ErrorCategory::Transient => "transient",
            ErrorCategory::BudgetExceeded => "budget_exceeded",
            ErrorCategory::Escalation => "escalation",
            ErrorCategory::AgentMissing => "agent_missing",
            ErrorCategory::Cancelled => "cancelled",
            ErrorCategory::Internal => "internal",
        }
    }
}

impl EngineError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            EngineError::PolicyViolation(_) => ErrorCategory::PolicyViolation,
            EngineError::WorkspaceIsolation { .. } => ErrorCategory::WorkspaceIsolation,
            EngineError::Validation(_) => ErrorCategory::Validation,
            EngineError::Transient(_) => ErrorCategory::Transient,
            EngineError::BudgetExceeded { .. } => ErrorCategory::BudgetExceeded,
            EngineError::Escalation { .. } => ErrorCategory::Escalation,
            EngineError::AgentMissing(_) => ErrorCategory::AgentMissing,
            EngineError::Cancelled(_) => ErrorCategory::Cancelled,
        }
    }

    /// Structured payload for the audit log and failure report.
    pub fn details(&self) -> serde_json::Value {
        match self {
            EngineError::PolicyViolation(violation) => {
                serde_json::to_value(violation).unwrap_or(serde_json::Value::Null)
            }
            EngineError::WorkspaceIsolation { path, root } => {
                serde_json::json!({ "path": path, "root": root })
            }
            EngineError::BudgetExceeded { used, limit } => {
                serde_json::json!({ "used": used, "limit": limit })
            }
            EngineError::Escalation { step_id, reason } => {
                serde_json::json!({ "stepId": step_id, "reason": reason })
            }
            EngineError::AgentMissing(state) => serde_json::json!({ "state": state }),
            EngineError::Validation(message)
            | EngineError::Transient(message)
            | EngineError::Cancelled(message) => serde_json::json!({ "message": message }),
        }
    }
}

/// Category of an arbitrary error, `Internal` when it carries no [`EngineError`].
pub fn categorize(err: &anyhow::Error) -> ErrorCategory {
    err.downcast_ref::<EngineError>()
        .map_or(ErrorCategory::Internal, EngineError::category)
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    #[test]
    fn category_survives_context_wrapping() {
        let err: anyhow::Error = Err::<(), _>(EngineError::BudgetExceeded {
            used: 11,
            limit: 10,
        })
        .context("generate code")
        .expect_err("error");
        assert_eq!(categorize(&err), ErrorCategory::BudgetExceeded);
        assert_eq!(categorize(&anyhow::anyhow!("io")), ErrorCategory::Internal);
    }

    #[test]
    fn details_carry_payload() {
        let err = EngineError::Escalation {
            step_id: "s1".to_string(),
            reason: "repeated".to_string(),
        };
        assert_eq!(err.details()["stepId"], "s1");
        assert_eq!(err.category().as_str(), "escalation");
    }
}
