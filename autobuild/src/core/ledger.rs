//! Progress ledger: which plan steps are completed or failed.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

/// A step id is never in both sets at once.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressLedger {
    #[serde(default)]
    pub completed_steps: BTreeSet<String>,
    #[serde(default)]
    pub failed_steps: BTreeSet<String>,
}

impl ProgressLedger {
    pub fn mark_completed(&mut self, step_id: &str) {
        self.failed_steps.remove(step_id);
        self.completed_steps.insert(step_id.to_string());
    }

    pub fn mark_failed(&mut self, step_id: &str) {
        self.completed_steps.remove(step_id);
        self.failed_steps.insert(step_id.to_string());
    }

    /// Move a step back to pending. Returns true when it was recorded.
    pub fn retry(&mut self, step_id: &str) -> bool {
        let completed = self.completed_steps.remove(step_id);
        let failed = self.failed_steps.remove(step_id);
        completed || failed
    }

    pub fn is_completed(&self, step_id: &str) -> bool {
        self.completed_steps.contains(step_id)
    }

    pub fn is_failed(&self, step_id: &str) -> bool {
        self.failed_steps.contains(step_id)
    }
}
