//! Requirement ↔ file ↔ step traceability.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequirementTrace {
    pub files: BTreeSet<String>,
    pub steps: BTreeSet<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileTrace {
    pub requirements: BTreeSet<String>,
    pub step: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceabilityLedger {
    #[serde(default)]
    pub requirements: BTreeMap<String, RequirementTrace>,
    #[serde(default)]
    pub files: BTreeMap<String, FileTrace>,
}

impl TraceabilityLedger {
    /// Link one file to the step that wrote it and its requirement ids,
    /// in both directions.
    pub fn record_file(&mut self, file: &str, step_id: &str, requirements: &[String]) {
        let entry = self.files.entry(file.to_string()).or_default();
        entry.step = step_id.to_string();
        for requirement in requirements {
            entry.requirements.insert(requirement.clone());
            let trace = self.requirements.entry(requirement.clone()).or_default();
            trace.files.insert(file.to_string());
            trace.steps.insert(step_id.to_string());
        }
    }

    pub fn merge_step(&mut self, step_id: &str, files: &[String], requirements: &[String]) {
        for file in files {
            self.record_file(file, step_id, requirements);
        }
    }

    /// Drop a deleted file from both directions.
    pub fn forget_file(&mut self, file: &str) {
        if let Some(trace) = self.files.remove(file) {
            for requirement in trace.requirements {
                if let Some(entry) = self.requirements.get_mut(&requirement) {
                    entry.files.remove(file);
                }
            }
        }
    }

    /// Requirement ids with no associated file.
    pub fn uncovered<'a>(&self, ids: impl IntoIterator<Item = &'a str>) -> Vec<String> {
        ids.into_iter()
            .filter(|id| {
                self.requirements
                    .get(*id)
                    .is_none_or(|trace| trace.files.is_empty())
            })
            .map(str::to_string)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_records_both_directions() {
        let mut ledger = TraceabilityLedger::default();
        let reqs = vec!["REQ-001".to_string(), "REQ-002".to_string()];
        ledger.merge_step("s1", &["apps/a/x.ts".to_string()], &reqs);
        assert!(ledger.requirements["REQ-001"].files.contains("apps/a/x.ts"));
        assert!(ledger.requirements["REQ-002"].steps.contains("s1"));
        assert_eq!(ledger.files["apps/a/x.ts"].step, "s1");
        assert_eq!(ledger.files["apps/a/x.ts"].requirements.len(), 2);
    }

    #[test]
    fn uncovered_lists_requirements_without_files() {
        let mut ledger = TraceabilityLedger::default();
        ledger.record_file("f.ts", "s1", &["REQ-001".to_string()]);
        assert_eq!(ledger.uncovered(["REQ-001", "REQ-002"]), vec!["REQ-002"]);
        ledger.forget_file("f.ts");
        assert_eq!(ledger.uncovered(["REQ-001"]), vec!["REQ-001"]);
    }
}
