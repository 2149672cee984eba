//! Load/save helpers for the control documents the agents share.

use anyhow::{Context, Result, anyhow};
use tracing::debug;

use crate::core::intent::{IntentSnapshot, ParsedIntent, parse_intent};
use crate::core::ledger::ProgressLedger;
use crate::core::plan::{Plan, parse_plan, render_plan};
use crate::core::policy::PolicyRules;
use crate::core::trace::TraceabilityLedger;
use crate::io::atomic::{read_json_opt, read_json_or_default, read_text_opt, write_json, write_text};
use crate::io::init::ControlPaths;

/// Typed access to the documents under `.autobuild/`.
#[derive(Debug, Clone)]
pub struct Documents {
    paths: ControlPaths,
}

impl Documents {
    pub fn new(paths: ControlPaths) -> Self {
        Self { paths }
    }

    pub fn paths(&self) -> &ControlPaths {
        &self.paths
    }

    pub fn load_intent(&self) -> Result<ParsedIntent> {
        let path = &self.paths.intent_path;
        let contents = read_text_opt(path)?
            .ok_or_else(|| anyhow!("missing intent document {}", path.display()))?;
        parse_intent(&contents).with_context(|| format!("parse {}", path.display()))
    }

    /// Missing rules fall back to the defaults.
    pub fn load_rules(&self) -> Result<PolicyRules> {
        let path = &self.paths.rules_path;
        match read_text_opt(path)? {
            Some(contents) => {
                PolicyRules::from_toml(&contents).with_context(|| format!("load {}", path.display()))
            }
            None => Ok(PolicyRules::default()),
        }
    }

    pub fn load_plan(&self) -> Result<Option<Plan>> {
        Ok(read_text_opt(&self.paths.plan_path)?.map(|contents| parse_plan(&contents)))
    }

    pub fn load_plan_text(&self) -> Result<Option<String>> {
        read_text_opt(&self.paths.plan_path)
    }

    pub fn write_plan(&self, plan: &Plan) -> Result<()> {
        debug!(steps = plan.step_count(), "writing plan");
        write_text(&self.paths.plan_path, &render_plan(plan))
    }

    pub fn load_progress(&self) -> Result<ProgressLedger> {
        read_json_or_default(&self.paths.progress_path)
    }

    pub fn write_progress(&self, ledger: &ProgressLedger) -> Result<()> {
        write_json(&self.paths.progress_path, ledger)
    }

    pub fn load_snapshot(&self) -> Result<Option<IntentSnapshot>> {
        read_json_opt(&self.paths.snapshot_path)
    }

    pub fn write_snapshot(&self, snapshot: &IntentSnapshot) -> Result<()> {
        write_json(&self.paths.snapshot_path, snapshot)
    }

    pub fn load_traceability(&self) -> Result<TraceabilityLedger> {
        read_json_or_default(&self.paths.traceability_path)
    }

    pub fn write_traceability(&self, ledger: &TraceabilityLedger) -> Result<()> {
        write_json(&self.paths.traceability_path, ledger)
    }
}
