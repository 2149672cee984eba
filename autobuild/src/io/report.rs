//! The verification report (`.autobuild/report.md`).

use std::fmt::Write as _;
use std::path::Path;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::types::ExecutionState;
use crate::io::atomic::{read_text_opt, write_text};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum CheckStatus {
    Pass,
    Fail,
    /// Not configured; counts as a pass.
    Skip,
}

impl CheckStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            CheckStatus::Pass => "PASS",
            CheckStatus::Fail => "FAIL",
            CheckStatus::Skip => "SKIP",
        }
    }

    pub fn is_passing(self) -> bool {
        !matches!(self, CheckStatus::Fail)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckResult {
    pub name: String,
    pub status: CheckStatus,
    pub detail: String,
}

impl CheckResult {
    pub fn new(name: &str, status: CheckStatus, detail: impl Into<String>) -> Self {
        Self {
            name: name.to_string(),
            status,
            detail: detail.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerificationReport {
    pub generated_at: DateTime<Utc>,
    pub app_name: Option<String>,
    pub checks: Vec<CheckResult>,
}

impl VerificationReport {
    pub fn passed(&self) -> bool {
        self.checks.iter().all(|check| check.status.is_passing())
    }

    pub fn render(&self) -> String {
        let mut out = String::from("# Verification Report\n\n");
        let _ = writeln!(out, "Generated: {}", self.generated_at.to_rfc3339());
        if let Some(app) = &self.app_name {
            let _ = writeln!(out, "Application: {app}");
        }
        let _ = writeln!(
            out,
            "Result: {}\n",
            if self.passed() { "PASS" } else { "FAIL" }
        );
        out.push_str("| check | status | detail |\n|---|---|---|\n");
        for check in &self.checks {
            let _ = writeln!(
                out,
                "| {} | {} | {} |",
                check.name,
                check.status.as_str(),
                check.detail.replace('|', "\\|").replace('\n', " ")
            );
        }
        out
    }
}

pub fn write_report(path: &Path, report: &VerificationReport) -> Result<()> {
    write_text(path, &report.render())
}

/// Diagnostic section appended when the engine fails a state.
#[derive(Debug, Clone)]
pub struct FailureSection<'a> {
    pub state: ExecutionState,
    pub category: &'a str,
    pub message: &'a str,
    pub details: &'a serde_json::Value,
}

pub fn append_failure(path: &Path, failure: &FailureSection<'_>) -> Result<()> {
    let mut contents = read_text_opt(path)?.unwrap_or_else(|| "# Report\n".to_string());
    if !contents.ends_with('\n') {
        contents.push('\n');
    }
    let _ = write!(
        contents,
        "\n## Failure\n\n- at: {}\n- state: {}\n- category: {}\n- message: {}\n",
        Utc::now().to_rfc3339(),
        failure.state,
        failure.category,
        failure.message.replace('\n', " ")
    );
    if !failure.details.is_null() {
        let pretty = serde_json::to_string_pretty(failure.details).unwrap_or_default();
        let _ = write!(contents, "\n```json\n{pretty}\n```\n");
    }
    write_text(path, &contents)
}
