//! Engine configuration stored under `.autobuild/config.toml`.

use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::core::budget::Rates;
use crate::io::atomic::write_text;

/// Engine configuration (TOML).
///
/// Every section is `#[serde(default)]` so partial files stay valid.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EngineConfig {
    /// Idle wait between watcher ticks.
    pub poll_interval_ms: u64,
    /// Wait between re-reads of the open-questions document.
    pub question_poll_interval_ms: u64,
    /// Leases older than this are abandoned.
    pub lease_stale_secs: u64,

    pub llm: LlmConfig,
    pub budget: BudgetConfig,
    pub implement: ImplementConfig,
    pub plan: PlanConfig,
    pub workspace: WorkspaceConfig,
    pub verify: VerifyConfig,
    pub vcs: VcsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LlmConfig {
    /// Generation CLI argv. Receives the prompt on stdin, prints JSON on stdout.
    pub command: Vec<String>,
    pub timeout_secs: u64,
    pub max_attempts: u32,
    pub backoff_base_ms: u64,
    pub output_limit_bytes: usize,
    pub plan_model: Option<String>,
    pub code_model: Option<String>,
    pub chat_model: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BudgetConfig {
    pub max_tokens_per_project: u64,
    /// Usage ratio at which warnings start.
    pub warning_threshold: f64,
    /// Cost per 1,000 tokens.
    pub plan_rate: f64,
    pub code_rate: f64,
    pub chat_rate: f64,
    pub estimated_plan_tokens: u64,
    pub estimated_tokens_per_step: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ImplementConfig {
    /// Corrective regenerations allowed for a correctable policy violation.
    pub max_policy_corrections: u32,
    /// Identical failures tolerated before escalating or skipping a step.
    pub repeat_threshold: u32,
    pub context_max_files: usize,
    pub context_max_bytes: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PlanConfig {
    pub overlap_threshold: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct WorkspaceConfig {
    pub apps_dir: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct VerifyConfig {
    pub type_check_command: Option<Vec<String>>,
    pub build_command: Option<Vec<String>>,
    pub timeout_secs: u64,
    pub output_limit_bytes: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct VcsConfig {
    pub enabled: bool,
    pub push: bool,
    pub remote: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 100,
            question_poll_interval_ms: 2000,
            lease_stale_secs: 5 * 60,
            llm: LlmConfig::default(),
            budget: BudgetConfig::default(),
            implement: ImplementConfig::default(),
            plan: PlanConfig::default(),
            workspace: WorkspaceConfig::default(),
            verify: VerifyConfig::default(),
            vcs: VcsConfig::default(),
        }
    }
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            command: vec![
                "codex".to_string(),
                "exec".to_string(),
                "--skip-git-repo-check".to_string(),
                "-".to_string(),
            ],
            timeout_secs: 300,
            max_attempts: 3,
            backoff_base_ms: 500,
            output_limit_bytes: 1_000_000,
            plan_model: None,
            code_model: None,
            chat_model: None,
        }
    }
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            max_tokens_per_project: 2_000_000,
            warning_threshold: 0.8,
            plan_rate: 0.015,
            code_rate: 0.015,
            chat_rate: 0.003,
            estimated_plan_tokens: 8_000,
            estimated_tokens_per_step: 6_000,
        }
    }
}

impl Default for ImplementConfig {
    fn default() -> Self {
        Self {
            max_policy_corrections: 2,
            repeat_threshold: 3,
            context_max_files: 20,
            context_max_bytes: 200_000,
        }
    }
}

impl Default for PlanConfig {
    fn default() -> Self {
        Self {
            overlap_threshold: 0.8,
        }
    }
}

impl Default for WorkspaceConfig {
    fn default() -> Self {
        Self {
            apps_dir: "apps".to_string(),
        }
    }
}

impl Default for VerifyConfig {
    fn default() -> Self {
        Self {
            type_check_command: None,
            build_command: None,
            timeout_secs: 10 * 60,
            output_limit_bytes: 100_000,
        }
    }
}

impl Default for VcsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            push: false,
            remote: "origin".to_string(),
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> Result<()> {
        if self.poll_interval_ms == 0 {
            return Err(anyhow!("poll_interval_ms must be > 0"));
        }
        if self.question_poll_interval_ms == 0 {
            return Err(anyhow!("question_poll_interval_ms must be > 0"));
        }
        if self.lease_stale_secs == 0 {
            return Err(anyhow!("lease_stale_secs must be > 0"));
        }
        if self.llm.command.is_empty() || self.llm.command[0].trim().is_empty() {
            return Err(anyhow!("llm.command must be a non-empty array"));
        }
        if self.llm.timeout_secs == 0 {
            return Err(anyhow!("llm.timeout_secs must be > 0"));
        }
        if self.llm.max_attempts == 0 {
            return Err(anyhow!("llm.max_attempts must be > 0"));
        }
        if self.llm.output_limit_bytes == 0 {
            return Err(anyhow!("llm.output_limit_bytes must be > 0"));
        }
        let threshold = self.budget.warning_threshold;
        if !(threshold > 0.0 && threshold <= 1.0) {
            return Err(anyhow!("budget.warning_threshold must be in (0, 1]"));
        }
        if self.implement.repeat_threshold == 0 {
            return Err(anyhow!("implement.repeat_threshold must be > 0"));
        }
        if !(0.0..=1.0).contains(&self.plan.overlap_threshold) {
            return Err(anyhow!("plan.overlap_threshold must be in [0, 1]"));
        }
        let apps_dir = self.workspace.apps_dir.trim();
        if apps_dir.is_empty() || apps_dir.starts_with('/') || apps_dir.contains("..") {
            return Err(anyhow!("workspace.apps_dir must be a non-empty relative path"));
        }
        if self.verify.timeout_secs == 0 {
            return Err(anyhow!("verify.timeout_secs must be > 0"));
        }
        for (name, command) in [
            ("verify.type_check_command", &self.verify.type_check_command),
            ("verify.build_command", &self.verify.build_command),
        ] {
            if let Some(argv) = command
                && argv.first().is_none_or(|program| program.trim().is_empty())
            {
                return Err(anyhow!("{name} must be a non-empty array when set"));
            }
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn question_poll_interval(&self) -> Duration {
        Duration::from_millis(self.question_poll_interval_ms)
    }

    pub fn lease_stale(&self) -> Duration {
        Duration::from_secs(self.lease_stale_secs)
    }
}

impl BudgetConfig {
    pub fn rates(&self) -> Rates {
        Rates {
            plan: self.plan_rate,
            code: self.code_rate,
            chat: self.chat_rate,
        }
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `EngineConfig::default()`.
pub fn load_config(path: &Path) -> Result<EngineConfig> {
    if !path.exists() {
        let cfg = EngineConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: EngineConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("validate {}", path.display()))?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &EngineConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_text(path, &buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_missing_returns_default() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cfg = load_config(&temp.path().join("missing.toml")).expect("load");
        assert_eq!(cfg, EngineConfig::default());
    }

    #[test]
    fn write_then_load_round_trips() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("config.toml");
        let mut cfg = EngineConfig::default();
        cfg.verify.build_command = Some(vec!["npm".to_string(), "run".to_string(), "build".to_string()]);
        cfg.llm.code_model = Some("large".to_string());
        write_config(&path, &cfg).expect("write");
        assert_eq!(load_config(&path).expect("load"), cfg);
    }

    #[test]
    fn partial_file_fills_defaults() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("config.toml");
        fs::write(&path, "poll_interval_ms = 5\n[vcs]\nenabled = false\n").expect("write");
        let cfg = load_config(&path).expect("load");
        assert_eq!(cfg.poll_interval_ms, 5);
        assert!(!cfg.vcs.enabled);
        assert_eq!(cfg.vcs.remote, "origin");
        assert_eq!(cfg.llm.max_attempts, 3);
    }

    #[test]
    fn validate_rejects_bad_values() {
        let mut cfg = EngineConfig::default();
        cfg.budget.warning_threshold = 1.5;
        assert!(cfg.validate().is_err());

        let mut cfg = EngineConfig::default();
        cfg.llm.command.clear();
        assert!(cfg.validate().is_err());

        let mut cfg = EngineConfig::default();
        cfg.workspace.apps_dir = "  ".to_string();
        assert!(cfg.validate().is_err());

        let mut cfg = EngineConfig::default();
        cfg.poll_interval_ms = 0;
        assert!(cfg.validate().is_err());
    }
}
