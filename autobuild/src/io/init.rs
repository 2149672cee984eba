//! `.autobuild/` layout and scaffolding.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use tracing::info;

use crate::core::policy::PolicyRules;
use crate::core::types::ExecutionState;
use crate::io::atomic::write_text;
use crate::io::config::{EngineConfig, write_config};

pub const CONTROL_DIR: &str = ".autobuild";

/// All canonical paths within `.autobuild/` for a project root.
#[derive(Debug, Clone)]
pub struct ControlPaths {
    pub root: PathBuf,
    pub control_dir: PathBuf,
    pub gitignore_path: PathBuf,
    pub state_path: PathBuf,
    pub config_path: PathBuf,
    pub intent_path: PathBuf,
    pub suggested_intent_path: PathBuf,
    pub rules_path: PathBuf,
    pub plan_path: PathBuf,
    pub progress_path: PathBuf,
    pub report_path: PathBuf,
    pub questions_path: PathBuf,
    pub budget_path: PathBuf,
    pub snapshot_path: PathBuf,
    pub traceability_path: PathBuf,
    pub provenance_path: PathBuf,
    pub audit_path: PathBuf,
    pub lock_path: PathBuf,
    pub checkpoints_dir: PathBuf,
    pub backups_dir: PathBuf,
    pub verify_logs_dir: PathBuf,
}

impl ControlPaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let control_dir = root.join(CONTROL_DIR);
        Self {
            root: root.clone(),
            gitignore_path: control_dir.join(".gitignore"),
            state_path: control_dir.join("state"),
            config_path: control_dir.join("config.toml"),
            intent_path: control_dir.join("intent.md"),
            suggested_intent_path: control_dir.join("intent.suggested.md"),
            rules_path: control_dir.join("rules.toml"),
            plan_path: control_dir.join("plan.md"),
            progress_path: control_dir.join("progress.json"),
            report_path: control_dir.join("report.md"),
            questions_path: control_dir.join("questions.md"),
            budget_path: control_dir.join("budget.json"),
            snapshot_path: control_dir.join("intent_snapshot.json"),
            traceability_path: control_dir.join("traceability.json"),
            provenance_path: control_dir.join("provenance.jsonl"),
            audit_path: control_dir.join("audit.log"),
            lock_path: control_dir.join("lock.json"),
            checkpoints_dir: control_dir.join("checkpoints"),
            backups_dir: control_dir.join("backups"),
            verify_logs_dir: control_dir.join("verify"),
            control_dir,
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.state_path.is_file()
    }

    /// Fail with a hint when `init` has not been run.
    pub fn ensure_initialized(&self) -> Result<()> {
        if !self.is_initialized() {
            return Err(anyhow!(
                "{} is not initialized (run `autobuild init` first)",
                self.control_dir.display()
            ));
        }
        Ok(())
    }
}

/// Options for `init_control`.
#[derive(Debug, Clone)]
pub struct InitOptions {
    /// If true, overwrite existing control files.
    pub force: bool,
}

/// Create `.autobuild/` scaffolding in `root`.
///
/// Fails if `.autobuild/` already exists unless `options.force` is set.
pub fn init_control(root: &Path, options: &InitOptions) -> Result<ControlPaths> {
    let paths = ControlPaths::new(root);
    if paths.control_dir.exists() && !paths.control_dir.is_dir() {
        return Err(anyhow!(
            "autobuild init: {CONTROL_DIR} exists but is not a directory"
        ));
    }
    if paths.control_dir.exists() && !options.force {
        return Err(anyhow!(
            "autobuild init: {CONTROL_DIR} already exists (use --force to overwrite)"
        ));
    }

    for dir in [&paths.control_dir, &paths.checkpoints_dir, &paths.backups_dir] {
        fs::create_dir_all(dir).with_context(|| format!("create directory {}", dir.display()))?;
    }

    write_text(&paths.gitignore_path, CONTROL_GITIGNORE)?;
    write_text(&paths.state_path, &state_token(ExecutionState::Plan))?;
    write_config(&paths.config_path, &EngineConfig::default())?;
    write_text(&paths.rules_path, &PolicyRules::default().to_toml()?)?;
    write_text(&paths.intent_path, INTENT_PLACEHOLDER)?;
    write_text(&paths.questions_path, QUESTIONS_PLACEHOLDER)?;

    info!(root = %root.display(), force = options.force, "initialized control directory");
    Ok(paths)
}

pub(crate) fn state_token(state: ExecutionState) -> String {
    format!("{}\n", state.as_str())
}

const CONTROL_GITIGNORE: &str = "lock.json\nbackups/\ncheckpoints/\naudit.log\nverify/\n";
const INTENT_PLACEHOLDER: &str = "---\ngoal: Describe the application to build.\nrequirements: []\n---\n\n# Goal\n\nDescribe the application to build.\n\n## Requirements\n\n";
pub(crate) const QUESTIONS_PLACEHOLDER: &str = "# Open Questions\n\n";
