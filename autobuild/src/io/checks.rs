//! External verification commands (type check, build).

use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use anyhow::{Result, anyhow};
use tracing::{info, instrument, warn};

use crate::io::atomic::write_text;
use crate::io::config::VerifyConfig;
use crate::io::process::run_command_with_timeout;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckOutcome {
    pub passed: bool,
    pub summary: String,
    pub log_path: Option<PathBuf>,
}

pub trait CheckRunner: Send + Sync {
    fn run_check(&self, name: &str, command: &[String], workdir: &Path) -> Result<CheckOutcome>;
}

/// Runs checks as subprocesses and keeps their combined output under
/// `logs_dir/<name>.log`.
pub struct CommandCheckRunner {
    logs_dir: PathBuf,
    timeout: Duration,
    output_limit: usize,
}

impl CommandCheckRunner {
    pub fn new(logs_dir: impl Into<PathBuf>, cfg: &VerifyConfig) -> Self {
        Self {
            logs_dir: logs_dir.into(),
            timeout: Duration::from_secs(cfg.timeout_secs),
            output_limit: cfg.output_limit_bytes,
        }
    }
}

impl CheckRunner for CommandCheckRunner {
    #[instrument(skip_all, fields(check = name, workdir = %workdir.display()))]
    fn run_check(&self, name: &str, command: &[String], workdir: &Path) -> Result<CheckOutcome> {
        let (program, args) = command
            .split_first()
            .ok_or_else(|| anyhow!("check '{name}' has an empty command"))?;
        let mut cmd = Command::new(program);
        cmd.args(args).current_dir(workdir);

        let output = match run_command_with_timeout(cmd, None, self.timeout, self.output_limit) {
            Ok(output) => output,
            Err(err) => {
                warn!(err = %format!("{err:#}"), "check could not start");
                return Ok(CheckOutcome {
                    passed: false,
                    summary: format!("could not run `{}`: {err:#}", command.join(" ")),
                    log_path: None,
                });
            }
        };

        let log_path = self.logs_dir.join(format!("{name}.log"));
        write_text(&log_path, &output.combined_text())?;

        let summary = if output.timed_out {
            format!("timed out after {}s", self.timeout.as_secs())
        } else if output.status.success() {
            "passed".to_string()
        } else {
            format!(
                "exit {:?}; see {}",
                output.status.code(),
                log_path.display()
            )
        };
        let passed = output.succeeded();
        info!(passed, "check finished");
        Ok(CheckOutcome {
            passed,
            summary,
            log_path: Some(log_path),
        })
    }
}
