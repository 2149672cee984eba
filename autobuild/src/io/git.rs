//! Version-control collaborator.
//!
//! Commits after each successful step are a best-effort side effect, so the
//! seam is a small trait with a `git` subprocess implementation and a no-op
//! one for workspaces without version control.

use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, instrument};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommitOutcome {
    Committed(String),
    NoChanges,
}

pub trait VersionControl: Send + Sync {
    /// Stage `files` (root-relative) and commit them.
    fn commit(&self, message: &str, files: &[String]) -> Result<CommitOutcome>;
    fn push(&self, remote: &str) -> Result<()>;
    fn add_remote(&self, name: &str, url: &str) -> Result<()>;
    fn remote_url(&self, name: &str) -> Result<Option<String>>;
    /// Current commit hash, `None` before the first commit.
    fn head(&self) -> Result<Option<String>>;
}

/// Wrapper for executing git commands in a working directory.
#[derive(Debug, Clone)]
pub struct GitClient {
    workdir: PathBuf,
}

impl GitClient {
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self {
            workdir: workdir.into(),
        }
    }

    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    pub fn is_repository(&self) -> bool {
        self.run(&["rev-parse", "--is-inside-work-tree"])
            .is_ok_and(|output| output.status.success())
    }

    /// True if there is anything staged for commit.
    pub fn has_staged_changes(&self) -> Result<bool> {
        let out = self.run(&["diff", "--cached", "--name-only"])?;
        Ok(!String::from_utf8_lossy(&out.stdout).trim().is_empty())
    }

    fn run_capture(&self, args: &[&str]) -> Result<String> {
        let output = self.run_checked(args)?;
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    fn run_checked(&self, args: &[&str]) -> Result<Output> {
        let output = self.run(args)?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(anyhow!("git {} failed: {}", args.join(" "), stderr.trim()));
        }
        Ok(output)
    }

    fn run(&self, args: &[&str]) -> Result<Output> {
        Command::new("git")
            .args(args)
            .current_dir(&self.workdir)
            .output()
            .with_context(|| format!("spawn git {}", args.join(" ")))
    }
}

impl VersionControl for GitClient {
    #[instrument(skip_all, fields(files = files.len()))]
    fn commit(&self, message: &str, files: &[String]) -> Result<CommitOutcome> {
        if files.is_empty() {
            return Ok(CommitOutcome::NoChanges);
        }
        let mut args = vec!["add", "-A", "--"];
        args.extend(files.iter().map(String::as_str));
        self.run_checked(&args)?;
        if !self.has_staged_changes()? {
            debug!("no staged changes, skipping commit");
            return Ok(CommitOutcome::NoChanges);
        }
        self.run_checked(&["commit", "-m", message])?;
        let hash = self
            .head()?
            .ok_or_else(|| anyhow!("commit succeeded but HEAD is unresolved"))?;
        debug!(hash = %hash, "committed");
        Ok(CommitOutcome::Committed(hash))
    }

    #[instrument(skip_all, fields(remote = %remote))]
    fn push(&self, remote: &str) -> Result<()> {
        self.run_checked(&["push", remote, "HEAD"])?;
        Ok(())
    }

    fn add_remote(&self, name: &str, url: &str) -> Result<()> {
        if self.remote_url(name)?.is_some() {
            self.run_checked(&["remote", "set-url", name, url])?;
        } else {
            self.run_checked(&["remote", "add", name, url])?;
        }
        Ok(())
    }

    fn remote_url(&self, name: &str) -> Result<Option<String>> {
        let output = self.run(&["remote", "get-url", name])?;
        if !output.status.success() {
            return Ok(None);
        }
        let url = String::from_utf8_lossy(&output.stdout).trim().to_string();
        Ok((!url.is_empty()).then_some(url))
    }

    fn head(&self) -> Result<Option<String>> {
        let output = self.run(&["rev-parse", "--verify", "-q", "HEAD"])?;
        if !output.status.success() {
            return Ok(None);
        }
        Ok(Some(String::from_utf8_lossy(&output.stdout).trim().to_string()))
    }
}

/// Used when version control is disabled.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopVcs;

impl VersionControl for NoopVcs {
    fn commit(&self, _message: &str, _files: &[String]) -> Result<CommitOutcome> {
        Ok(CommitOutcome::NoChanges)
    }

    fn push(&self, _remote: &str) -> Result<()> {
        Ok(())
    }

    fn add_remote(&self, _name: &str, _url: &str) -> Result<()> {
        Ok(())
    }

    fn remote_url(&self, _name: &str) -> Result<Option<String>> {
        Ok(None)
    }

    fn head(&self) -> Result<Option<String>> {
        Ok(None)
    }
}

/// Git when enabled and the root is a repository, otherwise a no-op.
pub fn version_control_for(root: &Path, enabled: bool) -> Box<dyn VersionControl> {
    let git = GitClient::new(root);
    if enabled && git.is_repository() {
        Box::new(git)
    } else {
        debug!(enabled, "version control disabled");
        Box::new(NoopVcs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn git(dir: &Path, args: &[&str]) {
        let status = Command::new("git")
            .args(args)
            .current_dir(dir)
            .status()
            .expect("spawn git");
        assert!(status.success(), "git {args:?}");
    }

    fn repo() -> tempfile::TempDir {
        let temp = tempfile::tempdir().expect("tempdir");
        git(temp.path(), &["init", "-q"]);
        git(temp.path(), &["config", "user.email", "engine@example.com"]);
        git(temp.path(), &["config", "user.name", "engine"]);
        temp
    }

    #[test]
    fn commit_reports_hash_then_no_changes() {
        let temp = repo();
        let client = GitClient::new(temp.path());
        assert!(client.head().expect("head").is_none());

        fs::write(temp.path().join("a.txt"), "a").expect("write");
        let files = vec!["a.txt".to_string()];
        let CommitOutcome::Committed(hash) = client.commit("step s1", &files).expect("commit")
        else {
            panic!("expected a commit");
        };
        assert_eq!(client.head().expect("head"), Some(hash));
        assert_eq!(
            client.commit("again", &files).expect("commit"),
            CommitOutcome::NoChanges
        );
    }

    #[test]
    fn remotes_can_be_added_and_read() {
        let temp = repo();
        let client = GitClient::new(temp.path());
        assert!(client.remote_url("origin").expect("url").is_none());
        client
            .add_remote("origin", "https://example.com/a.git")
            .expect("add");
        client
            .add_remote("origin", "https://example.com/b.git")
            .expect("update");
        assert_eq!(
            client.remote_url("origin").expect("url").as_deref(),
            Some("https://example.com/b.git")
        );
    }

    #[test]
    fn non_repository_falls_back_to_noop() {
        let temp = tempfile::tempdir().expect("tempdir");
        let vcs = version_control_for(temp.path(), true);
        assert!(vcs.head().expect("head").is_none());
        assert_eq!(
            vcs.commit("m", &["x".to_string()]).expect("commit"),
            CommitOutcome::NoChanges
        );
    }
}
