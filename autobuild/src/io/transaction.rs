//! Atomic multi-file writes with policy validation and rollback.
//!
//! A transaction either applies every operation or leaves the workspace
//! byte-identical to how it found it.

use std::fs;
use std::path::{Component, Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use chrono::Utc;
use rand::Rng;
use rand::distributions::Alphanumeric;
use tracing::{debug, instrument, warn};

use crate::core::path::{SYSTEM_DIRS, confine, normalize_lexical};
use crate::core::policy::PolicyValidator;
use crate::error::EngineError;
use crate::io::atomic::write_atomic;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileOperation {
    Create { path: String, content: String },
    Modify { path: String, content: String },
    Delete { path: String },
}

impl FileOperation {
    pub fn path(&self) -> &str {
        match self {
            FileOperation::Create { path, .. }
            | FileOperation::Modify { path, .. }
            | FileOperation::Delete { path } => path,
        }
    }

    pub fn content(&self) -> Option<&str> {
        match self {
            FileOperation::Create { content, .. } | FileOperation::Modify { content, .. } => {
                Some(content)
            }
            FileOperation::Delete { .. } => None,
        }
    }
}

/// Files touched by a committed transaction (root-relative, `/`-separated).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommitSummary {
    pub written: Vec<String>,
    pub deleted: Vec<String>,
}

#[derive(Debug)]
struct Backup {
    target: PathBuf,
    saved: PathBuf,
}

pub struct FileTransaction<'a> {
    root: PathBuf,
    backup_dir: PathBuf,
    validator: Option<&'a PolicyValidator>,
    operations: Vec<FileOperation>,
    backups: Vec<Backup>,
    created_files: Vec<PathBuf>,
    created_dirs: Vec<PathBuf>,
}

impl<'a> FileTransaction<'a> {
    /// `backups_root` receives one timestamped directory per transaction.
    pub fn new(
        root: impl Into<PathBuf>,
        backups_root: &Path,
        validator: Option<&'a PolicyValidator>,
    ) -> Self {
        Self {
            root: root.into(),
            backup_dir: backups_root.join(transaction_id()),
            validator,
            operations: Vec::new(),
            backups: Vec::new(),
            created_files: Vec::new(),
            created_dirs: Vec::new(),
        }
    }

    pub fn add_operation(&mut self, operation: FileOperation) {
        self.operations.push(operation);
    }

    pub fn operations(&self) -> &[FileOperation] {
        &self.operations
    }

    /// Resolve, validate, back up, then apply every operation. Any failure
    /// rolls back and returns the original error.
    #[instrument(skip_all, fields(operations = self.operations.len()))]
    pub fn commit(&mut self) -> Result<CommitSummary> {
        match self.apply_all() {
            Ok(summary) => {
                self.discard_backups();
                self.reset();
                debug!(
                    written = summary.written.len(),
                    deleted = summary.deleted.len(),
                    "transaction committed"
                );
                Ok(summary)
            }
            Err(err) => {
                if let Err(rollback_err) = self.rollback() {
                    warn!(err = %rollback_err, "rollback incomplete");
                    return Err(err.context(format!("rollback incomplete: {rollback_err:#}")));
                }
                Err(err)
            }
        }
    }

    /// Restore every backed-up file, remove created files and directories,
    /// and clear the transaction.
    pub fn rollback(&mut self) -> Result<()> {
        let mut first_error = None;
        for backup in self.backups.iter().rev() {
            let restored = fs::read(&backup.saved)
                .with_context(|| format!("read backup {}", backup.saved.display()))
                .and_then(|bytes| write_atomic(&backup.target, &bytes));
            if let Err(err) = restored {
                warn!(target = %backup.target.display(), err = %err, "restore failed");
                first_error.get_or_insert(err);
            }
        }
        for file in self.created_files.iter().rev() {
            if let Err(err) = fs::remove_file(file)
                && err.kind() != std::io::ErrorKind::NotFound
            {
                warn!(file = %file.display(), err = %err, "remove created file failed");
                first_error.get_or_insert(anyhow!(err).context(format!("remove {}", file.display())));
            }
        }
        for dir in self.created_dirs.iter().rev() {
            // Only empty directories this transaction created.
            let _ = fs::remove_dir(dir);
        }
        if !self.backups.is_empty() || !self.created_files.is_empty() {
            debug!(
                restored = self.backups.len(),
                removed = self.created_files.len(),
                "transaction rolled back"
            );
        }
        self.discard_backups();
        self.reset();
        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn apply_all(&mut self) -> Result<CommitSummary> {
        let operations = self.operations.clone();
        let mut resolved = Vec::with_capacity(operations.len());
        for operation in &operations {
            resolved.push(self.resolve(operation.path())?);
        }

        if let Some(validator) = self.validator {
            for (operation, (_, relative)) in operations.iter().zip(&resolved) {
                if let Some(content) = operation.content()
                    && let Some(violation) = validator.check(relative, content)
                {
                    return Err(EngineError::PolicyViolation(violation).into());
                }
            }
        }

        let mut summary = CommitSummary::default();
        for (operation, (target, relative)) in operations.iter().zip(resolved) {
            match operation {
                FileOperation::Create { content, .. } | FileOperation::Modify { content, .. } => {
                    if target.exists() {
                        self.back_up(&target, &relative)?;
                        write_atomic(&target, content.as_bytes())?;
                    } else {
                        self.ensure_parent(&target)?;
                        write_atomic(&target, content.as_bytes())?;
                        if !self.is_tracked(&target) {
                            self.created_files.push(target.clone());
                        }
                    }
                    summary.written.push(relative);
                }
                FileOperation::Delete { .. } => {
                    if !target.exists() {
                        warn!(path = %relative, "delete of missing file skipped");
                        continue;
                    }
                    self.back_up(&target, &relative)?;
                    fs::remove_file(&target)
                        .with_context(|| format!("delete {}", target.display()))?;
                    summary.deleted.push(relative);
                }
            }
        }
        Ok(summary)
    }

    /// Confine `relative` to the root lexically and through existing
    /// ancestors (symlinks included).
    fn resolve(&self, relative: &str) -> Result<(PathBuf, String)> {
        let isolation = || EngineError::WorkspaceIsolation {
            path: relative.to_string(),
            root: self.root.display().to_string(),
        };
        let target = confine(&self.root, relative)?;
        let root = normalize_lexical(&self.root).unwrap_or_else(|| self.root.clone());
        let rel_path = target
            .strip_prefix(&root)
            .map_err(|_| isolation())?
            .to_path_buf();
        let rel = rel_path
            .components()
            .filter_map(|component| match component {
                Component::Normal(part) => Some(part.to_string_lossy().into_owned()),
                _ => None,
            })
            .collect::<Vec<_>>();
        if rel.first().is_some_and(|first| SYSTEM_DIRS.contains(&first.as_str())) {
            return Err(isolation().into());
        }

        let canonical_root = fs::canonicalize(&self.root)
            .with_context(|| format!("canonicalize {}", self.root.display()))?;
        if target.is_symlink() {
            let resolved = fs::canonicalize(&target).map_err(|_| isolation())?;
            if !resolved.starts_with(&canonical_root) {
                return Err(isolation().into());
            }
        }
        let mut ancestor = target.parent();
        while let Some(dir) = ancestor {
            if dir.exists() {
                let canonical = fs::canonicalize(dir)
                    .with_context(|| format!("canonicalize {}", dir.display()))?;
                if !canonical.starts_with(&canonical_root) {
                    return Err(isolation().into());
                }
                break;
            }
            ancestor = dir.parent();
        }
        Ok((target, rel.join("/")))
    }

    /// Whether `target` already has its pre-transaction state recorded.
    fn is_tracked(&self, target: &Path) -> bool {
        self.backups.iter().any(|backup| backup.target == target)
            || self.created_files.iter().any(|file| file == target)
    }

    /// Save `target` once; later operations on the same path must not
    /// replace the original content.
    fn back_up(&mut self, target: &Path, relative: &str) -> Result<()> {
        if self.is_tracked(target) {
            return Ok(());
        }
        let saved = self.backup_dir.join(relative);
        if let Some(parent) = saved.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create backup dir {}", parent.display()))?;
        }
        fs::copy(target, &saved)
            .with_context(|| format!("back up {} to {}", target.display(), saved.display()))?;
        self.backups.push(Backup {
            target: target.to_path_buf(),
            saved,
        });
        Ok(())
    }

    fn ensure_parent(&mut self, target: &Path) -> Result<()> {
        let Some(parent) = target.parent() else {
            return Ok(());
        };
        let mut missing = Vec::new();
        let mut cursor = Some(parent);
        while let Some(dir) = cursor {
            if dir.exists() {
                break;
            }
            missing.push(dir.to_path_buf());
            cursor = dir.parent();
        }
        for dir in missing.into_iter().rev() {
            fs::create_dir(&dir).with_context(|| format!("create directory {}", dir.display()))?;
            self.created_dirs.push(dir);
        }
        Ok(())
    }

    fn discard_backups(&self) {
        if self.backup_dir.exists()
            && let Err(err) = fs::remove_dir_all(&self.backup_dir)
        {
            warn!(dir = %self.backup_dir.display(), err = %err, "failed to remove backups");
        }
    }

    fn reset(&mut self) {
        self.operations.clear();
        self.backups.clear();
        self.created_files.clear();
        self.created_dirs.clear();
    }
}

fn transaction_id() -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(4)
        .map(char::from)
        .collect();
    format!(
        "{}-{}",
        Utc::now().format("%Y%m%dT%H%M%S%6f"),
        suffix.to_lowercase()
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    use crate::core::policy::PolicyRules;
    use crate::error::{ErrorCategory, categorize};

    /// Every file and directory under `root` (excluding `.autobuild`) with contents.
    fn snapshot(root: &Path) -> BTreeMap<String, Option<Vec<u8>>> {
        let mut out = BTreeMap::new();
        let mut stack = vec![root.to_path_buf()];
        while let Some(dir) = stack.pop() {
            for entry in fs::read_dir(&dir).expect("read dir") {
                let path = entry.expect("entry").path();
                let rel = path
                    .strip_prefix(root)
                    .expect("prefix")
                    .to_string_lossy()
                    .into_owned();
                if rel.starts_with(".autobuild") {
                    continue;
                }
                if path.is_dir() {
                    out.insert(rel, None);
                    stack.push(path);
                } else {
                    out.insert(rel, Some(fs::read(&path).expect("read")));
                }
            }
        }
        out
    }

    fn setup() -> (tempfile::TempDir, PathBuf) {
        let temp = tempfile::tempdir().expect("tempdir");
        let backups = temp.path().join(".autobuild/backups");
        fs::create_dir_all(&backups).expect("backups");
        fs::write(temp.path().join("a.txt"), "original a").expect("a");
        fs::write(temp.path().join("c.txt"), "original c").expect("c");
        (temp, backups)
    }

    #[test]
    fn commit_applies_every_operation() {
        let (temp, backups) = setup();
        let mut txn = FileTransaction::new(temp.path(), &backups, None);
        txn.add_operation(FileOperation::Modify {
            path: "a.txt".to_string(),
            content: "new a".to_string(),
        });
        txn.add_operation(FileOperation::Create {
            path: "dir/b.ts".to_string(),
            content: "export const b = 1;\n".to_string(),
        });
        txn.add_operation(FileOperation::Delete {
            path: "c.txt".to_string(),
        });

        let summary = txn.commit().expect("commit");
        assert_eq!(summary.written, vec!["a.txt", "dir/b.ts"]);
        assert_eq!(summary.deleted, vec!["c.txt"]);
        assert_eq!(fs::read_to_string(temp.path().join("a.txt")).expect("a"), "new a");
        assert!(temp.path().join("dir/b.ts").is_file());
        assert!(!temp.path().join("c.txt").exists());
        assert!(txn.operations().is_empty());
        assert_eq!(fs::read_dir(&backups).expect("backups").count(), 0);
    }

    #[test]
    fn policy_violation_leaves_workspace_untouched() {
        let (temp, backups) = setup();
        let before = snapshot(temp.path());
        let validator = PolicyValidator::new(PolicyRules::default()).expect("validator");
        let mut txn = FileTransaction::new(temp.path(), &backups, Some(&validator));
        txn.add_operation(FileOperation::Modify {
            path: "a.txt".to_string(),
            content: "changed".to_string(),
        });
        txn.add_operation(FileOperation::Create {
            path: "src/bad.ts".to_string(),
            content: "export const x: any = 1;\n".to_string(),
        });

        let err = txn.commit().expect_err("violation");
        let Some(EngineError::PolicyViolation(violation)) = err.downcast_ref::<EngineError>()
        else {
            panic!("expected policy violation, got {err:#}");
        };
        assert_eq!(violation.file_path, "src/bad.ts");
        assert_eq!(snapshot(temp.path()), before);
    }

    #[test]
    fn exception_marker_lets_content_through() {
        let (temp, backups) = setup();
        let validator = PolicyValidator::new(PolicyRules::default()).expect("validator");
        let mut txn = FileTransaction::new(temp.path(), &backups, Some(&validator));
        txn.add_operation(FileOperation::Create {
            path: "src/ok.ts".to_string(),
            content: "// policy-allow: untyped payload\nexport const x: any = 1;\n".to_string(),
        });
        txn.commit().expect("commit");
    }

    #[test]
    fn mid_apply_failure_rolls_back_byte_identical() {
        let (temp, backups) = setup();
        let before = snapshot(temp.path());
        let mut txn = FileTransaction::new(temp.path(), &backups, None);
        txn.add_operation(FileOperation::Modify {
            path: "a.txt".to_string(),
            content: "changed".to_string(),
        });
        txn.add_operation(FileOperation::Delete {
            path: "c.txt".to_string(),
        });
        txn.add_operation(FileOperation::Create {
            path: "deep/nested/new.ts".to_string(),
            content: "export {};\n".to_string(),
        });
        // a.txt is a file, so creating beneath it fails after earlier writes.
        txn.add_operation(FileOperation::Create {
            path: "a.txt/child.ts".to_string(),
            content: "export {};\n".to_string(),
        });

        txn.commit().expect_err("apply failure");
        assert_eq!(snapshot(temp.path()), before);
        assert!(txn.operations().is_empty());
    }

    #[test]
    fn repeated_paths_roll_back_to_the_original() {
        let (temp, backups) = setup();
        let before = snapshot(temp.path());
        let mut txn = FileTransaction::new(temp.path(), &backups, None);
        for content in ["first", "second"] {
            txn.add_operation(FileOperation::Modify {
                path: "a.txt".to_string(),
                content: content.to_string(),
            });
        }
        txn.add_operation(FileOperation::Delete {
            path: "a.txt".to_string(),
        });
        txn.add_operation(FileOperation::Delete {
            path: "c.txt".to_string(),
        });
        txn.add_operation(FileOperation::Create {
            path: "c.txt".to_string(),
            content: "recreated".to_string(),
        });
        txn.add_operation(FileOperation::Create {
            path: "c.txt/child.ts".to_string(),
            content: "export {};\n".to_string(),
        });

        txn.commit().expect_err("apply failure");
        assert_eq!(snapshot(temp.path()), before);
        assert_eq!(
            fs::read_to_string(temp.path().join("a.txt")).expect("a"),
            "original a"
        );
    }

    #[test]
    fn escaping_and_control_paths_are_isolation_errors() {
        let (temp, backups) = setup();
        for bad in ["../escape.txt", ".autobuild/state", "/etc/hosts"] {
            let mut txn = FileTransaction::new(temp.path(), &backups, None);
            txn.add_operation(FileOperation::Create {
                path: bad.to_string(),
                content: "x".to_string(),
            });
            let err = txn.commit().expect_err(bad);
            assert_eq!(categorize(&err), ErrorCategory::WorkspaceIsolation, "{bad}");
        }
    }

    #[cfg(unix)]
    #[test]
    fn symlinked_directory_out_of_root_is_rejected() {
        let (temp, backups) = setup();
        let outside = tempfile::tempdir().expect("outside");
        std::os::unix::fs::symlink(outside.path(), temp.path().join("link")).expect("symlink");
        let mut txn = FileTransaction::new(temp.path(), &backups, None);
        txn.add_operation(FileOperation::Create {
            path: "link/evil.txt".to_string(),
            content: "x".to_string(),
        });
        let err = txn.commit().expect_err("symlink escape");
        assert_eq!(categorize(&err), ErrorCategory::WorkspaceIsolation);
        assert!(!outside.path().join("evil.txt").exists());
    }
}
