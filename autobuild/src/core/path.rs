//! Lexical path confinement for generated files.

use std::path::{Component, Path, PathBuf};

use anyhow::Result;

use crate::error::EngineError;

/// Directories under the workspace root that generated code may never touch.
pub const SYSTEM_DIRS: &[&str] = &[".autobuild", ".git"];

/// Resolve `.` and `..` without touching the filesystem.
///
/// Returns `None` when `..` climbs above the first component.
pub fn normalize_lexical(path: &Path) -> Option<PathBuf> {
    let mut out = PathBuf::new();
    let mut depth = 0usize;
    for component in path.components() {
        match component {
            Component::Prefix(prefix) => out.push(prefix.as_os_str()),
            Component::RootDir => out.push(component.as_os_str()),
            Component::CurDir => {}
            Component::ParentDir => {
                if depth == 0 {
                    return None;
                }
                out.pop();
                depth -= 1;
            }
            Component::Normal(part) => {
                out.push(part);
                depth += 1;
            }
        }
    }
    Some(out)
}

/// Join `candidate` onto `root` and require the result to stay inside it.
pub fn confine(root: &Path, candidate: &str) -> Result<PathBuf> {
    let isolation = || EngineError::WorkspaceIsolation {
        path: candidate.to_string(),
        root: root.display().to_string(),
    };
    let joined = root.join(candidate.replace('\\', "/"));
    let normalized_root = normalize_lexical(root).ok_or_else(isolation)?;
    let normalized = normalize_lexical(&joined).ok_or_else(isolation)?;
    if !normalized.starts_with(&normalized_root) || normalized == normalized_root {
        return Err(isolation().into());
    }
    Ok(normalized)
}

/// Map a generated file path into the application subtree `app_prefix`
/// (for example `apps/todo`), returning a `/`-separated relative path.
///
/// Paths into [`SYSTEM_DIRS`], absolute paths, and paths escaping the root are
/// isolation failures.
pub fn normalize_app_path(app_prefix: &str, file: &str) -> Result<String> {
    let isolation = || EngineError::WorkspaceIsolation {
        path: file.to_string(),
        root: app_prefix.to_string(),
    };
    let cleaned = file.trim().replace('\\', "/");
    let path = Path::new(&cleaned);
    if cleaned.is_empty() || path.is_absolute() || cleaned.starts_with('/') {
        return Err(isolation().into());
    }
    let normalized = normalize_lexical(path).ok_or_else(isolation)?;
    let parts: Vec<String> = normalized
        .components()
        .map(|component| component.as_os_str().to_string_lossy().into_owned())
        .collect();
    let Some(first) = parts.first() else {
        return Err(isolation().into());
    };
    if SYSTEM_DIRS.contains(&first.as_str()) {
        return Err(isolation().into());
    }

    let relative = parts.join("/");
    let prefix = app_prefix.trim_end_matches('/');
    if relative == prefix || relative.starts_with(&format!("{prefix}/")) {
        return Ok(relative);
    }
    Ok(format!("{prefix}/{relative}"))
}
