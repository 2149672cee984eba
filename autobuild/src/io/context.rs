//! Selects existing application files to send along with a code request.

use std::collections::HashSet;
use std::fs;
use std::path::Path;

use anyhow::Result;
use serde::Serialize;
use tracing::debug;
use walkdir::WalkDir;

use crate::core::path::normalize_app_path;
use crate::core::plan::Step;

pub(crate) const SKIPPED_DIRS: &[&str] = &["node_modules", ".git", "dist", "build", "target", ".next"];

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ContextFile {
    pub path: String,
    pub content: String,
}

#[derive(Debug, Clone, Copy)]
pub struct ContextLimits {
    pub max_files: usize,
    pub max_bytes: usize,
}

/// The step's own target files first, then the rest of the application
/// subtree in path order, until either limit is reached.
pub fn select_context(
    root: &Path,
    app_prefix: &str,
    step: &Step,
    limits: ContextLimits,
) -> Result<Vec<ContextFile>> {
    let mut candidates: Vec<String> = step
        .files
        .iter()
        .filter_map(|file| normalize_app_path(app_prefix, file).ok())
        .collect();

    let app_dir = root.join(app_prefix);
    if app_dir.is_dir() {
        let walker = WalkDir::new(&app_dir)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|entry| {
                !(entry.file_type().is_dir()
                    && SKIPPED_DIRS.iter().any(|skip| entry.file_name() == *skip))
            });
        for entry in walker.filter_map(|entry| entry.ok()) {
            if !entry.file_type().is_file() {
                continue;
            }
            if let Ok(relative) = entry.path().strip_prefix(root) {
                candidates.push(relative.to_string_lossy().replace('\\', "/"));
            }
        }
    }

    let mut seen = HashSet::new();
    let mut selected = Vec::new();
    let mut used_bytes = 0usize;
    for relative in candidates {
        if selected.len() >= limits.max_files {
            break;
        }
        if !seen.insert(relative.clone()) {
            continue;
        }
        let Ok(content) = fs::read_to_string(root.join(&relative)) else {
            continue;
        };
        if used_bytes + content.len() > limits.max_bytes {
            continue;
        }
        used_bytes += content.len();
        selected.push(ContextFile {
            path: relative,
            content,
        });
    }
    debug!(files = selected.len(), bytes = used_bytes, "context selected");
    Ok(selected)
}
