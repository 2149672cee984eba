//! Intent document parsing, hashing, and requirement deltas.
//!
//! The intent document is markdown with optional YAML frontmatter:
//!
//! ```text
//! ---
//! goal: Build a todo list app
//! requirements:
//!   - id: REQ-001
//!     description: Users can add items
//!     priority: high
//! ---
//! ```
//!
//! Without frontmatter requirements, bullet items under a `Requirements`
//! heading are auto-numbered `REQ-001`, `REQ-002`, ...

use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

static APP_NAME_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r#"(?i)\b(?:app|application|project|tool|service)\s+(?:called|named)\s+["'`]?([a-z0-9][a-z0-9 _-]{0,40}?)["'`]?(?:[.,;:!]|\s*$)"#,
        r"(?i)\b(?:build|create|make|develop|write|implement|design)\s+(?:me\s+)?(?:an?\s+|the\s+)?(?:simple\s+|basic\s+|small\s+|new\s+|minimal\s+)?([a-z0-9][a-z0-9 _-]{0,40}?)\s+(?:web\s+app|app|application|website|site|tool|service|api|dashboard|game|cli)\b",
    ]
    .iter()
    .map(|pattern| Regex::new(pattern).expect("app name pattern should compile"))
    .collect()
});

static REQ_ID: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(REQ-\d+)\s*[:\-–]\s*(.+)$").expect("req id pattern"));

const STOPWORDS: &[&str] = &[
    "that", "this", "with", "from", "have", "will", "should", "must", "they", "them", "their",
    "there", "into", "when", "where", "which", "while", "also", "able", "each", "only", "users",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    High,
    #[default]
    Medium,
    Low,
}

impl FromStr for Priority {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.trim().to_ascii_lowercase().as_str() {
            "high" | "must" | "critical" | "p0" | "p1" => Priority::High,
            "low" | "could" | "nice-to-have" | "p3" => Priority::Low,
            _ => Priority::Medium,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Requirement {
    pub id: String,
    pub description: String,
    #[serde(default)]
    pub priority: Priority,
}

/// Result of parsing an intent document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedIntent {
    pub goal: String,
    pub requirements: Vec<Requirement>,
    pub body: String,
    pub hash: String,
    pub has_structured_schema: bool,
}

/// Requirement set captured when a plan was generated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IntentSnapshot {
    pub intent_hash: String,
    pub requirements: Vec<Requirement>,
    pub captured_at: DateTime<Utc>,
}

impl IntentSnapshot {
    pub fn capture(intent: &ParsedIntent) -> Self {
        Self {
            intent_hash: intent.hash.clone(),
            requirements: intent.requirements.clone(),
            captured_at: Utc::now(),
        }
    }
}

/// Requirement ids that differ between two requirement sets.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct IntentDelta {
    pub added: Vec<String>,
    pub removed: Vec<String>,
    pub changed: Vec<String>,
}

impl IntentDelta {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.changed.is_empty()
    }

    /// Ids whose work must (re)run: added or changed.
    pub fn touched(&self) -> BTreeSet<&str> {
        self.added
            .iter()
            .chain(self.changed.iter())
            .map(String::as_str)
            .collect()
    }
}

impl fmt::Display for IntentDelta {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "added=[{}] removed=[{}] changed=[{}]",
            self.added.join(","),
            self.removed.join(","),
            self.changed.join(",")
        )
    }
}

#[derive(Debug, Default, Deserialize)]
struct Frontmatter {
    #[serde(default)]
    goal: Option<String>,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    requirements: Vec<RawRequirement>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawRequirement {
    Text(String),
    Full {
        #[serde(default)]
        id: Option<String>,
        description: String,
        #[serde(default)]
        priority: Option<String>,
    },
}

/// Parse an intent document into requirements, body, and content hash.
pub fn parse_intent(contents: &str) -> Result<ParsedIntent> {
    let normalized = contents.replace("\r\n", "\n");
    let hash = intent_hash(&normalized);
    let (frontmatter, body) = split_frontmatter(&normalized);

    let parsed: Frontmatter = match frontmatter {
        Some(raw) if !raw.trim().is_empty() => {
            serde_yaml::from_str(raw).context("parse intent frontmatter")?
        }
        _ => Frontmatter::default(),
    };

    let has_structured_schema = !parsed.requirements.is_empty();
    let requirements = if has_structured_schema {
        number_structured(parsed.requirements)
    } else {
        requirements_from_markdown(body)
    };

    let goal = parsed
        .goal
        .or(parsed.title)
        .map(|goal| goal.trim().to_string())
        .filter(|goal| !goal.is_empty())
        .or_else(|| goal_from_markdown(body))
        .unwrap_or_default();

    Ok(ParsedIntent {
        goal,
        requirements,
        body: body.to_string(),
        hash,
        has_structured_schema,
    })
}

/// Hex SHA-256 of the normalized document text.
pub fn intent_hash(contents: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(contents.replace("\r\n", "\n").as_bytes());
    hex::encode(hasher.finalize())
}

/// Set difference on ids, plus description comparison for shared ids.
pub fn compute_intent_delta(old: &[Requirement], new: &[Requirement]) -> IntentDelta {
    let old_by_id: HashMap<&str, &Requirement> =
        old.iter().map(|req| (req.id.as_str(), req)).collect();
    let new_ids: HashSet<&str> = new.iter().map(|req| req.id.as_str()).collect();

    let mut delta = IntentDelta::default();
    for req in new {
        match old_by_id.get(req.id.as_str()) {
            None => delta.added.push(req.id.clone()),
            Some(previous) if previous.description.trim() != req.description.trim() => {
                delta.changed.push(req.id.clone());
            }
            Some(_) => {}
        }
    }
    for req in old {
        if !new_ids.contains(req.id.as_str()) {
            delta.removed.push(req.id.clone());
        }
    }
    delta
}

/// Derive a filesystem-safe application name from the goal text.
///
/// Falls back to `app-<timestamp>` when no pattern matches.
pub fn derive_app_name(goal: &str, now: DateTime<Utc>) -> String {
    for pattern in APP_NAME_PATTERNS.iter() {
        if let Some(captures) = pattern.captures(goal)
            && let Some(name) = captures.get(1)
        {
            let slug = slugify(name.as_str());
            if !slug.is_empty() {
                return slug;
            }
        }
    }
    format!("app-{}", now.format("%Y%m%d%H%M%S"))
}

/// Fraction of the intent's keywords that also appear in `plan_text`.
pub fn content_overlap(intent_text: &str, plan_text: &str) -> f64 {
    let intent_words = keywords(intent_text);
    if intent_words.is_empty() {
        return 0.0;
    }
    let plan_words = keywords(plan_text);
    let shared = intent_words.intersection(&plan_words).count();
    shared as f64 / intent_words.len() as f64
}

pub fn slugify(text: &str) -> String {
    let mut slug = String::new();
    for c in text.trim().chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c.to_ascii_lowercase());
        } else if !slug.ends_with('-') && !slug.is_empty() {
            slug.push('-');
        }
    }
    slug.trim_end_matches('-').to_string()
}

fn keywords(text: &str) -> HashSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|word| word.len() >= 4)
        .map(str::to_lowercase)
        .filter(|word| !STOPWORDS.contains(&word.as_str()))
        .collect()
}

fn number_structured(raw: Vec<RawRequirement>) -> Vec<Requirement> {
    raw.into_iter()
        .enumerate()
        .map(|(index, item)| match item {
            RawRequirement::Text(description) => Requirement {
                id: auto_id(index),
                description: description.trim().to_string(),
                priority: Priority::Medium,
            },
            RawRequirement::Full {
                id,
                description,
                priority,
            } => Requirement {
                id: id
                    .map(|id| id.trim().to_string())
                    .filter(|id| !id.is_empty())
                    .unwrap_or_else(|| auto_id(index)),
                description: description.trim().to_string(),
                priority: priority
                    .as_deref()
                    .and_then(|p| p.parse().ok())
                    .unwrap_or_default(),
            },
        })
        .collect()
}

fn requirements_from_markdown(body: &str) -> Vec<Requirement> {
    let mut requirements = Vec::new();
    let mut in_section = false;
    for line in body.lines() {
        let trimmed = line.trim();
        if trimmed.starts_with('#') {
            in_section = trimmed
                .trim_start_matches('#')
                .trim()
                .to_ascii_lowercase()
                .starts_with("requirement");
            continue;
        }
        if !in_section {
            continue;
        }
        let Some(item) = bullet_text(trimmed) else {
            continue;
        };
        let (id, description) = match REQ_ID.captures(item) {
            Some(captures) => (captures[1].to_string(), captures[2].trim().to_string()),
            None => (auto_id(requirements.len()), item.to_string()),
        };
        if description.is_empty() {
            continue;
        }
        requirements.push(Requirement {
            id,
            description,
            priority: Priority::Medium,
        });
    }
    requirements
}

fn goal_from_markdown(body: &str) -> Option<String> {
    let mut in_goal = false;
    let mut first_line = None;
    for line in body.lines() {
        let trimmed = line.trim();
        if trimmed.starts_with('#') {
            let heading = trimmed.trim_start_matches('#').trim().to_ascii_lowercase();
            in_goal = heading.starts_with("goal");
            continue;
        }
        if trimmed.is_empty() || trimmed.starts_with("<!--") {
            continue;
        }
        if in_goal {
            return Some(trimmed.to_string());
        }
        if first_line.is_none() && bullet_text(trimmed).is_none() {
            first_line = Some(trimmed.to_string());
        }
    }
    first_line
}

fn bullet_text(line: &str) -> Option<&str> {
    let rest = line
        .strip_prefix("- ")
        .or_else(|| line.strip_prefix("* "))
        .or_else(|| {
            let digits = line.chars().take_while(char::is_ascii_digit).count();
            (digits > 0)
                .then(|| line[digits..].strip_prefix(". "))
                .flatten()
        })?;
    let rest = rest
        .strip_prefix("[ ] ")
        .or_else(|| rest.strip_prefix("[x] "))
        .unwrap_or(rest);
    let rest = rest.trim();
    (!rest.is_empty()).then_some(rest)
}

fn auto_id(index: usize) -> String {
    format!("REQ-{:03}", index + 1)
}

fn split_frontmatter(contents: &str) -> (Option<&str>, &str) {
    let Some(after) = contents.strip_prefix("---\n") else {
        return (None, contents);
    };
    if let Some(end) = after.find("\n---\n") {
        return (Some(&after[..end]), &after[end + 5..]);
    }
    if let Some(front) = after.strip_suffix("\n---") {
        return (Some(front), "");
    }
    (None, contents)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn req(id: &str, description: &str) -> Requirement {
        Requirement {
            id: id.to_string(),
            description: description.to_string(),
            priority: Priority::Medium,
        }
    }

    #[test]
    fn delta_detects_added_and_changed() {
        let old = vec![req("R1", "a"), req("R2", "b")];
        let new = vec![req("R1", "a"), req("R2", "c"), req("R3", "d")];
        let delta = compute_intent_delta(&old, &new);
        assert_eq!(delta.added, vec!["R3"]);
        assert!(delta.removed.is_empty());
        assert_eq!(delta.changed, vec!["R2"]);
    }

    #[test]
    fn delta_detects_removed() {
        let delta = compute_intent_delta(&[req("R1", "a")], &[]);
        assert_eq!(delta.removed, vec!["R1"]);
        assert!(delta.touched().is_empty());
    }

    #[test]
    fn parses_structured_frontmatter() {
        let doc = "---\ngoal: Build a todo list app\nrequirements:\n  - id: REQ-010\n    description: Add items\n    priority: high\n  - Remove items\n---\n\n# Notes\n";
        let intent = parse_intent(doc).expect("parse");
        assert!(intent.has_structured_schema);
        assert_eq!(intent.goal, "Build a todo list app");
        assert_eq!(intent.requirements[0].id, "REQ-010");
        assert_eq!(intent.requirements[0].priority, Priority::High);
        assert_eq!(intent.requirements[1].id, "REQ-002");
        assert_eq!(intent.requirements[1].description, "Remove items");
        assert!(intent.body.contains("# Notes"));
    }

    #[test]
    fn auto_numbers_markdown_requirements() {
        let doc = "# Goal\n\nBuild a weather dashboard\n\n## Requirements\n\n- Show current temperature\n- [ ] Show a 5 day forecast\n1. Cache responses\n\n## Notes\n\n- not a requirement\n";
        let intent = parse_intent(doc).expect("parse");
        assert!(!intent.has_structured_schema);
        assert_eq!(intent.goal, "Build a weather dashboard");
        let ids: Vec<&str> = intent.requirements.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["REQ-001", "REQ-002", "REQ-003"]);
        assert_eq!(intent.requirements[1].description, "Show a 5 day forecast");
    }

    #[test]
    fn explicit_ids_in_markdown_are_kept() {
        let doc = "## Requirements\n- REQ-007: Export to CSV\n";
        let intent = parse_intent(doc).expect("parse");
        assert_eq!(intent.requirements, vec![req("REQ-007", "Export to CSV")]);
    }

    #[test]
    fn hash_ignores_line_ending_style() {
        assert_eq!(intent_hash("a\r\nb\n"), intent_hash("a\nb\n"));
        assert_ne!(intent_hash("a\n"), intent_hash("b\n"));
    }

    #[test]
    fn derives_app_name_from_goal() {
        let now = Utc.with_ymd_and_hms(2026, 1, 2, 3, 4, 5).unwrap();
        assert_eq!(derive_app_name("Build a simple todo list app", now), "todo-list");
        assert_eq!(
            derive_app_name("An application called Recipe Box.", now),
            "recipe-box"
        );
        assert_eq!(derive_app_name("???", now), "app-20260102030405");
    }

    #[test]
    fn overlap_counts_shared_keywords() {
        let overlap = content_overlap("todo list items", "Create todo items list view");
        assert!((overlap - 1.0).abs() < f64::EPSILON);
        assert_eq!(content_overlap("", "anything"), 0.0);
    }
}
