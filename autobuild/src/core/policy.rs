//! Policy rules and the static checks run against generated file content.
//!
//! TypeScript and JavaScript sources are inspected with tree-sitter; other
//! code falls back to regex matching. Security and cleanup heuristics are
//! textual for every file.

use std::fmt;
use std::path::Path;

use anyhow::{Context, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use tree_sitter::{Language, Node, Parser};

const SNIPPET_MAX_CHARS: usize = 120;

const NON_CODE_EXTENSIONS: &[&str] = &[
    "md", "markdown", "txt", "json", "jsonc", "css", "scss", "sass", "less", "html", "htm",
    "svg", "yml", "yaml", "toml", "lock", "env", "gitignore", "png", "jpg", "ico",
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityPattern {
    pub pattern: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleanupRule {
    pub acquire: String,
    pub release: String,
}

/// Contents of `rules.toml`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyRules {
    pub forbidden_imports: Vec<String>,
    pub forbidden_types: Vec<String>,
    pub security_patterns: Vec<SecurityPattern>,
    pub cleanup: Vec<CleanupRule>,
    pub exception_marker: String,
    pub guidance: String,
}

impl Default for PolicyRules {
    fn default() -> Self {
        let security = |pattern: &str, message: &str| SecurityPattern {
            pattern: pattern.to_string(),
            message: message.to_string(),
        };
        let cleanup = |acquire: &str, release: &str| CleanupRule {
            acquire: acquire.to_string(),
            release: release.to_string(),
        };
        Self {
            forbidden_imports: Vec::new(),
            forbidden_types: vec!["any".to_string()],
            security_patterns: vec![
                security(r"\beval\s*\(", "eval() executes arbitrary code"),
                security(r"\bnew\s+Function\s*\(", "new Function() executes arbitrary code"),
                security(
                    r"dangerouslySetInnerHTML",
                    "dangerouslySetInnerHTML bypasses HTML escaping",
                ),
                security(
                    r"\.innerHTML\s*=[^=]",
                    "assigning innerHTML bypasses HTML escaping",
                ),
            ],
            cleanup: vec![
                cleanup("setInterval", "clearInterval"),
                cleanup("addEventListener", "removeEventListener"),
            ],
            exception_marker: "policy-allow".to_string(),
            guidance: String::new(),
        }
    }
}

impl PolicyRules {
    pub fn from_toml(contents: &str) -> Result<Self> {
        let rules: PolicyRules = toml::from_str(contents).context("parse policy rules")?;
        rules.validate()?;
        Ok(rules)
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("serialize policy rules")
    }

    pub fn validate(&self) -> Result<()> {
        for pattern in &self.security_patterns {
            Regex::new(&pattern.pattern)
                .with_context(|| format!("invalid security pattern '{}'", pattern.pattern))?;
        }
        if self.exception_marker.trim().is_empty() {
            anyhow::bail!("exception_marker must not be empty");
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolationType {
    ForbiddenImport,
    ForbiddenType,
    SecurityPattern,
    MissingCleanup,
}

impl ViolationType {
    pub fn as_str(self) -> &'static str {
        match self {
            ViolationType::ForbiddenImport => "forbidden_import",
            ViolationType::ForbiddenType => "forbidden_type",
            ViolationType::SecurityPattern => "security_pattern",
            ViolationType::MissingCleanup => "missing_cleanup",
        }
    }

    /// Whether a corrective regeneration is worth attempting.
    pub fn is_correctable(self) -> bool {
        matches!(self, ViolationType::ForbiddenType)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ViolationDetail {
    pub line: usize,
    pub message: String,
    pub snippet: String,
}

/// All findings of one category in one file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyViolation {
    pub file_path: String,
    pub violation_type: ViolationType,
    pub violations: Vec<ViolationDetail>,
    pub suggested_fix: String,
}

impl PolicyViolation {
    /// Stable key used to detect the same violation recurring.
    pub fn signature(&self) -> String {
        let lines: Vec<String> = self
            .violations
            .iter()
            .map(|detail| detail.message.clone())
            .collect();
        format!(
            "{}|{}|{}",
            self.violation_type.as_str(),
            self.file_path,
            lines.join(";")
        )
    }
}

impl fmt::Display for PolicyViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} in {}",
            self.violation_type.as_str(),
            self.file_path
        )?;
        for detail in &self.violations {
            write!(f, "; line {}: {}", detail.line, detail.message)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SourceKind {
    TypeScript,
    Tsx,
    OtherCode,
    NonCode,
}

fn source_kind(path: &str) -> SourceKind {
    let ext = Path::new(path)
        .extension()
        .and_then(|ext| ext.to_str())
        .map(str::to_ascii_lowercase)
        .unwrap_or_default();
    match ext.as_str() {
        "ts" | "mts" | "cts" => SourceKind::TypeScript,
        "tsx" | "js" | "jsx" | "mjs" | "cjs" => SourceKind::Tsx,
        "" => SourceKind::NonCode,
        other if NON_CODE_EXTENSIONS.contains(&other) => SourceKind::NonCode,
        _ => SourceKind::OtherCode,
    }
}

/// Compiled form of [`PolicyRules`].
#[derive(Debug)]
pub struct PolicyValidator {
    rules: PolicyRules,
    security: Vec<(Regex, String)>,
    cleanup: Vec<(Regex, Regex, CleanupRule)>,
    type_patterns: Vec<(Regex, String)>,
    import_patterns: Vec<(Regex, String)>,
}

impl PolicyValidator {
    pub fn new(rules: PolicyRules) -> Result<Self> {
        let mut security = Vec::new();
        for pattern in &rules.security_patterns {
            let regex = Regex::new(&pattern.pattern)
                .with_context(|| format!("compile security pattern '{}'", pattern.pattern))?;
            security.push((regex, pattern.message.clone()));
        }

        let mut cleanup = Vec::new();
        for rule in &rules.cleanup {
            let acquire = Regex::new(&format!(r"\b{}\s*\(", regex::escape(&rule.acquire)))
                .context("compile cleanup acquire")?;
            let release = Regex::new(&format!(r"\b{}\s*\(", regex::escape(&rule.release)))
                .context("compile cleanup release")?;
            cleanup.push((acquire, release, rule.clone()));
        }

        let mut type_patterns = Vec::new();
        for name in &rules.forbidden_types {
            let regex = Regex::new(&format!(
                r"(?::\s*|\bas\s+|<\s*|\|\s*)({})\b",
                regex::escape(name)
            ))
            .context("compile forbidden type")?;
            type_patterns.push((regex, name.clone()));
        }

        let mut import_patterns = Vec::new();
        for module in &rules.forbidden_imports {
            let quoted = format!(r#"['"]{}(?:/[^'"]*)?['"]"#, regex::escape(module));
            let regex = Regex::new(&format!(
                r#"(?:\bfrom\s+{quoted}|\bimport\s+{quoted}|\brequire\s*\(\s*{quoted}|\bimport\s*\(\s*{quoted}|^\s*import\s+{module}\b|^\s*from\s+{module}\s+import\b)"#,
                module = regex::escape(module),
            ))
            .context("compile forbidden import")?;
            import_patterns.push((regex, module.clone()));
        }

        Ok(Self {
            rules,
            security,
            cleanup,
            type_patterns,
            import_patterns,
        })
    }

    pub fn rules(&self) -> &PolicyRules {
        &self.rules
    }

    /// First violation category found in `content`, if any.
    pub fn check(&self, file_path: &str, content: &str) -> Option<PolicyViolation> {
        self.check_all(file_path, content).into_iter().next()
    }

    /// Every violation category found in `content`, in severity order.
    pub fn check_all(&self, file_path: &str, content: &str) -> Vec<PolicyViolation> {
        let lines: Vec<&str> = content.lines().collect();
        let kind = source_kind(file_path);

        let (imports, types) = match kind {
            SourceKind::NonCode => (Vec::new(), Vec::new()),
            SourceKind::OtherCode => (self.regex_imports(&lines), self.regex_types(&lines)),
            SourceKind::TypeScript | SourceKind::Tsx => match self.syntax_findings(kind, content) {
                Some(found) => found,
                None => (self.regex_imports(&lines), self.regex_types(&lines)),
            },
        };

        let mut found = Vec::new();
        let mut push = |violation_type: ViolationType, details: Vec<Hit>| {
            let details: Vec<ViolationDetail> = details
                .into_iter()
                .filter(|hit| !self.is_exempt(&lines, hit.line))
                .map(|hit| ViolationDetail {
                    line: hit.line,
                    snippet: snippet(&lines, hit.line),
                    message: hit.message,
                })
                .collect();
            if !details.is_empty() {
                found.push(PolicyViolation {
                    file_path: file_path.to_string(),
                    violation_type,
                    suggested_fix: self.suggested_fix(violation_type, &details),
                    violations: details,
                });
            }
        };

        push(ViolationType::ForbiddenImport, imports);
        push(ViolationType::ForbiddenType, types);
        push(ViolationType::SecurityPattern, self.security_hits(&lines));
        push(ViolationType::MissingCleanup, self.cleanup_hits(content, &lines));
        found
    }

    fn is_exempt(&self, lines: &[&str], line: usize) -> bool {
        let marker = self.rules.exception_marker.as_str();
        let on_line = lines
            .get(line.saturating_sub(1))
            .is_some_and(|text| text.contains(marker));
        let above = line >= 2
            && lines
                .get(line - 2)
                .is_some_and(|text| text.contains(marker));
        on_line || above
    }

    fn suggested_fix(&self, violation_type: ViolationType, details: &[ViolationDetail]) -> String {
        match violation_type {
            ViolationType::ForbiddenType => format!(
                "Replace forbidden types ({}) with precise types, or `unknown` plus narrowing.",
                self.rules.forbidden_types.join(", ")
            ),
            ViolationType::ForbiddenImport => format!(
                "Remove imports of {} and use an allowed alternative.",
                self.rules.forbidden_imports.join(", ")
            ),
            ViolationType::SecurityPattern => {
                "Remove the flagged construct; render untrusted data through safe APIs.".to_string()
            }
            ViolationType::MissingCleanup => {
                let first = details
                    .first()
                    .map(|detail| detail.message.as_str())
                    .unwrap_or_default();
                format!("Release every acquired resource in a cleanup path ({first}).")
            }
        }
    }

    fn regex_types(&self, lines: &[&str]) -> Vec<Hit> {
        let mut hits = Vec::new();
        for (index, line) in lines.iter().enumerate() {
            for (regex, name) in &self.type_patterns {
                if regex.is_match(line) {
                    hits.push(Hit::new(index + 1, format!("forbidden type `{name}`")));
                }
            }
        }
        hits
    }

    fn regex_imports(&self, lines: &[&str]) -> Vec<Hit> {
        let mut hits = Vec::new();
        for (index, line) in lines.iter().enumerate() {
            for (regex, module) in &self.import_patterns {
                if regex.is_match(line) {
                    hits.push(Hit::new(index + 1, format!("forbidden import `{module}`")));
                }
            }
        }
        hits
    }

    fn security_hits(&self, lines: &[&str]) -> Vec<Hit> {
        let mut hits = Vec::new();
        for (index, line) in lines.iter().enumerate() {
            for (regex, message) in &self.security {
                if regex.is_match(line) {
                    hits.push(Hit::new(index + 1, message.clone()));
                }
            }
        }
        hits
    }

    fn cleanup_hits(&self, content: &str, lines: &[&str]) -> Vec<Hit> {
        let mut hits = Vec::new();
        for (acquire, release, rule) in &self.cleanup {
            if release.is_match(content) {
                continue;
            }
            if let Some(index) = lines.iter().position(|line| acquire.is_match(line)) {
                hits.push(Hit::new(
                    index + 1,
                    format!("`{}` without a matching `{}`", rule.acquire, rule.release),
                ));
            }
        }
        hits
    }

    /// Import and type findings from the syntax tree; `None` when the source
    /// cannot be parsed cleanly.
    fn syntax_findings(&self, kind: SourceKind, content: &str) -> Option<(Vec<Hit>, Vec<Hit>)> {
        let language: Language = match kind {
            SourceKind::TypeScript => tree_sitter_typescript::LANGUAGE_TYPESCRIPT.into(),
            _ => tree_sitter_typescript::LANGUAGE_TSX.into(),
        };
        let mut parser = Parser::new();
        parser.set_language(&language).ok()?;
        let tree = parser.parse(content, None)?;
        let root = tree.root_node();
        if root.has_error() {
            return None;
        }

        let source = content.as_bytes();
        let mut imports = Vec::new();
        let mut types = Vec::new();
        visit(root, &mut |node: Node<'_>| match node.kind() {
            "predefined_type" | "type_identifier" => {
                let text = node.utf8_text(source).unwrap_or_default();
                if self.rules.forbidden_types.iter().any(|name| name == text) {
                    types.push(Hit::new(line_of(node), format!("forbidden type `{text}`")));
                }
            }
            "import_statement" | "export_statement" => {
                if let Some(module) = node
                    .child_by_field_name("source")
                    .and_then(|src| string_value(src, source))
                {
                    self.record_import(&mut imports, node, module);
                }
            }
            "call_expression" => {
                let callee = node
                    .child_by_field_name("function")
                    .map(|function| {
                        (function.kind(), function.utf8_text(source).unwrap_or_default())
                    });
                let is_loader = matches!(callee, Some((_, "require")) | Some(("import", _)));
                if is_loader
                    && let Some(module) = node
                        .child_by_field_name("arguments")
                        .and_then(|args| args.named_child(0))
                        .and_then(|arg| string_value(arg, source))
                {
                    self.record_import(&mut imports, node, module);
                }
            }
            _ => {}
        });
        Some((imports, types))
    }

    fn record_import(&self, hits: &mut Vec<Hit>, node: Node<'_>, module: &str) {
        let forbidden = self.rules.forbidden_imports.iter().find(|name| {
            module == name.as_str()
                || module
                    .strip_prefix(name.as_str())
                    .is_some_and(|rest| rest.starts_with('/'))
        });
        if let Some(name) = forbidden {
            hits.push(Hit::new(line_of(node), format!("forbidden import `{name}`")));
        }
    }
}

struct Hit {
    line: usize,
    message: String,
}

impl Hit {
    fn new(line: usize, message: String) -> Self {
        Self { line, message }
    }
}

/// Pre-order traversal of every node under `root`.
fn visit<'tree>(root: Node<'tree>, f: &mut impl FnMut(Node<'tree>)) {
    let mut cursor = root.walk();
    loop {
        f(cursor.node());
        if cursor.goto_first_child() {
            continue;
        }
        loop {
            if cursor.goto_next_sibling() {
                break;
            }
            if !cursor.goto_parent() {
                return;
            }
        }
    }
}

fn line_of(node: Node<'_>) -> usize {
    node.start_position().row + 1
}

fn string_value<'a>(node: Node<'_>, source: &'a [u8]) -> Option<&'a str> {
    if node.kind() != "string" {
        return None;
    }
    let text = node.utf8_text(source).ok()?;
    Some(text.trim_matches(|c| c == '"' || c == '\'' || c == '`'))
}

fn snippet(lines: &[&str], line: usize) -> String {
    let text = lines.get(line.saturating_sub(1)).map_or("", |l| l.trim());
    text.chars().take(SNIPPET_MAX_CHARS).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn validator() -> PolicyValidator {
        let rules = PolicyRules {
            forbidden_imports: vec!["lodash".to_string()],
            ..PolicyRules::default()
        };
        PolicyValidator::new(rules).expect("validator")
    }

    #[test]
    fn flags_any_in_typescript() {
        let content = "export function parse(input: any): string {\n  return String(input);\n}\n";
        let violation = validator().check("src/parse.ts", content).expect("violation");
        assert_eq!(violation.violation_type, ViolationType::ForbiddenType);
        assert_eq!(violation.file_path, "src/parse.ts");
        assert_eq!(violation.violations[0].line, 1);
        assert!(violation.violation_type.is_correctable());
    }

    #[test]
    fn ignores_any_in_comments_and_strings() {
        let content = "// accepts any input\nconst label: string = \"any\";\n";
        assert!(validator().check("src/a.ts", content).is_none());
    }

    #[test]
    fn exception_marker_on_line_above_exempts() {
        let content = "// policy-allow: third-party callback\nexport const cb = (x: any) => x;\n";
        assert!(validator().check("src/a.ts", content).is_none());
        let inline = "export const cb = (x: any) => x; // policy-allow\n";
        assert!(validator().check("src/a.ts", inline).is_none());
    }

    #[test]
    fn flags_forbidden_imports_and_require() {
        let content = "import map from 'lodash/map';\nconst _ = require(\"lodash\");\n";
        let violation = validator().check("src/a.js", content).expect("violation");
        assert_eq!(violation.violation_type, ViolationType::ForbiddenImport);
        assert_eq!(violation.violations.len(), 2);
        assert!(!violation.violation_type.is_correctable());
    }

    #[test]
    fn security_patterns_apply_to_every_language() {
        let violation = validator()
            .check("script.py", "result = eval(user_input)\n")
            .expect("violation");
        assert_eq!(violation.violation_type, ViolationType::SecurityPattern);
        assert!(validator().check("README.md", "Use `any` freely").is_none());
    }

    #[test]
    fn missing_cleanup_is_reported() {
        let content = "export function start(): void {\n  setInterval(() => tick(), 1000);\n}\n";
        let violation = validator().check("src/timer.ts", content).expect("violation");
        assert_eq!(violation.violation_type, ViolationType::MissingCleanup);
        assert_eq!(violation.violations[0].line, 2);

        let paired = "const id = setInterval(tick, 1000);\nclearInterval(id);\n";
        assert!(validator().check("src/timer.ts", paired).is_none());
    }

    #[test]
    fn unparseable_source_falls_back_to_regex() {
        let content = "let x: any = {{{\n";
        let violation = validator().check("src/broken.ts", content).expect("violation");
        assert_eq!(violation.violation_type, ViolationType::ForbiddenType);
    }

    #[test]
    fn rules_round_trip_through_toml() {
        let rules = PolicyRules::default();
        let parsed = PolicyRules::from_toml(&rules.to_toml().expect("toml")).expect("parse");
        assert_eq!(parsed, rules);
        assert!(PolicyRules::from_toml("exception_marker = \"\"").is_err());
    }
}
