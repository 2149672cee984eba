//! The open-questions side channel (`.autobuild/questions.md`).
//!
//! `- [ ] ...` items are unanswered; checking them (`- [x]`) answers them.

use std::path::PathBuf;

use anyhow::Result;

use crate::io::atomic::{read_text_opt, write_text};
use crate::io::init::QUESTIONS_PLACEHOLDER;

#[derive(Debug, Clone)]
pub struct QuestionsDoc {
    path: PathBuf,
}

impl QuestionsDoc {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn open_questions(&self) -> Result<Vec<String>> {
        let Some(contents) = read_text_opt(&self.path)? else {
            return Ok(Vec::new());
        };
        Ok(parse_open(&contents))
    }

    /// Append unanswered items, skipping any already listed. Returns the
    /// number added.
    pub fn append(&self, questions: &[String]) -> Result<usize> {
        let mut contents =
            read_text_opt(&self.path)?.unwrap_or_else(|| QUESTIONS_PLACEHOLDER.to_string());
        let mut added = 0;
        for question in questions {
            let question = question.trim();
            if question.is_empty() || contents.contains(question) {
                continue;
            }
            if !contents.ends_with('\n') {
                contents.push('\n');
            }
            contents.push_str(&format!("- [ ] {question}\n"));
            added += 1;
        }
        if added > 0 {
            write_text(&self.path, &contents)?;
        }
        Ok(added)
    }
}

fn parse_open(contents: &str) -> Vec<String> {
    contents
        .lines()
        .filter_map(|line| {
            let trimmed = line.trim_start();
            trimmed
                .strip_prefix("- [ ]")
                .or_else(|| trimmed.strip_prefix("* [ ]"))
        })
        .map(|rest| rest.trim().to_string())
        .filter(|question| !question.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_unchecked_items_are_open() {
        let open = parse_open("# Open Questions\n\n- [ ] Which database?\n- [x] Which port?\n  * [ ] Dark mode?\n- [ ]\n");
        assert_eq!(open, vec!["Which database?", "Dark mode?"]);
    }

    #[test]
    fn append_skips_duplicates() {
        let temp = tempfile::tempdir().expect("tempdir");
        let doc = QuestionsDoc::new(temp.path().join("questions.md"));
        assert!(doc.open_questions().expect("missing file").is_empty());
        let added = doc
            .append(&["Auth provider?".to_string(), "Auth provider?".to_string()])
            .expect("append");
        assert_eq!(added, 1);
        assert_eq!(doc.open_questions().expect("open"), vec!["Auth provider?"]);
    }
}
