//! Conversational intent refinement.
//!
//! A chat turn never edits `intent.md`. Suggested rewrites land in
//! `intent.suggested.md` and follow-up questions are appended to
//! `questions.md`, where they hold back autonomous steps until answered.

use anyhow::Result;
use serde::Serialize;
use tracing::{info, instrument};

use crate::agents::AgentContext;
use crate::core::types::SpendCategory;
use crate::io::atomic::{read_text_opt, write_text};
use crate::io::audit::JsonLines;
use crate::io::llm::{ChatRequest, ChatTurn, tokens_for_exchange};

/// Prior turns sent with each message.
const HISTORY_TURNS: usize = 20;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatOutcome {
    pub response: String,
    pub suggested_intent_written: bool,
    pub questions_added: usize,
    pub tokens: u64,
}

fn history_log(ctx: &AgentContext) -> JsonLines {
    JsonLines::new(ctx.paths().control_dir.join("chat.jsonl"))
}

/// Send `message` with the current intent and recent history.
#[instrument(skip_all)]
pub fn run_chat(ctx: &AgentContext, message: &str) -> Result<ChatOutcome> {
    ctx.budget.enforce_budget()?;

    let log = history_log(ctx);
    let mut history: Vec<ChatTurn> = log.read_all()?;
    if history.len() > HISTORY_TURNS {
        history.drain(..history.len() - HISTORY_TURNS);
    }
    let request = ChatRequest {
        intent: read_text_opt(&ctx.paths().intent_path)?.unwrap_or_default(),
        history,
        message: message.to_string(),
    };
    let response = ctx.llm.chat(&request)?;
    let tokens = tokens_for_exchange(response.usage, &request, &response);
    ctx.spend(tokens, SpendCategory::Chat)?;

    log.append(&ChatTurn {
        role: "user".to_string(),
        content: message.to_string(),
    })?;
    log.append(&ChatTurn {
        role: "assistant".to_string(),
        content: response.response.clone(),
    })?;

    let questions_added = ctx.questions.append(&response.questions)?;
    let suggested = response
        .suggested_intent
        .as_deref()
        .map(str::trim)
        .filter(|text| !text.is_empty());
    if let Some(text) = suggested {
        write_text(&ctx.paths().suggested_intent_path, &format!("{text}\n"))?;
    }
    info!(tokens, questions_added, suggested = suggested.is_some(), "chat turn complete");

    Ok(ChatOutcome {
        response: response.response,
        suggested_intent_written: suggested.is_some(),
        questions_added,
        tokens,
    })
}
