// src/storage/judge.rs
// Online dedup judge (spec.md §4.E): classifies a candidate match into
// {duplicate, update, supersede, distinct}. Same tool-call idiom as
// `crate::extract` — a fixed prompt, one tool call, tolerant parsing.

use crate::error::Result;
use crate::llm::LlmClient;
use crate::types::KnowledgeEntry;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JudgeAction {
    Duplicate,
    Update,
    Supersede,
    Distinct,
}

impl JudgeAction {
    fn parse(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "duplicate" => Self::Duplicate,
            "update" => Self::Update,
            "supersede" => Self::Supersede,
            _ => Self::Distinct,
        }
    }
}

#[derive(Debug, Clone)]
pub struct JudgeVerdict {
    pub action: JudgeAction,
    pub reasoning: String,
}

fn system_prompt() -> String {
    "You compare a new knowledge entry against an existing candidate match \
     from the same store. Call judge_duplicate with `action` \
     (duplicate|update|supersede|distinct) and `reasoning`. `duplicate`: \
     same fact, nothing new. `update`: same fact, new entry adds detail or \
     confirms it. `supersede`: new entry contradicts or replaces the old \
     one. `distinct`: different facts that happen to be similar."
        .to_string()
}

fn user_prompt(new_entry: &KnowledgeEntry, candidate_subject: &str, candidate_content: &str) -> String {
    format!(
        "NEW:\n[{}] {}: {}\n\nEXISTING:\n{}: {}",
        new_entry.kind.as_str(),
        new_entry.subject,
        new_entry.content,
        candidate_subject,
        candidate_content
    )
}

/// Ask the LLM to classify a (new entry, existing candidate) pair.
/// A missing/unparseable tool call defaults to `distinct` — the safest
/// failure mode is an extra row, not a silently dropped one.
pub async fn judge(
    llm: &dyn LlmClient,
    model: &str,
    new_entry: &KnowledgeEntry,
    candidate_subject: &str,
    candidate_content: &str,
) -> Result<JudgeVerdict> {
    let message = llm
        .stream_simple(model, &system_prompt(), &user_prompt(new_entry, candidate_subject, candidate_content))
        .await?;

    let Some(call) = message.tool_call("judge_duplicate") else {
        return Ok(JudgeVerdict {
            action: JudgeAction::Distinct,
            reasoning: "no judge_duplicate tool call in response".to_string(),
        });
    };

    let action = call
        .arguments
        .get("action")
        .and_then(|v| v.as_str())
        .map(JudgeAction::parse)
        .unwrap_or(JudgeAction::Distinct);
    let reasoning = call
        .arguments
        .get("reasoning")
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .to_string();

    Ok(JudgeVerdict { action, reasoning })
}
