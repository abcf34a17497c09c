// tests/test_utils.rs
// Shared fakes for end-to-end scenario tests (spec.md §8): the same
// call-and-respond doubles each module's own unit tests already use
// (`FakeEmbedder` in `recall`/`consolidate`/`queue`, `FakeMergeLlm` in
// `consolidate`), pulled up to one place so a scenario test can drive a
// whole pipeline (extract -> dedup -> queue -> store, or the full
// consolidator) instead of one module in isolation.

use std::collections::VecDeque;
use std::sync::Mutex;

use agenr::embedding::{EMBEDDING_DIMENSIONS, EmbeddingClient};
use agenr::error::Result;
use agenr::llm::{AssistantMessage, LlmClient, ToolCall};
use async_trait::async_trait;

/// Returns the same constant vector for every input, so cosine similarity
/// between any two embedded texts in these fixtures is always 1.0.
pub struct FakeEmbedder;

#[async_trait]
impl EmbeddingClient for FakeEmbedder {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|_| vec![0.1; EMBEDDING_DIMENSIONS]).collect())
    }
}

/// Returns one queued `AssistantMessage` per call, in order. Panics if
/// asked for more responses than it was given — a scenario test should
/// know exactly how many LLM calls its pipeline makes.
pub struct ScriptedLlm {
    responses: Mutex<VecDeque<AssistantMessage>>,
}

impl ScriptedLlm {
    pub fn new(responses: Vec<AssistantMessage>) -> Self {
        Self {
            responses: Mutex::new(responses.into()),
        }
    }

    pub fn submit_knowledge(entries: serde_json::Value) -> AssistantMessage {
        AssistantMessage {
            text: String::new(),
            tool_calls: vec![ToolCall {
                name: "submit_knowledge".to_string(),
                arguments: serde_json::json!({ "entries": entries }),
            }],
        }
    }

    pub fn judge_duplicate(action: &str) -> AssistantMessage {
        AssistantMessage {
            text: String::new(),
            tool_calls: vec![ToolCall {
                name: "judge_duplicate".to_string(),
                arguments: serde_json::json!({ "action": action, "reasoning": "test fixture" }),
            }],
        }
    }

    pub fn merge_entries(content: &str, subject: &str) -> AssistantMessage {
        AssistantMessage {
            text: String::new(),
            tool_calls: vec![ToolCall {
                name: "merge_entries".to_string(),
                arguments: serde_json::json!({
                    "content": content,
                    "subject": subject,
                    "type": "fact",
                    "importance": 6,
                    "expiry": "permanent",
                    "tags": [],
                }),
            }],
        }
    }
}

#[async_trait]
impl LlmClient for ScriptedLlm {
    async fn stream_simple(&self, _model: &str, _system: &str, _user: &str) -> Result<AssistantMessage> {
        let mut responses = self.responses.lock().unwrap();
        Ok(responses.pop_front().expect("ScriptedLlm ran out of queued responses"))
    }
}

/// Write `lines` (each a JSON object) one per line to a fresh `.jsonl`
/// file under `dir`, returning its path.
pub fn write_jsonl(dir: &std::path::Path, name: &str, lines: &[serde_json::Value]) -> std::path::PathBuf {
    let path = dir.join(name);
    let body: String = lines.iter().map(|v| format!("{v}\n")).collect();
    std::fs::write(&path, body).unwrap();
    path
}
