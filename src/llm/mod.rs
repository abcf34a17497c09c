// src/llm/mod.rs
// LLM client contract (spec.md §6): "the core never sees raw keys" — the
// extractor and consolidator depend only on this trait, never on a
// concrete HTTP client, the way the teacher's `llm::Provider` abstracts
// over DeepSeek/Zhipu/Ollama/Gemini behind one interface.

pub mod client;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::Result;

/// One `{type:"toolCall", name, arguments}` block in an assistant message.
#[derive(Debug, Clone)]
pub struct ToolCall {
    pub name: String,
    pub arguments: Value,
}

/// The terminal assistant message of a `stream_simple` call.
#[derive(Debug, Clone, Default)]
pub struct AssistantMessage {
    pub text: String,
    pub tool_calls: Vec<ToolCall>,
}

impl AssistantMessage {
    pub fn tool_call(&self, name: &str) -> Option<&ToolCall> {
        self.tool_calls.iter().find(|c| c.name == name)
    }
}

/// Streaming handle the extractor/consolidator consume (spec.md §6
/// `streamSimple`). A concrete client only needs to produce the final
/// `AssistantMessage` — callers here never inspect deltas.
#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn stream_simple(&self, model: &str, system_prompt: &str, user_prompt: &str) -> Result<AssistantMessage>;
}
