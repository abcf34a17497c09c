// src/extract/prompt.rs
// Two-part prompt construction (spec.md §4.C). Prompt text itself is an
// external-collaborator concern (spec.md §1 non-goals "concrete prompt
// text"); these are deliberately plain and stable, not tuned copy.

use crate::transcript::TranscriptChunk;
use crate::types::KnowledgeEntry;

pub fn extraction_system_prompt() -> String {
    "You extract durable knowledge entries from an agent session transcript. \
     Call submit_knowledge with an `entries` array. Each entry has: kind \
     (fact|decision|preference|todo|relationship|event|lesson), subject, \
     content, optional canonical_key, importance (1-10), expiry \
     (core|permanent|temporary), tags. Only extract information that should \
     persist across sessions."
        .to_string()
}

pub fn extraction_user_prompt(chunk: &TranscriptChunk) -> String {
    if chunk.context_hint.is_empty() {
        chunk.text.clone()
    } else {
        format!("[context: ...{}]\n{}", chunk.context_hint, chunk.text)
    }
}

pub fn dedup_system_prompt() -> String {
    "You deduplicate a batch of extracted knowledge entries from the same \
     file. Call submit_deduped_knowledge with the merged `entries` array, \
     combining near-duplicates and preferring the most complete content."
        .to_string()
}

pub fn dedup_user_prompt(entries: &[KnowledgeEntry]) -> String {
    let rendered: Vec<String> = entries
        .iter()
        .map(|e| format!("- [{}] {}: {}", e.kind.as_str(), e.subject, e.content))
        .collect();
    rendered.join("\n")
}
