// src/extract/validation.rs
// Per-entry validation (spec.md §4.C): type enum check, non-empty
// subject/content, importance clamp, expiry default, tag normalization,
// canonical_key pattern, UTC timestamp parsing — all delegated to
// `KnowledgeEntry::new` (spec.md §9: validation is a constructor).

use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::Value;

use crate::types::{EntrySource, KnowledgeEntry, RawEntry};

/// Shape of one entry inside a `submit_knowledge`/`submit_deduped_knowledge`
/// tool call argument object.
#[derive(Debug, Deserialize)]
pub struct LlmRawEntry {
    pub kind: String,
    pub subject: String,
    #[serde(default)]
    pub canonical_key: Option<String>,
    pub content: String,
    #[serde(default)]
    pub importance: Option<i64>,
    #[serde(default)]
    pub expiry: Option<String>,
    #[serde(default)]
    pub scope: Option<String>,
    #[serde(default)]
    pub platform: Option<String>,
    #[serde(default)]
    pub project: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub created_at: Option<String>,
    #[serde(default)]
    pub subject_key: Option<String>,
    #[serde(default)]
    pub predicate: Option<String>,
    #[serde(default)]
    pub object: Option<String>,
    #[serde(default)]
    pub claim_confidence: Option<f32>,
}

/// Parse the `{entries: [...]}` tool-call argument object. Tolerant: a
/// missing or malformed `entries` array yields an empty list rather than
/// failing the whole chunk (a single bad entry should not be fatal).
pub fn parse_submit_knowledge(value: &Value) -> Vec<LlmRawEntry> {
    let Some(array) = value.get("entries").and_then(Value::as_array) else {
        return Vec::new();
    };
    array
        .iter()
        .filter_map(|v| serde_json::from_value(v.clone()).ok())
        .collect()
}

/// Validate a batch of raw LLM entries against `source`, returning
/// successfully-constructed entries plus one warning string per rejected
/// entry (spec.md §4.C: "Per-chunk failures are counted, never fatal").
pub fn validate_raw_entries(llm_entries: Vec<LlmRawEntry>) -> (Vec<KnowledgeEntry>, Vec<String>) {
    validate_raw_entries_with_source(llm_entries, EntrySource::Context { text: String::new() })
}

pub fn validate_raw_entries_with_source(
    llm_entries: Vec<LlmRawEntry>,
    source: EntrySource,
) -> (Vec<KnowledgeEntry>, Vec<String>) {
    let mut entries = Vec::new();
    let mut warnings = Vec::new();

    for raw in llm_entries {
        let subject_for_warning = raw.subject.clone();
        let created_at: Option<DateTime<Utc>> = raw
            .created_at
            .as_deref()
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.with_timezone(&Utc));

        let constructed = KnowledgeEntry::new(RawEntry {
            kind: raw.kind,
            subject: raw.subject,
            canonical_key: raw.canonical_key,
            content: raw.content,
            importance: raw.importance,
            expiry: raw.expiry,
            scope: raw.scope,
            platform: raw.platform,
            project: raw.project,
            tags: raw.tags,
            source: source.clone(),
            created_at,
            subject_key: raw.subject_key,
            predicate: raw.predicate,
            object: raw.object,
            claim_confidence: raw.claim_confidence,
        });

        match constructed {
            Ok(entry) => entries.push(entry),
            Err(e) => warnings.push(format!("rejected entry '{subject_for_warning}': {e}")),
        }
    }

    (entries, warnings)
}
