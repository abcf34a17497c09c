// src/transcript/message.rs
// Normalized message/chunk shapes shared by every adapter (spec.md §4.A).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    /// Collapse a raw record role into the two recognized roles, or `None`
    /// if the role should be dropped (spec.md §4.A).
    pub fn collapse(raw: &str) -> Option<Self> {
        match raw.to_ascii_lowercase().as_str() {
            "user" | "human" => Some(Self::User),
            "assistant" | "ai" | "developer" => Some(Self::Assistant),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }
}

/// A single normalized transcript message.
#[derive(Debug, Clone)]
pub struct TranscriptMessage {
    pub index: usize,
    pub role: Role,
    pub text: String,
    pub timestamp: Option<DateTime<Utc>>,
}

/// Output of `Adapter::parse` (spec.md §4.A).
#[derive(Debug, Clone, Default)]
pub struct ParseOutput {
    pub messages: Vec<TranscriptMessage>,
    pub warnings: Vec<String>,
    pub metadata: Option<ParseMetadata>,
}

/// Session-level metadata an adapter may recover, used as a timestamp
/// fallback and as `context_hint` seed material.
#[derive(Debug, Clone, Default)]
pub struct ParseMetadata {
    pub session_id: Option<String>,
    pub session_timestamp: Option<DateTime<Utc>>,
}

/// A bounded-token window of rendered messages fed to the extractor.
#[derive(Debug, Clone)]
pub struct TranscriptChunk {
    pub chunk_index: usize,
    pub message_start: usize,
    pub message_end: usize,
    pub text: String,
    pub context_hint: String,
    pub timestamp_start: Option<DateTime<Utc>>,
    pub timestamp_end: Option<DateTime<Utc>>,
}
