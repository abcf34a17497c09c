// src/transcript/adapters/plaintext.rs
// Plain text / markdown transcripts (spec.md §4.B), the default adapter for
// unknown extensions. Recognizes a `Role: text` line prefix convention;
// falls back to treating the whole file as a single user message.

use std::path::Path;

use chrono::{DateTime, Utc};
use regex::Regex;

use crate::error::Result;
use crate::transcript::message::{ParseMetadata, ParseOutput, Role, TranscriptMessage};

fn speaker_prefix_re() -> &'static Regex {
    static RE: std::sync::OnceLock<Regex> = std::sync::OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)^\s*(user|human|assistant|ai|developer)\s*:\s*(.*)$").unwrap())
}

pub fn parse(path: &Path) -> Result<ParseOutput> {
    let contents = std::fs::read_to_string(path)?;
    let mtime = std::fs::metadata(path)
        .and_then(|m| m.modified())
        .ok()
        .map(DateTime::<Utc>::from);

    let mut messages = Vec::new();
    let mut index = 0usize;
    let mut current_role: Option<Role> = None;
    let mut current_text = String::new();

    let flush = |role: Option<Role>, text: &str, index: &mut usize, out: &mut Vec<TranscriptMessage>| {
        if let Some(role) = role
            && !text.trim().is_empty()
        {
            out.push(TranscriptMessage {
                index: *index,
                role,
                text: text.trim().to_string(),
                timestamp: mtime,
            });
            *index += 1;
        }
    };

    let mut saw_speaker_prefix = false;
    for line in contents.lines() {
        if let Some(caps) = speaker_prefix_re().captures(line) {
            saw_speaker_prefix = true;
            flush(current_role, &current_text, &mut index, &mut messages);
            current_text.clear();
            current_role = Role::collapse(&caps[1]);
            current_text.push_str(&caps[2]);
        } else {
            if !current_text.is_empty() {
                current_text.push('\n');
            }
            current_text.push_str(line);
        }
    }
    flush(current_role, &current_text, &mut index, &mut messages);

    if !saw_speaker_prefix {
        messages.clear();
        if !contents.trim().is_empty() {
            messages.push(TranscriptMessage {
                index: 0,
                role: Role::User,
                text: contents.trim().to_string(),
                timestamp: mtime,
            });
        }
    }

    Ok(ParseOutput {
        messages,
        warnings: Vec::new(),
        metadata: Some(ParseMetadata {
            session_id: None,
            session_timestamp: mtime,
        }),
    })
}
