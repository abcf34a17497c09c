// src/transcript/adapters/claude_code.rs
// Claude-Code session JSONL (spec.md §4.B). Shares the permissive record
// parser with OpenClaw and Codex; nothing platform-specific beyond detection.

use std::path::Path;

use crate::error::Result;
use crate::transcript::jsonl_common::parse_permissive_jsonl;
use crate::transcript::message::ParseOutput;

pub fn parse(path: &Path) -> Result<ParseOutput> {
    Ok(parse_permissive_jsonl(path)?)
}
