// src/transcript/adapters/codex.rs
// Codex session JSONL (spec.md §4.B), identified by its `session_meta`
// first-line signature. Same permissive record shapes as the other JSONL
// adapters.

use std::path::Path;

use crate::error::Result;
use crate::transcript::jsonl_common::parse_permissive_jsonl;
use crate::transcript::message::ParseOutput;

pub fn parse(path: &Path) -> Result<ParseOutput> {
    Ok(parse_permissive_jsonl(path)?)
}
