// src/transcript/adapters/openclaw.rs
// OpenClaw session JSONL (spec.md §4.B). Active-file resolution (manifest,
// then mtime) is the watcher's concern (spec.md §4.I); this adapter only
// parses a single given file.

use std::path::Path;

use crate::error::Result;
use crate::transcript::jsonl_common::parse_permissive_jsonl;
use crate::transcript::message::ParseOutput;

pub fn parse(path: &Path) -> Result<ParseOutput> {
    Ok(parse_permissive_jsonl(path)?)
}
