// src/transcript/adapters/unimplemented_platform.rs
// Platforms recognized by detection but not yet implemented (cursor,
// vscode-copilot). Parsing always fails with a fixed actionable error;
// never silently skipped (spec.md §4.B).

use crate::error::Result;
use crate::transcript::message::ParseOutput;

pub fn parse(platform: &str) -> Result<ParseOutput> {
    Err(super::unimplemented_error(platform))
}
