// src/transcript/mod.rs
// Transcript parser + chunker (spec.md §4.A) and adapter registry (§4.B).

pub mod adapters;
pub mod chunker;
pub mod jsonl_common;
pub mod message;

pub use adapters::{Adapter, detect};
pub use chunker::{ChunkerConfig, chunk_messages};
pub use message::{ParseMetadata, ParseOutput, Role, TranscriptChunk, TranscriptMessage};

use std::path::Path;

use crate::error::Result;

/// Detect the adapter for `path`, parse it, and chunk the resulting
/// messages — the full `watcher → adapter → parser → chunker` pipeline
/// stage before extraction (spec.md §2 data flow).
pub fn parse_and_chunk(
    path: &Path,
    config: ChunkerConfig,
    context_window: Option<usize>,
    max_output: Option<usize>,
) -> Result<(ParseOutput, Vec<TranscriptChunk>)> {
    let adapter = detect(path);
    let output = adapter.parse(path)?;
    let chunks = chunk_messages(&output.messages, config, context_window, max_output);
    Ok((output, chunks))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn end_to_end_parses_and_chunks_a_small_jsonl_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.jsonl");
        std::fs::write(
            &path,
            "{\"role\":\"user\",\"content\":\"hi\"}\n{\"role\":\"assistant\",\"content\":\"hello\"}\n",
        )
        .unwrap();

        let (output, chunks) = parse_and_chunk(&path, ChunkerConfig::default(), None, None).unwrap();
        assert_eq!(output.messages.len(), 2);
        assert_eq!(chunks.len(), 1);
    }
}
