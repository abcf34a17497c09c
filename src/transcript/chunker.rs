// src/transcript/chunker.rs
// Splits a normalized message sequence into bounded-character chunks
// (spec.md §4.A). Chunk boundaries always fall between messages — a
// message is never split — so the `text` a chunk emits never repeats a
// byte range across chunks; the previous chunk's tail is carried forward
// only as `context_hint`, never duplicated into `text` (spec.md §8 property 2).

use super::message::{TranscriptChunk, TranscriptMessage};
use crate::text::collapse_whitespace;

#[derive(Debug, Clone, Copy)]
pub struct ChunkerConfig {
    /// Target character budget per chunk.
    pub target_chars: usize,
    /// Size of the conceptual-continuity overlap window.
    pub overlap_chars: usize,
}

impl Default for ChunkerConfig {
    fn default() -> Self {
        Self {
            target_chars: 8000,
            overlap_chars: 80,
        }
    }
}

/// Render one message as `[m<index>][<role>] <collapsed text>`.
pub fn render_message(msg: &TranscriptMessage) -> String {
    format!(
        "[m{}][{}] {}\n",
        msg.index,
        msg.role.as_str(),
        collapse_whitespace(&msg.text)
    )
}

/// Whether the whole file fits in a single chunk for a given extraction
/// model's budget (spec.md §4.A whole-file mode): `chars/4` tokens must fit
/// in `context_window - max_output - 4000` (fixed safety margin).
pub fn whole_file_fits(total_chars: usize, context_window: usize, max_output: usize) -> bool {
    let safety = 4000usize;
    let budget = context_window.saturating_sub(max_output).saturating_sub(safety);
    total_chars / 4 <= budget
}

/// Chunk a message sequence, honoring whole-file mode when the rendered
/// estimate fits the extraction model's budget.
pub fn chunk_messages(
    messages: &[TranscriptMessage],
    config: ChunkerConfig,
    context_window: Option<usize>,
    max_output: Option<usize>,
) -> Vec<TranscriptChunk> {
    if messages.is_empty() {
        return Vec::new();
    }

    if let (Some(cw), Some(mo)) = (context_window, max_output) {
        let total_chars: usize = messages.iter().map(|m| render_message(m).len()).sum();
        if whole_file_fits(total_chars, cw, mo) {
            return vec![whole_file_chunk(messages)];
        }
    }

    chunk_by_budget(messages, config)
}

fn whole_file_chunk(messages: &[TranscriptMessage]) -> TranscriptChunk {
    let text: String = messages.iter().map(render_message).collect();
    TranscriptChunk {
        chunk_index: 0,
        message_start: messages.first().map(|m| m.index).unwrap_or(0),
        message_end: messages.last().map(|m| m.index).unwrap_or(0),
        text,
        context_hint: String::new(),
        timestamp_start: messages.iter().find_map(|m| m.timestamp),
        timestamp_end: messages.iter().rev().find_map(|m| m.timestamp),
    }
}

fn chunk_by_budget(messages: &[TranscriptMessage], config: ChunkerConfig) -> Vec<TranscriptChunk> {
    let mut chunks = Vec::new();
    let mut current_text = String::new();
    let mut current_message_start = messages[0].index;
    let mut current_message_end = messages[0].index;
    let mut timestamp_start: Option<chrono::DateTime<chrono::Utc>> = None;
    let mut timestamp_end: Option<chrono::DateTime<chrono::Utc>> = None;
    let mut pending_context_hint = String::new();

    let mut chunk_index = 0usize;

    for msg in messages {
        let rendered = render_message(msg);

        if !current_text.is_empty() && current_text.len() + rendered.len() > config.target_chars {
            let hint = tail_overlap(&current_text, config.overlap_chars);
            chunks.push(TranscriptChunk {
                chunk_index,
                message_start: current_message_start,
                message_end: current_message_end,
                text: std::mem::take(&mut current_text),
                context_hint: std::mem::take(&mut pending_context_hint),
                timestamp_start: timestamp_start.take(),
                timestamp_end: timestamp_end.take(),
            });
            chunk_index += 1;
            pending_context_hint = hint;
            current_message_start = msg.index;
        }

        if current_text.is_empty() {
            current_message_start = msg.index;
        }
        current_message_end = msg.index;
        if timestamp_start.is_none() {
            timestamp_start = msg.timestamp;
        }
        if msg.timestamp.is_some() {
            timestamp_end = msg.timestamp;
        }
        current_text.push_str(&rendered);
    }

    if !current_text.is_empty() {
        chunks.push(TranscriptChunk {
            chunk_index,
            message_start: current_message_start,
            message_end: current_message_end,
            text: current_text,
            context_hint: pending_context_hint,
            timestamp_start,
            timestamp_end,
        });
    }

    chunks
}

/// Last `n` bytes of `s`, snapped back to the nearest char boundary.
fn tail_overlap(s: &str, n: usize) -> String {
    if s.len() <= n {
        return s.to_string();
    }
    let mut start = s.len() - n;
    while start > 0 && !s.is_char_boundary(start) {
        start -= 1;
    }
    s[start..].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transcript::message::Role;

    fn msg(index: usize, role: Role, text: &str) -> TranscriptMessage {
        TranscriptMessage {
            index,
            role,
            text: text.to_string(),
            timestamp: None,
        }
    }

    #[test]
    fn single_short_message_is_one_chunk() {
        let messages = vec![msg(0, Role::User, "hello there")];
        let chunks = chunk_messages(&messages, ChunkerConfig::default(), None, None);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].message_start, 0);
        assert_eq!(chunks[0].message_end, 0);
    }

    #[test]
    fn long_messages_split_across_chunks_without_duplication() {
        let config = ChunkerConfig {
            target_chars: 100,
            overlap_chars: 10,
        };
        let messages: Vec<_> = (0..10)
            .map(|i| msg(i, Role::User, &"word ".repeat(5)))
            .collect();
        let chunks = chunk_messages(&messages, config, None, None);
        assert!(chunks.len() > 1);

        // chunk_index is monotonically increasing and ranges don't overlap
        for w in chunks.windows(2) {
            assert!(w[0].chunk_index < w[1].chunk_index);
            assert!(w[0].message_end < w[1].message_start || w[0].message_end <= w[1].message_start);
        }

        // concatenated text contains each rendered message exactly once
        let all_text: String = chunks.iter().map(|c| c.text.as_str()).collect();
        let rendered_first = render_message(&messages[0]);
        assert_eq!(all_text.matches(rendered_first.as_str()).count(), 1);
    }

    #[test]
    fn whole_file_mode_emits_single_chunk_when_it_fits() {
        let messages = vec![msg(0, Role::User, "short")];
        let chunks = chunk_messages(&messages, ChunkerConfig::default(), Some(200_000), Some(8000));
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].message_start, 0);
    }

    #[test]
    fn whole_file_mode_falls_back_when_too_large() {
        let config = ChunkerConfig {
            target_chars: 50,
            overlap_chars: 5,
        };
        let messages: Vec<_> = (0..20)
            .map(|i| msg(i, Role::User, &"x".repeat(40)))
            .collect();
        let chunks = chunk_messages(&messages, config, Some(100), Some(50));
        assert!(chunks.len() > 1);
    }
}
