// src/transcript/adapters/mod.rs
// Adapter registry (spec.md §4.B). Dispatch is a tagged variant, not a
// trait object: adding a platform is a new `Adapter` variant plus a parser
// function, never runtime duck typing (spec.md §9).

mod claude_code;
mod codex;
mod openclaw;
mod plaintext;
mod plaud;
mod unimplemented_platform;

use std::path::Path;

use crate::error::{AgenrError, Result};
use crate::transcript::message::ParseOutput;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Adapter {
    OpenClaw,
    Codex,
    ClaudeCode,
    PlainText,
    Plaud,
    /// Recognized but not implemented: parse always fails with an
    /// actionable error (spec.md §4.B).
    Unimplemented(&'static str),
}

impl Adapter {
    pub fn parse(&self, path: &Path) -> Result<ParseOutput> {
        match self {
            Adapter::OpenClaw => openclaw::parse(path),
            Adapter::Codex => codex::parse(path),
            Adapter::ClaudeCode => claude_code::parse(path),
            Adapter::PlainText => plaintext::parse(path),
            Adapter::Plaud => plaud::parse(path),
            Adapter::Unimplemented(platform) => unimplemented_platform::parse(platform),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Adapter::OpenClaw => "openclaw",
            Adapter::Codex => "codex",
            Adapter::ClaudeCode => "claude-code",
            Adapter::PlainText => "plaintext",
            Adapter::Plaud => "plaud",
            Adapter::Unimplemented(platform) => platform,
        }
    }
}

/// Detect the adapter for a file: first by extension, then — for `.jsonl`,
/// where several platforms share the extension — by first-line content
/// signature (spec.md §4.B).
pub fn detect(path: &Path) -> Adapter {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase);

    match ext.as_deref() {
        Some("jsonl") => detect_jsonl_platform(path),
        Some("vscdb") => Adapter::Unimplemented("vscode-copilot"),
        Some("md") | Some("markdown") | Some("txt") => {
            if is_plaud_filename(path) {
                Adapter::Plaud
            } else {
                Adapter::PlainText
            }
        }
        _ => {
            // JSONL content is sniffed even when the extension differs
            // (spec.md §4.A).
            if sniff_first_line_is_json(path) {
                detect_jsonl_platform(path)
            } else {
                Adapter::PlainText
            }
        }
    }
}

fn detect_jsonl_platform(path: &Path) -> Adapter {
    let Some(first_line) = first_non_empty_line(path) else {
        return Adapter::ClaudeCode;
    };

    if first_line.contains("\"session_meta\"") {
        return Adapter::Codex;
    }
    if first_line.contains("\"openclaw\"") || path_contains(path, "openclaw") {
        return Adapter::OpenClaw;
    }
    if path_contains(path, "cursor") {
        return Adapter::Unimplemented("cursor");
    }

    Adapter::ClaudeCode
}

fn sniff_first_line_is_json(path: &Path) -> bool {
    first_non_empty_line(path)
        .map(|line| serde_json::from_str::<serde_json::Value>(&line).is_ok())
        .unwrap_or(false)
}

fn first_non_empty_line(path: &Path) -> Option<String> {
    use std::io::BufRead;
    let file = std::fs::File::open(path).ok()?;
    let reader = std::io::BufReader::new(file);
    reader
        .lines()
        .filter_map(|l| l.ok())
        .find(|l| !l.trim().is_empty())
}

fn path_contains(path: &Path, needle: &str) -> bool {
    path.to_string_lossy().to_ascii_lowercase().contains(needle)
}

fn is_plaud_filename(path: &Path) -> bool {
    path_contains(path, "plaud")
}

/// A fixed actionable error for platforms recognized but not implemented.
pub fn unimplemented_error(platform: &str) -> AgenrError {
    AgenrError::Validation {
        file: platform.to_string(),
        reason: format!(
            "transcripts from '{platform}' are not yet supported by this adapter registry"
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn detects_markdown_as_plaintext() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("notes.md");
        std::fs::write(&path, "hello").unwrap();
        assert_eq!(detect(&path), Adapter::PlainText);
    }

    #[test]
    fn detects_codex_by_session_meta_signature() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log.jsonl");
        let mut f = std::fs::File::create(&path).unwrap();
        writeln!(f, r#"{{"type":"session_meta","id":"abc"}}"#).unwrap();
        assert_eq!(detect(&path), Adapter::Codex);
    }

    #[test]
    fn detects_vscdb_as_unimplemented() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.vscdb");
        std::fs::write(&path, "").unwrap();
        assert_eq!(detect(&path), Adapter::Unimplemented("vscode-copilot"));
    }
}
