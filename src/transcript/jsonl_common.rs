// src/transcript/jsonl_common.rs
// Shared permissive JSONL record parsing used by the OpenClaw, Codex, and
// Claude-Code adapters (spec.md §4.A): all three read one JSON object per
// line and recognize the same family of record shapes; they differ only in
// detection signature and session-metadata extraction, which each adapter
// layers on top of this module.

use std::path::Path;

use chrono::{DateTime, TimeZone, Utc};
use serde_json::Value;

use super::message::{ParseMetadata, ParseOutput, Role, TranscriptMessage};

/// Read a file line by line, parsing each non-empty line as a permissive
/// transcript record. Malformed lines produce a warning and are skipped —
/// never abort the parse (spec.md §4.A "Failures").
pub fn parse_permissive_jsonl(path: &Path) -> std::io::Result<ParseOutput> {
    let contents = std::fs::read_to_string(path)?;
    let mtime_fallback = std::fs::metadata(path)
        .and_then(|m| m.modified())
        .ok()
        .map(DateTime::<Utc>::from);

    Ok(parse_permissive_jsonl_str(&contents, mtime_fallback))
}

pub fn parse_permissive_jsonl_str(
    contents: &str,
    mtime_fallback: Option<DateTime<Utc>>,
) -> ParseOutput {
    let mut messages = Vec::new();
    let mut warnings = Vec::new();
    let mut session_id: Option<String> = None;
    let mut session_timestamp: Option<DateTime<Utc>> = None;
    let mut index = 0usize;

    for (line_no, line) in contents.lines().enumerate() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        let value: Value = match serde_json::from_str(trimmed) {
            Ok(v) => v,
            Err(e) => {
                warnings.push(format!("line {}: malformed JSON ({})", line_no + 1, e));
                continue;
            }
        };

        if session_id.is_none()
            && let Some(sid) = find_str(&value, &["sessionId", "session_id"])
        {
            session_id = Some(sid);
        }
        if session_timestamp.is_none()
            && let Some(ts) = record_timestamp(&value)
        {
            session_timestamp = Some(ts);
        }

        let Some((role_raw, content_value)) = extract_role_and_content(&value) else {
            continue;
        };
        let Some(role) = Role::collapse(&role_raw) else {
            continue;
        };

        let text = content_to_text(&content_value);
        if text.trim().is_empty() {
            continue;
        }

        let timestamp = record_timestamp(&value).or(session_timestamp).or(mtime_fallback);

        messages.push(TranscriptMessage {
            index,
            role,
            text,
            timestamp,
        });
        index += 1;
    }

    ParseOutput {
        messages,
        warnings,
        metadata: Some(ParseMetadata {
            session_id,
            session_timestamp,
        }),
    }
}

/// Recognize `{role, content}`, `{type:"message", message:{...}}`,
/// `{type:<role>, content|message}`, `{payload:{type:"message", ...}}`.
fn extract_role_and_content(value: &Value) -> Option<(String, Value)> {
    let value = value.get("payload").unwrap_or(value);

    if let Some(role) = value.get("role").and_then(Value::as_str) {
        let content = value.get("content").cloned().unwrap_or(Value::Null);
        return Some((role.to_string(), content));
    }

    let record_type = value.get("type").and_then(Value::as_str)?;

    if record_type == "message" {
        let message = value.get("message")?;
        let role = message.get("role").and_then(Value::as_str)?;
        let content = message
            .get("content")
            .cloned()
            .unwrap_or(Value::Null);
        return Some((role.to_string(), content));
    }

    // `{type:<role>, content|message}`
    if Role::collapse(record_type).is_some() {
        let content = if let Some(c) = value.get("content") {
            c.clone()
        } else if let Some(m) = value.get("message") {
            m.get("content").cloned().unwrap_or(m.clone())
        } else {
            Value::Null
        };
        return Some((record_type.to_string(), content));
    }

    None
}

/// `content` may be a string, or an array of blocks with `{text}` or
/// `{type∈{input_text,output_text,text}, content|text}`. Non-text blocks are
/// elided with a bracketed placeholder so signal isn't lost entirely.
fn content_to_text(content: &Value) -> String {
    match content {
        Value::String(s) => s.clone(),
        Value::Array(blocks) => {
            let mut parts = Vec::new();
            for block in blocks {
                if let Some(s) = block.as_str() {
                    parts.push(s.to_string());
                    continue;
                }
                let block_type = block.get("type").and_then(Value::as_str);
                let text = block
                    .get("text")
                    .and_then(Value::as_str)
                    .or_else(|| block.get("content").and_then(Value::as_str));
                match (block_type, text) {
                    (Some("input_text") | Some("output_text") | Some("text") | None, Some(t)) => {
                        parts.push(t.to_string());
                    }
                    (Some(other), _) => parts.push(format!("[{other}]")),
                    (None, None) => parts.push("[block]".to_string()),
                }
            }
            parts.join(" ")
        }
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn find_str(value: &Value, keys: &[&str]) -> Option<String> {
    keys.iter()
        .find_map(|k| value.get(*k).and_then(Value::as_str))
        .map(str::to_string)
}

/// Timestamp resolution order within a single record: `timestamp|ts|created_at|createdAt|time|date`.
fn record_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    const KEYS: &[&str] = &["timestamp", "ts", "created_at", "createdAt", "time", "date"];
    for key in KEYS {
        if let Some(raw) = value.get(*key).and_then(Value::as_str)
            && let Some(parsed) = parse_flexible_timestamp(raw)
        {
            return Some(parsed);
        }
        if let Some(raw) = value.get(*key).and_then(Value::as_i64) {
            if let Some(dt) = Utc.timestamp_millis_opt(raw).single() {
                return Some(dt);
            }
        }
    }
    None
}

fn parse_flexible_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_role_content_shape() {
        let input = r#"{"role":"user","content":"hello"}
{"role":"assistant","content":"hi there"}"#;
        let out = parse_permissive_jsonl_str(input, None);
        assert_eq!(out.messages.len(), 2);
        assert_eq!(out.messages[0].role, Role::User);
        assert_eq!(out.messages[1].role, Role::Assistant);
    }

    #[test]
    fn parses_type_message_shape() {
        let input = r#"{"type":"message","message":{"role":"assistant","content":[{"type":"text","text":"ok"}]}}"#;
        let out = parse_permissive_jsonl_str(input, None);
        assert_eq!(out.messages.len(), 1);
        assert_eq!(out.messages[0].text, "ok");
    }

    #[test]
    fn parses_payload_wrapped_shape() {
        let input = r#"{"payload":{"type":"message","message":{"role":"human","content":"wrapped"}}}"#;
        let out = parse_permissive_jsonl_str(input, None);
        assert_eq!(out.messages.len(), 1);
        assert_eq!(out.messages[0].role, Role::User);
    }

    #[test]
    fn malformed_line_produces_warning_not_abort() {
        let input = "not json at all\n{\"role\":\"user\",\"content\":\"ok\"}";
        let out = parse_permissive_jsonl_str(input, None);
        assert_eq!(out.messages.len(), 1);
        assert_eq!(out.warnings.len(), 1);
    }

    #[test]
    fn unknown_role_is_dropped() {
        let input = r#"{"role":"system","content":"ignored"}"#;
        let out = parse_permissive_jsonl_str(input, None);
        assert!(out.messages.is_empty());
    }

    #[test]
    fn non_text_block_becomes_placeholder() {
        let input = r#"{"role":"assistant","content":[{"type":"tool_use","name":"x"}]}"#;
        let out = parse_permissive_jsonl_str(input, None);
        assert_eq!(out.messages[0].text, "[tool_use]");
    }
}
