// src/transcript/adapters/plaud.rs
// Plaud voice-recorder transcription exports (spec.md §4.B): markdown/text
// with speaker-labeled lines, whose filename often embeds the recording
// timestamp (spec.md §4.A timestamp resolution order names this adapter
// explicitly as the filename-derived-timestamp source).

use std::path::Path;

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use regex::Regex;

use crate::error::Result;
use crate::transcript::message::{ParseMetadata, ParseOutput};

use super::plaintext;

fn filename_timestamp_re() -> &'static Regex {
    static RE: std::sync::OnceLock<Regex> = std::sync::OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(\d{4})-?(\d{2})-?(\d{2})[_T -](\d{2})-?(\d{2})-?(\d{2})").unwrap())
}

/// Attempt to recover a UTC timestamp embedded in a Plaud export filename,
/// e.g. `2025-03-14_09-30-00-meeting.md` or `20250314_093000.md`.
pub fn timestamp_from_filename(path: &Path) -> Option<DateTime<Utc>> {
    let name = path.file_name()?.to_str()?;
    let caps = filename_timestamp_re().captures(name)?;
    let naive = NaiveDateTime::parse_from_str(
        &format!(
            "{}-{}-{} {}:{}:{}",
            &caps[1], &caps[2], &caps[3], &caps[4], &caps[5], &caps[6]
        ),
        "%Y-%m-%d %H:%M:%S",
    )
    .ok()?;
    Some(Utc.from_utc_datetime(&naive))
}

pub fn parse(path: &Path) -> Result<ParseOutput> {
    let mut out = plaintext::parse(path)?;

    if let Some(ts) = timestamp_from_filename(path) {
        for msg in out.messages.iter_mut() {
            if msg.timestamp.is_none() {
                msg.timestamp = Some(ts);
            }
        }
        out.metadata = Some(ParseMetadata {
            session_id: out.metadata.and_then(|m| m.session_id),
            session_timestamp: Some(ts),
        });
    }

    Ok(out)
}
