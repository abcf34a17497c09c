// src/retirements.rs
// Retirements ledger (spec.md §3 `RetirementsLedger`, §6 `retirements.json`):
// an append-only JSON log of retirement patterns. Replaying it against the
// store marks every matching, not-yet-retired entry as retired.

use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::config::Config;
use crate::error::Result;
use crate::state::{atomic_write_json, read_json_tolerant};
use crate::storage::pool::AgenrPool;
use crate::types::{MatchType, RetirementRecord};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetirementsLedger {
    pub version: u32,
    pub retirements: Vec<RetirementRecord>,
}

impl Default for RetirementsLedger {
    fn default() -> Self {
        Self { version: 1, retirements: Vec::new() }
    }
}

pub fn ledger_path() -> PathBuf {
    Config::state_dir().join("retirements.json")
}

pub fn load_ledger(path: &Path) -> RetirementsLedger {
    read_json_tolerant(path)
}

/// Append one retirement record to the ledger, then apply it immediately
/// (spec.md §3 "on replay marks matching entries retired" — applying at
/// append time keeps the DB and the ledger from drifting apart between
/// calls).
pub async fn retire(
    pool: &AgenrPool,
    path: &Path,
    pattern: String,
    match_type: MatchType,
    suppressed_contexts: Vec<String>,
    reason: String,
) -> Result<u64> {
    let record = RetirementRecord {
        pattern,
        match_type,
        suppressed_contexts,
        reason,
        created_at: Utc::now(),
    };

    let mut ledger = load_ledger(path);
    ledger.retirements.push(record.clone());
    atomic_write_json(path, &ledger)?;

    apply_record(pool, &record).await
}

/// Re-apply every record in the ledger, in order. Used at startup or by an
/// explicit `config replay-retirements` style command to reconcile the DB
/// after it was restored from a backup that predates some retirements.
pub async fn replay(pool: &AgenrPool, path: &Path) -> Result<u64> {
    let ledger = load_ledger(path);
    let mut total = 0;
    for record in &ledger.retirements {
        total += apply_record(pool, record).await?;
    }
    Ok(total)
}

async fn apply_record(pool: &AgenrPool, record: &RetirementRecord) -> Result<u64> {
    let pattern = crate::text::normalize(&record.pattern);
    let match_type = record.match_type;
    let suppressed = serde_json::to_string(&record.suppressed_contexts).unwrap_or_else(|_| "[]".to_string());
    let reason = record.reason.clone();
    let now = Utc::now().to_rfc3339();

    pool.interact(move |conn| {
        let mut stmt = conn.prepare(
            "SELECT id, subject, canonical_key FROM entries WHERE retired = 0",
        )?;
        let rows = stmt.query_map([], |row| {
            let id: String = row.get(0)?;
            let subject: String = row.get(1)?;
            let canonical_key: Option<String> = row.get(2)?;
            Ok((id, subject, canonical_key))
        })?;

        let mut matched_ids = Vec::new();
        for row in rows {
            let (id, subject, canonical_key) = row?;
            let normalized_subject = crate::text::normalize(&subject);
            let haystack = canonical_key.unwrap_or(normalized_subject);
            let is_match = match match_type {
                MatchType::Exact => haystack == pattern,
                MatchType::Contains => haystack.contains(&pattern),
            };
            if is_match {
                matched_ids.push(id);
            }
        }

        for id in &matched_ids {
            conn.execute(
                "UPDATE entries SET retired = 1, retired_at = ?1, retired_reason = ?2, \
                 suppressed_contexts = ?3 WHERE id = ?4",
                rusqlite::params![now, reason, suppressed, id],
            )?;
        }

        Ok(matched_ids.len() as u64)
    })
    .await
}
