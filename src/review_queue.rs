// src/review_queue.rs
// Review queue (spec.md §3 `ReviewQueueEntry`, §6 `review-queue.json`): the
// `review_queue` DB table is the queryable store the consolidator writes
// to; `export_json` mirrors it to the append-only JSON file external tools
// read, the same "DB is truth, JSON is a read-only mirror" split the
// ingest_log/retirements ledger pair uses elsewhere in this crate.

use std::path::{Path, PathBuf};

use chrono::Utc;

use crate::config::Config;
use crate::error::Result;
use crate::state::atomic_write_json;
use crate::storage::pool::AgenrPool;
use crate::types::{EntryId, ReviewQueueEntry};

pub fn ledger_path() -> PathBuf {
    Config::state_dir().join("review-queue.json")
}

/// Append a review entry (spec.md §4.H phase 2 "on fail, append a
/// `review_queue` record with reason and do not mutate").
pub async fn append(pool: &AgenrPool, suggested_action: &str, reason: &str, source_entry_ids: &[EntryId]) -> Result<()> {
    let suggested_action = suggested_action.to_string();
    let reason = reason.to_string();
    let ids_json = serde_json::to_string(&source_entry_ids.iter().map(|id| id.to_string()).collect::<Vec<_>>())?;
    let now = Utc::now().to_rfc3339();

    pool.interact(move |conn| {
        conn.execute(
            "INSERT INTO review_queue (suggested_action, reason, source_entry_ids, resolved, created_at) \
             VALUES (?1, ?2, ?3, 0, ?4)",
            rusqlite::params![suggested_action, reason, ids_json, now],
        )?;
        Ok(())
    })
    .await
}

pub async fn list_pending(pool: &AgenrPool) -> Result<Vec<ReviewQueueEntry>> {
    pool.interact(|conn| {
        let mut stmt = conn.prepare(
            "SELECT id, suggested_action, reason, source_entry_ids, resolved, created_at \
             FROM review_queue WHERE resolved = 0 ORDER BY created_at ASC",
        )?;
        let rows = stmt.query_map([], row_to_entry)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    })
    .await
}

pub async fn resolve(pool: &AgenrPool, id: i64) -> Result<()> {
    pool.interact(move |conn| {
        conn.execute("UPDATE review_queue SET resolved = 1 WHERE id = ?1", [id])?;
        Ok(())
    })
    .await
}

/// Mirror every row to `review-queue.json` (spec.md §6). Read-only from the
/// rest of the system's perspective; the DB table is what gets written to.
pub async fn export_json(pool: &AgenrPool, path: &Path) -> Result<()> {
    let all = pool
        .interact(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, suggested_action, reason, source_entry_ids, resolved, created_at \
                 FROM review_queue ORDER BY created_at ASC",
            )?;
            let rows = stmt.query_map([], row_to_entry)?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row?);
            }
            Ok(out)
        })
        .await?;

    atomic_write_json(path, &all)?;
    Ok(())
}

fn row_to_entry(row: &rusqlite::Row) -> rusqlite::Result<ReviewQueueEntry> {
    let id: i64 = row.get(0)?;
    let suggested_action: String = row.get(1)?;
    let reason: String = row.get(2)?;
    let source_entry_ids_json: String = row.get(3)?;
    let resolved: i64 = row.get(4)?;
    let created_at: String = row.get(5)?;

    let source_entry_ids: Vec<String> = serde_json::from_str(&source_entry_ids_json).unwrap_or_default();
    let source_entry_ids = source_entry_ids
        .into_iter()
        .filter_map(|s| s.parse().ok())
        .map(EntryId)
        .collect();

    Ok(ReviewQueueEntry {
        id,
        suggested_action,
        reason,
        source_entry_ids,
        resolved: resolved != 0,
        created_at: chrono::DateTime::parse_from_rfc3339(&created_at)
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn append_then_list_pending_round_trips() {
        let pool = AgenrPool::open_in_memory().await.unwrap();
        let ids = vec![EntryId::new(), EntryId::new()];
        append(&pool, "merge", "cosine below threshold", &ids).await.unwrap();

        let pending = list_pending(&pool).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].source_entry_ids.len(), 2);
        assert!(!pending[0].resolved);
    }

    #[tokio::test]
    async fn resolve_removes_entry_from_pending_list() {
        let pool = AgenrPool::open_in_memory().await.unwrap();
        append(&pool, "merge", "reason", &[EntryId::new()]).await.unwrap();
        let pending = list_pending(&pool).await.unwrap();
        resolve(&pool, pending[0].id).await.unwrap();
        assert!(list_pending(&pool).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn export_json_writes_all_rows() {
        let pool = AgenrPool::open_in_memory().await.unwrap();
        append(&pool, "merge", "reason", &[EntryId::new()]).await.unwrap();

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("review-queue.json");
        export_json(&pool, &path).await.unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(contents.contains("merge"));
    }
}
