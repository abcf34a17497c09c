// src/storage/ingest_log.rs
// `ingest_log` short-circuit (spec.md §3, §4.E step 1): unique on
// `(file_path, content_hash)`.

use chrono::Utc;
use rusqlite::{OptionalExtension, params};

use crate::error::Result;
use crate::storage::pool::AgenrPool;
use crate::types::IngestLogRow;

pub async fn already_ingested(pool: &AgenrPool, file_path: &str, content_hash: &str) -> Result<bool> {
    let file_path = file_path.to_string();
    let content_hash = content_hash.to_string();
    pool.interact(move |conn| {
        let found: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM ingest_log WHERE file_path = ?1 AND content_hash = ?2",
                params![file_path, content_hash],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    })
    .await
}

pub async fn record(pool: &AgenrPool, row: IngestLogRow) -> Result<()> {
    pool.interact(move |conn| {
        conn.execute(
            "INSERT INTO ingest_log \
                (file_path, content_hash, ingested_at, added, updated, skipped, superseded, duration_ms) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                row.file_path,
                row.content_hash,
                row.ingested_at.to_rfc3339(),
                row.added,
                row.updated,
                row.skipped,
                row.superseded,
                row.duration_ms as i64,
            ],
        )?;
        Ok(())
    })
    .await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn short_circuits_on_repeat_file_and_hash() {
        let pool = AgenrPool::open_in_memory().await.unwrap();
        assert!(!already_ingested(&pool, "a.jsonl", "hash1").await.unwrap());

        record(
            &pool,
            IngestLogRow {
                file_path: "a.jsonl".to_string(),
                content_hash: "hash1".to_string(),
                ingested_at: Utc::now(),
                added: 3,
                updated: 0,
                skipped: 0,
                superseded: 0,
                duration_ms: 10,
            },
        )
        .await
        .unwrap();

        assert!(already_ingested(&pool, "a.jsonl", "hash1").await.unwrap());
        assert!(!already_ingested(&pool, "a.jsonl", "hash2").await.unwrap());
    }
}
