// src/storage/schema.rs
// Idempotent schema migrations (spec.md §4.E) and bulk-ingest recovery.
// Grounded on the teacher's `db::schema` "create if missing" migrations and
// its `vec0`/`fts5` virtual table usage.

use rusqlite::Connection;

use crate::error::Result;
use crate::storage::pool::AgenrPool;

/// `_bulk_ingest_meta` sentinel key (spec.md §3 invariant 5).
pub const BULK_SENTINEL_KEY: &str = "_bulk_ingest_meta";

const CORE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS entries (
    rowid INTEGER PRIMARY KEY,
    id TEXT UNIQUE NOT NULL,
    kind TEXT NOT NULL,
    subject TEXT NOT NULL,
    canonical_key TEXT,
    content TEXT NOT NULL,
    tags_joined TEXT NOT NULL DEFAULT '',
    importance INTEGER NOT NULL,
    expiry TEXT NOT NULL,
    scope TEXT NOT NULL,
    platform TEXT,
    project TEXT,
    source_kind TEXT NOT NULL,
    source_path TEXT,
    source_text TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    last_consolidated_at TEXT,
    last_recalled_at TEXT,
    recall_count INTEGER NOT NULL DEFAULT 0,
    confirmations INTEGER NOT NULL DEFAULT 0,
    contradictions INTEGER NOT NULL DEFAULT 0,
    retired INTEGER NOT NULL DEFAULT 0,
    retired_at TEXT,
    retired_reason TEXT,
    suppressed_contexts TEXT NOT NULL DEFAULT '[]',
    superseded_by TEXT,
    content_hash TEXT NOT NULL,
    normalized_content_hash TEXT NOT NULL,
    minhash BLOB NOT NULL,
    subject_key TEXT,
    predicate TEXT,
    object TEXT,
    claim_confidence REAL,
    quality_score REAL NOT NULL DEFAULT 0.5
);
CREATE INDEX IF NOT EXISTS idx_entries_kind ON entries(kind);
CREATE INDEX IF NOT EXISTS idx_entries_kind_canonical ON entries(kind, canonical_key);
CREATE INDEX IF NOT EXISTS idx_entries_expiry ON entries(expiry);
CREATE INDEX IF NOT EXISTS idx_entries_scope ON entries(scope);
CREATE INDEX IF NOT EXISTS idx_entries_platform ON entries(platform);
CREATE INDEX IF NOT EXISTS idx_entries_created_at ON entries(created_at);
CREATE INDEX IF NOT EXISTS idx_entries_superseded_by ON entries(superseded_by);
CREATE INDEX IF NOT EXISTS idx_entries_content_hash ON entries(content_hash);

CREATE TABLE IF NOT EXISTS tags (
    entry_id TEXT NOT NULL REFERENCES entries(id) ON DELETE CASCADE,
    tag TEXT NOT NULL,
    PRIMARY KEY (entry_id, tag)
);
CREATE INDEX IF NOT EXISTS idx_tags_tag ON tags(tag);

CREATE TABLE IF NOT EXISTS relations (
    id INTEGER PRIMARY KEY,
    source_id TEXT NOT NULL,
    target_id TEXT NOT NULL,
    relation_type TEXT NOT NULL,
    created_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_relations_source ON relations(source_id);
CREATE INDEX IF NOT EXISTS idx_relations_target ON relations(target_id);

CREATE TABLE IF NOT EXISTS ingest_log (
    id INTEGER PRIMARY KEY,
    file_path TEXT NOT NULL,
    content_hash TEXT NOT NULL,
    ingested_at TEXT NOT NULL,
    added INTEGER NOT NULL DEFAULT 0,
    updated INTEGER NOT NULL DEFAULT 0,
    skipped INTEGER NOT NULL DEFAULT 0,
    superseded INTEGER NOT NULL DEFAULT 0,
    duration_ms INTEGER NOT NULL DEFAULT 0,
    UNIQUE(file_path, content_hash)
);

CREATE TABLE IF NOT EXISTS entry_sources (
    merged_entry_id TEXT NOT NULL,
    source_entry_id TEXT NOT NULL,
    PRIMARY KEY (merged_entry_id, source_entry_id)
);

CREATE TABLE IF NOT EXISTS co_recall_edges (
    entry_a TEXT NOT NULL,
    entry_b TEXT NOT NULL,
    weight REAL NOT NULL,
    session_count INTEGER NOT NULL DEFAULT 1,
    last_co_recalled TEXT NOT NULL,
    created_at TEXT NOT NULL,
    PRIMARY KEY (entry_a, entry_b)
);

CREATE TABLE IF NOT EXISTS review_queue (
    id INTEGER PRIMARY KEY,
    suggested_action TEXT NOT NULL,
    reason TEXT NOT NULL,
    source_entry_ids TEXT NOT NULL,
    resolved INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS kv_sentinel (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
"#;

fn fts_and_vec_schema() -> String {
    format!(
        r#"
CREATE VIRTUAL TABLE IF NOT EXISTS entries_fts USING fts5(
    subject, content, tags_joined,
    content='entries', content_rowid='rowid'
);

CREATE VIRTUAL TABLE IF NOT EXISTS entries_vec USING vec0(
    embedding float[{dim}] distance_metric=cosine,
    +entry_rowid INTEGER
);
"#,
        dim = crate::embedding::EMBEDDING_DIMENSIONS
    )
}

pub(crate) const FTS_TRIGGERS: &str = r#"
CREATE TRIGGER IF NOT EXISTS entries_ai AFTER INSERT ON entries BEGIN
    INSERT INTO entries_fts(rowid, subject, content, tags_joined)
    VALUES (new.rowid, new.subject, new.content, new.tags_joined);
END;
CREATE TRIGGER IF NOT EXISTS entries_ad AFTER DELETE ON entries BEGIN
    INSERT INTO entries_fts(entries_fts, rowid, subject, content, tags_joined)
    VALUES('delete', old.rowid, old.subject, old.content, old.tags_joined);
END;
CREATE TRIGGER IF NOT EXISTS entries_au AFTER UPDATE ON entries BEGIN
    INSERT INTO entries_fts(entries_fts, rowid, subject, content, tags_joined)
    VALUES('delete', old.rowid, old.subject, old.content, old.tags_joined);
    INSERT INTO entries_fts(rowid, subject, content, tags_joined)
    VALUES (new.rowid, new.subject, new.content, new.tags_joined);
END;
"#;

pub fn table_exists(conn: &Connection, name: &str) -> bool {
    conn.query_row(
        "SELECT 1 FROM sqlite_master WHERE type IN ('table','view') AND name = ?",
        [name],
        |_| Ok(true),
    )
    .unwrap_or(false)
}

pub(crate) fn drop_fts_triggers(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        "DROP TRIGGER IF EXISTS entries_ai; \
         DROP TRIGGER IF EXISTS entries_ad; \
         DROP TRIGGER IF EXISTS entries_au;",
    )
}

/// Run all idempotent migrations, then — if the bulk sentinel is present —
/// perform recovery before returning (spec.md §4.E, §8 property 11).
pub async fn run_migrations(pool: &AgenrPool) -> Result<()> {
    pool.interact(|conn| {
        conn.execute_batch(CORE_SCHEMA)?;
        conn.execute_batch(&fts_and_vec_schema())?;
        conn.execute_batch(FTS_TRIGGERS)?;
        Ok(())
    })
    .await?;

    recover_if_needed(pool).await
}

/// If `_bulk_ingest_meta` is set, rebuild FTS triggers and the vector
/// index, then clear the sentinel. No writer proceeds before this
/// completes (spec.md §4.E, §8 property 11).
pub async fn recover_if_needed(pool: &AgenrPool) -> Result<()> {
    let sentinel_present = pool
        .interact(|conn| {
            Ok(conn
                .query_row(
                    "SELECT 1 FROM kv_sentinel WHERE key = ?1",
                    [BULK_SENTINEL_KEY],
                    |_| Ok(true),
                )
                .unwrap_or(false))
        })
        .await?;

    if !sentinel_present {
        return Ok(());
    }

    tracing::warn!("bulk ingest sentinel present at startup, running recovery");
    pool.interact(move |conn| {
        drop_fts_triggers(conn)?;
        conn.execute_batch(&fts_and_vec_schema())?;
        conn.execute_batch(FTS_TRIGGERS)?;
        rebuild_fts_index(conn)?;
        conn.execute("DELETE FROM kv_sentinel WHERE key = ?1", [BULK_SENTINEL_KEY])?;
        Ok(())
    })
    .await
}

/// Rebuild `entries_fts` wholesale from `entries` (used after bulk mode,
/// which skips FTS maintenance during the batch).
pub fn rebuild_fts_index(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute("INSERT INTO entries_fts(entries_fts) VALUES('delete-all')", [])
        .or_else(|_| conn.execute_batch("DELETE FROM entries_fts"))?;
    conn.execute_batch(
        "INSERT INTO entries_fts(rowid, subject, content, tags_joined) \
         SELECT rowid, subject, content, tags_joined FROM entries",
    )
}

pub async fn set_bulk_sentinel(pool: &AgenrPool) -> Result<()> {
    pool.interact(|conn| {
        conn.execute(
            "INSERT OR REPLACE INTO kv_sentinel(key, value) VALUES (?1, ?2)",
            rusqlite::params![BULK_SENTINEL_KEY, "1"],
        )?;
        Ok(())
    })
    .await
}

pub async fn clear_bulk_sentinel(pool: &AgenrPool) -> Result<()> {
    pool.interact(|conn| {
        conn.execute("DELETE FROM kv_sentinel WHERE key = ?1", [BULK_SENTINEL_KEY])?;
        Ok(())
    })
    .await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn migrations_are_idempotent() {
        let pool = AgenrPool::open_in_memory().await.unwrap();
        // run again; should not error
        run_migrations(&pool).await.unwrap();
        assert!(
            pool.interact(|conn| Ok(table_exists(conn, "entries")))
                .await
                .unwrap()
        );
    }

    #[tokio::test]
    async fn sentinel_triggers_recovery_and_is_cleared() {
        let pool = AgenrPool::open_in_memory().await.unwrap();
        set_bulk_sentinel(&pool).await.unwrap();
        recover_if_needed(&pool).await.unwrap();

        let present = pool
            .interact(|conn| {
                Ok(conn
                    .query_row(
                        "SELECT 1 FROM kv_sentinel WHERE key = ?1",
                        [BULK_SENTINEL_KEY],
                        |_| Ok(true),
                    )
                    .unwrap_or(false))
            })
            .await
            .unwrap();
        assert!(!present);
    }
}
