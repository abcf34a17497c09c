// src/storage/bulk.rs
// Bulk ingest mode (spec.md §4.E): drop FTS triggers and the vector index,
// dedup by minhash only (no LLM judge, no FTS maintenance mid-batch), set
// the `_bulk_ingest_meta` sentinel before any write and clear it only after
// rebuild. A crash between set and clear leaves the sentinel for
// `schema::recover_if_needed` to pick up on the next open.

use chrono::Utc;
use rusqlite::{OptionalExtension, params};

use crate::dedup::LOCAL_DEDUP_THRESHOLD;
use crate::dedup::minhash::minhash_similarity;
use crate::error::Result;
use crate::storage::entries::StoreResult;
use crate::storage::pool::AgenrPool;
use crate::storage::schema;
use crate::types::{EntryId, EntryKind, EntrySource, IngestLogRow, KnowledgeEntry};

struct ExistingRow {
    id: EntryId,
    minhash: [u32; crate::dedup::minhash::MINHASH_SIZE],
}

/// Insert a batch of entries in bulk mode: no embedding calls, no online
/// dedup judge, no per-row FTS trigger maintenance. The vector and FTS
/// indexes are rebuilt once after the whole batch lands.
pub async fn store_entries_bulk(
    pool: &AgenrPool,
    file_path: &str,
    file_content_hash: &str,
    entries: Vec<KnowledgeEntry>,
) -> Result<StoreResult> {
    let start = std::time::Instant::now();
    let mut result = StoreResult {
        total_entries: entries.len() as u32,
        ..Default::default()
    };

    if crate::storage::ingest_log::already_ingested(pool, file_path, file_content_hash).await? {
        return Ok(result);
    }

    schema::set_bulk_sentinel(pool).await?;

    pool.interact(|conn| {
        schema::drop_fts_triggers(conn)?;
        Ok(())
    })
    .await?;

    for entry in entries {
        let inserted = insert_with_minhash_dedup(pool, entry).await?;
        if inserted {
            result.added += 1;
        } else {
            result.updated += 1;
        }
    }

    result.duration_ms = start.elapsed().as_millis() as u64;

    crate::storage::ingest_log::record(
        pool,
        IngestLogRow {
            file_path: file_path.to_string(),
            content_hash: file_content_hash.to_string(),
            ingested_at: Utc::now(),
            added: result.added,
            updated: result.updated,
            skipped: result.skipped,
            superseded: result.superseded,
            duration_ms: result.duration_ms,
        },
    )
    .await?;

    rebuild_after_bulk(pool).await?;
    schema::clear_bulk_sentinel(pool).await?;

    Ok(result)
}

async fn insert_with_minhash_dedup(pool: &AgenrPool, entry: KnowledgeEntry) -> Result<bool> {
    let kind = entry.kind;
    let canonical_key = entry.canonical_key.clone();
    let normalized_subject = crate::text::normalize(&entry.subject);

    let candidates = load_candidates(pool, kind, canonical_key.clone(), normalized_subject).await?;

    let matched = candidates.iter().find(|c| minhash_similarity(&c.minhash, &entry.minhash) >= LOCAL_DEDUP_THRESHOLD);

    if let Some(existing) = matched {
        let id = existing.id;
        pool.interact(move |conn| {
            conn.execute(
                "UPDATE entries SET confirmations = confirmations + 1, updated_at = ?1 WHERE id = ?2",
                params![Utc::now().to_rfc3339(), id.to_string()],
            )?;
            Ok(())
        })
        .await?;
        return Ok(false);
    }

    insert_bare(pool, &entry).await?;
    Ok(true)
}

async fn load_candidates(
    pool: &AgenrPool,
    kind: EntryKind,
    canonical_key: Option<String>,
    normalized_subject: String,
) -> Result<Vec<ExistingRow>> {
    pool.interact(move |conn| {
        let mut stmt = conn.prepare(
            "SELECT id, subject, canonical_key, minhash FROM entries \
             WHERE kind = ?1 AND retired = 0 AND superseded_by IS NULL",
        )?;
        let kind_str = kind.as_str().to_string();
        let rows = stmt.query_map(params![kind_str], |row| {
            let id: String = row.get(0)?;
            let subject: String = row.get(1)?;
            let row_canonical_key: Option<String> = row.get(2)?;
            let minhash_blob: Vec<u8> = row.get(3)?;
            Ok((id, subject, row_canonical_key, minhash_blob))
        })?;

        let mut out = Vec::new();
        for row in rows {
            let (id, subject, row_canonical_key, minhash_blob) = row?;
            let is_canonical_match = canonical_key.is_some() && row_canonical_key == canonical_key;
            if !is_canonical_match && crate::text::normalize(&subject) != normalized_subject {
                continue;
            }
            out.push(ExistingRow {
                id: EntryId(id.parse().map_err(|_| {
                    rusqlite::Error::InvalidColumnType(0, "id".into(), rusqlite::types::Type::Text)
                })?),
                minhash: blob_to_minhash(&minhash_blob),
            });
        }
        Ok(out)
    })
    .await
}

fn blob_to_minhash(blob: &[u8]) -> [u32; crate::dedup::minhash::MINHASH_SIZE] {
    let mut sig = [0u32; crate::dedup::minhash::MINHASH_SIZE];
    for (i, chunk) in blob.chunks_exact(4).take(sig.len()).enumerate() {
        sig[i] = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
    }
    sig
}

async fn insert_bare(pool: &AgenrPool, entry: &KnowledgeEntry) -> Result<()> {
    let entry = entry.clone();
    pool.interact(move |conn| {
        let tags_joined = entry.tags.iter().cloned().collect::<Vec<_>>().join(" ");
        let (source_kind, source_path, source_text) = match &entry.source {
            EntrySource::File { path } => ("file", Some(path.clone()), None),
            EntrySource::Context { text } => ("context", None, Some(text.clone())),
        };
        let mut minhash_bytes = Vec::with_capacity(entry.minhash.len() * 4);
        for v in &entry.minhash {
            minhash_bytes.extend_from_slice(&v.to_le_bytes());
        }

        conn.execute(
            "INSERT INTO entries \
                (id, kind, subject, canonical_key, content, tags_joined, importance, expiry, scope, \
                 platform, project, source_kind, source_path, source_text, created_at, updated_at, \
                 recall_count, confirmations, contradictions, retired, suppressed_contexts, \
                 content_hash, normalized_content_hash, minhash, subject_key, predicate, object, \
                 claim_confidence, quality_score) \
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15,?16,?17,?18,?19,?20,?21,?22,?23,?24,?25,?26,?27,?28,?29)",
            params![
                entry.id.to_string(),
                entry.kind.as_str(),
                entry.subject,
                entry.canonical_key,
                entry.content,
                tags_joined,
                entry.importance,
                entry.expiry.as_str(),
                entry.scope.as_str(),
                entry.platform.map(|p| p.as_str().to_string()),
                entry.project,
                source_kind,
                source_path,
                source_text,
                entry.created_at.to_rfc3339(),
                entry.updated_at.to_rfc3339(),
                entry.recall_count,
                entry.confirmations,
                entry.contradictions,
                entry.retired as i64,
                serde_json::to_string(&entry.suppressed_contexts).unwrap_or_default(),
                entry.content_hash,
                entry.normalized_content_hash,
                minhash_bytes,
                entry.subject_key,
                entry.predicate,
                entry.object,
                entry.claim_confidence,
                entry.quality_score,
            ],
        )?;

        for tag in &entry.tags {
            conn.execute(
                "INSERT OR IGNORE INTO tags (entry_id, tag) VALUES (?1, ?2)",
                params![entry.id.to_string(), tag],
            )?;
        }
        Ok(())
    })
    .await
}

/// Rebuild FTS triggers/index after a bulk batch. Embeddings for
/// bulk-inserted rows are backfilled by a later consolidator pass rather
/// than computed inline, since bulk mode's whole point is to skip the
/// per-entry embedding round trip.
async fn rebuild_after_bulk(pool: &AgenrPool) -> Result<()> {
    pool.interact(|conn| {
        conn.execute_batch(schema::FTS_TRIGGERS)?;
        schema::rebuild_fts_index(conn)?;
        Ok(())
    })
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::RawEntry;

    fn fake_entry(subject: &str, content: &str) -> KnowledgeEntry {
        KnowledgeEntry::new(RawEntry {
            kind: "fact".to_string(),
            subject: subject.to_string(),
            canonical_key: None,
            content: content.to_string(),
            importance: None,
            expiry: None,
            scope: None,
            platform: None,
            project: None,
            tags: vec![],
            source: EntrySource::Context { text: String::new() },
            created_at: None,
            subject_key: None,
            predicate: None,
            object: None,
            claim_confidence: None,
        })
        .unwrap()
    }

    #[tokio::test]
    async fn bulk_insert_clears_sentinel_on_success() {
        let pool = AgenrPool::open_in_memory().await.unwrap();
        let result = store_entries_bulk(
            &pool,
            "bulk.jsonl",
            "hash-bulk",
            vec![fake_entry("editor", "uses vim"), fake_entry("shell", "uses zsh")],
        )
        .await
        .unwrap();

        assert_eq!(result.added, 2);

        let sentinel_present = pool
            .interact(|conn| {
                Ok(conn
                    .query_row(
                        "SELECT 1 FROM kv_sentinel WHERE key = ?1",
                        [schema::BULK_SENTINEL_KEY],
                        |_| Ok(true),
                    )
                    .optional()?
                    .unwrap_or(false))
            })
            .await
            .unwrap();
        assert!(!sentinel_present);
    }

    #[tokio::test]
    async fn near_duplicate_minhash_folds_to_update() {
        let pool = AgenrPool::open_in_memory().await.unwrap();
        store_entries_bulk(&pool, "f1.jsonl", "h1", vec![fake_entry("editor", "the user prefers vim for editing")])
            .await
            .unwrap();

        let result = store_entries_bulk(
            &pool,
            "f2.jsonl",
            "h2",
            vec![fake_entry("editor", "the user prefers vim, for editing")],
        )
        .await
        .unwrap();

        assert_eq!(result.added, 0);
        assert_eq!(result.updated, 1);
    }
}
