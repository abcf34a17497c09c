// src/storage/entries.rs
// Write path `store_entries` (spec.md §4.E steps 1-5): ingest_log
// short-circuit, batched embedding, per-entry candidate lookup + online
// dedup judge, the four write actions, and the final ingest_log append.

use std::time::Instant;

use chrono::Utc;
use rusqlite::{OptionalExtension, params};

use crate::embedding::EmbeddingClient;
use crate::error::Result;
use crate::llm::LlmClient;
use crate::storage::judge::{self, JudgeAction};
use crate::storage::pool::AgenrPool;
use crate::types::{EntryId, EntrySource, IngestLogRow, KnowledgeEntry, RelationType};

pub const DEFAULT_DEDUP_THRESHOLD: f32 = 0.88;
const CANDIDATE_TOP_K: i64 = 8;
const EMBED_BATCH_SIZE: usize = 200;
const EMBED_CONCURRENCY: usize = 3;

#[derive(Debug, Clone)]
pub struct StoreOptions {
    pub force: bool,
    pub dry_run: bool,
    pub online_dedup: bool,
    pub dedup_threshold: f32,
    pub bulk: bool,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            force: false,
            dry_run: false,
            online_dedup: false,
            dedup_threshold: DEFAULT_DEDUP_THRESHOLD,
            bulk: false,
        }
    }
}

#[derive(Debug, Default, Clone, serde::Serialize)]
pub struct StoreResult {
    pub added: u32,
    pub updated: u32,
    pub skipped: u32,
    pub superseded: u32,
    pub llm_dedup_calls: u32,
    pub relations_created: u32,
    pub total_entries: u32,
    pub duration_ms: u64,
}

struct Candidate {
    rowid: i64,
    id: EntryId,
    subject: String,
    content: String,
    content_hash: String,
    normalized_content_hash: String,
    via_canonical_key: bool,
}

fn embedding_to_blob(embedding: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(embedding.len() * 4);
    for v in embedding {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

/// Embed every entry's content in batches of `EMBED_BATCH_SIZE`, with at
/// most `EMBED_CONCURRENCY` batches in flight (spec.md §4.E step 2).
async fn embed_all(embedder: &dyn EmbeddingClient, entries: &[KnowledgeEntry]) -> Result<Vec<Vec<f32>>> {
    use futures::stream::{self, StreamExt, TryStreamExt};

    let texts: Vec<String> = entries.iter().map(|e| e.content.clone()).collect();
    if texts.is_empty() {
        return Ok(Vec::new());
    }

    let batches: Vec<Vec<String>> = texts.chunks(EMBED_BATCH_SIZE).map(|c| c.to_vec()).collect();
    let results: Vec<Vec<Vec<f32>>> = stream::iter(batches)
        .map(|batch| async move { embedder.embed(&batch).await })
        .buffered(EMBED_CONCURRENCY)
        .try_collect()
        .await?;

    Ok(results.into_iter().flatten().collect())
}

enum WriteAction {
    Added,
    Updated,
    Superseded,
    Skipped,
}

/// Entry point for the whole write path (spec.md §4.E).
pub async fn store_entries(
    pool: &AgenrPool,
    embedder: &dyn EmbeddingClient,
    judge_llm: Option<&dyn LlmClient>,
    judge_model: &str,
    file_path: &str,
    file_content_hash: &str,
    entries: Vec<KnowledgeEntry>,
    options: &StoreOptions,
) -> Result<StoreResult> {
    let start = Instant::now();
    let mut result = StoreResult {
        total_entries: entries.len() as u32,
        ..Default::default()
    };

    if !options.force && crate::storage::ingest_log::already_ingested(pool, file_path, file_content_hash).await? {
        return Ok(result);
    }

    let embeddings = embed_all(embedder, &entries).await?;

    for (entry, embedding) in entries.into_iter().zip(embeddings.into_iter()) {
        let entry = entry.with_embedding(embedding);
        let (action, judge_called) =
            store_one(pool, judge_llm, judge_model, entry, options).await?;
        if judge_called {
            result.llm_dedup_calls += 1;
        }
        match action {
            WriteAction::Added => result.added += 1,
            WriteAction::Updated => result.updated += 1,
            WriteAction::Superseded => {
                result.superseded += 1;
                result.relations_created += 1;
            }
            WriteAction::Skipped => result.skipped += 1,
        }
    }

    result.duration_ms = start.elapsed().as_millis() as u64;

    if !options.dry_run {
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
        checkpoint(pool).await?;
    }

    Ok(result)
}

async fn store_one(
    pool: &AgenrPool,
    judge_llm: Option<&dyn LlmClient>,
    judge_model: &str,
    entry: KnowledgeEntry,
    options: &StoreOptions,
) -> Result<(WriteAction, bool)> {
    let candidate = find_candidate(pool, &entry, options.dedup_threshold).await?;

    let Some(candidate) = candidate else {
        if options.dry_run {
            return Ok((WriteAction::Skipped, false));
        }
        insert_new(pool, &entry, None).await?;
        return Ok((WriteAction::Added, false));
    };

    let same_hash = candidate.content_hash == entry.content_hash
        || candidate.normalized_content_hash == entry.normalized_content_hash;

    if !options.online_dedup || judge_llm.is_none() {
        // A canonical_key match is an explicit identity claim: treat it as
        // an update even when content drifted, rather than inserting a
        // second row with the same (kind, canonical_key).
        if same_hash || candidate.via_canonical_key {
            if options.dry_run {
                return Ok((WriteAction::Skipped, false));
            }
            bump_confirmation(pool, candidate.id).await?;
            return Ok((WriteAction::Updated, false));
        }
        if options.dry_run {
            return Ok((WriteAction::Skipped, false));
        }
        insert_new(pool, &entry, None).await?;
        return Ok((WriteAction::Added, false));
    }

    let verdict = judge::judge(
        judge_llm.expect("checked above"),
        judge_model,
        &entry,
        &candidate.subject,
        &candidate.content,
    )
    .await?;

    match verdict.action {
        JudgeAction::Duplicate => {
            if options.dry_run {
                return Ok((WriteAction::Skipped, true));
            }
            bump_confirmation(pool, candidate.id).await?;
            Ok((WriteAction::Updated, true))
        }
        JudgeAction::Update => {
            if options.dry_run {
                return Ok((WriteAction::Skipped, true));
            }
            bump_confirmation(pool, candidate.id).await?;
            Ok((WriteAction::Updated, true))
        }
        JudgeAction::Supersede => {
            if options.dry_run {
                return Ok((WriteAction::Skipped, true));
            }
            insert_new(pool, &entry, Some(candidate.id)).await?;
            Ok((WriteAction::Superseded, true))
        }
        JudgeAction::Distinct => {
            if options.dry_run {
                return Ok((WriteAction::Skipped, true));
            }
            insert_new(pool, &entry, None).await?;
            Ok((WriteAction::Added, true))
        }
    }
}

async fn find_candidate(pool: &AgenrPool, entry: &KnowledgeEntry, threshold: f32) -> Result<Option<Candidate>> {
    if let Some(key) = entry.canonical_key.clone() {
        let kind = entry.kind.as_str().to_string();
        let found = pool
            .interact(move |conn| {
                conn.query_row(
                    "SELECT rowid, id, subject, content, content_hash, normalized_content_hash \
                     FROM entries \
                     WHERE kind = ?1 AND canonical_key = ?2 AND retired = 0 AND superseded_by IS NULL \
                     LIMIT 1",
                    params![kind, key],
                    |row| {
                        Ok(Candidate {
                            rowid: row.get(0)?,
                            id: EntryId(row.get::<_, String>(1)?.parse().map_err(|_| {
                                rusqlite::Error::InvalidColumnType(1, "id".into(), rusqlite::types::Type::Text)
                            })?),
                            subject: row.get(2)?,
                            content: row.get(3)?,
                            content_hash: row.get(4)?,
                            normalized_content_hash: row.get(5)?,
                            via_canonical_key: true,
                        })
                    },
                )
                .optional()
                .map_err(crate::error::AgenrError::from)
            })
            .await?;
        if found.is_some() {
            return Ok(found);
        }
    }

    let Some(embedding) = entry.embedding.clone() else {
        return Ok(None);
    };
    let blob = embedding_to_blob(&embedding);

    pool.interact(move |conn| {
        let mut stmt = conn.prepare(
            "SELECT e.rowid, e.id, e.subject, e.content, e.content_hash, e.normalized_content_hash, v.distance \
             FROM entries_vec v JOIN entries e ON e.rowid = v.entry_rowid \
             WHERE v.embedding MATCH ?1 AND k = ?2 \
             ORDER BY v.distance",
        )?;
        let mut rows = stmt.query(params![blob, CANDIDATE_TOP_K])?;
        while let Some(row) = rows.next()? {
            let distance: f64 = row.get(6)?;
            let similarity = (1.0 - distance) as f32;
            if similarity >= threshold {
                return Ok(Some(Candidate {
                    rowid: row.get(0)?,
                    id: EntryId(row.get::<_, String>(1)?.parse().map_err(|_| {
                        rusqlite::Error::InvalidColumnType(1, "id".into(), rusqlite::types::Type::Text)
                    })?),
                    subject: row.get(2)?,
                    content: row.get(3)?,
                    content_hash: row.get(4)?,
                    normalized_content_hash: row.get(5)?,
                    via_canonical_key: false,
                }));
            }
        }
        Ok(None)
    })
    .await
}

async fn insert_new(pool: &AgenrPool, entry: &KnowledgeEntry, supersedes: Option<EntryId>) -> Result<()> {
    let entry = entry.clone();
    let supersedes_id = supersedes;
    pool.interact(move |conn| {
        let tags_joined = entry.tags.iter().cloned().collect::<Vec<_>>().join(" ");
        let (source_kind, source_path, source_text) = match &entry.source {
            EntrySource::File { path } => ("file", Some(path.clone()), None),
            EntrySource::Context { text } => ("context", None, Some(text.clone())),
        };

        conn.execute(
            "INSERT INTO entries \
                (id, kind, subject, canonical_key, content, tags_joined, importance, expiry, scope, \
                 platform, project, source_kind, source_path, source_text, created_at, updated_at, \
                 last_recalled_at, recall_count, confirmations, contradictions, retired, retired_at, \
                 retired_reason, suppressed_contexts, superseded_by, content_hash, normalized_content_hash, \
                 minhash, subject_key, predicate, object, claim_confidence, quality_score) \
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15,?16,?17,?18,?19,?20,?21,?22,?23,?24,?25,?26,?27,?28,?29,?30,?31,?32,?33)",
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
                entry.last_recalled_at.map(|t| t.to_rfc3339()),
                entry.recall_count,
                entry.confirmations,
                entry.contradictions,
                entry.retired as i64,
                entry.retired_at.map(|t| t.to_rfc3339()),
                entry.retired_reason,
                serde_json::to_string(&entry.suppressed_contexts).unwrap_or_default(),
                entry.superseded_by.map(|id| id.to_string()),
                entry.content_hash,
                entry.normalized_content_hash,
                minhash_to_blob(&entry.minhash),
                entry.subject_key,
                entry.predicate,
                entry.object,
                entry.claim_confidence,
                entry.quality_score,
            ],
        )?;

        let rowid = conn.last_insert_rowid();

        for tag in &entry.tags {
            conn.execute(
                "INSERT OR IGNORE INTO tags (entry_id, tag) VALUES (?1, ?2)",
                params![entry.id.to_string(), tag],
            )?;
        }

        if let Some(embedding) = &entry.embedding {
            conn.execute(
                "INSERT INTO entries_vec (entry_rowid, embedding) VALUES (?1, ?2)",
                params![rowid, embedding_to_blob(embedding)],
            )?;
        }

        if let Some(old_id) = supersedes_id {
            conn.execute(
                "UPDATE entries SET superseded_by = ?1 WHERE id = ?2",
                params![entry.id.to_string(), old_id.to_string()],
            )?;
            let now = Utc::now().to_rfc3339();
            conn.execute(
                "INSERT INTO relations (source_id, target_id, relation_type, created_at) VALUES (?1, ?2, ?3, ?4)",
                params![entry.id.to_string(), old_id.to_string(), RelationType::Supersedes.as_str(), now],
            )?;
        }

        Ok(())
    })
    .await
}

async fn bump_confirmation(pool: &AgenrPool, id: EntryId) -> Result<()> {
    pool.interact(move |conn| {
        conn.execute(
            "UPDATE entries SET confirmations = confirmations + 1, updated_at = ?1 WHERE id = ?2",
            params![Utc::now().to_rfc3339(), id.to_string()],
        )?;
        Ok(())
    })
    .await
}

async fn checkpoint(pool: &AgenrPool) -> Result<()> {
    pool.interact(|conn| {
        conn.execute_batch("PRAGMA wal_checkpoint(PASSIVE);")?;
        Ok(())
    })
    .await
}

fn minhash_to_blob(minhash: &[u32; crate::dedup::minhash::MINHASH_SIZE]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(minhash.len() * 4);
    for v in minhash {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{EntrySource, RawEntry};

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

    struct FakeEmbedder;

    #[async_trait::async_trait]
    impl EmbeddingClient for FakeEmbedder {
        async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            Ok(texts.iter().map(|t| vec![t.len() as f32; crate::embedding::EMBEDDING_DIMENSIONS]).collect())
        }
    }

    #[tokio::test]
    async fn adds_new_entry_with_no_candidates() {
        let pool = AgenrPool::open_in_memory().await.unwrap();
        let embedder = FakeEmbedder;
        let entries = vec![fake_entry("editor", "uses vim")];

        let result = store_entries(
            &pool,
            &embedder,
            None,
            "unused",
            "file.jsonl",
            "hash-a",
            entries,
            &StoreOptions::default(),
        )
        .await
        .unwrap();

        assert_eq!(result.added, 1);
        assert_eq!(result.skipped, 0);
    }

    #[tokio::test]
    async fn repeat_file_hash_short_circuits() {
        let pool = AgenrPool::open_in_memory().await.unwrap();
        let embedder = FakeEmbedder;

        let first = store_entries(
            &pool,
            &embedder,
            None,
            "unused",
            "file.jsonl",
            "hash-a",
            vec![fake_entry("editor", "uses vim")],
            &StoreOptions::default(),
        )
        .await
        .unwrap();
        assert_eq!(first.added, 1);

        let second = store_entries(
            &pool,
            &embedder,
            None,
            "unused",
            "file.jsonl",
            "hash-a",
            vec![fake_entry("editor", "uses vim")],
            &StoreOptions::default(),
        )
        .await
        .unwrap();
        assert_eq!(second.added, 0);
        assert_eq!(second.total_entries, 1);
    }

    #[tokio::test]
    async fn exact_canonical_key_match_updates_instead_of_inserting() {
        let pool = AgenrPool::open_in_memory().await.unwrap();
        let embedder = FakeEmbedder;

        let mut first = fake_entry("editor", "uses vim");
        first.canonical_key = Some("user-preferred-editor".to_string());

        store_entries(
            &pool,
            &embedder,
            None,
            "unused",
            "file1.jsonl",
            "hash-a",
            vec![first],
            &StoreOptions::default(),
        )
        .await
        .unwrap();

        let mut second = fake_entry("editor", "uses vim, confirmed again");
        second.canonical_key = Some("user-preferred-editor".to_string());

        let result = store_entries(
            &pool,
            &embedder,
            None,
            "unused",
            "file2.jsonl",
            "hash-b",
            vec![second],
            &StoreOptions::default(),
        )
        .await
        .unwrap();

        assert_eq!(result.updated, 1);
        assert_eq!(result.added, 0);
    }
}
