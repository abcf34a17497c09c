// src/consolidate/mod.rs
// Consolidator (spec.md §4.H): two on-demand phases over the whole store.
// Grounded on the teacher's `background/knowledge_distillation.rs`
// gather -> group -> distill -> store shape, generalized from heuristic
// team-session summarization to LLM cluster merging with embedding-based
// verification.

use std::collections::{HashMap, HashSet};

use chrono::Utc;
use rusqlite::params;
use serde_json::Value;

use crate::config::{ConsolidationConfig, ForgettingConfig};
use crate::embedding::EmbeddingClient;
use crate::error::Result;
use crate::llm::LlmClient;
use crate::queue::WriteQueue;
use crate::recall::scoring::vector_score;
use crate::storage::pool::AgenrPool;
use crate::types::{EntryId, EntryKind, EntrySource, Expiry, KnowledgeEntry, RawEntry, RelationType};

const EMBED_BATCH_SIZE: usize = 200;
/// Cap on how many active entries are pulled into phase 2 clustering in one
/// run; a background, infrequent pass trades exhaustiveness for a bounded
/// single query rather than paging indefinitely.
const MAX_CLUSTERING_CANDIDATES: i64 = 5000;

#[derive(Debug, Default, Clone, serde::Serialize)]
pub struct ConsolidateResult {
    pub retired_expired: u32,
    pub merged_near_exact: u32,
    pub orphan_relations_removed: u32,
    pub orphan_co_recall_edges_removed: u32,
    pub quality_decayed: u32,
    pub clusters_considered: u32,
    pub clusters_merged: u32,
    pub clusters_sent_to_review: u32,
    pub clusters_skipped_idempotent: u32,
    pub embeddings_backfilled: u32,
    pub duration_ms: u64,
}

/// Run both consolidation phases, then rebuild the vector index and
/// checkpoint under `runExclusive` (spec.md §4.H).
pub async fn consolidate(
    pool: &AgenrPool,
    embedder: &dyn EmbeddingClient,
    llm: Option<&dyn LlmClient>,
    merge_model: &str,
    queue: &WriteQueue,
    forgetting: &ForgettingConfig,
    consolidation: &ConsolidationConfig,
) -> Result<ConsolidateResult> {
    let start = std::time::Instant::now();
    let mut result = ConsolidateResult::default();

    if forgetting.enabled {
        result.retired_expired = retire_expired(pool, forgetting).await?;
        result.quality_decayed = decay_quality_scores(pool, forgetting).await?;
    }
    result.merged_near_exact = merge_near_exact_duplicates(pool, consolidation).await?;
    result.orphan_relations_removed = drop_orphan_relations(pool).await?;
    result.orphan_co_recall_edges_removed = drop_orphan_co_recall_edges(pool).await?;

    if let Some(llm) = llm {
        let phase2 = run_phase2(pool, embedder, llm, merge_model, consolidation).await?;
        result.clusters_considered = phase2.clusters_considered;
        result.clusters_merged = phase2.clusters_merged;
        result.clusters_sent_to_review = phase2.clusters_sent_to_review;
        result.clusters_skipped_idempotent = phase2.clusters_skipped_idempotent;
    }

    result.embeddings_backfilled = backfill_missing_embeddings(pool, embedder).await?;

    let pool_for_checkpoint = pool.clone();
    queue
        .run_exclusive(move || async move { checkpoint(&pool_for_checkpoint).await })
        .await?;

    result.duration_ms = start.elapsed().as_millis() as u64;
    Ok(result)
}

/// Phase 1 step 1: retire entries with `expiry=temporary`, `recall_count=0`,
/// older than `forgetting.max_age_days`, unless tagged with a protected tag.
async fn retire_expired(pool: &AgenrPool, forgetting: &ForgettingConfig) -> Result<u32> {
    let cutoff = (Utc::now() - chrono::Duration::days(forgetting.max_age_days as i64)).to_rfc3339();
    let protect = forgetting.protect.clone();
    let now = Utc::now().to_rfc3339();

    pool.interact(move |conn| {
        let mut stmt = conn.prepare(
            "SELECT id, tags_joined FROM entries \
             WHERE retired = 0 AND superseded_by IS NULL AND expiry = 'temporary' \
             AND recall_count = 0 AND created_at < ?1",
        )?;
        let rows = stmt.query_map(params![cutoff], |row| {
            let id: String = row.get(0)?;
            let tags_joined: String = row.get(1)?;
            Ok((id, tags_joined))
        })?;

        let mut to_retire = Vec::new();
        for row in rows {
            let (id, tags_joined) = row?;
            let tags: HashSet<&str> = tags_joined.split_whitespace().collect();
            if protect.iter().any(|p| tags.contains(p.as_str())) {
                continue;
            }
            to_retire.push(id);
        }

        for id in &to_retire {
            conn.execute(
                "UPDATE entries SET retired = 1, retired_at = ?1, retired_reason = ?2 WHERE id = ?3",
                params![now, "expired: temporary, unrecalled, past max age", id],
            )?;
        }
        Ok(to_retire.len() as u32)
    })
    .await
}

/// Quality decay (spec.md §3: the consolidator mutates entries via "merges,
/// retirement, quality decay"): exponential decay toward `score_threshold`
/// with the same half-life shape `recall::scoring::recency_score` uses,
/// floored at `score_threshold` so decay never pushes a score below the
/// point forgetting itself would act on.
async fn decay_quality_scores(pool: &AgenrPool, forgetting: &ForgettingConfig) -> Result<u32> {
    let floor = forgetting.score_threshold;
    let half_life_days = forgetting.max_age_days as f64 / 2.0;
    let now = Utc::now();

    pool.interact(move |conn| {
        let mut stmt = conn.prepare(
            "SELECT id, quality_score, updated_at FROM entries \
             WHERE retired = 0 AND superseded_by IS NULL",
        )?;
        let rows = stmt.query_map([], |row| {
            let id: String = row.get(0)?;
            let quality_score: f32 = row.get(1)?;
            let updated_at: String = row.get(2)?;
            Ok((id, quality_score, updated_at))
        })?;

        let mut decayed = 0u32;
        for row in rows {
            let (id, quality_score, updated_at) = row?;
            let Ok(updated_at) = chrono::DateTime::parse_from_rfc3339(&updated_at) else {
                continue;
            };
            let age_days = (now - updated_at.with_timezone(&Utc)).num_seconds() as f64 / 86_400.0;
            if age_days <= 0.0 || half_life_days <= 0.0 {
                continue;
            }
            let decay = 2f64.powf(-age_days / half_life_days) as f32;
            let new_score = (quality_score * decay).max(floor);
            if (new_score - quality_score).abs() > f32::EPSILON {
                conn.execute(
                    "UPDATE entries SET quality_score = ?1 WHERE id = ?2",
                    params![new_score, id],
                )?;
                decayed += 1;
            }
        }
        Ok(decayed)
    })
    .await
}

/// Phase 1 step 2: within each `(kind, normalized subject)` partition,
/// merge near-exact duplicates (trigram Jaccard over content >=
/// `near_duplicate_threshold`), keeping the highest importance and earliest
/// `created_at`. Losers are marked `superseded_by` the keeper, same as an
/// online-dedup supersede.
async fn merge_near_exact_duplicates(pool: &AgenrPool, consolidation: &ConsolidationConfig) -> Result<u32> {
    let threshold = consolidation.near_duplicate_threshold;
    let now = Utc::now().to_rfc3339();

    pool.interact(move |conn| {
        let mut stmt = conn.prepare(
            "SELECT rowid, id, kind, subject, content, importance, created_at \
             FROM entries WHERE retired = 0 AND superseded_by IS NULL",
        )?;
        let rows = stmt.query_map([], |row| {
            let rowid: i64 = row.get(0)?;
            let id: String = row.get(1)?;
            let kind: String = row.get(2)?;
            let subject: String = row.get(3)?;
            let content: String = row.get(4)?;
            let importance: i64 = row.get(5)?;
            let created_at: String = row.get(6)?;
            Ok((rowid, id, kind, subject, content, importance, created_at))
        })?;

        let mut by_group: HashMap<(String, String), Vec<(i64, String, String, i64, String)>> = HashMap::new();
        for row in rows {
            let (rowid, id, kind, subject, content, importance, created_at) = row?;
            let key = (kind, crate::text::normalize(&subject));
            by_group
                .entry(key)
                .or_default()
                .push((rowid, id, content, importance, created_at));
        }

        let mut merged = 0u32;
        for (_, mut members) in by_group {
            if members.len() < 2 {
                continue;
            }
            // Deterministic order so repeated runs pick the same keeper.
            members.sort_by(|a, b| a.4.cmp(&b.4));

            let grams: Vec<_> = members
                .iter()
                .map(|(_, _, content, _, _)| crate::text::trigrams(&crate::text::normalize(content)))
                .collect();

            let mut absorbed = vec![false; members.len()];
            for i in 0..members.len() {
                if absorbed[i] {
                    continue;
                }
                let mut cluster = vec![i];
                for j in (i + 1)..members.len() {
                    if absorbed[j] {
                        continue;
                    }
                    if crate::text::jaccard(&grams[i], &grams[j]) >= threshold {
                        cluster.push(j);
                    }
                }
                if cluster.len() < 2 {
                    continue;
                }
                // Highest importance first, then earliest created_at.
                cluster.sort_by(|&a, &b| {
                    members[b].3.cmp(&members[a].3).then(members[a].4.cmp(&members[b].4))
                });
                let keeper_idx = cluster[0];
                let keeper_id = members[keeper_idx].1.clone();
                for &loser_idx in &cluster[1..] {
                    absorbed[loser_idx] = true;
                    let loser_id = members[loser_idx].1.clone();
                    conn.execute(
                        "UPDATE entries SET superseded_by = ?1 WHERE id = ?2",
                        params![keeper_id, loser_id],
                    )?;
                    conn.execute(
                        "INSERT INTO relations (source_id, target_id, relation_type, created_at) \
                         VALUES (?1, ?2, ?3, ?4)",
                        params![keeper_id, loser_id, RelationType::Supersedes.as_str(), now],
                    )?;
                    merged += 1;
                }
            }
        }
        Ok(merged)
    })
    .await
}

/// Phase 1 step 3: relations whose endpoints no longer exist in `entries`.
async fn drop_orphan_relations(pool: &AgenrPool) -> Result<u32> {
    pool.interact(|conn| {
        let count = conn.execute(
            "DELETE FROM relations WHERE \
             source_id NOT IN (SELECT id FROM entries) OR \
             target_id NOT IN (SELECT id FROM entries)",
            [],
        )?;
        Ok(count as u32)
    })
    .await
}

/// Phase 1 step 4: co-recall edges referencing a retired or deleted entry.
async fn drop_orphan_co_recall_edges(pool: &AgenrPool) -> Result<u32> {
    pool.interact(|conn| {
        let count = conn.execute(
            "DELETE FROM co_recall_edges WHERE \
             entry_a NOT IN (SELECT id FROM entries WHERE retired = 0) OR \
             entry_b NOT IN (SELECT id FROM entries WHERE retired = 0)",
            [],
        )?;
        Ok(count as u32)
    })
    .await
}

struct ActiveEntry {
    rowid: i64,
    id: EntryId,
    subject: String,
    content: String,
    kind: EntryKind,
    embedding: Vec<f32>,
}

#[derive(Default)]
struct Phase2Outcome {
    clusters_considered: u32,
    clusters_merged: u32,
    clusters_sent_to_review: u32,
    clusters_skipped_idempotent: u32,
}

async fn run_phase2(
    pool: &AgenrPool,
    embedder: &dyn EmbeddingClient,
    llm: &dyn LlmClient,
    merge_model: &str,
    consolidation: &ConsolidationConfig,
) -> Result<Phase2Outcome> {
    let mut outcome = Phase2Outcome::default();
    let idempotency_cutoff = (Utc::now() - chrono::Duration::days(consolidation.idempotency_days)).to_rfc3339();

    let candidates = pool
        .interact(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT e.rowid, e.id, e.subject, e.content, e.kind, v.embedding \
                 FROM entries e JOIN entries_vec v ON v.entry_rowid = e.rowid \
                 WHERE e.retired = 0 AND e.superseded_by IS NULL \
                   AND (e.last_consolidated_at IS NULL OR e.last_consolidated_at < ?1) \
                 LIMIT ?2",
            )?;
            let rows = stmt.query_map(params![idempotency_cutoff, MAX_CLUSTERING_CANDIDATES], |row| {
                let rowid: i64 = row.get(0)?;
                let id: String = row.get(1)?;
                let subject: String = row.get(2)?;
                let content: String = row.get(3)?;
                let kind: String = row.get(4)?;
                let blob: Vec<u8> = row.get(5)?;
                Ok((rowid, id, subject, content, kind, blob))
            })?;

            let mut out = Vec::new();
            for row in rows {
                let (rowid, id, subject, content, kind, blob) = row?;
                let Ok(uuid) = id.parse() else { continue };
                let Some(kind) = EntryKind::parse(&kind) else { continue };
                out.push(ActiveEntry {
                    rowid,
                    id: EntryId(uuid),
                    subject,
                    content,
                    kind,
                    embedding: blob_to_embedding(&blob),
                });
            }
            Ok(out)
        })
        .await?;

    let clusters = cluster_by_similarity(&candidates, consolidation.cluster_similarity_threshold, consolidation.min_cluster_size);

    for cluster_indices in clusters {
        if cluster_indices.len() > consolidation.max_cluster_size {
            continue;
        }
        outcome.clusters_considered += 1;
        let members: Vec<&ActiveEntry> = cluster_indices.iter().map(|&i| &candidates[i]).collect();

        match merge_cluster(pool, embedder, llm, merge_model, &members).await? {
            ClusterOutcome::Merged => outcome.clusters_merged += 1,
            ClusterOutcome::SentToReview => outcome.clusters_sent_to_review += 1,
            ClusterOutcome::Aborted => {}
        }
    }

    // Clusters that existed but were entirely within the idempotency window
    // were excluded by the SQL filter above; report how many candidates
    // that left out so a caller can see the cap taking effect.
    let total_active = pool
        .interact(|conn| {
            conn.query_row(
                "SELECT COUNT(*) FROM entries WHERE retired = 0 AND superseded_by IS NULL",
                [],
                |row| row.get::<_, i64>(0),
            )
        })
        .await?;
    let skipped = (total_active as i64 - candidates.len() as i64).max(0);
    outcome.clusters_skipped_idempotent = skipped as u32;

    Ok(outcome)
}

/// Greedy connected-components clustering over the pairwise cosine graph.
/// O(n^2); acceptable for an infrequent background pass over a capped
/// candidate set (spec.md §4.H does not specify an ANN-based clustering
/// algorithm, only a similarity threshold and a minimum size).
fn cluster_by_similarity(entries: &[ActiveEntry], threshold: f32, min_size: usize) -> Vec<Vec<usize>> {
    let n = entries.len();
    let mut parent: Vec<usize> = (0..n).collect();

    fn find(parent: &mut [usize], x: usize) -> usize {
        if parent[x] != x {
            parent[x] = find(parent, parent[x]);
        }
        parent[x]
    }

    for i in 0..n {
        for j in (i + 1)..n {
            if vector_score(Some(&entries[i].embedding), Some(&entries[j].embedding)) >= threshold {
                let (ri, rj) = (find(&mut parent, i), find(&mut parent, j));
                if ri != rj {
                    parent[ri] = rj;
                }
            }
        }
    }

    let mut groups: HashMap<usize, Vec<usize>> = HashMap::new();
    for i in 0..n {
        let root = find(&mut parent, i);
        groups.entry(root).or_default().push(i);
    }

    groups.into_values().filter(|g| g.len() >= min_size).collect()
}

enum ClusterOutcome {
    Merged,
    SentToReview,
    Aborted,
}

fn merge_system_prompt() -> String {
    "You merge a cluster of near-duplicate knowledge entries into one \
     canonical entry. Call merge_entries with `content`, `subject`, `type` \
     (fact|decision|preference|todo|relationship|event|lesson), \
     `importance` (1-10), `expiry` (core|permanent|temporary), and `tags` \
     (array of strings). The merged content should preserve every distinct \
     detail from the sources, not just the most recent one."
        .to_string()
}

fn merge_user_prompt(members: &[&ActiveEntry]) -> String {
    let mut prompt = String::from("Cluster of entries to merge:\n\n");
    for (i, m) in members.iter().enumerate() {
        prompt.push_str(&format!("{}. [{}] {}: {}\n", i + 1, m.kind.as_str(), m.subject, m.content));
    }
    prompt
}

async fn merge_cluster(
    pool: &AgenrPool,
    embedder: &dyn EmbeddingClient,
    llm: &dyn LlmClient,
    merge_model: &str,
    members: &[&ActiveEntry],
) -> Result<ClusterOutcome> {
    let message = llm
        .stream_simple(merge_model, &merge_system_prompt(), &merge_user_prompt(members))
        .await?;

    let Some(call) = message.tool_call("merge_entries") else {
        return Ok(ClusterOutcome::Aborted);
    };

    let content = call.arguments.get("content").and_then(|v| v.as_str()).unwrap_or("").trim().to_string();
    let subject = call.arguments.get("subject").and_then(|v| v.as_str()).unwrap_or("").trim().to_string();
    if content.is_empty() || subject.is_empty() {
        touch_cluster(pool, members).await?;
        return Ok(ClusterOutcome::Aborted);
    }

    let kind = call
        .arguments
        .get("type")
        .and_then(|v| v.as_str())
        .and_then(EntryKind::parse)
        .unwrap_or_else(|| {
            tracing::warn!("consolidator merge returned out-of-enum type, defaulting to fact");
            EntryKind::Fact
        });
    let expiry = call
        .arguments
        .get("expiry")
        .and_then(|v| v.as_str())
        .and_then(Expiry::parse)
        .unwrap_or_else(|| {
            tracing::warn!("consolidator merge returned out-of-enum expiry, defaulting to permanent");
            Expiry::Permanent
        });
    let importance = call
        .arguments
        .get("importance")
        .and_then(|v| v.as_i64())
        .unwrap_or_else(|| {
            tracing::warn!("consolidator merge returned non-numeric importance, defaulting to 5");
            5
        });
    let tags: Vec<String> = call
        .arguments
        .get("tags")
        .and_then(|v| v.as_array())
        .map(|a| a.iter().filter_map(|v| v.as_str()).map(str::to_string).collect())
        .unwrap_or_default();

    let merged_embedding = embedder.embed(std::slice::from_ref(&content)).await?.into_iter().next().unwrap_or_default();

    let centroid = centroid_of(members.iter().map(|m| m.embedding.as_slice()));
    let centroid_sim = vector_score(Some(&merged_embedding), Some(&centroid));
    let min_source_sim = members
        .iter()
        .map(|m| vector_score(Some(&merged_embedding), Some(&m.embedding)))
        .fold(f32::MAX, f32::min);

    if min_source_sim < 0.65 || centroid_sim < 0.75 {
        let ids: Vec<EntryId> = members.iter().map(|m| m.id).collect();
        let reason = format!(
            "verification failed: min source cosine {min_source_sim:.3} (need >=0.65), centroid cosine {centroid_sim:.3} (need >=0.75)"
        );
        crate::review_queue::append(pool, "merge", &reason, &ids).await?;
        touch_cluster(pool, members).await?;
        return Ok(ClusterOutcome::SentToReview);
    }

    let raw = RawEntry {
        kind: kind.as_str().to_string(),
        subject,
        canonical_key: None,
        content,
        importance: Some(importance),
        expiry: Some(expiry.as_str().to_string()),
        scope: None,
        platform: None,
        project: None,
        tags,
        source: EntrySource::Context { text: String::new() },
        created_at: None,
        subject_key: None,
        predicate: None,
        object: None,
        claim_confidence: None,
    };
    let Ok(merged_entry) = KnowledgeEntry::new(raw) else {
        touch_cluster(pool, members).await?;
        return Ok(ClusterOutcome::Aborted);
    };
    let merged_entry = merged_entry.with_embedding(merged_embedding);

    let source_ids: Vec<EntryId> = members.iter().map(|m| m.id).collect();
    insert_merged(pool, merged_entry, &source_ids).await?;

    Ok(ClusterOutcome::Merged)
}

fn centroid_of<'a>(embeddings: impl Iterator<Item = &'a [f32]>) -> Vec<f32> {
    let mut sum: Vec<f32> = Vec::new();
    let mut n = 0usize;
    for e in embeddings {
        if sum.is_empty() {
            sum = vec![0.0; e.len()];
        }
        for (a, b) in sum.iter_mut().zip(e) {
            *a += b;
        }
        n += 1;
    }
    if n > 0 {
        for v in &mut sum {
            *v /= n as f32;
        }
    }
    sum
}

/// Stamp `last_consolidated_at` with no other change — the idempotency
/// marker a cluster that was attempted (merged, reviewed, or aborted)
/// leaves behind so the next run's candidate filter skips it for
/// `idempotencyDays` (spec.md §4.H). Kept separate from `updated_at` (the
/// content-modification timestamp every write bumps) so a freshly-inserted,
/// never-yet-considered entry is still visible to phase 2 immediately.
async fn touch_cluster(pool: &AgenrPool, members: &[&ActiveEntry]) -> Result<()> {
    let ids: Vec<String> = members.iter().map(|m| m.id.to_string()).collect();
    let now = Utc::now().to_rfc3339();
    pool.interact(move |conn| {
        for id in &ids {
            conn.execute("UPDATE entries SET last_consolidated_at = ?1 WHERE id = ?2", params![now, id])?;
        }
        Ok(())
    })
    .await
}

async fn insert_merged(pool: &AgenrPool, merged: KnowledgeEntry, sources: &[EntryId]) -> Result<()> {
    let sources = sources.to_vec();
    let merged_id = merged.id;
    let embedding = merged.embedding.clone();

    pool.interact(move |conn| {
        let tags_joined = merged.tags.iter().cloned().collect::<Vec<_>>().join(" ");
        conn.execute(
            "INSERT INTO entries \
                (id, kind, subject, canonical_key, content, tags_joined, importance, expiry, scope, \
                 platform, project, source_kind, source_path, source_text, created_at, updated_at, \
                 last_recalled_at, recall_count, confirmations, contradictions, retired, retired_at, \
                 retired_reason, suppressed_contexts, superseded_by, content_hash, normalized_content_hash, \
                 minhash, subject_key, predicate, object, claim_confidence, quality_score) \
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15,?16,?17,?18,?19,?20,?21,?22,?23,?24,?25,?26,?27,?28,?29,?30,?31,?32,?33)",
            params![
                merged.id.to_string(),
                merged.kind.as_str(),
                merged.subject,
                merged.canonical_key,
                merged.content,
                tags_joined,
                merged.importance,
                merged.expiry.as_str(),
                merged.scope.as_str(),
                merged.platform.map(|p| p.as_str().to_string()),
                merged.project,
                "context",
                None::<String>,
                "",
                merged.created_at.to_rfc3339(),
                merged.updated_at.to_rfc3339(),
                None::<String>,
                0,
                0,
                0,
                0,
                None::<String>,
                None::<String>,
                "[]",
                None::<String>,
                merged.content_hash,
                merged.normalized_content_hash,
                minhash_to_blob(&merged.minhash),
                merged.subject_key,
                merged.predicate,
                merged.object,
                merged.claim_confidence,
                merged.quality_score,
            ],
        )?;

        let rowid = conn.last_insert_rowid();
        for tag in &merged.tags {
            conn.execute(
                "INSERT OR IGNORE INTO tags (entry_id, tag) VALUES (?1, ?2)",
                params![merged.id.to_string(), tag],
            )?;
        }
        if let Some(embedding) = &embedding {
            conn.execute(
                "INSERT INTO entries_vec (entry_rowid, embedding) VALUES (?1, ?2)",
                params![rowid, embedding_to_blob(embedding)],
            )?;
        }

        let now = Utc::now().to_rfc3339();
        for source in &sources {
            conn.execute(
                "UPDATE entries SET superseded_by = ?1 WHERE id = ?2",
                params![merged_id.to_string(), source.to_string()],
            )?;
            conn.execute(
                "INSERT INTO entry_sources (merged_entry_id, source_entry_id) VALUES (?1, ?2)",
                params![merged_id.to_string(), source.to_string()],
            )?;
            conn.execute(
                "INSERT INTO relations (source_id, target_id, relation_type, created_at) VALUES (?1, ?2, ?3, ?4)",
                params![merged_id.to_string(), source.to_string(), RelationType::Supersedes.as_str(), now],
            )?;
        }

        Ok(())
    })
    .await
}

/// Entries written in bulk mode never got a per-entry embedding (storage's
/// bulk path defers embedding to this pass). Find any active entry missing
/// an `entries_vec` row and backfill it.
async fn backfill_missing_embeddings(pool: &AgenrPool, embedder: &dyn EmbeddingClient) -> Result<u32> {
    let missing = pool
        .interact(|conn| {
            let mut stmt = conn.prepare(
                "SELECT rowid, content FROM entries \
                 WHERE retired = 0 AND rowid NOT IN (SELECT entry_rowid FROM entries_vec)",
            )?;
            let rows = stmt.query_map([], |row| {
                let rowid: i64 = row.get(0)?;
                let content: String = row.get(1)?;
                Ok((rowid, content))
            })?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row?);
            }
            Ok(out)
        })
        .await?;

    if missing.is_empty() {
        return Ok(0);
    }

    let mut backfilled = 0u32;
    for chunk in missing.chunks(EMBED_BATCH_SIZE) {
        let texts: Vec<String> = chunk.iter().map(|(_, c)| c.clone()).collect();
        let embeddings = embedder.embed(&texts).await?;
        let rowids: Vec<i64> = chunk.iter().map(|(r, _)| *r).collect();

        pool.interact(move |conn| {
            for (rowid, embedding) in rowids.iter().zip(embeddings.iter()) {
                conn.execute(
                    "INSERT INTO entries_vec (entry_rowid, embedding) VALUES (?1, ?2)",
                    params![rowid, embedding_to_blob(embedding)],
                )?;
            }
            Ok(())
        })
        .await?;
        backfilled += chunk.len() as u32;
    }

    Ok(backfilled)
}

async fn checkpoint(pool: &AgenrPool) -> Result<()> {
    pool.interact(|conn| {
        conn.execute_batch("PRAGMA wal_checkpoint(PASSIVE);")?;
        Ok(())
    })
    .await
}

fn embedding_to_blob(embedding: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(embedding.len() * 4);
    for v in embedding {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

fn blob_to_embedding(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4).map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]])).collect()
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
    use async_trait::async_trait;
    use std::sync::Arc;

    struct FakeEmbedder;

    #[async_trait]
    impl EmbeddingClient for FakeEmbedder {
        async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            Ok(texts.iter().map(|_| vec![0.2; crate::embedding::EMBEDDING_DIMENSIONS]).collect())
        }
    }

    fn raw(subject: &str, content: &str) -> RawEntry {
        RawEntry {
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
        }
    }

    async fn store(pool: &AgenrPool, subject: &str, content: &str, file: &str) {
        crate::storage::store_entries(
            pool,
            &FakeEmbedder,
            None,
            "unused",
            file,
            file,
            vec![KnowledgeEntry::new(raw(subject, content)).unwrap()],
            &crate::storage::StoreOptions::default(),
        )
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn retire_expired_only_retires_old_unrecalled_temporary_entries() {
        let pool = AgenrPool::open_in_memory().await.unwrap();
        store(&pool, "old stale fact", "this will go stale", "f1.jsonl").await;

        // Push created_at far into the past directly for the test.
        pool.interact(|conn| {
            conn.execute("UPDATE entries SET created_at = '2000-01-01T00:00:00Z'", [])?;
            Ok(())
        })
        .await
        .unwrap();

        let forgetting = ForgettingConfig {
            protect: vec![],
            score_threshold: 0.2,
            max_age_days: 1,
            enabled: true,
        };
        let retired = retire_expired(&pool, &forgetting).await.unwrap();
        assert_eq!(retired, 1);
    }

    #[tokio::test]
    async fn retire_expired_skips_protected_tags() {
        let pool = AgenrPool::open_in_memory().await.unwrap();
        let mut entry = KnowledgeEntry::new(raw("protected fact", "keep me")).unwrap();
        entry.tags.insert("pinned".to_string());
        crate::storage::store_entries(
            &pool,
            &FakeEmbedder,
            None,
            "unused",
            "f.jsonl",
            "h",
            vec![entry],
            &crate::storage::StoreOptions::default(),
        )
        .await
        .unwrap();
        pool.interact(|conn| {
            conn.execute("UPDATE entries SET created_at = '2000-01-01T00:00:00Z'", [])?;
            Ok(())
        })
        .await
        .unwrap();

        let forgetting = ForgettingConfig {
            protect: vec!["pinned".to_string()],
            score_threshold: 0.2,
            max_age_days: 1,
            enabled: true,
        };
        let retired = retire_expired(&pool, &forgetting).await.unwrap();
        assert_eq!(retired, 0);
    }

    #[tokio::test]
    async fn merge_near_exact_duplicates_keeps_highest_importance() {
        let pool = AgenrPool::open_in_memory().await.unwrap();
        store(&pool, "editor", "the deployment pipeline now runs integration tests before release", "f1.jsonl").await;
        store(&pool, "editor", "the deployment pipeline now runs integration tests before shipping", "f2.jsonl").await;

        let merged = merge_near_exact_duplicates(&pool, &ConsolidationConfig::default()).await.unwrap();
        assert_eq!(merged, 1);
    }

    #[tokio::test]
    async fn drop_orphan_relations_removes_dangling_rows() {
        let pool = AgenrPool::open_in_memory().await.unwrap();
        pool.interact(|conn| {
            conn.execute(
                "INSERT INTO relations (source_id, target_id, relation_type, created_at) VALUES ('missing-a', 'missing-b', 'related', '2020-01-01T00:00:00Z')",
                [],
            )?;
            Ok(())
        })
        .await
        .unwrap();

        let removed = drop_orphan_relations(&pool).await.unwrap();
        assert_eq!(removed, 1);
    }

    #[tokio::test]
    async fn backfill_missing_embeddings_inserts_vec_rows_for_bulk_entries() {
        let pool = AgenrPool::open_in_memory().await.unwrap();
        let entries = vec![KnowledgeEntry::new(raw("bulk fact", "came in through bulk mode")).unwrap()];
        crate::storage::bulk::store_entries_bulk(&pool, "bulk.jsonl", "bulk-hash", entries).await.unwrap();

        let backfilled = backfill_missing_embeddings(&pool, &FakeEmbedder).await.unwrap();
        assert_eq!(backfilled, 1);

        let again = backfill_missing_embeddings(&pool, &FakeEmbedder).await.unwrap();
        assert_eq!(again, 0);
    }

    #[tokio::test]
    async fn centroid_of_averages_embeddings() {
        let a = vec![1.0, 0.0];
        let b = vec![0.0, 1.0];
        let c = centroid_of([a.as_slice(), b.as_slice()].into_iter());
        assert!((c[0] - 0.5).abs() < 1e-6);
        assert!((c[1] - 0.5).abs() < 1e-6);
    }

    #[test]
    fn cluster_by_similarity_groups_close_vectors_and_respects_min_size() {
        let entries = vec![
            ActiveEntry { rowid: 1, id: EntryId::new(), subject: "a".into(), content: "a".into(), kind: EntryKind::Fact, embedding: vec![1.0, 0.0, 0.0] },
            ActiveEntry { rowid: 2, id: EntryId::new(), subject: "b".into(), content: "b".into(), kind: EntryKind::Fact, embedding: vec![0.99, 0.01, 0.0] },
            ActiveEntry { rowid: 3, id: EntryId::new(), subject: "c".into(), content: "c".into(), kind: EntryKind::Fact, embedding: vec![0.0, 1.0, 0.0] },
        ];
        let clusters = cluster_by_similarity(&entries, 0.9, 2);
        assert_eq!(clusters.len(), 1);
        assert_eq!(clusters[0].len(), 2);
    }

    #[tokio::test]
    async fn run_phase2_merges_a_tight_cluster_via_fake_llm() {
        use crate::llm::{AssistantMessage, ToolCall};

        struct FakeMergeLlm;
        #[async_trait]
        impl LlmClient for FakeMergeLlm {
            async fn stream_simple(&self, _model: &str, _system: &str, _user: &str) -> Result<AssistantMessage> {
                Ok(AssistantMessage {
                    text: String::new(),
                    tool_calls: vec![ToolCall {
                        name: "merge_entries".to_string(),
                        arguments: serde_json::json!({
                            "content": "merged content about the same fact",
                            "subject": "merged subject",
                            "type": "fact",
                            "importance": 7,
                            "expiry": "permanent",
                            "tags": ["merged"],
                        }),
                    }],
                })
            }
        }

        let pool = AgenrPool::open_in_memory().await.unwrap();
        for i in 0..3 {
            store(&pool, &format!("subject {i}"), &format!("content {i}"), &format!("f{i}.jsonl")).await;
        }

        let consolidation = ConsolidationConfig {
            cluster_similarity_threshold: 0.5,
            min_cluster_size: 3,
            max_cluster_size: 12,
            idempotency_days: 7,
            near_duplicate_threshold: 0.95,
        };

        let outcome = run_phase2(&pool, &FakeEmbedder, &FakeMergeLlm, "model", &consolidation).await.unwrap();
        assert_eq!(outcome.clusters_considered, 1);
        assert_eq!(outcome.clusters_merged, 1);

        let _ = Arc::new(());
    }
}
