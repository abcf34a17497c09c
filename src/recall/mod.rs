// src/recall/mod.rs
// Recall engine (spec.md §4.G): candidate-then-score-then-truncate, the
// same shape as the teacher's `db/memory/recall.rs` (a scope-filtered SQL
// candidate set, enriched with a semantic pass, ranked by a composed
// scorer). Session-start and browse are specializations of the same
// pipeline rather than separate code paths.

pub mod scoring;

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Duration, Utc};
use rusqlite::{Row, ToSql};
use serde::Serialize;

use crate::embedding::EmbeddingClient;
use crate::error::Result;
use crate::storage::pool::AgenrPool;
use crate::types::{
    CoRecallEdge, EntryId, EntryKind, EntrySource, Expiry, KnowledgeEntry, Platform, Scope,
};
use scoring::{SubScores, composite, estimate_tokens, weights_for};

/// The literal `query` value reported for browse-mode recalls (spec.md §6).
pub const BROWSE_MARKER: &str = "[browse]";

const DEFAULT_LIMIT: usize = 20;
/// Upper bound on how many SQL-filtered rows are pulled into scoring before
/// sort/truncate; keeps a pathological "no filters at all" query from
/// loading an entire large database into memory.
const CANDIDATE_FETCH_CAP: i64 = 2000;
/// How many neighbors of the top-K results co-recall expansion pulls in.
const CO_RECALL_EXPANSION_PER_ENTRY: usize = 3;
/// Only expand with neighbors whose edge weight clears this floor.
const CO_RECALL_MIN_WEIGHT: f64 = 0.2;
/// How many of the truncated result set's top entries get neighbor expansion.
const CO_RECALL_TOP_K: usize = 5;

#[derive(Debug, Clone, Default)]
pub struct RecallQuery {
    pub text: Option<String>,
    pub limit: usize,
    pub types: Vec<EntryKind>,
    pub tags: Vec<String>,
    pub min_importance: Option<u8>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub around: Option<DateTime<Utc>>,
    pub radius: Option<Duration>,
    pub expiry: Option<Expiry>,
    pub scope: Option<Scope>,
    pub context: Option<String>,
    pub budget: Option<u32>,
    pub platform: Option<Platform>,
    pub project: Option<String>,
    pub exclude_project: Option<String>,
    pub project_strict: bool,
    pub browse: bool,
    pub no_boost: bool,
    pub no_update: bool,
}

impl RecallQuery {
    fn effective_limit(&self) -> usize {
        if self.limit == 0 { DEFAULT_LIMIT } else { self.limit }
    }

    fn text_is_blank(&self) -> bool {
        self.text.as_deref().map(|s| s.trim().is_empty()).unwrap_or(true)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RecallResult {
    pub entry: KnowledgeEntry,
    pub score: f32,
    pub scores: SubScores,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
}

/// The stdout JSON envelope (spec.md §6).
#[derive(Debug, Clone, Serialize)]
pub struct RecallEnvelope {
    pub query: String,
    pub results: Vec<RecallResult>,
    pub total: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub budget_used: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub budget_limit: Option<u32>,
}

struct Candidate {
    rowid: i64,
    entry: KnowledgeEntry,
}

/// Run a recall query end to end (spec.md §4.G steps 1-6). `query.browse`
/// and `query.context == Some("session-start")` are handled by the
/// dedicated entry points below, which both delegate their scoring to this
/// function; callers that already know which mode they want should prefer
/// those.
pub async fn recall(pool: &AgenrPool, embedder: &dyn EmbeddingClient, query: &RecallQuery) -> Result<RecallEnvelope> {
    if query.browse || query.text.as_deref() == Some(BROWSE_MARKER) {
        return recall_browse(pool, query).await;
    }

    let query_embedding = if query.text_is_blank() {
        None
    } else {
        let text = query.text.clone().unwrap_or_default();
        embedder.embed(&[text]).await?.into_iter().next()
    };

    let candidates = fetch_candidates(pool, query).await?;
    let results = score_and_rank(pool, query, &candidates, query_embedding.as_deref()).await?;
    let (mut results, mut budget_used) = truncate_by_budget(results, query.effective_limit(), query.budget);

    let mut remaining_budget = query.budget.map(|b| b.saturating_sub(budget_used.unwrap_or(0)));
    if remaining_budget != Some(0) {
        let present: HashSet<EntryId> = results.iter().map(|r| r.entry.id).collect();
        let top_n = results.len().min(CO_RECALL_TOP_K);
        let neighbor_ids = expand_with_co_recall_neighbors(pool, &results[..top_n], &present).await?;
        if !neighbor_ids.is_empty() {
            let neighbors = fetch_entries_by_ids(pool, &neighbor_ids).await?;
            for entry in neighbors {
                let tokens = estimate_tokens(&entry);
                if let Some(budget) = remaining_budget
                    && tokens > budget
                {
                    break;
                }
                if let Some(budget) = remaining_budget.as_mut() {
                    *budget -= tokens;
                }
                if let Some(used) = budget_used.as_mut() {
                    *used += tokens;
                }
                results.push(RecallResult {
                    entry,
                    score: 0.0,
                    scores: scoring::SubScores {
                        vector: 0.0,
                        fts: 0.0,
                        recency: 0.0,
                        importance: 0.0,
                        recall: 0.0,
                        freshness: 0.0,
                        todo_penalty: 0.0,
                        quality: 0.0,
                        spacing: 0.0,
                    },
                    category: Some("co-recall".to_string()),
                });
            }
        }
    }

    if !query.no_update {
        apply_recall_side_effects(pool, &results).await?;
    }

    Ok(RecallEnvelope {
        query: query.text.clone().unwrap_or_default(),
        total: results.len(),
        budget_used,
        budget_limit: query.budget,
        results,
    })
}

/// Browse mode: SQL + recency ordering only, no embedding call, no counter
/// mutation (spec.md §4.G "Browse mode").
async fn recall_browse(pool: &AgenrPool, query: &RecallQuery) -> Result<RecallEnvelope> {
    let candidates = fetch_candidates(pool, query).await?;
    let mut results = score_and_rank(pool, query, &candidates, None).await?;
    results.sort_by(|a, b| b.entry.updated_at.cmp(&a.entry.updated_at));
    let (results, budget_used) = truncate_by_budget(results, query.effective_limit(), query.budget);

    Ok(RecallEnvelope {
        query: BROWSE_MARKER.to_string(),
        total: results.len(),
        budget_used,
        budget_limit: query.budget,
        results,
    })
}

/// Session-start mode (spec.md §4.G "Session-start mode"): a core-expiry
/// pass plus a partition of everything else into active/preferences/recent
/// with a budget split that adapts to how many todos are present.
pub async fn recall_session_start(
    pool: &AgenrPool,
    embedder: &dyn EmbeddingClient,
    base_query: &RecallQuery,
) -> Result<RecallEnvelope> {
    let total_budget = base_query.budget.unwrap_or(4000);

    let mut core_query = base_query.clone();
    core_query.expiry = Some(Expiry::Core);
    core_query.budget = None;
    core_query.limit = 0;
    let core_candidates = drop_suppressed_for_session_start(fetch_candidates(pool, &core_query).await?);
    let mut core_results = score_and_rank(pool, &core_query, &core_candidates, None).await?;
    core_results.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
    for r in &mut core_results {
        r.category = Some("core".to_string());
    }

    let mut rest_query = base_query.clone();
    rest_query.expiry = None;
    rest_query.budget = None;
    rest_query.limit = 0;
    let rest_candidates = drop_suppressed_for_session_start(fetch_candidates(pool, &rest_query).await?);

    let query_embedding = if rest_query.text_is_blank() {
        None
    } else {
        let text = rest_query.text.clone().unwrap_or_default();
        embedder.embed(&[text]).await?.into_iter().next()
    };

    let mut active = Vec::new();
    let mut preferences = Vec::new();
    let mut recent = Vec::new();

    let mut rest_results = score_and_rank(pool, &rest_query, &rest_candidates, query_embedding.as_deref()).await?;
    rest_results.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));

    for result in rest_results {
        match result.entry.kind {
            EntryKind::Todo => active.push(result),
            EntryKind::Preference | EntryKind::Decision => preferences.push(result),
            _ => recent.push(result),
        }
    }

    // Budget split: no todos -> 0% to active; only todos -> cap active at
    // 30% so preferences/recent are never starved entirely.
    let core_tokens: u32 = core_results.iter().map(|r| estimate_tokens(&r.entry)).sum();
    let remaining_after_core = total_budget.saturating_sub(core_tokens);

    let active_fraction = if active.is_empty() {
        0.0
    } else if preferences.is_empty() && recent.is_empty() {
        0.30
    } else {
        0.30
    };
    let active_budget = (remaining_after_core as f32 * active_fraction) as u32;
    let remaining_after_active = remaining_after_core.saturating_sub(active_budget);
    let preferences_budget = remaining_after_active / 2;
    let recent_budget = remaining_after_active - preferences_budget;

    for r in &mut active {
        r.category = Some("active".to_string());
    }
    for r in &mut preferences {
        r.category = Some("preferences".to_string());
    }
    for r in &mut recent {
        r.category = Some("recent".to_string());
    }

    let (active, active_used) = truncate_by_budget(active, usize::MAX, Some(active_budget));
    let (preferences, pref_used) = truncate_by_budget(preferences, usize::MAX, Some(preferences_budget));
    let (recent, recent_used) = truncate_by_budget(recent, usize::MAX, Some(recent_budget));

    let mut results = core_results;
    results.extend(active);
    results.extend(preferences);
    results.extend(recent);

    let budget_used = core_tokens + active_used.unwrap_or(0) + pref_used.unwrap_or(0) + recent_used.unwrap_or(0);

    if !base_query.no_update {
        apply_recall_side_effects(pool, &results).await?;
    }

    Ok(RecallEnvelope {
        query: "session-start".to_string(),
        total: results.len(),
        budget_used: Some(budget_used),
        budget_limit: Some(total_budget),
        results,
    })
}

/// `suppressed_contexts` is only ever consulted here: an entry retired with
/// `"session-start"` in its suppressed set is dropped from session-start
/// recall but still answers ordinary/browse queries (resolves spec.md §9's
/// open question on `suppressedContexts` semantics — documented in
/// DESIGN.md).
fn drop_suppressed_for_session_start(candidates: Vec<Candidate>) -> Vec<Candidate> {
    candidates.into_iter().filter(|c| !c.entry.suppressed_contexts.contains("session-start")).collect()
}

async fn fetch_candidates(pool: &AgenrPool, query: &RecallQuery) -> Result<Vec<Candidate>> {
    let query = query.clone();
    pool.interact(move |conn| {
        let mut clauses = vec!["retired = 0".to_string(), "superseded_by IS NULL".to_string()];
        let mut params: Vec<Box<dyn ToSql>> = Vec::new();

        if !query.types.is_empty() {
            let placeholders = query.types.iter().map(|_| "?").collect::<Vec<_>>().join(",");
            clauses.push(format!("kind IN ({placeholders})"));
            for t in &query.types {
                params.push(Box::new(t.as_str().to_string()));
            }
        }
        if let Some(min_importance) = query.min_importance {
            clauses.push("importance >= ?".to_string());
            params.push(Box::new(min_importance as i64));
        }
        if let Some(expiry) = query.expiry {
            clauses.push("expiry = ?".to_string());
            params.push(Box::new(expiry.as_str().to_string()));
        }
        if let Some(scope) = query.scope {
            clauses.push("scope = ?".to_string());
            params.push(Box::new(scope.as_str().to_string()));
        }
        if let Some(platform) = query.platform {
            clauses.push("platform = ?".to_string());
            params.push(Box::new(platform.as_str().to_string()));
        }
        if query.project_strict {
            match &query.project {
                Some(p) => {
                    clauses.push("project = ?".to_string());
                    params.push(Box::new(p.clone()));
                }
                None => clauses.push("project IS NULL".to_string()),
            }
        } else if let Some(p) = &query.project {
            clauses.push("(project = ? OR project IS NULL)".to_string());
            params.push(Box::new(p.clone()));
        }
        if let Some(exclude) = &query.exclude_project {
            clauses.push("(project IS NULL OR project != ?)".to_string());
            params.push(Box::new(exclude.clone()));
        }
        if let Some(since) = query.since {
            clauses.push("created_at >= ?".to_string());
            params.push(Box::new(since.to_rfc3339()));
        }
        if let Some(until) = query.until {
            clauses.push("created_at <= ?".to_string());
            params.push(Box::new(until.to_rfc3339()));
        }
        if let (Some(around), Some(radius)) = (query.around, query.radius) {
            clauses.push("created_at >= ? AND created_at <= ?".to_string());
            params.push(Box::new((around - radius).to_rfc3339()));
            params.push(Box::new((around + radius).to_rfc3339()));
        }
        for tag in &query.tags {
            clauses.push("(' ' || tags_joined || ' ') LIKE ?".to_string());
            params.push(Box::new(format!("% {} %", crate::types::normalize_tag(tag))));
        }

        let sql = format!(
            "SELECT rowid, id, kind, subject, canonical_key, content, importance, expiry, scope, \
                    platform, project, source_kind, source_path, source_text, created_at, updated_at, \
                    last_recalled_at, recall_count, confirmations, contradictions, retired, retired_at, \
                    retired_reason, suppressed_contexts, superseded_by, content_hash, \
                    normalized_content_hash, minhash, subject_key, predicate, object, claim_confidence, \
                    quality_score, tags_joined \
             FROM entries WHERE {} ORDER BY updated_at DESC LIMIT {}",
            clauses.join(" AND "),
            CANDIDATE_FETCH_CAP
        );

        let mut stmt = conn.prepare(&sql)?;
        let param_refs: Vec<&dyn ToSql> = params.iter().map(|p| p.as_ref()).collect();
        let rows = stmt.query_map(param_refs.as_slice(), |row| {
            let rowid: i64 = row.get(0)?;
            let entry = row_to_entry(row, 1)?;
            Ok(Candidate { rowid, entry })
        })?;

        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    })
    .await
}

/// Fetch full entries for a co-recall neighbor expansion, in the same column
/// order `row_to_entry` expects.
async fn fetch_entries_by_ids(pool: &AgenrPool, ids: &[EntryId]) -> Result<Vec<KnowledgeEntry>> {
    if ids.is_empty() {
        return Ok(Vec::new());
    }
    let ids: Vec<String> = ids.iter().map(|id| id.to_string()).collect();
    pool.interact(move |conn| {
        let placeholders = ids.iter().map(|_| "?").collect::<Vec<_>>().join(",");
        let sql = format!(
            "SELECT id, kind, subject, canonical_key, content, importance, expiry, scope, \
                    platform, project, source_kind, source_path, source_text, created_at, updated_at, \
                    last_recalled_at, recall_count, confirmations, contradictions, retired, retired_at, \
                    retired_reason, suppressed_contexts, superseded_by, content_hash, \
                    normalized_content_hash, minhash, subject_key, predicate, object, claim_confidence, \
                    quality_score, tags_joined \
             FROM entries WHERE retired = 0 AND superseded_by IS NULL AND id IN ({placeholders})"
        );
        let mut stmt = conn.prepare(&sql)?;
        let param_refs: Vec<&dyn ToSql> = ids.iter().map(|id| id as &dyn ToSql).collect();
        let rows = stmt.query_map(param_refs.as_slice(), |row| row_to_entry(row, 0))?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    })
    .await
}

fn row_to_entry(row: &Row, offset: usize) -> rusqlite::Result<KnowledgeEntry> {
    let id: String = row.get(offset)?;
    let kind: String = row.get(offset + 1)?;
    let subject: String = row.get(offset + 2)?;
    let canonical_key: Option<String> = row.get(offset + 3)?;
    let content: String = row.get(offset + 4)?;
    let importance: i64 = row.get(offset + 5)?;
    let expiry: String = row.get(offset + 6)?;
    let scope: String = row.get(offset + 7)?;
    let platform: Option<String> = row.get(offset + 8)?;
    let project: Option<String> = row.get(offset + 9)?;
    let source_kind: String = row.get(offset + 10)?;
    let source_path: Option<String> = row.get(offset + 11)?;
    let source_text: Option<String> = row.get(offset + 12)?;
    let created_at: String = row.get(offset + 13)?;
    let updated_at: String = row.get(offset + 14)?;
    let last_recalled_at: Option<String> = row.get(offset + 15)?;
    let recall_count: i64 = row.get(offset + 16)?;
    let confirmations: i64 = row.get(offset + 17)?;
    let contradictions: i64 = row.get(offset + 18)?;
    let retired: i64 = row.get(offset + 19)?;
    let retired_at: Option<String> = row.get(offset + 20)?;
    let retired_reason: Option<String> = row.get(offset + 21)?;
    let suppressed_contexts: String = row.get(offset + 22)?;
    let superseded_by: Option<String> = row.get(offset + 23)?;
    let content_hash: String = row.get(offset + 24)?;
    let normalized_content_hash: String = row.get(offset + 25)?;
    let minhash_blob: Vec<u8> = row.get(offset + 26)?;
    let subject_key: Option<String> = row.get(offset + 27)?;
    let predicate: Option<String> = row.get(offset + 28)?;
    let object: Option<String> = row.get(offset + 29)?;
    let claim_confidence: Option<f32> = row.get(offset + 30)?;
    let quality_score: f32 = row.get(offset + 31)?;
    let tags_joined: String = row.get(offset + 32)?;

    let parse_ts = |s: &str| -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).map(|dt| dt.with_timezone(&Utc)).unwrap_or_else(|_| Utc::now())
    };

    let id = id
        .parse()
        .map_err(|_| rusqlite::Error::InvalidColumnType(offset, "id".into(), rusqlite::types::Type::Text))?;

    Ok(KnowledgeEntry {
        id: EntryId(id),
        kind: EntryKind::parse(&kind).unwrap_or(EntryKind::Fact),
        subject,
        canonical_key,
        content,
        importance: importance.clamp(1, 10) as u8,
        expiry: Expiry::parse(&expiry).unwrap_or_default(),
        scope: Scope::parse(&scope).unwrap_or_default(),
        platform: platform.as_deref().and_then(Platform::parse),
        project,
        tags: tags_joined.split_whitespace().map(str::to_string).collect(),
        source: match source_kind.as_str() {
            "file" => EntrySource::File { path: source_path.unwrap_or_default() },
            _ => EntrySource::Context { text: source_text.unwrap_or_default() },
        },
        created_at: parse_ts(&created_at),
        updated_at: parse_ts(&updated_at),
        last_recalled_at: last_recalled_at.as_deref().map(parse_ts),
        recall_count: recall_count.max(0) as u32,
        confirmations: confirmations.max(0) as u32,
        contradictions: contradictions.max(0) as u32,
        retired: retired != 0,
        retired_at: retired_at.as_deref().map(parse_ts),
        retired_reason,
        suppressed_contexts: serde_json::from_str(&suppressed_contexts).unwrap_or_default(),
        superseded_by: superseded_by.and_then(|s| s.parse().ok()).map(EntryId),
        content_hash,
        normalized_content_hash,
        minhash: blob_to_minhash(&minhash_blob),
        embedding: None,
        subject_key,
        predicate,
        object,
        claim_confidence,
        quality_score,
    })
}

fn blob_to_minhash(blob: &[u8]) -> [u32; crate::dedup::minhash::MINHASH_SIZE] {
    let mut sig = [0u32; crate::dedup::minhash::MINHASH_SIZE];
    for (i, chunk) in blob.chunks_exact(4).take(sig.len()).enumerate() {
        sig[i] = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
    }
    sig
}

fn blob_to_embedding(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4).map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]])).collect()
}

async fn embeddings_for_rowids(pool: &AgenrPool, rowids: &[i64]) -> Result<HashMap<i64, Vec<f32>>> {
    if rowids.is_empty() {
        return Ok(HashMap::new());
    }
    let rowids = rowids.to_vec();
    pool.interact(move |conn| {
        let placeholders = rowids.iter().map(|_| "?").collect::<Vec<_>>().join(",");
        let sql = format!("SELECT entry_rowid, embedding FROM entries_vec WHERE entry_rowid IN ({placeholders})");
        let mut stmt = conn.prepare(&sql)?;
        let params: Vec<&dyn ToSql> = rowids.iter().map(|r| r as &dyn ToSql).collect();
        let rows = stmt.query_map(params.as_slice(), |row| {
            let rowid: i64 = row.get(0)?;
            let blob: Vec<u8> = row.get(1)?;
            Ok((rowid, blob_to_embedding(&blob)))
        })?;
        let mut out = HashMap::new();
        for row in rows {
            let (rowid, embedding) = row?;
            out.insert(rowid, embedding);
        }
        Ok(out)
    })
    .await
}

async fn fts_scores_for(pool: &AgenrPool, text: &str) -> Result<HashMap<i64, f64>> {
    let text = text.to_string();
    pool.interact(move |conn| {
        let mut stmt = conn.prepare(
            "SELECT rowid, bm25(entries_fts) FROM entries_fts WHERE entries_fts MATCH ? LIMIT ?",
        )?;
        let rows = stmt.query_map(rusqlite::params![fts_match_query(&text), CANDIDATE_FETCH_CAP], |row| {
            let rowid: i64 = row.get(0)?;
            let score: f64 = row.get(1)?;
            Ok((rowid, score))
        })?;
        let mut out = HashMap::new();
        for row in rows {
            let (rowid, score) = row?;
            out.insert(rowid, score);
        }
        Ok(out)
    })
    .await
}

/// Quote each token so punctuation in free-form query text never breaks
/// FTS5's query-string grammar.
fn fts_match_query(text: &str) -> String {
    text.split_whitespace()
        .map(|tok| format!("\"{}\"", tok.replace('"', "")))
        .collect::<Vec<_>>()
        .join(" OR ")
}

async fn score_and_rank(
    pool: &AgenrPool,
    query: &RecallQuery,
    candidates: &[Candidate],
    query_embedding: Option<&[f32]>,
) -> Result<Vec<RecallResult>> {
    let now = Utc::now();
    let weights = weights_for(query.text_is_blank());

    let embeddings = if query_embedding.is_some() {
        let rowids: Vec<i64> = candidates.iter().map(|c| c.rowid).collect();
        embeddings_for_rowids(pool, &rowids).await?
    } else {
        HashMap::new()
    };

    let fts_scores = if !query.text_is_blank() {
        fts_scores_for(pool, query.text.as_deref().unwrap_or_default()).await?
    } else {
        HashMap::new()
    };

    let mut results = Vec::with_capacity(candidates.len());
    for candidate in candidates {
        let entry = &candidate.entry;
        let entry_embedding = embeddings.get(&candidate.rowid).map(|v| v.as_slice());
        let vector = if query.no_boost { 0.0 } else { scoring::vector_score(query_embedding, entry_embedding) };
        let fts = if query.no_boost { 0.0 } else { scoring::fts_score(fts_scores.get(&candidate.rowid).copied()) };

        let scores = SubScores {
            vector,
            fts,
            recency: scoring::recency_score(entry.updated_at, now),
            importance: scoring::importance_score(entry.importance),
            recall: scoring::recall_count_score(entry.recall_count),
            freshness: scoring::freshness_score(entry.expiry, entry.created_at, now),
            todo_penalty: scoring::todo_penalty_score(entry.kind, entry.recall_count, entry.created_at, now),
            quality: scoring::quality_score(entry.quality_score),
            spacing: scoring::spacing_score(entry.last_recalled_at, now),
        };
        let score = composite(&scores, weights);

        results.push(RecallResult { entry: entry.clone(), score, scores, category: None });
    }

    results.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
    Ok(results)
}

/// Truncate by result-count limit and by token budget (spec.md §4.G step 5,
/// §8 property 8). Returns the kept results plus the token total spent, if
/// a budget was given.
fn truncate_by_budget(results: Vec<RecallResult>, limit: usize, budget: Option<u32>) -> (Vec<RecallResult>, Option<u32>) {
    let mut kept = Vec::new();
    let mut used = 0u32;
    for result in results.into_iter().take(limit) {
        let tokens = estimate_tokens(&result.entry);
        if let Some(budget) = budget
            && used + tokens > budget
            && !kept.is_empty()
        {
            break;
        }
        used += tokens;
        kept.push(result);
    }
    (kept, budget.map(|_| used))
}

/// Step 6: unless `noUpdate`, bump recall counters for returned entries and
/// strengthen co-recall edges among them, plus expand the result set with
/// each top result's strongest neighbors.
async fn apply_recall_side_effects(pool: &AgenrPool, results: &[RecallResult]) -> Result<()> {
    if results.is_empty() {
        return Ok(());
    }
    let now = Utc::now();
    let ids: Vec<EntryId> = results.iter().map(|r| r.entry.id).collect();

    pool.interact(move |conn| {
        let tx = conn.unchecked_transaction()?;
        for id in &ids {
            tx.execute(
                "UPDATE entries SET recall_count = recall_count + 1, last_recalled_at = ?1 WHERE id = ?2",
                rusqlite::params![now.to_rfc3339(), id.to_string()],
            )?;
        }
        for i in 0..ids.len() {
            for j in (i + 1)..ids.len() {
                let (a, b) = CoRecallEdge::ordered_pair(ids[i], ids[j]);
                tx.execute(
                    "INSERT INTO co_recall_edges (entry_a, entry_b, weight, session_count, last_co_recalled, created_at) \
                     VALUES (?1, ?2, 0.1, 1, ?3, ?3) \
                     ON CONFLICT(entry_a, entry_b) DO UPDATE SET \
                        weight = MIN(1.0, weight + 0.1), \
                        session_count = session_count + 1, \
                        last_co_recalled = excluded.last_co_recalled",
                    rusqlite::params![a.to_string(), b.to_string(), now.to_rfc3339()],
                )?;
            }
        }
        tx.commit()?;
        Ok(())
    })
    .await
}

/// Neighbor expansion: for the top entries, pull in their strongest
/// co-recall neighbors not already present in the result set (spec.md
/// §4.G step 5 "optionally expand with the co-recall neighbors of the
/// top-K"). Budget permitting, `recall` appends these after truncation.
async fn expand_with_co_recall_neighbors(
    pool: &AgenrPool,
    top: &[RecallResult],
    already_present: &HashSet<EntryId>,
) -> Result<Vec<EntryId>> {
    let ids: Vec<EntryId> = top.iter().map(|r| r.entry.id).collect();
    if ids.is_empty() {
        return Ok(Vec::new());
    }
    let present = already_present.clone();

    pool.interact(move |conn| {
        let mut neighbors = Vec::new();
        for id in &ids {
            let mut stmt = conn.prepare(
                "SELECT entry_a, entry_b, weight FROM co_recall_edges \
                 WHERE (entry_a = ?1 OR entry_b = ?1) AND weight >= ?2 \
                 ORDER BY weight DESC LIMIT ?3",
            )?;
            let rows = stmt.query_map(
                rusqlite::params![id.to_string(), CO_RECALL_MIN_WEIGHT, CO_RECALL_EXPANSION_PER_ENTRY as i64],
                |row| {
                    let a: String = row.get(0)?;
                    let b: String = row.get(1)?;
                    Ok((a, b))
                },
            )?;
            for row in rows {
                let (a, b) = row?;
                let other = if a == id.to_string() { b } else { a };
                if let Ok(uuid) = other.parse() {
                    let other_id = EntryId(uuid);
                    if !present.contains(&other_id) && !neighbors.contains(&other_id) {
                        neighbors.push(other_id);
                    }
                }
            }
        }
        Ok(neighbors)
    })
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::RawEntry;
    use async_trait::async_trait;

    struct FakeEmbedder;

    #[async_trait]
    impl EmbeddingClient for FakeEmbedder {
        async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            Ok(texts.iter().map(|_| vec![0.1, 0.2, 0.3]).collect())
        }
    }

    fn raw(subject: &str, content: &str, kind: &str) -> RawEntry {
        RawEntry {
            kind: kind.to_string(),
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

    async fn store(pool: &AgenrPool, entries: Vec<KnowledgeEntry>) {
        crate::storage::store_entries(
            pool,
            &FakeEmbedder,
            None,
            "judge-model",
            "f.jsonl",
            "hash",
            entries,
            &Default::default(),
        )
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn recall_returns_stored_entries() {
        let pool = AgenrPool::open_in_memory().await.unwrap();
        store(&pool, vec![KnowledgeEntry::new(raw("editor", "uses vim", "fact")).unwrap()]).await;

        let query = RecallQuery { text: Some("vim".to_string()), limit: 10, ..Default::default() };
        let envelope = recall(&pool, &FakeEmbedder, &query).await.unwrap();
        assert_eq!(envelope.total, 1);
        assert_eq!(envelope.results[0].entry.subject, "editor");
    }

    #[tokio::test]
    async fn recall_updates_recall_count_unless_no_update() {
        let pool = AgenrPool::open_in_memory().await.unwrap();
        store(&pool, vec![KnowledgeEntry::new(raw("editor", "uses vim", "fact")).unwrap()]).await;

        let query = RecallQuery { text: Some("vim".to_string()), limit: 10, ..Default::default() };
        recall(&pool, &FakeEmbedder, &query).await.unwrap();

        let envelope = recall(
            &pool,
            &FakeEmbedder,
            &RecallQuery { no_update: true, ..query },
        )
        .await
        .unwrap();
        assert_eq!(envelope.results[0].entry.recall_count, 1);
    }

    #[tokio::test]
    async fn browse_mode_does_not_call_embedder_and_orders_by_recency() {
        let pool = AgenrPool::open_in_memory().await.unwrap();
        store(&pool, vec![KnowledgeEntry::new(raw("a", "first", "fact")).unwrap()]).await;
        store(&pool, vec![KnowledgeEntry::new(raw("b", "second", "fact")).unwrap()]).await;

        let query = RecallQuery { browse: true, limit: 10, ..Default::default() };
        let envelope = recall(&pool, &FakeEmbedder, &query).await.unwrap();
        assert_eq!(envelope.query, BROWSE_MARKER);
        assert_eq!(envelope.results[0].entry.subject, "b");
    }

    #[tokio::test]
    async fn session_start_with_no_todos_gives_active_zero_budget() {
        let pool = AgenrPool::open_in_memory().await.unwrap();
        store(&pool, vec![KnowledgeEntry::new(raw("pref", "likes dark mode", "preference")).unwrap()]).await;

        let base = RecallQuery { budget: Some(1000), ..Default::default() };
        let envelope = recall_session_start(&pool, &FakeEmbedder, &base).await.unwrap();
        assert!(envelope.results.iter().all(|r| r.category.as_deref() != Some("active")));
    }

    #[tokio::test]
    async fn session_start_with_only_todos_caps_active_at_30_percent() {
        let pool = AgenrPool::open_in_memory().await.unwrap();
        store(&pool, vec![KnowledgeEntry::new(raw("task", "finish the report", "todo")).unwrap()]).await;

        let base = RecallQuery { budget: Some(1000), ..Default::default() };
        let envelope = recall_session_start(&pool, &FakeEmbedder, &base).await.unwrap();
        let active_tokens: u32 = envelope
            .results
            .iter()
            .filter(|r| r.category.as_deref() == Some("active"))
            .map(|r| estimate_tokens(&r.entry))
            .sum();
        assert!(active_tokens as f32 <= 1000.0 * 0.30 + 1.0);
    }
}
