// src/recall/scoring.rs
// The nine recall sub-scores (spec.md §4.G), each a small pure function
// independently unit-tested, the way the teacher's `db/memory/ranking.rs`
// keeps `apply_entity_boost`/`apply_branch_boost`/`apply_recency_boost`/
// `apply_staleness_penalty` as separate testable units composed by one
// scorer rather than one large ranking blob.

use chrono::{DateTime, Utc};

use crate::types::{EntryKind, Expiry, KnowledgeEntry};

/// Half-life for the recency sub-score, in days.
const RECENCY_HALF_LIFE_DAYS: f64 = 30.0;

/// Temporary entries start freshness decay after this many days...
const FRESHNESS_GRACE_DAYS: i64 = 30;
/// ...and linearly decay to `FRESHNESS_FLOOR` by this day.
const FRESHNESS_FLOOR_DAY: i64 = 90;
const FRESHNESS_FLOOR: f32 = 0.2;

/// todoPenalty kicks in once an unrecalled todo is older than this.
const TODO_PENALTY_AGE_DAYS: i64 = 14;
const TODO_PENALTY: f32 = 0.6;

/// Saturating point for the recall-count sub-score.
const RECALL_COUNT_SATURATION: f64 = 20.0;

/// Spacing penalty window: recalling the same entry again inside this
/// window is penalized to discourage thrashing the same result to the top.
const SPACING_WINDOW_HOURS: i64 = 1;
const SPACING_PENALTY: f32 = 0.7;

/// Cosine similarity between two equal-length embedding vectors, clamped to
/// `[0, 1]` (embeddings are not guaranteed unit-norm at rest, so raw cosine
/// can fall slightly outside due to floating point).
pub fn vector_score(query_embedding: Option<&[f32]>, entry_embedding: Option<&[f32]>) -> f32 {
    let (q, e) = match (query_embedding, entry_embedding) {
        (Some(q), Some(e)) if !q.is_empty() && q.len() == e.len() => (q, e),
        _ => return 0.0,
    };

    let mut dot = 0.0f32;
    let mut norm_q = 0.0f32;
    let mut norm_e = 0.0f32;
    for i in 0..q.len() {
        dot += q[i] * e[i];
        norm_q += q[i] * q[i];
        norm_e += e[i] * e[i];
    }
    if norm_q == 0.0 || norm_e == 0.0 {
        return 0.0;
    }
    (dot / (norm_q.sqrt() * norm_e.sqrt())).clamp(0.0, 1.0)
}

/// BM25-normalized FTS match score, already computed by the `bm25()`
/// auxiliary function in the SQL query and passed through here. SQLite's
/// `bm25()` returns a negative value where more negative means a better
/// match; normalize to `[0, 1]` with a saturating transform.
pub fn fts_score(bm25_raw: Option<f64>) -> f32 {
    match bm25_raw {
        None => 0.0,
        Some(raw) => {
            let positive = (-raw).max(0.0);
            (positive / (positive + 1.0)) as f32
        }
    }
}

/// Exponential decay on `updated_at` with a 30 day half-life.
pub fn recency_score(updated_at: DateTime<Utc>, now: DateTime<Utc>) -> f32 {
    let age_days = (now - updated_at).num_seconds() as f64 / 86_400.0;
    let age_days = age_days.max(0.0);
    2f64.powf(-age_days / RECENCY_HALF_LIFE_DAYS) as f32
}

/// `importance / 10`.
pub fn importance_score(importance: u8) -> f32 {
    (importance as f32 / 10.0).clamp(0.0, 1.0)
}

/// Saturating log of `recall_count`, capped at 1.
pub fn recall_count_score(recall_count: u32) -> f32 {
    if recall_count == 0 {
        return 0.0;
    }
    (((1.0 + recall_count as f64).ln()) / ((1.0 + RECALL_COUNT_SATURATION).ln())).min(1.0) as f32
}

/// 1 unless `expiry=temporary` and age exceeds the grace period, in which
/// case it decays linearly to `FRESHNESS_FLOOR` by day 90.
pub fn freshness_score(expiry: Expiry, created_at: DateTime<Utc>, now: DateTime<Utc>) -> f32 {
    if expiry != Expiry::Temporary {
        return 1.0;
    }
    let age_days = (now - created_at).num_days();
    if age_days <= FRESHNESS_GRACE_DAYS {
        return 1.0;
    }
    if age_days >= FRESHNESS_FLOOR_DAY {
        return FRESHNESS_FLOOR;
    }
    let span = (FRESHNESS_FLOOR_DAY - FRESHNESS_GRACE_DAYS) as f32;
    let progressed = (age_days - FRESHNESS_GRACE_DAYS) as f32;
    1.0 - (1.0 - FRESHNESS_FLOOR) * (progressed / span)
}

/// 0.6 for a never-recalled todo older than 14 days, else 1.
pub fn todo_penalty_score(kind: EntryKind, recall_count: u32, created_at: DateTime<Utc>, now: DateTime<Utc>) -> f32 {
    if kind != EntryKind::Todo || recall_count != 0 {
        return 1.0;
    }
    let age_days = (now - created_at).num_days();
    if age_days > TODO_PENALTY_AGE_DAYS { TODO_PENALTY } else { 1.0 }
}

/// `quality_score`, already in `[0, 1]` (default 0.5).
pub fn quality_score(quality_score: f32) -> f32 {
    quality_score.clamp(0.0, 1.0)
}

/// 0.7 if recalled within the last hour, else 1 (prevents the same entry
/// thrashing to the top of consecutive recalls in a tight loop).
pub fn spacing_score(last_recalled_at: Option<DateTime<Utc>>, now: DateTime<Utc>) -> f32 {
    match last_recalled_at {
        Some(ts) if now - ts < chrono::Duration::hours(SPACING_WINDOW_HOURS) => SPACING_PENALTY,
        _ => 1.0,
    }
}

/// All nine sub-scores for one candidate entry, as reported in the recall
/// JSON envelope's `scores` object (spec.md §6).
#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct SubScores {
    pub vector: f32,
    pub fts: f32,
    pub recency: f32,
    pub importance: f32,
    pub recall: f32,
    pub freshness: f32,
    #[serde(rename = "todoPenalty")]
    pub todo_penalty: f32,
    pub quality: f32,
    pub spacing: f32,
}

/// Default composite weights: vector/fts dominate when a query embedding is
/// present; recency/importance carry more weight when it's blank (the
/// weights sum to the same total either way so scores stay comparable).
pub struct Weights {
    pub vector: f32,
    pub fts: f32,
    pub recency: f32,
    pub importance: f32,
    pub recall: f32,
}

const WEIGHTS_WITH_QUERY: Weights = Weights {
    vector: 0.35,
    fts: 0.20,
    recency: 0.15,
    importance: 0.15,
    recall: 0.05,
};

const WEIGHTS_BLANK_QUERY: Weights = Weights {
    vector: 0.0,
    fts: 0.0,
    recency: 0.45,
    importance: 0.40,
    recall: 0.05,
};

pub fn weights_for(query_blank: bool) -> &'static Weights {
    if query_blank { &WEIGHTS_BLANK_QUERY } else { &WEIGHTS_WITH_QUERY }
}

/// Composite = weighted sum of vector/fts/recency/importance/recall,
/// multiplied by the three multiplicative modifiers (freshness, todoPenalty,
/// spacing) and by quality. Quality and the modifiers always apply so a
/// stale temporary entry or a just-recalled one don't dominate regardless
/// of which weight regime is active.
pub fn composite(scores: &SubScores, weights: &Weights) -> f32 {
    let base = weights.vector * scores.vector
        + weights.fts * scores.fts
        + weights.recency * scores.recency
        + weights.importance * scores.importance
        + weights.recall * scores.recall;
    base * scores.freshness * scores.todo_penalty * scores.spacing * (0.5 + 0.5 * scores.quality)
}

/// Rough token estimate used for budget truncation (spec.md §4.G step 5):
/// chars/4 plus a flat per-tag overhead.
pub fn estimate_tokens(entry: &KnowledgeEntry) -> u32 {
    let chars = entry.subject.len() + entry.content.len();
    let tag_overhead = entry.tags.len() as u32 * 2;
    (chars as u32 / 4) + tag_overhead
}

#[cfg(test)]
mod vector_score_tests {
    use super::*;

    #[test]
    fn identical_vectors_score_one() {
        let v = vec![0.5, 0.5, 0.5];
        assert!((vector_score(Some(&v), Some(&v)) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn orthogonal_vectors_score_zero() {
        let a = vec![1.0, 0.0];
        let b = vec![0.0, 1.0];
        assert!((vector_score(Some(&a), Some(&b))).abs() < 1e-6);
    }

    #[test]
    fn blank_query_scores_zero() {
        let e = vec![1.0, 0.0];
        assert_eq!(vector_score(None, Some(&e)), 0.0);
    }
}

#[cfg(test)]
mod fts_score_tests {
    use super::*;

    #[test]
    fn no_match_scores_zero() {
        assert_eq!(fts_score(None), 0.0);
    }

    #[test]
    fn more_negative_bm25_scores_higher() {
        let weak = fts_score(Some(-1.0));
        let strong = fts_score(Some(-10.0));
        assert!(strong > weak);
    }
}

#[cfg(test)]
mod recency_score_tests {
    use super::*;

    #[test]
    fn zero_age_scores_one() {
        let now = Utc::now();
        assert!((recency_score(now, now) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn half_life_scores_half() {
        let now = Utc::now();
        let thirty_days_ago = now - chrono::Duration::days(30);
        assert!((recency_score(thirty_days_ago, now) - 0.5).abs() < 0.01);
    }
}

#[cfg(test)]
mod importance_score_tests {
    use super::*;

    #[test]
    fn max_importance_scores_one() {
        assert!((importance_score(10) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn min_importance_scores_tenth() {
        assert!((importance_score(1) - 0.1).abs() < 1e-6);
    }
}


#[cfg(test)]
mod freshness_score_tests {
    use super::*;

    #[test]
    fn permanent_entries_never_decay() {
        let now = Utc::now();
        let old = now - chrono::Duration::days(400);
        assert_eq!(freshness_score(Expiry::Permanent, old, now), 1.0);
    }

    #[test]
    fn temporary_within_grace_scores_one() {
        let now = Utc::now();
        let recent = now - chrono::Duration::days(10);
        assert_eq!(freshness_score(Expiry::Temporary, recent, now), 1.0);
    }

    #[test]
    fn temporary_past_ninety_days_floors_out() {
        let now = Utc::now();
        let ancient = now - chrono::Duration::days(200);
        assert!((freshness_score(Expiry::Temporary, ancient, now) - FRESHNESS_FLOOR).abs() < 1e-6);
    }

    #[test]
    fn temporary_mid_decay_is_between_floor_and_one() {
        let now = Utc::now();
        let mid = now - chrono::Duration::days(60);
        let score = freshness_score(Expiry::Temporary, mid, now);
        assert!(score > FRESHNESS_FLOOR && score < 1.0);
    }
}

#[cfg(test)]
mod todo_penalty_score_tests {
    use super::*;

    #[test]
    fn recalled_todo_is_never_penalized() {
        let now = Utc::now();
        let old = now - chrono::Duration::days(30);
        assert_eq!(todo_penalty_score(EntryKind::Todo, 1, old, now), 1.0);
    }

    #[test]
    fn stale_unrecalled_todo_is_penalized() {
        let now = Utc::now();
        let old = now - chrono::Duration::days(20);
        assert_eq!(todo_penalty_score(EntryKind::Todo, 0, old, now), TODO_PENALTY);
    }

    #[test]
    fn young_unrecalled_todo_is_not_penalized() {
        let now = Utc::now();
        let young = now - chrono::Duration::days(2);
        assert_eq!(todo_penalty_score(EntryKind::Todo, 0, young, now), 1.0);
    }

    #[test]
    fn non_todo_kinds_are_never_penalized() {
        let now = Utc::now();
        let old = now - chrono::Duration::days(30);
        assert_eq!(todo_penalty_score(EntryKind::Fact, 0, old, now), 1.0);
    }
}

#[cfg(test)]
mod spacing_score_tests {
    use super::*;

    #[test]
    fn just_recalled_is_penalized() {
        let now = Utc::now();
        let recent = now - chrono::Duration::minutes(5);
        assert_eq!(spacing_score(Some(recent), now), SPACING_PENALTY);
    }

    #[test]
    fn recalled_over_an_hour_ago_is_not_penalized() {
        let now = Utc::now();
        let old = now - chrono::Duration::hours(2);
        assert_eq!(spacing_score(Some(old), now), 1.0);
    }

    #[test]
    fn never_recalled_is_not_penalized() {
        assert_eq!(spacing_score(None, Utc::now()), 1.0);
    }
}

#[cfg(test)]
mod composite_tests {
    use super::*;

    #[test]
    fn blank_query_weights_ignore_vector_and_fts() {
        let w = weights_for(true);
        let scores = SubScores {
            vector: 1.0,
            fts: 1.0,
            recency: 0.5,
            importance: 0.5,
            recall: 0.5,
            freshness: 1.0,
            todo_penalty: 1.0,
            quality: 1.0,
            spacing: 1.0,
        };
        let baseline = composite(&scores, w);
        let with_vector = SubScores { vector: 0.0, fts: 0.0, ..scores };
        assert!((composite(&with_vector, w) - baseline).abs() < 1e-6);
    }

    #[test]
    fn todo_penalty_reduces_composite() {
        let w = weights_for(false);
        let full = SubScores {
            vector: 0.8,
            fts: 0.8,
            recency: 0.8,
            importance: 0.8,
            recall: 0.8,
            freshness: 1.0,
            todo_penalty: 1.0,
            quality: 1.0,
            spacing: 1.0,
        };
        let penalized = SubScores { todo_penalty: TODO_PENALTY, ..full };
        assert!(composite(&penalized, w) < composite(&full, w));
    }
}
