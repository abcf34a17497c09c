// src/dedup/mod.rs
// Local (within-batch) deduplication folds (spec.md §4.D): exact-key fold,
// then a trigram-Jaccard fold over what's left. Runs before any storage
// write, so a huge bulk ingest never pays for an online dedup judge call
// per near-duplicate line.

pub mod minhash;

use std::collections::HashMap;

use crate::text::{normalize, trigrams};
use crate::types::{EntryKind, EntrySource, KnowledgeEntry};

/// Jaccard threshold above which two entries in the same `(kind, subject)`
/// group are folded together by the local deduplicator (spec.md §4.D).
pub const LOCAL_DEDUP_THRESHOLD: f64 = 0.85;

/// Fold a batch of freshly-validated entries down to one representative per
/// duplicate group, preserving the position of the earliest member of each
/// group (spec.md §8 property 3: permutation-invariance of the resulting
/// content_hash set).
pub fn fold_local_duplicates(entries: Vec<KnowledgeEntry>) -> Vec<KnowledgeEntry> {
    let after_exact = fold_exact_key(entries);
    fold_trigram(after_exact)
}

/// Group by `(kind, normalize(subject), normalize(content))` and merge each
/// group into a single entry.
fn fold_exact_key(entries: Vec<KnowledgeEntry>) -> Vec<KnowledgeEntry> {
    let mut order: Vec<(EntryKind, String, String)> = Vec::new();
    let mut groups: HashMap<(EntryKind, String, String), Vec<KnowledgeEntry>> = HashMap::new();

    for entry in entries {
        let key = entry.exact_key();
        if !groups.contains_key(&key) {
            order.push(key.clone());
        }
        groups.entry(key).or_default().push(entry);
    }

    order
        .into_iter()
        .map(|key| {
            let group = groups.remove(&key).expect("key was just inserted above");
            merge_entries(group)
        })
        .collect()
}

/// Within each `(kind, normalize(subject))` partition, merge entries whose
/// content trigram-Jaccard similarity is >= `LOCAL_DEDUP_THRESHOLD`.
fn fold_trigram(entries: Vec<KnowledgeEntry>) -> Vec<KnowledgeEntry> {
    let mut order: Vec<(EntryKind, String)> = Vec::new();
    let mut partitions: HashMap<(EntryKind, String), Vec<KnowledgeEntry>> = HashMap::new();

    for entry in entries {
        let key = entry.subject_group_key();
        if !partitions.contains_key(&key) {
            order.push(key.clone());
        }
        partitions.entry(key).or_default().push(entry);
    }

    let mut result = Vec::new();
    for key in order {
        let partition = partitions.remove(&key).expect("key was just inserted above");
        result.extend(fold_partition_by_similarity(partition));
    }
    result
}

/// Greedy single-pass clustering within one `(kind, subject)` partition:
/// each entry joins the first existing cluster whose representative is
/// similar enough, else starts a new cluster. Order-preserving over the
/// partition's input order.
fn fold_partition_by_similarity(partition: Vec<KnowledgeEntry>) -> Vec<KnowledgeEntry> {
    struct Cluster {
        shingles: std::collections::HashSet<String>,
        members: Vec<KnowledgeEntry>,
    }

    let mut clusters: Vec<Cluster> = Vec::new();
    for entry in partition {
        let shingles = trigrams(&normalize(&entry.content));
        let home = clusters
            .iter()
            .position(|c| crate::text::jaccard(&c.shingles, &shingles) >= LOCAL_DEDUP_THRESHOLD);
        match home {
            Some(idx) => clusters[idx].members.push(entry),
            None => clusters.push(Cluster {
                shingles,
                members: vec![entry],
            }),
        }
    }

    clusters.into_iter().map(|c| merge_entries(c.members)).collect()
}

/// Merge a group of duplicate entries into one, per spec.md §4.D:
/// - `importance` = max across the group
/// - `tags` = sorted union
/// - `source.context` = the longer of any two Context sources (File sources
///   are left as-is, first one wins)
/// - `created_at` = earliest across the group
pub fn merge_entries(mut group: Vec<KnowledgeEntry>) -> KnowledgeEntry {
    assert!(!group.is_empty(), "merge_entries requires at least one entry");
    if group.len() == 1 {
        return group.pop().expect("len checked above");
    }

    let mut winner = group.remove(0);
    for other in group {
        if other.importance > winner.importance {
            winner.importance = other.importance;
        }
        winner.tags.extend(other.tags.iter().cloned());
        if other.created_at < winner.created_at {
            winner.created_at = other.created_at;
        }
        winner.source = longer_context_source(winner.source, other.source);
    }
    winner
}

fn longer_context_source(a: EntrySource, b: EntrySource) -> EntrySource {
    match (&a, &b) {
        (EntrySource::Context { .. }, EntrySource::Context { .. }) => {
            if b.context_len() > a.context_len() { b } else { a }
        }
        _ => a,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{EntrySource, RawEntry};

    fn make(subject: &str, content: &str, importance: i64, tags: &[&str]) -> KnowledgeEntry {
        KnowledgeEntry::new(RawEntry {
            kind: "fact".to_string(),
            subject: subject.to_string(),
            canonical_key: None,
            content: content.to_string(),
            importance: Some(importance),
            expiry: None,
            scope: None,
            platform: None,
            project: None,
            tags: tags.iter().map(|s| s.to_string()).collect(),
            source: EntrySource::Context {
                text: content.to_string(),
            },
            created_at: None,
            subject_key: None,
            predicate: None,
            object: None,
            claim_confidence: None,
        })
        .unwrap()
    }

    #[test]
    fn exact_duplicates_fold_to_one_and_take_max_importance() {
        let a = make("User prefers tabs", "uses tabs over spaces", 3, &["editor"]);
        let b = make("user  prefers tabs", "Uses Tabs Over Spaces", 7, &["style"]);
        let folded = fold_local_duplicates(vec![a, b]);
        assert_eq!(folded.len(), 1);
        assert_eq!(folded[0].importance, 7);
        assert!(folded[0].tags.contains("editor"));
        assert!(folded[0].tags.contains("style"));
    }

    #[test]
    fn near_duplicates_fold_via_trigram_similarity() {
        let a = make(
            "deploy process",
            "the deployment pipeline now runs integration tests before release",
            4,
            &[],
        );
        let b = make(
            "deploy process",
            "the deployment pipeline now runs integration tests before shipping",
            6,
            &[],
        );
        let folded = fold_local_duplicates(vec![a, b]);
        assert_eq!(folded.len(), 1);
        assert_eq!(folded[0].importance, 6);
    }

    #[test]
    fn unrelated_entries_are_preserved_and_order_stable() {
        let a = make("topic a", "completely unrelated sentence here", 5, &[]);
        let b = make("topic b", "totally different words entirely", 5, &[]);
        let folded = fold_local_duplicates(vec![a.clone(), b.clone()]);
        assert_eq!(folded.len(), 2);
        assert_eq!(folded[0].subject, a.subject);
        assert_eq!(folded[1].subject, b.subject);
    }

    #[test]
    fn merge_keeps_earliest_created_at() {
        let mut a = make("s", "content one is here for this test case padding", 5, &[]);
        let mut b = make("s", "content one is here for this test case padding", 5, &[]);
        a.created_at = chrono::Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        b.created_at = chrono::Utc.with_ymd_and_hms(2023, 1, 1, 0, 0, 0).unwrap();
        let merged = merge_entries(vec![a, b]);
        assert_eq!(merged.created_at.format("%Y").to_string(), "2023");
    }

    use chrono::TimeZone;

    #[test]
    fn permutation_of_input_yields_same_content_hash_set() {
        let a = make("topic a", "completely unrelated sentence here", 5, &[]);
        let b = make("topic b", "totally different words entirely", 5, &[]);
        let forward = fold_local_duplicates(vec![a.clone(), b.clone()]);
        let backward = fold_local_duplicates(vec![b, a]);
        let mut forward_hashes: Vec<_> = forward.iter().map(|e| e.content_hash.clone()).collect();
        let mut backward_hashes: Vec<_> = backward.iter().map(|e| e.content_hash.clone()).collect();
        forward_hashes.sort();
        backward_hashes.sort();
        assert_eq!(forward_hashes, backward_hashes);
    }
}
