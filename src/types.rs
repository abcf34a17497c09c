// src/types.rs
// Core domain model (spec.md §3). `KnowledgeEntry` is constructed only
// through `KnowledgeEntry::new`, which validates and normalizes a raw
// extraction result into a `Result<KnowledgeEntry, ValidationError>` — no
// partially-invalid entry can exist (spec.md §9 redesign guidance).

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::dedup::minhash::{MINHASH_SIZE, compute_minhash};
use crate::hashing::{content_hash, normalized_content_hash};

/// Stable entry identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EntryId(pub Uuid);

impl EntryId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for EntryId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for EntryId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// `KnowledgeEntry.kind` (spec.md §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    Fact,
    Decision,
    Preference,
    Todo,
    Relationship,
    Event,
    Lesson,
}

impl EntryKind {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "fact" => Some(Self::Fact),
            "decision" => Some(Self::Decision),
            "preference" => Some(Self::Preference),
            "todo" => Some(Self::Todo),
            "relationship" => Some(Self::Relationship),
            "event" => Some(Self::Event),
            "lesson" => Some(Self::Lesson),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Fact => "fact",
            Self::Decision => "decision",
            Self::Preference => "preference",
            Self::Todo => "todo",
            Self::Relationship => "relationship",
            Self::Event => "event",
            Self::Lesson => "lesson",
        }
    }
}

/// `KnowledgeEntry.expiry` (spec.md §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Expiry {
    Core,
    Permanent,
    Temporary,
}

impl Expiry {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "core" => Some(Self::Core),
            "permanent" => Some(Self::Permanent),
            "temporary" => Some(Self::Temporary),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Core => "core",
            Self::Permanent => "permanent",
            Self::Temporary => "temporary",
        }
    }
}

impl Default for Expiry {
    fn default() -> Self {
        Self::Temporary
    }
}

/// `KnowledgeEntry.scope` (spec.md §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scope {
    Private,
    Personal,
    Public,
}

impl Scope {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "private" => Some(Self::Private),
            "personal" => Some(Self::Personal),
            "public" => Some(Self::Public),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Private => "private",
            Self::Personal => "personal",
            Self::Public => "public",
        }
    }
}

impl Default for Scope {
    fn default() -> Self {
        Self::Private
    }
}

/// `KnowledgeEntry.platform` (spec.md §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Platform {
    Openclaw,
    ClaudeCode,
    Codex,
}

impl Platform {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "openclaw" => Some(Self::Openclaw),
            "claude-code" | "claude_code" | "claudecode" => Some(Self::ClaudeCode),
            "codex" => Some(Self::Codex),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Openclaw => "openclaw",
            Self::ClaudeCode => "claude-code",
            Self::Codex => "codex",
        }
    }
}

/// `KnowledgeEntry.source` (spec.md §3).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum EntrySource {
    File { path: String },
    Context { text: String },
}

impl EntrySource {
    /// Length of the free-form context text, used by `mergeEntries`'s
    /// "source.context = longer" rule.
    pub fn context_len(&self) -> usize {
        match self {
            EntrySource::Context { text } => text.len(),
            EntrySource::File { .. } => 0,
        }
    }
}

/// Raw, not-yet-validated extraction output (spec.md §4.C per-chunk output
/// before validation). Produced by the extractor, local dedup, and tests.
#[derive(Debug, Clone)]
pub struct RawEntry {
    pub kind: String,
    pub subject: String,
    pub canonical_key: Option<String>,
    pub content: String,
    pub importance: Option<i64>,
    pub expiry: Option<String>,
    pub scope: Option<String>,
    pub platform: Option<String>,
    pub project: Option<String>,
    pub tags: Vec<String>,
    pub source: EntrySource,
    pub created_at: Option<DateTime<Utc>>,
    pub subject_key: Option<String>,
    pub predicate: Option<String>,
    pub object: Option<String>,
    pub claim_confidence: Option<f32>,
}

/// A validation failure surfaced to the caller (spec.md §7 `ValidationError`).
#[derive(Debug, Clone, thiserror::Error)]
pub enum ValidationError {
    #[error("empty subject")]
    EmptySubject,
    #[error("empty content")]
    EmptyContent,
    #[error("unknown entry kind: {0}")]
    UnknownKind(String),
    #[error("canonical_key {0:?} does not match ^[a-z0-9]+(-[a-z0-9]+){{2,4}}$")]
    InvalidCanonicalKey(String),
}

static CANONICAL_KEY_RE: std::sync::OnceLock<regex::Regex> = std::sync::OnceLock::new();

fn canonical_key_regex() -> &'static regex::Regex {
    CANONICAL_KEY_RE.get_or_init(|| {
        regex::Regex::new(r"^[a-z0-9]+(-[a-z0-9]+){2,4}$").expect("static regex is valid")
    })
}

/// The durable knowledge entry (spec.md §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KnowledgeEntry {
    pub id: EntryId,
    pub kind: EntryKind,
    pub subject: String,
    pub canonical_key: Option<String>,
    pub content: String,
    pub importance: u8,
    pub expiry: Expiry,
    pub scope: Scope,
    pub platform: Option<Platform>,
    pub project: Option<String>,
    pub tags: BTreeSet<String>,
    pub source: EntrySource,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_recalled_at: Option<DateTime<Utc>>,

    pub recall_count: u32,
    pub confirmations: u32,
    pub contradictions: u32,

    pub retired: bool,
    pub retired_at: Option<DateTime<Utc>>,
    pub retired_reason: Option<String>,
    pub suppressed_contexts: BTreeSet<String>,

    pub superseded_by: Option<EntryId>,

    pub content_hash: String,
    pub normalized_content_hash: String,
    #[serde(with = "minhash_serde")]
    pub minhash: [u32; MINHASH_SIZE],

    pub embedding: Option<Vec<f32>>,

    pub subject_key: Option<String>,
    pub predicate: Option<String>,
    pub object: Option<String>,
    pub claim_confidence: Option<f32>,

    pub quality_score: f32,
}

mod minhash_serde {
    use super::MINHASH_SIZE;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(v: &[u32; MINHASH_SIZE], s: S) -> Result<S::Ok, S::Error> {
        v.as_slice().serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<[u32; MINHASH_SIZE], D::Error> {
        let v: Vec<u32> = Vec::deserialize(d)?;
        v.try_into()
            .map_err(|_| serde::de::Error::custom("minhash signature must have 128 entries"))
    }
}

/// Normalize a tag: lowercase, trim. Empty tags are dropped by the caller.
pub fn normalize_tag(tag: &str) -> String {
    tag.trim().to_ascii_lowercase()
}

impl KnowledgeEntry {
    /// Validate and normalize a raw extraction result into a durable entry
    /// (spec.md §4.C: "Each raw entry is validated...").
    ///
    /// Clamps importance to [1,10] (default 5), defaults expiry to
    /// `temporary`, normalizes and dedupes tags, enforces the canonical_key
    /// pattern when present, and computes content_hash /
    /// normalized_content_hash / minhash at construction time — storage
    /// never recomputes them (spec.md §9).
    pub fn new(raw: RawEntry) -> Result<Self, ValidationError> {
        let subject = raw.subject.trim().to_string();
        if subject.is_empty() {
            return Err(ValidationError::EmptySubject);
        }
        let content = raw.content.trim().to_string();
        if content.is_empty() {
            return Err(ValidationError::EmptyContent);
        }
        let kind = EntryKind::parse(&raw.kind).ok_or(ValidationError::UnknownKind(raw.kind))?;

        if let Some(ref key) = raw.canonical_key
            && !canonical_key_regex().is_match(key)
        {
            return Err(ValidationError::InvalidCanonicalKey(key.clone()));
        }

        let importance = raw
            .importance
            .map(|v| v.clamp(1, 10) as u8)
            .unwrap_or(5);

        let expiry = raw
            .expiry
            .as_deref()
            .and_then(Expiry::parse)
            .unwrap_or_default();

        let scope = raw.scope.as_deref().and_then(Scope::parse).unwrap_or_default();
        let platform = raw.platform.as_deref().and_then(Platform::parse);

        let mut tags: BTreeSet<String> = raw
            .tags
            .iter()
            .map(|t| normalize_tag(t))
            .filter(|t| !t.is_empty())
            .collect();
        tags = tags.into_iter().collect();

        let now = Utc::now();
        let created_at = raw.created_at.unwrap_or(now);

        Ok(Self {
            id: EntryId::new(),
            kind,
            subject,
            canonical_key: raw.canonical_key,
            content_hash: content_hash(&content),
            normalized_content_hash: normalized_content_hash(&content),
            minhash: compute_minhash(&content),
            content,
            importance,
            expiry,
            scope,
            platform,
            project: raw.project,
            tags,
            source: raw.source,
            created_at,
            updated_at: created_at,
            last_recalled_at: None,
            recall_count: 0,
            confirmations: 0,
            contradictions: 0,
            retired: false,
            retired_at: None,
            retired_reason: None,
            suppressed_contexts: BTreeSet::new(),
            superseded_by: None,
            embedding: None,
            subject_key: raw.subject_key,
            predicate: raw.predicate,
            object: raw.object,
            claim_confidence: raw.claim_confidence,
            quality_score: 0.5,
        })
    }

    pub fn with_embedding(mut self, embedding: Vec<f32>) -> Self {
        self.embedding = Some(embedding);
        self
    }

    /// `(type, normalized(subject), normalized(content))` key used by the
    /// local deduplicator's exact-key fold (spec.md §4.D).
    pub fn exact_key(&self) -> (EntryKind, String, String) {
        (
            self.kind,
            crate::text::normalize(&self.subject),
            crate::text::normalize(&self.content),
        )
    }

    /// `(type, normalized(subject))` grouping key used by the trigram fold
    /// and the consolidator's near-exact-duplicate pass.
    pub fn subject_group_key(&self) -> (EntryKind, String) {
        (self.kind, crate::text::normalize(&self.subject))
    }
}

/// `Relation` (spec.md §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RelationType {
    Supersedes,
    Contradicts,
    Elaborates,
    Related,
}

impl RelationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Supersedes => "supersedes",
            Self::Contradicts => "contradicts",
            Self::Elaborates => "elaborates",
            Self::Related => "related",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "supersedes" => Some(Self::Supersedes),
            "contradicts" => Some(Self::Contradicts),
            "elaborates" => Some(Self::Elaborates),
            "related" => Some(Self::Related),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Relation {
    pub source_id: EntryId,
    pub target_id: EntryId,
    pub relation_type: RelationType,
    pub created_at: DateTime<Utc>,
}

/// `IngestLog` row (spec.md §3).
#[derive(Debug, Clone)]
pub struct IngestLogRow {
    pub file_path: String,
    pub content_hash: String,
    pub ingested_at: DateTime<Utc>,
    pub added: u32,
    pub updated: u32,
    pub skipped: u32,
    pub superseded: u32,
    pub duration_ms: u64,
}

/// Co-recall edge (spec.md §3). `entry_a < entry_b` by id to keep the pair
/// unordered-but-canonical.
#[derive(Debug, Clone)]
pub struct CoRecallEdge {
    pub entry_a: EntryId,
    pub entry_b: EntryId,
    pub weight: f64,
    pub session_count: u32,
    pub last_co_recalled: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl CoRecallEdge {
    /// Canonicalize a pair so `entry_a < entry_b` always holds.
    pub fn ordered_pair(a: EntryId, b: EntryId) -> (EntryId, EntryId) {
        if a.0 <= b.0 { (a, b) } else { (b, a) }
    }
}

/// `ReviewQueueEntry` (spec.md §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewQueueEntry {
    pub id: i64,
    pub suggested_action: String,
    pub reason: String,
    pub source_entry_ids: Vec<EntryId>,
    pub resolved: bool,
    pub created_at: DateTime<Utc>,
}

/// Match type for a retirement pattern (spec.md §3 `RetirementsLedger`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchType {
    Exact,
    Contains,
}

/// A single append-only retirement record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetirementRecord {
    pub pattern: String,
    pub match_type: MatchType,
    pub suppressed_contexts: Vec<String>,
    pub reason: String,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

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
            tags: vec!["  Foo ".to_string(), "foo".to_string(), "".to_string()],
            source: EntrySource::Context {
                text: "ctx".to_string(),
            },
            created_at: None,
            subject_key: None,
            predicate: None,
            object: None,
            claim_confidence: None,
        }
    }

    #[test]
    fn rejects_empty_subject() {
        let r = raw("  ", "content");
        assert!(matches!(
            KnowledgeEntry::new(r),
            Err(ValidationError::EmptySubject)
        ));
    }

    #[test]
    fn rejects_empty_content() {
        let r = raw("subject", "   ");
        assert!(matches!(
            KnowledgeEntry::new(r),
            Err(ValidationError::EmptyContent)
        ));
    }

    #[test]
    fn rejects_unknown_kind() {
        let mut r = raw("s", "c");
        r.kind = "bogus".to_string();
        assert!(matches!(
            KnowledgeEntry::new(r),
            Err(ValidationError::UnknownKind(_))
        ));
    }

    #[test]
    fn defaults_importance_and_expiry() {
        let e = KnowledgeEntry::new(raw("s", "c")).unwrap();
        assert_eq!(e.importance, 5);
        assert_eq!(e.expiry, Expiry::Temporary);
    }

    #[test]
    fn clamps_importance() {
        let mut r = raw("s", "c");
        r.importance = Some(99);
        let e = KnowledgeEntry::new(r).unwrap();
        assert_eq!(e.importance, 10);

        let mut r = raw("s", "c");
        r.importance = Some(-5);
        let e = KnowledgeEntry::new(r).unwrap();
        assert_eq!(e.importance, 1);
    }

    #[test]
    fn tags_normalized_and_deduped() {
        let e = KnowledgeEntry::new(raw("s", "c")).unwrap();
        assert_eq!(e.tags.len(), 1);
        assert!(e.tags.contains("foo"));
    }

    #[test]
    fn canonical_key_validated() {
        let mut r = raw("s", "c");
        r.canonical_key = Some("not valid!!".to_string());
        assert!(matches!(
            KnowledgeEntry::new(r),
            Err(ValidationError::InvalidCanonicalKey(_))
        ));

        let mut r2 = raw("s", "c");
        r2.canonical_key = Some("user-preferred-editor".to_string());
        assert!(KnowledgeEntry::new(r2).is_ok());
    }

    #[test]
    fn content_hash_derived_at_construction() {
        let e = KnowledgeEntry::new(raw("s", "hello world")).unwrap();
        assert_eq!(e.content_hash, content_hash("hello world"));
        assert_eq!(
            e.normalized_content_hash,
            normalized_content_hash("hello world")
        );
    }

    #[test]
    fn exact_key_matches_same_normalized_subject_and_content() {
        let e1 = KnowledgeEntry::new(raw("Use Tabs", "config detail")).unwrap();
        let e2 = KnowledgeEntry::new(raw("use  tabs", "Config Detail")).unwrap();
        assert_eq!(e1.exact_key(), e2.exact_key());
    }
}
