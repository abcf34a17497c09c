// src/cli/recall.rs
// `agenr recall` (spec.md §4.G / §6): parse CLI filters into a `RecallQuery`,
// run it, print the JSON envelope to stdout.

use chrono::{DateTime, Utc};

use crate::embedding::EmbeddingClient;
use crate::error::Result;
use crate::recall::{RecallEnvelope, RecallQuery, recall};
use crate::storage::AgenrPool;
use crate::types::{EntryKind, Expiry, Platform, Scope};

#[derive(Debug, Clone, Default)]
pub struct RecallArgs {
    pub text: Option<String>,
    pub limit: usize,
    pub types: Vec<String>,
    pub tags: Vec<String>,
    pub min_importance: Option<u8>,
    pub since: Option<String>,
    pub until: Option<String>,
    pub expiry: Option<String>,
    pub scope: Option<String>,
    pub context: Option<String>,
    pub budget: Option<u32>,
    pub platform: Option<String>,
    pub project: Option<String>,
    pub exclude_project: Option<String>,
    pub project_strict: bool,
    pub browse: bool,
    pub no_boost: bool,
    pub no_update: bool,
}

fn parse_rfc3339(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s).ok().map(|dt| dt.with_timezone(&Utc))
}

impl From<&RecallArgs> for RecallQuery {
    fn from(args: &RecallArgs) -> Self {
        RecallQuery {
            text: args.text.clone(),
            limit: args.limit,
            types: args.types.iter().filter_map(|t| EntryKind::parse(t)).collect(),
            tags: args.tags.clone(),
            min_importance: args.min_importance,
            since: args.since.as_deref().and_then(parse_rfc3339),
            until: args.until.as_deref().and_then(parse_rfc3339),
            around: None,
            radius: None,
            expiry: args.expiry.as_deref().and_then(Expiry::parse),
            scope: args.scope.as_deref().and_then(Scope::parse),
            context: args.context.clone(),
            budget: args.budget,
            platform: args.platform.as_deref().and_then(Platform::parse),
            project: args.project.clone(),
            exclude_project: args.exclude_project.clone(),
            project_strict: args.project_strict,
            browse: args.browse,
            no_boost: args.no_boost,
            no_update: args.no_update,
        }
    }
}

pub async fn run(
    pool: &AgenrPool,
    embedder: &dyn EmbeddingClient,
    args: &RecallArgs,
) -> Result<RecallEnvelope> {
    let query = RecallQuery::from(args);
    recall(pool, embedder, &query).await
}
