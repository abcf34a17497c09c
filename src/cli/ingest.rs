// src/cli/ingest.rs
// One-shot ingestion (spec.md §4.I's non-watch sibling): run the same
// parse -> chunk -> extract -> local dedup -> write queue pipeline the
// watcher runs per tick, but driven by an explicit file or directory
// argument instead of a resolved active session file.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{info, warn};

use crate::dedup::fold_local_duplicates;
use crate::error::Result;
use crate::extract::Extractor;
use crate::queue::WriteQueue;
use crate::storage::{AgenrPool, StoreOptions, bulk};
use crate::transcript::{ChunkerConfig, parse_and_chunk};

pub struct IngestOptions {
    pub force: bool,
    pub dry_run: bool,
    pub bulk: bool,
    pub verbose: bool,
}

/// Ingest `path`: a single transcript file, or a directory walked
/// recursively for `.jsonl` files. Returns the total number of entries
/// stored (added + updated) across every file ingested.
pub async fn run(
    path: &Path,
    pool: &AgenrPool,
    extractor: &Extractor,
    queue: &WriteQueue,
    options: &IngestOptions,
) -> Result<usize> {
    let files = collect_files(path);
    if files.is_empty() {
        warn!(path = %path.display(), "no transcript files found to ingest");
        return Ok(0);
    }

    let mut total_stored = 0usize;
    for file in &files {
        match ingest_one(file, pool, extractor, queue, options).await {
            Ok(stored) => total_stored += stored,
            Err(e) => warn!(path = %file.display(), error = %e, "failed to ingest file"),
        }
    }
    Ok(total_stored)
}

fn collect_files(path: &Path) -> Vec<PathBuf> {
    if path.is_file() {
        return vec![path.to_path_buf()];
    }
    walkdir::WalkDir::new(path)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter(|e| e.path().extension().and_then(|x| x.to_str()) == Some("jsonl"))
        .map(|e| e.path().to_path_buf())
        .collect()
}

async fn ingest_one(
    path: &Path,
    pool: &AgenrPool,
    extractor: &Extractor,
    queue: &WriteQueue,
    options: &IngestOptions,
) -> Result<usize> {
    let file_text = std::fs::read_to_string(path)?;
    let content_hash = crate::hashing::content_hash(&file_text);
    let file_key = path.to_string_lossy().to_string();

    if !options.force && crate::storage::ingest_log::already_ingested(pool, &file_key, &content_hash).await? {
        info!(path = %path.display(), "already ingested, skipping (use --force to re-ingest)");
        return Ok(0);
    }

    let (_output, chunks) = parse_and_chunk(path, ChunkerConfig::default(), None, None)?;
    if chunks.is_empty() {
        return Ok(0);
    }

    let result = extractor.extract(path, &chunks).await;
    for warning in &result.warnings {
        warn!("{warning}");
    }
    if options.verbose {
        info!(
            path = %path.display(),
            chunks = chunks.len(),
            extracted = result.entries.len(),
            successful_chunks = result.successful_chunks,
            failed_chunks = result.failed_chunks,
            "extracted entries from file"
        );
    }

    let deduped = fold_local_duplicates(result.entries);
    if deduped.is_empty() {
        return Ok(0);
    }

    if options.bulk {
        let store_result = bulk::store_entries_bulk(pool, &file_key, &content_hash, deduped).await?;
        return Ok((store_result.added + store_result.updated) as usize);
    }

    let store_options = StoreOptions {
        force: options.force,
        dry_run: options.dry_run,
        ..StoreOptions::default()
    };
    let stored = queue.push(deduped, file_key, content_hash, store_options).await?;
    Ok((stored.added + stored.updated) as usize)
}
