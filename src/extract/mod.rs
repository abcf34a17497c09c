// src/extract/mod.rs
// Extractor (spec.md §4.C): streams chunks through an LLM tool call,
// collects validated `KnowledgeEntry` values, retries transient failures,
// and optionally runs an LLM-driven dedup pass with a local-dedup fallback.

pub mod prompt;
pub mod validation;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tracing::warn;

use crate::dedup::fold_local_duplicates;
use crate::error::{AgenrError, Result};
use crate::llm::LlmClient;
use crate::transcript::TranscriptChunk;
use crate::types::{EntrySource, KnowledgeEntry};

pub use validation::validate_raw_entries;

const MAX_ATTEMPTS: u32 = 5;
const BASE_BACKOFF_SECS: u64 = 2;
const MAX_BACKOFF_SECS: u64 = 60;

/// Output of a full extraction run over one file's chunks (spec.md §4.C).
#[derive(Debug, Default)]
pub struct ExtractionResult {
    pub entries: Vec<KnowledgeEntry>,
    pub successful_chunks: usize,
    pub failed_chunks: usize,
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, Copy)]
pub struct ExtractorOptions {
    pub sample_rate: u32,
    pub log_all: bool,
    pub verbose: bool,
    pub dedup: bool,
}

impl Default for ExtractorOptions {
    fn default() -> Self {
        Self {
            sample_rate: 10,
            log_all: false,
            verbose: false,
            dedup: false,
        }
    }
}

pub struct Extractor {
    llm: Arc<dyn LlmClient>,
    model: String,
    log_dir: Option<std::path::PathBuf>,
    options: ExtractorOptions,
}

impl Extractor {
    pub fn new(
        llm: Arc<dyn LlmClient>,
        model: impl Into<String>,
        log_dir: Option<std::path::PathBuf>,
        options: ExtractorOptions,
    ) -> Self {
        Self {
            llm,
            model: model.into(),
            log_dir,
            options,
        }
    }

    /// Run extraction over every chunk of a file, in order.
    pub async fn extract(&self, file_path: &Path, chunks: &[TranscriptChunk]) -> ExtractionResult {
        let mut result = ExtractionResult::default();
        let should_log = self.should_log(file_path);
        let mut per_chunk_entries: Vec<Vec<KnowledgeEntry>> = Vec::with_capacity(chunks.len());

        for chunk in chunks {
            match self.extract_chunk(file_path, chunk, should_log).await {
                Ok(entries) => {
                    result.successful_chunks += 1;
                    per_chunk_entries.push(entries);
                }
                Err(e) => {
                    result.failed_chunks += 1;
                    result.warnings.push(format!(
                        "{}: chunk {} failed: {}",
                        file_path.display(),
                        chunk.chunk_index,
                        e
                    ));
                }
            }
        }

        let flattened: Vec<KnowledgeEntry> = per_chunk_entries.iter().flatten().cloned().collect();

        if self.options.dedup && chunks.len() > 1 && !flattened.is_empty() {
            match self.dedup_via_llm(&flattened).await {
                Ok(deduped) => {
                    result.entries = deduped;
                }
                Err(e) => {
                    warn!(error = %e, "online dedup pass failed, falling back to local deduplicator");
                    result.entries = fold_local_duplicates(flattened);
                }
            }
        } else {
            result.entries = flattened;
        }

        result
    }

    async fn extract_chunk(
        &self,
        file_path: &Path,
        chunk: &TranscriptChunk,
        should_log: bool,
    ) -> Result<Vec<KnowledgeEntry>> {
        let system_prompt = prompt::extraction_system_prompt();
        let user_prompt = prompt::extraction_user_prompt(chunk);

        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let outcome = self.llm.stream_simple(&self.model, &system_prompt, &user_prompt).await;

            match outcome {
                Ok(message) => {
                    let raw_json = message
                        .tool_call("submit_knowledge")
                        .map(|c| c.arguments.clone())
                        .unwrap_or(serde_json::Value::Null);

                    if should_log {
                        self.log_attempt(file_path, chunk.chunk_index, &system_prompt, &user_prompt, &raw_json);
                    }

                    let raw_entries = validation::parse_submit_knowledge(&raw_json);
                    let source = EntrySource::File {
                        path: file_path.to_string_lossy().to_string(),
                    };
                    let (entries, warnings) = validation::validate_raw_entries_with_source(raw_entries, source);
                    for w in warnings {
                        warn!(file = %file_path.display(), chunk = chunk.chunk_index, "{w}");
                    }
                    return Ok(entries);
                }
                Err(e) if is_retryable(&e) && attempt < MAX_ATTEMPTS => {
                    let backoff = backoff_for(attempt);
                    warn!(error = %e, attempt, ?backoff, "transient extraction failure, retrying");
                    tokio::time::sleep(backoff).await;
                    continue;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn dedup_via_llm(&self, entries: &[KnowledgeEntry]) -> Result<Vec<KnowledgeEntry>> {
        let system_prompt = prompt::dedup_system_prompt();
        let user_prompt = prompt::dedup_user_prompt(entries);
        let message = self.llm.stream_simple(&self.model, &system_prompt, &user_prompt).await?;
        let raw_json = message
            .tool_call("submit_deduped_knowledge")
            .map(|c| c.arguments.clone())
            .ok_or_else(|| AgenrError::TransientRemote("no submit_deduped_knowledge tool call".to_string()))?;
        let raw_entries = validation::parse_submit_knowledge(&raw_json);
        let (deduped, _warnings) = validate_raw_entries(raw_entries);
        Ok(deduped)
    }

    fn should_log(&self, file_path: &Path) -> bool {
        if self.log_dir.is_none() {
            return false;
        }
        if self.options.log_all || self.options.sample_rate <= 1 {
            return true;
        }
        let hash = crate::hashing::content_hash(&file_path.to_string_lossy());
        let bucket = u32::from_str_radix(&hash[..8], 16).unwrap_or(0);
        bucket % self.options.sample_rate == 0
    }

    fn log_attempt(
        &self,
        file_path: &Path,
        chunk_index: usize,
        system_prompt: &str,
        user_prompt: &str,
        raw_output: &serde_json::Value,
    ) {
        let Some(dir) = &self.log_dir else { return };
        if std::fs::create_dir_all(dir).is_err() {
            return;
        }
        let ts = chrono::Utc::now().format("%Y%m%dT%H%M%S%.f");
        let stem = format!("ingest_{ts}_chunk{chunk_index}");
        let _ = std::fs::write(
            dir.join(format!("{stem}_input.txt")),
            format!(
                "FILE: {}\nSYSTEM:\n{}\n\nUSER:\n{}\n",
                file_path.display(),
                system_prompt,
                user_prompt
            ),
        );
        let _ = std::fs::write(
            dir.join(format!("{stem}_output.txt")),
            serde_json::to_string_pretty(raw_output).unwrap_or_default(),
        );
    }
}

fn is_retryable(err: &AgenrError) -> bool {
    matches!(err, AgenrError::TransientRemote(_))
}

fn backoff_for(attempt: u32) -> Duration {
    let secs = BASE_BACKOFF_SECS.saturating_mul(1u64 << attempt.saturating_sub(1));
    Duration::from_secs(secs.min(MAX_BACKOFF_SECS))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_caps_at_sixty_seconds() {
        assert_eq!(backoff_for(1), Duration::from_secs(2));
        assert_eq!(backoff_for(5), Duration::from_secs(32));
        assert_eq!(backoff_for(10), Duration::from_secs(60));
    }

    #[test]
    fn retryable_classification_matches_transient_only() {
        assert!(is_retryable(&AgenrError::TransientRemote("x".into())));
        assert!(!is_retryable(&AgenrError::Auth("x".into())));
    }
}
