// src/cli/clients.rs
// External-collaborator construction from `Config`, grounded on the
// teacher's `cli::clients::get_embeddings_from_config` — build the concrete
// HTTP-backed clients once at process startup and hand trait objects to
// the rest of the program, which never sees a provider name or an API key.

use std::sync::Arc;

use crate::config::Config;
use crate::embedding::{EmbeddingClient, HttpEmbeddingClient};
use crate::extract::{Extractor, ExtractorOptions};
use crate::llm::LlmClient;
use crate::llm::client::HttpLlmClient;
use crate::queue::WriteQueue;
use crate::storage::AgenrPool;

const DEFAULT_OPENAI_BASE_URL: &str = "https://api.openai.com/v1";
const DEFAULT_WATERMARK: usize = 2000;

fn credential_for(config: &Config, provider: &str) -> String {
    config
        .credentials
        .get(provider)
        .cloned()
        .or_else(|| std::env::var(format!("{}_API_KEY", provider.to_uppercase())).ok())
        .unwrap_or_default()
}

pub fn build_embedder(config: &Config) -> Arc<dyn EmbeddingClient> {
    let api_key = config
        .embedding
        .api_key
        .clone()
        .unwrap_or_else(|| credential_for(config, &config.embedding.provider));
    Arc::new(HttpEmbeddingClient::new(
        DEFAULT_OPENAI_BASE_URL,
        api_key,
        config.embedding.model.clone(),
    ))
}

pub fn build_llm(config: &Config) -> Arc<dyn LlmClient> {
    let provider = config.provider.clone().unwrap_or_else(|| "openai".to_string());
    let api_key = credential_for(config, &provider);
    Arc::new(HttpLlmClient::new(DEFAULT_OPENAI_BASE_URL, api_key))
}

pub async fn open_pool(config: &Config) -> crate::error::Result<AgenrPool> {
    AgenrPool::open(&config.db_path()).await
}

pub fn build_extractor(config: &Config, llm: Arc<dyn LlmClient>, verbose: bool) -> Extractor {
    let model = config
        .models
        .extraction
        .clone()
        .or_else(|| config.model.clone())
        .unwrap_or_else(|| "gpt-4o-mini".to_string());
    let log_dir = if verbose {
        Some(Config::state_dir().join("ingest-logs"))
    } else {
        None
    };
    Extractor::new(llm, model, log_dir, ExtractorOptions { verbose, ..ExtractorOptions::default() })
}

pub fn spawn_write_queue(
    pool: AgenrPool,
    embedder: Arc<dyn EmbeddingClient>,
    llm: Arc<dyn LlmClient>,
    config: &Config,
) -> WriteQueue {
    let judge_model = config
        .models
        .contradiction_judge
        .clone()
        .or_else(|| config.model.clone())
        .unwrap_or_else(|| "gpt-4o-mini".to_string());
    WriteQueue::spawn(pool, embedder, Some(llm), judge_model, DEFAULT_WATERMARK, true)
}
