// src/cli/consolidate.rs
// `agenr consolidate` (spec.md §4.H): run both consolidation phases once
// and print the result summary.

use crate::config::Config;
use crate::consolidate::{ConsolidateResult, consolidate};
use crate::embedding::EmbeddingClient;
use crate::error::Result;
use crate::llm::LlmClient;
use crate::queue::WriteQueue;
use crate::storage::AgenrPool;

pub async fn run(
    pool: &AgenrPool,
    embedder: &dyn EmbeddingClient,
    llm: Option<&dyn LlmClient>,
    queue: &WriteQueue,
    config: &Config,
) -> Result<ConsolidateResult> {
    let merge_model = config
        .models
        .contradiction_judge
        .clone()
        .or_else(|| config.model.clone())
        .unwrap_or_else(|| "gpt-4o-mini".to_string());

    consolidate(
        pool,
        embedder,
        llm,
        &merge_model,
        queue,
        &config.forgetting,
        &config.consolidation,
    )
    .await
}
