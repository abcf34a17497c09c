// src/embedding/mod.rs
// Embedding client contract (spec.md §6): `embed(texts) -> Vec<Vec<f32>>`,
// length-N arrays of length 1024, in input order.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde_json::json;
use tracing::warn;

use crate::error::{AgenrError, Result};

pub const EMBEDDING_DIMENSIONS: usize = 1024;

#[async_trait]
pub trait EmbeddingClient: Send + Sync {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;
}

const MAX_ATTEMPTS: u32 = 5;
const BASE_BACKOFF_SECS: u64 = 2;
const MAX_BACKOFF_SECS: u64 = 60;

/// `reqwest`-backed embedding client, same retry/backoff idiom as
/// [`crate::llm::client::HttpLlmClient`].
pub struct HttpEmbeddingClient {
    http: Client,
    base_url: String,
    api_key: String,
    model: String,
}

impl HttpEmbeddingClient {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            http: Client::builder()
                .timeout(Duration::from_secs(60))
                .build()
                .unwrap_or_else(|_| Client::new()),
            base_url: base_url.into(),
            api_key: api_key.into(),
            model: model.into(),
        }
    }

    fn backoff_for(attempt: u32) -> Duration {
        let secs = BASE_BACKOFF_SECS.saturating_mul(1u64 << attempt.saturating_sub(1));
        Duration::from_secs(secs.min(MAX_BACKOFF_SECS))
    }
}

#[async_trait]
impl EmbeddingClient for HttpEmbeddingClient {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let body = json!({ "model": self.model, "input": texts });
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let response = self
                .http
                .post(format!("{}/embeddings", self.base_url))
                .bearer_auth(&self.api_key)
                .json(&body)
                .send()
                .await;

            match response {
                Ok(resp) => {
                    let status = resp.status();
                    if status.as_u16() == 401 || status.as_u16() == 403 {
                        return Err(AgenrError::Auth(resp.text().await.unwrap_or_default()));
                    }
                    if !status.is_success() {
                        let text = resp.text().await.unwrap_or_default();
                        if attempt < MAX_ATTEMPTS && (status.as_u16() == 429 || status.is_server_error()) {
                            let backoff = Self::backoff_for(attempt);
                            warn!(status = %status, attempt, ?backoff, "transient embedding error, retrying");
                            tokio::time::sleep(backoff).await;
                            continue;
                        }
                        return Err(AgenrError::TransientRemote(format!("{status}: {text}")));
                    }

                    #[derive(serde::Deserialize)]
                    struct EmbeddingRow {
                        embedding: Vec<f32>,
                    }
                    #[derive(serde::Deserialize)]
                    struct EmbeddingResponse {
                        data: Vec<EmbeddingRow>,
                    }
                    let parsed: EmbeddingResponse = resp.json().await?;
                    return Ok(parsed.data.into_iter().map(|r| r.embedding).collect());
                }
                Err(e) => {
                    if attempt < MAX_ATTEMPTS && (e.is_timeout() || e.is_connect()) {
                        let backoff = Self::backoff_for(attempt);
                        warn!(error = %e, attempt, ?backoff, "embedding request failed, retrying");
                        tokio::time::sleep(backoff).await;
                        continue;
                    }
                    return Err(AgenrError::TransientRemote(e.to_string()));
                }
            }
        }
    }
}

/// Cosine similarity between two equal-length embedding vectors.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        0.0
    } else {
        (dot / (norm_a * norm_b)).clamp(-1.0, 1.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cosine_similarity_identical_vectors_is_one() {
        let v = vec![0.1, 0.2, 0.3, 0.4];
        assert!((cosine_similarity(&v, &v) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn cosine_similarity_orthogonal_vectors_is_zero() {
        let a = vec![1.0, 0.0];
        let b = vec![0.0, 1.0];
        assert!(cosine_similarity(&a, &b).abs() < 1e-6);
    }

    #[test]
    fn cosine_similarity_mismatched_lengths_is_zero() {
        assert_eq!(cosine_similarity(&[1.0, 2.0], &[1.0]), 0.0);
    }
}
