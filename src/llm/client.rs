// src/llm/client.rs
// Concrete reqwest-backed `LlmClient`, grounded on the teacher's
// `llm::http_client::LlmHttpClient` retry loop: exponential backoff on
// 429/5xx and network errors, fast failure on 401/403.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde_json::{Value, json};
use tracing::warn;

use crate::error::{AgenrError, Result};

use super::{AssistantMessage, LlmClient, ToolCall};

const MAX_ATTEMPTS: u32 = 5;
const BASE_BACKOFF_SECS: u64 = 2;
const MAX_BACKOFF_SECS: u64 = 60;

pub struct HttpLlmClient {
    http: Client,
    base_url: String,
    api_key: String,
}

impl HttpLlmClient {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            http: Client::builder()
                .timeout(Duration::from_secs(300))
                .connect_timeout(Duration::from_secs(30))
                .build()
                .unwrap_or_else(|_| Client::new()),
            base_url: base_url.into(),
            api_key: api_key.into(),
        }
    }

    fn backoff_for(attempt: u32) -> Duration {
        let secs = BASE_BACKOFF_SECS.saturating_mul(1u64 << attempt.saturating_sub(1));
        Duration::from_secs(secs.min(MAX_BACKOFF_SECS))
    }
}

#[async_trait]
impl LlmClient for HttpLlmClient {
    async fn stream_simple(&self, model: &str, system_prompt: &str, user_prompt: &str) -> Result<AssistantMessage> {
        let body = json!({
            "model": model,
            "messages": [
                {"role": "system", "content": system_prompt},
                {"role": "user", "content": user_prompt},
            ],
        });

        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let response = self
                .http
                .post(format!("{}/chat/completions", self.base_url))
                .bearer_auth(&self.api_key)
                .json(&body)
                .send()
                .await;

            match response {
                Ok(resp) => {
                    let status = resp.status();
                    if status.as_u16() == 401 || status.as_u16() == 403 {
                        let text = resp.text().await.unwrap_or_default();
                        return Err(AgenrError::Auth(text));
                    }
                    if !status.is_success() {
                        let text = resp.text().await.unwrap_or_default();
                        if attempt < MAX_ATTEMPTS && (status.as_u16() == 429 || status.is_server_error()) {
                            let backoff = Self::backoff_for(attempt);
                            warn!(status = %status, attempt, ?backoff, "transient LLM error, retrying");
                            tokio::time::sleep(backoff).await;
                            continue;
                        }
                        return Err(AgenrError::TransientRemote(format!("{status}: {text}")));
                    }
                    let value: Value = resp.json().await?;
                    return Ok(parse_assistant_message(&value));
                }
                Err(e) => {
                    if attempt < MAX_ATTEMPTS && (e.is_timeout() || e.is_connect()) {
                        let backoff = Self::backoff_for(attempt);
                        warn!(error = %e, attempt, ?backoff, "LLM request failed, retrying");
                        tokio::time::sleep(backoff).await;
                        continue;
                    }
                    return Err(AgenrError::TransientRemote(e.to_string()));
                }
            }
        }
    }
}

fn parse_assistant_message(value: &Value) -> AssistantMessage {
    let choice = &value["choices"][0]["message"];
    let text = choice
        .get("content")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();

    let tool_calls = choice
        .get("tool_calls")
        .and_then(Value::as_array)
        .map(|calls| {
            calls
                .iter()
                .filter_map(|c| {
                    let name = c["function"]["name"].as_str()?.to_string();
                    let args_raw = c["function"]["arguments"].as_str().unwrap_or("{}");
                    let arguments = serde_json::from_str(args_raw).unwrap_or(Value::Null);
                    Some(ToolCall { name, arguments })
                })
                .collect()
        })
        .unwrap_or_default();

    AssistantMessage { text, tool_calls }
}
