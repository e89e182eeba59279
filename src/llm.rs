//! Client for the code-generating model endpoint.

use crate::config::AgentConfig;
use crate::error::{AnalysisError, Result};
use async_trait::async_trait;
use std::time::Duration;
use tracing::debug;

/// Anything that can turn a prompt pair into candidate script text.
///
/// The analysis loop depends on this seam rather than on a concrete HTTP
/// client, so tests can script responses without a live endpoint.
#[async_trait]
pub trait CodeGenerator: Send + Sync {
    async fn generate(&self, system_prompt: &str, user_prompt: &str) -> Result<String>;
}

/// OpenAI-compatible chat completions client.
pub struct LlmClient {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    model: String,
    temperature: f64,
    max_tokens: u32,
}

impl LlmClient {
    pub fn new(config: &AgentConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| AnalysisError::Generation(format!("http client setup failed: {}", e)))?;

        Ok(Self {
            client,
            api_key: config.api_key.clone(),
            base_url: config.base_url.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            temperature: config.temperature,
            max_tokens: config.max_tokens,
        })
    }
}

#[async_trait]
impl CodeGenerator for LlmClient {
    async fn generate(&self, system_prompt: &str, user_prompt: &str) -> Result<String> {
        let url = format!("{}/chat/completions", self.base_url);
        let body = serde_json::json!({
            "model": self.model,
            "messages": [
                {"role": "system", "content": system_prompt},
                {"role": "user", "content": user_prompt},
            ],
            "temperature": self.temperature,
            "max_tokens": self.max_tokens,
        });

        debug!(model = %self.model, "requesting code generation");
        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&body)
            .send()
            .await
            .map_err(|e| AnalysisError::Generation(format!("request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(AnalysisError::Generation(format!(
                "model endpoint returned {}: {}",
                status,
                truncate(&detail, 300)
            )));
        }

        let payload: serde_json::Value = response
            .json()
            .await
            .map_err(|e| AnalysisError::Generation(format!("invalid response body: {}", e)))?;

        let content = payload["choices"][0]["message"]["content"]
            .as_str()
            .ok_or_else(|| {
                AnalysisError::Generation("response contained no completion".to_string())
            })?;
        if content.trim().is_empty() {
            return Err(AnalysisError::Generation(
                "model returned an empty completion".to_string(),
            ));
        }
        Ok(content.to_string())
    }
}

fn truncate(text: &str, limit: usize) -> &str {
    match text.char_indices().nth(limit) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}
