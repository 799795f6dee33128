//! OpenAI-compatible HTTP gateway.
//!
//! One concrete adapter speaking the chat-completions wire shape shared by
//! OpenAI, OpenRouter, and most self-hosted inference servers. Provider
//! idiosyncrasies beyond this shape are out of scope; callers plug in their
//! own [`ModelGateway`](super::ModelGateway) implementations for those.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;

use super::{GatewayError, ModelGateway};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(120);

/// Gateway for any endpoint exposing `POST {base_url}/chat/completions`.
pub struct OpenAiCompatGateway {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    timeout: Duration,
}

impl OpenAiCompatGateway {
    /// Build an adapter for the given base URL (e.g.
    /// `https://openrouter.ai/api/v1`) with the default timeout.
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Result<Self, GatewayError> {
        Self::with_timeout(base_url, api_key, DEFAULT_TIMEOUT)
    }

    pub fn with_timeout(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, GatewayError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| GatewayError::Network(e.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            timeout,
        })
    }
}

#[async_trait]
impl ModelGateway for OpenAiCompatGateway {
    async fn invoke(&self, model: &str, prompt: &str) -> Result<String, GatewayError> {
        let url = format!("{}/chat/completions", self.base_url);
        let body = json!({
            "model": model,
            "messages": [{"role": "user", "content": prompt}],
        });

        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    GatewayError::Timeout(self.timeout)
                } else {
                    GatewayError::Network(e.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(match status.as_u16() {
                401 | 403 => GatewayError::Auth(format!("{status}: {detail}")),
                429 => GatewayError::RateLimited(detail),
                _ => GatewayError::Network(format!("{status}: {detail}")),
            });
        }

        let payload: serde_json::Value = response
            .json()
            .await
            .map_err(|e| GatewayError::MalformedResponse(e.to_string()))?;

        let content = payload["choices"][0]["message"]["content"]
            .as_str()
            .ok_or_else(|| {
                GatewayError::MalformedResponse("missing choices[0].message.content".to_string())
            })?;

        if content.trim().is_empty() {
            return Err(GatewayError::MalformedResponse(
                "empty completion content".to_string(),
            ));
        }

        Ok(content.to_string())
    }
}
