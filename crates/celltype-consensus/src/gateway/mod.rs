//! Model gateway boundary — the single capability the engine consumes from
//! any text-generation provider, plus the caller-owned adapter registry.
//!
//! Every provider is reduced to one contract: `invoke(model, prompt)` yields
//! response text or a typed, non-fatal error. Retry and fallback policy live
//! with the callers (collector: no retries; discussion: exactly one).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

pub mod http;

pub use http::OpenAiCompatGateway;

/// Typed gateway failure. All variants are non-fatal at the call site.
#[derive(Debug, Clone, Error)]
pub enum GatewayError {
    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("rate limited: {0}")]
    RateLimited(String),

    #[error("malformed response: {0}")]
    MalformedResponse(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("cancelled before dispatch")]
    Cancelled,
}

/// Uniform capability exposed by every model adapter.
#[async_trait]
pub trait ModelGateway: Send + Sync {
    /// Send a prompt to the named model and return its raw response text.
    async fn invoke(&self, model: &str, prompt: &str) -> Result<String, GatewayError>;
}

/// Explicit, caller-owned mapping from provider key to adapter instance.
///
/// Constructed once per run and passed into the engine — there is no
/// process-wide registry.
#[derive(Default, Clone)]
pub struct GatewayRegistry {
    gateways: HashMap<String, Arc<dyn ModelGateway>>,
}

impl GatewayRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an adapter under a provider key ("openai", "anthropic", ...).
    /// Keys are normalized to lowercase; re-registering replaces.
    pub fn register(&mut self, provider: impl Into<String>, gateway: Arc<dyn ModelGateway>) {
        self.gateways
            .insert(provider.into().trim().to_ascii_lowercase(), gateway);
    }

    pub fn get(&self, provider: &str) -> Option<Arc<dyn ModelGateway>> {
        self.gateways
            .get(&provider.trim().to_ascii_lowercase())
            .cloned()
    }

    pub fn contains(&self, provider: &str) -> bool {
        self.gateways
            .contains_key(&provider.trim().to_ascii_lowercase())
    }

    pub fn providers(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.gateways.keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn is_empty(&self) -> bool {
        self.gateways.is_empty()
    }
}

impl std::fmt::Debug for GatewayRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatewayRegistry")
            .field("providers", &self.providers())
            .finish()
    }
}

/// Invoke a gateway with an outer deadline. A generic adapter may not enforce
/// its own timeout, so the engine bounds every external call here.
pub async fn invoke_with_timeout(
    gateway: &dyn ModelGateway,
    model: &str,
    prompt: &str,
    timeout: Duration,
) -> Result<String, GatewayError> {
    match tokio::time::timeout(timeout, gateway.invoke(model, prompt)).await {
        Ok(result) => result,
        Err(_) => Err(GatewayError::Timeout(timeout)),
    }
}
