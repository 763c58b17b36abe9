//! Provider clients and the provider registry.
//!
//! A provider is an external model-serving backend. The orchestrator talks to
//! every backend through [`ProviderClient`]; this module ships:
//! - [`EchoProvider`]: offline provider for demos and tests
//! - [`OpenAiProvider`]: OpenAI chat completions API
//! - [`AnthropicProvider`]: Anthropic messages API
//! - [`LlamaCppProvider`]: local llama.cpp server
//!
//! ## Environment Variables
//!
//! - `OPENAI_API_KEY`: required by [`OpenAiProvider::from_env`]
//! - `ANTHROPIC_API_KEY`: required by [`AnthropicProvider::from_env`]
//! - `LLAMA_CPP_URL`: llama.cpp server URL (default: http://localhost:8080)

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::catalog::ModelDescriptor;

/// Payload of one provider call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationRequest {
    /// Fully rendered prompt.
    pub prompt: String,
    /// Completion token cap. Clamped to the model's `max_tokens`.
    pub max_tokens: u32,
    /// Sampling temperature.
    pub temperature: f32,
}

impl GenerationRequest {
    /// Request with default sampling settings.
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            max_tokens: 2048,
            temperature: 0.2,
        }
    }

    /// Set the completion token cap.
    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    /// Set the sampling temperature.
    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }
}

/// Failure reported by a provider client.
///
/// The dispatch layer treats every variant the same way: as a retryable
/// provider error.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ProviderFailure {
    /// Missing or rejected credentials.
    #[error("authentication failed: {0}")]
    Authentication(String),
    /// The provider throttled the request.
    #[error("rate limited: {0}")]
    RateLimited(String),
    /// Connection, DNS or transport failure.
    #[error("network error: {0}")]
    Network(String),
    /// The provider answered with an error status or an unusable body.
    #[error("api error {status}: {message}")]
    Api {
        /// HTTP status code, or 0 for a malformed body.
        status: u16,
        /// Provider-supplied message.
        message: String,
    },
}

/// A model-serving backend.
///
/// Implementations must be `Send + Sync`; the registry stores them as
/// `Arc<dyn ProviderClient>`.
#[async_trait]
pub trait ProviderClient: Send + Sync {
    /// Generate text for `request` with `model`.
    async fn generate(
        &self,
        request: &GenerationRequest,
        model: &ModelDescriptor,
    ) -> Result<String, ProviderFailure>;
}

/// Provider name → client lookup.
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    clients: HashMap<String, Arc<dyn ProviderClient>>,
}

impl std::fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<_> = self.clients.keys().collect();
        names.sort();
        f.debug_struct("ProviderRegistry")
            .field("providers", &names)
            .finish()
    }
}

impl ProviderRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) the client for `provider`.
    pub fn register(&mut self, provider: impl Into<String>, client: Arc<dyn ProviderClient>) {
        self.clients.insert(provider.into(), client);
    }

    /// Builder form of [`ProviderRegistry::register`].
    pub fn with(mut self, provider: impl Into<String>, client: Arc<dyn ProviderClient>) -> Self {
        self.register(provider, client);
        self
    }

    /// Client for `provider`, if registered.
    pub fn get(&self, provider: &str) -> Option<Arc<dyn ProviderClient>> {
        self.clients.get(provider).cloned()
    }

    /// Number of registered providers.
    pub fn len(&self) -> usize {
        self.clients.len()
    }

    /// Whether no provider is registered.
    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }
}

fn classify_status(status: reqwest::StatusCode, body: String) -> ProviderFailure {
    match status.as_u16() {
        401 | 403 => ProviderFailure::Authentication(body),
        429 => ProviderFailure::RateLimited(body),
        code => ProviderFailure::Api {
            status: code,
            message: body,
        },
    }
}

fn effective_max_tokens(request: &GenerationRequest, model: &ModelDescriptor) -> u32 {
    request.max_tokens.min(model.max_tokens).max(1)
}

// ============================================================================
// Echo Provider (offline)
// ============================================================================

/// Offline provider that answers with a fenced echo of the prompt.
///
/// Useful for demos and smoke tests without network access.
#[derive(Debug, Clone, Default)]
pub struct EchoProvider {
    /// Simulated latency.
    pub delay: Duration,
}

impl EchoProvider {
    /// Echo provider with no latency.
    pub fn new() -> Self {
        Self::default()
    }

    /// Echo provider that sleeps before answering.
    pub fn with_delay(delay: Duration) -> Self {
        Self { delay }
    }
}

#[async_trait]
impl ProviderClient for EchoProvider {
    async fn generate(
        &self,
        request: &GenerationRequest,
        model: &ModelDescriptor,
    ) -> Result<String, ProviderFailure> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let first_line = request.prompt.lines().next().unwrap_or_default();
        Ok(format!(
            "[{}/{}] {}",
            model.provider, model.model_name, first_line
        ))
    }
}

// ============================================================================
// OpenAI Provider
// ============================================================================

#[derive(Debug, Serialize)]
struct OpenAiChatRequest<'a> {
    model: &'a str,
    messages: Vec<OpenAiMessage<'a>>,
    max_tokens: u32,
    temperature: f32,
}

#[derive(Debug, Serialize)]
struct OpenAiMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct OpenAiChatResponse {
    choices: Vec<OpenAiChoice>,
}

#[derive(Debug, Deserialize)]
struct OpenAiChoice {
    message: OpenAiReply,
}

#[derive(Debug, Deserialize)]
struct OpenAiReply {
    content: Option<String>,
}

/// OpenAI chat completions client.
pub struct OpenAiProvider {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
}

impl OpenAiProvider {
    /// Client with an explicit API key.
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key: api_key.into(),
            base_url: "https://api.openai.com/v1".to_string(),
        }
    }

    /// Client reading `OPENAI_API_KEY`.
    ///
    /// # Errors
    ///
    /// Returns [`ProviderFailure::Authentication`] if the variable is unset.
    pub fn from_env() -> Result<Self, ProviderFailure> {
        std::env::var("OPENAI_API_KEY")
            .map(Self::new)
            .map_err(|_| ProviderFailure::Authentication("OPENAI_API_KEY not set".to_string()))
    }

    /// Point the client at an OpenAI-compatible endpoint.
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }
}

#[async_trait]
impl ProviderClient for OpenAiProvider {
    async fn generate(
        &self,
        request: &GenerationRequest,
        model: &ModelDescriptor,
    ) -> Result<String, ProviderFailure> {
        let body = OpenAiChatRequest {
            model: &model.model_name,
            messages: vec![OpenAiMessage {
                role: "user",
                content: &request.prompt,
            }],
            max_tokens: effective_max_tokens(request, model),
            temperature: request.temperature,
        };

        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| ProviderFailure::Network(format!("OpenAI request failed: {e}")))?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(classify_status(status, text));
        }

        let parsed: OpenAiChatResponse = response.json().await.map_err(|e| ProviderFailure::Api {
            status: 0,
            message: format!("failed to parse OpenAI response: {e}"),
        })?;

        parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| ProviderFailure::Api {
                status: 0,
                message: "no choices in OpenAI response".to_string(),
            })
    }
}

// ============================================================================
// Anthropic Provider
// ============================================================================

#[derive(Debug, Serialize)]
struct AnthropicMessagesRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    temperature: f32,
    messages: Vec<OpenAiMessage<'a>>,
}

#[derive(Debug, Deserialize)]
struct AnthropicMessagesResponse {
    content: Vec<AnthropicContent>,
}

#[derive(Debug, Deserialize)]
struct AnthropicContent {
    #[serde(default)]
    text: String,
}

/// Anthropic messages API client.
pub struct AnthropicProvider {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
}

impl AnthropicProvider {
    /// Client with an explicit API key.
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key: api_key.into(),
            base_url: "https://api.anthropic.com/v1".to_string(),
        }
    }

    /// Client reading `ANTHROPIC_API_KEY`.
    ///
    /// # Errors
    ///
    /// Returns [`ProviderFailure::Authentication`] if the variable is unset.
    pub fn from_env() -> Result<Self, ProviderFailure> {
        std::env::var("ANTHROPIC_API_KEY")
            .map(Self::new)
            .map_err(|_| ProviderFailure::Authentication("ANTHROPIC_API_KEY not set".to_string()))
    }
}

#[async_trait]
impl ProviderClient for AnthropicProvider {
    async fn generate(
        &self,
        request: &GenerationRequest,
        model: &ModelDescriptor,
    ) -> Result<String, ProviderFailure> {
        let body = AnthropicMessagesRequest {
            model: &model.model_name,
            max_tokens: effective_max_tokens(request, model),
            temperature: request.temperature,
            messages: vec![OpenAiMessage {
                role: "user",
                content: &request.prompt,
            }],
        };

        let response = self
            .client
            .post(format!("{}/messages", self.base_url))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", "2023-06-01")
            .json(&body)
            .send()
            .await
            .map_err(|e| ProviderFailure::Network(format!("Anthropic request failed: {e}")))?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(classify_status(status, text));
        }

        let parsed: AnthropicMessagesResponse =
            response.json().await.map_err(|e| ProviderFailure::Api {
                status: 0,
                message: format!("failed to parse Anthropic response: {e}"),
            })?;

        let text: String = parsed.content.into_iter().map(|c| c.text).collect();
        if text.is_empty() {
            return Err(ProviderFailure::Api {
                status: 0,
                message: "empty Anthropic response".to_string(),
            });
        }
        Ok(text)
    }
}

// ============================================================================
// llama.cpp Provider
// ============================================================================

#[derive(Debug, Serialize)]
struct LlamaCppRequest<'a> {
    prompt: &'a str,
    n_predict: u32,
    temperature: f32,
}

#[derive(Debug, Deserialize)]
struct LlamaCppResponse {
    content: String,
}

/// Local llama.cpp HTTP server client.
pub struct LlamaCppProvider {
    client: reqwest::Client,
    url: String,
}

impl LlamaCppProvider {
    /// Client for `LLAMA_CPP_URL`, defaulting to http://localhost:8080.
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
            url: std::env::var("LLAMA_CPP_URL")
                .unwrap_or_else(|_| "http://localhost:8080".to_string()),
        }
    }

    /// Override the server URL.
    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = url.into();
        self
    }
}

impl Default for LlamaCppProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ProviderClient for LlamaCppProvider {
    async fn generate(
        &self,
        request: &GenerationRequest,
        model: &ModelDescriptor,
    ) -> Result<String, ProviderFailure> {
        let body = LlamaCppRequest {
            prompt: &request.prompt,
            n_predict: effective_max_tokens(request, model),
            temperature: request.temperature,
        };

        let response = self
            .client
            .post(format!("{}/completion", self.url))
            .json(&body)
            .send()
            .await
            .map_err(|e| ProviderFailure::Network(format!("llama.cpp request failed: {e}")))?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(classify_status(status, text));
        }

        let parsed: LlamaCppResponse = response.json().await.map_err(|e| ProviderFailure::Api {
            status: 0,
            message: format!("failed to parse llama.cpp response: {e}"),
        })?;
        Ok(parsed.content)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_echo_provider_echoes_first_line() {
        let provider = EchoProvider::new();
        let model = ModelDescriptor::new("local", "echo-1");
        let out = provider
            .generate(&GenerationRequest::new("hello world\nsecond line"), &model)
            .await
            .expect("test: echo never fails");
        assert_eq!(out, "[local/echo-1] hello world");
    }

    #[test]
    fn test_registry_lookup_by_provider_name() {
        let registry = ProviderRegistry::new().with("local", Arc::new(EchoProvider::new()));
        assert!(registry.get("local").is_some());
        assert!(registry.get("remote").is_none());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_classify_status_maps_auth_and_rate_limit() {
        assert!(matches!(
            classify_status(reqwest::StatusCode::UNAUTHORIZED, "no".into()),
            ProviderFailure::Authentication(_)
        ));
        assert!(matches!(
            classify_status(reqwest::StatusCode::TOO_MANY_REQUESTS, "slow".into()),
            ProviderFailure::RateLimited(_)
        ));
        assert_eq!(
            classify_status(reqwest::StatusCode::BAD_GATEWAY, "down".into()),
            ProviderFailure::Api {
                status: 502,
                message: "down".into()
            }
        );
    }

    #[test]
    fn test_effective_max_tokens_clamps_to_model() {
        let mut model = ModelDescriptor::new("p", "m");
        model.max_tokens = 100;
        let req = GenerationRequest::new("x").with_max_tokens(5000);
        assert_eq!(effective_max_tokens(&req, &model), 100);
    }
}
