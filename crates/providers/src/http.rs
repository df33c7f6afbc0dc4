//! HTTP providers for OpenAI-compatible endpoints.
//!
//! `HttpEmbedder` talks to `/embeddings`, `HttpReflector` to
//! `/chat/completions`. Both work against OpenAI, Azure OpenAI, and any
//! compatible proxy, authenticate with a Bearer key, and retry transport
//! failures per the configured policy.

use crate::parsing::{
    format_prior_facts, format_turns, parse_fact_proposals, parse_reflection_actions,
    CONSOLIDATION_PROMPT, REFLECTION_PROMPT,
};
use crate::retry::with_retry;
use async_trait::async_trait;
use engram_core::config::RetryConfig;
use engram_core::error::ProviderError;
use engram_core::fact::Fact;
use engram_core::provider::{Embedder, Reflector, ReflectorOutput};
use engram_core::turn::Turn;
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;
use tracing::debug;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Known embedding model dimensions; overridable via `with_dimension`.
fn model_dimension(model: &str) -> usize {
    match model {
        "text-embedding-3-large" => 3072,
        "text-embedding-3-small" | "text-embedding-ada-002" => 1536,
        _ => 1536,
    }
}

fn map_transport_error(e: reqwest::Error) -> ProviderError {
    if e.is_timeout() {
        ProviderError::Timeout(e.to_string())
    } else {
        ProviderError::Network(e.to_string())
    }
}

async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, ProviderError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let code = status.as_u16();
    let body = response.text().await.unwrap_or_default();
    if code == 401 || code == 403 {
        return Err(ProviderError::AuthenticationFailed(body));
    }
    Err(ProviderError::Api {
        status_code: code,
        message: body,
    })
}

fn build_client(timeout: Duration) -> Result<reqwest::Client, ProviderError> {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| ProviderError::NotConfigured(format!("Failed to create HTTP client: {e}")))
}

// ── Embedder ──────────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct EmbeddingsResponse {
    data: Vec<EmbeddingItem>,
}

#[derive(Deserialize)]
struct EmbeddingItem {
    index: usize,
    embedding: Vec<f32>,
}

/// Embedder backed by an OpenAI-compatible `/embeddings` endpoint.
pub struct HttpEmbedder {
    base_url: String,
    model: String,
    api_key: Option<String>,
    dimension: usize,
    retry: RetryConfig,
    client: reqwest::Client,
}

impl HttpEmbedder {
    pub fn new(
        base_url: impl Into<String>,
        model: impl Into<String>,
    ) -> Result<Self, ProviderError> {
        let model = model.into();
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            dimension: model_dimension(&model),
            model,
            api_key: None,
            retry: RetryConfig::default(),
            client: build_client(DEFAULT_TIMEOUT)?,
        })
    }

    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    pub fn with_dimension(mut self, dimension: usize) -> Self {
        self.dimension = dimension;
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Result<Self, ProviderError> {
        self.client = build_client(timeout)?;
        Ok(self)
    }

    async fn request(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ProviderError> {
        let url = format!("{}/embeddings", self.base_url);
        let mut req = self.client.post(&url).json(&json!({
            "model": self.model,
            "input": texts,
        }));
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key);
        }

        let response = req.send().await.map_err(map_transport_error)?;
        let response = check_status(response).await?;
        let parsed: EmbeddingsResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::InvalidResponse(e.to_string()))?;

        if parsed.data.len() != texts.len() {
            return Err(ProviderError::InvalidResponse(format!(
                "expected {} embeddings, got {}",
                texts.len(),
                parsed.data.len()
            )));
        }

        // The API may return items out of order; restore input order.
        let mut items = parsed.data;
        items.sort_by_key(|item| item.index);
        Ok(items.into_iter().map(|item| item.embedding).collect())
    }
}

#[async_trait]
impl Embedder for HttpEmbedder {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ProviderError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        debug!(count = texts.len(), model = %self.model, "Requesting embeddings");
        with_retry("embed", &self.retry, || self.request(texts)).await
    }

    fn dimension(&self) -> usize {
        self.dimension
    }
}

// ── Reflector ─────────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Deserialize)]
struct ChatMessage {
    content: String,
}

/// Reflector backed by an OpenAI-compatible `/chat/completions` endpoint.
///
/// Produces bare fact proposals when no prior facts are in scope, and typed
/// consolidation actions otherwise.
pub struct HttpReflector {
    base_url: String,
    model: String,
    api_key: Option<String>,
    max_facts: usize,
    retry: RetryConfig,
    client: reqwest::Client,
}

impl HttpReflector {
    pub fn new(
        base_url: impl Into<String>,
        model: impl Into<String>,
    ) -> Result<Self, ProviderError> {
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            model: model.into(),
            api_key: None,
            max_facts: 5,
            retry: RetryConfig::default(),
            client: build_client(Duration::from_secs(60))?,
        })
    }

    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    pub fn with_max_facts(mut self, max_facts: usize) -> Self {
        self.max_facts = max_facts;
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    async fn complete(&self, prompt: &str) -> Result<String, ProviderError> {
        let url = format!("{}/chat/completions", self.base_url);
        let mut req = self.client.post(&url).json(&json!({
            "model": self.model,
            "messages": [{"role": "user", "content": prompt}],
            "temperature": 0.2,
        }));
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key);
        }

        let response = req.send().await.map_err(map_transport_error)?;
        let response = check_status(response).await?;
        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::InvalidResponse(e.to_string()))?;

        parsed
            .choices
            .into_iter()
            .next()
            .map(|choice| choice.message.content)
            .ok_or_else(|| ProviderError::InvalidResponse("response had no choices".into()))
    }
}

#[async_trait]
impl Reflector for HttpReflector {
    async fn reflect(
        &self,
        existing_facts: &[Fact],
        turns: &[Turn],
    ) -> Result<ReflectorOutput, ProviderError> {
        if turns.is_empty() {
            return Ok(ReflectorOutput::Proposals(Vec::new()));
        }

        let rendered_turns = format_turns(turns);
        if existing_facts.is_empty() {
            let prompt = REFLECTION_PROMPT
                .replace("{turns}", &rendered_turns)
                .replace("{max_facts}", &self.max_facts.to_string());
            let content = with_retry("reflect", &self.retry, || self.complete(&prompt)).await?;
            let (proposals, skipped) = parse_fact_proposals(&content);
            debug!(
                proposals = proposals.len(),
                skipped, "Parsed initial reflection output"
            );
            Ok(ReflectorOutput::Proposals(proposals))
        } else {
            let prompt = CONSOLIDATION_PROMPT
                .replace("{prior_facts}", &format_prior_facts(existing_facts))
                .replace("{turns}", &rendered_turns);
            let content = with_retry("reflect", &self.retry, || self.complete(&prompt)).await?;
            let (actions, skipped) = parse_reflection_actions(&content);
            debug!(
                actions = actions.len(),
                skipped, "Parsed consolidation output"
            );
            Ok(ReflectorOutput::Actions(actions))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn embedder_defaults_dimension_from_model() {
        let embedder = HttpEmbedder::new("https://api.openai.com/v1", "text-embedding-3-large")
            .unwrap();
        assert_eq!(embedder.dimension(), 3072);

        let embedder = HttpEmbedder::new("https://api.openai.com/v1/", "custom-model")
            .unwrap()
            .with_dimension(768);
        assert_eq!(embedder.dimension(), 768);
        assert_eq!(embedder.base_url, "https://api.openai.com/v1");
    }

    #[test]
    fn reflector_builder_settings() {
        let reflector = HttpReflector::new("http://localhost:8000/v1", "gpt-4o-mini")
            .unwrap()
            .with_max_facts(8)
            .with_api_key("sk-test");
        assert_eq!(reflector.max_facts, 8);
        assert!(reflector.api_key.is_some());
    }
}
