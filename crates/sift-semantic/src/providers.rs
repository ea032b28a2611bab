//! Embedding providers for generating vector embeddings.

use crate::config::EmbeddingConfig;
use crate::error::{Result, SemanticError};
use crate::types::{normalize, EmbeddingModel, Vector};
use async_trait::async_trait;
use reqwest::Client;
use reqwest::header::{AUTHORIZATION, HeaderMap, HeaderValue};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

const OPENAI_DEFAULT_ENDPOINT: &str = "https://api.openai.com/v1/embeddings";
const OLLAMA_DEFAULT_ENDPOINT: &str = "http://localhost:11434";

/// Trait for embedding providers.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Generate embedding for a single text.
    async fn embed(&self, text: &str) -> Result<Vector>;

    /// Generate embeddings for multiple texts.
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vector>> {
        let mut embeddings = Vec::with_capacity(texts.len());
        for text in texts {
            embeddings.push(self.embed(text).await?);
        }
        Ok(embeddings)
    }

    /// Get the embedding model information.
    fn model(&self) -> &EmbeddingModel;

    /// Get the embedding dimension.
    fn dimension(&self) -> usize {
        self.model().dimension
    }
}

/// Build the provider named by `config`, wrapped with retry and backoff.
pub fn create_provider(config: &EmbeddingConfig) -> Result<Arc<dyn EmbeddingProvider>> {
    config.validate()?;

    let inner: Arc<dyn EmbeddingProvider> = match config.provider.as_str() {
        "openai" => Arc::new(OpenAIProvider::new(config)?),
        "ollama" => Arc::new(OllamaProvider::new(config)?),
        "mock" => Arc::new(MockProvider::with_model(&config.model, config.dimension)),
        other => {
            return Err(SemanticError::Config(format!("Unknown provider: {other}")));
        }
    };

    Ok(Arc::new(RetryingProvider::new(
        inner,
        config.max_retries,
        Duration::from_millis(config.retry_base_ms),
    )))
}

/// Retries retryable embedding failures with exponential backoff.
pub struct RetryingProvider {
    inner: Arc<dyn EmbeddingProvider>,
    max_retries: u32,
    base_delay: Duration,
}

impl RetryingProvider {
    pub fn new(inner: Arc<dyn EmbeddingProvider>, max_retries: u32, base_delay: Duration) -> Self {
        Self {
            inner,
            max_retries,
            base_delay,
        }
    }

    fn delay_for(&self, retry: u32) -> Duration {
        self.base_delay.saturating_mul(1u32 << retry.min(16))
    }
}

#[async_trait]
impl EmbeddingProvider for RetryingProvider {
    async fn embed(&self, text: &str) -> Result<Vector> {
        let mut retry = 0;
        loop {
            match self.inner.embed(text).await {
                Ok(vector) => return Ok(vector),
                Err(e) if e.is_retryable() && retry < self.max_retries => {
                    let delay = self.delay_for(retry);
                    warn!(
                        model = %self.inner.model(),
                        retry = retry + 1,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Embedding request failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    retry += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vector>> {
        let mut retry = 0;
        loop {
            match self.inner.embed_batch(texts).await {
                Ok(vectors) => return Ok(vectors),
                Err(e) if e.is_retryable() && retry < self.max_retries => {
                    tokio::time::sleep(self.delay_for(retry)).await;
                    retry += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn model(&self) -> &EmbeddingModel {
        self.inner.model()
    }
}

/// OpenAI embedding provider.
pub struct OpenAIProvider {
    client: Client,
    endpoint: String,
    model: EmbeddingModel,
}

#[derive(Serialize)]
struct OpenAIRequest<'a> {
    input: &'a [String],
    model: &'a str,
    dimensions: usize,
}

#[derive(Deserialize)]
struct OpenAIResponse {
    data: Vec<OpenAIEmbedding>,
}

#[derive(Deserialize)]
struct OpenAIEmbedding {
    embedding: Vec<f32>,
}

impl OpenAIProvider {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let api_key = config
            .api_key
            .as_deref()
            .ok_or_else(|| SemanticError::Config("OpenAI API key not configured".to_string()))?;

        let mut headers = HeaderMap::new();
        let bearer = HeaderValue::from_str(&format!("Bearer {api_key}"))
            .map_err(|e| SemanticError::Config(format!("Invalid API key: {e}")))?;
        headers.insert(AUTHORIZATION, bearer);

        let client = Client::builder()
            .timeout(config.timeout())
            .default_headers(headers)
            .build()?;

        info!("Initialized OpenAI provider with model: {}", config.model);

        Ok(Self {
            client,
            endpoint: config
                .endpoint
                .clone()
                .unwrap_or_else(|| OPENAI_DEFAULT_ENDPOINT.to_string()),
            model: EmbeddingModel::new("openai", &config.model, config.dimension),
        })
    }
}

#[async_trait]
impl EmbeddingProvider for OpenAIProvider {
    async fn embed(&self, text: &str) -> Result<Vector> {
        self.embed_batch(&[text.to_string()])
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| SemanticError::Provider("OpenAI returned no embedding".to_string()))
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vector>> {
        debug!("Generating {} embeddings with OpenAI", texts.len());

        let request = OpenAIRequest {
            input: texts,
            model: &self.model.model_name,
            dimensions: self.model.dimension,
        };

        let response = self.client.post(&self.endpoint).json(&request).send().await?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            return Err(SemanticError::Api {
                status: status.as_u16(),
                message: format!("OpenAI: {error_text}"),
            });
        }

        let response: OpenAIResponse = response.json().await?;
        let embeddings: Vec<Vector> = response.data.into_iter().map(|e| e.embedding).collect();

        if embeddings.len() != texts.len() {
            return Err(SemanticError::Provider(format!(
                "Expected {} embeddings, got {}",
                texts.len(),
                embeddings.len()
            )));
        }

        Ok(embeddings)
    }

    fn model(&self) -> &EmbeddingModel {
        &self.model
    }
}

/// Ollama embedding provider for local models.
pub struct OllamaProvider {
    client: Client,
    endpoint: String,
    model: EmbeddingModel,
}

#[derive(Serialize)]
struct OllamaRequest<'a> {
    model: &'a str,
    prompt: &'a str,
}

#[derive(Deserialize)]
struct OllamaResponse {
    embedding: Vec<f32>,
}

impl OllamaProvider {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let client = Client::builder().timeout(config.timeout()).build()?;

        info!("Initialized Ollama provider with model: {}", config.model);

        Ok(Self {
            client,
            endpoint: config
                .endpoint
                .clone()
                .unwrap_or_else(|| OLLAMA_DEFAULT_ENDPOINT.to_string()),
            model: EmbeddingModel::ollama(&config.model, config.dimension),
        })
    }
}

#[async_trait]
impl EmbeddingProvider for OllamaProvider {
    async fn embed(&self, text: &str) -> Result<Vector> {
        let request = OllamaRequest {
            model: &self.model.model_name,
            prompt: text,
        };

        let url = format!("{}/api/embeddings", self.endpoint.trim_end_matches('/'));
        let response = self.client.post(&url).json(&request).send().await?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            return Err(SemanticError::Api {
                status: status.as_u16(),
                message: format!("Ollama: {error_text}"),
            });
        }

        let response: OllamaResponse = response.json().await?;
        if response.embedding.len() != self.model.dimension {
            return Err(SemanticError::DimensionMismatch {
                expected: self.model.dimension,
                got: response.embedding.len(),
            });
        }
        Ok(response.embedding)
    }

    fn model(&self) -> &EmbeddingModel {
        &self.model
    }
}

/// Deterministic offline provider.
///
/// Each word is hashed into a bucket, so texts sharing vocabulary land close
/// together. Useful for tests and for running without a model server.
pub struct MockProvider {
    model: EmbeddingModel,
}

impl MockProvider {
    pub fn new(dimension: usize) -> Self {
        Self::with_model("mock-embedding", dimension)
    }

    pub fn with_model(model_name: &str, dimension: usize) -> Self {
        Self {
            model: EmbeddingModel::new("mock", model_name, dimension),
        }
    }

    fn generate_embedding(&self, text: &str) -> Vector {
        let dimension = self.model.dimension.max(1);
        let mut embedding = vec![0.0; dimension];

        for word in text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| !w.is_empty())
        {
            let hash = word
                .to_lowercase()
                .bytes()
                .fold(0xcbf2_9ce4_8422_2325u64, |acc, b| {
                    (acc ^ b as u64).wrapping_mul(0x0100_0000_01b3)
                });
            let bucket = (hash % dimension as u64) as usize;
            let sign = if (hash >> 32) & 1 == 0 { 1.0 } else { -1.0 };
            embedding[bucket] += sign;
        }

        normalize(&mut embedding);
        embedding.truncate(self.model.dimension);
        embedding
    }
}

#[async_trait]
impl EmbeddingProvider for MockProvider {
    async fn embed(&self, text: &str) -> Result<Vector> {
        Ok(self.generate_embedding(text))
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vector>> {
        Ok(texts.iter().map(|t| self.generate_embedding(t)).collect())
    }

    fn model(&self) -> &EmbeddingModel {
        &self.model
    }
}
