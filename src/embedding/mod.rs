//! Embedding module - text to vectors
//!
//! - `OllamaEmbedding`: Ollama `/api/embed` (default `nomic-embed-text`)
//! - `HashEmbedding`: offline feature-hashing embedder, selected with
//!   `EMBEDDING_MODEL=hash`
//!
//! ## Usage
//! ```rust,ignore
//! let embedder = create_embedder(&config)?;
//! let vectors = embedder.embed_batch(&texts).await?;
//! ```

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::config::RagConfig;
use crate::error::{query_hash, EmbedTarget, RagError, Result};

// ============================================================================
// EmbeddingProvider Trait
// ============================================================================

/// Embedding provider
///
/// Same text, same vector for a fixed model configuration.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Embed a single text (a query)
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;

    /// Embed a batch; output order matches input order.
    ///
    /// Default: one `embed` call per item, failing on the first bad item.
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let mut results = Vec::with_capacity(texts.len());
        for (i, text) in texts.iter().enumerate() {
            let vector = self.embed(text).await.map_err(|e| retarget(e, i))?;
            results.push(vector);
        }
        Ok(results)
    }

    /// Output dimensionality, when known before the first call
    fn dimension(&self) -> Option<usize>;

    /// Model name
    fn name(&self) -> &str;
}

/// Re-point an embedding error at batch item `index`
fn retarget(err: RagError, index: usize) -> RagError {
    match err {
        RagError::Embedding { reason, .. } => RagError::Embedding {
            target: EmbedTarget::Item(index),
            reason,
        },
        other => other,
    }
}

// ============================================================================
// Ollama Embedding
// ============================================================================

/// Attempts per item once a batch has been split up
const MAX_ATTEMPTS: u32 = 3;
/// Backoff before the second attempt; doubles afterwards
const INITIAL_BACKOFF_MS: u64 = 500;

/// Ollama `/api/embed` client
///
/// ref: https://github.com/ollama/ollama/blob/main/docs/api.md#generate-embeddings
#[derive(Debug, Clone)]
pub struct OllamaEmbedding {
    client: reqwest::Client,
    base_url: String,
    model: String,
    timeout: Duration,
    initial_backoff: Duration,
}

#[derive(Debug, Serialize)]
struct EmbedRequest<'a> {
    model: &'a str,
    input: &'a [String],
}

#[derive(Debug, Deserialize)]
struct EmbedResponse {
    embeddings: Vec<Vec<f32>>,
}

#[derive(Debug, Deserialize)]
struct OllamaErrorBody {
    error: String,
}

/// Why a single HTTP round trip failed
#[derive(Debug)]
enum CallError {
    TimedOut,
    /// Worth another attempt (transport error, 429, 5xx)
    Transient(String),
    /// Will fail the same way again (bad model name, malformed response)
    Fatal(String),
}

impl CallError {
    fn into_rag(self, target: EmbedTarget, after: Duration) -> RagError {
        match self {
            CallError::TimedOut => RagError::timeout(format!("embedding {}", target), after),
            CallError::Transient(reason) | CallError::Fatal(reason) => {
                RagError::Embedding { target, reason }
            }
        }
    }
}

impl OllamaEmbedding {
    /// # Arguments
    /// * `base_url` - Ollama server, e.g. `http://localhost:11434`
    /// * `model` - embedding model name
    /// * `timeout` - per-request deadline
    pub fn new(base_url: &str, model: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| RagError::InvalidConfig(format!("HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            model: model.to_string(),
            timeout,
            initial_backoff: Duration::from_millis(INITIAL_BACKOFF_MS),
        })
    }

    pub fn from_config(config: &RagConfig) -> Result<Self> {
        Self::new(
            &config.ollama_url,
            &config.embedding_model,
            config.request_timeout(),
        )
    }

    /// Override the retry backoff (tests use a tiny one)
    pub fn with_backoff(mut self, initial: Duration) -> Self {
        self.initial_backoff = initial;
        self
    }

    /// One `/api/embed` round trip
    async fn request(&self, input: &[String]) -> std::result::Result<Vec<Vec<f32>>, CallError> {
        let url = format!("{}/api/embed", self.base_url);
        let response = self
            .client
            .post(&url)
            .json(&EmbedRequest {
                model: &self.model,
                input,
            })
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    CallError::TimedOut
                } else {
                    CallError::Transient(format!("request to {} failed: {}", url, e))
                }
            })?;

        let status = response.status();
        let body = response.text().await.map_err(|e| {
            if e.is_timeout() {
                CallError::TimedOut
            } else {
                CallError::Transient(format!("failed to read response body: {}", e))
            }
        })?;

        if !status.is_success() {
            let message = serde_json::from_str::<OllamaErrorBody>(&body)
                .map(|b| b.error)
                .unwrap_or(body);
            let reason = format!("Ollama API error ({}): {}", status, message);
            return Err(if status.as_u16() == 429 || status.is_server_error() {
                CallError::Transient(reason)
            } else {
                CallError::Fatal(reason)
            });
        }

        let parsed: EmbedResponse = serde_json::from_str(&body)
            .map_err(|e| CallError::Fatal(format!("failed to parse embedding response: {}", e)))?;

        if parsed.embeddings.len() != input.len() {
            return Err(CallError::Fatal(format!(
                "expected {} embeddings, got {}",
                input.len(),
                parsed.embeddings.len()
            )));
        }
        Ok(parsed.embeddings)
    }

    /// Embed one text with retries and exponential backoff
    async fn embed_with_retry(&self, text: &str, target: EmbedTarget) -> Result<Vec<f32>> {
        let input = [text.to_string()];
        let mut attempt = 0;

        loop {
            let err = match self.request(&input).await {
                Ok(mut vectors) => return Ok(vectors.remove(0)),
                Err(err @ CallError::Fatal(_)) => return Err(err.into_rag(target, self.timeout)),
                Err(err) => err,
            };

            attempt += 1;
            if attempt >= MAX_ATTEMPTS {
                return Err(err.into_rag(target, self.timeout));
            }

            let backoff = self.initial_backoff * 2u32.pow(attempt - 1);
            tracing::warn!(
                "Embedding {} failed ({:?}), retrying in {:?} (attempt {}/{})",
                target,
                err,
                backoff,
                attempt + 1,
                MAX_ATTEMPTS
            );
            tokio::time::sleep(backoff).await;
        }
    }
}

#[async_trait]
impl EmbeddingProvider for OllamaEmbedding {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        self.embed_with_retry(text, EmbedTarget::Query(query_hash(text)))
            .await
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(vec![]);
        }

        match self.request(texts).await {
            Ok(vectors) => return Ok(vectors),
            Err(err) => tracing::warn!(
                "Batch of {} failed ({:?}), embedding items one by one",
                texts.len(),
                err
            ),
        }

        // isolate the bad item; the others still get their vectors
        let mut results = Vec::with_capacity(texts.len());
        for (i, text) in texts.iter().enumerate() {
            results.push(self.embed_with_retry(text, EmbedTarget::Item(i)).await?);
        }
        Ok(results)
    }

    fn dimension(&self) -> Option<usize> {
        None
    }

    fn name(&self) -> &str {
        &self.model
    }
}

// ============================================================================
// Hash Embedding
// ============================================================================

/// Model name that selects [`HashEmbedding`]
pub const HASH_MODEL: &str = "hash";

/// Default dimensionality of [`HashEmbedding`]
pub const HASH_DIMENSION: usize = 384;

/// Offline embedder: signed feature hashing of lowercase word tokens, L2-normalised.
///
/// Texts sharing words score higher; no semantics beyond that.
#[derive(Debug, Clone)]
pub struct HashEmbedding {
    dimension: usize,
}

impl Default for HashEmbedding {
    fn default() -> Self {
        Self {
            dimension: HASH_DIMENSION,
        }
    }
}

impl HashEmbedding {
    pub fn new(dimension: usize) -> Result<Self> {
        if dimension == 0 {
            return Err(RagError::InvalidConfig(
                "hash embedding dimension must be positive".to_string(),
            ));
        }
        Ok(Self { dimension })
    }

    fn vectorize(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; self.dimension];

        for token in text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
        {
            let digest = Sha256::digest(token.to_lowercase().as_bytes());
            let mut bucket = [0u8; 8];
            bucket.copy_from_slice(&digest[..8]);
            let slot = (u64::from_le_bytes(bucket) % self.dimension as u64) as usize;
            let sign = if digest[8] & 1 == 0 { 1.0 } else { -1.0 };
            vector[slot] += sign;
        }

        let norm: f32 = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            vector.iter_mut().for_each(|x| *x /= norm);
        }
        vector
    }
}

#[async_trait]
impl EmbeddingProvider for HashEmbedding {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        Ok(self.vectorize(text))
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|t| self.vectorize(t)).collect())
    }

    fn dimension(&self) -> Option<usize> {
        Some(self.dimension)
    }

    fn name(&self) -> &str {
        HASH_MODEL
    }
}

// ============================================================================
// Factory Function
// ============================================================================

/// Embedding provider for `config.embedding_model`
pub fn create_embedder(config: &RagConfig) -> Result<Arc<dyn EmbeddingProvider>> {
    if config.embedding_model == HASH_MODEL {
        tracing::info!("Using offline hash embedding (dimension: {})", HASH_DIMENSION);
        return Ok(Arc::new(HashEmbedding::default()));
    }

    let embedder = OllamaEmbedding::from_config(config)?;
    tracing::info!(
        "Using Ollama embedding '{}' at {}",
        config.embedding_model,
        config.ollama_url
    );
    Ok(Arc::new(embedder))
}

// ============================================================================
// Tests
// ============================================================================
