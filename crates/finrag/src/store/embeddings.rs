use async_trait::async_trait;
use fastembed::{InitOptions, TextEmbedding};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use super::StoreError;

pub const OPENAI_EMBEDDING_MODEL: &str = "text-embedding-3-small";

/// Turns text into fixed-length vectors
#[async_trait]
pub trait Embedder: Send + Sync {
    /// One vector per input, in input order
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, StoreError>;

    async fn embed_one(&self, text: &str) -> Result<Vec<f32>, StoreError> {
        self.embed(&[text.to_string()])
            .await?
            .pop()
            .ok_or_else(|| StoreError::Embedding("Empty embedding returned".into()))
    }
}

#[derive(Debug, Clone)]
pub struct OpenAiEmbedderConfig {
    pub host: String,
    pub api_key: Option<String>,
    pub model: String,
}

#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a [String],
}

#[derive(Deserialize)]
struct EmbeddingData {
    index: usize,
    embedding: Vec<f32>,
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

/// Client for the OpenAI-compatible `/v1/embeddings` endpoint
#[derive(Clone)]
pub struct OpenAiEmbedder {
    client: Client,
    config: OpenAiEmbedderConfig,
}

impl OpenAiEmbedder {
    pub fn new(config: OpenAiEmbedderConfig) -> Result<Self, StoreError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .map_err(|e| StoreError::Embedding(e.to_string()))?;
        Ok(Self { client, config })
    }
}

#[async_trait]
impl Embedder for OpenAiEmbedder {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, StoreError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let url = format!("{}/v1/embeddings", self.config.host.trim_end_matches('/'));
        let mut request = self.client.post(&url).json(&EmbeddingRequest {
            model: &self.config.model,
            input: texts,
        });
        if let Some(key) = &self.config.api_key {
            request = request.bearer_auth(key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| StoreError::Embedding(format!("Embedding service unavailable: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(StoreError::Embedding(format!(
                "Embedding service returned {}: {}",
                status, body
            )));
        }

        let mut result: EmbeddingResponse = response
            .json()
            .await
            .map_err(|e| StoreError::Embedding(format!("Failed to parse embedding: {}", e)))?;

        if result.data.len() != texts.len() {
            return Err(StoreError::Embedding(format!(
                "Expected {} embeddings, got {}",
                texts.len(),
                result.data.len()
            )));
        }

        result.data.sort_by_key(|d| d.index);
        Ok(result.data.into_iter().map(|d| d.embedding).collect())
    }
}

/// Local ONNX embedding model, used when no embedding service is configured
///
/// The model files are downloaded into the cache directory on first use.
#[derive(Clone)]
pub struct FastEmbedder {
    model: Arc<TextEmbedding>,
}

impl FastEmbedder {
    /// Loads the default model; blocks while the model is fetched and initialized
    pub fn new(cache_dir: Option<PathBuf>) -> Result<Self, StoreError> {
        let mut options = InitOptions::default();
        options.show_download_progress = false;
        if let Some(dir) = cache_dir {
            options.cache_dir = dir;
        }

        let model = TextEmbedding::try_new(options).map_err(|e| {
            StoreError::Embedding(format!("Failed to load local embedding model: {:#}", e))
        })?;
        Ok(Self {
            model: Arc::new(model),
        })
    }
}

#[async_trait]
impl Embedder for FastEmbedder {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, StoreError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        // Inference is CPU bound
        let model = Arc::clone(&self.model);
        let texts = texts.to_vec();
        tokio::task::spawn_blocking(move || model.embed(texts, None))
            .await
            .map_err(|e| StoreError::Embedding(format!("Embedding task failed: {}", e)))?
            .map_err(|e| StoreError::Embedding(format!("{:#}", e)))
    }
}
