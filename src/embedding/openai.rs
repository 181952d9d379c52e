//! OpenAI embedding provider implementation.
//!
//! Calls the `/embeddings` endpoint of the OpenAI API, or any endpoint that
//! speaks the same protocol.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{ensure_count, EmbeddingError, EmbeddingProvider, EmbeddingResult};

/// Default API base URL.
pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

/// Default embedding model.
pub const DEFAULT_MODEL: &str = "text-embedding-ada-002";

/// Maximum inputs per request.
const BATCH_SIZE: usize = 64;

/// OpenAI embedding provider.
#[derive(Debug, Clone)]
pub struct OpenAIEmbedding {
    client: reqwest::Client,

    /// OpenAI API key for authentication
    api_key: String,

    /// API base URL, without trailing slash
    base_url: String,

    /// Model identifier (e.g., "text-embedding-ada-002")
    model: String,

    /// Expected dimension of the embedding vectors
    embedding_dimension: usize,
}

impl OpenAIEmbedding {
    /// Create a new OpenAI embedding provider.
    ///
    /// # Arguments
    /// * `api_key` - OpenAI API key
    /// * `model` - Model name (defaults to [`DEFAULT_MODEL`] if None)
    pub fn new(api_key: String, model: Option<String>) -> Self {
        let model = model.unwrap_or_else(|| DEFAULT_MODEL.to_string());
        let embedding_dimension = dimension_for_model(&model);

        Self {
            client: reqwest::Client::new(),
            api_key,
            base_url: DEFAULT_BASE_URL.to_string(),
            model,
            embedding_dimension,
        }
    }

    /// Point the provider at a different OpenAI-compatible endpoint.
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    /// Use a client with the given per-request timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> EmbeddingResult<Self> {
        self.client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| EmbeddingError::ConfigError(e.to_string()))?;
        Ok(self)
    }

    async fn request(&self, input: Vec<String>) -> EmbeddingResult<Vec<Vec<f32>>> {
        let url = format!("{}/embeddings", self.base_url);
        let expected = input.len();
        let request = EmbeddingRequest {
            model: &self.model,
            input,
        };

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| EmbeddingError::ApiError(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(EmbeddingError::ApiError(format!(
                "OpenAI embeddings API returned {status}: {body}"
            )));
        }

        let body: EmbeddingResponse = response
            .json()
            .await
            .map_err(|e| EmbeddingError::ApiError(format!("Malformed response: {e}")))?;

        let vectors = body.into_ordered();
        ensure_count(expected, &vectors)?;
        Ok(vectors)
    }
}

/// Known output dimensions of OpenAI embedding models.
pub fn dimension_for_model(model: &str) -> usize {
    match model {
        "text-embedding-3-large" => 3072,
        "text-embedding-3-small" | "text-embedding-ada-002" => 1536,
        _ => 1536,
    }
}

#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: Vec<String>,
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Deserialize)]
struct EmbeddingData {
    #[serde(default)]
    index: usize,
    embedding: Vec<f32>,
}

impl EmbeddingResponse {
    /// Vectors ordered by the `index` the API reports for each input.
    fn into_ordered(mut self) -> Vec<Vec<f32>> {
        self.data.sort_by_key(|d| d.index);
        self.data.into_iter().map(|d| d.embedding).collect()
    }
}

fn reject_blank(texts: &[&str]) -> EmbeddingResult<()> {
    if texts.iter().any(|t| t.trim().is_empty()) {
        return Err(EmbeddingError::InvalidInput(
            "All texts must be non-empty".to_string(),
        ));
    }
    Ok(())
}

#[async_trait]
impl EmbeddingProvider for OpenAIEmbedding {
    async fn embed(&self, text: &str) -> EmbeddingResult<Vec<f32>> {
        reject_blank(&[text])?;
        self.request(vec![text.to_string()])
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| EmbeddingError::Other("No embedding returned".to_string()))
    }

    async fn embed_batch(&self, texts: &[&str]) -> EmbeddingResult<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        reject_blank(texts)?;

        let mut all = Vec::with_capacity(texts.len());
        for chunk in texts.chunks(BATCH_SIZE) {
            debug!(model = %self.model, inputs = chunk.len(), "Requesting embeddings");
            let input = chunk.iter().map(|t| t.to_string()).collect();
            all.extend(self.request(input).await?);
        }
        Ok(all)
    }

    fn dimension(&self) -> usize {
        self.embedding_dimension
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_model_and_dimension() {
        let provider = OpenAIEmbedding::new("key".to_string(), None);
        assert_eq!(provider.model_name(), DEFAULT_MODEL);
        assert_eq!(provider.dimension(), 1536);
    }

    #[test]
    fn test_large_model_dimension() {
        let provider = OpenAIEmbedding::new("key".to_string(), Some("text-embedding-3-large".into()));
        assert_eq!(provider.dimension(), 3072);
    }

    #[test]
    fn test_base_url_trailing_slash_trimmed() {
        let provider = OpenAIEmbedding::new("key".to_string(), None)
            .with_base_url("http://localhost:8080/v1/");
        assert_eq!(provider.base_url, "http://localhost:8080/v1");
    }

    #[test]
    fn test_response_reordered_by_index() {
        let json = r#"{"data": [
            {"index": 1, "embedding": [2.0]},
            {"index": 0, "embedding": [1.0]}
        ], "model": "m"}"#;
        let response: EmbeddingResponse = serde_json::from_str(json).unwrap();
        assert_eq!(response.into_ordered(), vec![vec![1.0], vec![2.0]]);
    }

    #[tokio::test]
    async fn test_blank_input_rejected_before_request() {
        let provider = OpenAIEmbedding::new("key".to_string(), None)
            .with_base_url("http://127.0.0.1:9");
        let result = provider.embed_batch(&["ok", "  "]).await;
        assert!(matches!(result, Err(EmbeddingError::InvalidInput(_))));
    }

    #[tokio::test]
    async fn test_empty_batch_is_noop() {
        let provider = OpenAIEmbedding::new("key".to_string(), None)
            .with_base_url("http://127.0.0.1:9");
        assert!(provider.embed_batch(&[]).await.unwrap().is_empty());
    }
}
