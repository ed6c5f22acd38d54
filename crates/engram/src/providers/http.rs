//! OpenAI-compatible embeddings client.
//!
//! Talks to any `/v1/embeddings`-shaped endpoint (OpenAI, Ollama, LocalAI,
//! proxies). Error mapping: 429 becomes `RateLimited` (honoring
//! `Retry-After`), 5xx and network failures become `Transient`, every other
//! non-success status is `Permanent`.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;

use crate::config::EmbeddingSettings;

use super::{EmbeddingProvider, ProviderError};

const PROBE_TEXT: &str = "dimension probe";

pub struct HttpEmbeddingProvider {
    client: Client,
    endpoint: String,
    api_key: Option<String>,
    model: String,
    /// Dimension requested on regular calls. Never sent on the
    /// `native_dimension` probe.
    requested_dimension: Option<usize>,
}

#[derive(Deserialize)]
struct EmbeddingsResponse {
    data: Vec<EmbeddingRow>,
}

#[derive(Deserialize)]
struct EmbeddingRow {
    index: usize,
    embedding: Vec<f32>,
}

impl HttpEmbeddingProvider {
    pub fn new(settings: &EmbeddingSettings) -> std::result::Result<Self, ProviderError> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(settings.request_timeout_secs))
            .build()
            .map_err(|e| ProviderError::Permanent(format!("http client init: {}", e)))?;

        Ok(Self {
            client,
            endpoint: settings.endpoint.clone(),
            api_key: settings.api_key.clone(),
            model: settings.model.clone(),
            requested_dimension: Some(settings.dimension),
        })
    }

    async fn request_embeddings(
        &self,
        inputs: &[String],
        with_dimension: bool,
    ) -> std::result::Result<Vec<Vec<f32>>, ProviderError> {
        let mut body = json!({
            "model": self.model,
            "input": inputs,
        });
        if with_dimension {
            if let Some(dimension) = self.requested_dimension {
                body["dimensions"] = json!(dimension);
            }
        }

        let mut request = self.client.post(&self.endpoint).json(&body);
        if let Some(ref key) = self.api_key {
            request = request.header("Authorization", format!("Bearer {}", key));
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                ProviderError::Transient(format!("embedding request timed out: {}", e))
            } else if e.is_connect() {
                ProviderError::Transient(format!("embedding endpoint unreachable: {}", e))
            } else {
                ProviderError::Transient(format!("embedding request failed: {}", e))
            }
        })?;

        let status = response.status();
        if status.as_u16() == 429 {
            let retry_after = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok())
                .map(Duration::from_secs);
            return Err(ProviderError::RateLimited { retry_after });
        }
        if status.is_server_error() {
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::Transient(format!(
                "embedding server error ({}): {}",
                status,
                body.chars().take(200).collect::<String>()
            )));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::Permanent(format!(
                "embedding API error ({}): {}",
                status,
                body.chars().take(200).collect::<String>()
            )));
        }

        let parsed: EmbeddingsResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::Permanent(format!("embedding response parse: {}", e)))?;

        if parsed.data.len() != inputs.len() {
            return Err(ProviderError::Permanent(format!(
                "embedding response has {} rows for {} inputs",
                parsed.data.len(),
                inputs.len()
            )));
        }

        let mut rows = parsed.data;
        rows.sort_by_key(|r| r.index);
        Ok(rows.into_iter().map(|r| r.embedding).collect())
    }
}

#[async_trait]
impl EmbeddingProvider for HttpEmbeddingProvider {
    fn model_id(&self) -> String {
        self.model.clone()
    }

    async fn embed_query(&self, text: &str) -> std::result::Result<Vec<f32>, ProviderError> {
        let mut vectors = self.request_embeddings(&[text.to_string()], true).await?;
        vectors
            .pop()
            .ok_or_else(|| ProviderError::Permanent("empty embedding response".into()))
    }

    async fn embed_documents(
        &self,
        texts: &[String],
    ) -> std::result::Result<Vec<Vec<f32>>, ProviderError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        self.request_embeddings(texts, true).await
    }

    async fn native_dimension(&self) -> std::result::Result<usize, ProviderError> {
        let vectors = self
            .request_embeddings(&[PROBE_TEXT.to_string()], false)
            .await?;
        let dimension = vectors
            .first()
            .map(|v| v.len())
            .ok_or_else(|| ProviderError::Permanent("empty probe response".into()))?;
        if dimension == 0 {
            return Err(ProviderError::Permanent("probe returned empty vector".into()));
        }
        tracing::debug!(model = %self.model, dimension, "Probed native embedding dimension");
        Ok(dimension)
    }
}
