//! Contracts for external collaborators: the embedding provider, the LLM
//! extractor, and the optional re-ranker. The engine only depends on these
//! traits; concrete HTTP clients live in [`http`].

pub mod http;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::EngineError;
use crate::types::{AsyncTask, ScoredMemory, TaskStatus};

pub use http::HttpEmbeddingProvider;

#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    /// Timeouts, connection failures, 5xx responses. Worth retrying.
    #[error("transient provider failure: {0}")]
    Transient(String),

    /// Bad requests, auth failures. Never retried.
    #[error("permanent provider failure: {0}")]
    Permanent(String),

    #[error("provider rate limited")]
    RateLimited { retry_after: Option<Duration> },
}

impl ProviderError {
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::Permanent(_))
    }
}

impl From<ProviderError> for EngineError {
    fn from(err: ProviderError) -> Self {
        EngineError::ExternalTransient(err.to_string())
    }
}

/// HTTP text-to-vector service.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    fn model_id(&self) -> String;

    async fn embed_query(&self, text: &str) -> std::result::Result<Vec<f32>, ProviderError>;

    async fn embed_documents(
        &self,
        texts: &[String],
    ) -> std::result::Result<Vec<Vec<f32>>, ProviderError>;

    /// Embed a short probe with NO dimension-truncation parameter and return
    /// the observed vector length. Exposes proxies that silently shorten
    /// vectors.
    async fn native_dimension(&self) -> std::result::Result<usize, ProviderError>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractedItem {
    pub content: String,
    pub kind: String,
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractedRelation {
    pub from: String,
    pub relation: String,
    pub to: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Extraction {
    pub memories: Vec<ExtractedItem>,
    pub entities: Vec<ExtractedItem>,
    pub relations: Vec<ExtractedRelation>,
}

/// LLM-backed structured extraction.
#[async_trait]
pub trait Extractor: Send + Sync {
    async fn extract(&self, messages: &[String])
        -> std::result::Result<Extraction, ProviderError>;
}

/// Optional learned re-ranker; when absent or failing, the recursive bucket
/// re-rank takes over.
#[async_trait]
pub trait Reranker: Send + Sync {
    async fn rerank(
        &self,
        query: &str,
        items: &[ScoredMemory],
        top_n: usize,
    ) -> std::result::Result<Vec<ScoredMemory>, ProviderError>;
}

/// Retry parameters for transient / rate-limited provider failures.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Retries after the initial attempt.
    pub max_retries: u32,
    pub base_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_backoff: Duration::from_millis(500),
        }
    }
}

/// Run `op`, retrying retryable failures with exponential backoff. A
/// rate-limit hint from the provider overrides the computed backoff.
pub async fn with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    mut op: F,
) -> std::result::Result<T, ProviderError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = std::result::Result<T, ProviderError>>,
{
    let mut attempt = 0u32;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_retryable() && attempt < policy.max_retries => {
                let wait = match &err {
                    ProviderError::RateLimited {
                        retry_after: Some(after),
                    } => *after,
                    _ => policy.base_backoff * 2u32.pow(attempt),
                };
                tracing::warn!(
                    attempt = attempt + 1,
                    max_retries = policy.max_retries,
                    wait_ms = wait.as_millis() as u64,
                    error = %err,
                    "Provider call failed, retrying"
                );
                tokio::time::sleep(wait).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

/// Bridge to LLM extraction. Extraction is best-effort: every failure path
/// collapses to empty lists, and each call leaves an [`AsyncTask`] record
/// behind for observability.
pub struct ExtractorGateway {
    extractor: Option<Arc<dyn Extractor>>,
    tasks: DashMap<Uuid, AsyncTask>,
    retry: RetryPolicy,
}

impl ExtractorGateway {
    pub fn new(extractor: Option<Arc<dyn Extractor>>) -> Self {
        Self {
            extractor,
            tasks: DashMap::new(),
            retry: RetryPolicy::default(),
        }
    }

    pub fn is_configured(&self) -> bool {
        self.extractor.is_some()
    }

    /// Extract structured memories from raw messages. Never fails: a missing
    /// extractor or exhausted retries yield an empty extraction.
    pub async fn extract_best_effort(&self, messages: &[String]) -> Extraction {
        let Some(extractor) = self.extractor.clone() else {
            return Extraction::default();
        };

        let mut task = AsyncTask::new();
        let task_id = task.task_id;
        task.status = TaskStatus::Running;
        self.tasks.insert(task_id, task);

        let result = with_retry(&self.retry, || {
            let extractor = extractor.clone();
            let messages = messages.to_vec();
            async move { extractor.extract(&messages).await }
        })
        .await;

        let mut entry = self
            .tasks
            .entry(task_id)
            .or_insert_with(AsyncTask::new);
        entry.updated_at = chrono::Utc::now();
        match result {
            Ok(extraction) => {
                entry.status = TaskStatus::Success;
                entry.result = serde_json::to_value(&extraction).ok();
                extraction
            }
            Err(err) => {
                tracing::warn!(error = %err, "Extraction failed, continuing without it");
                entry.status = TaskStatus::Failed;
                entry.error = Some(err.to_string());
                Extraction::default()
            }
        }
    }

    pub fn task(&self, id: Uuid) -> Option<AsyncTask> {
        self.tasks.get(&id).map(|t| t.clone())
    }

    pub fn task_count(&self) -> usize {
        self.tasks.len()
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn retry_succeeds_after_transient_failures() {
        let attempts = AtomicUsize::new(0);
        let policy = RetryPolicy {
            max_retries: 2,
            base_backoff: Duration::from_millis(1),
        };
        let result = with_retry(&policy, || {
            let n = attempts.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(ProviderError::Transient("flaky".into()))
                } else {
                    Ok(n)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 2);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn retry_gives_up_on_permanent_errors() {
        let attempts = AtomicUsize::new(0);
        let policy = RetryPolicy::default();
        let result: std::result::Result<(), _> = with_retry(&policy, || {
            attempts.fetch_add(1, Ordering::SeqCst);
            async { Err(ProviderError::Permanent("bad request".into())) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    struct FailingExtractor;

    #[async_trait]
    impl Extractor for FailingExtractor {
        async fn extract(
            &self,
            _messages: &[String],
        ) -> std::result::Result<Extraction, ProviderError> {
            Err(ProviderError::Permanent("no model".into()))
        }
    }

    #[tokio::test]
    async fn gateway_degrades_to_empty_extraction() {
        let gateway = ExtractorGateway::new(Some(Arc::new(FailingExtractor)));
        let extraction = gateway.extract_best_effort(&["hello".into()]).await;
        assert!(extraction.memories.is_empty());
        assert_eq!(gateway.task_count(), 1);
    }

    #[tokio::test]
    async fn gateway_without_extractor_is_silent() {
        let gateway = ExtractorGateway::new(None);
        let extraction = gateway.extract_best_effort(&["hello".into()]).await;
        assert!(extraction.memories.is_empty());
        assert_eq!(gateway.task_count(), 0);
    }
}
