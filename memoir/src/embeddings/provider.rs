use async_openai::config::OpenAIConfig;
use async_openai::error::OpenAIError;
use async_openai::types::CreateEmbeddingRequestArgs;
use async_openai::Client;
use async_trait::async_trait;
use backoff::future::retry;
use backoff::ExponentialBackoffBuilder;
use sha2::{Digest, Sha256};
use std::time::Duration;

use crate::config::ProviderCredentials;
use crate::error::{EngineError, Result};

/// A single embedding backend. `name()` is persisted onto
/// `Memory::embed_provider` so the Healer knows which records still need
/// promotion to a cloud vector.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;
    fn name(&self) -> &str;
    fn dimensions(&self) -> usize;

    /// Cheap reachability probe used by the health gate. Default
    /// implementation embeds a one-word probe string.
    async fn health_check(&self) -> bool {
        self.embed_batch(&["ping".to_string()]).await.is_ok()
    }
}

/// Hosted embedding API reachable over HTTP (OpenAI-compatible
/// `/embeddings` endpoint). Used for both the primary and alternate cloud
/// tiers — they differ only in credentials.
pub struct CloudEmbeddingProvider {
    client: Client<OpenAIConfig>,
    model: String,
    dimensions: usize,
    name: String,
}

impl CloudEmbeddingProvider {
    pub fn new(name: &str, credentials: &ProviderCredentials, dimensions: usize) -> Self {
        let mut config = OpenAIConfig::new().with_api_base(credentials.base_url.clone());
        if let Some(api_key) = &credentials.api_key {
            config = config.with_api_key(api_key.clone());
        }
        Self {
            client: Client::with_config(config),
            model: credentials.model.clone(),
            dimensions,
            name: name.to_string(),
        }
    }

    async fn embed_attempt(
        &self,
        texts: Vec<String>,
    ) -> std::result::Result<Vec<Vec<f32>>, OpenAIError> {
        let request = CreateEmbeddingRequestArgs::default()
            .model(self.model.clone())
            .input(texts)
            .build()?;

        let response = self.client.embeddings().create(request).await?;

        Ok(response.data.into_iter().map(|d| d.embedding).collect())
    }

    /// Matches the teacher's embeddings client: 401/403 fail immediately,
    /// everything else (429, 5xx, transport errors) is worth retrying within
    /// the backoff budget.
    fn is_auth_error(error: &OpenAIError) -> bool {
        matches!(
            error,
            OpenAIError::Reqwest(reqwest_error)
                if reqwest_error.status() == Some(reqwest::StatusCode::UNAUTHORIZED)
                    || reqwest_error.status() == Some(reqwest::StatusCode::FORBIDDEN)
        )
    }
}

#[async_trait]
impl EmbeddingProvider for CloudEmbeddingProvider {
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let backoff = ExponentialBackoffBuilder::new()
            .with_initial_interval(Duration::from_millis(200))
            .with_max_elapsed_time(Some(Duration::from_secs(10)))
            .build();

        retry(backoff, || async {
            self.embed_attempt(texts.to_vec()).await.map_err(|error| {
                if Self::is_auth_error(&error) {
                    backoff::Error::permanent(error)
                } else {
                    backoff::Error::transient(error)
                }
            })
        })
        .await
        .map_err(|error| {
            if Self::is_auth_error(&error) {
                EngineError::ProviderError(format!("{} authentication failed: {error}", self.name))
            } else {
                EngineError::ProviderError(format!("{} embedding request failed: {error}", self.name))
            }
        })
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }
}

/// Deterministic, dependency-free fallback: hashes each text into a unit
/// vector. Not semantically meaningful, but guarantees `add`/`search` never
/// hard-fail when every cloud tier is down. Always configured, never
/// user-selectable as a primary.
pub struct LocalEmbeddingProvider {
    dimensions: usize,
}

impl LocalEmbeddingProvider {
    pub fn new(dimensions: usize) -> Self {
        Self { dimensions }
    }

    fn embed_one(&self, text: &str) -> Vec<f32> {
        let mut out = Vec::with_capacity(self.dimensions);
        let mut counter: u32 = 0;
        while out.len() < self.dimensions {
            let mut hasher = Sha256::new();
            hasher.update(text.as_bytes());
            hasher.update(counter.to_le_bytes());
            let digest = hasher.finalize();
            for chunk in digest.chunks_exact(4) {
                if out.len() >= self.dimensions {
                    break;
                }
                let bytes: [u8; 4] = chunk.try_into().expect("chunk is exactly 4 bytes");
                let value = u32::from_le_bytes(bytes) as f32 / u32::MAX as f32;
                out.push(value * 2.0 - 1.0);
            }
            counter += 1;
        }

        let norm = out.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 0.0 {
            for v in &mut out {
                *v /= norm;
            }
        }
        out
    }
}

#[async_trait]
impl EmbeddingProvider for LocalEmbeddingProvider {
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|t| self.embed_one(t)).collect())
    }

    fn name(&self) -> &str {
        "local"
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    async fn health_check(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, Request, ResponseTemplate};

    fn mock_credentials(base_url: &str) -> ProviderCredentials {
        ProviderCredentials {
            base_url: base_url.to_string(),
            api_key: Some("test-key".to_string()),
            model: "text-embedding-3-small".to_string(),
        }
    }

    fn embedding_response(vectors: Vec<Vec<f32>>) -> serde_json::Value {
        serde_json::json!({
            "data": vectors.into_iter().map(|v| serde_json::json!({ "embedding": v })).collect::<Vec<_>>()
        })
    }

    #[tokio::test]
    async fn retries_on_503_and_recovers() {
        let server = MockServer::start().await;
        let attempts = Arc::new(AtomicUsize::new(0));
        let attempts_for_mock = Arc::clone(&attempts);

        Mock::given(method("POST"))
            .and(path("/embeddings"))
            .respond_with(move |_: &Request| {
                if attempts_for_mock.fetch_add(1, Ordering::SeqCst) == 0 {
                    ResponseTemplate::new(503).set_body_json(serde_json::json!({ "error": "service unavailable" }))
                } else {
                    ResponseTemplate::new(200).set_body_json(embedding_response(vec![vec![0.1, 0.2, 0.3]]))
                }
            })
            .mount(&server)
            .await;

        let provider = CloudEmbeddingProvider::new("primary_cloud", &mock_credentials(&server.uri()), 3);
        let result = provider.embed_batch(&["hello".to_string()]).await;

        assert!(result.is_ok(), "expected retry to recover: {:?}", result.err());
        assert_eq!(attempts.load(Ordering::SeqCst), 2, "should have retried once after the 503");
    }

    #[tokio::test]
    async fn retries_on_429_within_backoff_budget() {
        let server = MockServer::start().await;
        let attempts = Arc::new(AtomicUsize::new(0));
        let attempts_for_mock = Arc::clone(&attempts);

        Mock::given(method("POST"))
            .and(path("/embeddings"))
            .respond_with(move |_: &Request| {
                if attempts_for_mock.fetch_add(1, Ordering::SeqCst) < 2 {
                    ResponseTemplate::new(429)
                        .insert_header("retry-after", "1")
                        .set_body_json(serde_json::json!({ "error": "rate limited" }))
                } else {
                    ResponseTemplate::new(200).set_body_json(embedding_response(vec![vec![0.4, 0.5, 0.6]]))
                }
            })
            .mount(&server)
            .await;

        let provider = CloudEmbeddingProvider::new("primary_cloud", &mock_credentials(&server.uri()), 3);
        let result = provider.embed_batch(&["hello".to_string()]).await;

        assert!(result.is_ok(), "expected rate-limited requests to eventually succeed: {:?}", result.err());
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn short_circuits_on_401_without_retrying() {
        let server = MockServer::start().await;
        let attempts = Arc::new(AtomicUsize::new(0));
        let attempts_for_mock = Arc::clone(&attempts);

        Mock::given(method("POST"))
            .and(path("/embeddings"))
            .respond_with(move |_: &Request| {
                attempts_for_mock.fetch_add(1, Ordering::SeqCst);
                ResponseTemplate::new(401).set_body_json(serde_json::json!({ "error": "invalid api key" }))
            })
            .mount(&server)
            .await;

        let provider = CloudEmbeddingProvider::new("primary_cloud", &mock_credentials(&server.uri()), 3);
        let result = provider.embed_batch(&["hello".to_string()]).await;

        assert!(result.is_err(), "401 should not be swallowed by the retry loop");
        assert_eq!(attempts.load(Ordering::SeqCst), 1, "should not retry on an auth failure");
        assert!(result.unwrap_err().to_string().contains("authentication"));
    }

    #[tokio::test]
    async fn local_provider_is_deterministic() {
        let provider = LocalEmbeddingProvider::new(16);
        let a = provider.embed_batch(&["hello world".to_string()]).await.unwrap();
        let b = provider.embed_batch(&["hello world".to_string()]).await.unwrap();
        assert_eq!(a, b);
        assert_eq!(a[0].len(), 16);
    }

    #[tokio::test]
    async fn local_provider_distinguishes_content() {
        let provider = LocalEmbeddingProvider::new(16);
        let a = provider.embed_batch(&["hello".to_string()]).await.unwrap();
        let b = provider.embed_batch(&["goodbye".to_string()]).await.unwrap();
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn local_provider_is_always_healthy() {
        let provider = LocalEmbeddingProvider::new(8);
        assert!(provider.health_check().await);
    }
}
