use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use sha2::{Digest, Sha256};
use tokio::sync::{Mutex, Semaphore};

use crate::config::{EmbeddingStrategy, EmbeddingsConfig};
use crate::db::MetadataStore;
use crate::error::{EngineError, Result};

use super::provider::{CloudEmbeddingProvider, EmbeddingProvider, LocalEmbeddingProvider};

const HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(10);
const CLOUD_CONCURRENCY: usize = 20;
const LOCAL_CONCURRENCY: usize = 2;

struct Tier {
    provider: Arc<dyn EmbeddingProvider>,
    semaphore: Arc<Semaphore>,
    healthy: AtomicBool,
    last_checked: Mutex<Instant>,
}

impl Tier {
    fn new(provider: Arc<dyn EmbeddingProvider>, concurrency: usize) -> Self {
        Self {
            provider,
            semaphore: Arc::new(Semaphore::new(concurrency)),
            healthy: AtomicBool::new(true),
            last_checked: Mutex::new(Instant::now() - HEALTH_CHECK_INTERVAL),
        }
    }

    async fn ensure_checked(&self) {
        let mut last = self.last_checked.lock().await;
        if last.elapsed() < HEALTH_CHECK_INTERVAL {
            return;
        }
        *last = Instant::now();
        let healthy = self.provider.health_check().await;
        self.healthy.store(healthy, Ordering::SeqCst);
    }

    fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::SeqCst)
    }
}

/// Orchestrates the tiered embedding provider chain described in the
/// strategy: primary cloud -> alternate cloud -> local, health-gated and
/// cache-diffed. `Memory::embed_provider` records which tier actually
/// produced a given vector.
pub struct EmbeddingManager {
    tiers: Vec<Tier>,
    local_index: usize,
    dimensions: usize,
    store: Arc<dyn MetadataStore>,
}

impl EmbeddingManager {
    /// Builds the tiered chain and runs the construction-time self-check:
    /// every configured cloud provider is probed up front, under a combined
    /// 10-second budget, so the first real request doesn't pay for
    /// discovering a dead provider lazily.
    pub async fn new(config: &EmbeddingsConfig, store: Arc<dyn MetadataStore>) -> Self {
        let mut tiers = Vec::new();

        let push_cloud = |tiers: &mut Vec<Tier>, name: &str, creds: &Option<crate::config::ProviderCredentials>| {
            if let Some(creds) = creds {
                let provider = Arc::new(CloudEmbeddingProvider::new(name, creds, config.dimensions));
                tiers.push(Tier::new(provider, CLOUD_CONCURRENCY));
            }
        };

        match config.strategy {
            EmbeddingStrategy::CloudFirst | EmbeddingStrategy::AccuracyFirst => {
                push_cloud(&mut tiers, "cloud_primary", &config.primary_cloud);
                push_cloud(&mut tiers, "cloud_alternate", &config.alternate_cloud);
            }
            EmbeddingStrategy::LocalOnly => {}
        }

        let local_index = tiers.len();
        tiers.push(Tier::new(
            Arc::new(LocalEmbeddingProvider::new(config.dimensions)),
            LOCAL_CONCURRENCY,
        ));

        let manager = Self { tiers, local_index, dimensions: config.dimensions, store };
        manager.self_check().await;
        manager
    }

    /// Probes every configured cloud tier once, under a combined 10-second
    /// budget (spec.md §4.3). A tier that doesn't answer in time is left
    /// unhealthy until the next lazy `ensure_checked()` re-probe rather than
    /// blocking construction indefinitely.
    async fn self_check(&self) {
        let probe = async {
            for tier in self.tiers.iter().take(self.local_index) {
                let healthy = tier.provider.health_check().await;
                tier.healthy.store(healthy, Ordering::SeqCst);
                *tier.last_checked.lock().await = Instant::now();
            }
        };
        if tokio::time::timeout(HEALTH_CHECK_INTERVAL, probe).await.is_err() {
            tracing::warn!("embedding manager construction self-check did not finish within budget");
        }
    }

    pub fn dimensions(&self) -> usize {
        self.dimensions
    }

    pub fn content_hash(text: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(text.as_bytes());
        format!("{:x}", hasher.finalize())
    }

    /// Embeds `texts`, diffing against the cache first: cached hashes never
    /// touch a provider. Misses are embedded together through the first
    /// healthy tier, cached, and returned in the original order alongside
    /// the provider name that produced them.
    pub async fn embed_batch(&self, texts: &[String]) -> Result<Vec<(Vec<f32>, String)>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let hashes: Vec<String> = texts.iter().map(|t| Self::content_hash(t)).collect();
        let mut results: Vec<Option<(Vec<f32>, String)>> = vec![None; texts.len()];
        let mut miss_indices = Vec::new();
        let mut miss_texts = Vec::new();

        for (i, hash) in hashes.iter().enumerate() {
            if let Some(entry) = self.store.cache_get(hash).await? {
                results[i] = Some((entry.vector, entry.provider));
            } else {
                miss_indices.push(i);
                miss_texts.push(texts[i].clone());
            }
        }

        if !miss_texts.is_empty() {
            let (vectors, provider_name) = self.embed_through_chain(&miss_texts).await?;
            for (slot, vector) in miss_indices.iter().zip(vectors.into_iter()) {
                let hash = &hashes[*slot];
                self.store.cache_put(hash, &vector, &provider_name).await?;
                results[*slot] = Some((vector, provider_name.clone()));
            }
        }

        Ok(results
            .into_iter()
            .map(|r| r.expect("every slot is filled by cache or embedding"))
            .collect())
    }

    pub async fn embed_one(&self, text: &str) -> Result<(Vec<f32>, String)> {
        let mut results = self.embed_batch(std::slice::from_ref(&text.to_string())).await?;
        Ok(results.remove(0))
    }

    /// Tries each tier in order, skipping unhealthy ones, until one embeds
    /// the whole batch successfully.
    async fn embed_through_chain(&self, texts: &[String]) -> Result<(Vec<Vec<f32>>, String)> {
        for tier in &self.tiers {
            tier.ensure_checked().await;
            if !tier.is_healthy() {
                continue;
            }

            let _permit = tier.semaphore.acquire().await.expect("semaphore not closed");
            match tier.provider.embed_batch(texts).await {
                Ok(vectors) => return Ok((vectors, tier.provider.name().to_string())),
                Err(e) => {
                    tracing::warn!(provider = tier.provider.name(), error = %e, "embedding tier failed, trying next");
                    tier.healthy.store(false, Ordering::SeqCst);
                }
            }
        }

        Err(EngineError::AllProvidersFailed)
    }

    /// Repair path used by the Healer: re-embeds `texts` through the cloud
    /// tiers only, bypassing the cache and the local fallback, so a record
    /// previously stuck on `embed_provider = "local"` gets promoted. On
    /// success the cache entries are overwritten unconditionally, even if a
    /// cached (local) vector already existed for the same content hash.
    pub async fn force_cloud_batch(&self, texts: &[String]) -> Result<(Vec<Vec<f32>>, String)> {
        for tier in self.tiers.iter().take(self.local_index) {
            tier.ensure_checked().await;
            if !tier.is_healthy() {
                continue;
            }
            let _permit = tier.semaphore.acquire().await.expect("semaphore not closed");
            match tier.provider.embed_batch(texts).await {
                Ok(vectors) => {
                    for (text, vector) in texts.iter().zip(vectors.iter()) {
                        let hash = Self::content_hash(text);
                        self.store.cache_put(&hash, vector, tier.provider.name()).await?;
                    }
                    return Ok((vectors, tier.provider.name().to_string()));
                }
                Err(e) => {
                    tracing::warn!(provider = tier.provider.name(), error = %e, "cloud repair tier failed");
                    tier.healthy.store(false, Ordering::SeqCst);
                }
            }
        }
        Err(EngineError::AllProvidersFailed)
    }

    pub fn has_cloud_tier(&self) -> bool {
        self.local_index > 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DataConfig;
    use crate::db::{Database, LibSqlMetadataStore};

    async fn local_only_manager(dimensions: usize) -> EmbeddingManager {
        let db_path = tempfile::tempdir().unwrap().into_path().join("metadata.sqlite3");
        let data_config = DataConfig {
            metadata_db_path: db_path.to_string_lossy().into_owned(),
            vector_index_dir: std::env::temp_dir(),
        };
        let db = Database::new(&data_config).await.unwrap();
        let store: Arc<dyn MetadataStore> = Arc::new(LibSqlMetadataStore::new(db));
        let config = EmbeddingsConfig {
            strategy: EmbeddingStrategy::LocalOnly,
            dimensions,
            primary_cloud: None,
            alternate_cloud: None,
            disable_summarizer: true,
        };
        EmbeddingManager::new(&config, store).await
    }

    #[tokio::test]
    async fn local_only_manager_has_no_cloud_tier() {
        let manager = local_only_manager(8).await;
        assert!(!manager.has_cloud_tier());
    }

    #[tokio::test]
    async fn embed_batch_falls_back_to_local_tier_and_tags_provider() {
        let manager = local_only_manager(8).await;
        let results = manager.embed_batch(&["hello".to_string()]).await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].0.len(), 8);
        assert_eq!(results[0].1, "local");
    }

    #[tokio::test]
    async fn embed_batch_is_cache_diffed_on_repeat_content() {
        let manager = local_only_manager(8).await;
        let first = manager.embed_one("repeated content").await.unwrap();
        let second = manager.embed_one("repeated content").await.unwrap();
        assert_eq!(first, second);

        let hash = EmbeddingManager::content_hash("repeated content");
        let cached = manager.store.cache_get(&hash).await.unwrap();
        assert!(cached.is_some());
    }

    #[tokio::test]
    async fn force_cloud_batch_fails_without_a_configured_cloud_tier() {
        let manager = local_only_manager(8).await;
        let err = manager.force_cloud_batch(&["x".to_string()]).await.unwrap_err();
        assert!(matches!(err, EngineError::AllProvidersFailed));
    }

    #[tokio::test]
    async fn content_hash_is_stable_for_same_text() {
        assert_eq!(EmbeddingManager::content_hash("abc"), EmbeddingManager::content_hash("abc"));
        assert_ne!(EmbeddingManager::content_hash("abc"), EmbeddingManager::content_hash("abd"));
    }
}
