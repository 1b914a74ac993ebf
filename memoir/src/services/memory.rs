use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::Utc;
use nanoid::nanoid;

use crate::db::{MemoryStats, MetadataStore};
use crate::embeddings::EmbeddingManager;
use crate::error::{EngineError, Result};
use crate::llm::LlmProvider;
use crate::models::{Memory, MemoryKind, MemoryStatus, ScoredMemory};
use crate::vector::{VectorRecord, VectorStore};

use super::dream::{DreamConsolidator, DreamRunSummary};

const SEMANTIC_DELETE_TOP_K: usize = 50;
const DEFAULT_MATCH_THRESHOLD: f32 = 0.85;
const SUMMARIZE_THRESHOLD: usize = 200;

const PREFERENCE_TIER_LIMIT: i64 = 6;
const PREFERENCE_TIER_SCORE: f32 = 1.0;
const SUMMARY_TIER_LIMIT: i64 = 3;
const SUMMARY_TIER_SCORE: f32 = 0.95;
const CONVERSATION_FALLBACK_LIMIT: i64 = 5;
const CONVERSATION_FALLBACK_SCORE: f32 = 0.7;
const DEFAULT_SEARCH_TOP_K: usize = 5;
const DEFAULT_EF_SEARCH: usize = 50;
const DEFAULT_PREFERENCES_LIMIT: i64 = 20;
const DEFAULT_LIST_LIMIT: i64 = 20;

/// Fields accepted by [`MemoryService::add`]. `kind` defaults to
/// `conversation` via [`Default`].
#[derive(Debug, Clone, Default)]
pub struct AddInput {
    pub user_id: String,
    pub content: String,
    pub session_id: Option<String>,
    pub source: Option<String>,
    pub tags: Vec<String>,
    pub kind: MemoryKind,
    /// Lets Dream stamp freshly consolidated records `status = dream`
    /// instead of the usual `active`.
    pub status: MemoryStatus,
}

impl AddInput {
    pub fn new(user_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self { user_id: user_id.into(), content: content.into(), ..Default::default() }
    }
}

/// Fields accepted by [`MemoryService::set`].
#[derive(Debug, Clone, Default)]
pub struct SetInput {
    pub user_id: String,
    pub content: String,
    pub id: Option<String>,
    pub kind: MemoryKind,
    pub source: Option<String>,
    pub tags: Vec<String>,
    pub session_id: Option<String>,
    pub match_query: Option<String>,
    pub match_threshold: Option<f32>,
}

impl SetInput {
    pub fn new(user_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self { user_id: user_id.into(), content: content.into(), ..Default::default() }
    }
}

/// Fields accepted by [`MemoryService::update`].
#[derive(Debug, Clone, Default)]
pub struct UpdateInput {
    pub content: String,
    pub source: Option<String>,
    pub tags: Option<Vec<String>>,
}

/// Fields accepted by [`MemoryService::search`].
#[derive(Debug, Clone)]
pub struct SearchInput {
    pub user_id: String,
    pub query: String,
    pub top_k: usize,
    pub session_id: Option<String>,
}

impl SearchInput {
    pub fn new(user_id: impl Into<String>, query: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            query: query.into(),
            top_k: DEFAULT_SEARCH_TOP_K,
            session_id: None,
        }
    }
}

/// `{status, memory_count, version}` for the out-of-scope health endpoint.
#[derive(Debug, Clone, serde::Serialize)]
pub struct HealthStatus {
    pub status: String,
    pub memory_count: i64,
    pub version: String,
}

/// Orchestrates `add`/`search`/`set`/`update`/`delete` against the metadata
/// store, vector store, and embedding manager, under multi-tenant isolation.
/// The only place that composes all three — no other module imports more
/// than one of them (§9 layering note).
#[derive(Clone)]
pub struct MemoryService {
    db: Arc<dyn MetadataStore>,
    vectors: Arc<VectorStore>,
    embeddings: Arc<EmbeddingManager>,
    llm: Arc<LlmProvider>,
    disable_summarizer: bool,
    dream: Option<Arc<DreamConsolidator>>,
}

impl MemoryService {
    pub fn new(
        db: Arc<dyn MetadataStore>,
        vectors: Arc<VectorStore>,
        embeddings: Arc<EmbeddingManager>,
        llm: Arc<LlmProvider>,
        disable_summarizer: bool,
    ) -> Self {
        Self { db, vectors, embeddings, llm, disable_summarizer, dream: None }
    }

    /// Wires the Dream consolidator in after construction so `trigger_dream`
    /// has somewhere to delegate to. `DreamConsolidator` holds its own clone
    /// of this service, so the handle is attached rather than passed to
    /// `new` to avoid building the two in a cycle.
    pub fn with_dream_consolidator(mut self, dream: Arc<DreamConsolidator>) -> Self {
        self.dream = Some(dream);
        self
    }

    /// §6 on-demand trigger: runs one Dream pass immediately instead of
    /// waiting for the scheduler's next tick. Delegates to
    /// [`DreamConsolidator::run_once`].
    pub async fn trigger_dream(&self) -> Result<DreamRunSummary> {
        match &self.dream {
            Some(dream) => dream.run_once().await,
            None => Err(EngineError::BadInput("dream consolidator is not configured".to_string())),
        }
    }

    /// §4.4 ingest path.
    pub async fn add(&self, input: AddInput) -> Result<Memory> {
        let user_id = input.user_id.trim().to_string();
        if user_id.is_empty() {
            return Err(EngineError::BadInput("user_id must not be empty".to_string()));
        }
        let content = input.content.trim().to_string();
        if content.is_empty() {
            return Err(EngineError::BadInput("content must not be empty".to_string()));
        }

        let now = Utc::now();
        let mut memory = Memory::new(nanoid!(), user_id, content);
        memory.session_id = input.session_id;
        memory.source = input.source;
        memory.tags = input.tags;
        memory.kind = input.kind;
        memory.status = input.status;
        memory.created_at = now;
        memory.updated_at = now;
        memory.last_accessed_at = now;

        memory.summary = self.summarize_if_warranted(&memory.content).await;

        let (vector, provider) = self.embeddings.embed_one(memory.embedding_source()).await?;
        memory.embed_provider = Some(provider);

        self.db.insert(memory.clone()).await?;

        if let Err(e) = self.upsert_vector(&memory, vector) {
            tracing::warn!(id = %memory.id, error = %e, "vector upsert failed on add, Healer will repair");
        }

        Ok(memory)
    }

    /// §4.5 set/upsert path: semantic-delete-then-insert-or-resurrect.
    pub async fn set(&self, input: SetInput) -> Result<Memory> {
        let match_query = input.match_query.clone().unwrap_or_else(|| input.content.clone());
        let threshold = input.match_threshold.unwrap_or(DEFAULT_MATCH_THRESHOLD);

        if let Err(e) = self.semantic_delete(&input.user_id, &match_query, threshold).await {
            tracing::warn!(user_id = %input.user_id, error = %e, "semantic delete pre-pass failed in set, continuing");
        }

        if let Some(id) = &input.id {
            match self.db.get_by_id_including_deleted(id).await {
                Ok(mut memory) if memory.user_id == input.user_id => {
                    memory.content = input.content.clone();
                    memory.source = input.source.clone();
                    memory.tags = input.tags.clone();
                    memory.kind = input.kind;
                    memory.summary = self.summarize_if_warranted(&memory.content).await;

                    let (vector, provider) =
                        self.embeddings.embed_one(memory.embedding_source()).await?;
                    memory.embed_provider = Some(provider);
                    memory.deleted_at = None;
                    memory.updated_at = Utc::now();

                    self.db.update_record(&memory).await?;
                    if let Err(e) = self.upsert_vector(&memory, vector) {
                        tracing::warn!(id = %memory.id, error = %e, "vector upsert failed on set resurrect");
                    }
                    return Ok(memory);
                }
                Ok(_) | Err(EngineError::NotFound(_)) => {
                    // Belongs to another tenant, or absent entirely: fall through to insert.
                }
                Err(e) => return Err(e),
            }
        }

        self.add(AddInput {
            user_id: input.user_id,
            content: input.content,
            session_id: input.session_id,
            source: input.source,
            tags: input.tags,
            kind: input.kind,
            status: MemoryStatus::default(),
        })
        .await
    }

    /// Strict-id path: fails with `NotFound` if `id` is absent or soft-deleted.
    pub async fn update(&self, id: &str, input: UpdateInput) -> Result<Memory> {
        let mut memory = self.db.get_by_id(id).await?;

        let content = input.content.trim();
        if content.is_empty() {
            return Err(EngineError::BadInput("content must not be empty".to_string()));
        }
        memory.content = content.to_string();
        if let Some(source) = input.source {
            memory.source = Some(source);
        }
        if let Some(tags) = input.tags {
            memory.tags = tags;
        }
        memory.summary = self.summarize_if_warranted(&memory.content).await;

        let (vector, provider) = self.embeddings.embed_one(memory.embedding_source()).await?;
        memory.embed_provider = Some(provider);
        memory.updated_at = Utc::now();

        self.db.update_record(&memory).await?;
        if let Err(e) = self.upsert_vector(&memory, vector) {
            tracing::warn!(id = %memory.id, error = %e, "vector upsert failed on update");
        }
        Ok(memory)
    }

    /// Soft-deletes in metadata, hard-deletes from the vector store. Idempotent.
    pub async fn delete(&self, id: &str) -> Result<()> {
        self.db.soft_delete(id).await?;
        self.vectors.delete(id)?;
        Ok(())
    }

    /// Semantic-deletes every hit scoring at or above `threshold` (default 0.85).
    pub async fn delete_by_query(
        &self,
        user_id: &str,
        query: &str,
        threshold: Option<f32>,
    ) -> Result<(u64, Vec<String>)> {
        let ids = self
            .semantic_delete(user_id, query, threshold.unwrap_or(DEFAULT_MATCH_THRESHOLD))
            .await?;
        Ok((ids.len() as u64, ids))
    }

    /// §4.6 tiered recall.
    pub async fn search(&self, input: SearchInput) -> Result<Vec<ScoredMemory>> {
        let user_id = input.user_id.trim();
        if user_id.is_empty() {
            return Err(EngineError::BadInput("user_id must not be empty".to_string()));
        }
        let top_k = if input.top_k == 0 { DEFAULT_SEARCH_TOP_K } else { input.top_k };

        let mut seen: HashSet<String> = HashSet::new();
        let mut results: Vec<ScoredMemory> = Vec::new();

        // Tier 1: preferences.
        let preferences = self.db.search_preferences(user_id, PREFERENCE_TIER_LIMIT).await?;
        for mut memory in preferences {
            if seen.insert(memory.id.clone()) {
                self.db.bump_access(&memory.id).await?;
                memory.access_count += 1;
                memory.last_accessed_at = Utc::now();
                results.push((memory, PREFERENCE_TIER_SCORE));
            }
        }

        // Tier 2: keyword-filtered summaries, falling back to recent conversations.
        let tokens: Vec<String> =
            input.query.split_whitespace().map(|t| t.to_string()).filter(|t| !t.is_empty()).collect();
        let summary_hits = if tokens.is_empty() {
            Ok(Vec::new())
        } else {
            self.db.search_summaries_by_keywords(user_id, &tokens, SUMMARY_TIER_LIMIT).await
        };
        match summary_hits {
            Ok(hits) if !hits.is_empty() => {
                for mut memory in hits {
                    if seen.insert(memory.id.clone()) {
                        self.db.bump_access(&memory.id).await?;
                        memory.access_count += 1;
                        memory.last_accessed_at = Utc::now();
                        results.push((memory, SUMMARY_TIER_SCORE));
                    }
                }
            }
            Ok(_) => {
                // Zero rows (and no query error): fall back to recent conversations,
                // filler only — access counters are not bumped for these.
                let recent =
                    self.db.get_recent_conversations(user_id, CONVERSATION_FALLBACK_LIMIT).await?;
                for memory in recent {
                    if seen.insert(memory.id.clone()) {
                        results.push((memory, CONVERSATION_FALLBACK_SCORE));
                    }
                }
            }
            Err(e) => {
                tracing::warn!(user_id, error = %e, "summary keyword search failed, skipping fallback");
            }
        }

        // Tier 3: vector recall.
        let (vector, _provider) = self.embeddings.embed_one(&input.query).await?;
        let mut filter: Vec<(&str, &str)> = vec![("user_id", user_id)];
        if let Some(session_id) = &input.session_id {
            filter.push(("session_id", session_id.as_str()));
        }
        let neighbors = self.vectors.query(&vector, top_k, DEFAULT_EF_SEARCH, &filter)?;
        for (id, score) in neighbors {
            if seen.contains(&id) {
                continue;
            }
            let mut memory = match self.db.get_by_id(&id).await {
                Ok(memory) => memory,
                Err(EngineError::NotFound(_)) => continue,
                Err(e) => return Err(e),
            };
            if matches!(memory.kind, MemoryKind::Preference | MemoryKind::Summary) {
                continue;
            }
            seen.insert(memory.id.clone());
            self.db.bump_access(&memory.id).await?;
            memory.access_count += 1;
            memory.last_accessed_at = Utc::now();
            results.push((memory, score));
        }

        Ok(results)
    }

    pub async fn get_preferences(&self, user_id: &str, limit: Option<i64>) -> Result<Vec<Memory>> {
        self.db.search_preferences(user_id, limit.unwrap_or(DEFAULT_PREFERENCES_LIMIT)).await
    }

    pub async fn list(
        &self,
        user_id: &str,
        kind: Option<MemoryKind>,
        limit: Option<i64>,
        offset: Option<i64>,
    ) -> Result<Vec<Memory>> {
        self.db.list(user_id, kind, limit.unwrap_or(DEFAULT_LIST_LIMIT), offset.unwrap_or(0)).await
    }

    pub async fn stats(&self) -> Result<MemoryStats> {
        self.db.stats().await
    }

    pub async fn health(&self) -> Result<HealthStatus> {
        let count = self.db.count().await?;
        Ok(HealthStatus {
            status: "ok".to_string(),
            memory_count: count,
            version: env!("CARGO_PKG_VERSION").to_string(),
        })
    }

    /// Embeds `content` unless disabled or too short (§4.4 step 2).
    async fn summarize_if_warranted(&self, content: &str) -> String {
        if self.disable_summarizer || !self.llm.is_available() || content.len() <= SUMMARIZE_THRESHOLD
        {
            return String::new();
        }
        let prompt = format!(
            "Summarize the following text in one short factual sentence. \
             Reply with only the summary, no preamble.\n\n{content}"
        );
        match self.llm.complete(&prompt, None).await {
            Ok(summary) => summary.trim().to_string(),
            Err(e) => {
                tracing::warn!(error = %e, "summarizer failed, embedding raw content instead");
                String::new()
            }
        }
    }

    fn upsert_vector(&self, memory: &Memory, vector: Vec<f32>) -> Result<()> {
        let record =
            VectorRecord { id: memory.id.clone(), metadata: vector_metadata(memory), embedding: vector };
        self.vectors.upsert(&record)
    }

    /// Raw nearest-neighbor search against `query` under `user_id`, soft-deleting
    /// every hit at or above `threshold`. Used by both `set`'s pre-pass and
    /// `delete_by_query`. Returns the ids that were deleted.
    async fn semantic_delete(&self, user_id: &str, query: &str, threshold: f32) -> Result<Vec<String>> {
        let (vector, _provider) = self.embeddings.embed_one(query).await?;
        let hits =
            self.vectors.query(&vector, SEMANTIC_DELETE_TOP_K, DEFAULT_EF_SEARCH, &[("user_id", user_id)])?;

        let mut deleted = Vec::new();
        for (id, score) in hits {
            if score < threshold {
                continue;
            }
            self.db.soft_delete(&id).await?;
            self.vectors.delete(&id)?;
            deleted.push(id);
        }
        Ok(deleted)
    }
}

fn vector_metadata(memory: &Memory) -> HashMap<String, String> {
    let mut map = HashMap::new();
    map.insert("user_id".to_string(), memory.user_id.clone());
    if let Some(session_id) = &memory.session_id {
        map.insert("session_id".to_string(), session_id.clone());
    }
    if let Some(source) = &memory.source {
        map.insert("source".to_string(), source.clone());
    }
    map.insert("kind".to_string(), memory.kind.to_string());
    map
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DataConfig, EmbeddingStrategy, EmbeddingsConfig};
    use crate::db::{Database, LibSqlMetadataStore};
    use crate::vector::HnswConfig;

    async fn service() -> MemoryService {
        let db_path = tempfile::tempdir().unwrap().into_path().join("metadata.sqlite3");
        let data_config = DataConfig {
            metadata_db_path: db_path.to_string_lossy().into_owned(),
            vector_index_dir: std::env::temp_dir(),
        };
        let db = Database::new(&data_config).await.unwrap();
        let store: Arc<dyn MetadataStore> = Arc::new(LibSqlMetadataStore::new(db));

        let embeddings_config = EmbeddingsConfig {
            strategy: EmbeddingStrategy::LocalOnly,
            dimensions: 16,
            primary_cloud: None,
            alternate_cloud: None,
            disable_summarizer: true,
        };
        let embeddings = Arc::new(EmbeddingManager::new(&embeddings_config, store.clone()).await);

        let dir = tempfile::tempdir().unwrap();
        let vectors = Arc::new(VectorStore::new(16, dir.path().to_path_buf(), &HnswConfig::default()));

        let llm = Arc::new(LlmProvider::unavailable("test"));

        MemoryService::new(store, vectors, embeddings, llm, true)
    }

    #[tokio::test]
    async fn add_rejects_empty_content() {
        let service = service().await;
        let err = service.add(AddInput::new("u1", "   ")).await.unwrap_err();
        assert!(matches!(err, EngineError::BadInput(_)));
    }

    #[tokio::test]
    async fn add_then_search_finds_record_via_vector_tier() {
        let service = service().await;
        service.add(AddInput::new("u1", "the server IP is 1.2.3.4")).await.unwrap();

        let results = service.search(SearchInput::new("u1", "server IP")).await.unwrap();
        assert!(!results.is_empty());
        assert!(results.iter().all(|(m, _)| m.user_id == "u1"));
    }

    #[tokio::test]
    async fn search_tenant_isolation() {
        let service = service().await;
        let mut pref_u1 = AddInput::new("u1", "I like Go programming");
        pref_u1.kind = MemoryKind::Preference;
        service.add(pref_u1).await.unwrap();

        let mut pref_u2 = AddInput::new("u2", "I like Python");
        pref_u2.kind = MemoryKind::Preference;
        service.add(pref_u2).await.unwrap();

        let results = service.search(SearchInput::new("u1", "Go CLI")).await.unwrap();
        assert!(results.iter().all(|(m, _)| m.user_id == "u1"));
    }

    #[tokio::test]
    async fn preference_tier_scores_fixed_one() {
        let service = service().await;
        let mut pref = AddInput::new("u1", "I like Go programming");
        pref.kind = MemoryKind::Preference;
        service.add(pref).await.unwrap();

        let results = service.search(SearchInput::new("u1", "anything")).await.unwrap();
        let (_, score) = results.iter().find(|(m, _)| m.kind == MemoryKind::Preference).unwrap();
        assert_eq!(*score, PREFERENCE_TIER_SCORE);
    }

    #[tokio::test]
    async fn delete_is_idempotent() {
        let service = service().await;
        let memory = service.add(AddInput::new("u1", "ephemeral fact")).await.unwrap();
        service.delete(&memory.id).await.unwrap();
        service.delete(&memory.id).await.unwrap();
        assert!(matches!(service.db.get_by_id(&memory.id).await, Err(EngineError::NotFound(_))));
    }

    #[tokio::test]
    async fn set_without_id_falls_through_to_add() {
        let service = service().await;
        let memory = service.set(SetInput::new("u1", "a brand new fact")).await.unwrap();
        assert_eq!(memory.user_id, "u1");
        assert_eq!(memory.content, "a brand new fact");
    }

    #[tokio::test]
    async fn set_with_cross_tenant_id_falls_through_to_insert() {
        let service = service().await;
        let original = service.add(AddInput::new("u1", "owned by u1")).await.unwrap();

        let mut input = SetInput::new("u2", "trying to hijack");
        input.id = Some(original.id.clone());
        let result = service.set(input).await.unwrap();

        assert_eq!(result.user_id, "u2");
        assert_ne!(result.id, original.id);
    }

    #[tokio::test]
    async fn set_resurrects_soft_deleted_record_owned_by_caller() {
        let service = service().await;
        let original = service.add(AddInput::new("u1", "soon to be deleted")).await.unwrap();
        service.db.soft_delete(&original.id).await.unwrap();

        let mut input = SetInput::new("u1", "resurrected content");
        input.id = Some(original.id.clone());
        let result = service.set(input).await.unwrap();

        assert_eq!(result.id, original.id);
        assert_eq!(result.content, "resurrected content");
        assert!(result.deleted_at.is_none());
    }

    #[tokio::test]
    async fn update_fails_not_found_for_missing_id() {
        let service = service().await;
        let err = service.update("missing", UpdateInput { content: "x".into(), ..Default::default() }).await.unwrap_err();
        assert!(matches!(err, EngineError::NotFound(_)));
    }

    #[tokio::test]
    async fn budget_eviction_protects_facts_and_preferences() {
        let service = service().await;
        for i in 0..5 {
            service.add(AddInput::new("u1", format!("conversation {i}"))).await.unwrap();
        }
        for i in 0..2 {
            let mut input = AddInput::new("u1", format!("fact {i}"));
            input.kind = MemoryKind::Fact;
            service.add(input).await.unwrap();
        }

        let evicted = service.db.enforce_budget(3).await.unwrap();
        assert_eq!(evicted, 4);
        let stats = service.stats().await.unwrap();
        assert_eq!(stats.total_active, 3);
        assert_eq!(stats.per_kind[&MemoryKind::Fact.to_string()], 2);
    }
}
