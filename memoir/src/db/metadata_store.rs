use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use libsql::params;
use nanoid::nanoid;

use crate::error::{EngineError, Result};
use crate::models::{Memory, MemoryKind};

use super::connection::Database;
use super::row::{memory_from_row, SELECT_COLUMNS};
use super::write_queue::WriteQueue;

/// Aggregate counts surfaced by `MemoryService::stats`: visible total,
/// soft-deleted total, and a breakdown of visible records by `kind`.
#[derive(Debug, Clone, serde::Serialize)]
pub struct MemoryStats {
    pub total_active: i64,
    pub total_deleted: i64,
    pub per_kind: HashMap<String, i64>,
}

/// A single embedding cache hit: the vector and the provider tier that produced it.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub vector: Vec<f32>,
    pub provider: String,
}

/// Storage contract for everything in `memories`, `embedding_cache`, and
/// `dream_log`. Tenant isolation is enforced by callers always supplying
/// `user_id`; this trait never offers a method that can cross tenants by
/// accident.
#[async_trait]
pub trait MetadataStore: Send + Sync {
    async fn insert(&self, memory: Memory) -> Result<()>;
    async fn get_by_id(&self, id: &str) -> Result<Memory>;
    async fn get_by_id_including_deleted(&self, id: &str) -> Result<Memory>;
    async fn get_by_ids(&self, ids: &[String]) -> Result<Vec<Memory>>;
    async fn count(&self) -> Result<i64>;
    async fn stats(&self) -> Result<MemoryStats>;
    async fn list(&self, user_id: &str, kind: Option<MemoryKind>, limit: i64, offset: i64) -> Result<Vec<Memory>>;
    async fn soft_delete(&self, id: &str) -> Result<()>;
    async fn soft_delete_batch(&self, ids: &[String]) -> Result<u64>;
    async fn update_record(&self, memory: &Memory) -> Result<()>;
    async fn bump_access(&self, id: &str) -> Result<()>;
    async fn get_recent_active(&self, since: DateTime<Utc>, limit: i64) -> Result<Vec<Memory>>;
    async fn search_preferences(&self, user_id: &str, limit: i64) -> Result<Vec<Memory>>;
    async fn search_summaries_by_keywords(
        &self,
        user_id: &str,
        keywords: &[String],
        limit: i64,
    ) -> Result<Vec<Memory>>;
    async fn get_recent_conversations(&self, user_id: &str, limit: i64) -> Result<Vec<Memory>>;
    async fn mark_consolidated(&self, ids: &[String]) -> Result<()>;
    async fn get_local_memories(&self, limit: i64) -> Result<Vec<Memory>>;
    async fn update_provider(&self, id: &str, provider: &str) -> Result<()>;
    async fn clean_expired_conversations(&self, days: i64, max_access_count: i64) -> Result<u64>;
    async fn enforce_budget(&self, max_count: i64) -> Result<u64>;
    async fn cache_get(&self, hash: &str) -> Result<Option<CacheEntry>>;
    async fn cache_put(&self, hash: &str, vector: &[f32], provider: &str) -> Result<()>;
    async fn log_dream_start(&self, input_count: i64) -> Result<String>;
    async fn log_dream_finish(
        &self,
        log_id: &str,
        output_count: i64,
        status: &str,
        error_msg: Option<&str>,
    ) -> Result<()>;

    /// Stops accepting new queued writes and flushes everything still
    /// buffered in the write queue before returning, per §5's shutdown
    /// contract. Safe to call more than once.
    async fn close(&self);
}

/// libsql-backed [`MetadataStore`]. `insert`/`bump_access` route through the
/// bounded write queue; every other mutation writes directly, since none of
/// them sit on the memory-ingestion hot path.
pub struct LibSqlMetadataStore {
    db: Database,
    queue: WriteQueue,
}

impl LibSqlMetadataStore {
    pub fn new(db: Database) -> Self {
        let queue = WriteQueue::spawn(db.clone());
        Self { db, queue }
    }
}

#[async_trait]
impl MetadataStore for LibSqlMetadataStore {
    async fn insert(&self, memory: Memory) -> Result<()> {
        self.queue.insert(&self.db, memory).await
    }

    async fn get_by_id(&self, id: &str) -> Result<Memory> {
        let conn = self.db.connect()?;
        let sql = format!(
            "SELECT {SELECT_COLUMNS} FROM memories WHERE id = ?1 AND deleted_at IS NULL"
        );
        let mut rows = conn.query(&sql, params![id]).await?;
        match rows.next().await? {
            Some(row) => memory_from_row(&row),
            None => Err(EngineError::NotFound(id.to_string())),
        }
    }

    async fn get_by_id_including_deleted(&self, id: &str) -> Result<Memory> {
        let conn = self.db.connect()?;
        let sql = format!("SELECT {SELECT_COLUMNS} FROM memories WHERE id = ?1");
        let mut rows = conn.query(&sql, params![id]).await?;
        match rows.next().await? {
            Some(row) => memory_from_row(&row),
            None => Err(EngineError::NotFound(id.to_string())),
        }
    }

    async fn get_by_ids(&self, ids: &[String]) -> Result<Vec<Memory>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let conn = self.db.connect()?;
        let placeholders = (1..=ids.len()).map(|i| format!("?{i}")).collect::<Vec<_>>().join(",");
        let sql = format!(
            "SELECT {SELECT_COLUMNS} FROM memories WHERE id IN ({placeholders}) AND deleted_at IS NULL"
        );
        let params = libsql::params::Params::Positional(
            ids.iter().map(|id| libsql::Value::from(id.clone())).collect(),
        );
        let mut rows = conn.query(&sql, params).await?;
        let mut out = Vec::new();
        while let Some(row) = rows.next().await? {
            out.push(memory_from_row(&row)?);
        }
        Ok(out)
    }

    async fn count(&self) -> Result<i64> {
        let conn = self.db.connect()?;
        let mut rows = conn
            .query("SELECT COUNT(*) FROM memories WHERE deleted_at IS NULL", ())
            .await?;
        let row = rows.next().await?.expect("COUNT(*) always returns a row");
        Ok(row.get(0)?)
    }

    async fn stats(&self) -> Result<MemoryStats> {
        let conn = self.db.connect()?;
        let mut rows = conn
            .query(
                "SELECT
                    COUNT(*) FILTER (WHERE deleted_at IS NULL),
                    COUNT(*) FILTER (WHERE deleted_at IS NOT NULL),
                    COUNT(*) FILTER (WHERE deleted_at IS NULL AND kind = 'conversation'),
                    COUNT(*) FILTER (WHERE deleted_at IS NULL AND kind = 'fact'),
                    COUNT(*) FILTER (WHERE deleted_at IS NULL AND kind = 'preference'),
                    COUNT(*) FILTER (WHERE deleted_at IS NULL AND kind = 'summary')
                 FROM memories",
                (),
            )
            .await?;
        let row = rows.next().await?.expect("aggregate query always returns a row");
        let mut per_kind = HashMap::new();
        per_kind.insert(MemoryKind::Conversation.to_string(), row.get::<i64>(2)?);
        per_kind.insert(MemoryKind::Fact.to_string(), row.get::<i64>(3)?);
        per_kind.insert(MemoryKind::Preference.to_string(), row.get::<i64>(4)?);
        per_kind.insert(MemoryKind::Summary.to_string(), row.get::<i64>(5)?);
        Ok(MemoryStats {
            total_active: row.get(0)?,
            total_deleted: row.get(1)?,
            per_kind,
        })
    }

    async fn list(&self, user_id: &str, kind: Option<MemoryKind>, limit: i64, offset: i64) -> Result<Vec<Memory>> {
        let conn = self.db.connect()?;
        let mut out = Vec::new();
        let mut rows = if let Some(kind) = kind {
            let sql = format!(
                "SELECT {SELECT_COLUMNS} FROM memories
                 WHERE user_id = ?1 AND kind = ?2 AND deleted_at IS NULL
                 ORDER BY created_at DESC LIMIT ?3 OFFSET ?4"
            );
            conn.query(&sql, params![user_id, kind.to_string(), limit, offset]).await?
        } else {
            let sql = format!(
                "SELECT {SELECT_COLUMNS} FROM memories
                 WHERE user_id = ?1 AND deleted_at IS NULL
                 ORDER BY created_at DESC LIMIT ?2 OFFSET ?3"
            );
            conn.query(&sql, params![user_id, limit, offset]).await?
        };
        while let Some(row) = rows.next().await? {
            out.push(memory_from_row(&row)?);
        }
        Ok(out)
    }

    async fn soft_delete(&self, id: &str) -> Result<()> {
        let conn = self.db.connect()?;
        let now = Utc::now().to_rfc3339();
        conn.execute(
            "UPDATE memories SET deleted_at = ?1, updated_at = ?1 WHERE id = ?2 AND deleted_at IS NULL",
            params![now, id],
        )
        .await?;
        Ok(())
    }

    async fn soft_delete_batch(&self, ids: &[String]) -> Result<u64> {
        if ids.is_empty() {
            return Ok(0);
        }
        let conn = self.db.connect()?;
        let now = Utc::now().to_rfc3339();
        let placeholders = (2..=ids.len() + 1).map(|i| format!("?{i}")).collect::<Vec<_>>().join(",");
        let sql = format!(
            "UPDATE memories SET deleted_at = ?1, updated_at = ?1
             WHERE id IN ({placeholders}) AND deleted_at IS NULL"
        );
        let mut values = vec![libsql::Value::from(now)];
        values.extend(ids.iter().map(|id| libsql::Value::from(id.clone())));
        let affected = conn
            .execute(&sql, libsql::params::Params::Positional(values))
            .await?;
        Ok(affected)
    }

    async fn update_record(&self, memory: &Memory) -> Result<()> {
        let conn = self.db.connect()?;
        let tags = serde_json::to_string(&memory.tags)?;
        conn.execute(
            "UPDATE memories SET
                content = ?1, summary = ?2, kind = ?3, source = ?4, tags = ?5,
                embed_provider = ?6, status = ?7, updated_at = ?8, deleted_at = ?9
             WHERE id = ?10",
            params![
                memory.content.clone(),
                memory.summary.clone(),
                memory.kind.to_string(),
                memory.source.clone(),
                tags,
                memory.embed_provider.clone(),
                memory.status.to_string(),
                memory.updated_at.to_rfc3339(),
                memory.deleted_at.map(|d| d.to_rfc3339()),
                memory.id.clone(),
            ],
        )
        .await?;
        Ok(())
    }

    async fn bump_access(&self, id: &str) -> Result<()> {
        self.queue.bump_access(&self.db, id).await
    }

    async fn get_recent_active(&self, since: DateTime<Utc>, limit: i64) -> Result<Vec<Memory>> {
        let conn = self.db.connect()?;
        let sql = format!(
            "SELECT {SELECT_COLUMNS} FROM memories
             WHERE deleted_at IS NULL AND status = 'active' AND created_at >= ?1
             ORDER BY created_at ASC LIMIT ?2"
        );
        let mut rows = conn.query(&sql, params![since.to_rfc3339(), limit]).await?;
        let mut out = Vec::new();
        while let Some(row) = rows.next().await? {
            out.push(memory_from_row(&row)?);
        }
        Ok(out)
    }

    async fn search_preferences(&self, user_id: &str, limit: i64) -> Result<Vec<Memory>> {
        let conn = self.db.connect()?;
        let sql = format!(
            "SELECT {SELECT_COLUMNS} FROM memories
             WHERE user_id = ?1 AND kind = 'preference' AND deleted_at IS NULL
             ORDER BY updated_at DESC LIMIT ?2"
        );
        let mut rows = conn.query(&sql, params![user_id, limit]).await?;
        let mut out = Vec::new();
        while let Some(row) = rows.next().await? {
            out.push(memory_from_row(&row)?);
        }
        Ok(out)
    }

    async fn search_summaries_by_keywords(
        &self,
        user_id: &str,
        keywords: &[String],
        limit: i64,
    ) -> Result<Vec<Memory>> {
        if keywords.is_empty() {
            return Ok(Vec::new());
        }
        let conn = self.db.connect()?;
        let clauses = (0..keywords.len())
            .map(|i| format!("(summary LIKE ?{0} OR content LIKE ?{0})", i + 2))
            .collect::<Vec<_>>()
            .join(" OR ");
        let limit_placeholder = keywords.len() + 2;
        let sql = format!(
            "SELECT {SELECT_COLUMNS} FROM memories
             WHERE user_id = ?1 AND deleted_at IS NULL AND kind = 'summary' AND ({clauses})
             ORDER BY updated_at DESC LIMIT ?{limit_placeholder}"
        );
        let mut values = vec![libsql::Value::from(user_id.to_string())];
        values.extend(keywords.iter().map(|k| libsql::Value::from(format!("%{k}%"))));
        values.push(libsql::Value::from(limit));
        let mut rows = conn
            .query(&sql, libsql::params::Params::Positional(values))
            .await?;
        let mut out = Vec::new();
        while let Some(row) = rows.next().await? {
            out.push(memory_from_row(&row)?);
        }
        Ok(out)
    }

    async fn get_recent_conversations(&self, user_id: &str, limit: i64) -> Result<Vec<Memory>> {
        let conn = self.db.connect()?;
        let sql = format!(
            "SELECT {SELECT_COLUMNS} FROM memories
             WHERE user_id = ?1 AND kind = 'conversation' AND deleted_at IS NULL
             ORDER BY created_at DESC LIMIT ?2"
        );
        let mut rows = conn.query(&sql, params![user_id, limit]).await?;
        let mut out = Vec::new();
        while let Some(row) = rows.next().await? {
            out.push(memory_from_row(&row)?);
        }
        Ok(out)
    }

    async fn mark_consolidated(&self, ids: &[String]) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let conn = self.db.connect()?;
        let now = Utc::now().to_rfc3339();
        let placeholders = (2..=ids.len() + 1).map(|i| format!("?{i}")).collect::<Vec<_>>().join(",");
        let sql = format!(
            "UPDATE memories SET status = 'consolidated', updated_at = ?1 WHERE id IN ({placeholders})"
        );
        let mut values = vec![libsql::Value::from(now)];
        values.extend(ids.iter().map(|id| libsql::Value::from(id.clone())));
        conn.execute(&sql, libsql::params::Params::Positional(values)).await?;
        Ok(())
    }

    async fn get_local_memories(&self, limit: i64) -> Result<Vec<Memory>> {
        let conn = self.db.connect()?;
        let sql = format!(
            "SELECT {SELECT_COLUMNS} FROM memories
             WHERE deleted_at IS NULL AND embed_provider = 'local'
             ORDER BY created_at ASC LIMIT ?1"
        );
        let mut rows = conn.query(&sql, params![limit]).await?;
        let mut out = Vec::new();
        while let Some(row) = rows.next().await? {
            out.push(memory_from_row(&row)?);
        }
        Ok(out)
    }

    async fn update_provider(&self, id: &str, provider: &str) -> Result<()> {
        let conn = self.db.connect()?;
        conn.execute(
            "UPDATE memories SET embed_provider = ?1 WHERE id = ?2",
            params![provider, id],
        )
        .await?;
        Ok(())
    }

    async fn clean_expired_conversations(&self, days: i64, max_access_count: i64) -> Result<u64> {
        let conn = self.db.connect()?;
        let now = Utc::now().to_rfc3339();
        let affected = conn
            .execute(
                "UPDATE memories SET deleted_at = ?1, updated_at = ?1
                 WHERE deleted_at IS NULL AND kind = 'conversation'
                   AND access_count <= ?2
                   AND last_accessed_at <= datetime(?1, '-' || ?3 || ' days')",
                params![now, max_access_count, days],
            )
            .await?;
        Ok(affected)
    }

    async fn enforce_budget(&self, max_count: i64) -> Result<u64> {
        let conn = self.db.connect()?;
        let total: i64 = {
            let mut rows = conn
                .query("SELECT COUNT(*) FROM memories WHERE deleted_at IS NULL", ())
                .await?;
            rows.next().await?.expect("COUNT(*) always returns a row").get(0)?
        };
        let overflow = total - max_count;
        if overflow <= 0 {
            return Ok(0);
        }
        let now = Utc::now().to_rfc3339();
        let affected = conn
            .execute(
                "UPDATE memories SET deleted_at = ?1, updated_at = ?1
                 WHERE id IN (
                    SELECT id FROM memories
                    WHERE deleted_at IS NULL AND kind NOT IN ('fact', 'preference')
                    ORDER BY access_count ASC, created_at ASC
                    LIMIT ?2
                 )",
                params![now, overflow],
            )
            .await?;
        Ok(affected)
    }

    async fn cache_get(&self, hash: &str) -> Result<Option<CacheEntry>> {
        let conn = self.db.connect()?;
        let mut rows = conn
            .query(
                "SELECT vector, provider FROM embedding_cache WHERE hash = ?1",
                params![hash],
            )
            .await?;
        match rows.next().await? {
            Some(row) => {
                let vector_json: String = row.get(0)?;
                let vector: Vec<f32> = serde_json::from_str(&vector_json)?;
                Ok(Some(CacheEntry { vector, provider: row.get(1)? }))
            }
            None => Ok(None),
        }
    }

    async fn cache_put(&self, hash: &str, vector: &[f32], provider: &str) -> Result<()> {
        let conn = self.db.connect()?;
        let vector_json = serde_json::to_string(vector)?;
        conn.execute(
            "INSERT INTO embedding_cache (hash, vector, provider, created_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(hash) DO UPDATE SET vector = excluded.vector, provider = excluded.provider, created_at = excluded.created_at",
            params![hash, vector_json, provider, Utc::now().to_rfc3339()],
        )
        .await?;
        Ok(())
    }

    async fn log_dream_start(&self, input_count: i64) -> Result<String> {
        let conn = self.db.connect()?;
        let id = nanoid!();
        conn.execute(
            "INSERT INTO dream_log (id, started_at, input_count, status) VALUES (?1, ?2, ?3, 'running')",
            params![id.clone(), Utc::now().to_rfc3339(), input_count],
        )
        .await?;
        Ok(id)
    }

    async fn log_dream_finish(
        &self,
        log_id: &str,
        output_count: i64,
        status: &str,
        error_msg: Option<&str>,
    ) -> Result<()> {
        let conn = self.db.connect()?;
        conn.execute(
            "UPDATE dream_log SET finished_at = ?1, output_count = ?2, status = ?3, error_msg = ?4 WHERE id = ?5",
            params![Utc::now().to_rfc3339(), output_count, status, error_msg, log_id],
        )
        .await?;
        Ok(())
    }

    async fn close(&self) {
        self.queue.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DataConfig;
    use crate::models::Memory;

    async fn store() -> LibSqlMetadataStore {
        let db_path = tempfile::tempdir().unwrap().into_path().join("metadata.sqlite3");
        let config = DataConfig {
            metadata_db_path: db_path.to_string_lossy().into_owned(),
            vector_index_dir: std::env::temp_dir(),
        };
        let db = Database::new(&config).await.unwrap();
        LibSqlMetadataStore::new(db)
    }

    #[tokio::test]
    async fn insert_then_get_round_trips() {
        let store = store().await;
        let memory = Memory::new("m1".into(), "u1".into(), "hello".into());
        store.insert(memory.clone()).await.unwrap();

        let fetched = store.get_by_id("m1").await.unwrap();
        assert_eq!(fetched.content, "hello");
        assert_eq!(fetched.user_id, "u1");
    }

    #[tokio::test]
    async fn soft_deleted_memory_is_excluded_from_get_by_id() {
        let store = store().await;
        let memory = Memory::new("m2".into(), "u1".into(), "secret".into());
        store.insert(memory).await.unwrap();
        store.soft_delete("m2").await.unwrap();

        assert!(matches!(store.get_by_id("m2").await, Err(EngineError::NotFound(_))));
        assert!(store.get_by_id_including_deleted("m2").await.is_ok());
    }

    #[tokio::test]
    async fn bump_access_increments_count() {
        let store = store().await;
        let memory = Memory::new("m3".into(), "u1".into(), "content".into());
        store.insert(memory).await.unwrap();
        store.bump_access("m3").await.unwrap();
        store.bump_access("m3").await.unwrap();

        let fetched = store.get_by_id("m3").await.unwrap();
        assert_eq!(fetched.access_count, 2);
    }

    #[tokio::test]
    async fn cache_put_then_get_round_trips() {
        let store = store().await;
        store.cache_put("h1", &[0.1, 0.2, 0.3], "cloud").await.unwrap();
        let entry = store.cache_get("h1").await.unwrap().unwrap();
        assert_eq!(entry.provider, "cloud");
        assert_eq!(entry.vector, vec![0.1, 0.2, 0.3]);

        assert!(store.cache_get("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn enforce_budget_evicts_lowest_access_non_protected_first() {
        let store = store().await;
        for i in 0..3 {
            let mut m = Memory::new(format!("c{i}"), "u1".into(), "chat".into());
            m.kind = MemoryKind::Conversation;
            store.insert(m).await.unwrap();
        }
        let mut protected = Memory::new("fact0".into(), "u1".into(), "pinned fact".into());
        protected.kind = MemoryKind::Fact;
        store.insert(protected).await.unwrap();

        let evicted = store.enforce_budget(2).await.unwrap();
        assert_eq!(evicted, 2);
        assert!(store.get_by_id("fact0").await.is_ok());
    }

    #[tokio::test]
    async fn dream_log_start_and_finish_round_trip() {
        let store = store().await;
        let id = store.log_dream_start(5).await.unwrap();
        store.log_dream_finish(&id, 2, "ok", None).await.unwrap();
    }

    #[tokio::test]
    async fn stats_reports_deleted_total_and_per_kind_breakdown() {
        let store = store().await;
        let mut fact = Memory::new("s-fact".into(), "u1".into(), "a fact".into());
        fact.kind = MemoryKind::Fact;
        store.insert(fact).await.unwrap();
        let convo = Memory::new("s-convo".into(), "u1".into(), "a chat".into());
        store.insert(convo).await.unwrap();
        store.soft_delete("s-convo").await.unwrap();

        let stats = store.stats().await.unwrap();
        assert_eq!(stats.total_active, 1);
        assert_eq!(stats.total_deleted, 1);
        assert_eq!(stats.per_kind[&MemoryKind::Fact.to_string()], 1);
        assert_eq!(stats.per_kind[&MemoryKind::Conversation.to_string()], 0);
    }
}
