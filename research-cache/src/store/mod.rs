pub mod pool;

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;
use tokio::sync::OnceCell;
use tokio_retry::Retry;
use tracing::{debug, instrument, warn};

use common::{
    error::AppError,
    storage::{
        db::SurrealDbClient,
        types::{cache_entry::CacheEntry, normalize_keyword, research_chunk::ResearchChunk},
    },
    utils::config::AppConfig,
};

use crate::chunking::Chunk;
use crate::embedding::RetryPolicy;

pub use pool::{QueryAddress, QueryPool};

/// Records written per round trip when persisting chunks.
const WRITE_BATCH_SIZE: usize = 100;

/// Search-effort parameter for the HNSW KNN operator.
const KNN_EF: usize = 40;

#[derive(Debug, Clone)]
pub struct VectorStoreConfig {
    pub cache_ttl: Duration,
    pub query_pool_size: usize,
    pub retry: RetryPolicy,
    /// Dedicated connection settings for the query channel. `None` (and the
    /// in-memory engine, which cannot share data across connections) reuses
    /// sessions of the primary client.
    pub query_address: Option<QueryAddress>,
}

impl VectorStoreConfig {
    pub fn from_app_config(config: &AppConfig) -> Self {
        let query_address = if config.surrealdb_address.starts_with("mem:") {
            None
        } else {
            Some(QueryAddress {
                address: config.surrealdb_address.clone(),
                username: config.surrealdb_username.clone(),
                password: config.surrealdb_password.clone(),
                namespace: config.surrealdb_namespace.clone(),
                database: config.surrealdb_database.clone(),
            })
        };
        Self {
            cache_ttl: Duration::hours(config.cache_ttl_hours),
            query_pool_size: config.query_pool_size,
            retry: RetryPolicy::from_app_config(config),
            query_address,
        }
    }
}

/// A cache entry together with the chunk records it references, in the
/// entry's `chunk_ids` order.
#[derive(Debug, Clone)]
pub struct CachedResearch {
    pub entry: CacheEntry,
    pub chunks: Vec<ResearchChunk>,
}

#[derive(Debug, Deserialize)]
struct KnnRow {
    id: String,
    distance: f32,
}

#[derive(Debug, Deserialize)]
struct CountRow {
    count: i64,
}

/// Durable persistence for chunk and cache-entry records: idempotent batched
/// writes, point lookup with lazy expiry, and nearest-neighbor similarity
/// search over a pooled query channel.
pub struct VectorStore {
    db: Arc<SurrealDbClient>,
    config: VectorStoreConfig,
    pool: OnceCell<Arc<QueryPool>>,
}

impl VectorStore {
    pub fn new(db: Arc<SurrealDbClient>, config: VectorStoreConfig) -> Self {
        Self {
            db,
            config,
            pool: OnceCell::new(),
        }
    }

    /// Lazily creates the query pool. `OnceCell` serializes concurrent first
    /// callers, so only one pool is ever built.
    async fn pool(&self) -> Result<&Arc<QueryPool>, AppError> {
        self.pool
            .get_or_try_init(|| async {
                let pool = match &self.config.query_address {
                    Some(address) => {
                        QueryPool::connect(address, self.config.query_pool_size).await?
                    }
                    None => QueryPool::from_client(&self.db, self.config.query_pool_size),
                };
                Ok::<_, AppError>(Arc::new(pool))
            })
            .await
    }

    /// Proactively exercises a few pooled connections so the first real
    /// similarity query does not pay connection-establishment latency.
    /// Failure to warm is non-fatal.
    pub async fn warm_pool(&self) {
        match self.pool().await {
            Ok(pool) => {
                pool.warm(3).await;
            }
            Err(e) => warn!(error = %e, "query pool warmup failed"),
        }
    }

    /// Persists chunks with their embeddings under `keyword`. Requires one
    /// embedding per chunk; ids are deterministic so re-storing identical
    /// content upserts. Writes go out in transactional batches with bounded
    /// retry for transient connectivity failures.
    #[instrument(skip_all, fields(keyword = %keyword, chunk_count = chunks.len()))]
    pub async fn store_chunks(
        &self,
        chunks: &[Chunk],
        embeddings: &[Vec<f32>],
        keyword: &str,
    ) -> Result<Vec<String>, AppError> {
        if chunks.len() != embeddings.len() {
            return Err(AppError::Validation(format!(
                "chunk/embedding shape mismatch: {} chunks vs {} embeddings",
                chunks.len(),
                embeddings.len()
            )));
        }

        let records: Vec<ResearchChunk> = chunks
            .iter()
            .zip(embeddings)
            .map(|(chunk, embedding)| {
                ResearchChunk::new(
                    chunk.content.clone(),
                    embedding.clone(),
                    keyword.to_string(),
                    serde_json::Value::Object(chunk.metadata.clone()),
                    chunk.chunk_index,
                    chunk.source_id.clone(),
                )
            })
            .collect();
        let ids: Vec<String> = records.iter().map(|record| record.id.clone()).collect();

        for batch in records.chunks(WRITE_BATCH_SIZE) {
            Retry::spawn(self.config.retry.strategy(), || self.write_batch(batch)).await?;
        }

        debug!(stored = ids.len(), "chunks persisted");
        Ok(ids)
    }

    /// One transactional round trip upserting every record in the batch.
    async fn write_batch(&self, batch: &[ResearchChunk]) -> Result<(), AppError> {
        let mut statements = String::from("BEGIN TRANSACTION;");
        for i in 0..batch.len() {
            statements.push_str(&format!(
                "UPSERT type::thing('research_chunk', $id{i}) CONTENT $content{i};"
            ));
        }
        statements.push_str("COMMIT TRANSACTION;");

        let mut query = self.db.client.query(statements);
        for (i, record) in batch.iter().enumerate() {
            query = query
                .bind((format!("id{i}"), record.id.clone()))
                .bind((format!("content{i}"), record.clone()));
        }
        query.await?;
        Ok(())
    }

    /// Upserts the cache entry for `keyword` with a fresh TTL and returns its
    /// deterministic id.
    #[instrument(skip_all, fields(keyword = %keyword))]
    pub async fn store_cache_entry(
        &self,
        keyword: &str,
        summary: String,
        chunk_ids: Vec<String>,
        metadata: serde_json::Value,
    ) -> Result<String, AppError> {
        let entry = CacheEntry::new(keyword, summary, chunk_ids, metadata, self.config.cache_ttl);
        let id = entry.id.clone();
        self.db.upsert_item(entry).await?;
        Ok(id)
    }

    /// Point lookup by the normalized keyword hash. Expired entries behave as
    /// absent (the record stays until cleanup); a live hit increments
    /// `hit_count`, refreshes `last_accessed`, and loads the referenced
    /// chunks.
    pub async fn get_cache_entry(&self, keyword: &str) -> Result<Option<CachedResearch>, AppError> {
        self.get_cache_entry_at(keyword, Utc::now()).await
    }

    /// `get_cache_entry` with an explicit clock, so expiry is testable.
    #[instrument(skip_all, fields(keyword = %keyword))]
    pub async fn get_cache_entry_at(
        &self,
        keyword: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<CachedResearch>, AppError> {
        let id = CacheEntry::deterministic_id(keyword);
        let Some(entry) = self.db.get_item::<CacheEntry>(&id).await? else {
            return Ok(None);
        };

        if entry.is_expired(now) {
            debug!(keyword, "cache entry expired, treating as absent");
            return Ok(None);
        }

        let updated: Option<CacheEntry> = self
            .db
            .client
            .query(
                "UPDATE type::thing('cache_entry', $id) \
                 SET hit_count += 1, last_accessed = time::now() RETURN AFTER",
            )
            .bind(("id", id))
            .await?
            .take(0)?;
        let entry = updated.unwrap_or(entry);

        let chunks = self.chunks_by_ids(&entry.chunk_ids).await?;
        Ok(Some(CachedResearch { entry, chunks }))
    }

    /// Fetches chunk records by id, preserving the requested order.
    async fn chunks_by_ids(&self, ids: &[String]) -> Result<Vec<ResearchChunk>, AppError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let mut fetched: Vec<ResearchChunk> = self
            .db
            .client
            .query("SELECT * FROM research_chunk WHERE record::id(id) IN $ids")
            .bind(("ids", ids.to_vec()))
            .await?
            .take(0)?;

        let position =
            |chunk: &ResearchChunk| ids.iter().position(|id| id == &chunk.id).unwrap_or(usize::MAX);
        fetched.sort_by_key(position);
        Ok(fetched)
    }

    /// Nearest-neighbor search over all persisted chunk embeddings. Results
    /// are filtered to `threshold`, ordered by descending similarity, and
    /// capped at `limit`.
    #[instrument(skip_all, fields(limit = limit, threshold = threshold))]
    pub async fn search_similar(
        &self,
        query: &[f32],
        limit: usize,
        threshold: f32,
    ) -> Result<Vec<(ResearchChunk, f32)>, AppError> {
        if query.is_empty() {
            return Err(AppError::Validation("query embedding is empty".into()));
        }
        let pool = Arc::clone(self.pool().await?);

        let rows: Vec<KnnRow> = Retry::spawn(self.config.retry.strategy(), || {
            let pool = Arc::clone(&pool);
            let query_vec = query.to_vec();
            async move {
                let lease = pool.acquire().await?;
                let mut response = lease
                    .client
                    .query(format!(
                        "SELECT record::id(id) AS id, vector::distance::knn() AS distance \
                         FROM research_chunk \
                         WHERE embedding <|{limit},{KNN_EF}|> $query \
                         ORDER BY distance"
                    ))
                    .bind(("query", query_vec))
                    .await?;
                Ok::<Vec<KnnRow>, AppError>(response.take(0)?)
            }
        })
        .await?;

        let mut results = Vec::with_capacity(rows.len());
        for row in rows {
            // Cosine distance -> cosine similarity.
            let similarity = 1.0 - row.distance;
            if similarity < threshold {
                continue;
            }
            if let Some(chunk) = self.db.get_item::<ResearchChunk>(&row.id).await? {
                results.push((chunk, similarity));
            }
        }
        results.truncate(limit);

        debug!(matches = results.len(), "similarity search complete");
        Ok(results)
    }

    /// All chunk records stored under `keyword`.
    pub async fn chunks_for_keyword(&self, keyword: &str) -> Result<Vec<ResearchChunk>, AppError> {
        let chunks: Vec<ResearchChunk> = self
            .db
            .client
            .query("SELECT * FROM research_chunk WHERE keyword = $keyword ORDER BY chunk_index")
            .bind(("keyword", keyword.to_string()))
            .await?
            .take(0)?;
        Ok(chunks)
    }

    /// Deletes records by age cutoff and/or keyword across both collections;
    /// with no filters everything goes. Returns the total removed.
    #[instrument(skip_all, fields(older_than_days = older_than_days))]
    pub async fn cleanup(
        &self,
        older_than_days: Option<i64>,
        keyword: Option<&str>,
    ) -> Result<u64, AppError> {
        let cutoff = older_than_days.map(|days| Utc::now() - Duration::days(days));

        let chunks_removed = self
            .delete_where(
                "research_chunk",
                "keyword",
                cutoff,
                keyword.map(str::to_string),
            )
            .await?;
        let entries_removed = self
            .delete_where(
                "cache_entry",
                "keyword_normalized",
                cutoff,
                keyword.map(normalize_keyword),
            )
            .await?;

        // Bulk deletions leave stale graph nodes in the HNSW index.
        if chunks_removed > 0 {
            self.db.rebuild_indexes().await?;
        }

        Ok(chunks_removed + entries_removed)
    }

    async fn delete_where(
        &self,
        table: &str,
        keyword_field: &str,
        cutoff: Option<DateTime<Utc>>,
        keyword: Option<String>,
    ) -> Result<u64, AppError> {
        let mut conditions = Vec::new();
        if cutoff.is_some() {
            conditions.push("created_at < $cutoff".to_string());
        }
        if keyword.is_some() {
            conditions.push(format!("{keyword_field} = $keyword"));
        }
        let where_clause = if conditions.is_empty() {
            String::new()
        } else {
            format!(" WHERE {}", conditions.join(" AND "))
        };

        let count_sql = format!("SELECT count() AS count FROM {table}{where_clause} GROUP ALL");
        let delete_sql = format!("DELETE {table}{where_clause}");

        let mut count_query = self.db.client.query(count_sql);
        let mut delete_query = self.db.client.query(delete_sql);
        if let Some(cutoff) = cutoff {
            let cutoff: surrealdb::sql::Datetime = cutoff.into();
            count_query = count_query.bind(("cutoff", cutoff.clone()));
            delete_query = delete_query.bind(("cutoff", cutoff));
        }
        if let Some(keyword) = keyword {
            count_query = count_query.bind(("keyword", keyword.clone()));
            delete_query = delete_query.bind(("keyword", keyword));
        }

        let counted: Option<CountRow> = count_query.await?.take(0)?;
        delete_query.await?;

        Ok(counted.map_or(0, |row| row.count.max(0) as u64))
    }

    pub async fn count_chunks(&self) -> Result<u64, AppError> {
        self.count_table("research_chunk").await
    }

    pub async fn count_entries(&self) -> Result<u64, AppError> {
        self.count_table("cache_entry").await
    }

    async fn count_table(&self, table: &str) -> Result<u64, AppError> {
        let counted: Option<CountRow> = self
            .db
            .client
            .query(format!("SELECT count() AS count FROM {table} GROUP ALL"))
            .await?
            .take(0)?;
        Ok(counted.map_or(0, |row| row.count.max(0) as u64))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Map};
    use uuid::Uuid;

    use common::utils::embedding::EmbeddingProvider;

    const TEST_DIMENSION: u32 = 3;

    async fn setup_store() -> VectorStore {
        let db = SurrealDbClient::memory("test_ns", &Uuid::new_v4().to_string())
            .await
            .expect("Failed to start in-memory surrealdb");
        db.ensure_initialized(TEST_DIMENSION)
            .await
            .expect("Failed to initialize schema");
        VectorStore::new(
            Arc::new(db),
            VectorStoreConfig {
                cache_ttl: Duration::hours(1),
                query_pool_size: 3,
                retry: RetryPolicy {
                    attempts: 3,
                    base_delay_ms: 10,
                },
                query_address: None,
            },
        )
    }

    fn chunk(content: &str, index: usize, role: &str) -> Chunk {
        let mut metadata = Map::new();
        metadata.insert("role".to_string(), json!(role));
        Chunk {
            content: content.to_string(),
            metadata,
            chunk_index: index,
            source_id: Some("result-1".to_string()),
        }
    }

    #[tokio::test]
    async fn store_chunks_rejects_shape_mismatch_without_partial_write() {
        let store = setup_store().await;
        let chunks = vec![
            chunk("First chunk.", 0, "research_summary"),
            chunk("Second chunk.", 1, "main_findings"),
            chunk("Third chunk.", 2, "statistics"),
        ];
        let embeddings = vec![vec![1.0, 0.0, 0.0], vec![0.0, 1.0, 0.0]];

        let result = store.store_chunks(&chunks, &embeddings, "topic").await;
        assert!(matches!(result, Err(AppError::Validation(_))));
        assert_eq!(store.count_chunks().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn storing_identical_chunks_twice_upserts_same_ids() {
        let store = setup_store().await;
        let chunks = vec![chunk("Stable content.", 0, "research_summary")];
        let embeddings = vec![vec![1.0, 0.0, 0.0]];

        let first = store
            .store_chunks(&chunks, &embeddings, "topic")
            .await
            .unwrap();
        let second = store
            .store_chunks(&chunks, &embeddings, "topic")
            .await
            .unwrap();

        assert_eq!(first, second);
        assert_eq!(store.count_chunks().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn cache_entry_lookup_is_normalization_invariant() {
        let store = setup_store().await;
        store
            .store_cache_entry(
                "Blood Sugar",
                "Summary.".to_string(),
                vec![],
                json!({}),
            )
            .await
            .unwrap();

        for variant in ["Blood Sugar", "blood sugar", "  blood sugar  "] {
            let found = store.get_cache_entry(variant).await.unwrap();
            assert!(found.is_some(), "lookup failed for {variant:?}");
        }
    }

    #[tokio::test]
    async fn cache_hits_increment_hit_count_and_last_accessed() {
        let store = setup_store().await;
        store
            .store_cache_entry("keto diet", "Summary.".to_string(), vec![], json!({}))
            .await
            .unwrap();

        let first = store.get_cache_entry("keto diet").await.unwrap().unwrap();
        assert_eq!(first.entry.hit_count, 1);

        let second = store.get_cache_entry("keto diet").await.unwrap().unwrap();
        assert_eq!(second.entry.hit_count, 2);
        assert!(second.entry.last_accessed >= first.entry.last_accessed);
    }

    #[tokio::test]
    async fn expired_entries_read_as_absent_but_survive_until_cleanup() {
        let store = setup_store().await;
        store
            .store_cache_entry("keto diet", "Summary.".to_string(), vec![], json!({}))
            .await
            .unwrap();

        // TTL is 1 hour; two hours later the entry must read as absent.
        let later = Utc::now() + Duration::hours(2);
        let found = store.get_cache_entry_at("keto diet", later).await.unwrap();
        assert!(found.is_none());

        // The record itself is still there until cleanup runs.
        assert_eq!(store.count_entries().await.unwrap(), 1);
        let removed = store.cleanup(None, Some("keto diet")).await.unwrap();
        assert_eq!(removed, 1);
        assert_eq!(store.count_entries().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn entry_lookup_returns_chunks_in_id_order() {
        let store = setup_store().await;
        let chunks = vec![
            chunk("Summary chunk.", 0, "research_summary"),
            chunk("Findings chunk.", 1, "main_findings"),
        ];
        let embeddings = vec![vec![1.0, 0.0, 0.0], vec![0.0, 1.0, 0.0]];
        let ids = store
            .store_chunks(&chunks, &embeddings, "topic")
            .await
            .unwrap();

        // Reference the chunks in reverse to prove order is preserved.
        let reversed: Vec<String> = ids.iter().rev().cloned().collect();
        store
            .store_cache_entry("topic", "Summary.".to_string(), reversed.clone(), json!({}))
            .await
            .unwrap();

        let cached = store.get_cache_entry("topic").await.unwrap().unwrap();
        let fetched_ids: Vec<&str> = cached.chunks.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(fetched_ids, reversed.iter().map(String::as_str).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn search_similar_filters_orders_and_caps() {
        let store = setup_store().await;
        let chunks = vec![
            chunk("Close match.", 0, "main_findings"),
            chunk("Medium match.", 1, "main_findings"),
            chunk("Far match.", 2, "main_findings"),
        ];
        let embeddings = vec![
            vec![1.0, 0.0, 0.0],
            vec![0.8, 0.6, 0.0],
            vec![0.0, 1.0, 0.0],
        ];
        store
            .store_chunks(&chunks, &embeddings, "topic")
            .await
            .unwrap();

        let results = store
            .search_similar(&[1.0, 0.0, 0.0], 10, 0.7)
            .await
            .unwrap();

        assert_eq!(results.len(), 2, "orthogonal vector must be filtered out");
        assert_eq!(results[0].0.content, "Close match.");
        assert!(results[0].1 > results[1].1);
        for (_, similarity) in &results {
            assert!(*similarity >= 0.7);
        }

        let capped = store
            .search_similar(&[1.0, 0.0, 0.0], 1, 0.0)
            .await
            .unwrap();
        assert_eq!(capped.len(), 1);
    }

    #[tokio::test]
    async fn cleanup_by_keyword_spares_other_topics() {
        let store = setup_store().await;
        store
            .store_chunks(
                &[chunk("Keto content.", 0, "research_summary")],
                &[vec![1.0, 0.0, 0.0]],
                "keto diet",
            )
            .await
            .unwrap();
        store
            .store_chunks(
                &[chunk("Fasting content.", 0, "research_summary")],
                &[vec![0.0, 1.0, 0.0]],
                "intermittent fasting",
            )
            .await
            .unwrap();
        store
            .store_cache_entry("keto diet", "Summary.".to_string(), vec![], json!({}))
            .await
            .unwrap();

        let removed = store.cleanup(None, Some("keto diet")).await.unwrap();
        assert_eq!(removed, 2, "one chunk plus one entry");
        assert_eq!(store.count_chunks().await.unwrap(), 1);

        let spared = store.chunks_for_keyword("intermittent fasting").await.unwrap();
        assert_eq!(spared.len(), 1);
        assert_eq!(spared[0].content, "Fasting content.");
        assert!(store.chunks_for_keyword("keto diet").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn cleanup_without_filters_removes_everything() {
        let store = setup_store().await;
        store
            .store_chunks(
                &[chunk("Content.", 0, "research_summary")],
                &[vec![1.0, 0.0, 0.0]],
                "topic",
            )
            .await
            .unwrap();
        store
            .store_cache_entry("topic", "Summary.".to_string(), vec![], json!({}))
            .await
            .unwrap();

        let removed = store.cleanup(None, None).await.unwrap();
        assert_eq!(removed, 2);
        assert_eq!(store.count_chunks().await.unwrap(), 0);
        assert_eq!(store.count_entries().await.unwrap(), 0);

        // Age-based cleanup with a zero-day cutoff is a no-op on fresh data.
        store
            .store_cache_entry("topic", "Summary.".to_string(), vec![], json!({}))
            .await
            .unwrap();
        let removed = store.cleanup(Some(1), None).await.unwrap();
        assert_eq!(removed, 0);
    }

    #[tokio::test]
    async fn warm_pool_is_non_fatal() {
        let store = setup_store().await;
        store.warm_pool().await;

        // Pool is usable afterwards.
        let provider = EmbeddingProvider::new_hashed(TEST_DIMENSION as usize);
        let query = provider.embed("anything").await.unwrap();
        let results = store.search_similar(&query, 5, 0.0).await.unwrap();
        assert!(results.is_empty());
    }
}
