pub mod producer;
pub mod result;

use std::sync::Arc;
use std::time::Instant;

use serde_json::{json, Map, Value};
use tracing::{debug, info, instrument, warn};

use common::{error::AppError, storage::types::normalize_keyword, utils::config::AppConfig};

use crate::chunking::{Chunk, TextChunker};
use crate::embedding::EmbeddingService;
use crate::stats::{CacheStatistics, ExportFormat, StatsRegistry};
use crate::store::VectorStore;

use common::storage::types::research_chunk::ResearchChunk;
pub use producer::{ProducerOutput, ResearchProducer};
pub use result::{
    ResearchResult, SourceRecord, FINDINGS_DELIMITER, ROLE_FINDINGS, ROLE_SOURCE, ROLE_STATISTICS,
    ROLE_SUMMARY, STATISTICS_DELIMITER,
};

/// Orchestrator tuning; everything else lives on the composed services.
#[derive(Debug, Clone, Copy)]
pub struct ResearchOptions {
    pub similarity_threshold: f32,
    pub search_limit: usize,
    pub embedding_batch_size: usize,
}

impl ResearchOptions {
    pub fn from_app_config(config: &AppConfig) -> Self {
        Self {
            similarity_threshold: config.similarity_threshold,
            search_limit: default_search_limit(),
            embedding_batch_size: config.embedding_batch_size,
        }
    }
}

fn default_search_limit() -> usize {
    20
}

/// Per-topic outcome of a cache-warming run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WarmOutcome {
    Success,
    AlreadyCached,
    Error(String),
}

/// Turns an expensive "research a topic" operation into a cheap, idempotent,
/// similarity-aware lookup: exact cache, then semantic cache, then the
/// injected producer, with a best-effort write-back.
pub struct ResearchCache {
    chunker: Arc<TextChunker>,
    embeddings: Arc<EmbeddingService>,
    store: Arc<VectorStore>,
    stats: Arc<StatsRegistry>,
    options: ResearchOptions,
}

impl ResearchCache {
    pub fn new(
        chunker: TextChunker,
        embeddings: EmbeddingService,
        store: VectorStore,
        stats: Arc<StatsRegistry>,
        options: ResearchOptions,
    ) -> Self {
        Self {
            chunker: Arc::new(chunker),
            embeddings: Arc::new(embeddings),
            store: Arc::new(store),
            stats,
            options,
        }
    }

    pub fn store(&self) -> &Arc<VectorStore> {
        &self.store
    }

    pub fn stats(&self) -> CacheStatistics {
        self.stats.snapshot()
    }

    pub fn export_stats(&self, format: ExportFormat) -> String {
        self.stats.snapshot().export(format)
    }

    /// Resolves a topic through the two-tier cache, invoking `producer` only
    /// when both tiers miss. A cache-layer failure on either tier degrades to
    /// the next tier; the request never fails because the cache could not
    /// read or write its own storage. Producer failures propagate as-is.
    #[instrument(skip_all, fields(topic = %topic))]
    pub async fn research(
        &self,
        topic: &str,
        producer: &dyn ResearchProducer,
    ) -> Result<ResearchResult, AppError> {
        let started = Instant::now();
        self.stats.record_request();

        if topic.trim().is_empty() {
            return Err(AppError::Validation("topic must not be empty".into()));
        }

        // CHECK_EXACT
        match self.store.get_cache_entry(topic).await {
            Ok(Some(cached)) => {
                debug!(topic, "exact cache hit");
                let result = ResearchResult::from_entry(&cached.entry, &cached.chunks);
                self.stats.record_exact_hit(started.elapsed());
                return Ok(result);
            }
            Ok(None) => {}
            Err(e) => warn!(topic, error = %e, "exact lookup failed, trying semantic tier"),
        }

        // CHECK_SEMANTIC
        match self.semantic_lookup(topic).await {
            Ok(Some(result)) => {
                debug!(topic, "semantic cache hit");
                self.stats.record_semantic_hit(started.elapsed());
                return Ok(result);
            }
            Ok(None) => {}
            Err(e) => warn!(topic, error = %e, "semantic lookup failed, producing"),
        }

        // PRODUCE
        let output = match producer.produce(topic).await {
            Ok(output) => output,
            Err(e) => {
                warn!(topic, error = %e, "producer failed");
                self.stats.record_error();
                return Err(e);
            }
        };
        let result = match output {
            ProducerOutput::Canonical(mut result) => {
                result.keyword = topic.to_string();
                result
            }
            ProducerOutput::Raw(raw) => ResearchResult::from_raw(topic, &raw),
        };
        self.stats.record_miss(started.elapsed());
        info!(topic, sources = result.sources.len(), "research produced");

        // PERSIST, detached from the caller's response.
        self.spawn_persist(topic.to_string(), result.clone());

        Ok(result)
    }

    /// Runs step one for each topic and the full pipeline for the rest,
    /// accumulating per-topic outcomes.
    pub async fn warm_cache(
        &self,
        topics: &[String],
        producer: &dyn ResearchProducer,
    ) -> Vec<(String, WarmOutcome)> {
        let mut outcomes = Vec::with_capacity(topics.len());
        for topic in topics {
            let outcome = match self.store.get_cache_entry(topic).await {
                Ok(Some(_)) => WarmOutcome::AlreadyCached,
                Ok(None) | Err(_) => match self.research(topic, producer).await {
                    Ok(_) => WarmOutcome::Success,
                    Err(e) => WarmOutcome::Error(e.to_string()),
                },
            };
            outcomes.push((topic.clone(), outcome));
        }
        outcomes
    }

    /// Embeds the topic and matches it against every persisted chunk. The
    /// keyword group with the highest mean similarity wins, provided that
    /// mean clears the acceptance threshold.
    async fn semantic_lookup(&self, topic: &str) -> Result<Option<ResearchResult>, AppError> {
        let embedded = self.embeddings.embed(topic).await?;
        let matches = self
            .store
            .search_similar(
                &embedded.embedding,
                self.options.search_limit,
                self.options.similarity_threshold,
            )
            .await?;

        Ok(
            best_keyword_group(matches, self.options.similarity_threshold).map(
                |(keyword, chunks)| {
                    debug!(topic, matched_keyword = %keyword, "accepted semantic group");
                    ResearchResult::from_semantic_chunks(topic, &chunks)
                },
            ),
        )
    }

    /// Write-back is fire-and-forget: failures are logged and swallowed so a
    /// successful production never turns into a failed request.
    fn spawn_persist(&self, keyword: String, result: ResearchResult) {
        let chunker = Arc::clone(&self.chunker);
        let embeddings = Arc::clone(&self.embeddings);
        let store = Arc::clone(&self.store);
        let batch_size = self.options.embedding_batch_size;
        tokio::spawn(async move {
            if let Err(e) =
                persist_result(&chunker, &embeddings, &store, batch_size, &keyword, &result).await
            {
                warn!(keyword, error = %e, "cache write-back failed");
            }
        });
    }
}

/// Groups similarity matches by their originating keyword (first-seen order)
/// and picks the group with the highest mean similarity, if that mean clears
/// the threshold.
fn best_keyword_group(
    matches: Vec<(ResearchChunk, f32)>,
    threshold: f32,
) -> Option<(String, Vec<ResearchChunk>)> {
    let mut groups: Vec<(String, Vec<ResearchChunk>, f32)> = Vec::new();
    for (chunk, similarity) in matches {
        match groups.iter_mut().find(|(keyword, _, _)| keyword == &chunk.keyword) {
            Some((_, chunks, sum)) => {
                chunks.push(chunk);
                *sum += similarity;
            }
            None => groups.push((chunk.keyword.clone(), vec![chunk], similarity)),
        }
    }

    let mut best: Option<(String, Vec<ResearchChunk>, f32)> = None;
    for (keyword, chunks, sum) in groups {
        let mean = sum / chunks.len() as f32;
        if best.as_ref().map_or(true, |(_, _, best_mean)| mean > *best_mean) {
            best = Some((keyword, chunks, mean));
        }
    }

    best.and_then(|(keyword, chunks, mean)| {
        if mean >= threshold {
            Some((keyword, chunks))
        } else {
            None
        }
    })
}

/// Chunks a canonical result by role, embeds every chunk, and stores both
/// the chunks and a fresh cache entry.
async fn persist_result(
    chunker: &TextChunker,
    embeddings: &EmbeddingService,
    store: &VectorStore,
    batch_size: usize,
    keyword: &str,
    result: &ResearchResult,
) -> Result<(), AppError> {
    let chunks = build_role_chunks(chunker, keyword, result);

    let texts: Vec<String> = chunks.iter().map(|chunk| chunk.content.clone()).collect();
    let embedded = embeddings.embed_batch(&texts, batch_size).await?;
    let vectors: Vec<Vec<f32>> = embedded.into_iter().map(|item| item.embedding).collect();

    let chunk_ids = store.store_chunks(&chunks, &vectors, keyword).await?;
    store
        .store_cache_entry(
            keyword,
            result.summary.clone(),
            chunk_ids,
            result.entry_metadata(),
        )
        .await
        .map_err(|e| AppError::Persistence(format!("storing cache entry: {e}")))?;

    debug!(keyword, chunks = chunks.len(), "research persisted");
    Ok(())
}

/// Decomposes a result into role-tagged chunks. Summary and source texts run
/// through the sentence-aware chunker; findings and statistics become single
/// chunks joined on a recorded delimiter, because that internal structure is
/// what reconstruction splits on.
fn build_role_chunks(chunker: &TextChunker, keyword: &str, result: &ResearchResult) -> Vec<Chunk> {
    let key = normalize_keyword(keyword);
    let mut chunks: Vec<Chunk> = Vec::new();

    let summary_meta = role_metadata(ROLE_SUMMARY, keyword, &[]);
    chunks.extend(chunker.chunk(&result.summary, &summary_meta, Some(&format!("{key}:summary"))));

    for source in &result.sources {
        let source_meta = role_metadata(
            ROLE_SOURCE,
            keyword,
            &[
                ("url", json!(source.url)),
                ("title", json!(source.title)),
                ("credibility_score", json!(source.credibility_score)),
            ],
        );
        chunks.extend(chunker.chunk(
            &source.summary,
            &source_meta,
            Some(&format!("{key}:source:{}", source.url)),
        ));
    }

    if !result.main_findings.is_empty() {
        chunks.push(list_role_chunk(
            &result.main_findings,
            ROLE_FINDINGS,
            FINDINGS_DELIMITER,
            keyword,
            &format!("{key}:findings"),
        ));
    }
    if !result.statistics.is_empty() {
        chunks.push(list_role_chunk(
            &result.statistics,
            ROLE_STATISTICS,
            STATISTICS_DELIMITER,
            keyword,
            &format!("{key}:statistics"),
        ));
    }

    chunks
}

fn role_metadata(role: &str, keyword: &str, extra: &[(&str, Value)]) -> Map<String, Value> {
    let mut metadata = Map::new();
    metadata.insert("role".to_string(), json!(role));
    metadata.insert("keyword".to_string(), json!(keyword));
    for (field, value) in extra {
        metadata.insert((*field).to_string(), value.clone());
    }
    metadata
}

fn list_role_chunk(
    items: &[String],
    role: &str,
    delimiter: &str,
    keyword: &str,
    source_id: &str,
) -> Chunk {
    let mut metadata = role_metadata(role, keyword, &[("delimiter", json!(delimiter))]);
    metadata.insert("chunk_index".to_string(), json!(0));
    Chunk {
        content: items.join(delimiter),
        metadata,
        chunk_index: 0,
        source_id: Some(source_id.to_string()),
    }
}
