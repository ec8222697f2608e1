pub mod cache;

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use tokio_retry::{
    strategy::{jitter, ExponentialBackoff},
    Retry,
};
use tracing::debug;

use common::{
    error::AppError, storage::types::content_hash, utils::config::AppConfig,
    utils::embedding::EmbeddingProvider,
};

pub use cache::EmbeddingCache;

/// One embedded text. `token_count` is an estimate, not authoritative.
#[derive(Debug, Clone, PartialEq)]
pub struct EmbeddingResult {
    pub text: String,
    pub embedding: Vec<f32>,
    pub model: String,
    pub token_count: usize,
}

/// Cumulative remote usage. Cache hits never advance these counters; only
/// calls that actually reach the provider do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct UsageStats {
    pub total_tokens: u64,
    pub request_count: u64,
}

/// Bounded exponential backoff for transient remote failures. Kept as
/// configuration rather than scattered literals.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub attempts: usize,
    pub base_delay_ms: u64,
}

impl RetryPolicy {
    pub fn from_app_config(config: &AppConfig) -> Self {
        Self {
            attempts: config.retry_attempts,
            base_delay_ms: config.retry_base_delay_ms,
        }
    }

    pub fn strategy(&self) -> impl Iterator<Item = std::time::Duration> {
        ExponentialBackoff::from_millis(self.base_delay_ms)
            .map(jitter)
            .take(self.attempts)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            base_delay_ms: 100,
        }
    }
}

/// Maps text to fixed-dimension vectors with an exact-text cache, bounded
/// retry around the remote provider, and cumulative usage accounting.
pub struct EmbeddingService {
    provider: EmbeddingProvider,
    cache: Arc<EmbeddingCache>,
    retry: RetryPolicy,
    total_tokens: AtomicU64,
    request_count: AtomicU64,
}

impl EmbeddingService {
    pub fn new(provider: EmbeddingProvider, cache: Arc<EmbeddingCache>, retry: RetryPolicy) -> Self {
        Self {
            provider,
            cache,
            retry,
            total_tokens: AtomicU64::new(0),
            request_count: AtomicU64::new(0),
        }
    }

    pub fn dimension(&self) -> usize {
        self.provider.dimension()
    }

    pub fn cache(&self) -> &Arc<EmbeddingCache> {
        &self.cache
    }

    /// Embeds one text. Empty or whitespace-only input is a caller error and
    /// is rejected immediately, without retry. The cache is keyed by the
    /// exact trimmed text, so a hit skips the remote call entirely.
    pub async fn embed(&self, text: &str) -> Result<EmbeddingResult, AppError> {
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return Err(AppError::Validation(
                "cannot embed empty or whitespace-only text".into(),
            ));
        }

        let key = content_hash(trimmed);
        if let Some(cached) = self.cache.get(&key) {
            debug!(key = %key, "embedding cache hit");
            return Ok(cached);
        }

        let embedding = Retry::spawn(self.retry.strategy(), || self.provider.embed(trimmed))
            .await
            .map_err(|e| AppError::Embedding(format!("embedding provider failed: {e}")))?;

        let token_count = estimate_tokens(trimmed);
        self.total_tokens
            .fetch_add(token_count as u64, Ordering::Relaxed);
        self.request_count.fetch_add(1, Ordering::Relaxed);

        let result = EmbeddingResult {
            text: trimmed.to_string(),
            embedding,
            model: self
                .provider
                .model_code()
                .unwrap_or_else(|| self.provider.backend_label().to_string()),
            token_count,
        };
        self.cache.put(key, result.clone());

        Ok(result)
    }

    /// Embeds texts in fixed-size batches, preserving input order. Within a
    /// batch, cached texts are served locally and the uncached remainder goes
    /// to the provider in a single round trip. A single item's failure aborts
    /// the whole call and surfaces the error.
    pub async fn embed_batch(
        &self,
        texts: &[String],
        batch_size: usize,
    ) -> Result<Vec<EmbeddingResult>, AppError> {
        let batch_size = batch_size.max(1);
        let mut results = Vec::with_capacity(texts.len());
        for batch in texts.chunks(batch_size) {
            results.extend(self.embed_slice(batch).await?);
        }
        Ok(results)
    }

    async fn embed_slice(&self, batch: &[String]) -> Result<Vec<EmbeddingResult>, AppError> {
        let mut slots: Vec<Option<EmbeddingResult>> = Vec::with_capacity(batch.len());
        let mut remote: Vec<(usize, String)> = Vec::new();
        for (index, text) in batch.iter().enumerate() {
            let trimmed = text.trim();
            if trimmed.is_empty() {
                return Err(AppError::Validation(
                    "cannot embed empty or whitespace-only text".into(),
                ));
            }
            match self.cache.get(&content_hash(trimmed)) {
                Some(cached) => slots.push(Some(cached)),
                None => {
                    slots.push(None);
                    remote.push((index, trimmed.to_string()));
                }
            }
        }

        if !remote.is_empty() {
            let pending: Vec<String> = remote.iter().map(|(_, text)| text.clone()).collect();
            let embeddings = Retry::spawn(self.retry.strategy(), || {
                self.provider.embed_batch(pending.clone())
            })
            .await
            .map_err(|e| AppError::Embedding(format!("embedding provider failed: {e}")))?;
            if embeddings.len() != remote.len() {
                return Err(AppError::Embedding(format!(
                    "provider returned {} embeddings for {} inputs",
                    embeddings.len(),
                    remote.len()
                )));
            }

            let model = self
                .provider
                .model_code()
                .unwrap_or_else(|| self.provider.backend_label().to_string());
            for ((index, text), embedding) in remote.into_iter().zip(embeddings) {
                let token_count = estimate_tokens(&text);
                self.total_tokens
                    .fetch_add(token_count as u64, Ordering::Relaxed);
                let result = EmbeddingResult {
                    embedding,
                    model: model.clone(),
                    token_count,
                    text: text.clone(),
                };
                self.cache.put(content_hash(&text), result.clone());
                if let Some(slot) = slots.get_mut(index) {
                    *slot = Some(result);
                }
            }
            self.request_count.fetch_add(1, Ordering::Relaxed);
        }

        Ok(slots.into_iter().flatten().collect())
    }

    /// Cosine similarity in [-1, 1]. Degenerate zero-norm vectors yield 0.0
    /// rather than propagating a division by zero.
    pub fn similarity(a: &[f32], b: &[f32]) -> f32 {
        if a.len() != b.len() {
            return 0.0;
        }
        let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
        let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
        let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm_a == 0.0 || norm_b == 0.0 {
            return 0.0;
        }
        (dot / (norm_a * norm_b)).clamp(-1.0, 1.0)
    }

    /// Ranks candidates by descending similarity to the query and keeps the
    /// top `k`. The sort is stable, so ties keep their input order.
    pub fn top_k(
        query: &[f32],
        candidates: &[(String, Vec<f32>)],
        k: usize,
    ) -> Vec<(String, f32)> {
        let mut scored: Vec<(String, f32)> = candidates
            .iter()
            .map(|(id, vector)| (id.clone(), Self::similarity(query, vector)))
            .collect();
        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(k);
        scored
    }

    pub fn usage(&self) -> UsageStats {
        UsageStats {
            total_tokens: self.total_tokens.load(Ordering::Relaxed),
            request_count: self.request_count.load(Ordering::Relaxed),
        }
    }

    pub fn reset_usage(&self) {
        self.total_tokens.store(0, Ordering::Relaxed);
        self.request_count.store(0, Ordering::Relaxed);
    }
}

/// Rough estimate: one token per four characters, floored at one.
fn estimate_tokens(text: &str) -> usize {
    (text.chars().count() / 4).max(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service(dimension: usize) -> EmbeddingService {
        EmbeddingService::new(
            EmbeddingProvider::new_hashed(dimension),
            Arc::new(EmbeddingCache::new()),
            RetryPolicy {
                attempts: 3,
                base_delay_ms: 10,
            },
        )
    }

    #[tokio::test]
    async fn empty_input_is_rejected_without_usage() {
        let service = service(8);
        let result = service.embed("   \n\t ").await;
        assert!(matches!(result, Err(AppError::Validation(_))));
        assert_eq!(service.usage(), UsageStats::default());
    }

    #[tokio::test]
    async fn cache_hit_skips_provider_and_usage() {
        let service = service(8);

        let first = service.embed("blood sugar levels").await.unwrap();
        let usage_after_first = service.usage();
        assert_eq!(usage_after_first.request_count, 1);

        let second = service.embed("blood sugar levels").await.unwrap();
        assert_eq!(first, second);
        assert_eq!(service.usage(), usage_after_first, "hit must not bill");
        assert_eq!(service.cache().hits(), 1);
    }

    #[tokio::test]
    async fn token_estimate_is_quarter_length_floored_at_one() {
        let service = service(8);
        let short = service.embed("ab").await.unwrap();
        assert_eq!(short.token_count, 1);

        let text = "a".repeat(40);
        let long = service.embed(&text).await.unwrap();
        assert_eq!(long.token_count, 10);
        assert_eq!(service.usage().total_tokens, 11);
    }

    #[tokio::test]
    async fn embed_batch_processes_everything_in_order() {
        let service = service(8);
        let texts: Vec<String> = (0..7).map(|i| format!("sentence number {i}")).collect();
        let results = service.embed_batch(&texts, 3).await.unwrap();
        assert_eq!(results.len(), 7);
        for (text, result) in texts.iter().zip(&results) {
            assert_eq!(&result.text, text);
        }
        // 7 texts at batch size 3 is three provider round trips.
        assert_eq!(service.usage().request_count, 3);
    }

    #[tokio::test]
    async fn embed_batch_serves_cached_texts_locally() {
        let service = service(8);
        service.embed("already cached").await.unwrap();
        assert_eq!(service.usage().request_count, 1);

        let texts = vec!["already cached".to_string(), "brand new".to_string()];
        let results = service.embed_batch(&texts, 10).await.unwrap();
        assert_eq!(results.len(), 2);
        // Only the uncached text reaches the provider.
        assert_eq!(service.usage().request_count, 2);
        assert!(service.cache().hits() >= 1);
    }

    #[tokio::test]
    async fn embed_batch_surfaces_any_item_failure() {
        let service = service(8);
        let texts = vec![
            "valid text".to_string(),
            "  ".to_string(),
            "another valid".to_string(),
        ];
        let result = service.embed_batch(&texts, 3).await;
        assert!(matches!(result, Err(AppError::Validation(_))));
    }

    #[tokio::test]
    async fn reset_usage_zeroes_counters_but_keeps_cache() {
        let service = service(8);
        service.embed("some text to bill").await.unwrap();
        assert_ne!(service.usage(), UsageStats::default());

        service.reset_usage();
        assert_eq!(service.usage(), UsageStats::default());
        assert_eq!(service.cache().len(), 1);
    }

    #[test]
    fn cosine_similarity_bounds() {
        let a = vec![1.0, 0.0];
        let b = vec![0.0, 1.0];
        let c = vec![-1.0, 0.0];
        assert!((EmbeddingService::similarity(&a, &a) - 1.0).abs() < 1e-6);
        assert!(EmbeddingService::similarity(&a, &b).abs() < 1e-6);
        assert!((EmbeddingService::similarity(&a, &c) + 1.0).abs() < 1e-6);
    }

    #[test]
    fn zero_vector_similarity_is_zero() {
        let zero = vec![0.0, 0.0, 0.0];
        let other = vec![0.3, 0.4, 0.5];
        assert_eq!(EmbeddingService::similarity(&zero, &other), 0.0);
        assert_eq!(EmbeddingService::similarity(&other, &zero), 0.0);
        assert_eq!(EmbeddingService::similarity(&zero, &zero), 0.0);
    }

    #[test]
    fn top_k_sorts_descending_and_breaks_ties_by_input_order() {
        let query = vec![1.0, 0.0];
        let candidates = vec![
            ("low".to_string(), vec![0.0, 1.0]),
            ("tie_first".to_string(), vec![1.0, 1.0]),
            ("tie_second".to_string(), vec![2.0, 2.0]),
            ("exact".to_string(), vec![3.0, 0.0]),
        ];
        let ranked = EmbeddingService::top_k(&query, &candidates, 3);
        assert_eq!(ranked.len(), 3);
        assert_eq!(ranked[0].0, "exact");
        assert_eq!(ranked[1].0, "tie_first");
        assert_eq!(ranked[2].0, "tie_second");
    }
}
