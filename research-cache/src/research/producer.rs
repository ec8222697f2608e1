use async_trait::async_trait;
use serde_json::Value;

use common::error::AppError;

use super::result::ResearchResult;

/// What a producer hands back: either the canonical shape directly, or a raw
/// structured mapping the orchestrator converts.
#[derive(Debug, Clone)]
pub enum ProducerOutput {
    Canonical(ResearchResult),
    Raw(Value),
}

/// The expensive operation the cache exists to avoid re-running. Injected by
/// the caller; failures propagate to the caller as-is (any retry policy
/// belongs to the producer, not the cache).
#[async_trait]
pub trait ResearchProducer: Send + Sync {
    async fn produce(&self, topic: &str) -> Result<ProducerOutput, AppError>;
}
