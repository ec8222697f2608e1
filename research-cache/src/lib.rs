pub mod chunking;
pub mod embedding;
pub mod research;
pub mod stats;
pub mod store;

pub use chunking::{Chunk, ChunkingConfig, TextChunker};
pub use embedding::{EmbeddingCache, EmbeddingResult, EmbeddingService, RetryPolicy, UsageStats};
pub use research::{
    ProducerOutput, ResearchCache, ResearchOptions, ResearchProducer, ResearchResult,
    SourceRecord, WarmOutcome,
};
pub use stats::{CacheStatistics, ExportFormat, StatsRegistry};
pub use store::{CachedResearch, QueryAddress, QueryPool, VectorStore, VectorStoreConfig};
