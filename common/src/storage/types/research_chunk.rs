use crate::{storage::types::content_hash, stored_object};

stored_object!(ResearchChunk, "research_chunk", {
    content: String,
    embedding: Vec<f32>,
    keyword: String,
    metadata: serde_json::Value,
    chunk_index: usize,
    source_id: Option<String>
});

impl ResearchChunk {
    /// Builds a chunk record with a deterministic id so re-storing identical
    /// content upserts instead of duplicating.
    pub fn new(
        content: String,
        embedding: Vec<f32>,
        keyword: String,
        metadata: serde_json::Value,
        chunk_index: usize,
        source_id: Option<String>,
    ) -> Self {
        let id = Self::deterministic_id(source_id.as_deref(), chunk_index, &content);
        Self {
            id,
            created_at: Utc::now(),
            content,
            embedding,
            keyword,
            metadata,
            chunk_index,
            source_id,
        }
    }

    /// `hash(source_id, chunk_index, hash(content))`, the identity inputs of
    /// a stored chunk. Identical inputs always map to the same record.
    pub fn deterministic_id(source_id: Option<&str>, chunk_index: usize, content: &str) -> String {
        let identity = format!(
            "{}:{}:{}",
            source_id.unwrap_or(""),
            chunk_index,
            content_hash(content)
        );
        content_hash(&identity)
    }

    /// Role tag attached at chunking time, if any.
    pub fn role(&self) -> Option<&str> {
        self.metadata.get("role").and_then(|value| value.as_str())
    }
}
