use chrono::Duration;

use crate::{
    storage::types::{content_hash, normalize_keyword},
    stored_object,
};

stored_object!(CacheEntry, "cache_entry", {
    keyword: String,
    keyword_normalized: String,
    summary: String,
    chunk_ids: Vec<String>,
    metadata: serde_json::Value,
    hit_count: i64,
    #[serde(serialize_with = "serialize_datetime", deserialize_with = "deserialize_datetime", default)]
    last_accessed: DateTime<Utc>,
    #[serde(serialize_with = "serialize_datetime", deserialize_with = "deserialize_datetime", default)]
    expires_at: DateTime<Utc>
});

impl CacheEntry {
    pub fn new(
        keyword: &str,
        summary: String,
        chunk_ids: Vec<String>,
        metadata: serde_json::Value,
        ttl: Duration,
    ) -> Self {
        let now = Utc::now();
        let keyword_normalized = normalize_keyword(keyword);
        Self {
            id: Self::deterministic_id(keyword),
            created_at: now,
            keyword: keyword.to_string(),
            keyword_normalized,
            summary,
            chunk_ids,
            metadata,
            hit_count: 0,
            last_accessed: now,
            expires_at: now + ttl,
        }
    }

    /// `hash(normalize(keyword))`; entries are keyed by meaning, so
    /// differently formatted topics resolve to the same record.
    pub fn deterministic_id(keyword: &str) -> String {
        content_hash(&normalize_keyword(keyword))
    }

    /// Lazy expiry predicate: readers treat an expired entry as absent even
    /// though the record remains until cleanup.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}
