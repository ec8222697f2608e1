use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use url::Url;

use common::storage::types::{cache_entry::CacheEntry, research_chunk::ResearchChunk};

/// Role tags classifying what a stored chunk represents, used to reassemble a
/// structured result from flat chunks.
pub const ROLE_SUMMARY: &str = "research_summary";
pub const ROLE_SOURCE: &str = "academic_source";
pub const ROLE_FINDINGS: &str = "main_findings";
pub const ROLE_STATISTICS: &str = "statistics";

/// Join delimiters for list-valued roles. Each chunk records the delimiter it
/// was built with in its metadata, and reconstruction splits on the recorded
/// value, so the constants can change without stranding old records.
pub const FINDINGS_DELIMITER: &str = "\n\n";
pub const STATISTICS_DELIMITER: &str = "\n";

/// One supporting source of a research result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceRecord {
    pub title: String,
    pub url: String,
    pub summary: String,
    pub credibility_score: f32,
}

/// The canonical shape every research request resolves to, whether it came
/// from the exact cache, the semantic cache, or the producer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResearchResult {
    pub keyword: String,
    pub summary: String,
    pub sources: Vec<SourceRecord>,
    pub main_findings: Vec<String>,
    pub statistics: Vec<String>,
    pub researched_at: DateTime<Utc>,
}

impl ResearchResult {
    /// Converts a producer's raw structured mapping into the canonical shape.
    /// Missing fields degrade to empty; sources without an explicit
    /// credibility score get one inferred from their domain.
    pub fn from_raw(keyword: &str, raw: &Value) -> Self {
        let summary = raw
            .get("summary")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        let source_items = raw
            .get("sources")
            .or_else(|| raw.get("results"))
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or_default();
        let sources = source_items.iter().map(source_from_raw).collect();

        Self {
            keyword: keyword.to_string(),
            summary,
            sources,
            main_findings: string_list(raw.get("main_findings")),
            statistics: string_list(raw.get("statistics")),
            researched_at: Utc::now(),
        }
    }

    /// Rebuilds the canonical shape from an exact cache hit: summary and
    /// list fields come from the entry itself, and only chunks tagged
    /// `academic_source` are turned back into source records.
    pub fn from_entry(entry: &CacheEntry, chunks: &[ResearchChunk]) -> Self {
        let sources = chunks
            .iter()
            .filter(|chunk| chunk.role() == Some(ROLE_SOURCE))
            .filter_map(source_from_chunk)
            .collect();

        let researched_at = entry
            .metadata
            .get("researched_at")
            .and_then(Value::as_str)
            .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
            .map_or(entry.created_at, |dt| dt.with_timezone(&Utc));

        Self {
            keyword: entry.keyword.clone(),
            summary: entry.summary.clone(),
            sources,
            main_findings: string_list(entry.metadata.get("main_findings")),
            statistics: string_list(entry.metadata.get("statistics")),
            researched_at,
        }
    }

    /// Rebuilds the canonical shape from a semantically matched chunk group:
    /// the `research_summary` chunk supplies the summary, `academic_source`
    /// chunks are deduplicated by URL, and list roles are split back on their
    /// recorded delimiters with first-seen order preserved.
    pub fn from_semantic_chunks(keyword: &str, chunks: &[ResearchChunk]) -> Self {
        let mut ordered: Vec<&ResearchChunk> = chunks.iter().collect();
        ordered.sort_by_key(|chunk| chunk.chunk_index);

        let summary = ordered
            .iter()
            .filter(|chunk| chunk.role() == Some(ROLE_SUMMARY))
            .map(|chunk| chunk.content.as_str())
            .collect::<Vec<_>>()
            .join(" ");

        let mut sources: Vec<SourceRecord> = Vec::new();
        for chunk in &ordered {
            if chunk.role() != Some(ROLE_SOURCE) {
                continue;
            }
            if let Some(source) = source_from_chunk(chunk) {
                if !sources.iter().any(|existing| existing.url == source.url) {
                    sources.push(source);
                }
            }
        }

        Self {
            keyword: keyword.to_string(),
            summary,
            sources,
            main_findings: split_list_role(&ordered, ROLE_FINDINGS, FINDINGS_DELIMITER),
            statistics: split_list_role(&ordered, ROLE_STATISTICS, STATISTICS_DELIMITER),
            researched_at: Utc::now(),
        }
    }

    /// Auxiliary structured fields stored on the cache entry so an exact hit
    /// can reconstruct the full shape without parsing chunks.
    pub fn entry_metadata(&self) -> Value {
        json!({
            "main_findings": self.main_findings,
            "statistics": self.statistics,
            "researched_at": self.researched_at.to_rfc3339(),
        })
    }
}

/// Coarse credibility from the source domain: institutional TLDs score
/// highest, then non-profits, then everything else.
pub fn credibility_from_url(source_url: &str) -> f32 {
    let Ok(parsed) = Url::parse(source_url) else {
        return 0.5;
    };
    let Some(host) = parsed.host_str() else {
        return 0.5;
    };
    if host.ends_with(".edu") || host.ends_with(".gov") {
        0.9
    } else if host.ends_with(".org") {
        0.7
    } else {
        0.5
    }
}

fn source_from_raw(item: &Value) -> SourceRecord {
    let url = item
        .get("url")
        .or_else(|| item.get("link"))
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let credibility_score = item
        .get("credibility_score")
        .and_then(Value::as_f64)
        .map_or_else(|| credibility_from_url(&url), |score| score as f32);

    SourceRecord {
        title: item
            .get("title")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        url,
        summary: item
            .get("summary")
            .or_else(|| item.get("snippet"))
            .or_else(|| item.get("abstract"))
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        credibility_score,
    }
}

/// A source chunk carries its record fields in metadata; the chunk content is
/// the source summary.
fn source_from_chunk(chunk: &ResearchChunk) -> Option<SourceRecord> {
    let url = chunk.metadata.get("url").and_then(Value::as_str)?;
    Some(SourceRecord {
        title: chunk
            .metadata
            .get("title")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        url: url.to_string(),
        summary: chunk.content.clone(),
        credibility_score: chunk
            .metadata
            .get("credibility_score")
            .and_then(Value::as_f64)
            .map_or(0.5, |score| score as f32),
    })
}

/// Splits every chunk of the given role on its recorded delimiter and
/// deduplicates items while preserving first-seen order.
fn split_list_role(chunks: &[&ResearchChunk], role: &str, default_delimiter: &str) -> Vec<String> {
    let mut items: Vec<String> = Vec::new();
    for chunk in chunks {
        if chunk.role() != Some(role) {
            continue;
        }
        let delimiter = chunk
            .metadata
            .get("delimiter")
            .and_then(Value::as_str)
            .unwrap_or(default_delimiter);
        for piece in chunk.content.split(delimiter) {
            let trimmed = piece.trim();
            if trimmed.is_empty() {
                continue;
            }
            if !items.iter().any(|existing| existing == trimmed) {
                items.push(trimmed.to_string());
            }
        }
    }
    items
}

fn string_list(value: Option<&Value>) -> Vec<String> {
    value
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default()
        .iter()
        .filter_map(Value::as_str)
        .map(str::to_string)
        .collect()
}
