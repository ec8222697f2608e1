use std::sync::Mutex;
use std::time::Duration;

use serde::Serialize;

/// Shared counters for cache behavior. One registry is handed to every
/// orchestrator at construction, so aggregate statistics are explicit state
/// rather than implicit globals.
#[derive(Debug, Default)]
pub struct StatsRegistry {
    inner: Mutex<Inner>,
}

#[derive(Debug, Default, Clone)]
struct Inner {
    total_requests: u64,
    exact_hits: u64,
    semantic_hits: u64,
    cache_misses: u64,
    errors: u64,
    cache_time_ms: f64,
    api_time_ms: f64,
}

/// Point-in-time view of the registry, with derived rates and averages.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CacheStatistics {
    pub total_requests: u64,
    pub exact_hits: u64,
    pub semantic_hits: u64,
    pub cache_misses: u64,
    pub errors: u64,
    pub cache_hit_rate: f64,
    pub avg_cache_response_time_ms: f64,
    pub avg_api_response_time_ms: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportFormat {
    Json,
    Csv,
    KeyValue,
}

impl StatsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn record_request(&self) {
        self.lock().total_requests += 1;
    }

    pub fn record_exact_hit(&self, elapsed: Duration) {
        let mut inner = self.lock();
        inner.exact_hits += 1;
        inner.cache_time_ms += elapsed.as_secs_f64() * 1000.0;
    }

    pub fn record_semantic_hit(&self, elapsed: Duration) {
        let mut inner = self.lock();
        inner.semantic_hits += 1;
        inner.cache_time_ms += elapsed.as_secs_f64() * 1000.0;
    }

    pub fn record_miss(&self, elapsed: Duration) {
        let mut inner = self.lock();
        inner.cache_misses += 1;
        inner.api_time_ms += elapsed.as_secs_f64() * 1000.0;
    }

    pub fn record_error(&self) {
        self.lock().errors += 1;
    }

    pub fn snapshot(&self) -> CacheStatistics {
        let inner = self.lock().clone();
        let hits = inner.exact_hits + inner.semantic_hits;
        let cache_hit_rate = if inner.total_requests == 0 {
            0.0
        } else {
            hits as f64 / inner.total_requests as f64
        };
        let avg_cache = if hits == 0 {
            0.0
        } else {
            inner.cache_time_ms / hits as f64
        };
        let avg_api = if inner.cache_misses == 0 {
            0.0
        } else {
            inner.api_time_ms / inner.cache_misses as f64
        };

        CacheStatistics {
            total_requests: inner.total_requests,
            exact_hits: inner.exact_hits,
            semantic_hits: inner.semantic_hits,
            cache_misses: inner.cache_misses,
            errors: inner.errors,
            cache_hit_rate,
            avg_cache_response_time_ms: avg_cache,
            avg_api_response_time_ms: avg_api,
        }
    }
}

impl CacheStatistics {
    /// Reporting surface; formatting is not part of the cache's correctness
    /// contract.
    pub fn export(&self, format: ExportFormat) -> String {
        match format {
            ExportFormat::Json => {
                serde_json::to_string_pretty(self).unwrap_or_else(|_| "{}".to_string())
            }
            ExportFormat::Csv => {
                let header = "total_requests,exact_hits,semantic_hits,cache_misses,errors,\
                              cache_hit_rate,avg_cache_response_time_ms,avg_api_response_time_ms";
                format!(
                    "{header}\n{},{},{},{},{},{:.4},{:.3},{:.3}",
                    self.total_requests,
                    self.exact_hits,
                    self.semantic_hits,
                    self.cache_misses,
                    self.errors,
                    self.cache_hit_rate,
                    self.avg_cache_response_time_ms,
                    self.avg_api_response_time_ms,
                )
            }
            ExportFormat::KeyValue => format!(
                "total_requests={}\nexact_hits={}\nsemantic_hits={}\ncache_misses={}\nerrors={}\n\
                 cache_hit_rate={:.4}\navg_cache_response_time_ms={:.3}\navg_api_response_time_ms={:.3}",
                self.total_requests,
                self.exact_hits,
                self.semantic_hits,
                self.cache_misses,
                self.errors,
                self.cache_hit_rate,
                self.avg_cache_response_time_ms,
                self.avg_api_response_time_ms,
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn populated() -> StatsRegistry {
        let stats = StatsRegistry::new();
        for _ in 0..4 {
            stats.record_request();
        }
        stats.record_exact_hit(Duration::from_millis(10));
        stats.record_semantic_hit(Duration::from_millis(30));
        stats.record_miss(Duration::from_millis(500));
        stats.record_error();
        stats
    }

    #[test]
    fn snapshot_derives_rates_and_averages() {
        let snapshot = populated().snapshot();
        assert_eq!(snapshot.total_requests, 4);
        assert_eq!(snapshot.exact_hits, 1);
        assert_eq!(snapshot.semantic_hits, 1);
        assert_eq!(snapshot.cache_misses, 1);
        assert_eq!(snapshot.errors, 1);
        assert!((snapshot.cache_hit_rate - 0.5).abs() < 1e-9);
        assert!((snapshot.avg_cache_response_time_ms - 20.0).abs() < 1e-6);
        assert!((snapshot.avg_api_response_time_ms - 500.0).abs() < 1e-6);
    }

    #[test]
    fn empty_registry_has_zero_rates() {
        let snapshot = StatsRegistry::new().snapshot();
        assert_eq!(snapshot.total_requests, 0);
        assert_eq!(snapshot.cache_hit_rate, 0.0);
        assert_eq!(snapshot.avg_cache_response_time_ms, 0.0);
        assert_eq!(snapshot.avg_api_response_time_ms, 0.0);
    }

    #[test]
    fn export_formats_cover_every_counter() {
        let snapshot = populated().snapshot();

        let json = snapshot.export(ExportFormat::Json);
        let parsed: serde_json::Value = serde_json::from_str(&json).expect("valid JSON");
        assert_eq!(parsed["total_requests"], 4);
        assert_eq!(parsed["exact_hits"], 1);

        let csv = snapshot.export(ExportFormat::Csv);
        let mut lines = csv.lines();
        let header = lines.next().expect("csv header");
        let row = lines.next().expect("csv row");
        assert_eq!(header.split(',').count(), row.split(',').count());
        assert!(header.starts_with("total_requests,"));
        assert!(row.starts_with("4,1,1,1,1,"));

        let kv = snapshot.export(ExportFormat::KeyValue);
        assert!(kv.contains("total_requests=4"));
        assert!(kv.contains("cache_hit_rate=0.5000"));
    }
}
