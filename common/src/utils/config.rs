use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

use crate::error::AppError;

#[derive(Clone, Deserialize, Debug)]
pub struct AppConfig {
    pub openai_api_key: String,
    pub surrealdb_address: String,
    pub surrealdb_username: String,
    pub surrealdb_password: String,
    pub surrealdb_namespace: String,
    pub surrealdb_database: String,
    #[serde(default = "default_base_url")]
    pub openai_base_url: String,
    #[serde(default = "default_embedding_model")]
    pub embedding_model: String,
    #[serde(default = "default_embedding_dimensions")]
    pub embedding_dimensions: u32,
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default = "default_chunk_overlap")]
    pub chunk_overlap: usize,
    #[serde(default = "default_min_text_length")]
    pub min_text_length: usize,
    #[serde(default = "default_similarity_threshold")]
    pub similarity_threshold: f32,
    #[serde(default = "default_cache_ttl_hours")]
    pub cache_ttl_hours: i64,
    #[serde(default = "default_query_pool_size")]
    pub query_pool_size: usize,
    #[serde(default = "default_embedding_batch_size")]
    pub embedding_batch_size: usize,
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: usize,
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,
}

fn default_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_embedding_model() -> String {
    "text-embedding-3-small".to_string()
}

fn default_embedding_dimensions() -> u32 {
    1536
}

fn default_chunk_size() -> usize {
    1000
}

fn default_chunk_overlap() -> usize {
    200
}

fn default_min_text_length() -> usize {
    50
}

fn default_similarity_threshold() -> f32 {
    0.7
}

fn default_cache_ttl_hours() -> i64 {
    24
}

fn default_query_pool_size() -> usize {
    10
}

fn default_embedding_batch_size() -> usize {
    10
}

fn default_retry_attempts() -> usize {
    3
}

fn default_retry_base_delay_ms() -> u64 {
    100
}

impl AppConfig {
    /// Checks the invariants the rest of the system assumes without
    /// re-validating per call. Chunking in particular requires
    /// `chunk_overlap < chunk_size`.
    pub fn validate(&self) -> Result<(), AppError> {
        if self.chunk_size == 0 {
            return Err(AppError::Validation("chunk_size must be positive".into()));
        }
        if self.chunk_overlap >= self.chunk_size {
            return Err(AppError::Validation(format!(
                "chunk_overlap ({}) must be smaller than chunk_size ({})",
                self.chunk_overlap, self.chunk_size
            )));
        }
        if self.cache_ttl_hours <= 0 {
            return Err(AppError::Validation(
                "cache_ttl_hours must be positive".into(),
            ));
        }
        if self.query_pool_size == 0 {
            return Err(AppError::Validation(
                "query_pool_size must be positive".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.similarity_threshold) {
            return Err(AppError::Validation(format!(
                "similarity_threshold ({}) must be within [0, 1]",
                self.similarity_threshold
            )));
        }
        Ok(())
    }
}

pub fn get_config() -> Result<AppConfig, ConfigError> {
    let config = Config::builder()
        .add_source(File::with_name("config").required(false))
        .add_source(Environment::default())
        .build()?;

    config.try_deserialize()
}

#[cfg(any(test, feature = "test-utils"))]
impl AppConfig {
    /// A fully local configuration for tests: in-memory database and small
    /// chunking bounds so fixtures stay readable.
    pub fn for_tests() -> Self {
        Self {
            openai_api_key: String::new(),
            surrealdb_address: "mem://".to_string(),
            surrealdb_username: String::new(),
            surrealdb_password: String::new(),
            surrealdb_namespace: "test_ns".to_string(),
            surrealdb_database: "test_db".to_string(),
            openai_base_url: default_base_url(),
            embedding_model: default_embedding_model(),
            embedding_dimensions: 8,
            chunk_size: 100,
            chunk_overlap: 20,
            min_text_length: 10,
            similarity_threshold: 0.7,
            cache_ttl_hours: 1,
            query_pool_size: 3,
            embedding_batch_size: 4,
            retry_attempts: 3,
            retry_base_delay_ms: 10,
        }
    }
}
