use super::types::StoredObject;
use std::ops::Deref;
use surrealdb::{
    engine::any::{connect, Any},
    opt::auth::Root,
    Error, Surreal,
};

#[derive(Clone)]
pub struct SurrealDbClient {
    pub client: Surreal<Any>,
}

impl SurrealDbClient {
    /// Connect, authenticate, and select the namespace/database the cache
    /// lives in.
    pub async fn new(
        address: &str,
        username: &str,
        password: &str,
        namespace: &str,
        database: &str,
    ) -> Result<Self, Error> {
        let db = connect(address).await?;

        // Sign in to database
        db.signin(Root { username, password }).await?;

        // Set namespace
        db.use_ns(namespace).use_db(database).await?;

        Ok(SurrealDbClient { client: db })
    }

    pub async fn ensure_initialized(&self, embedding_dimensions: u32) -> Result<(), Error> {
        self.build_indexes(embedding_dimensions).await
    }

    /// Defines the HNSW index that backs similarity search plus the equality
    /// indexes used by point lookups and cleanup filters. Cosine distance
    /// matches the similarity contract of the cache.
    pub async fn build_indexes(&self, embedding_dimensions: u32) -> Result<(), Error> {
        self.client
            .query(format!(
                "DEFINE INDEX IF NOT EXISTS idx_embedding_chunks ON research_chunk FIELDS embedding HNSW DIMENSION {embedding_dimensions} DIST COSINE"
            ))
            .await?;

        self.client
            .query("DEFINE INDEX IF NOT EXISTS idx_chunk_keyword ON research_chunk FIELDS keyword")
            .await?;
        self.client
            .query("DEFINE INDEX IF NOT EXISTS idx_chunk_created ON research_chunk FIELDS created_at")
            .await?;
        self.client
            .query("DEFINE INDEX IF NOT EXISTS idx_entry_keyword ON cache_entry FIELDS keyword_normalized")
            .await?;

        Ok(())
    }

    pub async fn rebuild_indexes(&self) -> Result<(), Error> {
        self.client
            .query("REBUILD INDEX IF EXISTS idx_embedding_chunks ON research_chunk")
            .await?;
        Ok(())
    }

    /// Creates a record under its own id; fails if the id already exists.
    pub async fn store_item<T>(&self, item: T) -> Result<Option<T>, Error>
    where
        T: StoredObject + Send + Sync + 'static,
    {
        self.client
            .create((T::table_name(), item.get_id()))
            .content(item)
            .await
    }

    /// Creates or replaces a record under its own id. Deterministic ids make
    /// this the idempotent write path.
    pub async fn upsert_item<T>(&self, item: T) -> Result<Option<T>, Error>
    where
        T: StoredObject + Send + Sync + 'static,
    {
        self.client
            .upsert((T::table_name(), item.get_id()))
            .content(item)
            .await
    }

    pub async fn get_all_stored_items<T>(&self) -> Result<Vec<T>, Error>
    where
        T: for<'de> StoredObject,
    {
        self.client.select(T::table_name()).await
    }

    pub async fn get_item<T>(&self, id: &str) -> Result<Option<T>, Error>
    where
        T: for<'de> StoredObject,
    {
        self.client.select((T::table_name(), id)).await
    }

    pub async fn delete_item<T>(&self, id: &str) -> Result<Option<T>, Error>
    where
        T: for<'de> StoredObject,
    {
        self.client.delete((T::table_name(), id)).await
    }
}

impl Deref for SurrealDbClient {
    type Target = Surreal<Any>;

    fn deref(&self) -> &Self::Target {
        &self.client
    }
}

#[cfg(any(test, feature = "test-utils"))]
impl SurrealDbClient {
    /// Create an in-memory SurrealDB client for testing.
    pub async fn memory(namespace: &str, database: &str) -> Result<Self, Error> {
        let db = connect("mem://").await?;

        db.use_ns(namespace).use_db(database).await?;

        Ok(SurrealDbClient { client: db })
    }
}
