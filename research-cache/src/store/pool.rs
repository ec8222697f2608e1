use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use surrealdb::{
    engine::any::{connect, Any},
    opt::auth::Root,
    Surreal,
};
use tokio::sync::{Semaphore, SemaphorePermit};
use tracing::{debug, warn};

use common::{error::AppError, storage::db::SurrealDbClient};

/// Credentials for dedicated query-channel connections. When absent the pool
/// reuses sessions of the primary client instead.
#[derive(Debug, Clone)]
pub struct QueryAddress {
    pub address: String,
    pub username: String,
    pub password: String,
    pub namespace: String,
    pub database: String,
}

/// Bounded pool of connections reserved for similarity queries. Structured
/// upserts and nearest-neighbor search are different capability surfaces, so
/// the search side gets its own channel with acquire/release semantics; the
/// semaphore guarantees release on every exit path.
pub struct QueryPool {
    clients: Vec<Surreal<Any>>,
    permits: Semaphore,
    next: AtomicUsize,
}

/// A checked-out query connection. Dropping it returns the permit.
pub struct PooledQuery<'a> {
    pub client: &'a Surreal<Any>,
    _permit: SemaphorePermit<'a>,
}

impl QueryPool {
    /// Opens `size` dedicated connections to the query address.
    pub async fn connect(address: &QueryAddress, size: usize) -> Result<Self, surrealdb::Error> {
        let size = size.max(1);
        let mut clients = Vec::with_capacity(size);
        for _ in 0..size {
            let client = connect(address.address.as_str()).await?;
            client
                .signin(Root {
                    username: &address.username,
                    password: &address.password,
                })
                .await?;
            client
                .use_ns(address.namespace.as_str())
                .use_db(address.database.as_str())
                .await?;
            clients.push(client);
        }
        debug!(size, "query pool connected");
        Ok(Self {
            permits: Semaphore::new(size),
            clients,
            next: AtomicUsize::new(0),
        })
    }

    /// Builds the pool from sessions of an existing client. Used when no
    /// separate query address is configured (including the in-memory engine,
    /// where fresh connections would not share data).
    pub fn from_client(db: &SurrealDbClient, size: usize) -> Self {
        let size = size.max(1);
        let clients = (0..size).map(|_| db.client.clone()).collect();
        Self {
            permits: Semaphore::new(size),
            clients,
            next: AtomicUsize::new(0),
        }
    }

    pub fn size(&self) -> usize {
        self.clients.len()
    }

    /// Waits for a free permit and hands out the next connection.
    pub async fn acquire(&self) -> Result<PooledQuery<'_>, AppError> {
        let permit = self
            .permits
            .acquire()
            .await
            .map_err(|e| AppError::InternalError(format!("query pool closed: {e}")))?;
        let index = self.next.fetch_add(1, Ordering::Relaxed) % self.clients.len();
        let client = self
            .clients
            .get(index)
            .ok_or_else(|| AppError::InternalError("query pool has no connections".into()))?;
        Ok(PooledQuery {
            client,
            _permit: permit,
        })
    }

    /// Exercises up to `count` connections concurrently so the first real
    /// request does not pay connection-establishment latency. Failures are
    /// logged, never fatal; returns how many connections answered.
    pub async fn warm(self: &Arc<Self>, count: usize) -> usize {
        let count = count.min(self.size());
        let probes = (0..count).map(|_| {
            let pool = Arc::clone(self);
            async move {
                let lease = pool.acquire().await.ok()?;
                lease.client.query("RETURN 1").await.ok()?;
                Some(())
            }
        });

        let warmed = futures::future::join_all(probes)
            .await
            .into_iter()
            .flatten()
            .count();
        if warmed < count {
            warn!(warmed, requested = count, "query pool warmup incomplete");
        } else {
            debug!(warmed, "query pool warmed");
        }
        warmed
    }
}
