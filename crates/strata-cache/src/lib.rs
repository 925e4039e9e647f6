pub mod codec;
pub mod config;
pub mod error;
pub mod inflight;
pub mod invalidation;
pub mod key;
pub mod local;
pub mod metrics;
pub mod observability;
pub mod pattern;
pub mod query;
pub mod shared;
pub mod store;
pub mod version;
pub mod wrap;

pub use codec::CacheEntry;
pub use config::{
    CacheSettings, InvalidatorConfig, LoggingConfig, OverflowPolicy, QueryCacheConfig,
    RedisConfig, StoreConfig,
};
pub use error::{CacheError, ErrorCategory, Result};
pub use invalidation::{InvalidationEvent, InvalidationRule, Invalidator, InvalidatorStats};
pub use query::{QueryCacheStats, QueryOptions, QueryResult, QueryResultCache};
pub use shared::{MemoryStore, RedisStore, SharedStore, SharedStoreError, create_shared_store};
pub use store::{CacheStore, CacheStoreBuilder, ComputeOptions, SetOptions, StoreStats};
pub use wrap::cached;

use shared::PubSubInvalidationListener;

/// Create a cache store based on configuration.
///
/// ## Modes
///
/// - **Redis disabled**: local tier only
/// - **Redis enabled**: local + Redis, falling back to local only when Redis
///   cannot be reached at startup
///
/// With `redis.pubsub` on, a listener evicting keys deleted by other instances
/// is started and tied to the store's lifetime.
pub async fn create_cache_store(settings: &CacheSettings) -> CacheStore {
    let shared = create_shared_store(&settings.redis).await;
    let store = CacheStore::builder(settings.store.clone())
        .shared_opt(shared)
        .build();

    if settings.redis.pubsub
        && let Some(origin) = store.shared().and_then(|s| s.origin()).map(str::to_string)
    {
        let listener = PubSubInvalidationListener {
            redis_url: settings.redis.url.clone(),
            channel: settings.redis.channel.clone(),
            origin,
            local: store.local_tier().clone(),
        };
        store.attach_task(listener.start());
    }

    store
}

/// The cache store together with the components built on it.
///
/// Construct once at startup and pass by reference to consumers.
#[derive(Debug, Clone)]
pub struct CacheSystem {
    pub store: CacheStore,
    pub queries: QueryResultCache,
    pub invalidator: Invalidator,
}

impl CacheSystem {
    pub async fn from_settings(settings: &CacheSettings) -> Self {
        let store = create_cache_store(settings).await;
        Self::with_store(store, settings)
    }

    pub fn with_store(store: CacheStore, settings: &CacheSettings) -> Self {
        Self {
            queries: QueryResultCache::new(store.clone(), settings.query.clone()),
            invalidator: Invalidator::new(store.clone(), settings.invalidator.clone()),
            store,
        }
    }

    /// Stop background work and close the shared tier.
    pub async fn close(&self) {
        self.queries.close();
        self.store.close().await;
    }
}
