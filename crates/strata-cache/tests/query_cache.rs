use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use serde_json::{Value, json};
use strata_cache::{
    CacheStore, MemoryStore, QueryCacheConfig, QueryOptions, QueryResultCache, StoreConfig,
};

const ORDERS_BY_USER: &str = "SELECT o.id, u.email FROM orders o JOIN users u ON u.id = o.user_id WHERE u.id = $1";
const USER_BY_ID: &str = "SELECT * FROM users WHERE id = $1";

fn query_cache() -> QueryResultCache {
    let store = CacheStore::builder(StoreConfig::default())
        .shared(Arc::new(MemoryStore::new()))
        .build();
    QueryResultCache::new(store, QueryCacheConfig::default())
}

async fn run(
    cache: &QueryResultCache,
    query: &str,
    params: &Value,
    calls: &Arc<AtomicUsize>,
    opts: QueryOptions,
) -> bool {
    let calls = calls.clone();
    let result = cache
        .execute(
            query,
            params,
            move || async move {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                Ok::<_, anyhow::Error>(json!({"rows": [n]}))
            },
            opts,
        )
        .await
        .unwrap();
    result.hit
}

#[tokio::test]
async fn repeated_query_is_served_from_cache() {
    let cache = query_cache();
    let calls = Arc::new(AtomicUsize::new(0));
    let params = json!([7]);

    assert!(!run(&cache, USER_BY_ID, &params, &calls, QueryOptions::depends_on(["users"])).await);
    // Whitespace differences map to the same key
    let reformatted = "SELECT *\n  FROM users\n  WHERE id = $1";
    assert!(run(&cache, reformatted, &params, &calls, QueryOptions::depends_on(["users"])).await);
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    // Different parameters are a different result
    assert!(!run(&cache, USER_BY_ID, &json!([8]), &calls, QueryOptions::depends_on(["users"])).await);
    assert_eq!(calls.load(Ordering::SeqCst), 2);

    let stats = cache.stats();
    assert_eq!(stats.hits, 1);
    assert_eq!(stats.misses, 2);
}

#[tokio::test]
async fn invalidation_is_scoped_to_dependencies() {
    let cache = query_cache();
    let joined_calls = Arc::new(AtomicUsize::new(0));
    let user_calls = Arc::new(AtomicUsize::new(0));
    let params = json!([1]);
    let joined = || QueryOptions::depends_on(["orders", "users"]);
    let users_only = || QueryOptions::depends_on(["users"]);

    assert!(!run(&cache, ORDERS_BY_USER, &params, &joined_calls, joined()).await);
    assert!(!run(&cache, USER_BY_ID, &params, &user_calls, users_only()).await);

    // Writing orders leaves the users-only result alone
    assert!(cache.invalidate_table("orders") >= 1);
    assert!(!run(&cache, ORDERS_BY_USER, &params, &joined_calls, joined()).await);
    assert!(run(&cache, USER_BY_ID, &params, &user_calls, users_only()).await);

    // Writing users hits both
    assert_eq!(cache.invalidate_table("users"), 2);
    assert!(!run(&cache, ORDERS_BY_USER, &params, &joined_calls, joined()).await);
    assert!(!run(&cache, USER_BY_ID, &params, &user_calls, users_only()).await);

    assert_eq!(joined_calls.load(Ordering::SeqCst), 3);
    assert_eq!(user_calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn dependency_order_does_not_matter() {
    let cache = query_cache();
    let calls = Arc::new(AtomicUsize::new(0));
    let params = json!([]);

    assert!(!run(&cache, "SELECT 1", &params, &calls, QueryOptions::depends_on(["users", "orders"])).await);
    assert!(run(&cache, "SELECT 1", &params, &calls, QueryOptions::depends_on(["orders", "users", "orders"])).await);
}

#[tokio::test]
async fn failures_are_skipped_when_caching_success_only() {
    let cache = query_cache();
    let calls = Arc::new(AtomicUsize::new(0));

    for _ in 0..2 {
        let calls = calls.clone();
        let result = cache
            .execute(
                "SELECT broken",
                &json!([]),
                move || async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, anyhow::Error>(json!({"error": "relation does not exist"}))
                },
                QueryOptions::default().cache_success_only(),
            )
            .await
            .unwrap();
        assert!(!result.hit);
    }
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(cache.stats().uncached_failures, 2);
}

#[tokio::test]
async fn skip_cache_refreshes_the_stored_result() {
    let cache = query_cache();
    let calls = Arc::new(AtomicUsize::new(0));
    let params = json!(["eu"]);
    let query = "SELECT count(*) FROM sessions WHERE region = $1";

    assert!(!run(&cache, query, &params, &calls, QueryOptions::default()).await);
    assert!(!run(&cache, query, &params, &calls, QueryOptions::default().skip_cache()).await);

    let refreshed = cache
        .execute(
            query,
            &params,
            || async { Ok::<_, anyhow::Error>(json!({"rows": ["unused"]})) },
            QueryOptions::default(),
        )
        .await
        .unwrap();
    assert!(refreshed.hit);
    assert_eq!(refreshed.data, json!({"rows": [1]}));
}

#[tokio::test]
async fn results_expire_with_their_ttl() {
    let cache = query_cache();
    let calls = Arc::new(AtomicUsize::new(0));
    let params = json!([]);
    let opts = || QueryOptions::depends_on(["metrics"]).with_ttl(Duration::from_millis(50));

    assert!(!run(&cache, "SELECT now()", &params, &calls, opts()).await);
    assert!(run(&cache, "SELECT now()", &params, &calls, opts()).await);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!run(&cache, "SELECT now()", &params, &calls, opts()).await);
}

#[tokio::test]
async fn invalidate_query_drops_one_result() {
    let cache = query_cache();
    let calls = Arc::new(AtomicUsize::new(0));
    let params = json!([3]);

    assert!(!run(&cache, USER_BY_ID, &params, &calls, QueryOptions::depends_on(["users"])).await);
    assert!(!run(&cache, USER_BY_ID, &json!([4]), &calls, QueryOptions::depends_on(["users"])).await);

    assert_eq!(cache.invalidate_query(USER_BY_ID, &params).await.unwrap(), 1);
    assert!(!run(&cache, USER_BY_ID, &params, &calls, QueryOptions::depends_on(["users"])).await);
    assert!(run(&cache, USER_BY_ID, &json!([4]), &calls, QueryOptions::depends_on(["users"])).await);
}

#[tokio::test]
async fn version_groups_stay_bounded() {
    let store = CacheStore::local();
    let config = QueryCacheConfig {
        max_version_groups: 20,
        ..QueryCacheConfig::default()
    };
    let cache = QueryResultCache::new(store, config);
    let calls = Arc::new(AtomicUsize::new(0));

    for i in 0..200 {
        let table = format!("t{i}");
        run(&cache, "SELECT 1", &json!([i]), &calls, QueryOptions::depends_on([table])).await;
    }
    assert!(cache.stats().version_groups <= 20);
}

#[tokio::test]
async fn invalidation_survives_version_group_eviction() {
    let store = CacheStore::builder(StoreConfig::default())
        .shared(Arc::new(MemoryStore::new()))
        .build();
    let config = QueryCacheConfig {
        max_version_groups: 10,
        ..QueryCacheConfig::default()
    };
    let cache = QueryResultCache::new(store, config);
    let calls = Arc::new(AtomicUsize::new(0));
    let params = json!([1]);
    let joined = || QueryOptions::depends_on(["orders", "users"]);

    assert!(!run(&cache, ORDERS_BY_USER, &params, &calls, joined()).await);
    tokio::time::sleep(Duration::from_millis(2)).await;

    // Push the joined group out of the version map
    let other_calls = Arc::new(AtomicUsize::new(0));
    for i in 0..10 {
        let table = format!("audit{i}");
        run(&cache, "SELECT 1", &json!([i]), &other_calls, QueryOptions::depends_on([table])).await;
    }
    assert!(!cache.stats().groups.iter().any(|g| g.group == "orders:users"));

    cache.invalidate_table("users");
    assert!(!run(&cache, ORDERS_BY_USER, &params, &calls, joined()).await);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}
