//! Integration tests for the Redis shared tier.
//!
//! A single Redis container is started through testcontainers and shared by
//! every test in this file. The tests need a Docker daemon and are ignored by
//! default; run them with `cargo test -- --ignored`.

use std::time::Duration;

use strata_cache::{
    CacheSettings, CacheStore, ComputeOptions, RedisConfig, SetOptions, SharedStore,
    create_cache_store, create_shared_store,
};
use testcontainers::{ContainerAsync, runners::AsyncRunner};
use testcontainers_modules::redis::Redis;
use tokio::sync::OnceCell;

// Shared Redis container for all tests
static SHARED_REDIS: OnceCell<(ContainerAsync<Redis>, String)> = OnceCell::const_new();

/// Get or create the shared Redis container
async fn get_redis_url() -> String {
    let (_, url) = SHARED_REDIS
        .get_or_init(|| async {
            let container = Redis::default()
                .start()
                .await
                .expect("start redis container");

            let host_port = container.get_host_port_ipv4(6379).await.expect("get port");
            let url = format!("redis://127.0.0.1:{}", host_port);

            (container, url)
        })
        .await;

    url.clone()
}

async fn settings(prefix: &str, pubsub: bool) -> CacheSettings {
    let mut settings = CacheSettings::default();
    settings.redis = RedisConfig {
        enabled: true,
        url: get_redis_url().await,
        pubsub,
        ..RedisConfig::default()
    };
    settings.store.key_prefix = prefix.to_string();
    settings
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_redis_store_basic_commands() {
    let settings = settings("basic:", false).await;
    let shared = create_shared_store(&settings.redis)
        .await
        .expect("redis should be reachable");
    assert_eq!(shared.name(), "redis");

    shared
        .set_with_expiry("basic:k", "\"v\"", Duration::from_secs(60))
        .await
        .unwrap();
    assert_eq!(shared.get("basic:k").await.unwrap().as_deref(), Some("\"v\""));
    assert!(shared.exists("basic:k").await.unwrap());
    assert!(shared.delete("basic:k").await.unwrap());
    assert!(!shared.exists("basic:k").await.unwrap());
    shared.ping().await.unwrap();
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_redis_millisecond_ttl() {
    let settings = settings("ttl:", false).await;
    let store = create_cache_store(&settings).await;
    assert_eq!(store.stats().shared_backend.as_deref(), Some("redis"));

    store
        .set("short", &1u8, SetOptions::ttl(Duration::from_millis(150)))
        .await
        .unwrap();
    assert!(store.shared().unwrap().exists("ttl:short").await.unwrap());

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(!store.has("short").await.unwrap());
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_redis_two_instances_share_values() {
    let settings = settings("pair:", false).await;
    let a = create_cache_store(&settings).await;
    let b = create_cache_store(&settings).await;

    let computed: String = a
        .get_or_compute(
            "greeting",
            || async { Ok::<_, anyhow::Error>("hello".to_string()) },
            ComputeOptions::default(),
        )
        .await
        .unwrap();
    assert_eq!(computed, "hello");

    assert_eq!(b.get::<String>("greeting").await.unwrap().as_deref(), Some("hello"));
    assert!(b.local_tier().contains("greeting"));
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_redis_clear_and_scan() {
    let settings = settings("scan:", false).await;
    let store = create_cache_store(&settings).await;
    for i in 0..250u32 {
        store
            .set(&format!("item:{i}"), &i, SetOptions::default())
            .await
            .unwrap();
    }

    let found = store.scan_shared("item:1?").await.unwrap();
    assert_eq!(found.len(), 10);

    let cleared = store.clear_tier_shared().await.unwrap();
    assert_eq!(cleared, 250);
    assert!(store.scan_shared("item:*").await.unwrap().is_empty());
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_redis_pubsub_evicts_other_instances() {
    let settings = settings("pubsub:", true).await;
    let writer = create_cache_store(&settings).await;
    let reader = create_cache_store(&settings).await;
    // Let both listeners subscribe
    tokio::time::sleep(Duration::from_millis(300)).await;

    writer.set("doc:1", &"v1", SetOptions::default()).await.unwrap();
    assert_eq!(reader.get::<String>("doc:1").await.unwrap().as_deref(), Some("v1"));
    assert!(reader.local_tier().contains("doc:1"));

    writer.delete("doc:1").await.unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(!reader.local_tier().contains("doc:1"));

    writer.close().await;
    reader.close().await;
}

#[tokio::test]
async fn test_unreachable_redis_falls_back_to_local() {
    let mut settings = CacheSettings::default();
    settings.redis = RedisConfig {
        enabled: true,
        url: "redis://127.0.0.1:1".to_string(),
        timeout_ms: 200,
        ..RedisConfig::default()
    };
    let store: CacheStore = create_cache_store(&settings).await;
    assert!(store.shared().is_none());

    store.set("k", &"v", SetOptions::default()).await.unwrap();
    assert_eq!(store.get::<String>("k").await.unwrap().as_deref(), Some("v"));
}
