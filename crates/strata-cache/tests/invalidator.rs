use std::sync::Arc;
use std::time::Duration;

use strata_cache::{
    CacheError, CacheStore, InvalidationEvent, InvalidationRule, Invalidator, InvalidatorConfig,
    MemoryStore, OverflowPolicy, SetOptions, StoreConfig,
};
use tokio::sync::broadcast;

async fn seed(store: &CacheStore, keys: &[&str]) {
    for key in keys {
        store.set(key, &"cached", SetOptions::default()).await.unwrap();
    }
}

fn shared_pair() -> (Arc<MemoryStore>, CacheStore, CacheStore) {
    let shared = Arc::new(MemoryStore::new());
    let a = CacheStore::builder(StoreConfig::default())
        .shared(shared.clone())
        .build();
    let b = CacheStore::builder(StoreConfig::default())
        .shared(shared.clone())
        .build();
    (shared, a, b)
}

#[tokio::test]
async fn tag_invalidation_removes_only_matching_keys() {
    let store = CacheStore::local();
    let invalidator = Invalidator::new(store.clone(), InvalidatorConfig::default());
    invalidator
        .register_rule(
            InvalidationRule::new("org-42")
                .tags(["org:42"])
                .patterns(["org:42:*"]),
        )
        .unwrap();
    seed(&store, &["org:42:plan", "org:42:usage", "org:7:plan"]).await;

    let deleted = invalidator.invalidate_by_tags(&["org:42"]).await.unwrap();
    assert_eq!(deleted, 2);
    assert!(!store.has("org:42:plan").await.unwrap());
    assert!(!store.has("org:42:usage").await.unwrap());
    assert!(store.has("org:7:plan").await.unwrap());

    assert_eq!(invalidator.invalidate_by_tags(&["org:7"]).await.unwrap(), 0);
    assert_eq!(invalidator.stats().keys_invalidated, 2);
}

#[tokio::test]
async fn pattern_metacharacters_are_literal() {
    let store = CacheStore::local();
    let invalidator = Invalidator::new(store.clone(), InvalidatorConfig::default());
    seed(&store, &["user.(1)profile", "userX(1)profile", "user.1profile"]).await;

    let deleted = invalidator.invalidate_by_pattern("user.(1)*").await.unwrap();
    assert_eq!(deleted, 1);
    assert!(store.has("userX(1)profile").await.unwrap());
    assert!(store.has("user.1profile").await.unwrap());
}

#[tokio::test]
async fn question_mark_matches_one_character() {
    let store = CacheStore::local();
    let invalidator = Invalidator::new(store.clone(), InvalidatorConfig::default());
    seed(&store, &["page:1", "page:2", "page:10"]).await;

    assert_eq!(invalidator.invalidate_by_pattern("page:?").await.unwrap(), 2);
    assert!(store.has("page:10").await.unwrap());
}

#[tokio::test]
async fn shared_keys_are_found_by_scanning() {
    let (_shared, writer, cold) = shared_pair();
    seed(&writer, &["org:42:plan", "org:42:usage", "org:7:plan"]).await;

    let local_only = Invalidator::new(
        cold.clone(),
        InvalidatorConfig {
            include_shared: false,
            ..InvalidatorConfig::default()
        },
    );
    assert_eq!(local_only.invalidate_by_pattern("org:42:*").await.unwrap(), 0);

    let invalidator = Invalidator::new(cold.clone(), InvalidatorConfig::default());
    assert_eq!(invalidator.invalidate_by_pattern("org:42:*").await.unwrap(), 2);
    assert!(!cold.has("org:42:plan").await.unwrap());
    assert!(cold.has("org:7:plan").await.unwrap());
}

#[tokio::test]
async fn events_resolve_placeholders_and_honour_conditions() {
    let store = CacheStore::local();
    let invalidator = Invalidator::new(store.clone(), InvalidatorConfig::default());
    invalidator
        .register_rule(
            InvalidationRule::new("entity")
                .tags(["user"])
                .patterns(["{entityType}:{entityId}:*"]),
        )
        .unwrap();
    invalidator
        .register_rule(
            InvalidationRule::new("lists-on-delete")
                .tags(["user"])
                .patterns(["{entityType}:list:*"])
                .when(|event| event.event_type == "deleted"),
        )
        .unwrap();
    seed(&store, &["user:1:profile", "user:2:profile", "user:list:active"]).await;

    let updated = InvalidationEvent::new("updated", "user").with_entity_id("1");
    assert_eq!(invalidator.process_event(updated).await.unwrap(), 1);
    assert!(store.has("user:list:active").await.unwrap());

    let deleted = InvalidationEvent::new("deleted", "user").with_entity_id("2");
    assert_eq!(invalidator.process_event(deleted).await.unwrap(), 2);
    assert!(store.local_keys().is_empty());
    assert_eq!(invalidator.stats().events_processed, 2);
}

#[tokio::test]
async fn rules_run_in_priority_order() {
    let store = CacheStore::local();
    let invalidator = Invalidator::new(store, InvalidatorConfig::default());
    for (id, priority) in [("low", 1), ("high", 10), ("mid", 5), ("mid-later", 5)] {
        invalidator
            .register_rule(InvalidationRule::new(id).tags(["t"]).priority(priority))
            .unwrap();
    }
    assert_eq!(invalidator.rule_ids(), vec!["high", "mid", "mid-later", "low"]);

    assert!(matches!(
        invalidator.register_rule(InvalidationRule::new("high")),
        Err(CacheError::DuplicateRule(_))
    ));
    assert!(invalidator.unregister_rule("mid"));
    assert!(!invalidator.unregister_rule("mid"));
}

#[tokio::test]
async fn panicking_condition_does_not_stop_other_rules() {
    let store = CacheStore::local();
    let invalidator = Invalidator::new(store.clone(), InvalidatorConfig::default());
    invalidator
        .register_rule(
            InvalidationRule::new("broken")
                .tags(["org"])
                .patterns(["org:*"])
                .priority(10)
                .when(|_| panic!("bad rule")),
        )
        .unwrap();
    invalidator
        .register_rule(InvalidationRule::new("fine").tags(["org"]).patterns(["org:*"]))
        .unwrap();
    seed(&store, &["org:1", "org:2"]).await;

    let deleted = invalidator
        .process_event(InvalidationEvent::new("updated", "org"))
        .await
        .unwrap();
    assert_eq!(deleted, 2);
    assert_eq!(invalidator.stats().rule_failures, 1);
}

#[tokio::test]
async fn rule_limit_is_enforced() {
    let invalidator = Invalidator::new(
        CacheStore::local(),
        InvalidatorConfig {
            max_rules: 2,
            ..InvalidatorConfig::default()
        },
    );
    invalidator.register_rule(InvalidationRule::new("a")).unwrap();
    invalidator.register_rule(InvalidationRule::new("b")).unwrap();
    assert!(matches!(
        invalidator.register_rule(InvalidationRule::new("c")),
        Err(CacheError::RuleLimit { max: 2 })
    ));
}

#[tokio::test]
async fn queued_events_drop_oldest_on_overflow() {
    let store = CacheStore::local();
    let invalidator = Invalidator::new(
        store.clone(),
        InvalidatorConfig {
            auto_invalidate: false,
            queue_capacity: 2,
            ..InvalidatorConfig::default()
        },
    );
    invalidator
        .register_rule(
            InvalidationRule::new("entity")
                .tags(["doc"])
                .patterns(["doc:{entityId}"]),
        )
        .unwrap();
    seed(&store, &["doc:1", "doc:2", "doc:3"]).await;

    for id in ["1", "2", "3"] {
        let event = InvalidationEvent::new("updated", "doc").with_entity_id(id);
        assert_eq!(invalidator.process_event(event).await.unwrap(), 0);
    }
    assert_eq!(invalidator.queue_len(), 2);
    assert!(store.has("doc:1").await.unwrap());

    assert_eq!(invalidator.process_queue().await, 2);
    assert_eq!(invalidator.queue_len(), 0);
    assert!(store.has("doc:1").await.unwrap());
    assert!(!store.has("doc:2").await.unwrap());
    assert!(!store.has("doc:3").await.unwrap());

    let stats = invalidator.stats();
    assert_eq!(stats.events_dropped_oldest, 1);
    assert_eq!(stats.events_processed, 2);
}

#[tokio::test]
async fn queued_events_drop_newest_on_overflow() {
    let invalidator = Invalidator::new(
        CacheStore::local(),
        InvalidatorConfig {
            auto_invalidate: false,
            queue_capacity: 1,
            overflow_policy: OverflowPolicy::DropNewest,
            ..InvalidatorConfig::default()
        },
    );
    invalidator
        .process_event(InvalidationEvent::new("updated", "a"))
        .await
        .unwrap();
    invalidator
        .process_event(InvalidationEvent::new("updated", "b"))
        .await
        .unwrap();

    assert_eq!(invalidator.queue_len(), 1);
    assert_eq!(invalidator.stats().events_dropped_newest, 1);
}

#[tokio::test]
async fn listener_applies_broadcast_events() {
    let store = CacheStore::local();
    let invalidator = Invalidator::new(store.clone(), InvalidatorConfig::default());
    invalidator
        .register_rule(
            InvalidationRule::new("entity")
                .tags(["order"])
                .patterns(["order:{entityId}"]),
        )
        .unwrap();
    seed(&store, &["order:9"]).await;

    let (tx, rx) = broadcast::channel(16);
    let listener = invalidator.spawn_listener(rx);
    tx.send(InvalidationEvent::new("updated", "order").with_entity_id("9"))
        .unwrap();
    drop(tx);

    tokio::time::timeout(Duration::from_secs(1), listener)
        .await
        .expect("listener should stop when the channel closes")
        .unwrap();
    assert!(!store.has("order:9").await.unwrap());
}
