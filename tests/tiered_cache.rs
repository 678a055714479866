//! Tiered manager behaviour with scripted failing and slow tiers.

mod support;

use std::sync::Arc;
use std::time::Duration;

use tiercache::cache::{
    CacheLayer, CacheStore, CacheStoreExt, EventQueue, ManagerConfig, NoopNotifier, SetOptions,
    TieredCacheManager,
};

use support::{ScriptedStore, key, memory};

fn manager(timeout_ms: u64) -> TieredCacheManager<String> {
    TieredCacheManager::new(
        ManagerConfig {
            layer_timeout_ms: timeout_ms,
            promotion_ttl_ms: None,
        },
        Arc::new(NoopNotifier),
    )
}

#[tokio::test]
async fn failing_middle_tier_is_skipped_on_reads_and_writes() {
    let l1 = memory("l1");
    let l2 = ScriptedStore::new("l2");
    let l3 = memory("l3");
    let manager = manager(250);
    manager.add_layer(CacheLayer::new("l1", 1, l1.clone())).expect("add l1");
    manager.add_layer(CacheLayer::new("l2", 2, l2.clone())).expect("add l2");
    manager.add_layer(CacheLayer::new("l3", 3, l3.clone())).expect("add l3");

    l3.set(&key("app", "k"), "deep".to_string(), SetOptions::default())
        .await
        .expect("seed");
    l2.set_failing(true);

    let value = manager.get(&key("app", "k")).await.expect("get never fails");
    assert_eq!(value.as_deref(), Some("deep"));
    assert!(l1.peek(&key("app", "k")).is_some(), "hit promoted past failed tier");

    let stored = manager
        .set(&key("app", "w"), "written".to_string(), SetOptions::default())
        .await
        .expect("set never fails");
    assert!(stored);
    assert!(l1.peek(&key("app", "w")).is_some());
    assert!(l3.peek(&key("app", "w")).is_some());
    assert!(l2.inner().peek(&key("app", "w")).is_none());

    let stats = manager.stats().await;
    assert!(stats.counters["layer_errors"] >= 2);

    let health = manager.health().await;
    assert!(!health.healthy);
    assert_eq!(health.error.as_deref(), Some("unhealthy layers: l2"));

    l2.set_failing(false);
    assert!(manager.health().await.healthy);
}

#[tokio::test(start_paused = true)]
async fn slow_tier_is_bounded_by_layer_timeout() {
    let slow = ScriptedStore::new("slow");
    let fast = memory("fast");
    fast.set(&key("app", "k"), "fast".to_string(), SetOptions::default())
        .await
        .expect("seed");
    slow.set_stall(Duration::from_secs(30));

    let manager = manager(50);
    manager.add_layer(CacheLayer::new("slow", 1, slow.clone())).expect("add");
    manager.add_layer(CacheLayer::new("fast", 2, fast.clone())).expect("add");

    let started = tokio::time::Instant::now();
    let value = manager.get(&key("app", "k")).await.expect("get");
    assert_eq!(value.as_deref(), Some("fast"));
    assert!(started.elapsed() < Duration::from_secs(1));
}

#[tokio::test]
async fn all_tiers_failing_reads_as_a_miss() {
    let a = ScriptedStore::new("a");
    let b = ScriptedStore::new("b");
    a.set_failing(true);
    b.set_failing(true);

    let manager = manager(250);
    manager.add_layer(CacheLayer::new("a", 1, a)).expect("add");
    manager.add_layer(CacheLayer::new("b", 2, b)).expect("add");

    assert_eq!(manager.get(&key("app", "k")).await.expect("get"), None);
    let stored = manager
        .set(&key("app", "k"), "v".to_string(), SetOptions::default())
        .await
        .expect("set");
    assert!(!stored);
    assert!(!manager.exists(&key("app", "k")).await.expect("exists"));
}

#[tokio::test]
async fn fallback_tier_serves_only_after_upstream_failure() {
    let primary = ScriptedStore::new("primary");
    let backup = memory("backup");
    backup
        .set(&key("app", "k"), "backup".to_string(), SetOptions::default())
        .await
        .expect("seed");

    let manager = manager(250);
    manager.add_layer(CacheLayer::new("primary", 1, primary.clone())).expect("add");
    manager
        .add_layer(CacheLayer::new("backup", 2, backup.clone()).fallback())
        .expect("add");

    assert_eq!(manager.get(&key("app", "k")).await.expect("get"), None);

    primary.set_failing(true);
    assert_eq!(
        manager.get(&key("app", "k")).await.expect("get").as_deref(),
        Some("backup")
    );
}

#[tokio::test]
async fn cache_aside_through_the_manager() {
    let events = Arc::new(EventQueue::new(std::num::NonZeroUsize::new(64).expect("non-zero")));
    let manager = TieredCacheManager::<String>::new(ManagerConfig::default(), events.clone());
    let l1 = memory("l1");
    manager.add_layer(CacheLayer::new("l1", 1, l1.clone())).expect("add");

    let loaded: Result<String, std::io::Error> = manager
        .get_or_set(&key("app", "profile"), SetOptions::default(), || async {
            Ok("loaded".to_string())
        })
        .await;
    assert_eq!(loaded.expect("loader"), "loaded");

    let cached: Result<String, std::io::Error> = manager
        .get_or_set(&key("app", "profile"), SetOptions::default(), || async {
            panic!("loader must not run on a hit")
        })
        .await;
    assert_eq!(cached.expect("cached"), "loaded");

    let names: Vec<_> = events.drain(64).iter().map(|event| event.name()).collect();
    assert!(names.contains(&"layer_added"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_traffic_and_layer_changes_lose_no_counts() {
    const READERS: usize = 8;
    const WRITERS: usize = 4;
    const OPS: usize = 200;

    let manager = Arc::new(manager(250));
    manager.add_layer(CacheLayer::new("l1", 1, memory("l1"))).expect("add l1");
    manager.add_layer(CacheLayer::new("l2", 2, memory("l2"))).expect("add l2");

    let mut handles = Vec::new();
    for reader in 0..READERS {
        let manager = manager.clone();
        handles.push(tokio::spawn(async move {
            for op in 0..OPS {
                let name = format!("k{}", (reader + op) % 50);
                manager.get(&key("app", &name)).await.expect("get never fails");
            }
        }));
    }
    for writer in 0..WRITERS {
        let manager = manager.clone();
        handles.push(tokio::spawn(async move {
            for op in 0..OPS {
                let name = format!("k{}", (writer * OPS + op) % 50);
                manager
                    .set(&key("app", &name), name.clone(), SetOptions::default())
                    .await
                    .expect("set never fails");
            }
        }));
    }
    {
        let manager = manager.clone();
        handles.push(tokio::spawn(async move {
            for round in 0..100 {
                manager
                    .add_layer(CacheLayer::new("churn", 0, memory("churn")))
                    .expect("add churn");
                manager.enable_layer("l2", round % 2 == 0).expect("toggle l2");
                tokio::task::yield_now().await;
                manager.remove_layer("churn").expect("remove churn");
            }
            manager.enable_layer("l2", true).expect("re-enable l2");
        }));
    }

    for handle in handles {
        handle.await.expect("task");
    }

    let stats = manager.stats().await;
    let reads = (READERS * OPS) as u64;
    assert_eq!(stats.hits + stats.misses, reads);
    assert_eq!(stats.counters["requests"], reads);
    let names: Vec<_> = manager.get_layers().into_iter().map(|layer| layer.name).collect();
    assert_eq!(names, vec!["l1", "l2"]);
}
