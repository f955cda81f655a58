use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use lazycache::{CacheError, Freshness};
use tokio::time::sleep;

use crate::utils::{CountingLoader, TIMEOUT, setup_cache};

#[tokio::test(start_paused = true)]
async fn test_unused_entries_expire() {
    let loader = CountingLoader::new();
    let cache = setup_cache(&loader, |_| {});

    assert_eq!(cache.load("a", TIMEOUT).await.unwrap().value, 1);
    sleep(Duration::from_millis(20)).await;
    assert_eq!(cache.load("a", TIMEOUT).await.unwrap().value, 1);

    sleep(Duration::from_millis(100)).await;
    assert_eq!(cache.len().await.unwrap(), 0);
    assert_eq!(loader.releases().count_of("a"), 1);

    assert_eq!(cache.load("a", TIMEOUT).await.unwrap().value, 2);
    assert_eq!(loader.calls(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_access_extends_lifetime() {
    let loader = CountingLoader::new();
    let cache = setup_cache(&loader, |_| {});

    for _ in 0..5 {
        assert_eq!(cache.load("a", TIMEOUT).await.unwrap().value, 1);
        sleep(Duration::from_millis(30)).await;
    }

    assert_eq!(loader.calls(), 1);
    assert_eq!(loader.releases().count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_expired_entry_reloads_before_sweep() {
    let loader = CountingLoader::new();
    let cache = setup_cache(&loader, |config| {
        config.check_interval = Duration::from_secs(3600);
    });

    let first = cache.load("a", TIMEOUT).await.unwrap();
    sleep(Duration::from_millis(100)).await;
    assert_eq!(cache.len().await.unwrap(), 1);

    let second = cache.load("a", TIMEOUT).await.unwrap();
    assert_eq!(second.value, 2);
    assert!(!Arc::ptr_eq(&first, &second));
    assert_eq!(loader.releases().count_of("a"), 1);
    // The expired object is not checked anymore.
    assert_eq!(first.checks(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_evict_expired_on_demand() {
    let loader = CountingLoader::new();
    let cache = setup_cache(&loader, |config| {
        config.check_interval = Duration::from_secs(3600);
    });

    cache.load("a", TIMEOUT).await.unwrap();
    cache.load("b", TIMEOUT).await.unwrap();
    sleep(Duration::from_millis(40)).await;
    cache.load("b", TIMEOUT).await.unwrap();
    sleep(Duration::from_millis(20)).await;

    assert_eq!(cache.evict_expired().await.unwrap(), 1);
    assert_eq!(cache.len().await.unwrap(), 1);
    assert_eq!(loader.releases().ids(), ["a"]);
}

#[tokio::test(start_paused = true)]
async fn test_sweep_release_failure() {
    let loader = CountingLoader::new();
    let cache = setup_cache(&loader, |config| {
        config.check_interval = Duration::from_secs(3600);
    });
    loader.fail_release_of("a");

    cache.load("a", TIMEOUT).await.unwrap();
    cache.load("b", TIMEOUT).await.unwrap();
    sleep(Duration::from_millis(60)).await;

    let err = cache.evict_expired().await.unwrap_err();
    match err {
        CacheError::ReleaseFailed(errors) => {
            assert_eq!(errors.len(), 1);
            assert_eq!(errors.iter().next().unwrap().key, "a");
        }
        other => panic!("unexpected error: {other}"),
    }
    // Both are gone regardless.
    assert_eq!(cache.len().await.unwrap(), 0);
    assert_eq!(loader.releases().count(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_loading_entries_do_not_expire() {
    let loader = CountingLoader::new().with_delay(Duration::from_millis(200));
    let cache = setup_cache(&loader, |_| {});

    let (object, len) = tokio::join!(cache.load("a", TIMEOUT), async {
        sleep(Duration::from_millis(150)).await;
        cache.len().await
    });

    assert_eq!(object.unwrap().value, 1);
    assert_eq!(len.unwrap(), 1);
    assert_eq!(loader.calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_outdated_entry_reloads() {
    let loader = CountingLoader::new();
    let cache = setup_cache(&loader, |_| {});

    let first = cache.load("a", TIMEOUT).await.unwrap();
    first.outdate();

    let second = cache.load("a", TIMEOUT).await.unwrap();
    assert_eq!(second.value, 2);
    assert!(!Arc::ptr_eq(&first, &second));
    assert_eq!(loader.calls(), 2);
    assert_eq!(loader.releases().count_of("a"), 1);
}

#[tokio::test(start_paused = true)]
async fn test_outdated_on_third_check() {
    let loader = CountingLoader::new();
    let cache = setup_cache(&loader, |_| {});

    let first = cache.load("a", TIMEOUT).await.unwrap();
    first.push_freshness(Freshness::Fresh);
    first.push_freshness(Freshness::Fresh);
    first.push_freshness(Freshness::Outdated);

    for _ in 0..2 {
        let hit = cache.load("a", TIMEOUT).await.unwrap();
        assert!(Arc::ptr_eq(&first, &hit));
    }
    let reloaded = cache.load("a", TIMEOUT).await.unwrap();

    assert!(!Arc::ptr_eq(&first, &reloaded));
    assert_eq!(reloaded.value, 2);
    assert_eq!(first.checks(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_outdated_reload_is_shared() {
    let loader = CountingLoader::new().with_delay(Duration::from_millis(20));
    let cache = setup_cache(&loader, |_| {});

    let first = cache.load("a", TIMEOUT).await.unwrap();
    first.outdate();

    let results = join_all((0..3).map(|_| cache.load("a", TIMEOUT))).await;
    let objects: Vec<_> = results.into_iter().map(Result::unwrap).collect();

    assert!(objects.iter().all(|o| o.value == 2));
    assert!(objects.iter().all(|o| Arc::ptr_eq(o, &objects[0])));
    assert_eq!(loader.calls(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_check_failure_drops_entry() {
    let loader = CountingLoader::new();
    let cache = setup_cache(&loader, |_| {});

    let first = cache.load("a", TIMEOUT).await.unwrap();
    first.fail_next_check("disk gone");

    let err = cache.load("a", TIMEOUT).await.unwrap_err();
    match err {
        CacheError::CheckFailed { key, source } => {
            assert_eq!(key, "a");
            assert_eq!(source.to_string(), "disk gone");
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(cache.len().await.unwrap(), 0);
    assert_eq!(loader.releases().count_of("a"), 1);

    assert_eq!(cache.load("a", TIMEOUT).await.unwrap().value, 2);
}

#[tokio::test(start_paused = true)]
async fn test_unbounded_ttl() {
    let loader = CountingLoader::new();
    let cache = setup_cache(&loader, |config| {
        config.ttl = Duration::MAX;
    });

    cache.load("a", TIMEOUT).await.unwrap();
    sleep(Duration::from_secs(1)).await;

    assert_eq!(cache.evict_expired().await.unwrap(), 0);
    assert_eq!(cache.load("a", TIMEOUT).await.unwrap().value, 1);
    assert_eq!(loader.calls(), 1);
    assert_eq!(loader.releases().count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_unbounded_check_interval() {
    let loader = CountingLoader::new();
    let cache = setup_cache(&loader, |config| {
        config.check_interval = Duration::MAX;
    });

    cache.load("a", TIMEOUT).await.unwrap();
    sleep(Duration::from_millis(100)).await;

    // The sweep never runs, but the entry can still be evicted on demand.
    assert_eq!(cache.len().await.unwrap(), 1);
    assert_eq!(cache.evict_expired().await.unwrap(), 1);
    assert_eq!(loader.releases().count_of("a"), 1);
}
