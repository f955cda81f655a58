use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use lazycache::{BoxError, Cache, CacheError, CacheStats, Cacheable};
use tokio::time::Instant;

use crate::utils::{CountingLoader, TIMEOUT, TestObject, setup_cache};

#[tokio::test(start_paused = true)]
async fn test_single_flight() {
    let loader = CountingLoader::new().with_delay(Duration::from_millis(50));
    let cache = setup_cache(&loader, |_| {});

    let results = join_all((0..10).map(|_| cache.load("a", TIMEOUT))).await;

    let objects: Vec<_> = results.into_iter().map(Result::unwrap).collect();
    assert_eq!(loader.calls(), 1);
    assert!(objects.iter().all(|o| Arc::ptr_eq(o, &objects[0])));
    assert_eq!(objects[0].value, 1);
}

#[tokio::test(start_paused = true)]
async fn test_hit_checks_freshness() {
    let loader = CountingLoader::new();
    let cache = setup_cache(&loader, |_| {});

    let first = cache.load("a", TIMEOUT).await.unwrap();
    let second = cache.load("a", TIMEOUT).await.unwrap();

    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(loader.calls(), 1);
    // Only the hit is checked, not the fresh load.
    assert_eq!(first.checks(), 1);
    assert_eq!(cache.len().await.unwrap(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_keys_load_concurrently() {
    let loader = CountingLoader::new().with_delay(Duration::from_millis(100));
    let cache = setup_cache(&loader, |_| {});

    let start = Instant::now();
    let (a, b) = tokio::join!(cache.load("a", TIMEOUT), cache.load("b", TIMEOUT));

    assert_eq!(a.unwrap().id(), "a");
    assert_eq!(b.unwrap().id(), "b");
    assert!(start.elapsed() < Duration::from_millis(200));
    assert_eq!(loader.calls(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_stats() {
    let loader = CountingLoader::new().with_delay(Duration::from_millis(100));
    let cache = setup_cache(&loader, |_| {});
    cache.load("a", TIMEOUT).await.unwrap();

    let (b, stats) = tokio::join!(cache.load("b", TIMEOUT), async {
        tokio::time::sleep(Duration::from_millis(10)).await;
        cache.stats().await
    });

    b.unwrap();
    assert_eq!(
        stats.unwrap(),
        CacheStats {
            loading: 1,
            loaded: 1
        }
    );
    assert!(!cache.is_empty().await.unwrap());
}

#[tokio::test(start_paused = true)]
async fn test_load_failure_is_not_cached() {
    let loader = CountingLoader::new();
    let cache = setup_cache(&loader, |_| {});
    loader.fail("a");

    let err = cache.load("a", TIMEOUT).await.unwrap_err();
    match err {
        CacheError::LoadFailed { key, source } => {
            assert_eq!(key, "a");
            assert_eq!(source.to_string(), "no object for `a`");
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(cache.len().await.unwrap(), 0);

    loader.succeed("a");
    let object = cache.load("a", TIMEOUT).await.unwrap();
    assert_eq!(object.value, 2);
    assert_eq!(loader.calls_for("a"), 2);
}

#[tokio::test(start_paused = true)]
async fn test_load_failure_reaches_every_waiter() {
    let loader = CountingLoader::new().with_delay(Duration::from_millis(50));
    let cache = setup_cache(&loader, |_| {});
    loader.fail("a");

    let results = join_all((0..3).map(|_| cache.load("a", TIMEOUT))).await;

    for result in results {
        assert!(matches!(result, Err(CacheError::LoadFailed { .. })));
    }
    assert_eq!(loader.calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_loader_panic() {
    let loader = CountingLoader::new();
    let cache = setup_cache(&loader, |_| {});
    loader.panic_on("a");

    let err = cache.load("a", TIMEOUT).await.unwrap_err();
    assert_eq!(err.to_string(), "failed to load `a`: loader panicked");

    // the worker survives
    assert_eq!(cache.load("b", TIMEOUT).await.unwrap().id(), "b");
    assert_eq!(cache.len().await.unwrap(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_timeout_keeps_loading() {
    let loader = CountingLoader::new().with_delay(Duration::from_millis(200));
    let cache = setup_cache(&loader, |_| {});

    let timeout = Duration::from_millis(50);
    let err = cache.load("a", timeout).await.unwrap_err();
    assert!(matches!(err, CacheError::Timeout(t) if t == timeout));

    let object = cache.load("a", TIMEOUT).await.unwrap();
    assert_eq!(object.value, 1);
    assert_eq!(loader.calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_closure_loader() {
    lazycache_test::setup();
    let releases = lazycache_test::Releases::default();
    let loader_releases = releases.clone();
    let cache = Cache::builder()
        .loader(move |key: String| {
            let releases = loader_releases.clone();
            async move { Ok::<_, BoxError>(TestObject::new(key, 42, &releases)) }
        })
        .instance_id("closure")
        .build()
        .unwrap();

    assert_eq!(cache.id(), "closure");
    assert_eq!(cache.load("a", TIMEOUT).await.unwrap().value, 42);
    cache.stop().await.unwrap();
    assert_eq!(releases.ids(), ["a"]);
}

#[tokio::test(start_paused = true)]
async fn test_invalid_configuration() {
    lazycache_test::setup();

    let err = Cache::<TestObject>::builder().build().unwrap_err();
    assert!(matches!(err, CacheError::Configuration(_)));

    let err = Cache::<TestObject>::builder()
        .loader(CountingLoader::new())
        .check_interval(Duration::ZERO)
        .build()
        .unwrap_err();
    assert!(matches!(err, CacheError::Configuration(_)));
}

#[test]
fn test_requires_runtime() {
    let err = Cache::<TestObject>::builder()
        .loader(CountingLoader::new())
        .build()
        .unwrap_err();
    assert_eq!(
        err.to_string(),
        "invalid cache configuration: not running on a tokio runtime"
    );
}

#[tokio::test(start_paused = true)]
async fn test_generated_instance_ids() {
    let loader = CountingLoader::new();
    let first = setup_cache(&loader, |_| {});
    let second = setup_cache(&loader, |_| {});

    assert!(!first.id().is_empty());
    assert_ne!(first.id(), second.id());
}
