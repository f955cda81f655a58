use std::time::Duration;

use futures::future::join_all;
use lazycache::CacheError;
use tokio::time::sleep;

use crate::utils::{CountingLoader, TIMEOUT, setup_cache};

#[tokio::test(start_paused = true)]
async fn test_discard() {
    let loader = CountingLoader::new();
    let cache = setup_cache(&loader, |_| {});

    let first = cache.load("a", TIMEOUT).await.unwrap();
    cache.discard("a").await.unwrap();

    assert_eq!(cache.len().await.unwrap(), 0);
    assert_eq!(loader.releases().count_of("a"), 1);
    // Callers may keep using the object after it left the cache.
    assert_eq!(first.value, 1);

    assert_eq!(cache.load("a", TIMEOUT).await.unwrap().value, 2);
}

#[tokio::test(start_paused = true)]
async fn test_discard_unknown_key() {
    let loader = CountingLoader::new();
    let cache = setup_cache(&loader, |_| {});

    cache.discard("missing").await.unwrap();
    assert_eq!(cache.len().await.unwrap(), 0);
    assert_eq!(loader.releases().count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_discard_while_loading() {
    let loader = CountingLoader::new().with_delay(Duration::from_millis(100));
    let cache = setup_cache(&loader, |_| {});

    let (objects, discarded) = tokio::join!(
        join_all((0..3).map(|_| cache.load("a", TIMEOUT))),
        async {
            sleep(Duration::from_millis(10)).await;
            cache.discard("a").await
        }
    );

    discarded.unwrap();
    assert_eq!(objects.len(), 3);
    for object in objects {
        let err = object.unwrap_err();
        assert!(matches!(err, CacheError::DiscardedWhileLoading(ref key) if key == "a"));
    }
    assert_eq!(loader.calls(), 1);
    assert_eq!(cache.len().await.unwrap(), 0);

    // The result of the abandoned load is released once it arrives.
    sleep(Duration::from_millis(200)).await;
    assert_eq!(cache.len().await.unwrap(), 0);
    assert_eq!(loader.releases().count_of("a"), 1);
}

#[tokio::test(start_paused = true)]
async fn test_stale_load_does_not_replace_newer() {
    let loader = CountingLoader::new().with_delay(Duration::from_millis(100));
    let cache = setup_cache(&loader, |config| {
        config.ttl = Duration::from_secs(60);
    });

    let (first, _, second) = tokio::join!(
        cache.load("a", TIMEOUT),
        async {
            sleep(Duration::from_millis(10)).await;
            cache.discard("a").await.unwrap();
        },
        async {
            sleep(Duration::from_millis(20)).await;
            cache.load("a", TIMEOUT).await
        },
    );

    assert!(first.is_err());
    let second = second.unwrap();
    assert_eq!(second.value, 2);

    // The first load finished earlier, and its object was released instead of cached.
    assert_eq!(loader.releases().count_of("a"), 1);
    let cached = cache.load("a", TIMEOUT).await.unwrap();
    assert!(std::sync::Arc::ptr_eq(&cached, &second));
}

#[tokio::test(start_paused = true)]
async fn test_discard_release_failure() {
    let loader = CountingLoader::new();
    let cache = setup_cache(&loader, |_| {});
    loader.fail_release_of("a");

    cache.load("a", TIMEOUT).await.unwrap();
    let err = cache.discard("a").await.unwrap_err();

    assert_eq!(err.to_string(), "failed to release `a`: `a` is still in use");
    assert_eq!(cache.len().await.unwrap(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_clear() {
    let loader = CountingLoader::new();
    let cache = setup_cache(&loader, |_| {});

    for key in ["a", "b", "c"] {
        cache.load(key, TIMEOUT).await.unwrap();
    }
    cache.clear().await.unwrap();

    assert!(cache.is_empty().await.unwrap());
    assert_eq!(loader.releases().ids(), ["a", "b", "c"]);
}

#[tokio::test(start_paused = true)]
async fn test_clear_reports_all_release_failures() {
    let loader = CountingLoader::new();
    let cache = setup_cache(&loader, |_| {});

    for key in ["k1", "k3", "k4"] {
        loader.fail_release_of(key);
    }
    for key in ["k0", "k1", "k2", "k3", "k4"] {
        cache.load(key, TIMEOUT).await.unwrap();
    }

    let err = cache.clear().await.unwrap_err();
    let CacheError::ReleaseFailed(errors) = &err else {
        panic!("unexpected error: {err}");
    };

    let mut keys: Vec<_> = errors.iter().map(|e| e.key.as_str()).collect();
    keys.sort();
    assert_eq!(keys, ["k1", "k3", "k4"]);

    let message = err.to_string();
    assert!(message.starts_with("failed to release 3 objects"));
    for key in ["k1", "k3", "k4"] {
        assert!(message.contains(&format!("`{key}`")));
    }

    // Every object was released, and the cache is empty.
    assert_eq!(cache.len().await.unwrap(), 0);
    assert_eq!(loader.releases().count(), 5);
}

#[tokio::test(start_paused = true)]
async fn test_clear_while_loading() {
    let loader = CountingLoader::new().with_delay(Duration::from_millis(100));
    let cache = setup_cache(&loader, |_| {});

    let keys = ["a", "b", "a", "b", "a"];
    let (objects, cleared) = tokio::join!(
        join_all(keys.map(|key| cache.load(key, TIMEOUT))),
        async {
            sleep(Duration::from_millis(10)).await;
            cache.clear().await
        }
    );

    cleared.unwrap();
    for (key, object) in keys.into_iter().zip(objects) {
        assert!(matches!(
            object,
            Err(CacheError::DiscardedWhileLoading(ref k)) if k == key
        ));
    }
    assert_eq!(loader.calls(), 2);
}
