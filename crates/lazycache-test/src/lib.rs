//! Helpers for testing the cache.
//!
//! When writing tests, keep the following points in mind:
//!
//!  - In every test, call [`setup`]. This will set up the logger so that all console output
//!    is captured by the test runner.
//!
//!  - [`CountingLoader`] is cheap to clone. Keep a clone around after handing it to the cache, so
//!    that the test can inspect the number of loads and change the loader's behavior.
//!
//!  - Objects leaving the cache are recorded in [`Releases`], which outlives the objects. Checking
//!    it is the only reliable way to observe a release, since tests might still hold the object.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;
use lazycache::{BoxError, Cacheable, Freshness, Loader};
use tokio::sync::Notify;
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt::fmt;

/// Setup the test environment.
///
///  - Initializes logs: The logger only captures logs from the `lazycache` crate and mutes all
///    other logs.
pub fn setup() {
    fmt()
        .with_env_filter(EnvFilter::new("lazycache=trace"))
        .with_target(false)
        .pretty()
        .with_test_writer()
        .try_init()
        .ok();
}

/// A record of all [`TestObject`]s that have been released.
#[derive(Clone, Debug, Default)]
pub struct Releases(Arc<Mutex<Vec<String>>>);

impl Releases {
    fn record(&self, id: &str) {
        self.0.lock().unwrap().push(id.to_owned());
    }

    /// The total number of release calls.
    pub fn count(&self) -> usize {
        self.0.lock().unwrap().len()
    }

    /// The number of release calls for objects with the given `id`.
    pub fn count_of(&self, id: &str) -> usize {
        self.0.lock().unwrap().iter().filter(|i| *i == id).count()
    }

    /// The ids of all released objects, sorted.
    pub fn ids(&self) -> Vec<String> {
        let mut ids = self.0.lock().unwrap().clone();
        ids.sort();
        ids
    }
}

/// A [`Cacheable`] with scripted freshness answers.
///
/// Unless scripted otherwise, the object is always fresh and releases successfully.
#[derive(Debug)]
pub struct TestObject {
    id: String,
    /// The number of times this key was loaded when this object was created, starting at 1.
    pub value: usize,
    checks: AtomicUsize,
    answers: Mutex<VecDeque<Result<Freshness, String>>>,
    fail_release: AtomicBool,
    releases: Releases,
}

impl TestObject {
    pub fn new(id: impl Into<String>, value: usize, releases: &Releases) -> Self {
        Self {
            id: id.into(),
            value,
            checks: AtomicUsize::new(0),
            answers: Mutex::new(VecDeque::new()),
            fail_release: AtomicBool::new(false),
            releases: releases.clone(),
        }
    }

    /// Queues the answer of an upcoming freshness check.
    ///
    /// Answers are returned in the order they were queued. Once all are used up, the object is
    /// fresh again.
    pub fn push_freshness(&self, freshness: Freshness) {
        self.answers.lock().unwrap().push_back(Ok(freshness));
    }

    /// Makes the next freshness check return `Outdated`.
    pub fn outdate(&self) {
        self.push_freshness(Freshness::Outdated);
    }

    /// Makes the next freshness check fail with the given message.
    pub fn fail_next_check(&self, message: &str) {
        self.answers
            .lock()
            .unwrap()
            .push_back(Err(message.to_owned()));
    }

    /// Makes every future release call fail.
    pub fn fail_release(&self) {
        self.fail_release.store(true, Ordering::Relaxed);
    }

    /// The number of freshness checks performed on this object.
    pub fn checks(&self) -> usize {
        self.checks.load(Ordering::Relaxed)
    }
}

impl Cacheable for TestObject {
    fn id(&self) -> &str {
        &self.id
    }

    fn check_freshness(&self) -> Result<Freshness, BoxError> {
        self.checks.fetch_add(1, Ordering::Relaxed);
        match self.answers.lock().unwrap().pop_front() {
            Some(Ok(freshness)) => Ok(freshness),
            Some(Err(message)) => Err(message.into()),
            None => Ok(Freshness::Fresh),
        }
    }

    fn release(&self) -> Result<(), BoxError> {
        self.releases.record(&self.id);
        if self.fail_release.load(Ordering::Relaxed) {
            return Err(format!("`{}` is still in use", self.id).into());
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
struct LoaderState {
    calls: AtomicUsize,
    calls_per_key: Mutex<HashMap<String, usize>>,
    delay: Mutex<Duration>,
    gate: Mutex<Option<Arc<Notify>>>,
    failing: Mutex<HashSet<String>>,
    panicking: Mutex<HashSet<String>>,
    failing_release: Mutex<HashSet<String>>,
    releases: Releases,
}

/// A [`Loader`] of [`TestObject`]s that counts its invocations.
///
/// Each object's [`value`](TestObject::value) is the number of times its key has been loaded.
#[derive(Clone, Debug, Default)]
pub struct CountingLoader(Arc<LoaderState>);

impl CountingLoader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every load take at least `delay`.
    pub fn with_delay(self, delay: Duration) -> Self {
        self.set_delay(delay);
        self
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.0.delay.lock().unwrap() = delay;
    }

    /// Makes every load wait for a permit of the returned [`Notify`] before it finishes.
    pub fn gate(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        *self.0.gate.lock().unwrap() = Some(Arc::clone(&gate));
        gate
    }

    /// Makes loads of `key` return an error until [`succeed`](Self::succeed) is called.
    pub fn fail(&self, key: &str) {
        self.0.failing.lock().unwrap().insert(key.to_owned());
    }

    pub fn succeed(&self, key: &str) {
        self.0.failing.lock().unwrap().remove(key);
    }

    /// Makes loads of `key` panic.
    pub fn panic_on(&self, key: &str) {
        self.0.panicking.lock().unwrap().insert(key.to_owned());
    }

    /// Makes objects loaded for `key` fail to release.
    pub fn fail_release_of(&self, key: &str) {
        self.0.failing_release.lock().unwrap().insert(key.to_owned());
    }

    /// The total number of load calls.
    pub fn calls(&self) -> usize {
        self.0.calls.load(Ordering::SeqCst)
    }

    /// The number of load calls for `key`.
    pub fn calls_for(&self, key: &str) -> usize {
        self.0
            .calls_per_key
            .lock()
            .unwrap()
            .get(key)
            .copied()
            .unwrap_or_default()
    }

    /// The releases of all objects produced by this loader.
    pub fn releases(&self) -> &Releases {
        &self.0.releases
    }
}

impl Loader<TestObject> for CountingLoader {
    fn load(&self, key: String) -> BoxFuture<'static, Result<TestObject, BoxError>> {
        let state = Arc::clone(&self.0);
        Box::pin(async move {
            state.calls.fetch_add(1, Ordering::SeqCst);
            let value = {
                let mut per_key = state.calls_per_key.lock().unwrap();
                let calls = per_key.entry(key.clone()).or_default();
                *calls += 1;
                *calls
            };

            let delay = *state.delay.lock().unwrap();
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }

            let gate = state.gate.lock().unwrap().clone();
            if let Some(gate) = gate {
                gate.notified().await;
            }

            if state.panicking.lock().unwrap().contains(&key) {
                panic!("loader exploded on `{key}`");
            }
            if state.failing.lock().unwrap().contains(&key) {
                return Err(format!("no object for `{key}`").into());
            }

            let object = TestObject::new(key, value, &state.releases);
            if state.failing_release.lock().unwrap().contains(object.id()) {
                object.fail_release();
            }
            Ok(object)
        })
    }
}
