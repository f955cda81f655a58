use std::collections::HashMap;
use std::ops::ControlFlow;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{self, Instant};
use tracing::Instrument;

use crate::bucket::{Bucket, BucketStatus};
use crate::cache::CacheStats;
use crate::cacheable::{Cacheable, Freshness, Loader};
use crate::config::{CacheConfig, StopPolicy};
use crate::error::{CacheEntry, CacheError, ReleaseError, ReleaseErrors};
use crate::task::{Task, Waiter};

/// Releases an object that is leaving the cache.
fn release<T: Cacheable>(name: &str, key: &str, object: &T) -> Result<(), ReleaseError> {
    object.release().map_err(|err| {
        metric!(counter("caches.release_failed") += 1, "cache" => name);
        let err = ReleaseError::new(key, err);
        let stderr: &dyn std::error::Error = &err;
        tracing::error!(stderr, "Failed to release cached object");
        err
    })
}

/// Completes at `deadline`, or never if there is none.
async fn sweep_at(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => time::sleep_until(deadline).await,
        None => futures::future::pending().await,
    }
}

/// The cache worker, which exclusively owns all buckets.
///
/// It is driven by [`run`](Self::run), and only ever reacts to [`Task`]s from its inbox and to
/// its own sweep timer.
pub(crate) struct CacheManager<T: Cacheable> {
    config: CacheConfig,
    loader: Arc<dyn Loader<T>>,
    runtime: Handle,

    buckets: HashMap<String, Bucket<T>>,
    next_generation: u64,

    /// Used by loads to report back, without keeping the worker alive on their own.
    reports: mpsc::WeakSender<Task<T>>,

    /// Requesters of [`Task::Stop`] waiting for the drain to complete.
    stopping: Option<Vec<oneshot::Sender<CacheEntry<()>>>>,
}

impl<T: Cacheable> CacheManager<T> {
    pub fn new(
        config: CacheConfig,
        loader: Arc<dyn Loader<T>>,
        runtime: Handle,
        reports: mpsc::WeakSender<Task<T>>,
    ) -> Self {
        Self {
            config,
            loader,
            runtime,
            buckets: HashMap::new(),
            next_generation: 0,
            reports,
            stopping: None,
        }
    }

    /// Processes tasks until the cache is stopped or every [`Cache`](crate::Cache) handle is gone.
    pub async fn run(mut self, mut inbox: mpsc::Receiver<Task<T>>) {
        tracing::info!("Cache worker started");

        let mut next_sweep = self.next_sweep();

        loop {
            let flow = tokio::select! {
                task = inbox.recv() => match task {
                    Some(task) => self.handle(task),
                    None => {
                        tracing::debug!("All cache handles dropped");
                        if let Err(err) = self.shut_down(CacheError::Stopped) {
                            let stderr: &dyn std::error::Error = &err;
                            tracing::error!(stderr, "Failed to release objects on shutdown");
                        }
                        ControlFlow::Break(())
                    }
                },
                () = sweep_at(next_sweep) => {
                    self.periodic_sweep();
                    next_sweep = self.next_sweep();
                    ControlFlow::Continue(())
                }
            };

            if flow.is_break() || self.try_finish_drain() {
                break;
            }
        }

        // Loads may have reported back between the last task and the exit.
        inbox.close();
        while let Some(task) = inbox.recv().await {
            if let Task::Loaded { key, object, .. } = task {
                tracing::debug!(%key, "Releasing load result after shutdown");
                release(&self.config.name, &key, &object).ok();
            }
        }

        tracing::info!("Cache worker terminated");
    }

    /// The time of the next periodic sweep, or `None` if it lies beyond what `Instant` can hold.
    fn next_sweep(&self) -> Option<Instant> {
        Instant::now().checked_add(self.config.check_interval)
    }

    fn handle(&mut self, task: Task<T>) -> ControlFlow<()> {
        tracing::trace!(?task, "Processing cache task");
        match task {
            Task::Lookup { key, waiter } => self.lookup(key, waiter),
            Task::Loaded {
                key,
                generation,
                object,
            } => self.on_loaded(key, generation, object),
            Task::LoadFailed {
                key,
                generation,
                error,
            } => {
                self.on_load_failed(&key, generation, CacheError::load_failed(&key, error));
            }
            Task::Discard { key, done } => {
                done.send(self.discard(&key)).ok();
            }
            Task::Clear { done } => {
                done.send(self.clear()).ok();
            }
            Task::Len { done } => {
                done.send(self.buckets.len()).ok();
            }
            Task::Stats { done } => {
                done.send(self.stats()).ok();
            }
            Task::Sweep { done } => {
                let (evicted, errors) = self.evict_expired(Instant::now());
                done.send(errors.into_result().map(|_| evicted)).ok();
            }
            Task::Stop { done } => return self.stop(done),
        }
        ControlFlow::Continue(())
    }

    fn lookup(&mut self, key: String, waiter: Waiter<T>) {
        let name = self.config.name.as_str();
        metric!(counter("caches.access") += 1, "cache" => name);

        if self.stopping.is_some() {
            waiter.send(Err(CacheError::Stopped)).ok();
            return;
        }

        let now = Instant::now();
        let Some(bucket) = self.buckets.get_mut(&key) else {
            metric!(counter("caches.memory.miss") += 1, "cache" => name);
            tracing::trace!(%key, "Cache miss");
            return self.start_load(key, waiter, now);
        };

        let Some(object) = bucket.object() else {
            // A load is already in flight, queue up behind it.
            metric!(counter("caches.coalesced") += 1, "cache" => name);
            tracing::trace!(%key, "Joining load in flight");
            return bucket.add_waiter(waiter);
        };

        if bucket.is_expired(now, self.config.ttl) {
            // The sweep did not get to this entry yet.
            tracing::debug!(%key, "Reloading expired entry");
            return self.reload(key, waiter, now);
        }

        match object.check_freshness() {
            Ok(Freshness::Fresh) => {
                metric!(counter("caches.memory.hit") += 1, "cache" => name);
                tracing::trace!(%key, "Cache hit");
                let object = Arc::clone(object);
                bucket.touch(now);
                waiter.send(Ok(object)).ok();
            }
            Ok(Freshness::Outdated) => {
                metric!(counter("caches.outdated") += 1, "cache" => name);
                tracing::debug!(%key, "Reloading outdated entry");
                self.reload(key, waiter, now);
            }
            Err(err) => {
                metric!(counter("caches.check_failed") += 1, "cache" => name);
                let err = CacheError::check_failed(&key, err);
                let stderr: &dyn std::error::Error = &err;
                tracing::warn!(stderr, "Dropping cached object");
                if let Some(object) = self.buckets.remove(&key).and_then(Bucket::into_object) {
                    release(name, &key, &*object).ok();
                }
                waiter.send(Err(err)).ok();
            }
        }
    }

    fn next_generation(&mut self) -> u64 {
        self.next_generation += 1;
        self.next_generation
    }

    /// Creates a new `Loading` bucket for `key` and starts loading it.
    fn start_load(&mut self, key: String, waiter: Waiter<T>, now: Instant) {
        let generation = self.next_generation();
        self.buckets
            .insert(key.clone(), Bucket::loading(generation, waiter, now));
        self.spawn_load(key);
    }

    /// Switches the loaded bucket of `key` back to loading, releasing its current object.
    fn reload(&mut self, key: String, waiter: Waiter<T>, now: Instant) {
        let generation = self.next_generation();
        let Some(bucket) = self.buckets.get_mut(&key) else {
            return self.start_load(key, waiter, now);
        };
        if let Some(object) = bucket.reload(generation, waiter, now) {
            release(&self.config.name, &key, &*object).ok();
        }
        self.spawn_load(key);
    }

    /// Spawns the loader for the `Loading` bucket of `key`.
    ///
    /// The load runs on its own task, and reports its result back through the inbox.
    fn spawn_load(&self, key: String) {
        let Some(generation) = self.buckets.get(&key).and_then(Bucket::generation) else {
            return;
        };
        let name = self.config.name.clone();
        let loader = Arc::clone(&self.loader);
        let reports = self.reports.clone();
        let span = tracing::debug_span!("load", %key, generation);

        metric!(counter("caches.computation") += 1, "cache" => &name);
        tracing::debug!(%key, generation, "Starting load");

        let load = async move {
            let start = Instant::now();
            let result = AssertUnwindSafe(async { loader.load(key.clone()).await })
                .catch_unwind()
                .await
                .unwrap_or_else(|_| {
                    tracing::error!("Loader panicked");
                    Err("loader panicked".into())
                });
            metric!(timer("caches.load.duration") = start.elapsed(), "cache" => &name);

            let task = match result {
                Ok(object) => {
                    if object.id() != key {
                        tracing::warn!(
                            id = object.id(),
                            "Loaded object identifier does not match its key"
                        );
                    }
                    Task::Loaded {
                        key,
                        generation,
                        object,
                    }
                }
                Err(error) => {
                    metric!(counter("caches.computation.failed") += 1, "cache" => &name);
                    Task::LoadFailed {
                        key,
                        generation,
                        error,
                    }
                }
            };

            let sent = match reports.upgrade() {
                Some(reports) => reports.send(task).await.map_err(|err| err.0),
                None => Err(task),
            };
            if let Err(Task::Loaded { key, object, .. }) = sent {
                tracing::debug!("Cache is gone, releasing loaded object");
                release(&name, &key, &object).ok();
            }
        };

        self.runtime.spawn(load.instrument(span));
    }

    fn on_loaded(&mut self, key: String, generation: u64, object: T) {
        match self.buckets.get_mut(&key) {
            Some(bucket) if bucket.generation() == Some(generation) => {
                tracing::debug!(%key, generation, "Load finished");
                bucket.complete(Arc::new(object), Instant::now());
            }
            _ => {
                // The bucket was discarded or replaced by a newer load in the meantime.
                tracing::debug!(%key, generation, "Releasing result of stale load");
                release(&self.config.name, &key, &object).ok();
            }
        }
    }

    fn on_load_failed(&mut self, key: &str, generation: u64, error: CacheError) {
        let is_current = self
            .buckets
            .get(key)
            .is_some_and(|bucket| bucket.generation() == Some(generation));

        let stderr: &dyn std::error::Error = &error;
        if !is_current {
            tracing::warn!(stderr, generation, "Stale load failed");
            return;
        }

        tracing::debug!(stderr, generation, "Load failed");
        if let Some(mut bucket) = self.buckets.remove(key) {
            bucket.fail(error);
        }
    }

    /// Removes a single bucket, releasing its object or failing its waiters.
    fn remove(&mut self, key: &str, waiter_error: CacheError) -> Result<(), ReleaseError> {
        let Some(mut bucket) = self.buckets.remove(key) else {
            return Ok(());
        };
        bucket.fail(waiter_error);
        match bucket.into_object() {
            Some(object) => release(&self.config.name, key, &*object),
            None => Ok(()),
        }
    }

    fn discard(&mut self, key: &str) -> CacheEntry<()> {
        tracing::debug!(key, "Discarding entry");
        self.remove(key, CacheError::DiscardedWhileLoading(key.to_owned()))
            .map_err(|err| ReleaseErrors::from(err).into())
    }

    /// Removes all buckets, failing every waiter with the error produced by `waiter_error`.
    fn remove_all(&mut self, waiter_error: impl Fn(&str) -> CacheError) -> ReleaseErrors {
        let mut errors = ReleaseErrors::default();
        let keys: Vec<_> = self.buckets.keys().cloned().collect();
        for key in keys {
            if let Err(err) = self.remove(&key, waiter_error(&key)) {
                errors.push(err);
            }
        }
        errors
    }

    fn clear(&mut self) -> CacheEntry<()> {
        tracing::debug!(entries = self.buckets.len(), "Clearing cache");
        self.remove_all(|key| CacheError::DiscardedWhileLoading(key.to_owned()))
            .into_result()
    }

    fn stats(&self) -> CacheStats {
        let mut stats = CacheStats::default();
        for bucket in self.buckets.values() {
            match bucket.status() {
                BucketStatus::Loading => stats.loading += 1,
                BucketStatus::Loaded => stats.loaded += 1,
            }
        }
        stats
    }

    /// Evicts all loaded entries that were not used within the TTL.
    fn evict_expired(&mut self, now: Instant) -> (usize, ReleaseErrors) {
        let ttl = self.config.ttl;
        let expired: Vec<_> = self
            .buckets
            .iter()
            .filter(|(_, bucket)| bucket.is_expired(now, ttl))
            .map(|(key, bucket)| (key.clone(), bucket.loaded_at()))
            .collect();

        let mut errors = ReleaseErrors::default();
        for (key, loaded_at) in &expired {
            let age = loaded_at.map(|loaded_at| now.saturating_duration_since(loaded_at));
            tracing::debug!(%key, ?age, "Evicting unused entry");
            // Expired buckets are loaded, so there are no waiters to notify.
            if let Err(err) = self.remove(key, CacheError::Stopped) {
                errors.push(err);
            }
        }

        let name = self.config.name.as_str();
        metric!(counter("caches.evicted") += expired.len() as i64, "cache" => name);
        metric!(gauge("caches.entries") = self.buckets.len() as u64, "cache" => name);

        (expired.len(), errors)
    }

    fn periodic_sweep(&mut self) {
        let (evicted, errors) = self.evict_expired(Instant::now());
        if evicted > 0 {
            tracing::debug!(
                evicted,
                failed = errors.len(),
                remaining = self.buckets.len(),
                "Swept expired entries"
            );
        }
        // Individual failures were already logged during release.
    }

    fn stop(&mut self, done: oneshot::Sender<CacheEntry<()>>) -> ControlFlow<()> {
        match self.config.stop_policy {
            StopPolicy::Drain => {
                tracing::info!("Draining cache");
                self.stopping.get_or_insert_with(Vec::new).push(done);
                ControlFlow::Continue(())
            }
            StopPolicy::Abort => {
                tracing::info!("Aborting cache");
                let result = self.shut_down(CacheError::Stopped);
                for done in self.stopping.take().into_iter().flatten() {
                    done.send(result.clone()).ok();
                }
                done.send(result).ok();
                ControlFlow::Break(())
            }
        }
    }

    /// Finishes a requested drain once no loads are in flight anymore.
    ///
    /// Returns `true` if the worker should exit.
    fn try_finish_drain(&mut self) -> bool {
        if self.stopping.is_none()
            || self
                .buckets
                .values()
                .any(|bucket| bucket.status() == BucketStatus::Loading)
        {
            return false;
        }

        let result = self.shut_down(CacheError::Stopped);
        for done in self.stopping.take().into_iter().flatten() {
            done.send(result.clone()).ok();
        }
        true
    }

    /// Empties the cache before the worker exits.
    fn shut_down(&mut self, waiter_error: CacheError) -> CacheEntry<()> {
        tracing::debug!(entries = self.buckets.len(), "Releasing all entries");
        self.remove_all(|_| waiter_error.clone()).into_result()
    }
}

/// Spawns a new cache worker, returning the sending half of its inbox.
pub(crate) fn spawn<T: Cacheable>(
    id: &str,
    config: CacheConfig,
    loader: Arc<dyn Loader<T>>,
    runtime: Handle,
) -> (mpsc::Sender<Task<T>>, tokio::task::JoinHandle<()>) {
    let (tx, rx) = mpsc::channel(config.queue_size.max(1));
    let manager = CacheManager::new(config, loader, runtime.clone(), tx.downgrade());
    let span = tracing::info_span!("cache", id);
    let worker = runtime.spawn(manager.run(rx).instrument(span));
    (tx, worker)
}
