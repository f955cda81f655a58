use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::cacheable::{Cacheable, Loader};
use crate::config::CacheConfig;
use crate::error::{CacheEntry, CacheError};
use crate::manager;
use crate::task::Task;

/// The number of buckets in a [`Cache`] by status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Keys with a load in flight.
    pub loading: usize,
    /// Keys with an object in memory.
    pub loaded: usize,
}

/// A handle to a running cache.
///
/// The cache state is owned by a background worker, see the [crate documentation](crate) for how
/// requests are processed. Dropping the handle shuts the worker down and releases all objects.
pub struct Cache<T: Cacheable> {
    id: String,
    config: CacheConfig,
    tasks: mpsc::Sender<Task<T>>,
    worker: JoinHandle<()>,
}

impl<T: Cacheable> Cache<T> {
    /// Creates a cache with the given configuration and loader on the current tokio runtime.
    pub fn new(config: CacheConfig, loader: impl Loader<T>) -> CacheEntry<Self> {
        Self::builder().config(config).loader(loader).build()
    }

    /// Starts building a new cache.
    pub fn builder() -> CacheBuilder<T> {
        CacheBuilder::default()
    }

    /// The identifier of this cache instance.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Returns the object for `key`, loading it if necessary.
    ///
    /// Concurrent requests for the same key share a single load and receive the same object.
    /// If the object is not available within `timeout`, this returns [`CacheError::Timeout`].
    /// A load that is still running at that point continues in the background.
    pub async fn load(&self, key: impl Into<String>, timeout: Duration) -> CacheEntry<Arc<T>> {
        let key = key.into();
        self.request(timeout, |waiter| Task::Lookup { key, waiter })
            .await?
    }

    /// Removes `key` from the cache, releasing its object.
    ///
    /// Discarding a key that is not cached is not an error. Callers waiting for a load of this
    /// key receive [`CacheError::DiscardedWhileLoading`], and the result of that load is released
    /// once it arrives.
    pub async fn discard(&self, key: impl Into<String>) -> CacheEntry<()> {
        let key = key.into();
        self.request(self.config.request_timeout, |done| Task::Discard { key, done })
            .await?
    }

    /// Removes all keys from the cache.
    ///
    /// Every object is released, even if releasing some of them fails. All failures are
    /// reported together as [`CacheError::ReleaseFailed`].
    pub async fn clear(&self) -> CacheEntry<()> {
        self.request(self.config.request_timeout, |done| Task::Clear { done })
            .await?
    }

    /// The number of keys in the cache, including keys that are still loading.
    pub async fn len(&self) -> CacheEntry<usize> {
        self.request(self.config.request_timeout, |done| Task::Len { done })
            .await
    }

    /// Whether the cache holds no keys at all.
    pub async fn is_empty(&self) -> CacheEntry<bool> {
        Ok(self.len().await? == 0)
    }

    /// Counts the keys in the cache by their status.
    pub async fn stats(&self) -> CacheEntry<CacheStats> {
        self.request(self.config.request_timeout, |done| Task::Stats { done })
            .await
    }

    /// Evicts all entries that have not been used within the TTL right away.
    ///
    /// This is the same sweep that runs every
    /// [`check_interval`](crate::config::CacheConfig::check_interval). Returns the number of
    /// evicted entries.
    pub async fn evict_expired(&self) -> CacheEntry<usize> {
        self.request(self.config.request_timeout, |done| Task::Sweep { done })
            .await?
    }

    /// Stops the background worker and releases all objects.
    ///
    /// What happens to loads in flight depends on the configured
    /// [`StopPolicy`](crate::config::StopPolicy). Afterwards, all operations fail with
    /// [`CacheError::Stopped`].
    pub async fn stop(&self) -> CacheEntry<()> {
        self.request(self.config.request_timeout, |done| Task::Stop { done })
            .await?
    }

    /// Whether the background worker has exited.
    pub fn is_stopped(&self) -> bool {
        self.worker.is_finished()
    }

    /// Sends a task to the worker and waits for its answer.
    async fn request<R>(
        &self,
        timeout: Duration,
        task: impl FnOnce(oneshot::Sender<R>) -> Task<T>,
    ) -> CacheEntry<R> {
        let (tx, rx) = oneshot::channel();
        let task = task(tx);

        let response = async {
            self.tasks
                .send(task)
                .await
                .map_err(|_| CacheError::Stopped)?;
            // The worker drops pending requests when it shuts down.
            rx.await.map_err(|_| CacheError::Stopped)
        };

        tokio::time::timeout(timeout, response)
            .await
            .map_err(|_| CacheError::Timeout(timeout))?
    }
}

impl<T: Cacheable> fmt::Debug for Cache<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cache")
            .field("id", &self.id)
            .field("config", &self.config)
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

/// Builds a [`Cache`].
pub struct CacheBuilder<T: Cacheable> {
    config: CacheConfig,
    loader: Option<Arc<dyn Loader<T>>>,
    runtime: Option<Handle>,
}

impl<T: Cacheable> Default for CacheBuilder<T> {
    fn default() -> Self {
        Self {
            config: CacheConfig::default(),
            loader: None,
            runtime: None,
        }
    }
}

impl<T: Cacheable> CacheBuilder<T> {
    /// Replaces the entire configuration.
    pub fn config(mut self, config: CacheConfig) -> Self {
        self.config = config;
        self
    }

    /// Sets the loader that produces objects for missing keys. This is required.
    pub fn loader(mut self, loader: impl Loader<T>) -> Self {
        let loader: Arc<dyn Loader<T>> = Arc::new(loader);
        self.loader = Some(loader);
        self
    }

    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.config.ttl = ttl;
        self
    }

    pub fn check_interval(mut self, check_interval: Duration) -> Self {
        self.config.check_interval = check_interval;
        self
    }

    pub fn instance_id(mut self, instance_id: impl Into<String>) -> Self {
        self.config.instance_id = Some(instance_id.into());
        self
    }

    /// Sets the runtime that runs the worker and all loads.
    ///
    /// Defaults to the runtime `build` is called from.
    pub fn runtime(mut self, runtime: Handle) -> Self {
        self.runtime = Some(runtime);
        self
    }

    /// Validates the configuration and starts the cache worker.
    pub fn build(self) -> CacheEntry<Cache<T>> {
        let loader = self
            .loader
            .ok_or(CacheError::Configuration("no loader configured"))?;
        if self.config.check_interval.is_zero() {
            return Err(CacheError::Configuration("check interval must not be zero"));
        }
        let runtime = match self.runtime {
            Some(runtime) => runtime,
            None => Handle::try_current()
                .map_err(|_| CacheError::Configuration("not running on a tokio runtime"))?,
        };

        let id = self
            .config
            .instance_id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        tracing::debug!(%id, name = %self.config.name, "Starting cache");
        let (tasks, worker) = manager::spawn(&id, self.config.clone(), loader, runtime);

        Ok(Cache {
            id,
            config: self.config,
            tasks,
            worker,
        })
    }
}
