use std::fmt;
use std::sync::Arc;

use tokio::sync::oneshot;

use crate::cache::CacheStats;
use crate::cacheable::BoxError;
use crate::error::CacheEntry;

/// A single-use response slot for one requester of an object.
///
/// Sending on a oneshot channel never blocks, so a requester that gave up waiting never holds up
/// the worker.
pub(crate) type Waiter<T> = oneshot::Sender<CacheEntry<Arc<T>>>;

/// A unit of work for the cache worker.
pub(crate) enum Task<T> {
    /// Look up `key`, loading it if necessary.
    Lookup { key: String, waiter: Waiter<T> },
    /// A load finished successfully.
    Loaded {
        key: String,
        generation: u64,
        object: T,
    },
    /// A load returned an error.
    LoadFailed {
        key: String,
        generation: u64,
        error: BoxError,
    },
    /// Remove `key` from the cache.
    Discard {
        key: String,
        done: oneshot::Sender<CacheEntry<()>>,
    },
    /// Remove all keys from the cache.
    Clear {
        done: oneshot::Sender<CacheEntry<()>>,
    },
    /// Count all buckets, including in-flight loads.
    Len { done: oneshot::Sender<usize> },
    /// Count buckets by status.
    Stats { done: oneshot::Sender<CacheStats> },
    /// Evict expired entries right away.
    Sweep {
        done: oneshot::Sender<CacheEntry<usize>>,
    },
    /// Shut the worker down.
    Stop {
        done: oneshot::Sender<CacheEntry<()>>,
    },
}

impl<T> fmt::Debug for Task<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Lookup { key, .. } => f.debug_struct("Lookup").field("key", key).finish(),
            Self::Loaded {
                key, generation, ..
            } => f
                .debug_struct("Loaded")
                .field("key", key)
                .field("generation", generation)
                .finish(),
            Self::LoadFailed {
                key,
                generation,
                error,
            } => f
                .debug_struct("LoadFailed")
                .field("key", key)
                .field("generation", generation)
                .field("error", error)
                .finish(),
            Self::Discard { key, .. } => f.debug_struct("Discard").field("key", key).finish(),
            Self::Clear { .. } => f.write_str("Clear"),
            Self::Len { .. } => f.write_str("Len"),
            Self::Stats { .. } => f.write_str("Stats"),
            Self::Sweep { .. } => f.write_str("Sweep"),
            Self::Stop { .. } => f.write_str("Stop"),
        }
    }
}
