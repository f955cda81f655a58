//! # A lazily-loading, single-flight, TTL-bounded object cache
//!
//! [`Cache`] maps string keys to heavyweight objects that are expensive to produce, such as
//! parsed files or remote resources. Objects are produced on demand by a user supplied
//! [`Loader`] and must implement [`Cacheable`].
//!
//! ## Architecture
//!
//! All cache state lives inside a single background worker (the "actor") that runs on the tokio
//! runtime. The [`Cache`] handle never touches that state directly. Every operation is turned
//! into a task that is sent to the worker's inbox, and the worker answers through a private
//! one-shot channel. The worker processes one task at a time, so no locks are involved.
//!
//! Each key is tracked by a bucket, which is either `Loading` or `Loaded`:
//!
//! - A lookup of an unknown key creates a `Loading` bucket and spawns the loader on its own task.
//! - Lookups of a key that is still `Loading` are queued as waiters on the same bucket. There is
//!   at most one load in flight per key.
//! - Once the load finishes, its result is reported back to the worker through the inbox, and is
//!   fanned out to every queued waiter. Failures are never cached, the bucket is removed and the
//!   next lookup starts over.
//! - A lookup of a `Loaded` key first runs the object's freshness check. Outdated objects are
//!   released and reloaded, and the requester waits for the reload. A failing check drops the
//!   entry and reports the error.
//! - A periodic sweep evicts `Loaded` buckets that have not been used for longer than the TTL.
//!   `Loading` buckets are never evicted.
//!
//! Every object that leaves the cache, whether by eviction, discard, clear, reload, or shutdown,
//! has its [`Cacheable::release`] called exactly once.
//!
//! ### Metrics
//!
//! All metrics are tagged with a `cache` field corresponding to
//! [`CacheConfig::name`](config::CacheConfig::name):
//!
//! - `caches.access`: All lookups.
//! - `caches.memory.hit`: Lookups served from a loaded entry.
//! - `caches.memory.miss`: Lookups that created a new bucket.
//! - `caches.coalesced`: Lookups that joined a load already in flight.
//! - `caches.computation`: Loader invocations.
//! - `caches.computation.failed`: Loader invocations that returned an error.
//! - `caches.outdated` / `caches.check_failed`: Results of freshness checks.
//! - `caches.evicted`: Entries removed by the TTL sweep.
//! - `caches.release_failed`: Objects whose release returned an error.
//! - `caches.entries`: A gauge of the number of buckets, reported after every sweep.
//! - `caches.load.duration`: A timer around each loader invocation.

#[macro_use]
pub mod metrics;

mod bucket;
mod cache;
mod cacheable;
pub mod config;
mod error;
pub mod logging;
mod manager;
mod task;

pub use bucket::BucketStatus;
pub use cache::{Cache, CacheBuilder, CacheStats};
pub use cacheable::{BoxError, Cacheable, Freshness, Loader};
pub use error::{CacheEntry, CacheError, ReleaseError, ReleaseErrors, SharedError};
