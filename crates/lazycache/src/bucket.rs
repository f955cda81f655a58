use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

use crate::error::CacheError;
use crate::task::Waiter;

/// The load status of a single cache key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BucketStatus {
    /// A load is in flight, and requesters are queued until it finishes.
    Loading,
    /// The object is loaded and served from memory.
    Loaded,
}

#[derive(Debug)]
enum BucketState<T> {
    Loading {
        /// Identifies the load this bucket is waiting for.
        generation: u64,
    },
    Loaded {
        object: Arc<T>,
        loaded_at: Instant,
    },
}

/// Tracks the lifecycle of the object cached for one key.
///
/// Buckets are owned by the cache worker and never shared. Waiters only exist while the bucket
/// is `Loading`; completing or failing the load drains them.
#[derive(Debug)]
pub(crate) struct Bucket<T> {
    state: BucketState<T>,
    last_used: Instant,
    waiters: Vec<Waiter<T>>,
}

impl<T> Bucket<T> {
    /// Creates a new bucket waiting for the load with the given `generation`.
    pub fn loading(generation: u64, waiter: Waiter<T>, now: Instant) -> Self {
        Self {
            state: BucketState::Loading { generation },
            last_used: now,
            waiters: vec![waiter],
        }
    }

    pub fn status(&self) -> BucketStatus {
        match self.state {
            BucketState::Loading { .. } => BucketStatus::Loading,
            BucketState::Loaded { .. } => BucketStatus::Loaded,
        }
    }

    /// The generation of the pending load, or `None` if the bucket is loaded.
    pub fn generation(&self) -> Option<u64> {
        match self.state {
            BucketState::Loading { generation } => Some(generation),
            BucketState::Loaded { .. } => None,
        }
    }

    pub fn object(&self) -> Option<&Arc<T>> {
        match &self.state {
            BucketState::Loaded { object, .. } => Some(object),
            BucketState::Loading { .. } => None,
        }
    }

    pub fn loaded_at(&self) -> Option<Instant> {
        match self.state {
            BucketState::Loaded { loaded_at, .. } => Some(loaded_at),
            BucketState::Loading { .. } => None,
        }
    }

    pub fn add_waiter(&mut self, waiter: Waiter<T>) {
        debug_assert_eq!(self.status(), BucketStatus::Loading);
        self.waiters.push(waiter);
    }

    pub fn touch(&mut self, now: Instant) {
        self.last_used = now;
    }

    /// Whether this bucket is loaded and was not used within the last `ttl`.
    ///
    /// A `ttl` too large to be represented as an `Instant` never expires.
    pub fn is_expired(&self, now: Instant, ttl: Duration) -> bool {
        self.status() == BucketStatus::Loaded
            && self
                .last_used
                .checked_add(ttl)
                .is_some_and(|deadline| deadline <= now)
    }

    /// Switches a loaded bucket back to `Loading` for a reload with the given `generation`.
    ///
    /// Returns the previously loaded object, which the caller is responsible for releasing.
    pub fn reload(&mut self, generation: u64, waiter: Waiter<T>, now: Instant) -> Option<Arc<T>> {
        let previous = std::mem::replace(&mut self.state, BucketState::Loading { generation });
        self.last_used = now;
        self.waiters = vec![waiter];
        match previous {
            BucketState::Loaded { object, .. } => Some(object),
            BucketState::Loading { .. } => None,
        }
    }

    /// Installs the freshly loaded `object`, and hands it to every waiter.
    pub fn complete(&mut self, object: Arc<T>, now: Instant) {
        for waiter in self.waiters.drain(..) {
            // The requester might have timed out already, which is fine.
            let _ = waiter.send(Ok(Arc::clone(&object)));
        }
        self.state = BucketState::Loaded {
            object,
            loaded_at: now,
        };
        self.last_used = now;
    }

    /// Notifies every waiter about a failure.
    pub fn fail(&mut self, error: CacheError) {
        for waiter in self.waiters.drain(..) {
            let _ = waiter.send(Err(error.clone()));
        }
    }

    /// Consumes the bucket, returning the loaded object if there is one.
    ///
    /// Any remaining waiters are dropped, which they observe as the cache being stopped.
    pub fn into_object(self) -> Option<Arc<T>> {
        match self.state {
            BucketState::Loaded { object, .. } => Some(object),
            BucketState::Loading { .. } => None,
        }
    }
}
