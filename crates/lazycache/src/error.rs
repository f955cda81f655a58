use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use crate::cacheable::BoxError;

/// An error produced by user code, shared between all waiters of a single load.
pub type SharedError = Arc<dyn std::error::Error + Send + Sync + 'static>;

/// An error returned by any of the [`Cache`](crate::Cache) operations.
///
/// This is cheaply cloneable, since a single load failure is reported to every caller that was
/// waiting for it.
#[derive(Debug, Clone, Error)]
pub enum CacheError {
    /// The cache could not be constructed.
    #[error("invalid cache configuration: {0}")]
    Configuration(&'static str),
    /// The cache did not answer within the given time.
    ///
    /// For [`load`](crate::Cache::load), the load itself keeps running and will still populate
    /// the cache once it is done.
    #[error("request timed out after {0:?}")]
    Timeout(Duration),
    /// The [`Loader`](crate::Loader) returned an error.
    #[error("failed to load `{key}`: {source}")]
    LoadFailed {
        /// The key that was requested.
        key: String,
        /// The error returned by the loader.
        #[source]
        source: SharedError,
    },
    /// The freshness check of a cached object returned an error.
    ///
    /// The object was removed from the cache.
    #[error("freshness check of `{key}` failed: {source}")]
    CheckFailed {
        /// The key that was requested.
        key: String,
        /// The error returned by [`Cacheable::check_freshness`](crate::Cacheable::check_freshness).
        #[source]
        source: SharedError,
    },
    /// The key was discarded or cleared while its load was still in flight.
    #[error("`{0}` was discarded while loading")]
    DiscardedWhileLoading(String),
    /// Releasing one or more objects failed.
    ///
    /// The objects were removed from the cache regardless.
    #[error(transparent)]
    ReleaseFailed(#[from] ReleaseErrors),
    /// The background worker is no longer running.
    #[error("the cache has been stopped")]
    Stopped,
}

impl CacheError {
    pub(crate) fn load_failed(key: &str, error: BoxError) -> Self {
        Self::LoadFailed {
            key: key.to_owned(),
            source: Arc::from(error),
        }
    }

    pub(crate) fn check_failed(key: &str, error: BoxError) -> Self {
        Self::CheckFailed {
            key: key.to_owned(),
            source: Arc::from(error),
        }
    }
}

/// The result of a cache operation, containing either `Ok(T)` or the reason for failure.
pub type CacheEntry<T = ()> = Result<T, CacheError>;

/// A failure to release a single object.
#[derive(Debug, Clone, Error)]
#[error("failed to release `{key}`: {source}")]
pub struct ReleaseError {
    /// The key of the released object.
    pub key: String,
    /// The error returned by [`Cacheable::release`](crate::Cacheable::release).
    #[source]
    pub source: SharedError,
}

impl ReleaseError {
    pub(crate) fn new(key: &str, error: BoxError) -> Self {
        Self {
            key: key.to_owned(),
            source: Arc::from(error),
        }
    }
}

/// All release failures of an operation that removes multiple objects at once.
///
/// Operations like [`clear`](crate::Cache::clear) keep going after a release fails, and report
/// every failure together.
#[derive(Debug, Clone, Default)]
pub struct ReleaseErrors(Vec<ReleaseError>);

impl ReleaseErrors {
    pub(crate) fn push(&mut self, error: ReleaseError) {
        self.0.push(error);
    }

    /// Returns `true` if no release failed.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// The number of failed releases.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Iterates over the individual failures.
    pub fn iter(&self) -> impl Iterator<Item = &ReleaseError> {
        self.0.iter()
    }

    /// Turns the collected errors into `Ok` if there were none.
    pub(crate) fn into_result(self) -> CacheEntry<()> {
        if self.is_empty() {
            Ok(())
        } else {
            Err(CacheError::ReleaseFailed(self))
        }
    }
}

impl From<ReleaseError> for ReleaseErrors {
    fn from(error: ReleaseError) -> Self {
        Self(vec![error])
    }
}

impl fmt::Display for ReleaseErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0.as_slice() {
            [single] => write!(f, "{single}"),
            errors => {
                write!(f, "failed to release {} objects", errors.len())?;
                for error in errors {
                    write!(f, "; `{}`: {}", error.key, error.source)?;
                }
                Ok(())
            }
        }
    }
}

impl std::error::Error for ReleaseErrors {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.0
            .first()
            .map(|error| error as &(dyn std::error::Error + 'static))
    }
}
