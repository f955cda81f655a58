use std::future::Future;

use futures::future::BoxFuture;

/// A type-erased error returned by user supplied code.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// The outcome of a [`Cacheable::check_freshness`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Freshness {
    /// The cached object can be served.
    Fresh,
    /// A newer version exists, and the object has to be reloaded.
    Outdated,
}

/// An object that can be held by a [`Cache`](crate::Cache).
///
/// Objects are shared with callers as `Arc<Self>`. The cache calls [`release`](Self::release)
/// exactly once, when the object leaves the cache. Callers might still hold on to the object
/// after that.
pub trait Cacheable: Send + Sync + 'static {
    /// The identifier of this object, which is equal to the key it was loaded for.
    fn id(&self) -> &str;

    /// Checks whether a newer version of this object exists.
    ///
    /// This is called on every cache hit, from within the cache worker. It should be quick, as
    /// it holds up requests for all other keys while it runs.
    fn check_freshness(&self) -> Result<Freshness, BoxError>;

    /// Cleans up any resources held by this object.
    fn release(&self) -> Result<(), BoxError>;
}

/// Produces [`Cacheable`] objects for keys that are not cached yet.
///
/// Each load runs as a separate task, concurrently with the cache worker and other loads.
/// A slow load only holds up callers waiting for the same key.
///
/// This is implemented for all closures taking the key and returning a `Send` future.
pub trait Loader<T: Cacheable>: Send + Sync + 'static {
    /// Loads the object for the given `key`.
    fn load(&self, key: String) -> BoxFuture<'static, Result<T, BoxError>>;
}

impl<T, F, Fut> Loader<T> for F
where
    T: Cacheable,
    F: Fn(String) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T, BoxError>> + Send + 'static,
{
    fn load(&self, key: String) -> BoxFuture<'static, Result<T, BoxError>> {
        Box::pin(self(key))
    }
}
