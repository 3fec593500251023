//! Units of work and their identity.
//!
//! A [`CachedRequest`] wraps a [`Request`] body with the cache key and max-age it
//! should be served under.  Two requests with the same result type and cache key
//! share a [`RequestKey`] and are the same logical request.

use std::fmt;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use anyhow::bail;
use async_trait::async_trait;

use crate::freshness::CacheDuration;
use crate::persistence::{CacheValue, DataType};

/// The work behind a request: produce a result, usually from the network.
#[async_trait]
pub trait Request: Send + Sync + 'static {
    type Output: Send + Sync + 'static;

    async fn load_data(&self) -> anyhow::Result<Self::Output>;
}

#[async_trait]
trait ErasedRequest: Send + Sync {
    async fn run(&self) -> anyhow::Result<CacheValue>;
}

struct Erased<R>(R);

#[async_trait]
impl<R: Request> ErasedRequest for Erased<R> {
    async fn run(&self) -> anyhow::Result<CacheValue> {
        let output = self.0.load_data().await?;
        Ok(Arc::new(output))
    }
}

/// Body for requests that may only be answered from the cache or by a pending request.
struct NoLiveData<T>(PhantomData<fn() -> T>);

#[async_trait]
impl<T: Send + Sync + 'static> Request for NoLiveData<T> {
    type Output = T;

    async fn load_data(&self) -> anyhow::Result<T> {
        bail!("request has no live computation")
    }
}

static NEXT_UNIQUE: AtomicU64 = AtomicU64::new(1);

/// Request identity.  Requests without a cache key are never aggregated.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RequestKey {
    Cached {
        data_type: DataType,
        cache_key: String,
    },
    Unique(u64),
}

impl fmt::Display for RequestKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestKey::Cached {
                data_type,
                cache_key,
            } => write!(f, "{}#{}", data_type, cache_key),
            RequestKey::Unique(serial) => write!(f, "uncached#{}", serial),
        }
    }
}

pub(crate) type CancellationCallback = Box<dyn Fn(&CachedRequest) + Send + Sync>;

pub struct CachedRequest {
    key: RequestKey,
    data_type: DataType,
    cache_key: Option<String>,
    cache_duration: CacheDuration,
    body: Box<dyn ErasedRequest>,
    processable: bool,
    offline: bool,
    cancelled: AtomicBool,
    on_cancel: OnceLock<CancellationCallback>,
    cancel_fired: AtomicBool,
}

impl CachedRequest {
    pub fn new<R: Request>(
        request: R,
        cache_key: Option<String>,
        cache_duration: CacheDuration,
    ) -> CachedRequest {
        let data_type = DataType::of::<R::Output>();
        let key = match &cache_key {
            Some(cache_key) => RequestKey::Cached {
                data_type,
                cache_key: cache_key.clone(),
            },
            None => RequestKey::Unique(NEXT_UNIQUE.fetch_add(1, Ordering::Relaxed)),
        };

        CachedRequest {
            key,
            data_type,
            cache_key,
            cache_duration,
            body: Box::new(Erased(request)),
            processable: true,
            offline: false,
            cancelled: AtomicBool::new(false),
            on_cancel: OnceLock::new(),
            cancel_fired: AtomicBool::new(false),
        }
    }

    /// a request that is never cached and never aggregated
    pub fn uncached<R: Request>(request: R) -> CachedRequest {
        CachedRequest::new(request, None, CacheDuration::AlwaysExpired)
    }

    /// A request answered only from the cache; a miss fails with `NotInCache`.
    pub fn from_cache<T: Send + Sync + 'static>(
        cache_key: &str,
        cache_duration: CacheDuration,
    ) -> CachedRequest {
        CachedRequest::new(
            NoLiveData::<T>(PhantomData),
            Some(cache_key.to_string()),
            cache_duration,
        )
        .with_offline(true)
    }

    /// A request that only attaches to a pending request with the same identity.
    pub fn pending_only<T: Send + Sync + 'static>(cache_key: &str) -> CachedRequest {
        CachedRequest::new(
            NoLiveData::<T>(PhantomData),
            Some(cache_key.to_string()),
            CacheDuration::AlwaysExpired,
        )
        .with_processable(false)
    }

    pub fn with_processable(mut self, processable: bool) -> CachedRequest {
        self.processable = processable;
        self
    }

    pub fn with_offline(mut self, offline: bool) -> CachedRequest {
        self.offline = offline;
        self
    }

    pub fn key(&self) -> &RequestKey {
        &self.key
    }

    pub fn data_type(&self) -> &DataType {
        &self.data_type
    }

    pub fn cache_key(&self) -> Option<&str> {
        self.cache_key.as_deref()
    }

    pub fn cache_duration(&self) -> CacheDuration {
        self.cache_duration
    }

    pub fn is_processable(&self) -> bool {
        self.processable
    }

    pub fn is_offline(&self) -> bool {
        self.offline
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Mark the request cancelled and fire the cancellation callback if one is installed.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        self.fire_cancellation();
    }

    /// Install the callback run on cancellation; false if one was already installed.
    pub(crate) fn set_cancellation_callback(&self, callback: CancellationCallback) -> bool {
        self.on_cancel.set(callback).is_ok()
    }

    /// Run the cancellation callback at most once; false if none is installed or it already ran.
    pub(crate) fn fire_cancellation(&self) -> bool {
        match self.on_cancel.get() {
            Some(callback) => {
                if self.cancel_fired.swap(true, Ordering::SeqCst) {
                    return false;
                }
                callback(self);
                true
            }
            None => false,
        }
    }

    pub(crate) async fn run(&self) -> anyhow::Result<CacheValue> {
        self.body.run().await
    }
}

impl PartialEq for CachedRequest {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key
    }
}

impl Eq for CachedRequest {}

impl fmt::Debug for CachedRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CachedRequest")
            .field("key", &self.key)
            .field("cache_duration", &self.cache_duration)
            .field("processable", &self.processable)
            .field("offline", &self.offline)
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

impl fmt::Display for CachedRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CachedRequest[{}]", self.key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct Echo(&'static str);

    #[async_trait]
    impl Request for Echo {
        type Output = String;

        async fn load_data(&self) -> anyhow::Result<String> {
            Ok(self.0.to_string())
        }
    }

    struct Number;

    #[async_trait]
    impl Request for Number {
        type Output = u64;

        async fn load_data(&self) -> anyhow::Result<u64> {
            Ok(7)
        }
    }

    #[test]
    fn identity() {
        let a = CachedRequest::new(Echo("a"), Some("k".to_string()), CacheDuration::ONE_MINUTE);
        let b = CachedRequest::new(Echo("b"), Some("k".to_string()), CacheDuration::ONE_HOUR);
        let c = CachedRequest::new(Number, Some("k".to_string()), CacheDuration::ONE_MINUTE);
        let d = CachedRequest::new(Echo("a"), Some("other".to_string()), CacheDuration::ONE_MINUTE);

        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_ne!(a, d);
        assert_eq!(a.key().to_string(), b.key().to_string());
    }

    #[test]
    fn uncached_requests_are_distinct() {
        let a = CachedRequest::uncached(Echo("a"));
        let b = CachedRequest::uncached(Echo("a"));
        assert_ne!(a, b);
        assert!(a.cache_key().is_none());
        assert!(!a.cache_duration().reads_cache());
    }

    #[test]
    fn cancellation_callback_is_one_shot() {
        let request = CachedRequest::new(Echo("a"), Some("k".to_string()), CacheDuration::ONE_MINUTE);
        let calls = Arc::new(AtomicUsize::new(0));

        assert!(!request.fire_cancellation());

        let counter = calls.clone();
        assert!(request.set_cancellation_callback(Box::new(move |cancelled: &CachedRequest| {
            assert!(cancelled.is_cancelled());
            counter.fetch_add(1, Ordering::SeqCst);
        })));
        assert!(!request.set_cancellation_callback(Box::new(|_: &CachedRequest| {})));

        request.cancel();
        request.cancel();
        assert!(!request.fire_cancellation());
        assert!(request.is_cancelled());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn run_erases_output() {
        async_std::task::block_on(async move {
            let request = CachedRequest::uncached(Number);
            let value = request.run().await.unwrap();
            assert_eq!(value.downcast_ref::<u64>(), Some(&7));
            assert_eq!(*request.data_type(), DataType::of::<u64>());
        });
    }

    #[test]
    fn cache_only_flavours() {
        let offline = CachedRequest::from_cache::<String>("k", CacheDuration::ONE_DAY);
        assert!(offline.is_offline());
        assert!(offline.is_processable());

        let pending = CachedRequest::pending_only::<String>("k");
        assert!(!pending.is_processable());
        assert_eq!(offline, pending);

        async_std::task::block_on(async move {
            assert!(pending.run().await.is_err());
        });
    }
}
