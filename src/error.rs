//! error taxonomy for cache resolution and request execution
//!
//! Backends and request bodies report `anyhow::Error`; the cache manager and
//! the runner wrap those into the variants below so callers can tell a setup
//! mistake from a transient backend failure.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("type {type_name} is not handled by any registered persister or factory")]
    NotHandled { type_name: &'static str },

    #[error("persister factory failed to create a persister for {type_name}: {source}")]
    PersisterCreation {
        type_name: &'static str,
        #[source]
        source: anyhow::Error,
    },

    #[error("cache load failed for key {key}: {source}")]
    CacheLoad {
        key: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("cache save failed for key {key}: {source}")]
    CacheSave {
        key: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("request failed: {0}")]
    Request(#[source] anyhow::Error),

    #[error("request cancelled")]
    Cancelled,

    #[error("no cached data for key {key}")]
    NotInCache { key: String },

    #[error("no pending request for this type and cache key")]
    NotPending,

    #[error("cached value is not a {expected}")]
    TypeMismatch { expected: &'static str },

    #[error("request runner is stopped")]
    Stopped,
}

impl Error {
    /// true for configuration errors: no chain element could provide a persister
    pub fn is_creation_error(&self) -> bool {
        matches!(
            self,
            Error::NotHandled { .. } | Error::PersisterCreation { .. }
        )
    }

    /// true for backend read/write failures gated by the fail-on-cache-error policy
    pub fn is_cache_error(&self) -> bool {
        matches!(self, Error::CacheLoad { .. } | Error::CacheSave { .. })
    }
}
