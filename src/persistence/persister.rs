//! Persister and factory contracts.

use std::any::{Any, TypeId};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::freshness::CacheDuration;

/// A cached value as it crosses the persister contract; backends choose the representation.
pub type CacheValue = Arc<dyn Any + Send + Sync>;

/// The declared result type of a request, used to pick a persister.
#[derive(Clone, Copy)]
pub struct DataType {
    id: TypeId,
    name: &'static str,
}

impl DataType {
    pub fn of<T: Any>() -> DataType {
        DataType {
            id: TypeId::of::<T>(),
            name: std::any::type_name::<T>(),
        }
    }

    pub fn id(&self) -> TypeId {
        self.id
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// true if `value` holds an instance of this type
    pub fn matches(&self, value: &CacheValue) -> bool {
        (**value).type_id() == self.id
    }
}

impl PartialEq for DataType {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for DataType {}

impl Hash for DataType {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Debug for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}

/// A backend able to load, save and enumerate entries of one or more data types.
///
/// Entries are keyed by cache key and carry the time they were last written.
/// `can_handle` must be a pure predicate.
pub trait Persister: Send + Sync {
    fn can_handle(&self, data_type: &DataType) -> bool;

    /// Return the entry for `key` if it exists and is fresh for `max_age`.
    /// An expired entry is `Ok(None)`, not an error.
    fn load(&self, key: &str, max_age: CacheDuration) -> anyhow::Result<Option<CacheValue>>;

    /// Write `value` under `key` and hand it back.
    ///
    /// With async save enabled the write may land after this returns.
    fn save(&self, value: CacheValue, key: &str) -> anyhow::Result<CacheValue>;

    fn exists(&self, key: &str, max_age: CacheDuration) -> bool;

    fn delete(&self, key: &str) -> bool;

    fn delete_all(&self);

    fn list_keys(&self) -> Vec<String>;

    fn load_all(&self) -> anyhow::Result<Vec<CacheValue>>;

    /// When the entry for `key` was last written.
    fn creation_timestamp(&self, key: &str) -> anyhow::Result<DateTime<Utc>>;

    fn is_async_save_enabled(&self) -> bool;

    fn set_async_save_enabled(&self, enabled: bool);
}

/// Produces persisters on demand, one per data type it is asked for.
pub trait PersisterFactory: Send + Sync {
    fn can_handle(&self, data_type: &DataType) -> bool;

    fn create_persister(&self, data_type: &DataType) -> anyhow::Result<Arc<dyn Persister>>;

    /// Copied onto every persister this factory creates.
    fn is_async_save_enabled(&self) -> bool;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn data_type_identity() {
        assert_eq!(DataType::of::<String>(), DataType::of::<String>());
        assert_ne!(DataType::of::<String>(), DataType::of::<u64>());
        assert!(DataType::of::<u64>().name().contains("u64"));
    }

    #[test]
    fn data_type_matches_value() {
        let value: CacheValue = Arc::new(42u64);
        assert!(DataType::of::<u64>().matches(&value));
        assert!(!DataType::of::<u32>().matches(&value));
    }
}
