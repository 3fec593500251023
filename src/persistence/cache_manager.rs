//! Ordered chain of persisters and persister factories.
//!
//! Every element is asked in registration order whether it handles a type; the
//! first one that does wins.  A factory sits in the chain at the slot it was
//! registered in and lazily creates one persister per type, which it then keeps
//! until the factory is deregistered.

use std::any::Any;
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use log::*;

use super::persister::{CacheValue, DataType, Persister, PersisterFactory};
use crate::error::{Error, Result};
use crate::freshness::CacheDuration;
use crate::sync::{read, write};

enum PersisterHandler {
    Direct(Arc<dyn Persister>),
    Factory {
        factory: Arc<dyn PersisterFactory>,
        // append-only; cleared only by deregistering the factory
        created: RwLock<Vec<Arc<dyn Persister>>>,
    },
}

impl PersisterHandler {
    fn can_handle(&self, data_type: &DataType) -> bool {
        match self {
            PersisterHandler::Direct(persister) => persister.can_handle(data_type),
            PersisterHandler::Factory { factory, .. } => factory.can_handle(data_type),
        }
    }
}

fn same_instance<T: ?Sized>(a: &Arc<T>, b: &Arc<T>) -> bool {
    std::ptr::eq(Arc::as_ptr(a) as *const (), Arc::as_ptr(b) as *const ())
}

#[derive(Default)]
pub struct CacheManager {
    chain: RwLock<Vec<PersisterHandler>>,
}

impl CacheManager {
    pub fn new() -> CacheManager {
        CacheManager::default()
    }

    pub fn add_persister(&self, persister: Arc<dyn Persister>) {
        write(&self.chain).push(PersisterHandler::Direct(persister));
    }

    pub fn add_factory(&self, factory: Arc<dyn PersisterFactory>) {
        write(&self.chain).push(PersisterHandler::Factory {
            factory,
            created: RwLock::new(vec![]),
        });
    }

    /// remove a direct persister from the chain; returns false if it was not registered
    pub fn remove_persister(&self, persister: &Arc<dyn Persister>) -> bool {
        let mut chain = write(&self.chain);
        let before = chain.len();
        chain.retain(|handler| match handler {
            PersisterHandler::Direct(p) => !same_instance(p, persister),
            PersisterHandler::Factory { .. } => true,
        });
        chain.len() != before
    }

    /// remove a factory and forget every persister it created
    pub fn remove_factory(&self, factory: &Arc<dyn PersisterFactory>) -> bool {
        let mut chain = write(&self.chain);
        let before = chain.len();
        chain.retain(|handler| match handler {
            PersisterHandler::Factory { factory: f, .. } => !same_instance(f, factory),
            PersisterHandler::Direct(_) => true,
        });
        chain.len() != before
    }

    /// number of elements in the chain, factories count once
    pub fn chain_len(&self) -> usize {
        read(&self.chain).len()
    }

    /// Find the persister that owns `data_type`, creating it through a factory if needed.
    pub fn resolve_persister(&self, data_type: &DataType) -> Result<Arc<dyn Persister>> {
        let chain = read(&self.chain);

        for handler in chain.iter() {
            if !handler.can_handle(data_type) {
                continue;
            }

            match handler {
                PersisterHandler::Direct(persister) => return Ok(persister.clone()),
                PersisterHandler::Factory { factory, created } => {
                    if let Some(existing) = find_created(&read(created), data_type) {
                        return Ok(existing);
                    }

                    // re-check under the write lock so two racing resolutions create one persister
                    let mut created = write(created);
                    if let Some(existing) = find_created(&created, data_type) {
                        return Ok(existing);
                    }

                    let persister = factory.create_persister(data_type).map_err(|source| {
                        Error::PersisterCreation {
                            type_name: data_type.name(),
                            source,
                        }
                    })?;
                    persister.set_async_save_enabled(factory.is_async_save_enabled());
                    debug!("factory created persister for {}", data_type);
                    created.push(persister.clone());

                    return Ok(persister);
                }
            }
        }

        Err(Error::NotHandled {
            type_name: data_type.name(),
        })
    }

    pub fn load(
        &self,
        data_type: &DataType,
        key: &str,
        max_age: CacheDuration,
    ) -> Result<Option<CacheValue>> {
        self.resolve_persister(data_type)?
            .load(key, max_age)
            .map_err(|source| Error::CacheLoad {
                key: key.to_string(),
                source,
            })
    }

    /// typed form of [`CacheManager::load`]
    pub fn load_as<T: Any + Send + Sync>(
        &self,
        key: &str,
        max_age: CacheDuration,
    ) -> Result<Option<Arc<T>>> {
        match self.load(&DataType::of::<T>(), key, max_age)? {
            Some(value) => downcast(value).map(Some),
            None => Ok(None),
        }
    }

    pub fn save(&self, data_type: &DataType, value: CacheValue, key: &str) -> Result<CacheValue> {
        self.resolve_persister(data_type)?
            .save(value, key)
            .map_err(|source| Error::CacheSave {
                key: key.to_string(),
                source,
            })
    }

    /// typed form of [`CacheManager::save`]
    pub fn save_as<T: Any + Send + Sync>(&self, value: T, key: &str) -> Result<Arc<T>> {
        let saved = self.save(&DataType::of::<T>(), Arc::new(value), key)?;
        downcast(saved)
    }

    pub fn exists(&self, data_type: &DataType, key: &str, max_age: CacheDuration) -> Result<bool> {
        Ok(self.resolve_persister(data_type)?.exists(key, max_age))
    }

    pub fn creation_timestamp(&self, data_type: &DataType, key: &str) -> Result<DateTime<Utc>> {
        self.resolve_persister(data_type)?
            .creation_timestamp(key)
            .map_err(|source| Error::CacheLoad {
                key: key.to_string(),
                source,
            })
    }

    /// delete one entry; an unhandled type has nothing to delete
    pub fn delete(&self, data_type: &DataType, key: &str) -> bool {
        match self.resolve_persister(data_type) {
            Ok(persister) => persister.delete(key),
            Err(e) => {
                error!("delete {} for {}: {}", key, data_type, e);
                false
            }
        }
    }

    pub fn delete_all(&self, data_type: &DataType) {
        match self.resolve_persister(data_type) {
            Ok(persister) => persister.delete_all(),
            Err(e) => error!("delete all for {}: {}", data_type, e),
        }
    }

    pub fn list_keys(&self, data_type: &DataType) -> Vec<String> {
        match self.resolve_persister(data_type) {
            Ok(persister) => persister.list_keys(),
            Err(e) => {
                error!("list keys for {}: {}", data_type, e);
                vec![]
            }
        }
    }

    pub fn load_all(&self, data_type: &DataType) -> Result<Vec<CacheValue>> {
        self.resolve_persister(data_type)?
            .load_all()
            .map_err(|source| Error::CacheLoad {
                key: "*".to_string(),
                source,
            })
    }

    /// Clear every direct persister and every persister a factory has created so far.
    /// Never creates a persister.
    pub fn clear_all(&self) {
        let chain = read(&self.chain);
        for handler in chain.iter() {
            match handler {
                PersisterHandler::Direct(persister) => persister.delete_all(),
                PersisterHandler::Factory { created, .. } => {
                    for persister in read(created).iter() {
                        persister.delete_all();
                    }
                }
            }
        }
        info!("cleared all cached data, chain size: {}", chain.len());
    }
}

fn find_created(
    created: &[Arc<dyn Persister>],
    data_type: &DataType,
) -> Option<Arc<dyn Persister>> {
    created
        .iter()
        .find(|persister| persister.can_handle(data_type))
        .cloned()
}

pub(crate) fn downcast<T: Any + Send + Sync>(value: CacheValue) -> Result<Arc<T>> {
    value.downcast::<T>().map_err(|_| Error::TypeMismatch {
        expected: std::any::type_name::<T>(),
    })
}
