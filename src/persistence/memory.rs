//! in-memory persister and factory.
//!
//! Synchronous saves write straight into the map.  With async save enabled,
//! writes are queued to a background writer task and `flush` is the signal that
//! every write queued before it has landed.  Each queued write carries a
//! sequence number; a delete, a clear or a later write supersedes it, so a
//! queued write never resurrects an entry removed after it was issued.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use anyhow::{anyhow, Result};
use async_channel::{Receiver, Sender};
use chrono::{DateTime, Utc};
use hashbrown::HashMap;
use log::*;

use super::persister::{CacheValue, DataType, Persister, PersisterFactory};
use crate::freshness::{CacheDuration, Clock, SystemClock};
use crate::sync::{lock, read, write};

#[derive(Clone)]
struct Entry {
    value: CacheValue,
    saved_at: DateTime<Utc>,
}

#[derive(Default)]
struct State {
    entries: HashMap<String, Entry>,
    // key -> sequence of the latest queued write not yet applied
    pending: HashMap<String, u64>,
}

impl State {
    fn apply(&mut self, key: String, entry: Entry, seq: u64) -> bool {
        if self.pending.get(&key) != Some(&seq) {
            return false;
        }
        self.pending.remove(&key);
        self.entries.insert(key, entry);
        true
    }
}

type Store = Arc<RwLock<State>>;

enum Command {
    Save(String, Entry, u64),
    Flush(Sender<()>),
}

// the writer loop; exits when the persister drops its sender
async fn writer(name: &'static str, store: Store, rx: Receiver<Command>) -> Result<()> {
    while let Ok(cmd) = rx.recv().await {
        match cmd {
            Command::Save(key, entry, seq) => {
                if write(&store).apply(key.clone(), entry, seq) {
                    debug!("{} async write key: {}", name, key);
                } else {
                    debug!("{} async write for {} superseded", name, key);
                }
            }
            Command::Flush(tx) => {
                if tx.send(()).await.is_err() {
                    warn!("{} flush requester went away", name);
                }
            }
        }
    }

    rx.close();

    Ok(())
}

pub struct InMemoryPersister {
    data_type: DataType,
    store: Store,
    clock: Arc<dyn Clock>,
    async_save: AtomicBool,
    next_seq: AtomicU64,
    writer_tx: Mutex<Option<Sender<Command>>>,
}

impl InMemoryPersister {
    pub fn new(data_type: DataType) -> InMemoryPersister {
        InMemoryPersister::with_clock(data_type, Arc::new(SystemClock))
    }

    pub fn with_clock(data_type: DataType, clock: Arc<dyn Clock>) -> InMemoryPersister {
        InMemoryPersister {
            data_type,
            store: Arc::new(RwLock::new(State::default())),
            clock,
            async_save: AtomicBool::new(false),
            next_seq: AtomicU64::new(1),
            writer_tx: Mutex::new(None),
        }
    }

    pub fn data_type(&self) -> DataType {
        self.data_type
    }

    /// number of entries written so far; queued async writes are not counted
    pub fn len(&self) -> usize {
        read(&self.store).entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Wait until every async write queued before this call is visible to `load`.
    pub async fn flush(&self) {
        let tx = lock(&self.writer_tx).clone();
        if let Some(tx) = tx {
            let (done_tx, done_rx) = async_channel::bounded(1);
            if tx.send(Command::Flush(done_tx)).await.is_ok() {
                let _ = done_rx.recv().await;
            }
        }
    }

    // start the writer on first use
    fn writer(&self) -> Sender<Command> {
        let mut writer_tx = lock(&self.writer_tx);
        if let Some(tx) = writer_tx.as_ref() {
            return tx.clone();
        }

        let (tx, rx) = async_channel::unbounded();
        let name = self.data_type.name();
        let store = self.store.clone();
        async_std::task::spawn(async move {
            match writer(name, store, rx).await {
                Ok(()) => debug!("writer exit for {}", name),
                Err(e) => error!("writer for {} exit with error: {:?}", name, e),
            }
        });

        *writer_tx = Some(tx.clone());
        tx
    }
}

impl Persister for InMemoryPersister {
    fn can_handle(&self, data_type: &DataType) -> bool {
        self.data_type == *data_type
    }

    fn load(&self, key: &str, max_age: CacheDuration) -> Result<Option<CacheValue>> {
        let store = read(&self.store);
        let now = self.clock.now();
        Ok(store
            .entries
            .get(key)
            .filter(|entry| max_age.is_fresh(entry.saved_at, now))
            .map(|entry| entry.value.clone()))
    }

    fn save(&self, value: CacheValue, key: &str) -> Result<CacheValue> {
        if !self.data_type.matches(&value) {
            return Err(anyhow!(
                "persister for {} cannot store this value",
                self.data_type
            ));
        }

        let entry = Entry {
            value: value.clone(),
            saved_at: self.clock.now(),
        };

        if !self.is_async_save_enabled() {
            let mut store = write(&self.store);
            store.pending.remove(key);
            store.entries.insert(key.to_string(), entry);
            return Ok(value);
        }

        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
        write(&self.store).pending.insert(key.to_string(), seq);

        if let Err(e) = self
            .writer()
            .try_send(Command::Save(key.to_string(), entry, seq))
        {
            warn!("async write for {} rejected, writing inline", key);
            if let Command::Save(key, entry, seq) = e.into_inner() {
                write(&self.store).apply(key, entry, seq);
            }
        }

        Ok(value)
    }

    fn exists(&self, key: &str, max_age: CacheDuration) -> bool {
        let now = self.clock.now();
        read(&self.store)
            .entries
            .get(key)
            .map_or(false, |entry| max_age.is_fresh(entry.saved_at, now))
    }

    /// removes the entry and supersedes any queued write for `key`
    fn delete(&self, key: &str) -> bool {
        let mut store = write(&self.store);
        let queued = store.pending.remove(key).is_some();
        store.entries.remove(key).is_some() || queued
    }

    fn delete_all(&self) {
        let mut store = write(&self.store);
        store.pending.clear();
        store.entries.clear();
    }

    fn list_keys(&self) -> Vec<String> {
        read(&self.store).entries.keys().cloned().collect()
    }

    fn load_all(&self) -> Result<Vec<CacheValue>> {
        Ok(read(&self.store)
            .entries
            .values()
            .map(|entry| entry.value.clone())
            .collect())
    }

    fn creation_timestamp(&self, key: &str) -> Result<DateTime<Utc>> {
        read(&self.store)
            .entries
            .get(key)
            .map(|entry| entry.saved_at)
            .ok_or_else(|| anyhow!("no {} cached under key {}", self.data_type, key))
    }

    fn is_async_save_enabled(&self) -> bool {
        self.async_save.load(Ordering::SeqCst)
    }

    fn set_async_save_enabled(&self, enabled: bool) {
        self.async_save.store(enabled, Ordering::SeqCst);
    }
}

/// Creates one [`InMemoryPersister`] per type, for every type or a fixed list.
pub struct InMemoryPersisterFactory {
    handled: Option<Vec<DataType>>,
    clock: Arc<dyn Clock>,
    async_save: bool,
}

impl InMemoryPersisterFactory {
    pub fn new() -> InMemoryPersisterFactory {
        InMemoryPersisterFactory {
            handled: None,
            clock: Arc::new(SystemClock),
            async_save: false,
        }
    }

    pub fn for_types(types: Vec<DataType>) -> InMemoryPersisterFactory {
        InMemoryPersisterFactory {
            handled: Some(types),
            ..InMemoryPersisterFactory::new()
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> InMemoryPersisterFactory {
        self.clock = clock;
        self
    }

    pub fn with_async_save(mut self, enabled: bool) -> InMemoryPersisterFactory {
        self.async_save = enabled;
        self
    }
}

impl Default for InMemoryPersisterFactory {
    fn default() -> Self {
        InMemoryPersisterFactory::new()
    }
}

impl PersisterFactory for InMemoryPersisterFactory {
    fn can_handle(&self, data_type: &DataType) -> bool {
        match &self.handled {
            Some(types) => types.contains(data_type),
            None => true,
        }
    }

    fn create_persister(&self, data_type: &DataType) -> Result<Arc<dyn Persister>> {
        Ok(Arc::new(InMemoryPersister::with_clock(
            *data_type,
            self.clock.clone(),
        )))
    }

    fn is_async_save_enabled(&self) -> bool {
        self.async_save
    }
}
