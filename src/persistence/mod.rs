//! pluggable persistence for request results.
//! use cases:
//! * in-memory spot-cache for results that are cheap to recompute
//! * per-type backends created on demand by a factory, e.g., one file store per type
//! * a chain where specific types get a dedicated persister and a factory catches the rest
//!
//! The cache manager holds an ordered chain of persisters and factories.  The first
//! element that can handle a type owns it.  Factories create their persisters lazily,
//! one per type, and keep them for the life of the factory registration.

pub mod cache_manager;
pub mod memory;
pub mod persister;

pub use cache_manager::CacheManager;
pub use memory::{InMemoryPersister, InMemoryPersisterFactory};
pub use persister::{CacheValue, DataType, Persister, PersisterFactory};
