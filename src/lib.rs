#![doc = include_str!("../README.md")]

pub mod config;
pub mod error;
pub mod freshness;
pub mod logging;
pub mod persistence;
pub mod request;
pub mod supervisor;
mod sync;
pub mod worker;

pub use error::{Error, Result};
pub use freshness::CacheDuration;

/// the current app version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
