//! runtime settings for the supervisor and its runner

use anyhow::Result;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RequestCacheConfig {
    /// number of worker tasks executing requests
    pub worker_count: usize,
    /// bounded size of the runner's request queue
    pub queue_capacity: usize,
    /// fail a request when the cache cannot be read or written
    pub fail_on_cache_error: bool,
    /// default async-save policy for the in-memory factory
    pub async_save_enabled: bool,
}

impl Default for RequestCacheConfig {
    fn default() -> Self {
        RequestCacheConfig {
            worker_count: 3,
            queue_capacity: 250,
            fail_on_cache_error: false,
            async_save_enabled: false,
        }
    }
}

impl RequestCacheConfig {
    pub fn from_json(json: &str) -> Result<RequestCacheConfig> {
        let config: RequestCacheConfig = serde_json::from_str(json)?;
        Ok(config)
    }

    pub fn with_workers(mut self, worker_count: usize) -> RequestCacheConfig {
        self.worker_count = worker_count;
        self
    }

    pub fn with_queue_capacity(mut self, queue_capacity: usize) -> RequestCacheConfig {
        self.queue_capacity = queue_capacity;
        self
    }

    pub fn with_fail_on_cache_error(mut self, fail: bool) -> RequestCacheConfig {
        self.fail_on_cache_error = fail;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = RequestCacheConfig::default();
        assert_eq!(config.worker_count, 3);
        assert_eq!(config.queue_capacity, 250);
        assert!(!config.fail_on_cache_error);
    }

    #[test]
    fn partial_json() {
        let config = RequestCacheConfig::from_json(r#"{"worker_count": 8}"#).unwrap();
        assert_eq!(config.worker_count, 8);
        assert_eq!(config.queue_capacity, 250);

        assert!(RequestCacheConfig::from_json("not json").is_err());
    }
}
