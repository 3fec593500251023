//! wires the cache chain, the runner pool and the aggregation engine together

use std::any::Any;
use std::sync::Arc;
use std::time::Duration;

use async_channel::Receiver;
use chrono::{DateTime, Utc};
use log::*;

use crate::config::RequestCacheConfig;
use crate::error::{Error, Result};
use crate::freshness::CacheDuration;
use crate::persistence::{CacheManager, DataType, InMemoryPersisterFactory};
use crate::request::{
    CachedRequest, ChannelListener, DefaultRequestRunner, ListenerRef, ListenerRegistry, Request,
    RequestProcessor, RequestProgressManager, RequestRunner, TypedOutcome,
};
use crate::worker::WorkerStatus;

/// A submitted request and the channel its outcome arrives on.
pub struct RequestHandle<T> {
    request: Arc<CachedRequest>,
    rx: Receiver<TypedOutcome<T>>,
}

impl<T> RequestHandle<T> {
    pub fn request(&self) -> &Arc<CachedRequest> {
        &self.request
    }

    pub fn cancel(&self) {
        self.request.cancel();
    }

    /// Wait for the outcome.  A request dropped by a stopped supervisor reports `Stopped`.
    pub async fn outcome(&self) -> TypedOutcome<T> {
        match self.rx.recv().await {
            Ok(outcome) => outcome,
            Err(_) => Err(Arc::new(Error::Stopped)),
        }
    }
}

pub struct Supervisor {
    config: RequestCacheConfig,
    cache_manager: Arc<CacheManager>,
    runner: Arc<DefaultRequestRunner>,
    processor: RequestProcessor,
}

impl Supervisor {
    pub fn new(config: RequestCacheConfig, cache_manager: CacheManager) -> Supervisor {
        let cache_manager = Arc::new(cache_manager);
        let progress = Arc::new(RequestProgressManager::new(Arc::new(
            ListenerRegistry::new(),
        )));

        let runner = Arc::new(DefaultRequestRunner::new(
            cache_manager.clone(),
            progress.clone(),
            config.worker_count,
            config.queue_capacity,
        ));
        runner.set_fail_on_cache_error(config.fail_on_cache_error);

        let processor = RequestProcessor::new(cache_manager.clone(), progress, runner.clone());

        info!("supervisor started with config: {:?}", config);

        Supervisor {
            config,
            cache_manager,
            runner,
            processor,
        }
    }

    /// a supervisor caching every type in memory
    pub fn in_memory(config: RequestCacheConfig) -> Supervisor {
        let cache_manager = CacheManager::new();
        cache_manager.add_factory(Arc::new(
            InMemoryPersisterFactory::new().with_async_save(config.async_save_enabled),
        ));
        Supervisor::new(config, cache_manager)
    }

    pub fn config(&self) -> &RequestCacheConfig {
        &self.config
    }

    pub fn cache_manager(&self) -> &Arc<CacheManager> {
        &self.cache_manager
    }

    pub fn processor(&self) -> &RequestProcessor {
        &self.processor
    }

    /// Execute `request`, served from the cache under `cache_key` while fresh for `duration`.
    pub fn execute<R: Request>(
        &self,
        request: R,
        cache_key: Option<&str>,
        duration: CacheDuration,
    ) -> RequestHandle<R::Output> {
        let request = CachedRequest::new(request, cache_key.map(str::to_string), duration);
        self.submit_with_channel(Arc::new(request))
    }

    /// Answer from the cache only; a miss is reported as `NotInCache`.
    pub fn get_from_cache<T: Send + Sync + 'static>(
        &self,
        cache_key: &str,
        duration: CacheDuration,
    ) -> RequestHandle<T> {
        self.submit_with_channel(Arc::new(CachedRequest::from_cache::<T>(cache_key, duration)))
    }

    /// Attach to the pending request for this type and key; reports `NotPending` if none.
    pub fn add_listener_if_pending<T: Send + Sync + 'static>(
        &self,
        cache_key: &str,
    ) -> RequestHandle<T> {
        self.submit_with_channel(Arc::new(CachedRequest::pending_only::<T>(cache_key)))
    }

    /// cancel the in-flight request for this type and key, if any
    pub fn cancel<T: Send + Sync + 'static>(&self, cache_key: &str) {
        let request = CachedRequest::pending_only::<T>(cache_key);
        request.cancel();
        self.processor.submit(Arc::new(request), vec![]);
    }

    pub fn submit(&self, request: Arc<CachedRequest>, listeners: Vec<ListenerRef>) {
        self.processor.submit(request, listeners);
    }

    pub fn is_data_in_cache<T: Any>(
        &self,
        cache_key: &str,
        duration: CacheDuration,
    ) -> Result<bool> {
        self.cache_manager
            .exists(&DataType::of::<T>(), cache_key, duration)
    }

    pub fn date_of_data_in_cache<T: Any>(&self, cache_key: &str) -> Result<DateTime<Utc>> {
        self.cache_manager
            .creation_timestamp(&DataType::of::<T>(), cache_key)
    }

    pub fn cache_keys<T: Any>(&self) -> Vec<String> {
        self.cache_manager.list_keys(&DataType::of::<T>())
    }

    pub fn remove_data_from_cache<T: Any>(&self, cache_key: &str) -> bool {
        self.processor
            .remove_data_from_cache(&DataType::of::<T>(), cache_key)
    }

    pub fn remove_all_data_from_cache(&self) {
        self.processor.remove_all_data_from_cache();
    }

    pub fn status(&self) -> WorkerStatus {
        self.runner.status()
    }

    /// Stop taking requests and wait for queued and running ones to finish.
    pub async fn shutdown(&self) -> anyhow::Result<()> {
        self.processor.stop();

        // queued, parked and running requests all count as in flight
        while self.runner.in_flight() > 0 {
            async_std::task::sleep(Duration::from_millis(10)).await;
        }

        info!("supervisor shut down, runner id: {}", self.runner.id());

        Ok(())
    }

    fn submit_with_channel<T: Send + Sync + 'static>(
        &self,
        request: Arc<CachedRequest>,
    ) -> RequestHandle<T> {
        let (listener, rx) = ChannelListener::<T>::new();
        let listener: ListenerRef = listener;
        self.processor.submit(request.clone(), vec![listener]);
        RequestHandle { request, rx }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worker::WorkerState;

    #[test]
    fn new() {
        async_std::task::block_on(async move {
            let supervisor = Supervisor::in_memory(RequestCacheConfig::default().with_workers(2));
            let status = supervisor.status();
            assert_eq!(status.worker_count, 2);
            assert_eq!(status.state, WorkerState::Idle);
            assert_eq!(supervisor.processor().pending_request_count(), 0);

            assert!(supervisor.shutdown().await.is_ok());
            assert_eq!(supervisor.status().state, WorkerState::Shutdown);
        });
    }

    #[test]
    fn stopped_supervisor_reports_stopped() {
        async_std::task::block_on(async move {
            let supervisor = Supervisor::in_memory(RequestCacheConfig::default());
            supervisor.shutdown().await.unwrap();

            let handle = supervisor.get_from_cache::<String>("k", CacheDuration::AlwaysReturned);
            let err = handle.outcome().await.unwrap_err();
            assert!(matches!(*err, Error::Stopped));
        });
    }
}
