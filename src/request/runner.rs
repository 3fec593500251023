//! Request execution.
//!
//! [`RequestRunner`] is the seam between the aggregation engine and whatever
//! executes work.  [`DefaultRequestRunner`] runs a pool of async-std worker
//! tasks reading from one bounded queue: each request is answered from the
//! cache when a fresh entry exists, otherwise computed, written back and
//! delivered through the progress manager.

use std::sync::atomic::{AtomicBool, AtomicU16, AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::Result;
use async_channel::{bounded, Receiver, Sender, TrySendError};
use domain_keys::keys::RouteKey;
use log::*;
use service_uptime::Uptime;

use super::cached_request::CachedRequest;
use super::listener::RequestStatus;
use super::progress::RequestProgressManager;
use crate::error::Error;
use crate::persistence::CacheManager;
use crate::worker::{JsonString, WorkerState, WorkerStatus};

pub trait RequestRunner: Send + Sync {
    fn execute_request(&self, request: Arc<CachedRequest>);

    /// stop accepting work; requests already queued or running still complete
    fn should_stop(&self);

    fn is_fail_on_cache_error(&self) -> bool;

    fn set_fail_on_cache_error(&self, fail_on_cache_error: bool);
}

// state shared by every worker task
struct RunnerContext {
    cache_manager: Arc<CacheManager>,
    progress: Arc<RequestProgressManager>,
    queue_tx: Sender<Arc<CachedRequest>>,
    fail_on_cache_error: AtomicBool,
    stopped: AtomicBool,
    active: AtomicUsize,
    // accepted by execute_request and not yet finished, queued or parked included
    in_flight: AtomicUsize,
    error_count: AtomicU16,
}

impl RunnerContext {
    fn fail(&self, request: &CachedRequest, error: Error) {
        let _ = self
            .error_count
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_add(1));
        self.progress.notify_failure(request, error);
    }

    // the last accepted request to finish after a stop closes the queue
    fn finish(&self) {
        if self.in_flight.fetch_sub(1, Ordering::SeqCst) == 1 && self.stopped.load(Ordering::SeqCst)
        {
            self.queue_tx.close();
        }
    }
}

// the worker loop
async fn handler(id: String, ctx: Arc<RunnerContext>, rx: Receiver<Arc<CachedRequest>>) -> Result<()> {
    while let Ok(request) = rx.recv().await {
        debug!("worker {} recv request: {}", id, request);
        ctx.active.fetch_add(1, Ordering::SeqCst);
        process_request(&ctx, request).await;
        ctx.active.fetch_sub(1, Ordering::SeqCst);
        ctx.finish();
    }

    info!("worker {} queue closed", id);

    Ok(())
}

async fn process_request(ctx: &RunnerContext, request: Arc<CachedRequest>) {
    if request.is_cancelled() {
        ctx.progress.notify_cancellation(&request);
        return;
    }

    if let Some(cache_key) = request.cache_key() {
        if request.cache_duration().reads_cache() {
            ctx.progress
                .notify_progress(&request, RequestStatus::ReadingFromCache);
            match ctx
                .cache_manager
                .load(request.data_type(), cache_key, request.cache_duration())
            {
                Ok(Some(value)) => {
                    debug!("{} served from cache", request);
                    ctx.progress.notify_success(&request, value);
                    return;
                }
                Ok(None) => debug!("{} not in cache or expired", request),
                Err(e) if e.is_creation_error() => {
                    ctx.fail(&request, e);
                    return;
                }
                Err(e) => {
                    if ctx.fail_on_cache_error.load(Ordering::SeqCst) {
                        ctx.fail(&request, e);
                        return;
                    }
                    warn!("{}: {}, loading live data", request, e);
                }
            }
        }
    }

    if request.is_offline() {
        let key_text = request.cache_key().unwrap_or_default().to_string();
        ctx.fail(&request, Error::NotInCache { key: key_text });
        return;
    }

    ctx.progress
        .notify_progress(&request, RequestStatus::LoadingFromNetwork);
    let result = request.run().await;

    if request.is_cancelled() {
        ctx.progress.notify_cancellation(&request);
        return;
    }

    let mut value = match result {
        Ok(value) => value,
        Err(e) => {
            ctx.fail(&request, Error::Request(e));
            return;
        }
    };

    if let Some(cache_key) = request.cache_key() {
        ctx.progress
            .notify_progress(&request, RequestStatus::WritingToCache);
        match ctx
            .cache_manager
            .save(request.data_type(), value.clone(), cache_key)
        {
            Ok(saved) => value = saved,
            Err(e) => {
                if ctx.fail_on_cache_error.load(Ordering::SeqCst) {
                    ctx.fail(&request, e);
                    return;
                }
                warn!("{}: {}, result delivered uncached", request, e);
            }
        }
    }

    ctx.progress.notify_success(&request, value);
}

pub struct DefaultRequestRunner {
    id: String,
    uptime: Uptime,
    worker_count: usize,
    ctx: Arc<RunnerContext>,
}

impl DefaultRequestRunner {
    /// create the runner and start `worker_count` worker tasks
    pub fn new(
        cache_manager: Arc<CacheManager>,
        progress: Arc<RequestProgressManager>,
        worker_count: usize,
        queue_capacity: usize,
    ) -> DefaultRequestRunner {
        let id = RouteKey::create();
        let worker_count = worker_count.max(1);
        let (queue_tx, queue_rx) = bounded(queue_capacity.max(1));

        let ctx = Arc::new(RunnerContext {
            cache_manager,
            progress,
            queue_tx,
            fail_on_cache_error: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            active: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            error_count: AtomicU16::new(0),
        });

        info!("starting request runner, id: {}, workers: {}", id, worker_count);

        // run the handler loops as background tasks
        for n in 0..worker_count {
            let worker_id = format!("{}-{}", id, n);
            let ctx = ctx.clone();
            let rx = queue_rx.clone();
            async_std::task::spawn(async move {
                match handler(worker_id.clone(), ctx, rx).await {
                    Ok(()) => info!("worker handler exit for worker id: {}", worker_id),
                    Err(e) => error!("worker exit with error: {:?}", e),
                }
            });
        }

        DefaultRequestRunner {
            id,
            uptime: Uptime::new(),
            worker_count,
            ctx,
        }
    }

    /// return the runner's id
    pub fn id(&self) -> String {
        self.id.to_string()
    }

    pub fn is_stopped(&self) -> bool {
        self.ctx.stopped.load(Ordering::SeqCst)
    }

    /// requests accepted and not yet finished: queued, waiting for room or running
    pub fn in_flight(&self) -> usize {
        self.ctx.in_flight.load(Ordering::SeqCst)
    }

    pub fn status(&self) -> WorkerStatus {
        let active = self.ctx.active.load(Ordering::SeqCst);
        let state = if self.is_stopped() {
            WorkerState::Shutdown
        } else if active > 0 {
            WorkerState::Busy
        } else {
            WorkerState::Idle
        };

        let mut status = WorkerStatus::new(self.id(), state, self.uptime.to_string());
        status.error_count = self.ctx.error_count.load(Ordering::SeqCst);
        status.worker_count = self.worker_count;
        status.active_requests = active;
        status.queued_requests = self.ctx.queue_tx.len();
        status
    }

    pub fn status_json(&self) -> JsonString {
        let msg = self.status().to_json();
        info!("status response: {}", msg);
        msg
    }
}

// workers hold the context, so the queue only ends when closed
impl Drop for DefaultRequestRunner {
    fn drop(&mut self) {
        self.ctx.queue_tx.close();
    }
}

impl RequestRunner for DefaultRequestRunner {
    fn execute_request(&self, request: Arc<CachedRequest>) {
        self.ctx.in_flight.fetch_add(1, Ordering::SeqCst);
        if self.is_stopped() {
            warn!("runner {} stopped, rejecting {}", self.id, request);
            self.ctx.fail(&request, Error::Stopped);
            self.ctx.finish();
            return;
        }

        match self.ctx.queue_tx.try_send(request) {
            Ok(()) => {}
            Err(TrySendError::Full(request)) => {
                // queue is full: wait for room off the submitting thread
                let ctx = self.ctx.clone();
                async_std::task::spawn(async move {
                    if let Err(e) = ctx.queue_tx.send(request).await {
                        let request = e.into_inner();
                        ctx.fail(&request, Error::Stopped);
                        ctx.finish();
                    }
                });
            }
            Err(TrySendError::Closed(request)) => {
                warn!("runner {} queue closed, rejecting {}", self.id, request);
                self.ctx.fail(&request, Error::Stopped);
                self.ctx.finish();
            }
        }
    }

    /// Refuse new work.  The queue closes once every accepted request has finished.
    fn should_stop(&self) {
        if !self.ctx.stopped.swap(true, Ordering::SeqCst) {
            info!("runner {} stopping, in flight: {}", self.id, self.in_flight());
            if self.in_flight() == 0 {
                self.ctx.queue_tx.close();
            }
        }
    }

    fn is_fail_on_cache_error(&self) -> bool {
        self.ctx.fail_on_cache_error.load(Ordering::SeqCst)
    }

    fn set_fail_on_cache_error(&self, fail_on_cache_error: bool) {
        self.ctx
            .fail_on_cache_error
            .store(fail_on_cache_error, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::freshness::CacheDuration;
    use crate::persistence::{CacheValue, DataType, InMemoryPersisterFactory, Persister};
    use crate::request::cached_request::Request;
    use crate::request::listener::{ChannelListener, ListenerRef};
    use crate::request::registry::ListenerRegistry;
    use async_trait::async_trait;
    use chrono::{DateTime, Utc};
    use std::sync::atomic::AtomicUsize;

    struct Counted {
        value: &'static str,
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Request for Counted {
        type Output = String;

        async fn load_data(&self) -> anyhow::Result<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.value.to_string())
        }
    }

    struct Failing;

    #[async_trait]
    impl Request for Failing {
        type Output = String;

        async fn load_data(&self) -> anyhow::Result<String> {
            anyhow::bail!("network down")
        }
    }

    // a persister whose reads and writes always fail
    struct BrokenPersister;

    impl Persister for BrokenPersister {
        fn can_handle(&self, _data_type: &DataType) -> bool {
            true
        }
        fn load(&self, _key: &str, _max_age: CacheDuration) -> anyhow::Result<Option<CacheValue>> {
            anyhow::bail!("read failed")
        }
        fn save(&self, _value: CacheValue, _key: &str) -> anyhow::Result<CacheValue> {
            anyhow::bail!("write failed")
        }
        fn exists(&self, _key: &str, _max_age: CacheDuration) -> bool {
            false
        }
        fn delete(&self, _key: &str) -> bool {
            false
        }
        fn delete_all(&self) {}
        fn list_keys(&self) -> Vec<String> {
            vec![]
        }
        fn load_all(&self) -> anyhow::Result<Vec<CacheValue>> {
            Ok(vec![])
        }
        fn creation_timestamp(&self, _key: &str) -> anyhow::Result<DateTime<Utc>> {
            anyhow::bail!("no entry")
        }
        fn is_async_save_enabled(&self) -> bool {
            false
        }
        fn set_async_save_enabled(&self, _enabled: bool) {}
    }

    fn runner_with(cache_manager: CacheManager) -> (DefaultRequestRunner, Arc<RequestProgressManager>) {
        let progress = Arc::new(RequestProgressManager::new(Arc::new(ListenerRegistry::new())));
        let runner = DefaultRequestRunner::new(Arc::new(cache_manager), progress.clone(), 2, 10);
        (runner, progress)
    }

    fn memory_cache() -> CacheManager {
        let cache_manager = CacheManager::new();
        cache_manager.add_factory(Arc::new(InMemoryPersisterFactory::new()));
        cache_manager
    }

    fn register(
        progress: &RequestProgressManager,
        request: &Arc<CachedRequest>,
    ) -> async_channel::Receiver<crate::request::listener::TypedOutcome<String>> {
        let (listener, rx) = ChannelListener::<String>::new();
        let listeners: Vec<ListenerRef> = vec![listener];
        progress.registry().register(request, &listeners);
        rx
    }

    #[test]
    fn computes_then_serves_from_cache() {
        async_std::task::block_on(async move {
            let (runner, progress) = runner_with(memory_cache());
            let calls = Arc::new(AtomicUsize::new(0));

            for _ in 0..2 {
                let request = Arc::new(CachedRequest::new(
                    Counted {
                        value: "fresh",
                        calls: calls.clone(),
                    },
                    Some("k".to_string()),
                    CacheDuration::ONE_MINUTE,
                ));
                let rx = register(&progress, &request);
                runner.execute_request(request);
                assert_eq!(rx.recv().await.unwrap().unwrap().as_str(), "fresh");
            }

            assert_eq!(calls.load(Ordering::SeqCst), 1);
            assert_eq!(runner.status().error_count, 0);
        });
    }

    #[test]
    fn request_failure_is_delivered() {
        async_std::task::block_on(async move {
            let (runner, progress) = runner_with(memory_cache());
            let request = Arc::new(CachedRequest::new(
                Failing,
                Some("k".to_string()),
                CacheDuration::ONE_MINUTE,
            ));
            let rx = register(&progress, &request);
            runner.execute_request(request);

            let err = rx.recv().await.unwrap().unwrap_err();
            assert!(matches!(*err, Error::Request(_)));
            assert_eq!(runner.status().error_count, 1);
        });
    }

    #[test]
    fn cache_errors_follow_policy() {
        async_std::task::block_on(async move {
            let cache_manager = CacheManager::new();
            cache_manager.add_persister(Arc::new(BrokenPersister));
            let (runner, progress) = runner_with(cache_manager);
            let calls = Arc::new(AtomicUsize::new(0));
            let make = |calls: &Arc<AtomicUsize>| {
                Arc::new(CachedRequest::new(
                    Counted {
                        value: "live",
                        calls: calls.clone(),
                    },
                    Some("k".to_string()),
                    CacheDuration::ONE_MINUTE,
                ))
            };

            // lenient: cache errors degrade to the live result
            assert!(!runner.is_fail_on_cache_error());
            let request = make(&calls);
            let rx = register(&progress, &request);
            runner.execute_request(request);
            assert_eq!(rx.recv().await.unwrap().unwrap().as_str(), "live");

            // strict: the load error fails the request before any computation
            runner.set_fail_on_cache_error(true);
            let request = make(&calls);
            let rx = register(&progress, &request);
            runner.execute_request(request);
            let err = rx.recv().await.unwrap().unwrap_err();
            assert!(matches!(*err, Error::CacheLoad { .. }));
            assert_eq!(calls.load(Ordering::SeqCst), 1);
        });
    }

    #[test]
    fn unhandled_type_fails_regardless_of_policy() {
        async_std::task::block_on(async move {
            let (runner, progress) = runner_with(CacheManager::new());
            let request = Arc::new(CachedRequest::new(
                Failing,
                Some("k".to_string()),
                CacheDuration::ONE_MINUTE,
            ));
            let rx = register(&progress, &request);
            runner.execute_request(request);

            let err = rx.recv().await.unwrap().unwrap_err();
            assert!(matches!(*err, Error::NotHandled { .. }));
        });
    }

    #[test]
    fn offline_miss() {
        async_std::task::block_on(async move {
            let (runner, progress) = runner_with(memory_cache());
            let request = Arc::new(CachedRequest::from_cache::<String>(
                "absent",
                CacheDuration::AlwaysReturned,
            ));
            let rx = register(&progress, &request);
            runner.execute_request(request);

            let err = rx.recv().await.unwrap().unwrap_err();
            assert!(matches!(*err, Error::NotInCache { .. }));
        });
    }

    #[test]
    fn stopped_runner_rejects() {
        async_std::task::block_on(async move {
            let (runner, progress) = runner_with(memory_cache());
            runner.should_stop();
            assert!(runner.is_stopped());
            assert_eq!(runner.status().state, WorkerState::Shutdown);

            let request = Arc::new(CachedRequest::uncached(Failing));
            let rx = register(&progress, &request);
            runner.execute_request(request);

            let err = rx.recv().await.unwrap().unwrap_err();
            assert!(matches!(*err, Error::Stopped));
            assert!(progress.registry().is_empty());
            assert_eq!(runner.in_flight(), 0);
        });
    }

    struct Gated(async_channel::Receiver<()>);

    #[async_trait]
    impl Request for Gated {
        type Output = String;

        async fn load_data(&self) -> anyhow::Result<String> {
            let _ = self.0.recv().await;
            Ok("done".to_string())
        }
    }

    #[test]
    fn stop_drains_queued_and_parked_requests() {
        async_std::task::block_on(async move {
            let progress = Arc::new(RequestProgressManager::new(Arc::new(ListenerRegistry::new())));
            let runner =
                DefaultRequestRunner::new(Arc::new(memory_cache()), progress.clone(), 1, 1);
            let (open, gate) = async_channel::bounded(4);

            // one running, one queued, the rest parked waiting for room
            let mut outcomes = vec![];
            for _ in 0..4 {
                let request = Arc::new(CachedRequest::uncached(Gated(gate.clone())));
                outcomes.push(register(&progress, &request));
                runner.execute_request(request);
            }
            assert_eq!(runner.in_flight(), 4);

            runner.should_stop();
            assert!(runner.is_stopped());

            for _ in 0..4 {
                open.send(()).await.unwrap();
            }
            for rx in outcomes {
                assert_eq!(rx.recv().await.unwrap().unwrap().as_str(), "done");
            }
            assert_eq!(runner.in_flight(), 0);
            assert_eq!(runner.status().error_count, 0);
        });
    }

    #[test]
    fn status_json() {
        let (runner, _progress) = runner_with(memory_cache());
        let status = runner.status();
        assert_eq!(status.worker_id.len(), 16);
        assert_eq!(status.worker_count, 2);
        assert_eq!(status.state, WorkerState::Idle);
        assert!(runner.status_json().contains(&runner.id()));
    }
}
