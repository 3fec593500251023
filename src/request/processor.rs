//! The aggregation engine.
//!
//! Decides for every submission whether it is new, already in flight, cancelled
//! or unprocessable, and hands genuinely new work to the runner.  Completion
//! flows back through the [`RequestProgressManager`], which fans the outcome out
//! to every listener registered for the identity at that point and then evicts
//! the entry.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::*;

use super::cached_request::CachedRequest;
use super::listener::{ListenerRef, ServiceListener};
use super::progress::RequestProgressManager;
use super::registry::{ListenerRegistry, Registration};
use super::runner::RequestRunner;
use crate::persistence::{CacheManager, DataType};

pub struct RequestProcessor {
    cache_manager: Arc<CacheManager>,
    progress: Arc<RequestProgressManager>,
    runner: Arc<dyn RequestRunner>,
    stopped: AtomicBool,
}

impl RequestProcessor {
    pub fn new(
        cache_manager: Arc<CacheManager>,
        progress: Arc<RequestProgressManager>,
        runner: Arc<dyn RequestRunner>,
    ) -> RequestProcessor {
        RequestProcessor {
            cache_manager,
            progress,
            runner,
            stopped: AtomicBool::new(false),
        }
    }

    pub fn registry(&self) -> &Arc<ListenerRegistry> {
        self.progress.registry()
    }

    /// Submit a request with the listeners interested in its outcome.
    ///
    /// Returns as soon as the request is registered and handed off, merged into
    /// an in-flight request, or resolved as cancelled or unprocessable.
    pub fn submit(&self, request: Arc<CachedRequest>, listeners: Vec<ListenerRef>) {
        if self.is_stopped() {
            debug!("dropping request {} as processor is stopped", request);
            return;
        }

        debug!(
            "adding request {}, pending requests: {}",
            request,
            self.registry().len()
        );

        if request.is_cancelled() {
            if let Some(existing) = self.registry().find_request(request.key()) {
                existing.cancel();
                // covers an entry whose owner has not installed its callback yet
                self.progress.notify_cancellation(&existing);
                return;
            }
        }

        match self.registry().register(&request, &listeners) {
            Registration::Aggregated => {
                debug!("request {} already in flight, aggregated", request);
                self.progress.notify_aggregated(&request, &listeners);
                return;
            }
            Registration::Added => {
                debug!("added entry for {}", request.key());
                self.progress.notify_added(&request, &listeners);
            }
            Registration::Unprocessable => {
                self.progress.notify_not_found(&request, &listeners);
                self.progress.notify_processed(&request, &listeners);
                return;
            }
        }

        let progress = Arc::downgrade(&self.progress);
        let on_cancel = move |cancelled: &CachedRequest| {
            if let Some(progress) = progress.upgrade() {
                progress.notify_cancellation(cancelled);
            }
        };
        let installed = request.set_cancellation_callback(Box::new(on_cancel));
        if !installed {
            debug!("{} resubmitted, keeping its cancellation callback", request);
        }

        // cancelled between registration and here
        if request.is_cancelled() {
            if !request.fire_cancellation() {
                self.progress.notify_cancellation(&request);
            }
            return;
        }

        self.runner.execute_request(request);
    }

    /// Detach these listeners from the in-flight request; they will not hear its outcome.
    pub fn dont_notify_listeners_for(&self, request: &CachedRequest, listeners: &[ListenerRef]) {
        self.progress.dont_notify_listeners_for(request, listeners);
    }

    pub fn remove_data_from_cache(&self, data_type: &DataType, cache_key: &str) -> bool {
        self.cache_manager.delete(data_type, cache_key)
    }

    pub fn remove_all_data_from_cache_of(&self, data_type: &DataType) {
        self.cache_manager.delete_all(data_type);
    }

    pub fn remove_all_data_from_cache(&self) {
        self.cache_manager.clear_all();
    }

    pub fn is_fail_on_cache_error(&self) -> bool {
        self.runner.is_fail_on_cache_error()
    }

    pub fn set_fail_on_cache_error(&self, fail_on_cache_error: bool) {
        self.runner.set_fail_on_cache_error(fail_on_cache_error);
    }

    pub fn add_service_listener(&self, listener: Arc<dyn ServiceListener>) {
        self.progress.add_service_listener(listener);
    }

    pub fn remove_service_listener(&self, listener: &Arc<dyn ServiceListener>) {
        self.progress.remove_service_listener(listener);
    }

    /// refuse further submissions and tell the runner to stop taking work
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        self.runner.should_stop();
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    pub fn pending_request_count(&self) -> usize {
        self.registry().len()
    }
}

impl fmt::Display for RequestProcessor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let summary = self.registry().summary();
        write!(f, "[RequestProcessor : request count= {}", summary.len())?;
        write!(f, ", listeners per requests = [")?;
        for (n, (key, listeners)) in summary.iter().enumerate() {
            if n > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{} --> {}", key, listeners)?;
        }
        write!(f, "]]")
    }
}
