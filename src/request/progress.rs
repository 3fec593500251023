//! Listener notification and service events.
//!
//! The progress manager shares the listener registry with the processor and
//! owns the completion path: close the entry, notify every listener in the
//! snapshot, then evict.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, RwLock};

use log::*;

use super::cached_request::CachedRequest;
use super::listener::{ListenerRef, Outcome, RequestStatus, ServiceEvent, ServiceListener};
use super::registry::ListenerRegistry;
use crate::error::Error;
use crate::persistence::CacheValue;
use crate::sync::{read, write};

pub struct RequestProgressManager {
    registry: Arc<ListenerRegistry>,
    service_listeners: RwLock<Vec<Arc<dyn ServiceListener>>>,
}

impl RequestProgressManager {
    pub fn new(registry: Arc<ListenerRegistry>) -> RequestProgressManager {
        RequestProgressManager {
            registry,
            service_listeners: RwLock::new(vec![]),
        }
    }

    pub fn registry(&self) -> &Arc<ListenerRegistry> {
        &self.registry
    }

    pub fn add_service_listener(&self, listener: Arc<dyn ServiceListener>) {
        write(&self.service_listeners).push(listener);
    }

    pub fn remove_service_listener(&self, listener: &Arc<dyn ServiceListener>) {
        write(&self.service_listeners).retain(|l| {
            !std::ptr::eq(
                Arc::as_ptr(l) as *const (),
                Arc::as_ptr(listener) as *const (),
            )
        });
    }

    pub fn notify_added(&self, request: &CachedRequest, listeners: &[ListenerRef]) {
        for listener in listeners {
            guarded(|| listener.on_progress(RequestStatus::Pending));
        }
        self.emit(ServiceEvent::Added(request.key().clone()));
    }

    pub fn notify_aggregated(&self, request: &CachedRequest, listeners: &[ListenerRef]) {
        for listener in listeners {
            guarded(|| listener.on_progress(RequestStatus::Pending));
        }
        self.emit(ServiceEvent::Aggregated(request.key().clone()));
    }

    pub fn notify_not_found(&self, request: &CachedRequest, listeners: &[ListenerRef]) {
        for listener in listeners {
            guarded(|| listener.on_not_found());
        }
        self.emit(ServiceEvent::NotFound(request.key().clone()));
    }

    pub fn notify_processed(&self, request: &CachedRequest, _listeners: &[ListenerRef]) {
        self.emit(ServiceEvent::Processed(request.key().clone()));
    }

    /// progress for every listener of the entry `request` owns
    pub fn notify_progress(&self, request: &CachedRequest, status: RequestStatus) {
        for listener in self.registry.listeners(request) {
            guarded(|| listener.on_progress(status));
        }
        self.emit(ServiceEvent::Progress(request.key().clone(), status));
    }

    pub fn notify_success(&self, request: &CachedRequest, value: CacheValue) -> bool {
        let event = ServiceEvent::Succeeded(request.key().clone());
        self.complete(request, Outcome::Success(value), event)
    }

    pub fn notify_failure(&self, request: &CachedRequest, error: Error) -> bool {
        debug!("request {} failed: {}", request, error);
        let event = ServiceEvent::Failed(request.key().clone());
        self.complete(request, Outcome::Failure(Arc::new(error)), event)
    }

    pub fn notify_cancellation(&self, request: &CachedRequest) -> bool {
        let event = ServiceEvent::Cancelled(request.key().clone());
        self.complete(request, Outcome::Cancelled, event)
    }

    /// Stop notifying these listeners about the in-flight request with this identity.
    pub fn dont_notify_listeners_for(&self, request: &CachedRequest, listeners: &[ListenerRef]) {
        self.registry.remove_listeners(request.key(), listeners);
    }

    // close, notify the snapshot, evict; false if `request` owns no open entry
    fn complete(&self, request: &CachedRequest, outcome: Outcome, event: ServiceEvent) -> bool {
        let key = request.key();
        let (entry, listeners) = match self.registry.close(request) {
            Some(closed) => closed,
            None => {
                debug!("no open entry owned by {}, {:?} dropped", request, outcome);
                return false;
            }
        };

        for listener in listeners.iter() {
            guarded(|| {
                listener.on_progress(RequestStatus::Complete);
                listener.on_outcome(&outcome);
            });
        }

        self.registry.evict(key, &entry);
        debug!(
            "{} finished with {:?}, {} listeners notified",
            key,
            outcome,
            listeners.len()
        );

        self.emit(event);
        self.emit(ServiceEvent::Processed(key.clone()));

        true
    }

    fn emit(&self, event: ServiceEvent) {
        let listeners = read(&self.service_listeners).clone();
        for listener in listeners {
            guarded(|| listener.on_event(&event));
        }
    }
}

// one listener panicking must not stop the others or the eviction
fn guarded<F: FnOnce()>(f: F) {
    if catch_unwind(AssertUnwindSafe(f)).is_err() {
        error!("listener panicked during notification");
    }
}
