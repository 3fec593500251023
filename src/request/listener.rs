//! listener contracts: per-request listeners and service-wide observers

use std::marker::PhantomData;
use std::sync::Arc;

use async_channel::{Receiver, Sender};
use log::*;
use serde::{Deserialize, Serialize};

use super::cached_request::RequestKey;
use crate::error::Error;
use crate::persistence::CacheValue;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RequestStatus {
    Pending,
    ReadingFromCache,
    LoadingFromNetwork,
    WritingToCache,
    Complete,
}

/// What every listener of a request identity receives when it finishes.
#[derive(Clone)]
pub enum Outcome {
    Success(CacheValue),
    Failure(Arc<Error>),
    Cancelled,
}

impl std::fmt::Debug for Outcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Outcome::Success(_) => f.write_str("Success"),
            Outcome::Failure(e) => write!(f, "Failure({})", e),
            Outcome::Cancelled => f.write_str("Cancelled"),
        }
    }
}

pub trait RequestListener: Send + Sync {
    fn on_outcome(&self, outcome: &Outcome);

    fn on_progress(&self, _status: RequestStatus) {}

    /// called for pending-only requests when nothing with that identity is in flight
    fn on_not_found(&self) {}
}

pub type ListenerRef = Arc<dyn RequestListener>;

// listeners are unique by instance, not by value
pub(crate) fn same_listener(a: &ListenerRef, b: &ListenerRef) -> bool {
    std::ptr::eq(Arc::as_ptr(a) as *const (), Arc::as_ptr(b) as *const ())
}

pub type TypedOutcome<T> = std::result::Result<Arc<T>, Arc<Error>>;

/// Forwards the outcome of a request to a channel as a typed result.
pub struct ChannelListener<T> {
    tx: Sender<TypedOutcome<T>>,
    progress_tx: Option<Sender<RequestStatus>>,
    _marker: PhantomData<fn() -> T>,
}

impl<T: Send + Sync + 'static> ChannelListener<T> {
    pub fn new() -> (Arc<ChannelListener<T>>, Receiver<TypedOutcome<T>>) {
        let (tx, rx) = async_channel::unbounded();
        let listener = ChannelListener {
            tx,
            progress_tx: None,
            _marker: PhantomData,
        };
        (Arc::new(listener), rx)
    }

    /// also forward progress updates
    pub fn with_progress() -> (
        Arc<ChannelListener<T>>,
        Receiver<TypedOutcome<T>>,
        Receiver<RequestStatus>,
    ) {
        let (tx, rx) = async_channel::unbounded();
        let (progress_tx, progress_rx) = async_channel::unbounded();
        let listener = ChannelListener {
            tx,
            progress_tx: Some(progress_tx),
            _marker: PhantomData,
        };
        (Arc::new(listener), rx, progress_rx)
    }

    fn send(&self, outcome: TypedOutcome<T>) {
        if self.tx.try_send(outcome).is_err() {
            warn!("outcome receiver for {} dropped", std::any::type_name::<T>());
        }
    }
}

impl<T: Send + Sync + 'static> RequestListener for ChannelListener<T> {
    fn on_outcome(&self, outcome: &Outcome) {
        let typed = match outcome {
            Outcome::Success(value) => value.clone().downcast::<T>().map_err(|_| {
                Arc::new(Error::TypeMismatch {
                    expected: std::any::type_name::<T>(),
                })
            }),
            Outcome::Failure(e) => Err(e.clone()),
            Outcome::Cancelled => Err(Arc::new(Error::Cancelled)),
        };
        self.send(typed);
    }

    fn on_progress(&self, status: RequestStatus) {
        if let Some(tx) = &self.progress_tx {
            let _ = tx.try_send(status);
        }
    }

    fn on_not_found(&self) {
        self.send(Err(Arc::new(Error::NotPending)));
    }
}

/// Structured events emitted to service listeners as requests move through the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceEvent {
    Added(RequestKey),
    Aggregated(RequestKey),
    NotFound(RequestKey),
    Progress(RequestKey, RequestStatus),
    Succeeded(RequestKey),
    Failed(RequestKey),
    Cancelled(RequestKey),
    Processed(RequestKey),
}

pub trait ServiceListener: Send + Sync {
    fn on_event(&self, event: &ServiceEvent);
}
