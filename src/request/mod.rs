//! request submission, aggregation and execution.
//!
//! A submitted [`CachedRequest`] either joins an identical request already in
//! flight or becomes a new registry entry handed to a [`RequestRunner`].  When
//! it finishes, every listener registered for its identity hears the outcome
//! once and the entry is evicted.

pub mod cached_request;
pub mod listener;
pub mod processor;
pub mod progress;
pub mod registry;
pub mod runner;

pub use cached_request::{CachedRequest, Request, RequestKey};
pub use listener::{
    ChannelListener, ListenerRef, Outcome, RequestListener, RequestStatus, ServiceEvent,
    ServiceListener, TypedOutcome,
};
pub use processor::RequestProcessor;
pub use progress::RequestProgressManager;
pub use registry::ListenerRegistry;
pub use runner::{DefaultRequestRunner, RequestRunner};
