//! Durable waits: the shared durable event stream and durable slot admission.

pub mod conditions;
pub mod events;
pub mod eviction;

use std::sync::Arc;

pub use conditions::{DurableConditions, WaitCondition};
pub use events::{DurableEventListener, Subscription};
pub use eviction::{DurableEvictionManager, DurableRunRecord, EvictionPolicy};

/// Handles a durable run uses to suspend and resume.
#[derive(Clone)]
pub struct DurableServices {
    pub listener: Arc<DurableEventListener>,
    pub eviction: Arc<DurableEvictionManager>,
}
