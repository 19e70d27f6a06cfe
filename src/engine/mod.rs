//! Boundary to the remote orchestration engine.
//!
//! The runtime only talks to the engine through [`EngineClient`]. Transports
//! implement it; [`memory::MemoryEngine`] is an in-process implementation used
//! by tests and local runs.

pub mod memory;

use std::collections::HashMap;
use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};

use crate::action::{Action, ActionEvent};
use crate::durable::conditions::DurableConditions;
use crate::error::EngineError;

pub use memory::MemoryEngine;

/// Stream of assigned actions.
pub type ActionStream = Pin<Box<dyn Stream<Item = Result<Action, EngineError>> + Send>>;

/// Outbound request frames on the durable event stream.
pub type DurableRequestStream = Pin<Box<dyn Stream<Item = DurableListenRequest> + Send>>;

/// Inbound durable events.
pub type DurableEventStream =
    Pin<Box<dyn Stream<Item = Result<DurableEvent, EngineError>> + Send>>;

/// Action stream protocol generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProtocolVersion {
    /// Legacy unary-timeout stream without heartbeats.
    V1,
    /// Long-lived stream with in-band heartbeats.
    V2,
}

/// Identity and capacity announced when the worker registers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerRegistration {
    pub worker_name: String,
    /// Registered action names.
    pub actions: Vec<String>,
    /// Retry budget declared by each registered action.
    #[serde(default)]
    pub retries: HashMap<String, u32>,
    pub slots: usize,
    pub durable_slots: usize,
    pub labels: HashMap<String, String>,
}

/// Registers a durable wait with the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DurableWaitRequest {
    pub task_id: String,
    pub signal_key: String,
    pub conditions: DurableConditions,
}

/// Frame sent on the shared durable event stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DurableListenRequest {
    pub task_id: String,
    pub signal_key: String,
    /// Set on frames replayed after a reconnect.
    pub resubscribe: bool,
}

/// Event delivered for a `(task_id, signal_key)` pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DurableEvent {
    pub task_id: String,
    pub signal_key: String,
    pub data: serde_json::Value,
}

/// Asks the engine to acknowledge eviction of a durable run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvictionRequest {
    pub step_run_id: String,
    pub retry_count: i32,
    pub reason: String,
}

/// Remote orchestration engine as seen by the worker runtime.
#[async_trait]
pub trait EngineClient: Send + Sync {
    /// Register this worker; returns the engine-assigned worker id.
    async fn register_worker(&self, registration: &WorkerRegistration)
    -> Result<String, EngineError>;

    /// Open the v2 action stream (supports heartbeats).
    async fn listen_v2(&self, worker_id: &str) -> Result<ActionStream, EngineError>;

    /// Open the legacy v1 action stream (server-side timeout, no heartbeats).
    async fn listen_v1(&self, worker_id: &str) -> Result<ActionStream, EngineError>;

    async fn heartbeat(&self, worker_id: &str) -> Result<(), EngineError>;

    /// Deregister the worker.
    async fn unsubscribe(&self, worker_id: &str) -> Result<(), EngineError>;

    /// Submit a lifecycle event.
    async fn send_action_event(&self, event: &ActionEvent) -> Result<(), EngineError>;

    async fn register_durable_wait(&self, request: &DurableWaitRequest)
    -> Result<(), EngineError>;

    /// Open the bidirectional durable event stream.
    async fn listen_durable_events(
        &self,
        requests: DurableRequestStream,
    ) -> Result<DurableEventStream, EngineError>;

    /// Round-trip acknowledgement before a durable run is evicted locally.
    async fn evict_task(&self, request: &EvictionRequest) -> Result<(), EngineError>;

    /// Requeue an evicted task at the highest priority.
    async fn restore_task(&self, step_run_id: &str) -> Result<(), EngineError>;
}
