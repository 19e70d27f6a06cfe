//! In-memory engine for tests and local runs.
//!
//! Records every call and lets the caller push actions, durable events and
//! scripted failures into the open streams.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::{Notify, mpsc};
use tokio_stream::wrappers::UnboundedReceiverStream;

use super::{
    ActionStream, DurableEvent, DurableEventStream, DurableListenRequest, DurableRequestStream,
    DurableWaitRequest, EngineClient, EvictionRequest, ProtocolVersion, WorkerRegistration,
};
use crate::action::{Action, ActionEvent, ActionEventType};
use crate::error::EngineError;

type ActionSender = mpsc::UnboundedSender<Result<Action, EngineError>>;
type DurableSender = mpsc::UnboundedSender<Result<DurableEvent, EngineError>>;

#[derive(Default)]
struct State {
    registrations: Vec<WorkerRegistration>,
    listen_calls: Vec<ProtocolVersion>,
    v2_unimplemented: bool,
    connect_errors: VecDeque<EngineError>,
    action_tx: Option<ActionSender>,
    pending_actions: VecDeque<Result<Action, EngineError>>,
    heartbeats: usize,
    heartbeat_error: Option<EngineError>,
    unsubscribes: Vec<String>,
    events: Vec<ActionEvent>,
    event_errors: VecDeque<EngineError>,
    durable_waits: Vec<DurableWaitRequest>,
    durable_connections: Vec<Arc<Mutex<Vec<DurableListenRequest>>>>,
    durable_tx: Option<DurableSender>,
    evictions: Vec<EvictionRequest>,
    eviction_error: Option<EngineError>,
    eviction_delay: Duration,
    restores: Vec<String>,
}

/// Engine that keeps everything in memory.
#[derive(Clone, Default)]
pub struct MemoryEngine {
    state: Arc<Mutex<State>>,
    changed: Arc<Notify>,
}

impl MemoryEngine {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn touch(&self) {
        self.changed.notify_waiters();
    }

    // ── Scripting ───────────────────────────────────────────────────

    /// Make `listen_v2` answer "unimplemented".
    pub fn disable_v2(&self) {
        self.state().v2_unimplemented = true;
    }

    /// Fail the next connection attempt with `err`.
    pub fn fail_next_connect(&self, err: EngineError) {
        self.state().connect_errors.push_back(err);
    }

    /// Deliver an action on the open stream, or on the next one if none is open.
    pub fn push_action(&self, action: Action) {
        let mut state = self.state();
        let open = state.action_tx.as_ref().filter(|tx| !tx.is_closed());
        match open {
            Some(tx) => {
                let _ = tx.send(Ok(action));
            }
            None => state.pending_actions.push_back(Ok(action)),
        }
    }

    /// Terminate the open action stream with `err`.
    pub fn fail_action_stream(&self, err: EngineError) {
        if let Some(tx) = self.state().action_tx.take() {
            let _ = tx.send(Err(err));
        }
    }

    /// Make every heartbeat fail with `err` (`None` restores success).
    pub fn set_heartbeat_error(&self, err: Option<EngineError>) {
        self.state().heartbeat_error = err;
    }

    /// Fail the next lifecycle event submission with `err`.
    pub fn fail_next_event(&self, err: EngineError) {
        self.state().event_errors.push_back(err);
    }

    /// Deliver an event on the open durable stream.
    pub fn emit_durable_event(&self, event: DurableEvent) -> bool {
        match &self.state().durable_tx {
            Some(tx) => tx.send(Ok(event)).is_ok(),
            None => false,
        }
    }

    /// Terminate the open durable stream with `err`.
    pub fn fail_durable_stream(&self, err: EngineError) {
        if let Some(tx) = self.state().durable_tx.take() {
            let _ = tx.send(Err(err));
        }
    }

    /// Refuse every eviction with `err` (`None` restores acknowledgement).
    pub fn set_eviction_error(&self, err: Option<EngineError>) {
        self.state().eviction_error = err;
    }

    /// Hold every eviction acknowledgement for `delay`.
    pub fn set_eviction_delay(&self, delay: Duration) {
        self.state().eviction_delay = delay;
    }

    // ── Inspection ──────────────────────────────────────────────────

    pub fn registrations(&self) -> Vec<WorkerRegistration> {
        self.state().registrations.clone()
    }

    pub fn listen_calls(&self) -> Vec<ProtocolVersion> {
        self.state().listen_calls.clone()
    }

    pub fn heartbeat_count(&self) -> usize {
        self.state().heartbeats
    }

    pub fn unsubscribes(&self) -> Vec<String> {
        self.state().unsubscribes.clone()
    }

    pub fn events(&self) -> Vec<ActionEvent> {
        self.state().events.clone()
    }

    /// Event types recorded for `run_id`, in submission order.
    pub fn event_types_for(&self, run_id: &str) -> Vec<ActionEventType> {
        self.state()
            .events
            .iter()
            .filter(|e| e.action.step_run_id == run_id)
            .map(|e| e.event_type)
            .collect()
    }

    pub fn durable_waits(&self) -> Vec<DurableWaitRequest> {
        self.state().durable_waits.clone()
    }

    /// Frames received on each durable stream, one entry per connection.
    pub fn durable_frames(&self) -> Vec<Vec<DurableListenRequest>> {
        self.state()
            .durable_connections
            .iter()
            .map(|frames| {
                frames
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner())
                    .clone()
            })
            .collect()
    }

    pub fn evictions(&self) -> Vec<EvictionRequest> {
        self.state().evictions.clone()
    }

    pub fn restores(&self) -> Vec<String> {
        self.state().restores.clone()
    }

    /// Wait until `predicate` holds for the recorded state or `timeout` elapses.
    pub async fn wait_until<F>(&self, timeout: Duration, mut predicate: F) -> bool
    where
        F: FnMut(&MemoryEngine) -> bool,
    {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let changed = self.changed.notified();
            if predicate(self) {
                return true;
            }
            // Notifications cover most changes; the poll interval covers the rest.
            let tick = tokio::time::sleep(Duration::from_millis(5));
            tokio::select! {
                _ = changed => {}
                _ = tick => {}
                _ = tokio::time::sleep_until(deadline) => return predicate(self),
            }
        }
    }

    fn open_action_stream(&self, version: ProtocolVersion) -> ActionStream {
        let (tx, rx) = mpsc::unbounded_channel();
        {
            let mut state = self.state();
            state.listen_calls.push(version);
            for pending in state.pending_actions.drain(..) {
                let _ = tx.send(pending);
            }
            state.action_tx = Some(tx);
        }
        self.touch();
        Box::pin(UnboundedReceiverStream::new(rx))
    }
}

#[async_trait]
impl EngineClient for MemoryEngine {
    async fn register_worker(
        &self,
        registration: &WorkerRegistration,
    ) -> Result<String, EngineError> {
        self.state().registrations.push(registration.clone());
        self.touch();
        Ok(format!("worker-{}", uuid::Uuid::new_v4()))
    }

    async fn listen_v2(&self, _worker_id: &str) -> Result<ActionStream, EngineError> {
        {
            let mut state = self.state();
            if state.v2_unimplemented {
                state.listen_calls.push(ProtocolVersion::V2);
                return Err(EngineError::unimplemented("ListenV2 is not implemented"));
            }
            if let Some(err) = state.connect_errors.pop_front() {
                state.listen_calls.push(ProtocolVersion::V2);
                return Err(err);
            }
        }
        Ok(self.open_action_stream(ProtocolVersion::V2))
    }

    async fn listen_v1(&self, _worker_id: &str) -> Result<ActionStream, EngineError> {
        let err = {
            let mut state = self.state();
            let err = state.connect_errors.pop_front();
            if err.is_some() {
                state.listen_calls.push(ProtocolVersion::V1);
            }
            err
        };
        if let Some(err) = err {
            return Err(err);
        }
        Ok(self.open_action_stream(ProtocolVersion::V1))
    }

    async fn heartbeat(&self, _worker_id: &str) -> Result<(), EngineError> {
        let result = {
            let mut state = self.state();
            state.heartbeats += 1;
            match &state.heartbeat_error {
                Some(err) => Err(err.clone()),
                None => Ok(()),
            }
        };
        self.touch();
        result
    }

    async fn unsubscribe(&self, worker_id: &str) -> Result<(), EngineError> {
        self.state().unsubscribes.push(worker_id.to_string());
        self.touch();
        Ok(())
    }

    async fn send_action_event(&self, event: &ActionEvent) -> Result<(), EngineError> {
        {
            let mut state = self.state();
            if let Some(err) = state.event_errors.pop_front() {
                return Err(err);
            }
            state.events.push(event.clone());
        }
        self.touch();
        Ok(())
    }

    async fn register_durable_wait(
        &self,
        request: &DurableWaitRequest,
    ) -> Result<(), EngineError> {
        self.state().durable_waits.push(request.clone());
        self.touch();
        Ok(())
    }

    async fn listen_durable_events(
        &self,
        mut requests: DurableRequestStream,
    ) -> Result<DurableEventStream, EngineError> {
        let frames = Arc::new(Mutex::new(Vec::new()));
        let (tx, rx) = mpsc::unbounded_channel();
        {
            let mut state = self.state();
            state.durable_connections.push(Arc::clone(&frames));
            state.durable_tx = Some(tx);
        }

        let changed = Arc::clone(&self.changed);
        tokio::spawn(async move {
            while let Some(frame) = requests.next().await {
                frames
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner())
                    .push(frame);
                changed.notify_waiters();
            }
        });

        self.touch();
        Ok(Box::pin(UnboundedReceiverStream::new(rx)))
    }

    async fn evict_task(&self, request: &EvictionRequest) -> Result<(), EngineError> {
        let delay = self.state().eviction_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let result = {
            let mut state = self.state();
            match &state.eviction_error {
                Some(err) => Err(err.clone()),
                None => {
                    state.evictions.push(request.clone());
                    Ok(())
                }
            }
        };
        self.touch();
        result
    }

    async fn restore_task(&self, step_run_id: &str) -> Result<(), EngineError> {
        self.state().restores.push(step_run_id.to_string());
        self.touch();
        Ok(())
    }
}
