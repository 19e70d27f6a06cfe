//! Per-run context handed to task code.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use crate::action::{Action, ActionKey};
use crate::cancellation::{CancellationReason, CancellationToken};
use crate::durable::{DurableConditions, DurableServices};
use crate::engine::DurableEvent;
use crate::error::DurableError;

/// Immutable view of one run plus its cancellation token.
///
/// Shared as `Arc<Context>` between the task, the supervisor and, for
/// blocking tasks, the pool thread.
pub struct Context {
    action: Action,
    key: ActionKey,
    token: CancellationToken,
    durable: Option<DurableServices>,
    wait_counter: AtomicU32,
}

impl Context {
    pub fn new(action: Action, token: CancellationToken) -> Self {
        let key = action.key();
        Self {
            action,
            key,
            token,
            durable: None,
            wait_counter: AtomicU32::new(0),
        }
    }

    /// Attach the durable services used by [`Context::wait_for`].
    pub fn with_durable(mut self, durable: DurableServices) -> Self {
        self.durable = Some(durable);
        self
    }

    pub fn action(&self) -> &Action {
        &self.action
    }

    /// Run input payload.
    pub fn input(&self) -> &serde_json::Value {
        &self.action.action_payload
    }

    pub fn additional_metadata(&self) -> &serde_json::Value {
        &self.action.additional_metadata
    }

    pub fn key(&self) -> &ActionKey {
        &self.key
    }

    pub fn run_id(&self) -> &str {
        &self.key.run_id
    }

    pub fn workflow_run_id(&self) -> &str {
        &self.action.workflow_run_id
    }

    pub fn retry_count(&self) -> i32 {
        self.key.retry_count
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn cancellation_reason(&self) -> Option<CancellationReason> {
        self.token.reason()
    }

    /// Resolve once the run is cancelled.
    pub async fn cancelled(&self) {
        self.token.cancelled().await
    }

    /// Block the calling thread until cancelled or `timeout` elapses.
    pub fn wait_cancelled(&self, timeout: Duration) -> bool {
        self.token.wait(timeout)
    }

    pub fn is_durable(&self) -> bool {
        self.durable.is_some()
    }

    /// Suspend until the engine signals `signal_key` under `conditions`.
    ///
    /// The run is marked as waiting while suspended, which makes it eligible
    /// for eviction.
    pub async fn wait_for(
        &self,
        signal_key: &str,
        conditions: DurableConditions,
    ) -> Result<DurableEvent, DurableError> {
        let durable = self.durable.as_ref().ok_or(DurableError::NotDurable)?;
        let task_id = self.run_id();

        // Subscribe before registering so an immediate signal is not lost.
        let subscription = durable.listener.subscribe(task_id, signal_key);
        durable
            .listener
            .register_durable_wait(task_id, signal_key, conditions)
            .await?;

        durable.eviction.mark_waiting(&self.key).await;
        tracing::debug!(run_id = %self.key, signal_key, "Run suspended in durable wait");

        let result = tokio::select! {
            event = subscription.recv() => event,
            _ = self.token.cancelled() => Err(DurableError::Cancelled(
                self.token.reason().unwrap_or(CancellationReason::UserRequested),
            )),
        };

        durable.eviction.mark_active(&self.key).await;
        result
    }

    /// Durable sleep. The timer runs on the engine.
    pub async fn sleep_for(&self, duration: Duration) -> Result<DurableEvent, DurableError> {
        let signal_key = self.next_signal_key("sleep");
        self.wait_for(&signal_key, DurableConditions::sleep(duration))
            .await
    }

    /// Wait for a user event with `event_key`.
    pub async fn wait_for_event(&self, event_key: &str) -> Result<DurableEvent, DurableError> {
        let signal_key = self.next_signal_key("event");
        self.wait_for(&signal_key, DurableConditions::user_event(event_key))
            .await
    }

    /// Signal keys are numbered per run so a replayed run derives the same keys.
    fn next_signal_key(&self, kind: &str) -> String {
        let n = self.wait_counter.fetch_add(1, Ordering::SeqCst);
        format!("{kind}:{n}")
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("key", &self.key)
            .field("action_id", &self.action.action_id)
            .field("durable", &self.durable.is_some())
            .field("token", &self.token)
            .finish()
    }
}
