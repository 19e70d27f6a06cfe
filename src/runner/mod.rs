//! Execution core.
//!
//! The [`Runner`] owns the in-flight run map and is driven by a single
//! dispatch loop: actions arrive on the inbound queue, lifecycle events leave
//! on the outbound queue, and finished runs report back over an internal
//! channel so the map never needs a lock.

pub mod context;
pub mod output;
pub mod pool;
pub(crate) mod supervisor;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinError;
use tracing::Instrument;

use crate::action::{Action, ActionEvent, ActionKey, ActionType};
use crate::cancellation::{CancellationReason, CancellationToken};
use crate::config::RunnerConfig;
use crate::durable::DurableServices;
use crate::error::TaskError;
use crate::tasks::{Task, TaskOutput, TaskRegistry};

pub use context::Context;
pub use output::{serialize_output, validate_output};
pub use pool::{BlockingPool, SlotHandle};

use supervisor::RunState;

struct InFlight {
    state: Arc<RunState>,
}

/// Runs actions and reports their lifecycle.
pub struct Runner {
    registry: Arc<TaskRegistry>,
    config: RunnerConfig,
    pool: BlockingPool,
    durable: Option<DurableServices>,
    events: mpsc::Sender<ActionEvent>,
    runs: HashMap<ActionKey, InFlight>,
    finished_tx: mpsc::UnboundedSender<ActionKey>,
    finished_rx: mpsc::UnboundedReceiver<ActionKey>,
}

impl Runner {
    pub fn new(
        registry: Arc<TaskRegistry>,
        config: RunnerConfig,
        slots: usize,
        events: mpsc::Sender<ActionEvent>,
    ) -> Self {
        let (finished_tx, finished_rx) = mpsc::unbounded_channel();
        Self {
            registry,
            config,
            pool: BlockingPool::new(slots),
            durable: None,
            events,
            runs: HashMap::new(),
            finished_tx,
            finished_rx,
        }
    }

    /// Enable durable tasks.
    pub fn with_durable(mut self, durable: DurableServices) -> Self {
        self.durable = Some(durable);
        self
    }

    /// Number of runs in flight.
    pub fn in_flight(&self) -> usize {
        self.runs.len()
    }

    pub fn pool(&self) -> &BlockingPool {
        &self.pool
    }

    /// Dispatch loop. Runs until the inbound queue closes or `shutdown` is
    /// cancelled, then drains in-flight runs for up to `drain_timeout`.
    pub async fn run(
        mut self,
        mut actions: mpsc::Receiver<Action>,
        shutdown: CancellationToken,
        drain_timeout: Duration,
    ) {
        tracing::info!(slots = self.pool.size(), "Runner started");
        loop {
            tokio::select! {
                action = actions.recv() => match action {
                    Some(action) => self.dispatch(action).await,
                    None => {
                        tracing::info!("Action queue closed");
                        break;
                    }
                },
                Some(key) = self.finished_rx.recv() => self.finish(&key),
                _ = shutdown.cancelled() => break,
            }
        }
        drop(actions);
        self.drain(drain_timeout).await;
        tracing::info!("Runner stopped");
    }

    /// Handle one action.
    pub async fn dispatch(&mut self, action: Action) {
        match action.action_type {
            ActionType::StartRun | ActionType::StartDurable => self.start_run(action).await,
            ActionType::CancelRun => self.cancel_run(&action),
        }
    }

    async fn start_run(&mut self, action: Action) {
        let key = action.key();
        if self.runs.contains_key(&key) {
            tracing::warn!(run_id = %key, "Ignoring duplicate start for a run already in flight");
            return;
        }

        let task = match self.registry.get(&action.action_id) {
            Ok(task) => task,
            Err(e) => {
                tracing::error!(run_id = %key, action_id = %action.action_id, "No task registered");
                let _ = self
                    .events
                    .send(ActionEvent::failed(&action, e.to_string(), true))
                    .await;
                return;
            }
        };

        let token = CancellationToken::new();
        let mut ctx = Context::new(action.clone(), token.clone());
        let durable = if task.is_durable() {
            self.durable.clone()
        } else {
            None
        };
        if let Some(services) = &durable {
            ctx = ctx.with_durable(services.clone());
        }

        let state = Arc::new(RunState::new(action.clone(), token, task.is_blocking()));

        tracing::info!(run_id = %key, task = %task.name(), "Starting run");
        if self.events.send(ActionEvent::started(&action)).await.is_err() {
            tracing::warn!(run_id = %key, "Event queue closed, not starting run");
            return;
        }

        tokio::spawn(supervisor::supervise(
            Arc::clone(&state),
            self.config.clone(),
            self.events.clone(),
        ));

        let span = tracing::info_span!(
            "run",
            run_id = %key.run_id,
            retry_count = key.retry_count,
            task = %task.name()
        );
        let execution = execute(Execution {
            state: Arc::clone(&state),
            task,
            ctx: Arc::new(ctx),
            pool: self.pool.clone(),
            durable,
            events: self.events.clone(),
            span: span.clone(),
        });
        let finished = self.finished_tx.clone();
        tokio::spawn(
            async move {
                execution.await;
                let _ = finished.send(key);
            }
            .instrument(span),
        );

        self.runs.insert(action.key(), InFlight { state });
    }

    fn cancel_run(&mut self, action: &Action) {
        let key = action.key();
        let Some(run) = self.runs.get(&key) else {
            tracing::debug!(run_id = %key, "Cancel for unknown run ignored");
            return;
        };
        let reason = cancel_reason(action);
        if run.state.token.cancel(reason) {
            tracing::info!(run_id = %key, %reason, "Run cancelled");
        }
    }

    fn finish(&mut self, key: &ActionKey) {
        if self.runs.remove(key).is_some() {
            tracing::debug!(run_id = %key, in_flight = self.runs.len(), "Run finished");
        }
    }

    /// Wait for in-flight runs, then cancel whatever is left.
    async fn drain(&mut self, timeout: Duration) {
        if self.runs.is_empty() {
            return;
        }
        tracing::info!(in_flight = self.runs.len(), "Draining in-flight runs");
        if !self.wait_for_runs(timeout).await {
            tracing::warn!(
                in_flight = self.runs.len(),
                "Drain timed out, cancelling remaining runs"
            );
            for run in self.runs.values() {
                run.state.token.cancel(CancellationReason::WorkerShutdown);
            }
            let grace = self.config.cancellation_grace_period + Duration::from_millis(100);
            self.wait_for_runs(grace).await;
        }
    }

    async fn wait_for_runs(&mut self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        while !self.runs.is_empty() {
            tokio::select! {
                Some(key) = self.finished_rx.recv() => self.finish(&key),
                _ = tokio::time::sleep_until(deadline) => return false,
            }
        }
        true
    }
}

/// `CANCEL_RUN` payloads may name a reason; default is workflow cancellation.
fn cancel_reason(action: &Action) -> CancellationReason {
    action
        .action_payload
        .get("reason")
        .and_then(|reason| serde_json::from_value(reason.clone()).ok())
        .unwrap_or(CancellationReason::WorkflowCancelled)
}

struct Execution {
    state: Arc<RunState>,
    task: Arc<dyn Task>,
    ctx: Arc<Context>,
    pool: BlockingPool,
    durable: Option<DurableServices>,
    events: mpsc::Sender<ActionEvent>,
    span: tracing::Span,
}

/// How a run's body ended.
enum Outcome {
    Returned(Result<TaskOutput, TaskError>),
    Panicked(String),
    Aborted,
}

impl From<Result<Result<TaskOutput, TaskError>, JoinError>> for Outcome {
    fn from(joined: Result<Result<TaskOutput, TaskError>, JoinError>) -> Self {
        match joined {
            Ok(result) => Self::Returned(result),
            Err(e) if e.is_panic() => Self::Panicked(panic_message(e.into_panic())),
            Err(_) => Self::Aborted,
        }
    }
}

async fn execute(exec: Execution) {
    let Execution {
        state,
        task,
        ctx,
        pool,
        durable,
        events,
        span,
    } = exec;
    let key = ctx.key().clone();

    if let Some(services) = &durable {
        let admitted = services
            .eviction
            .register_run(key.clone(), ctx.token().clone(), task.eviction_policy())
            .await;
        if let Err(e) = admitted {
            tracing::info!(run_id = %key, error = %e, "Durable run not admitted");
            let event = completion_event(&state.action, &state.token, Outcome::Returned(Err(e.into())));
            state.emit_terminal(event, &events).await;
            return;
        }
    }

    let outcome = if task.is_blocking() {
        run_blocking(&state, task, Arc::clone(&ctx), &pool, span).await
    } else {
        let handle = tokio::spawn({
            let ctx = Arc::clone(&ctx);
            async move { task.call(ctx).await }.instrument(span)
        });
        state.set_abort_handle(handle.abort_handle());
        handle.await.into()
    };

    let event = completion_event(&state.action, &state.token, outcome);
    tracing::info!(run_id = %key, event_type = %event.event_type, "Run finished");
    state.emit_terminal(event, &events).await;

    if let Some(services) = &durable {
        services.eviction.unregister_run(&key).await;
    }
}

async fn run_blocking(
    state: &RunState,
    task: Arc<dyn Task>,
    ctx: Arc<Context>,
    pool: &BlockingPool,
    span: tracing::Span,
) -> Outcome {
    let slot = tokio::select! {
        slot = pool.acquire() => slot,
        _ = ctx.cancelled() => {
            return Outcome::Returned(Err(TaskError::new("Cancelled while waiting for a blocking slot")));
        }
    };
    let slot = match slot {
        Ok(slot) => slot,
        Err(_) => return Outcome::Returned(Err(TaskError::new("Blocking pool is closed"))),
    };
    state.set_slot(slot.clone());
    let spawned = pool.spawn(slot, move || {
        let _entered = span.enter();
        task.call_blocking(ctx)
    });
    match spawned {
        Ok(thread) => match thread.join().await {
            Ok(result) => Outcome::Returned(result),
            Err(payload) => Outcome::Panicked(panic_message(payload)),
        },
        Err(e) => Outcome::Returned(Err(TaskError::new(format!(
            "Could not start a blocking thread: {e}"
        )))),
    }
}

/// Map a run's outcome to its terminal event.
fn completion_event(action: &Action, token: &CancellationToken, outcome: Outcome) -> ActionEvent {
    if token.is_cancelled() {
        return ActionEvent::cancellation_confirmed(action);
    }
    match outcome {
        Outcome::Returned(Ok(output)) => match serialize_output(&output) {
            Ok(serialized) => {
                tracing::debug!(run_id = %action.key(), bytes = serialized.len(), "Output accepted");
                ActionEvent::completed(action, output)
            }
            Err(e) => {
                tracing::warn!(run_id = %action.key(), error = %e, "Output rejected");
                ActionEvent::output_rejected(action, &e)
            }
        },
        Outcome::Returned(Err(e)) => ActionEvent::failed(action, e.message, !e.retryable),
        Outcome::Panicked(message) => {
            ActionEvent::failed(action, format!("Task panicked: {message}"), false)
        }
        Outcome::Aborted => ActionEvent::failed(action, "Task was aborted", false),
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
