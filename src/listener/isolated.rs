//! The listener's isolated execution context.
//!
//! The [`ActionListener`] and the lifecycle-event forwarder run on a dedicated
//! OS thread with their own single-threaded runtime, so a run that blocks the
//! runner's scheduler cannot stall heartbeats. The two sides only share two
//! bounded queues: actions flow to the runner, events flow back.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tokio::sync::mpsc;

use crate::action::{Action, ActionEvent};
use crate::cancellation::{CancellationReason, CancellationToken};
use crate::config::ListenerConfig;
use crate::engine::{EngineClient, WorkerRegistration};
use crate::error::ListenerError;
use crate::listener::ActionListener;
use crate::listener::health::HealthMonitor;

const EVENT_RETRY_BACKOFF: Duration = Duration::from_millis(100);

/// Runner-side ends of the queues plus control over the listener thread.
pub struct ListenerHandle {
    actions: Option<mpsc::Receiver<Action>>,
    events: mpsc::Sender<ActionEvent>,
    stop_listening: CancellationToken,
    stop_forwarding: CancellationToken,
    failed: CancellationToken,
    exited: CancellationToken,
    thread: Option<thread::JoinHandle<Result<(), ListenerError>>>,
}

impl ListenerHandle {
    /// Take the inbound queue: actions received from the engine.
    pub fn take_actions(&mut self) -> Option<mpsc::Receiver<Action>> {
        self.actions.take()
    }

    /// Outbound queue: lifecycle events for the engine.
    pub fn events(&self) -> mpsc::Sender<ActionEvent> {
        self.events.clone()
    }

    /// Stop receiving new actions. Events keep flowing.
    pub fn stop_listening(&self) {
        self.stop_listening.cancel(CancellationReason::WorkerShutdown);
    }

    /// A token cancelled when the listener gives up on the engine for good.
    /// No further actions will arrive once it fires.
    pub fn failure_signal(&self) -> CancellationToken {
        self.failed.clone()
    }

    pub fn has_failed(&self) -> bool {
        self.failed.is_cancelled()
    }

    /// Resolves when the listener thread has exited.
    pub async fn exited(&self) {
        self.exited.cancelled().await
    }

    pub fn has_exited(&self) -> bool {
        self.exited.is_cancelled()
    }

    /// A token cancelled when the listener thread exits.
    pub fn exit_signal(&self) -> CancellationToken {
        self.exited.clone()
    }

    /// Flush queued events, deregister and join the listener thread.
    pub async fn shutdown(mut self) -> Result<(), ListenerError> {
        self.stop_listening();
        self.stop_forwarding.cancel(CancellationReason::WorkerShutdown);
        drop(self.events);

        let Some(thread) = self.thread.take() else {
            return Ok(());
        };
        tokio::task::spawn_blocking(move || thread.join())
            .await
            .map_err(|e| ListenerError::Thread(e.to_string()))?
            .map_err(|_| ListenerError::Thread("listener thread panicked".to_string()))?
    }
}

/// Start the listener on its own thread.
pub fn spawn_listener(
    engine: Arc<dyn EngineClient>,
    config: ListenerConfig,
    registration: WorkerRegistration,
    monitor: Arc<HealthMonitor>,
) -> Result<ListenerHandle, ListenerError> {
    let capacity = config.queue_capacity.max(1);
    let (actions_tx, actions_rx) = mpsc::channel(capacity);
    let (events_tx, events_rx) = mpsc::channel(capacity);
    let stop_listening = CancellationToken::new();
    let stop_forwarding = CancellationToken::new();
    let failed = CancellationToken::new();
    let exited = CancellationToken::new();

    let thread = {
        let stop_listening = stop_listening.clone();
        let stop_forwarding = stop_forwarding.clone();
        let failed = failed.clone();
        let exited = exited.clone();
        thread::Builder::new()
            .name("relay-listener".to_string())
            .spawn(move || {
                let result = tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                    .map_err(|e| ListenerError::Thread(e.to_string()))
                    .and_then(|runtime| {
                        runtime.block_on(listener_main(
                            engine,
                            config,
                            registration,
                            monitor,
                            actions_tx,
                            events_rx,
                            stop_listening,
                            stop_forwarding,
                            failed,
                        ))
                    });
                exited.cancel(CancellationReason::WorkerShutdown);
                result
            })
            .map_err(|e| ListenerError::Thread(e.to_string()))?
    };

    Ok(ListenerHandle {
        actions: Some(actions_rx),
        events: events_tx,
        stop_listening,
        stop_forwarding,
        failed,
        exited,
        thread: Some(thread),
    })
}

#[allow(clippy::too_many_arguments)]
async fn listener_main(
    engine: Arc<dyn EngineClient>,
    config: ListenerConfig,
    registration: WorkerRegistration,
    monitor: Arc<HealthMonitor>,
    actions: mpsc::Sender<Action>,
    events: mpsc::Receiver<ActionEvent>,
    stop_listening: CancellationToken,
    stop_forwarding: CancellationToken,
    failed: CancellationToken,
) -> Result<(), ListenerError> {
    let attempts = config.event_send_attempts.max(1);
    let forwarder = tokio::spawn(forward_events(
        Arc::clone(&engine),
        events,
        attempts,
        stop_forwarding,
    ));

    let mut listener = ActionListener::new(engine, config, registration, monitor);
    let result = listener.run(actions, stop_listening).await;
    if let Err(e) = &result {
        tracing::error!(error = %e, "Action listener stopped");
        failed.cancel(CancellationReason::WorkerShutdown);
    }

    // Events for in-flight runs keep flowing until the runner side is done.
    let _ = forwarder.await;
    listener.unregister().await;
    result
}

/// Submit lifecycle events in queue order, retrying transient failures.
async fn forward_events(
    engine: Arc<dyn EngineClient>,
    mut events: mpsc::Receiver<ActionEvent>,
    attempts: u32,
    stop: CancellationToken,
) {
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(event) => send_event(engine.as_ref(), &event, attempts).await,
                None => return,
            },
            _ = stop.cancelled() => break,
        }
    }

    // Flush whatever is already queued.
    events.close();
    let mut flushed = 0;
    while let Some(event) = events.recv().await {
        send_event(engine.as_ref(), &event, attempts).await;
        flushed += 1;
    }
    tracing::debug!(flushed, "Event forwarder stopped");
}

async fn send_event(engine: &dyn EngineClient, event: &ActionEvent, attempts: u32) {
    for attempt in 1..=attempts {
        match engine.send_action_event(event).await {
            Ok(()) => return,
            Err(e) if attempt < attempts => {
                tracing::warn!(
                    run_id = %event.key(),
                    event_type = %event.event_type,
                    attempt,
                    error = %e,
                    "Failed to send lifecycle event, retrying"
                );
                tokio::time::sleep(EVENT_RETRY_BACKOFF * attempt).await;
            }
            Err(e) => {
                tracing::error!(
                    run_id = %event.key(),
                    event_type = %event.event_type,
                    error = %e,
                    "Dropping lifecycle event after {attempts} attempts"
                );
            }
        }
    }
}
