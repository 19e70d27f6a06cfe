//! Inbound action stream.
//!
//! The [`ActionListener`] registers the worker, keeps an action stream open
//! and forwards every action to the runner's inbound queue. It prefers the v2
//! protocol (with heartbeats); an "unimplemented" answer downgrades it to v1
//! for the rest of the process lifetime.

pub mod health;
pub mod heartbeat;
pub mod isolated;

use std::sync::Arc;

use futures::StreamExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::action::Action;
use crate::cancellation::{CancellationReason, CancellationToken};
use crate::config::ListenerConfig;
use crate::engine::{ActionStream, EngineClient, ProtocolVersion, WorkerRegistration};
use crate::error::{EngineError, ListenerError, StatusCode};

pub use health::{HealthMonitor, HealthSnapshot, HealthStatus};
pub use heartbeat::Heartbeater;
pub use isolated::{ListenerHandle, spawn_listener};

/// What to do after a stream or connection error.
#[derive(Debug, PartialEq, Eq)]
enum Recovery {
    Stop,
    RetryNow,
    Backoff,
    GiveUp,
}

/// Receives actions from the engine.
pub struct ActionListener {
    engine: Arc<dyn EngineClient>,
    config: ListenerConfig,
    registration: WorkerRegistration,
    monitor: Arc<HealthMonitor>,
    worker_id: Option<String>,
    protocol: ProtocolVersion,
    retries: u32,
    connected_at: Option<Instant>,
    heartbeat: Option<(CancellationToken, JoinHandle<()>)>,
}

impl ActionListener {
    pub fn new(
        engine: Arc<dyn EngineClient>,
        config: ListenerConfig,
        registration: WorkerRegistration,
        monitor: Arc<HealthMonitor>,
    ) -> Self {
        Self {
            engine,
            config,
            registration,
            monitor,
            worker_id: None,
            protocol: ProtocolVersion::V2,
            retries: 0,
            connected_at: None,
            heartbeat: None,
        }
    }

    pub fn worker_id(&self) -> Option<&str> {
        self.worker_id.as_deref()
    }

    pub fn protocol(&self) -> ProtocolVersion {
        self.protocol
    }

    /// Register the worker with the engine. Idempotent.
    pub async fn register(&mut self) -> Result<String, ListenerError> {
        if let Some(id) = &self.worker_id {
            return Ok(id.clone());
        }
        let worker_id = self
            .engine
            .register_worker(&self.registration)
            .await
            .map_err(ListenerError::Registration)?;
        tracing::info!(
            worker_id = %worker_id,
            worker_name = %self.registration.worker_name,
            actions = self.registration.actions.len(),
            "Worker registered"
        );
        self.monitor.registered(&worker_id);
        self.worker_id = Some(worker_id.clone());
        Ok(worker_id)
    }

    /// Open an action stream, downgrading to v1 if v2 is unimplemented.
    pub async fn connect(&mut self) -> Result<ActionStream, EngineError> {
        let worker_id = match &self.worker_id {
            Some(id) => id.clone(),
            None => {
                return Err(EngineError::new(
                    StatusCode::InvalidArgument,
                    "worker is not registered",
                ));
            }
        };

        if self.protocol == ProtocolVersion::V2 {
            match self.engine.listen_v2(&worker_id).await {
                Ok(stream) => {
                    self.start_heartbeat(&worker_id);
                    return Ok(stream);
                }
                Err(e) if e.is_unimplemented() => self.downgrade(),
                Err(e) => return Err(e),
            }
        }
        self.engine.listen_v1(&worker_id).await
    }

    /// Deregister the worker. Best-effort: failures are logged.
    pub async fn unregister(&mut self) {
        self.stop_heartbeat().await;
        let Some(worker_id) = self.worker_id.take() else {
            return;
        };
        match self.engine.unsubscribe(&worker_id).await {
            Ok(()) => tracing::info!(worker_id = %worker_id, "Worker unsubscribed"),
            Err(e) => tracing::warn!(worker_id = %worker_id, error = %e, "Unsubscribe failed"),
        }
    }

    /// Listen until `shutdown` is cancelled, the runner goes away or the
    /// retry budget is exhausted.
    pub async fn run(
        &mut self,
        actions: mpsc::Sender<Action>,
        shutdown: CancellationToken,
    ) -> Result<(), ListenerError> {
        loop {
            let registered = tokio::select! {
                result = self.register() => result,
                _ = shutdown.cancelled() => return self.stopped(),
            };
            match registered {
                Ok(_) => break,
                Err(ListenerError::Registration(e)) => {
                    tracing::warn!(error = %e, "Worker registration failed");
                    if !self.recover(e, &shutdown).await? {
                        return self.stopped();
                    }
                }
                Err(e) => return Err(e),
            }
        }

        loop {
            let connected = tokio::select! {
                result = self.connect() => result,
                _ = shutdown.cancelled() => return self.stopped(),
            };
            let mut stream = match connected {
                Ok(stream) => stream,
                Err(e) => {
                    tracing::warn!(error = %e, retries = self.retries, "Failed to open action stream");
                    if !self.recover(e, &shutdown).await? {
                        return self.stopped();
                    }
                    continue;
                }
            };

            self.connected_at = Some(Instant::now());
            self.monitor.connected(self.protocol);
            tracing::info!(protocol = ?self.protocol, "Listening for actions");

            let failure = loop {
                tokio::select! {
                    item = stream.next() => match item {
                        Some(Ok(action)) => {
                            tracing::debug!(
                                run_id = %action.key(),
                                action_type = ?action.action_type,
                                "Received action"
                            );
                            if actions.send(action).await.is_err() {
                                tracing::info!("Runner queue closed, stopping listener");
                                return self.stopped();
                            }
                        }
                        Some(Err(e)) => break Some(e),
                        None => break None,
                    },
                    _ = shutdown.cancelled() => return self.stopped(),
                }
            };

            match failure {
                Some(e) => {
                    tracing::warn!(error = %e, "Action stream failed");
                    self.maybe_reset_retries();
                    if !self.recover(e, &shutdown).await? {
                        return self.stopped();
                    }
                }
                None => {
                    tracing::info!("Action stream ended, reconnecting");
                    self.maybe_reset_retries();
                }
            }
        }
    }

    /// Apply the recovery policy for `err`. `Ok(false)` means stop cleanly.
    async fn recover(
        &mut self,
        err: EngineError,
        shutdown: &CancellationToken,
    ) -> Result<bool, ListenerError> {
        match self.classify(&err) {
            Recovery::Stop => {
                tracing::info!("Action stream cancelled by the engine, stopping listener");
                Ok(false)
            }
            Recovery::RetryNow => Ok(true),
            Recovery::Backoff => {
                tokio::select! {
                    _ = tokio::time::sleep(self.config.retry_interval) => Ok(true),
                    _ = shutdown.cancelled() => Ok(false),
                }
            }
            Recovery::GiveUp => {
                tracing::error!(
                    retries = self.retries,
                    error = %err,
                    "Action listener exhausted its retries"
                );
                self.monitor.listener_failed();
                self.stop_heartbeat().await;
                Err(ListenerError::RetriesExhausted {
                    retries: self.retries,
                    last: err,
                })
            }
        }
    }

    fn classify(&mut self, err: &EngineError) -> Recovery {
        match err.code {
            StatusCode::Cancelled => Recovery::Stop,
            StatusCode::DeadlineExceeded => Recovery::RetryNow,
            _ => {
                self.retries += 1;
                if self.retries > self.config.max_retries {
                    Recovery::GiveUp
                } else {
                    Recovery::Backoff
                }
            }
        }
    }

    /// A connection that stayed up longer than `retry_reset_after` clears the
    /// retry counter.
    fn maybe_reset_retries(&mut self) {
        if let Some(connected_at) = self.connected_at.take()
            && connected_at.elapsed() > self.config.retry_reset_after
            && self.retries > 0
        {
            tracing::debug!(retries = self.retries, "Resetting listener retry counter");
            self.retries = 0;
        }
    }

    fn downgrade(&mut self) {
        tracing::warn!("Engine does not support the v2 action stream, falling back to v1");
        self.protocol = ProtocolVersion::V1;
        self.monitor.disable_heartbeat();
        if let Some((stop, _)) = &self.heartbeat {
            stop.cancel(CancellationReason::WorkerShutdown);
        }
    }

    fn start_heartbeat(&mut self, worker_id: &str) {
        if self.heartbeat.is_some() || !self.monitor.heartbeat_enabled() {
            return;
        }
        let stop = CancellationToken::new();
        let handle = Heartbeater::new(
            Arc::clone(&self.engine),
            worker_id.to_string(),
            self.config.heartbeat_interval,
            Arc::clone(&self.monitor),
        )
        .spawn(stop.clone());
        self.heartbeat = Some((stop, handle));
    }

    async fn stop_heartbeat(&mut self) {
        if let Some((stop, handle)) = self.heartbeat.take() {
            stop.cancel(CancellationReason::WorkerShutdown);
            let _ = handle.await;
        }
    }

    fn stopped(&self) -> Result<(), ListenerError> {
        self.monitor.listener_stopped();
        Ok(())
    }
}
