//! Worker façade: task registration, startup wiring and shutdown.
//!
//! ```text
//! engine ─► ActionListener ─► inbound queue ─► Runner
//!    ▲                                           │
//!    └──────── event forwarder ◄─ outbound queue ┘
//! ```
//!
//! The listener side lives on its own thread (see [`crate::listener::isolated`]).

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::task::JoinHandle;

use crate::cancellation::{CancellationReason, CancellationToken};
use crate::config::WorkerConfig;
use crate::durable::{DurableEventListener, DurableEvictionManager, DurableServices};
use crate::engine::{EngineClient, WorkerRegistration};
use crate::error::{RegistryError, Result};
use crate::health::{HealthState, bind_health, serve_health};
use crate::listener::{HealthMonitor, HealthSnapshot, HealthStatus, ListenerHandle, spawn_listener};
use crate::runner::Runner;
use crate::tasks::{Task, TaskRegistry};

/// A worker that has not been started yet.
pub struct Worker {
    config: WorkerConfig,
    engine: Arc<dyn EngineClient>,
    registry: TaskRegistry,
}

impl Worker {
    pub fn new(config: WorkerConfig, engine: Arc<dyn EngineClient>) -> Self {
        Self {
            config,
            engine,
            registry: TaskRegistry::new(),
        }
    }

    /// Register a task under its action name.
    pub fn register<T: Task + 'static>(&mut self, task: T) -> std::result::Result<(), RegistryError> {
        self.registry.register(Arc::new(task))
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    /// Start listening and executing. Returns a handle for health and shutdown.
    pub async fn start(self) -> Result<WorkerHandle> {
        let Self {
            config,
            engine,
            registry,
        } = self;
        config.validate()?;

        // Claim the health port before anything is spawned.
        let health_listener = if config.health.enabled {
            Some(bind_health(config.health.port).await?)
        } else {
            None
        };

        let registration = WorkerRegistration {
            worker_name: config.name.clone(),
            actions: registry.list(),
            retries: registry.retries(),
            slots: config.slots,
            durable_slots: config.durable_slots,
            labels: config.labels.clone(),
        };
        tracing::info!(
            worker = %config.name,
            tasks = registry.count(),
            slots = config.slots,
            durable_slots = config.durable_slots,
            authenticated = config.token.is_some(),
            "Starting worker"
        );

        let monitor = Arc::new(HealthMonitor::new(config.listener.max_heartbeat_misses));
        let mut listener = spawn_listener(
            Arc::clone(&engine),
            config.listener.clone(),
            registration,
            Arc::clone(&monitor),
        )?;
        let actions = listener
            .take_actions()
            .ok_or_else(|| crate::error::ListenerError::Thread("action queue already taken".to_string()))?;

        let background = CancellationToken::new();

        let durable = registry.has_durable().then(|| {
            let listener = Arc::new(DurableEventListener::new(
                Arc::clone(&engine),
                config.durable.clone(),
            ));
            listener.start();
            DurableServices {
                listener,
                eviction: Arc::new(DurableEvictionManager::new(
                    Arc::clone(&engine),
                    config.durable_slots,
                    config.durable.clone(),
                )),
            }
        });
        let sweeper = durable
            .as_ref()
            .map(|services| services.eviction.spawn_sweeper(background.clone()));

        let mut runner = Runner::new(
            Arc::new(registry),
            config.runner.clone(),
            config.slots,
            listener.events(),
        );
        if let Some(services) = &durable {
            runner = runner.with_durable(services.clone());
        }
        let runner_shutdown = CancellationToken::new();
        let runner_task = tokio::spawn(runner.run(
            actions,
            runner_shutdown.clone(),
            config.graceful_shutdown_timeout,
        ));

        let health = match health_listener {
            Some(bound) => {
                let state = HealthState {
                    monitor: Arc::clone(&monitor),
                    worker_name: config.name.clone(),
                };
                match serve_health(bound, state, background.clone()) {
                    Ok(served) => Some(served),
                    Err(e) => {
                        let partial = WorkerHandle {
                            monitor,
                            listener,
                            runner_task,
                            runner_shutdown,
                            durable,
                            sweeper,
                            health: None,
                            background,
                        };
                        let _ = partial.shutdown().await;
                        return Err(e.into());
                    }
                }
            }
            None => None,
        };

        Ok(WorkerHandle {
            monitor,
            listener,
            runner_task,
            runner_shutdown,
            durable,
            sweeper,
            health,
            background,
        })
    }

    /// Start, then run until a termination signal or a fatal listener error.
    pub async fn run(self) -> Result<()> {
        let handle = self.start().await?;
        let listener_failed = handle.listener.failure_signal();

        tokio::select! {
            signal = wait_for_signal() => {
                signal?;
                tracing::info!("Shutdown signal received, draining");
            }
            _ = listener_failed.cancelled() => {
                tracing::error!("Action listener gave up, shutting down");
            }
        }
        handle.shutdown().await
    }
}

/// A running worker.
pub struct WorkerHandle {
    monitor: Arc<HealthMonitor>,
    listener: ListenerHandle,
    runner_task: JoinHandle<()>,
    runner_shutdown: CancellationToken,
    durable: Option<DurableServices>,
    sweeper: Option<JoinHandle<()>>,
    health: Option<(SocketAddr, JoinHandle<()>)>,
    background: CancellationToken,
}

impl WorkerHandle {
    pub fn health(&self) -> HealthStatus {
        self.monitor.compute_health()
    }

    pub fn health_snapshot(&self) -> HealthSnapshot {
        self.monitor.snapshot()
    }

    /// Address of the health endpoint, if enabled.
    pub fn health_addr(&self) -> Option<SocketAddr> {
        self.health.as_ref().map(|(addr, _)| *addr)
    }

    /// Whether the action listener has given up on the engine.
    pub fn listener_failed(&self) -> bool {
        self.listener.has_failed()
    }

    pub fn listener_exited(&self) -> bool {
        self.listener.has_exited()
    }

    /// Graceful shutdown: stop admitting, drain in-flight runs, flush events,
    /// deregister.
    pub async fn shutdown(self) -> Result<()> {
        let Self {
            monitor: _,
            listener,
            runner_task,
            runner_shutdown,
            durable,
            sweeper,
            health,
            background,
        } = self;

        // Stop admitting: no new actions from the engine, and anything still
        // queued is left undispatched. The runner then drains what is in flight.
        listener.stop_listening();
        runner_shutdown.cancel(CancellationReason::WorkerShutdown);
        if let Err(e) = runner_task.await {
            tracing::error!(error = %e, "Runner task failed");
        }

        background.cancel(CancellationReason::WorkerShutdown);
        if let Some(sweeper) = sweeper {
            let _ = sweeper.await;
        }
        if let Some(services) = durable {
            services.listener.shutdown().await;
        }

        let result = listener.shutdown().await;
        if let Some((_, server)) = health {
            let _ = server.await;
        }
        tracing::info!("Worker stopped");
        result.map_err(Into::into)
    }
}

/// Wait for SIGINT or SIGTERM. SIGQUIT exits the process immediately.
async fn wait_for_signal() -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let mut terminate = signal(SignalKind::terminate())?;
        let mut quit = signal(SignalKind::quit())?;
        tokio::select! {
            result = tokio::signal::ctrl_c() => result,
            _ = terminate.recv() => Ok(()),
            _ = quit.recv() => {
                tracing::warn!("Quit signal received, exiting immediately");
                std::process::exit(131);
            }
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await
    }
}
