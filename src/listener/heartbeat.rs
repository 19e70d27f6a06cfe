//! Liveness heartbeat for the v2 action stream.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;

use crate::cancellation::CancellationToken;
use crate::engine::EngineClient;
use crate::listener::health::HealthMonitor;

/// Sends a heartbeat every `interval` until stopped.
pub struct Heartbeater {
    engine: Arc<dyn EngineClient>,
    worker_id: String,
    interval: Duration,
    monitor: Arc<HealthMonitor>,
}

impl Heartbeater {
    pub fn new(
        engine: Arc<dyn EngineClient>,
        worker_id: String,
        interval: Duration,
        monitor: Arc<HealthMonitor>,
    ) -> Self {
        Self {
            engine,
            worker_id,
            interval,
            monitor,
        }
    }

    pub fn spawn(self, stop: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(self.run(stop))
    }

    /// Heartbeat loop. An "unimplemented" answer ends it for good.
    pub async fn run(self, stop: CancellationToken) {
        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = stop.cancelled() => break,
            }

            match self.engine.heartbeat(&self.worker_id).await {
                Ok(()) => self.monitor.heartbeat_succeeded(),
                Err(e) if e.is_unimplemented() => {
                    tracing::warn!(
                        worker_id = %self.worker_id,
                        "Engine does not support heartbeats, disabling"
                    );
                    self.monitor.disable_heartbeat();
                    return;
                }
                Err(e) => {
                    let misses = self.monitor.heartbeat_failed();
                    if misses >= self.monitor.max_heartbeat_misses() {
                        tracing::error!(
                            worker_id = %self.worker_id,
                            misses,
                            error = %e,
                            "Heartbeats failing, worker is unhealthy"
                        );
                    } else {
                        tracing::warn!(worker_id = %self.worker_id, misses, error = %e, "Heartbeat failed");
                    }
                }
            }
        }
        tracing::debug!(worker_id = %self.worker_id, "Heartbeat stopped");
    }
}
