//! Worker health as seen from the listener.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::engine::ProtocolVersion;

/// Overall worker health.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HealthStatus {
    Starting,
    Healthy,
    Unhealthy,
}

/// Point-in-time view of the listener's health inputs.
#[derive(Debug, Clone, Serialize)]
pub struct HealthSnapshot {
    pub status: HealthStatus,
    pub worker_id: Option<String>,
    pub protocol: Option<ProtocolVersion>,
    pub heartbeat_enabled: bool,
    pub heartbeat_misses: u32,
    pub last_heartbeat: Option<DateTime<Utc>>,
}

#[derive(Default)]
struct Identity {
    worker_id: Option<String>,
    protocol: Option<ProtocolVersion>,
    last_heartbeat: Option<DateTime<Utc>>,
}

/// Shared health state, written by the listener thread and read anywhere.
pub struct HealthMonitor {
    started: AtomicBool,
    listener_alive: AtomicBool,
    listener_failed: AtomicBool,
    heartbeat_enabled: AtomicBool,
    heartbeat_misses: AtomicU32,
    max_heartbeat_misses: u32,
    identity: Mutex<Identity>,
}

impl HealthMonitor {
    pub fn new(max_heartbeat_misses: u32) -> Self {
        Self {
            started: AtomicBool::new(false),
            listener_alive: AtomicBool::new(false),
            listener_failed: AtomicBool::new(false),
            heartbeat_enabled: AtomicBool::new(true),
            heartbeat_misses: AtomicU32::new(0),
            max_heartbeat_misses: max_heartbeat_misses.max(1),
            identity: Mutex::new(Identity::default()),
        }
    }

    fn identity(&self) -> MutexGuard<'_, Identity> {
        self.identity
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn compute_health(&self) -> HealthStatus {
        if self.listener_failed.load(Ordering::SeqCst) {
            return HealthStatus::Unhealthy;
        }
        if !self.started.load(Ordering::SeqCst) {
            return HealthStatus::Starting;
        }
        if !self.listener_alive.load(Ordering::SeqCst) {
            return HealthStatus::Unhealthy;
        }
        if self.heartbeat_enabled.load(Ordering::SeqCst)
            && self.heartbeat_misses.load(Ordering::SeqCst) >= self.max_heartbeat_misses
        {
            return HealthStatus::Unhealthy;
        }
        HealthStatus::Healthy
    }

    pub fn snapshot(&self) -> HealthSnapshot {
        let status = self.compute_health();
        let identity = self.identity();
        HealthSnapshot {
            status,
            worker_id: identity.worker_id.clone(),
            protocol: identity.protocol,
            heartbeat_enabled: self.heartbeat_enabled.load(Ordering::SeqCst),
            heartbeat_misses: self.heartbeat_misses.load(Ordering::SeqCst),
            last_heartbeat: identity.last_heartbeat,
        }
    }

    pub(crate) fn registered(&self, worker_id: &str) {
        self.identity().worker_id = Some(worker_id.to_string());
    }

    pub(crate) fn connected(&self, protocol: ProtocolVersion) {
        self.identity().protocol = Some(protocol);
        self.listener_alive.store(true, Ordering::SeqCst);
        self.started.store(true, Ordering::SeqCst);
    }

    pub(crate) fn listener_stopped(&self) {
        self.listener_alive.store(false, Ordering::SeqCst);
    }

    pub(crate) fn listener_failed(&self) {
        self.listener_failed.store(true, Ordering::SeqCst);
        self.listener_alive.store(false, Ordering::SeqCst);
    }

    pub(crate) fn disable_heartbeat(&self) {
        self.heartbeat_enabled.store(false, Ordering::SeqCst);
        self.heartbeat_misses.store(0, Ordering::SeqCst);
    }

    pub(crate) fn heartbeat_succeeded(&self) {
        self.heartbeat_misses.store(0, Ordering::SeqCst);
        self.identity().last_heartbeat = Some(Utc::now());
    }

    /// Record a failed heartbeat and return the consecutive miss count.
    pub(crate) fn heartbeat_failed(&self) -> u32 {
        self.heartbeat_misses.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn max_heartbeat_misses(&self) -> u32 {
        self.max_heartbeat_misses
    }

    pub fn heartbeat_enabled(&self) -> bool {
        self.heartbeat_enabled.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_then_turns_healthy() {
        let monitor = HealthMonitor::new(3);
        assert_eq!(monitor.compute_health(), HealthStatus::Starting);
        monitor.registered("w-1");
        monitor.connected(ProtocolVersion::V2);
        assert_eq!(monitor.compute_health(), HealthStatus::Healthy);
        assert_eq!(monitor.snapshot().worker_id.as_deref(), Some("w-1"));
    }

    #[test]
    fn consecutive_misses_turn_unhealthy_and_success_resets() {
        let monitor = HealthMonitor::new(3);
        monitor.connected(ProtocolVersion::V2);
        monitor.heartbeat_failed();
        monitor.heartbeat_failed();
        assert_eq!(monitor.compute_health(), HealthStatus::Healthy);
        assert_eq!(monitor.heartbeat_failed(), 3);
        assert_eq!(monitor.compute_health(), HealthStatus::Unhealthy);

        monitor.heartbeat_succeeded();
        assert_eq!(monitor.compute_health(), HealthStatus::Healthy);
        assert!(monitor.snapshot().last_heartbeat.is_some());
    }

    #[test]
    fn disabled_heartbeat_does_not_count_misses() {
        let monitor = HealthMonitor::new(1);
        monitor.connected(ProtocolVersion::V1);
        monitor.disable_heartbeat();
        assert_eq!(monitor.compute_health(), HealthStatus::Healthy);
    }

    #[test]
    fn fatal_listener_failure_is_unhealthy() {
        let monitor = HealthMonitor::new(3);
        monitor.connected(ProtocolVersion::V2);
        monitor.listener_failed();
        assert_eq!(monitor.compute_health(), HealthStatus::Unhealthy);
    }
}
