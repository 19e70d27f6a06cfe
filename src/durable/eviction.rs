//! Durable slot admission and eviction.
//!
//! Durable runs hold a slot from a bounded pool separate from the regular
//! run slots. Admitting a run into a full pool evicts one suspended run: the
//! engine must acknowledge the eviction before the victim is cancelled with
//! [`CancellationReason::Evicted`] and its slot is freed.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Notify, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::action::ActionKey;
use crate::cancellation::{CancellationReason, CancellationToken};
use crate::config::DurableConfig;
use crate::engine::{EngineClient, EvictionRequest};
use crate::error::DurableError;

/// Per-task eviction policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EvictionPolicy {
    /// Evict a run that has been suspended for longer than this.
    pub ttl: Option<Duration>,
    /// Whether the run may be evicted to admit another durable run.
    pub allow_capacity_eviction: bool,
    /// Lower priorities are evicted first.
    pub priority: i32,
}

impl Default for EvictionPolicy {
    fn default() -> Self {
        Self {
            ttl: Some(Duration::from_secs(15 * 60)),
            allow_capacity_eviction: true,
            priority: 0,
        }
    }
}

/// Bookkeeping for one admitted durable run.
#[derive(Debug, Clone)]
pub struct DurableRunRecord {
    pub key: ActionKey,
    pub token: CancellationToken,
    pub policy: EvictionPolicy,
    pub admitted_at: Instant,
    /// Set while the run is suspended in a durable wait.
    pub waiting_since: Option<Instant>,
    /// Claimed by an in-progress eviction; no one else may pick it.
    pub evicting: bool,
}

impl DurableRunRecord {
    fn ttl_expired(&self, now: Instant) -> bool {
        match (self.policy.ttl, self.waiting_since) {
            (Some(ttl), Some(since)) => now.duration_since(since) >= ttl,
            _ => false,
        }
    }
}

/// Admission controller for durable slots.
pub struct DurableEvictionManager {
    engine: Arc<dyn EngineClient>,
    config: DurableConfig,
    capacity: usize,
    runs: RwLock<HashMap<ActionKey, DurableRunRecord>>,
    freed: Notify,
}

impl DurableEvictionManager {
    pub fn new(engine: Arc<dyn EngineClient>, capacity: usize, config: DurableConfig) -> Self {
        Self {
            engine,
            config,
            capacity: capacity.max(1),
            runs: RwLock::new(HashMap::new()),
            freed: Notify::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of admitted durable runs.
    pub async fn len(&self) -> usize {
        self.runs.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.runs.read().await.is_empty()
    }

    pub async fn contains(&self, key: &ActionKey) -> bool {
        self.runs.read().await.contains_key(key)
    }

    /// Admit a durable run, evicting a suspended run if the pool is full.
    ///
    /// Waits while the pool is full and nothing is evictable. Returns
    /// [`DurableError::AdmissionCancelled`] if `token` is cancelled first.
    pub async fn register_run(
        &self,
        key: ActionKey,
        token: CancellationToken,
        policy: EvictionPolicy,
    ) -> Result<(), DurableError> {
        loop {
            let freed = self.freed.notified();

            let victim = {
                let mut runs = self.runs.write().await;
                if runs.contains_key(&key) || runs.len() < self.capacity {
                    runs.insert(
                        key.clone(),
                        DurableRunRecord {
                            key: key.clone(),
                            token: token.clone(),
                            policy: policy.clone(),
                            admitted_at: Instant::now(),
                            waiting_since: None,
                            evicting: false,
                        },
                    );
                    tracing::debug!(run_id = %key, in_use = runs.len(), "Durable run admitted");
                    return Ok(());
                }
                claim_victim(&mut runs)
            };

            match victim {
                Some(victim) => {
                    if let Err(e) = self.evict(&victim, "capacity").await {
                        tracing::warn!(run_id = %victim, error = %e, "Capacity eviction failed");
                        tokio::select! {
                            _ = tokio::time::sleep(self.config.eviction_retry_backoff) => {}
                            _ = token.cancelled() => {
                                return Err(DurableError::AdmissionCancelled { key: key.to_string() });
                            }
                        }
                    }
                }
                None => {
                    tracing::debug!(run_id = %key, "Durable slots full, waiting for a slot");
                    tokio::select! {
                        _ = freed => {}
                        _ = token.cancelled() => {
                            return Err(DurableError::AdmissionCancelled { key: key.to_string() });
                        }
                    }
                }
            }
        }
    }

    /// Release the slot held by `key`. Unknown keys are ignored.
    pub async fn unregister_run(&self, key: &ActionKey) {
        if self.runs.write().await.remove(key).is_some() {
            self.freed.notify_waiters();
        }
    }

    /// Mark the run as suspended in a durable wait (eligible for eviction).
    pub async fn mark_waiting(&self, key: &ActionKey) {
        if let Some(record) = self.runs.write().await.get_mut(key) {
            record.waiting_since.get_or_insert_with(Instant::now);
        }
        // A newly suspended run may unblock a pending admission.
        self.freed.notify_waiters();
    }

    /// Mark the run as active again.
    pub async fn mark_active(&self, key: &ActionKey) {
        if let Some(record) = self.runs.write().await.get_mut(key) {
            record.waiting_since = None;
        }
    }

    /// Ask the engine to requeue an evicted task at the highest priority.
    pub async fn restore(&self, step_run_id: &str) -> Result<(), DurableError> {
        self.engine
            .restore_task(step_run_id)
            .await
            .map_err(|source| DurableError::RestoreFailed {
                step_run_id: step_run_id.to_string(),
                source,
            })?;
        tracing::info!(step_run_id, "Requested restore of evicted task");
        Ok(())
    }

    /// Evict runs whose suspension outlived their policy TTL.
    pub async fn sweep_expired(&self) -> usize {
        let now = Instant::now();
        let expired: Vec<ActionKey> = self
            .runs
            .write()
            .await
            .values_mut()
            .filter(|record| !record.evicting && record.ttl_expired(now))
            .map(|record| {
                record.evicting = true;
                record.key.clone()
            })
            .collect();

        let mut evicted = 0;
        for key in expired {
            match self.evict(&key, "ttl").await {
                Ok(()) => evicted += 1,
                Err(e) => tracing::warn!(run_id = %key, error = %e, "TTL eviction failed"),
            }
        }
        evicted
    }

    /// Background sweep loop. Runs until `shutdown` is cancelled.
    pub fn spawn_sweeper(self: &Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(manager.config.eviction_sweep_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let evicted = manager.sweep_expired().await;
                        if evicted > 0 {
                            tracing::info!(evicted, "Evicted expired durable runs");
                        }
                    }
                    _ = shutdown.cancelled() => break,
                }
            }
            tracing::debug!("Durable eviction sweeper stopped");
        })
    }

    /// Evict a run previously claimed under the write lock. A rejected
    /// eviction releases the claim.
    async fn evict(&self, key: &ActionKey, reason: &str) -> Result<(), DurableError> {
        let request = EvictionRequest {
            step_run_id: key.run_id.clone(),
            retry_count: key.retry_count,
            reason: reason.to_string(),
        };
        if let Err(source) = self.engine.evict_task(&request).await {
            if let Some(record) = self.runs.write().await.get_mut(key) {
                record.evicting = false;
            }
            return Err(DurableError::EvictionRejected {
                step_run_id: key.run_id.clone(),
                source,
            });
        }

        let record = self.runs.write().await.remove(key);
        if let Some(record) = record {
            record.token.cancel(CancellationReason::Evicted);
            tracing::info!(run_id = %key, reason, "Evicted durable run");
            self.freed.notify_waiters();
        }
        Ok(())
    }
}

/// Pick and claim a victim: suspended, evictable and unclaimed runs only;
/// lowest priority first, then longest waiting.
fn claim_victim(runs: &mut HashMap<ActionKey, DurableRunRecord>) -> Option<ActionKey> {
    let key = runs
        .values()
        .filter(|record| record.policy.allow_capacity_eviction && !record.evicting)
        .filter_map(|record| record.waiting_since.map(|since| (record, since)))
        .min_by_key(|(record, since)| (record.policy.priority, *since, record.key.clone()))
        .map(|(record, _)| record.key.clone())?;
    if let Some(record) = runs.get_mut(&key) {
        record.evicting = true;
    }
    Some(key)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::MemoryEngine;
    use crate::error::EngineError;

    fn manager(engine: &MemoryEngine, capacity: usize) -> Arc<DurableEvictionManager> {
        let config = DurableConfig {
            eviction_sweep_interval: Duration::from_millis(10),
            eviction_retry_backoff: Duration::from_millis(10),
            ..DurableConfig::default()
        };
        Arc::new(DurableEvictionManager::new(
            Arc::new(engine.clone()),
            capacity,
            config,
        ))
    }

    fn policy(priority: i32) -> EvictionPolicy {
        EvictionPolicy {
            priority,
            ..EvictionPolicy::default()
        }
    }

    #[tokio::test]
    async fn full_pool_evicts_exactly_one_victim() {
        let engine = MemoryEngine::new();
        let manager = manager(&engine, 2);

        let low = CancellationToken::new();
        let high = CancellationToken::new();
        manager
            .register_run(ActionKey::new("low", 0), low.clone(), policy(1))
            .await
            .unwrap();
        manager
            .register_run(ActionKey::new("high", 0), high.clone(), policy(5))
            .await
            .unwrap();
        manager.mark_waiting(&ActionKey::new("low", 0)).await;
        manager.mark_waiting(&ActionKey::new("high", 0)).await;

        let incoming = CancellationToken::new();
        manager
            .register_run(ActionKey::new("new", 0), incoming.clone(), policy(3))
            .await
            .unwrap();

        assert_eq!(low.reason(), Some(CancellationReason::Evicted));
        assert!(!high.is_cancelled());
        assert!(!incoming.is_cancelled());
        assert_eq!(manager.len().await, 2);
        assert!(!manager.contains(&ActionKey::new("low", 0)).await);

        let evictions = engine.evictions();
        assert_eq!(evictions.len(), 1);
        assert_eq!(evictions[0].step_run_id, "low");
        assert_eq!(evictions[0].reason, "capacity");
    }

    #[tokio::test]
    async fn active_runs_are_never_capacity_victims() {
        let engine = MemoryEngine::new();
        let manager = manager(&engine, 1);
        let busy = CancellationToken::new();
        manager
            .register_run(ActionKey::new("busy", 0), busy.clone(), policy(0))
            .await
            .unwrap();

        let m = Arc::clone(&manager);
        let admit = tokio::spawn(async move {
            m.register_run(ActionKey::new("next", 0), CancellationToken::new(), policy(0))
                .await
        });

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(!admit.is_finished());
        assert!(engine.evictions().is_empty());

        manager.unregister_run(&ActionKey::new("busy", 0)).await;
        tokio::time::timeout(Duration::from_secs(1), admit)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(!busy.is_cancelled());
        assert!(manager.contains(&ActionKey::new("next", 0)).await);
    }

    #[tokio::test]
    async fn rejected_eviction_keeps_victim() {
        let engine = MemoryEngine::new();
        engine.set_eviction_error(Some(EngineError::unavailable("engine down")));
        let manager = manager(&engine, 1);
        let victim = CancellationToken::new();
        manager
            .register_run(ActionKey::new("v", 0), victim.clone(), policy(0))
            .await
            .unwrap();
        manager.mark_waiting(&ActionKey::new("v", 0)).await;

        let incoming = CancellationToken::new();
        let m = Arc::clone(&manager);
        let t = incoming.clone();
        let admit = tokio::spawn(async move {
            m.register_run(ActionKey::new("in", 0), t, policy(0)).await
        });

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(!victim.is_cancelled());
        incoming.cancel(CancellationReason::UserRequested);
        let result = tokio::time::timeout(Duration::from_secs(1), admit)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(result, Err(DurableError::AdmissionCancelled { .. })));
        assert!(manager.contains(&ActionKey::new("v", 0)).await);
    }

    #[tokio::test]
    async fn concurrent_admissions_never_share_a_victim() {
        let engine = MemoryEngine::new();
        engine.set_eviction_delay(Duration::from_millis(30));
        let manager = manager(&engine, 1);
        let victim = CancellationToken::new();
        manager
            .register_run(ActionKey::new("v", 0), victim.clone(), policy(0))
            .await
            .unwrap();
        manager.mark_waiting(&ActionKey::new("v", 0)).await;

        let first = CancellationToken::new();
        let second = CancellationToken::new();
        let admit = |run_id: &'static str, token: CancellationToken| {
            let m = Arc::clone(&manager);
            tokio::spawn(async move { m.register_run(ActionKey::new(run_id, 0), token, policy(0)).await })
        };
        let a = admit("a", first.clone());
        let b = admit("b", second.clone());

        tokio::time::timeout(Duration::from_secs(1), victim.cancelled())
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(60)).await;

        // One eviction request, one admission; the other waits for a slot.
        assert_eq!(engine.evictions().len(), 1);
        assert_eq!(manager.len().await, 1);
        assert_ne!(a.is_finished(), b.is_finished());

        first.cancel(CancellationReason::UserRequested);
        second.cancel(CancellationReason::UserRequested);
        let results = [a.await.unwrap(), b.await.unwrap()];
        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        assert_eq!(engine.evictions().len(), 1);
    }

    #[tokio::test]
    async fn rejected_eviction_releases_the_claim() {
        let engine = MemoryEngine::new();
        engine.set_eviction_error(Some(EngineError::unavailable("engine down")));
        let manager = manager(&engine, 1);
        manager
            .register_run(ActionKey::new("v", 0), CancellationToken::new(), policy(0))
            .await
            .unwrap();
        manager.mark_waiting(&ActionKey::new("v", 0)).await;

        let key = {
            let mut runs = manager.runs.write().await;
            claim_victim(&mut runs).unwrap()
        };
        assert!(manager.evict(&key, "capacity").await.is_err());
        let runs = manager.runs.read().await;
        assert!(!runs[&key].evicting);
    }

    #[tokio::test]
    async fn sweeper_evicts_expired_waits() {
        let engine = MemoryEngine::new();
        let manager = manager(&engine, 4);
        let token = CancellationToken::new();
        let short = EvictionPolicy {
            ttl: Some(Duration::from_millis(20)),
            ..EvictionPolicy::default()
        };
        manager
            .register_run(ActionKey::new("idle", 0), token.clone(), short)
            .await
            .unwrap();
        manager.mark_waiting(&ActionKey::new("idle", 0)).await;

        let shutdown = CancellationToken::new();
        let sweeper = manager.spawn_sweeper(shutdown.clone());
        tokio::time::timeout(Duration::from_secs(1), token.cancelled())
            .await
            .unwrap();
        assert_eq!(token.reason(), Some(CancellationReason::Evicted));
        assert_eq!(engine.evictions()[0].reason, "ttl");

        shutdown.cancel(CancellationReason::WorkerShutdown);
        sweeper.await.unwrap();
    }

    #[tokio::test]
    async fn restore_reaches_engine() {
        let engine = MemoryEngine::new();
        let manager = manager(&engine, 1);
        manager.restore("step-1").await.unwrap();
        assert_eq!(engine.restores(), vec!["step-1"]);
    }
}
