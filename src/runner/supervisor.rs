//! Cancellation supervision for in-flight runs.
//!
//! Once a run's token is cancelled the supervisor walks it through
//! `ACTIVE -> WARN_WINDOW -> GRACE_WINDOW -> FORCE_TERMINATED`:
//!
//! - past the warning threshold it logs a warning;
//! - past the grace period it aborts cooperative runs, releases the pool
//!   slot of blocking runs when forced termination is enabled, and reports a
//!   single `CANCELLATION_FAILED` if the run is still alive.

use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::AbortHandle;
use tokio::time::Instant;

use crate::action::{Action, ActionEvent, ActionEventType};
use crate::cancellation::CancellationToken;
use crate::config::RunnerConfig;
use crate::runner::pool::SlotHandle;

/// How long an aborted cooperative run gets to unwind before it counts as alive.
const ABORT_SETTLE: Duration = Duration::from_millis(25);

#[derive(Default)]
struct Phase {
    terminal_sent: bool,
    failure_reported: bool,
}

/// Shared state of one in-flight run.
pub(crate) struct RunState {
    pub action: Action,
    pub token: CancellationToken,
    pub blocking: bool,
    phase: tokio::sync::Mutex<Phase>,
    done: watch::Sender<bool>,
    abort: Mutex<Option<AbortHandle>>,
    slot: Mutex<Option<SlotHandle>>,
}

impl RunState {
    pub fn new(action: Action, token: CancellationToken, blocking: bool) -> Self {
        let (done, _) = watch::channel(false);
        Self {
            action,
            token,
            blocking,
            phase: tokio::sync::Mutex::new(Phase::default()),
            done,
            abort: Mutex::new(None),
            slot: Mutex::new(None),
        }
    }

    pub fn set_abort_handle(&self, handle: AbortHandle) {
        *self.abort.lock().unwrap_or_else(|p| p.into_inner()) = Some(handle);
    }

    pub fn set_slot(&self, slot: SlotHandle) {
        *self.slot.lock().unwrap_or_else(|p| p.into_inner()) = Some(slot);
    }

    pub fn is_done(&self) -> bool {
        *self.done.borrow()
    }

    /// Emit the run's terminal event. Only the first call sends anything.
    pub async fn emit_terminal(&self, event: ActionEvent, events: &mpsc::Sender<ActionEvent>) -> bool {
        debug_assert!(event.event_type.is_terminal());
        let mut phase = self.phase.lock().await;
        if phase.terminal_sent {
            tracing::warn!(
                run_id = %self.action.key(),
                event_type = %event.event_type,
                "Dropping second terminal event"
            );
            return false;
        }
        phase.terminal_sent = true;
        self.done.send_replace(true);
        if events.send(event).await.is_err() {
            tracing::warn!(run_id = %self.action.key(), "Event queue closed, terminal event lost");
        }
        true
    }

    /// Report a cancellation that did not take effect. At most once per run,
    /// and never after the terminal event.
    async fn emit_cancellation_failed(
        &self,
        elapsed: Duration,
        phase_name: &str,
        events: &mpsc::Sender<ActionEvent>,
    ) -> bool {
        let mut phase = self.phase.lock().await;
        if phase.terminal_sent || phase.failure_reported {
            return false;
        }
        phase.failure_reported = true;
        let event = ActionEvent::new(
            &self.action,
            ActionEventType::CancellationFailed,
            serde_json::json!({
                "elapsed_ms": elapsed.as_millis() as u64,
                "phase": phase_name,
                "reason": self.token.reason(),
            }),
        );
        let _ = events.send(event).await;
        true
    }

    async fn wait_done(&self) {
        let mut rx = self.done.subscribe();
        let _ = rx.wait_for(|done| *done).await;
    }

    fn abort(&self) {
        if let Some(handle) = self.abort.lock().unwrap_or_else(|p| p.into_inner()).as_ref() {
            handle.abort();
        }
    }

    fn release_slot(&self) -> bool {
        self.slot
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .as_ref()
            .is_some_and(|slot| slot.release())
    }
}

/// Supervise `run` until it finishes. Spawned once per run.
pub(crate) async fn supervise(
    run: std::sync::Arc<RunState>,
    config: RunnerConfig,
    events: mpsc::Sender<ActionEvent>,
) {
    let key = run.action.key();

    tokio::select! {
        _ = run.wait_done() => return,
        _ = run.token.cancelled() => {}
    }
    let cancelled_at = Instant::now();
    tracing::debug!(run_id = %key, reason = ?run.token.reason(), "Run cancelled, supervising");

    let warning = config
        .cancellation_warning_threshold
        .min(config.cancellation_grace_period);
    if tokio::time::timeout(warning, run.wait_done()).await.is_ok() {
        return;
    }
    tracing::warn!(
        run_id = %key,
        elapsed_ms = cancelled_at.elapsed().as_millis() as u64,
        "Run has not stopped after cancellation"
    );

    let remaining = config.cancellation_grace_period.saturating_sub(warning);
    if tokio::time::timeout(remaining, run.wait_done()).await.is_ok() {
        return;
    }

    let phase = if run.blocking {
        if config.force_terminate_blocking && run.release_slot() {
            tracing::warn!(run_id = %key, "Released pool slot of unresponsive blocking run");
        }
        // A pool thread cannot be stopped from outside.
        if run.is_done() {
            return;
        }
        "thread_still_alive"
    } else {
        run.abort();
        if tokio::time::timeout(ABORT_SETTLE, run.wait_done()).await.is_ok() {
            return;
        }
        "grace_period_exceeded"
    };

    let elapsed = cancelled_at.elapsed();
    if run.emit_cancellation_failed(elapsed, phase, &events).await {
        tracing::error!(
            run_id = %key,
            elapsed_ms = elapsed.as_millis() as u64,
            phase,
            "Cancellation failed"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::test_action;
    use crate::cancellation::CancellationReason;
    use std::sync::Arc;

    fn config(warning_ms: u64, grace_ms: u64) -> RunnerConfig {
        RunnerConfig {
            cancellation_warning_threshold: Duration::from_millis(warning_ms),
            cancellation_grace_period: Duration::from_millis(grace_ms),
            force_terminate_blocking: false,
        }
    }

    #[tokio::test]
    async fn run_finishing_within_grace_is_quiet() {
        let (tx, mut rx) = mpsc::channel(8);
        let run = Arc::new(RunState::new(
            test_action("r1", 0, "t"),
            CancellationToken::new(),
            false,
        ));
        let supervisor = tokio::spawn(supervise(Arc::clone(&run), config(10, 50), tx.clone()));

        run.token.cancel(CancellationReason::UserRequested);
        tokio::time::sleep(Duration::from_millis(20)).await;
        let confirmed = ActionEvent::cancellation_confirmed(&run.action);
        assert!(run.emit_terminal(confirmed, &tx).await);

        supervisor.await.unwrap();
        drop(tx);
        let types: Vec<_> = std::iter::from_fn(|| rx.try_recv().ok())
            .map(|e| e.event_type)
            .collect();
        assert_eq!(types, vec![ActionEventType::CancellationConfirmed]);
    }

    #[tokio::test]
    async fn stuck_blocking_run_reports_once() {
        let (tx, mut rx) = mpsc::channel(8);
        let run = Arc::new(RunState::new(
            test_action("r1", 0, "t"),
            CancellationToken::new(),
            true,
        ));
        let supervisor = tokio::spawn(supervise(Arc::clone(&run), config(10, 40), tx.clone()));
        run.token.cancel(CancellationReason::UserRequested);
        supervisor.await.unwrap();

        let event = rx.recv().await.unwrap();
        assert_eq!(event.event_type, ActionEventType::CancellationFailed);
        assert_eq!(event.payload["phase"], "thread_still_alive");
        assert!(event.payload["elapsed_ms"].as_u64().unwrap() >= 40);
        assert_eq!(event.payload["reason"], "USER_REQUESTED");

        // The late return is still confirmed, and no second terminal is sent.
        assert!(run.emit_terminal(ActionEvent::cancellation_confirmed(&run.action), &tx).await);
        assert!(!run.emit_terminal(ActionEvent::completed(&run.action, serde_json::json!({})), &tx).await);
        assert_eq!(
            rx.recv().await.unwrap().event_type,
            ActionEventType::CancellationConfirmed
        );
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn forced_termination_releases_slot() {
        let pool = crate::runner::pool::BlockingPool::new(1);
        let slot = pool.acquire().await.unwrap();
        let (tx, _rx) = mpsc::channel(8);
        let run = Arc::new(RunState::new(
            test_action("r1", 0, "t"),
            CancellationToken::new(),
            true,
        ));
        run.set_slot(slot);
        let mut cfg = config(5, 20);
        cfg.force_terminate_blocking = true;

        let supervisor = tokio::spawn(supervise(Arc::clone(&run), cfg, tx));
        assert_eq!(pool.available(), 0);
        run.token.cancel(CancellationReason::Timeout);
        supervisor.await.unwrap();
        assert_eq!(pool.available(), 1);
    }
}
