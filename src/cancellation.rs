//! One-shot, hierarchical cancellation signal.
//!
//! A token is cancelled at most once; the first reason wins. Waiters can block
//! a thread ([`CancellationToken::wait`]) or await cooperatively
//! ([`CancellationToken::cancelled`]), and callbacks run exactly once.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Why a token was cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CancellationReason {
    UserRequested,
    WorkflowCancelled,
    ParentCancelled,
    Timeout,
    Evicted,
    WorkerShutdown,
}

impl fmt::Display for CancellationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::UserRequested => "user_requested",
            Self::WorkflowCancelled => "workflow_cancelled",
            Self::ParentCancelled => "parent_cancelled",
            Self::Timeout => "timeout",
            Self::Evicted => "evicted",
            Self::WorkerShutdown => "worker_shutdown",
        };
        write!(f, "{s}")
    }
}

type Callback = Box<dyn FnOnce(CancellationReason) + Send>;

#[derive(Default)]
struct State {
    reason: Option<CancellationReason>,
    callbacks: Vec<Callback>,
    child_run_ids: Vec<String>,
}

#[derive(Default)]
struct Inner {
    cancelled: AtomicBool,
    state: Mutex<State>,
    condvar: Condvar,
    signal: tokio_util::sync::CancellationToken,
}

/// Shared cancellation signal. Clones observe the same state.
#[derive(Clone, Default)]
pub struct CancellationToken {
    inner: Arc<Inner>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Cancel the token. Returns `false` if it was already cancelled, in which
    /// case the original reason is kept.
    pub fn cancel(&self, reason: CancellationReason) -> bool {
        let callbacks = {
            let mut state = self.state();
            if state.reason.is_some() {
                return false;
            }
            state.reason = Some(reason);
            self.inner.cancelled.store(true, Ordering::SeqCst);
            std::mem::take(&mut state.callbacks)
        };

        self.inner.condvar.notify_all();
        self.inner.signal.cancel();

        for callback in callbacks {
            callback(reason);
        }
        true
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    pub fn reason(&self) -> Option<CancellationReason> {
        self.state().reason
    }

    /// Block the current thread until cancelled or `timeout` elapses.
    /// Returns whether the token is cancelled.
    pub fn wait(&self, timeout: Duration) -> bool {
        let state = self.state();
        let (state, _) = self
            .inner
            .condvar
            .wait_timeout_while(state, timeout, |s| s.reason.is_none())
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        state.reason.is_some()
    }

    /// Resolve once the token is cancelled.
    pub async fn cancelled(&self) {
        self.inner.signal.cancelled().await
    }

    /// Register a callback. Runs immediately if the token is already cancelled.
    pub fn add_callback<F>(&self, callback: F)
    where
        F: FnOnce(CancellationReason) + Send + 'static,
    {
        let reason = {
            let mut state = self.state();
            match state.reason {
                Some(reason) => reason,
                None => {
                    state.callbacks.push(Box::new(callback));
                    return;
                }
            }
        };
        callback(reason);
    }

    /// A token that is cancelled with `ParentCancelled` when this one is.
    pub fn child_token(&self) -> CancellationToken {
        let child = CancellationToken::new();
        let handle = child.clone();
        self.add_callback(move |_| {
            handle.cancel(CancellationReason::ParentCancelled);
        });
        child
    }

    /// Record a spawned sub-run so cancellation can fan out to it.
    pub fn register_child(&self, run_id: impl Into<String>) {
        self.state().child_run_ids.push(run_id.into());
    }

    pub fn child_run_ids(&self) -> Vec<String> {
        self.state().child_run_ids.clone()
    }
}

impl fmt::Debug for CancellationToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancellationToken")
            .field("reason", &self.reason())
            .finish()
    }
}
