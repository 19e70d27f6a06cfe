//! Bounded pool for blocking tasks.
//!
//! Each run gets a detached OS thread; concurrency is bounded by a semaphore
//! sized to the worker's slot count. Each run holds a [`SlotHandle`] that can
//! be released early, which returns the slot to the pool while the thread
//! itself keeps running. Detached threads never hold up runtime shutdown, so
//! an abandoned run cannot keep the process alive past the drain deadline.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex};
use std::thread;

use tokio::sync::{AcquireError, OwnedSemaphorePermit, Semaphore, oneshot};

/// Bounded blocking pool.
#[derive(Clone)]
pub struct BlockingPool {
    semaphore: Arc<Semaphore>,
    size: usize,
}

/// A pool slot held by one run.
#[derive(Clone)]
pub struct SlotHandle {
    permit: Arc<Mutex<Option<OwnedSemaphorePermit>>>,
}

impl SlotHandle {
    /// Return the slot to the pool. Returns `false` if already released.
    pub fn release(&self) -> bool {
        self.permit
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
            .is_some()
    }

    pub fn is_held(&self) -> bool {
        self.permit
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .is_some()
    }
}

impl BlockingPool {
    pub fn new(size: usize) -> Self {
        let size = size.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(size)),
            size,
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Free slots right now.
    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Wait for a free slot.
    pub async fn acquire(&self) -> Result<SlotHandle, AcquireError> {
        let permit = Arc::clone(&self.semaphore).acquire_owned().await?;
        Ok(SlotHandle {
            permit: Arc::new(Mutex::new(Some(permit))),
        })
    }

    /// Run `f` on its own thread; the slot is released when `f` returns or panics.
    pub fn spawn<F, R>(&self, slot: SlotHandle, f: F) -> std::io::Result<BlockingJoin<R>>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        thread::Builder::new()
            .name("relay-blocking".to_string())
            .spawn(move || {
                let result = {
                    let _release = ReleaseOnDrop(slot);
                    panic::catch_unwind(AssertUnwindSafe(f))
                };
                // The slot is free before anyone sees the result.
                let _ = tx.send(result);
            })?;
        Ok(BlockingJoin { rx })
    }
}

/// Completion of a pool thread.
pub struct BlockingJoin<R> {
    rx: oneshot::Receiver<thread::Result<R>>,
}

impl<R> BlockingJoin<R> {
    /// Wait for the thread's result. `Err` carries the panic payload.
    pub async fn join(self) -> thread::Result<R> {
        match self.rx.await {
            Ok(result) => result,
            Err(_) => {
                let payload: Box<dyn Any + Send> = Box::new("blocking thread exited without a result");
                Err(payload)
            }
        }
    }
}

/// Releases the slot when the closure returns or unwinds.
struct ReleaseOnDrop(SlotHandle);

impl Drop for ReleaseOnDrop {
    fn drop(&mut self) {
        self.0.release();
    }
}
