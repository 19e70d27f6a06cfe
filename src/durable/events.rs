//! Durable event listener: many logical waiters over one physical stream.
//!
//! Each waiter subscribes to a `(task_id, signal_key)` pair. A single
//! background connection owns the engine stream: on every (re)connect it first
//! replays one resubscribe frame per active pair, then forwards new requests.
//! Incoming events are fanned out to every subscription on their pair.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use futures::StreamExt;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, info, warn};

use crate::cancellation::{CancellationReason, CancellationToken};
use crate::config::DurableConfig;
use crate::durable::conditions::DurableConditions;
use crate::engine::{DurableEvent, DurableListenRequest, DurableWaitRequest, EngineClient};
use crate::error::DurableError;

type SignalPair = (String, String);

#[derive(Default)]
struct Session {
    next_subscription_id: u64,
    waiters: HashMap<SignalPair, Vec<u64>>,
    senders: HashMap<u64, oneshot::Sender<DurableEvent>>,
    outbound: Option<mpsc::UnboundedSender<DurableListenRequest>>,
    closed: bool,
}

impl Session {
    fn remove(&mut self, id: u64, pair: &SignalPair) {
        self.senders.remove(&id);
        if let Some(ids) = self.waiters.get_mut(pair) {
            ids.retain(|existing| *existing != id);
            if ids.is_empty() {
                self.waiters.remove(pair);
            }
        }
    }

    fn deliver(&mut self, event: DurableEvent) -> usize {
        let pair = (event.task_id.clone(), event.signal_key.clone());
        let Some(ids) = self.waiters.remove(&pair) else {
            return 0;
        };
        let mut delivered = 0;
        for id in ids {
            if let Some(tx) = self.senders.remove(&id)
                && tx.send(event.clone()).is_ok()
            {
                delivered += 1;
            }
        }
        delivered
    }

    fn close(&mut self) {
        self.closed = true;
        self.outbound = None;
        self.waiters.clear();
        // Dropping the senders wakes every pending waiter with "stream closed".
        self.senders.clear();
    }
}

fn lock(session: &Mutex<Session>) -> MutexGuard<'_, Session> {
    session
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// A logical waiter on the shared durable stream.
///
/// Dropping it unregisters the waiter; the last waiter on a pair removes the
/// pair from the replay set.
pub struct Subscription {
    id: u64,
    pair: SignalPair,
    rx: oneshot::Receiver<DurableEvent>,
    session: Arc<Mutex<Session>>,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Wait for the event matching this subscription.
    pub async fn recv(mut self) -> Result<DurableEvent, DurableError> {
        (&mut self.rx).await.map_err(|_| DurableError::StreamClosed)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        lock(&self.session).remove(self.id, &self.pair);
    }
}

/// Process-wide durable event listener.
pub struct DurableEventListener {
    engine: Arc<dyn EngineClient>,
    config: DurableConfig,
    session: Arc<Mutex<Session>>,
    shutdown: CancellationToken,
    connection: Mutex<Option<JoinHandle<()>>>,
}

impl DurableEventListener {
    pub fn new(engine: Arc<dyn EngineClient>, config: DurableConfig) -> Self {
        Self {
            engine,
            config,
            session: Arc::new(Mutex::new(Session::default())),
            shutdown: CancellationToken::new(),
            connection: Mutex::new(None),
        }
    }

    /// Start the background connection if it is not running yet.
    pub fn start(&self) {
        let mut connection = self
            .connection
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if connection.is_some() || self.shutdown.is_cancelled() {
            return;
        }
        *connection = Some(tokio::spawn(connection_loop(
            Arc::clone(&self.engine),
            Arc::clone(&self.session),
            self.config.clone(),
            self.shutdown.clone(),
        )));
    }

    /// Register a waiter for `(task_id, signal_key)`.
    pub fn subscribe(&self, task_id: &str, signal_key: &str) -> Subscription {
        self.start();

        let (tx, rx) = oneshot::channel();
        let pair = (task_id.to_string(), signal_key.to_string());
        let id = {
            let mut session = lock(&self.session);
            session.next_subscription_id += 1;
            let id = session.next_subscription_id;
            if !session.closed {
                session.senders.insert(id, tx);
                session.waiters.entry(pair.clone()).or_default().push(id);
                if let Some(outbound) = &session.outbound {
                    let _ = outbound.send(DurableListenRequest {
                        task_id: pair.0.clone(),
                        signal_key: pair.1.clone(),
                        resubscribe: false,
                    });
                }
            }
            id
        };

        debug!(subscription_id = id, task_id, signal_key, "Durable subscription created");
        Subscription {
            id,
            pair,
            rx,
            session: Arc::clone(&self.session),
        }
    }

    /// Tell the engine what a durable wait is waiting for.
    pub async fn register_durable_wait(
        &self,
        task_id: &str,
        signal_key: &str,
        conditions: DurableConditions,
    ) -> Result<(), DurableError> {
        let request = DurableWaitRequest {
            task_id: task_id.to_string(),
            signal_key: signal_key.to_string(),
            conditions,
        };
        self.engine
            .register_durable_wait(&request)
            .await
            .map_err(DurableError::Registration)
    }

    /// Wait for the next event on `(task_id, signal_key)`.
    pub async fn await_result(
        &self,
        task_id: &str,
        signal_key: &str,
    ) -> Result<DurableEvent, DurableError> {
        self.subscribe(task_id, signal_key).recv().await
    }

    /// Number of distinct `(task_id, signal_key)` pairs with live waiters.
    pub fn active_pairs(&self) -> usize {
        lock(&self.session).waiters.len()
    }

    /// Tear down the stream. Pending waiters receive [`DurableError::StreamClosed`].
    pub async fn shutdown(&self) {
        self.shutdown.cancel(CancellationReason::WorkerShutdown);
        lock(&self.session).close();
        let handle = self
            .connection
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        info!("Durable event listener stopped");
    }
}

async fn connection_loop(
    engine: Arc<dyn EngineClient>,
    session: Arc<Mutex<Session>>,
    config: DurableConfig,
    shutdown: CancellationToken,
) {
    while !shutdown.is_cancelled() {
        let (tx, rx) = mpsc::unbounded_channel();
        let replayed = {
            let mut session = lock(&session);
            if session.closed {
                return;
            }
            for (task_id, signal_key) in session.waiters.keys() {
                let _ = tx.send(DurableListenRequest {
                    task_id: task_id.clone(),
                    signal_key: signal_key.clone(),
                    resubscribe: true,
                });
            }
            session.outbound = Some(tx);
            session.waiters.len()
        };
        if replayed > 0 {
            info!(replayed, "Replayed durable subscriptions on reconnect");
        }

        let requests = Box::pin(UnboundedReceiverStream::new(rx));
        let mut stream = match engine.listen_durable_events(requests).await {
            Ok(stream) => stream,
            Err(e) => {
                warn!(error = %e, "Failed to open durable event stream");
                lock(&session).outbound = None;
                backoff(&config, &shutdown).await;
                continue;
            }
        };

        let rebuild = tokio::time::sleep(config.stream_rebuild_interval);
        tokio::pin!(rebuild);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = &mut rebuild => {
                    info!("Rebuilding durable event stream");
                    break;
                }
                item = stream.next() => match item {
                    Some(Ok(event)) => {
                        let delivered = lock(&session).deliver(event);
                        debug!(delivered, "Durable event delivered");
                    }
                    Some(Err(e)) => {
                        warn!(error = %e, "Durable event stream failed, reconnecting");
                        lock(&session).outbound = None;
                        backoff(&config, &shutdown).await;
                        break;
                    }
                    None => {
                        debug!("Durable event stream ended, reconnecting");
                        lock(&session).outbound = None;
                        backoff(&config, &shutdown).await;
                        break;
                    }
                },
            }
        }
    }
}

async fn backoff(config: &DurableConfig, shutdown: &CancellationToken) {
    tokio::select! {
        _ = tokio::time::sleep(config.reconnect_backoff) => {}
        _ = shutdown.cancelled() => {}
    }
}
