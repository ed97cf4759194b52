//! Real-time synchronization client.
//!
//! Provides:
//! - Connection lifecycle (connect, disconnect, retry with a strategy)
//! - Shared live subscriptions with result-set diffs
//! - Plain writes, fetches and optimistic executions
//! - On-connect and on-disconnect actions
//!
//! ```text
//!  RapidClient ──lock──► SyncEngine ──frames──► writer task ──► socket
//!       ▲                    ▲
//!       │ effects            │ frames / close
//!       └──── publish ◄───── reader task ◄──────────────────── socket
//! ```
//!
//! Every public operation locks the engine, records its work and returns
//! a handle or future without waiting on the network.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc, oneshot};

use crate::actions::ActionEvent;
use crate::config::ClientConfig;
use crate::connection::{ConnectionEvent, ConnectionState};
use crate::document::{DocumentSnapshot, JsonObject};
use crate::engine::{Effect, SyncEngine};
use crate::error::{RapidError, Result};
use crate::mutation::{ExecutionResult, Transform};
use crate::pending::{TimerGuard, TimerScheduler};
use crate::protocol::{Ack, WriteOp};
use crate::query::Query;
use crate::reconnect::RetryStrategy;
use crate::reference::CollectionRef;
use crate::subscription::{HandleId, SubscriptionEvent};
use crate::transport::{Connector, TransportEvent, TransportLink, WebSocketConnector};

const EVENT_CAPACITY: usize = 64;

struct Shared {
    engine: Mutex<SyncEngine>,
    connector: Arc<dyn Connector>,
    config: ClientConfig,
    events: broadcast::Sender<ConnectionEvent>,
}

impl Shared {
    /// Run `f` under the engine lock and publish what it produced.
    ///
    /// Completions, deliveries and notices go out before the lock is
    /// released, so every listener sees them in engine order. Transforms are
    /// caller code and only run, or drop, after unlocking.
    fn with_engine<R>(self: &Arc<Self>, f: impl FnOnce(&mut SyncEngine) -> R) -> R {
        let (result, deferred) = {
            let mut engine = self.engine.lock();
            let result = f(&mut engine);
            let effects = engine.take_effects();
            (result, self.publish(effects))
        };
        self.run_deferred(deferred);
        result
    }

    /// Send channel effects; hand back the ones that involve caller code.
    fn publish(&self, effects: Vec<Effect>) -> Vec<Deferred> {
        let mut deferred = Vec::new();
        for effect in effects {
            match effect {
                Effect::Complete { completion, result } => {
                    let _ = completion.send(result);
                }
                Effect::Deliver(delivery) => {
                    let _ = delivery.listener.send(delivery.event);
                }
                Effect::Notify(notice) => {
                    let _ = notice.notifier.send(notice.event);
                }
                Effect::Connection(event) => {
                    let _ = self.events.send(event);
                }
                Effect::Transform { key, transform, snapshot } => {
                    deferred.push(Deferred::Run { key, transform, snapshot });
                }
                Effect::Release(transform) => deferred.push(Deferred::Release(transform)),
            }
        }
        deferred
    }

    fn run_deferred(self: &Arc<Self>, deferred: Vec<Deferred>) {
        for work in deferred {
            match work {
                Deferred::Run { key, mut transform, snapshot } => {
                    let outcome = transform(snapshot.as_ref());
                    self.with_engine(|engine| engine.transform_finished(&key, transform, outcome));
                }
                Deferred::Release(transform) => drop(transform),
            }
        }
    }
}

/// Caller code left over from an engine call.
enum Deferred {
    Run {
        key: String,
        transform: Transform,
        snapshot: Option<DocumentSnapshot>,
    },
    Release(Transform),
}

/// Request timers as tokio tasks.
struct TokioTimers {
    shared: Weak<Shared>,
}

impl TimerScheduler for TokioTimers {
    fn schedule(&self, correlation_id: &str, after: Duration) -> TimerGuard {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            log::warn!("No tokio runtime; request {correlation_id} will not time out");
            return TimerGuard::inert();
        };
        let shared = self.shared.clone();
        let correlation_id = correlation_id.to_string();
        let task = runtime.spawn(async move {
            tokio::time::sleep(after).await;
            if let Some(shared) = shared.upgrade() {
                shared.with_engine(|engine| engine.expire(&correlation_id));
            }
        });
        TimerGuard::from_abort_handle(task.abort_handle())
    }
}

/// The client. Cheap to clone; clones share one connection.
#[derive(Clone)]
pub struct RapidClient {
    shared: Arc<Shared>,
}

impl RapidClient {
    /// Create a client that opens transports through `connector`.
    ///
    /// Applies `config.log_level` as the global maximum log level.
    pub fn new(config: ClientConfig, connector: Arc<dyn Connector>) -> Self {
        log::set_max_level(config.log_level);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let shared = Arc::new_cyclic(|weak: &Weak<Shared>| {
            let timers = Arc::new(TokioTimers { shared: weak.clone() });
            Shared {
                engine: Mutex::new(SyncEngine::new(config.clone(), timers)),
                connector,
                config,
                events,
            }
        });
        Self { shared }
    }

    /// Create a client speaking WebSocket.
    pub fn websocket(config: ClientConfig) -> Self {
        Self::new(config, Arc::new(WebSocketConnector))
    }

    pub fn config(&self) -> &ClientConfig {
        &self.shared.config
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.engine.lock().state()
    }

    /// Connection transitions from now on.
    pub fn connection_events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.shared.events.subscribe()
    }

    // ── Connection ─────────────────────────────────────────────

    /// Open a transport to `endpoint` and run the handshake.
    ///
    /// Queued requests are flushed once the transport is open. Fails with
    /// `Timeout` after `connection_timeout`.
    pub async fn connect(&self, endpoint: &str) -> Result<()> {
        let epoch = self.shared.with_engine(SyncEngine::begin_connect)?;
        log::info!("Connecting to {endpoint}");

        let attempt = tokio::time::timeout(
            self.shared.config.connection_timeout,
            self.shared.connector.connect(endpoint),
        )
        .await;
        let link = match attempt {
            Ok(Ok(link)) => link,
            Ok(Err(e)) => {
                self.shared.with_engine(|engine| engine.connect_failed(epoch, &e));
                return Err(e);
            }
            Err(_) => {
                let e = RapidError::Timeout;
                self.shared.with_engine(|engine| engine.connect_failed(epoch, &e));
                return Err(e);
            }
        };

        let TransportLink { outgoing, incoming } = link;
        if !self.shared.with_engine(|engine| engine.transport_opened(epoch, outgoing)) {
            return Err(RapidError::Cancelled);
        }
        tokio::spawn(read_loop(
            Arc::downgrade(&self.shared),
            epoch,
            incoming,
            self.shared.config.heartbeat_interval,
        ));
        Ok(())
    }

    /// Store `token` for the handshake, then connect.
    pub async fn connect_with_token(&self, endpoint: &str, token: impl Into<String>) -> Result<()> {
        let token = token.into();
        self.shared.with_engine(|engine| engine.set_token(Some(token)));
        self.connect(endpoint).await
    }

    /// Connect, retrying failures as `strategy` allows.
    pub async fn connect_with_retry<S: RetryStrategy>(&self, endpoint: &str, strategy: &mut S) -> Result<()> {
        let mut attempt = 0;
        loop {
            match self.connect(endpoint).await {
                Ok(()) => return Ok(()),
                Err(e) => match strategy.next_delay(attempt, &e) {
                    Some(delay) => {
                        log::info!("Connect attempt {} failed ({e}); retrying in {delay:?}", attempt + 1);
                        tokio::time::sleep(delay).await;
                        attempt += 1;
                    }
                    None => return Err(e),
                },
            }
        }
    }

    pub fn disconnect(&self) {
        self.shared.with_engine(SyncEngine::disconnect);
    }

    /// Authorize the connection; the token is replayed on every reconnect.
    pub fn authorize(&self, token: impl Into<String>) -> RequestFuture {
        let token = token.into();
        let (tx, rx) = oneshot::channel();
        self.shared.with_engine(|engine| engine.authorize(token, tx));
        self.future(None, rx)
    }

    pub fn deauthorize(&self) -> RequestFuture {
        let (tx, rx) = oneshot::channel();
        let id = self.shared.with_engine(|engine| engine.deauthorize(tx));
        self.future(Some(id), rx)
    }

    /// Fail every outstanding request with `Timeout`.
    pub fn timeout_all(&self) {
        self.shared.with_engine(SyncEngine::timeout_all);
    }

    // ── Data ───────────────────────────────────────────────────

    pub fn collection(&self, name: impl Into<String>) -> CollectionRef {
        CollectionRef::new(self.clone(), name)
    }

    /// Subscribe to `query`. Identical queries share one server subscription.
    pub fn subscribe(&self, query: Query) -> Result<SubscriptionHandle> {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self
            .shared
            .with_engine(|engine| engine.subscribe(query.clone(), tx))?;
        Ok(SubscriptionHandle {
            id,
            query,
            events: rx,
            shared: Arc::downgrade(&self.shared),
            active: true,
        })
    }

    pub fn write(&self, op: WriteOp) -> RequestFuture {
        let (tx, rx) = oneshot::channel();
        let id = self.shared.with_engine(|engine| engine.write(op, tx));
        self.future(id, rx)
    }

    pub fn mutate(&self, collection: &str, doc_id: &str, value: JsonObject) -> RequestFuture {
        self.write(WriteOp::mutate(collection, doc_id, value))
    }

    pub fn merge(&self, collection: &str, doc_id: &str, partial: JsonObject) -> RequestFuture {
        self.write(WriteOp::merge(collection, doc_id, partial))
    }

    pub fn delete(&self, collection: &str, doc_id: &str) -> RequestFuture {
        self.write(WriteOp::delete(collection, doc_id))
    }

    /// One-shot read of a query's current result.
    pub fn fetch(&self, query: Query) -> impl Future<Output = Result<Vec<DocumentSnapshot>>> + Send + 'static {
        let collection = query.collection.clone();
        let (tx, rx) = oneshot::channel();
        let id = self.shared.with_engine(|engine| engine.fetch(query, None, tx));
        let request = self.future(id, rx);
        async move { Ok(request.await?.into_snapshots(&collection)) }
    }

    /// One-shot read of a single document.
    pub fn fetch_document(
        &self,
        collection: &str,
        doc_id: &str,
    ) -> impl Future<Output = Result<Option<DocumentSnapshot>>> + Send + 'static {
        let collection = collection.to_string();
        let doc_id = doc_id.to_string();
        let (tx, rx) = oneshot::channel();
        let id = self.shared.with_engine(|engine| {
            engine.fetch(Query::new(collection.clone()), Some(doc_id.clone()), tx)
        });
        let request = self.future(id, rx);
        async move {
            let ack = request.await?;
            Ok(ack
                .into_snapshots(&collection)
                .into_iter()
                .find(|snapshot| snapshot.id == doc_id))
        }
    }

    /// Optimistic read-modify-write of one document.
    ///
    /// `transform` sees the current snapshot (`None` if missing) and may run
    /// several times when the write conflicts with someone else's.
    pub fn execute_optimistic<F>(&self, collection: &str, doc_id: &str, transform: F) -> RequestFuture
    where
        F: FnMut(Option<&DocumentSnapshot>) -> ExecutionResult + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        self.shared
            .with_engine(|engine| engine.execute(collection, doc_id, Box::new(transform), tx));
        self.future(None, rx)
    }

    // ── Actions ────────────────────────────────────────────────

    /// Replay `write` every time the connection comes up.
    ///
    /// One-shot actions (`persistent == false`) are dropped after their
    /// first acknowledged run.
    pub fn register_on_connect(&self, write: WriteOp, persistent: bool) -> Result<ActionHandle> {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self
            .shared
            .with_engine(|engine| engine.register_on_connect(write, persistent, tx))?;
        Ok(self.action_handle(id, rx))
    }

    /// Have the server apply `write` when this connection goes away.
    pub fn register_on_disconnect(&self, write: WriteOp) -> Result<ActionHandle> {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self
            .shared
            .with_engine(|engine| engine.register_on_disconnect(write, tx))?;
        Ok(self.action_handle(id, rx))
    }

    pub fn cancel_action(&self, action_id: &str) -> bool {
        self.shared.with_engine(|engine| engine.cancel_action(action_id))
    }

    fn action_handle(&self, id: String, events: mpsc::UnboundedReceiver<ActionEvent>) -> ActionHandle {
        ActionHandle {
            id,
            events,
            shared: Arc::downgrade(&self.shared),
        }
    }

    fn future(&self, correlation_id: Option<String>, receiver: oneshot::Receiver<Result<Ack>>) -> RequestFuture {
        RequestFuture {
            correlation_id,
            receiver,
            shared: Arc::downgrade(&self.shared),
        }
    }
}

/// Reader task: feeds transport events into the engine and sends a
/// heartbeat whenever the connection has been idle for `heartbeat`.
async fn read_loop(
    shared: Weak<Shared>,
    epoch: u64,
    mut incoming: mpsc::Receiver<TransportEvent>,
    heartbeat: Duration,
) {
    loop {
        let received = tokio::time::timeout(heartbeat, incoming.recv()).await;
        let Some(shared) = shared.upgrade() else {
            return;
        };
        match received {
            Err(_) => {
                if !shared.with_engine(|engine| engine.heartbeat(epoch)) {
                    return;
                }
            }
            Ok(Some(TransportEvent::Message(text))) => {
                shared.with_engine(|engine| engine.handle_frame(epoch, &text));
            }
            Ok(Some(TransportEvent::Closed(reason))) => {
                shared.with_engine(|engine| engine.transport_closed(epoch, reason));
                return;
            }
            Ok(Some(TransportEvent::Error(error))) => {
                shared.with_engine(|engine| engine.transport_error(epoch, error));
                return;
            }
            Ok(None) => {
                shared.with_engine(|engine| engine.transport_closed(epoch, None));
                return;
            }
        }
    }
}

/// Outcome of one request.
///
/// Resolves exactly once: with the server's answer, `Timeout`,
/// `ConnectionLost` or `Cancelled`.
pub struct RequestFuture {
    correlation_id: Option<String>,
    receiver: oneshot::Receiver<Result<Ack>>,
    shared: Weak<Shared>,
}

impl RequestFuture {
    pub fn correlation_id(&self) -> Option<&str> {
        self.correlation_id.as_deref()
    }

    /// Cancel the request; `false` if it already completed.
    pub fn cancel(&self) -> bool {
        match (&self.correlation_id, self.shared.upgrade()) {
            (Some(id), Some(shared)) => shared.with_engine(|engine| engine.cancel_request(id)),
            _ => false,
        }
    }
}

impl Future for RequestFuture {
    type Output = Result<Ack>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.receiver)
            .poll(cx)
            .map(|received| received.unwrap_or(Err(RapidError::Cancelled)))
    }
}

/// A caller's view of a live subscription. Dropping it unsubscribes.
#[derive(Debug)]
pub struct SubscriptionHandle {
    id: HandleId,
    query: Query,
    events: mpsc::UnboundedReceiver<SubscriptionEvent>,
    shared: Weak<Shared>,
    active: bool,
}

impl SubscriptionHandle {
    pub fn query(&self) -> &Query {
        &self.query
    }

    /// Next diff or failure; `None` after the subscription ended.
    pub async fn next(&mut self) -> Option<SubscriptionEvent> {
        self.events.recv().await
    }

    pub fn try_next(&mut self) -> Option<SubscriptionEvent> {
        self.events.try_recv().ok()
    }

    pub fn unsubscribe(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if !std::mem::take(&mut self.active) {
            return;
        }
        if let Some(shared) = self.shared.upgrade() {
            let id = self.id;
            shared.with_engine(|engine| engine.unsubscribe(id));
        }
    }
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        self.release();
    }
}

/// A registered on-connect or on-disconnect action.
pub struct ActionHandle {
    id: String,
    events: mpsc::UnboundedReceiver<ActionEvent>,
    shared: Weak<Shared>,
}

impl ActionHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub async fn next(&mut self) -> Option<ActionEvent> {
        self.events.recv().await
    }

    pub fn try_next(&mut self) -> Option<ActionEvent> {
        self.events.try_recv().ok()
    }

    pub fn cancel(&self) -> bool {
        match self.shared.upgrade() {
            Some(shared) => shared.with_engine(|engine| engine.cancel_action(&self.id)),
            None => false,
        }
    }
}
