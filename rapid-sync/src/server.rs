//! In-memory reference server speaking the rapid-sync protocol.
//!
//! Architecture:
//! ```text
//! Client A ──┐                                ┌── Session A (subscriptions, last wills)
//!            ├── handle_connection ── Store ──┤
//! Client B ──┘        │                       └── Session B
//!                     │
//!                     └── write ──► ChangeFeed ──► every session re-evaluates the
//!                                                  subscriptions on that collection
//!                                                  and sends `upd` diffs
//! ```
//!
//! Documents live in a per-collection map, each with a monotonically
//! increasing etag (`v1`, `v2`, ...). Conditional writes are checked against
//! that etag. Each connection keeps the set of document ids and etags it has
//! already reported per subscription, so updates carry only what changed.
//!
//! The server is meant for tests and local development: no persistence, no
//! security rules beyond an optional shared token.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::RwLock;
use tokio_tungstenite::tungstenite::Message;

use crate::broadcast::{ChangeFeed, FeedStats};
use crate::document::{merge_into, DocumentChange, DocumentSnapshot, JsonObject};
use crate::error::{RapidError, Result};
use crate::protocol::{Ack, ClientRequest, Envelope, ServerMessage, WriteKind, WriteOp};
use crate::query::Query;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// How many change notices a connection may fall behind before it
    /// re-evaluates all of its subscriptions
    pub feed_capacity: usize,
    /// When set, `auth` must present this token before reads and writes
    pub required_token: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            feed_capacity: 256,
            required_token: None,
        }
    }
}

impl ServerConfig {
    pub fn with_bind_addr(mut self, bind_addr: impl Into<String>) -> Self {
        self.bind_addr = bind_addr.into();
        self
    }

    pub fn with_required_token(mut self, token: impl Into<String>) -> Self {
        self.required_token = Some(token.into());
        self
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub subscribe_requests: u64,
    pub fetch_requests: u64,
    pub write_requests: u64,
    pub conflicts: u64,
    pub last_wills_applied: u64,
}

/// collection → document id → latest snapshot
type Store = HashMap<String, HashMap<String, DocumentSnapshot>>;

struct ServerState {
    config: ServerConfig,
    store: RwLock<Store>,
    feed: ChangeFeed,
    stats: RwLock<ServerStats>,
    version: AtomicU64,
    injected_conflicts: AtomicU32,
}

/// A subscription as seen by one connection.
struct SessionSubscription {
    query: Query,
    /// document id → etag last reported to the client
    reported: HashMap<String, Option<String>>,
}

/// Per-connection state.
#[derive(Default)]
struct Session {
    authorized: bool,
    subscriptions: HashMap<String, SessionSubscription>,
    /// Writes applied when the connection goes away, in registration order
    last_wills: Vec<(String, WriteOp)>,
}

/// The reference sync server.
#[derive(Clone)]
pub struct SyncServer {
    state: Arc<ServerState>,
}

impl SyncServer {
    /// Create a new sync server with the given configuration.
    pub fn new(config: ServerConfig) -> Self {
        let feed = ChangeFeed::new(config.feed_capacity);
        Self {
            state: Arc::new(ServerState {
                config,
                store: RwLock::new(Store::new()),
                feed,
                stats: RwLock::new(ServerStats::default()),
                version: AtomicU64::new(0),
                injected_conflicts: AtomicU32::new(0),
            }),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(ServerConfig::default())
    }

    /// Bind the configured address and serve until the listener fails.
    pub async fn run(&self) -> std::result::Result<(), BoxError> {
        let listener = TcpListener::bind(&self.state.config.bind_addr).await?;
        log::info!("Sync server listening on {}", self.state.config.bind_addr);
        self.serve(listener).await
    }

    /// Serve connections accepted from an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> std::result::Result<(), BoxError> {
        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let state = self.state.clone();
            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, addr, state).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    /// Store a document directly, bypassing the protocol. Returns its etag.
    pub async fn seed(&self, collection: &str, doc_id: &str, value: JsonObject) -> Result<String> {
        let ack = self
            .state
            .apply_write(&WriteOp::mutate(collection, doc_id, value))
            .await?;
        ack.etag
            .ok_or_else(|| RapidError::Generic(format!("no etag for {collection}/{doc_id}")))
    }

    /// Current stored value of a document.
    pub async fn document(&self, collection: &str, doc_id: &str) -> Option<DocumentSnapshot> {
        let store = self.state.store.read().await;
        store.get(collection).and_then(|docs| docs.get(doc_id)).cloned()
    }

    /// Reject the next `count` conditional writes with a conflict.
    pub fn inject_conflicts(&self, count: u32) {
        self.state.injected_conflicts.store(count, Ordering::SeqCst);
    }

    /// Get server statistics.
    pub async fn stats(&self) -> ServerStats {
        self.state.stats.read().await.clone()
    }

    pub fn feed_stats(&self) -> FeedStats {
        self.state.feed.stats()
    }

    /// Get the configured bind address.
    pub fn bind_addr(&self) -> &str {
        &self.state.config.bind_addr
    }
}

impl ServerState {
    fn next_etag(&self) -> String {
        format!("v{}", self.version.fetch_add(1, Ordering::SeqCst) + 1)
    }

    /// Take one injected conflict, if any are left.
    fn take_injected_conflict(&self) -> bool {
        self.injected_conflicts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    /// Apply a write under the store lock and publish the change.
    async fn apply_write(&self, op: &WriteOp) -> Result<Ack> {
        op.validate()?;
        let mut store = self.store.write().await;
        let docs = store.entry(op.collection.clone()).or_default();
        let current = docs.get(&op.doc_id);

        if !op.etag.is_any() && self.take_injected_conflict() {
            return Err(RapidError::Conflict);
        }
        if !op.etag.allows(current.and_then(|doc| doc.etag.as_deref())) {
            return Err(RapidError::Conflict);
        }

        let value = match op.kind {
            WriteKind::Delete => {
                if docs.remove(&op.doc_id).is_some() {
                    self.feed
                        .publish(op.collection.clone(), DocumentChange::removal(op.doc_id.clone()));
                }
                return Ok(Ack::default());
            }
            WriteKind::Mutate => op.value.clone().unwrap_or_default(),
            WriteKind::Merge => {
                let mut value = current.map(|doc| doc.value.clone()).unwrap_or_default();
                merge_into(&mut value, op.value.clone().unwrap_or_default());
                value
            }
        };

        let etag = self.next_etag();
        let snapshot = DocumentSnapshot::new(op.collection.clone(), op.doc_id.clone(), value)
            .with_etag(etag.clone());
        let change = DocumentChange::from(&snapshot);
        docs.insert(op.doc_id.clone(), snapshot);
        self.feed.publish(op.collection.clone(), change);
        log::trace!("Applied {:?} to {}/{} as {etag}", op.kind, op.collection, op.doc_id);
        Ok(Ack::with_etag(etag))
    }

    async fn evaluate(&self, query: &Query) -> Vec<DocumentSnapshot> {
        let store = self.store.read().await;
        match store.get(&query.collection) {
            Some(docs) => query.evaluate(docs.values()),
            None => Vec::new(),
        }
    }

    async fn fetch(&self, query: &Query, doc_id: Option<&str>) -> Result<Ack> {
        query.validate()?;
        let documents = match doc_id {
            Some(id) => {
                let store = self.store.read().await;
                store
                    .get(&query.collection)
                    .and_then(|docs| docs.get(id))
                    .map(DocumentChange::from)
                    .into_iter()
                    .collect()
            }
            None => self.evaluate(query).await.iter().map(DocumentChange::from).collect(),
        };
        Ok(Ack::with_documents(documents))
    }

    fn check_authorized(&self, session: &Session) -> Result<()> {
        if self.config.required_token.is_none() || session.authorized {
            Ok(())
        } else {
            Err(RapidError::PermissionDenied("not authorized".into()))
        }
    }

    async fn write_counted(&self, op: &WriteOp) -> Result<Ack> {
        let result = self.apply_write(op).await;
        let mut stats = self.stats.write().await;
        stats.write_requests += 1;
        if matches!(result, Err(RapidError::Conflict)) {
            stats.conflicts += 1;
        }
        result
    }

    /// Handle one client request; returns the frames to send back.
    async fn handle_request(
        &self,
        session: &mut Session,
        correlation_id: String,
        request: ClientRequest,
    ) -> Vec<ServerMessage> {
        let mut replies = Vec::new();
        let result: Result<Ack> = match request {
            ClientRequest::NoOperation => return replies,
            ClientRequest::Connect { connection_id } => {
                log::debug!("Connection {connection_id} opened");
                Ok(Ack::default())
            }
            ClientRequest::Authorize { token } => match &self.config.required_token {
                Some(required) if *required != token => {
                    session.authorized = false;
                    Err(RapidError::PermissionDenied("invalid token".into()))
                }
                _ => {
                    session.authorized = true;
                    Ok(Ack::default())
                }
            },
            ClientRequest::Deauthorize => {
                session.authorized = false;
                Ok(Ack::default())
            }
            ClientRequest::Subscribe { subscription_id, query } => {
                self.stats.write().await.subscribe_requests += 1;
                match self.check_authorized(session).and_then(|_| query.validate()) {
                    Ok(()) => {
                        let documents = self.evaluate(&query).await;
                        let reported = documents
                            .iter()
                            .map(|doc| (doc.id.clone(), doc.etag.clone()))
                            .collect();
                        session
                            .subscriptions
                            .insert(subscription_id.clone(), SessionSubscription { query, reported });
                        replies.push(ServerMessage::Ack {
                            correlation_id,
                            ack: Ack::default(),
                        });
                        replies.push(ServerMessage::Value {
                            subscription_id,
                            documents: documents.iter().map(DocumentChange::from).collect(),
                        });
                        return replies;
                    }
                    Err(error) => Err(error),
                }
            }
            ClientRequest::Unsubscribe { subscription_id } => {
                session.subscriptions.remove(&subscription_id);
                Ok(Ack::default())
            }
            ClientRequest::Fetch { query, doc_id } => {
                self.stats.write().await.fetch_requests += 1;
                match self.check_authorized(session) {
                    Ok(()) => self.fetch(&query, doc_id.as_deref()).await,
                    Err(error) => Err(error),
                }
            }
            ClientRequest::Write(op) | ClientRequest::OnConnectAction { write: op, .. } => {
                match self.check_authorized(session) {
                    Ok(()) => self.write_counted(&op).await,
                    Err(error) => Err(error),
                }
            }
            ClientRequest::OnDisconnectAction { action_id, write } => {
                match self.check_authorized(session).and_then(|_| write.validate()) {
                    Ok(()) => {
                        session.last_wills.retain(|(id, _)| *id != action_id);
                        session.last_wills.push((action_id, write));
                        Ok(Ack::default())
                    }
                    Err(error) => Err(error),
                }
            }
            ClientRequest::CancelOnDisconnect { action_id } => {
                session.last_wills.retain(|(id, _)| *id != action_id);
                Ok(Ack::default())
            }
        };
        replies.push(match result {
            Ok(ack) => ServerMessage::Ack { correlation_id, ack },
            Err(error) => ServerMessage::Error { correlation_id, error },
        });
        replies
    }

    /// Re-evaluate subscriptions and collect `upd` messages for whatever
    /// changed since the last report. `collection` narrows the refresh.
    async fn refresh(&self, session: &mut Session, collection: Option<&str>) -> Vec<ServerMessage> {
        let mut updates = Vec::new();
        for (subscription_id, subscription) in session.subscriptions.iter_mut() {
            if collection.is_some_and(|c| c != subscription.query.collection) {
                continue;
            }
            let documents = self.evaluate(&subscription.query).await;
            let mut changes = Vec::new();
            let mut still_present = HashMap::with_capacity(documents.len());
            for doc in &documents {
                if subscription.reported.get(&doc.id) != Some(&doc.etag) {
                    changes.push(DocumentChange::from(doc));
                }
                still_present.insert(doc.id.clone(), doc.etag.clone());
            }
            for id in subscription.reported.keys() {
                if !still_present.contains_key(id) {
                    changes.push(DocumentChange::removal(id.clone()));
                }
            }
            subscription.reported = still_present;
            if !changes.is_empty() {
                updates.push(ServerMessage::Update {
                    subscription_id: subscription_id.clone(),
                    documents: changes,
                });
            }
        }
        updates
    }

    async fn apply_last_wills(&self, session: &mut Session) {
        for (action_id, op) in session.last_wills.drain(..) {
            match self.apply_write(&op).await {
                Ok(_) => {
                    self.stats.write().await.last_wills_applied += 1;
                    log::info!("Applied on-disconnect action {action_id} to {}/{}", op.collection, op.doc_id);
                }
                Err(e) => log::warn!("On-disconnect action {action_id} failed: {e}"),
            }
        }
    }
}

/// Encode replies as one frame; several replies travel as a batch.
fn encode_replies(replies: &[ServerMessage]) -> Result<Option<String>> {
    match replies {
        [] => Ok(None),
        [single] => single.encode().map(Some),
        many => {
            let envelopes = many
                .iter()
                .map(ServerMessage::to_envelope)
                .collect::<Result<Vec<_>>>()?;
            Envelope::encode_batch(&envelopes).map(Some)
        }
    }
}

/// Decode a client frame into requests, answering malformed envelopes
/// with an error where a correlation id is known.
fn decode_requests(text: &str) -> (Vec<(String, ClientRequest)>, Vec<ServerMessage>) {
    let mut requests = Vec::new();
    let mut errors = Vec::new();
    match Envelope::decode_frame(text) {
        Ok(envelopes) => {
            for envelope in envelopes {
                match ClientRequest::from_envelope(&envelope) {
                    Ok(request) => requests.push((envelope.id, request)),
                    Err(error) => errors.push(ServerMessage::Error {
                        correlation_id: envelope.id,
                        error,
                    }),
                }
            }
        }
        Err(e) => log::warn!("Dropping undecodable frame: {e}"),
    }
    (requests, errors)
}

/// Handle a single WebSocket connection.
async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    state: Arc<ServerState>,
) -> std::result::Result<(), BoxError> {
    let ws_stream = tokio_tungstenite::accept_async(stream).await?;
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();

    log::info!("WebSocket connection established from {addr}");

    {
        let mut s = state.stats.write().await;
        s.total_connections += 1;
        s.active_connections += 1;
    }

    let mut session = Session::default();
    let mut feed_rx = state.feed.subscribe();

    let outcome: std::result::Result<(), BoxError> = async {
        loop {
            let replies = tokio::select! {
                msg = ws_receiver.next() => match msg {
                    Some(Ok(Message::Text(text))) => {
                        state.stats.write().await.total_messages += 1;
                        let (requests, mut replies) = decode_requests(text.as_str());
                        for (correlation_id, request) in requests {
                            replies.extend(state.handle_request(&mut session, correlation_id, request).await);
                        }
                        replies
                    }
                    Some(Ok(Message::Ping(data))) => {
                        ws_sender.send(Message::Pong(data)).await?;
                        continue;
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        log::info!("Connection closed from {addr}");
                        break;
                    }
                    Some(Err(e)) => {
                        log::error!("WebSocket error from {addr}: {e}");
                        break;
                    }
                    Some(Ok(_)) => continue,
                },
                notice = feed_rx.recv() => match notice {
                    Ok(notice) => state.refresh(&mut session, Some(&notice.collection)).await,
                    Err(RecvError::Lagged(n)) => {
                        log::warn!("Connection {addr} lagged by {n} notices");
                        state.feed.record_lag(n);
                        state.refresh(&mut session, None).await
                    }
                    Err(RecvError::Closed) => break,
                },
            };
            if let Some(frame) = encode_replies(&replies)? {
                ws_sender.send(Message::Text(frame.into())).await?;
            }
        }
        Ok(())
    }
    .await;

    // Cleanup: fire last wills, then release the connection
    state.apply_last_wills(&mut session).await;
    {
        let mut s = state.stats.write().await;
        s.active_connections = s.active_connections.saturating_sub(1);
    }
    outcome
}
