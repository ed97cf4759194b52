//! Synchronization engine: the single block of client state.
//!
//! ```text
//!   public ops ──┐                        ┌──► outgoing frames (transport)
//!   frames in ───┼──► SyncEngine (locked) ┤
//!   timers ──────┘                        └──► Effects (dispatched unlocked)
//! ```
//!
//! The engine is synchronous. The client locks it, calls one method, takes
//! the collected [`Effect`]s and runs them after unlocking: completing
//! futures, delivering subscription diffs, notifying action owners and
//! running optimistic transforms.
//!
//! Every transport gets an epoch. Events from an older epoch are ignored,
//! so a late close from a replaced socket cannot tear down a new one.

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

use crate::actions::{ActionEvent, ActionKind, ActionNotice, ActionRegistry};
use crate::config::ClientConfig;
use crate::connection::{ConnectionEvent, ConnectionState, Outbound, OutboundQueue};
use crate::diff::Change;
use crate::document::DocumentSnapshot;
use crate::error::{RapidError, Result};
use crate::mutation::{plain_write, ExecutionResult, ExecutionStep, MutationCoordinator, Transform};
use crate::pending::{Completion, PendingRequest, PendingTable, TimerScheduler};
use crate::protocol::{Ack, ClientRequest, ServerMessage, WriteOp};
use crate::query::{validate_identifier, Query};
use crate::subscription::{
    Delivery, HandleId, Resubscription, SubscribePlan, SubscriptionEvent, SubscriptionManager,
    UnsubscribePlan,
};

/// Work to do once the engine lock is released.
pub enum Effect {
    Complete {
        completion: oneshot::Sender<Result<Ack>>,
        result: Result<Ack>,
    },
    Deliver(Delivery),
    Notify(ActionNotice),
    Transform {
        key: String,
        transform: Transform,
        snapshot: Option<DocumentSnapshot>,
    },
    Connection(ConnectionEvent),
    /// A transform the engine no longer needs; dropped after unlocking
    Release(Transform),
}

impl std::fmt::Debug for Effect {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Complete { result, .. } => write!(f, "Complete({result:?})"),
            Self::Deliver(delivery) => write!(f, "Deliver({:?})", delivery.event),
            Self::Notify(notice) => write!(f, "Notify({:?})", notice.event),
            Self::Transform { key, .. } => write!(f, "Transform({key})"),
            Self::Connection(event) => write!(f, "Connection({event:?})"),
            Self::Release(_) => write!(f, "Release"),
        }
    }
}

pub struct SyncEngine {
    config: ClientConfig,
    state: ConnectionState,
    epoch: u64,
    link: Option<mpsc::UnboundedSender<String>>,
    token: Option<String>,
    auth_waiters: Vec<oneshot::Sender<Result<Ack>>>,
    outbound: OutboundQueue,
    pending: PendingTable,
    subscriptions: SubscriptionManager,
    mutations: MutationCoordinator,
    actions: ActionRegistry,
    effects: Vec<Effect>,
}

impl SyncEngine {
    pub fn new(config: ClientConfig, timers: Arc<dyn TimerScheduler>) -> Self {
        Self {
            subscriptions: SubscriptionManager::new(config.cache_enabled),
            mutations: MutationCoordinator::new(config.optimistic_max_retries),
            pending: PendingTable::new(timers),
            config,
            state: ConnectionState::Disconnected,
            epoch: 0,
            link: None,
            token: None,
            auth_waiters: Vec::new(),
            outbound: OutboundQueue::new(),
            actions: ActionRegistry::new(),
            effects: Vec::new(),
        }
    }

    pub fn take_effects(&mut self) -> Vec<Effect> {
        std::mem::take(&mut self.effects)
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_current(&self, epoch: u64) -> bool {
        epoch == self.epoch
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn queued_len(&self) -> usize {
        self.outbound.len()
    }

    // ── Connection lifecycle ───────────────────────────────────

    /// Start connecting; returns the epoch of the new transport.
    pub fn begin_connect(&mut self) -> Result<u64> {
        match self.state {
            ConnectionState::Disconnected | ConnectionState::Disconnecting => {
                self.epoch += 1;
                self.state = ConnectionState::Connecting;
                self.effects.push(Effect::Connection(ConnectionEvent::Connecting));
                log::debug!("Connecting (epoch {})", self.epoch);
                Ok(self.epoch)
            }
            state => Err(RapidError::Generic(format!("connect while {state:?}"))),
        }
    }

    pub fn connect_failed(&mut self, epoch: u64, error: &RapidError) {
        if epoch != self.epoch || self.state != ConnectionState::Connecting {
            return;
        }
        log::warn!("Connect failed: {error}");
        self.state = ConnectionState::Disconnected;
        self.effects.push(Effect::Connection(ConnectionEvent::Disconnected {
            reason: Some(error.to_string()),
        }));
    }

    /// The transport for `epoch` is open.
    ///
    /// Sends `con` and `auth`, flushes the queue in FIFO order and replays
    /// on-connect actions. Returns `false` if the epoch was superseded, in
    /// which case `writer` is dropped.
    pub fn transport_opened(&mut self, epoch: u64, writer: mpsc::UnboundedSender<String>) -> bool {
        if epoch != self.epoch || self.state != ConnectionState::Connecting {
            return false;
        }
        self.link = Some(writer);
        self.state = ConnectionState::Connected;

        let connection_id = Uuid::new_v4().to_string();
        self.send(ClientRequest::Connect { connection_id }, Completion::Internal);
        if let Some(token) = self.token.clone() {
            self.send(
                ClientRequest::Authorize { token: token.clone() },
                Completion::Authorize { token, caller: None },
            );
        }

        let queued = self.outbound.drain();
        if !queued.is_empty() {
            log::info!("Flushing {} queued requests", queued.len());
        }
        for Outbound { correlation_id, frame } in queued {
            self.transmit(&correlation_id, frame);
        }

        for (action_id, write) in self.actions.on_connect_writes() {
            self.send(
                ClientRequest::OnConnectAction { action_id: action_id.clone(), write },
                Completion::OnConnectAction { action_id },
            );
        }

        log::info!("Connected (epoch {epoch})");
        self.effects.push(Effect::Connection(ConnectionEvent::Connected));
        true
    }

    pub fn transport_closed(&mut self, epoch: u64, reason: Option<String>) {
        if epoch != self.epoch || self.state != ConnectionState::Connected {
            return;
        }
        log::info!("Transport closed: {}", reason.as_deref().unwrap_or("no reason"));
        self.leave_connected(reason);
    }

    pub fn transport_error(&mut self, epoch: u64, error: String) {
        if epoch != self.epoch || self.state != ConnectionState::Connected {
            return;
        }
        log::warn!("Transport error: {error}");
        self.leave_connected(Some(error));
    }

    /// Close the connection on request; further events of the current
    /// transport are ignored.
    pub fn disconnect(&mut self) {
        self.epoch += 1;
        match self.state {
            ConnectionState::Connected => self.leave_connected(Some("disconnected by client".into())),
            ConnectionState::Connecting => {
                self.state = ConnectionState::Disconnected;
                self.effects.push(Effect::Connection(ConnectionEvent::Disconnected {
                    reason: Some("disconnected by client".into()),
                }));
            }
            ConnectionState::Disconnected | ConnectionState::Disconnecting => {}
        }
    }

    fn leave_connected(&mut self, reason: Option<String>) {
        self.state = ConnectionState::Disconnecting;
        self.link = None;

        let mut requeued = Vec::new();
        for entry in self.pending.fail_connection_lost() {
            match entry.completion {
                // Rebuilt below or fired by the action registry
                Completion::Subscribe { .. }
                | Completion::Unsubscribe { .. }
                | Completion::OnDisconnectAction { .. }
                | Completion::Internal => {}
                _ if entry.always_timeout && !entry.request.connection_scoped() => {
                    requeued.push(Outbound {
                        correlation_id: entry.correlation_id.clone(),
                        frame: entry.frame.clone(),
                    });
                    self.pending.requeue(entry);
                }
                _ => self.resolve(entry, Err(RapidError::ConnectionLost)),
            }
        }

        let pending = &self.pending;
        let resubscriptions = self.subscriptions.connection_lost(|id| pending.contains(id));
        let mut frames: Vec<Outbound> = resubscriptions
            .into_iter()
            .filter_map(|resubscription| self.track_subscribe(resubscription))
            .collect();
        frames.extend(requeued);
        self.outbound.prepend(frames);

        for notice in self.actions.fire_on_disconnect() {
            self.effects.push(Effect::Notify(notice));
        }

        self.state = ConnectionState::Disconnected;
        log::info!("Disconnected ({} requests queued)", self.outbound.len());
        self.effects.push(Effect::Connection(ConnectionEvent::Disconnected { reason }));
    }

    /// Keep an idle connection alive.
    ///
    /// Returns `false` once `epoch` is stale so the reader can stop.
    pub fn heartbeat(&mut self, epoch: u64) -> bool {
        if epoch != self.epoch {
            return false;
        }
        if self.state == ConnectionState::Connected {
            log::trace!("Idle connection, sending heartbeat");
            self.send(ClientRequest::NoOperation, Completion::Internal);
        }
        true
    }

    // ── Sending ────────────────────────────────────────────────

    fn send(&mut self, request: ClientRequest, completion: Completion) -> String {
        let correlation_id = Uuid::new_v4().to_string();
        let frame = match request.encode(&correlation_id) {
            Ok(frame) => frame,
            Err(e) => {
                log::error!("Failed to encode {:?}: {e}", request.kind());
                self.resolve_completion(completion, &request, Err(e));
                return correlation_id;
            }
        };

        if !request.needs_acknowledgement() {
            if self.state == ConnectionState::Connected {
                self.write_frame(frame);
            }
            return correlation_id;
        }

        let clock = request
            .always_timeout()
            .then(|| self.config.timeout_for(true))
            .flatten();
        self.pending
            .track(correlation_id.clone(), request, frame.clone(), completion, clock);
        if self.state == ConnectionState::Connected {
            self.transmit(&correlation_id, frame);
        } else {
            self.outbound.enqueue(correlation_id.clone(), frame);
        }
        correlation_id
    }

    fn transmit(&mut self, correlation_id: &str, frame: String) {
        self.write_frame(frame);
        self.pending
            .mark_transmitted(correlation_id, self.config.request_timeout);
    }

    fn write_frame(&mut self, frame: String) {
        let Some(link) = &self.link else {
            return;
        };
        if link.send(frame).is_err() {
            log::warn!("Transport writer is gone; frame dropped");
        }
    }

    fn track_subscribe(&mut self, resubscription: Resubscription) -> Option<Outbound> {
        let Resubscription { hash, subscription_id, query } = resubscription;
        let request = ClientRequest::Subscribe { subscription_id, query };
        let correlation_id = Uuid::new_v4().to_string();
        let frame = match request.encode(&correlation_id) {
            Ok(frame) => frame,
            Err(e) => {
                log::error!("Failed to encode subscription {hash}: {e}");
                return None;
            }
        };
        self.pending.track(
            correlation_id.clone(),
            request,
            frame.clone(),
            Completion::Subscribe { hash: hash.clone() },
            None,
        );
        self.subscriptions.subscribe_sent(&hash, correlation_id.clone());
        Some(Outbound { correlation_id, frame })
    }

    fn send_subscribe(&mut self, resubscription: Resubscription) {
        let hash = resubscription.hash.clone();
        let request = ClientRequest::Subscribe {
            subscription_id: resubscription.subscription_id,
            query: resubscription.query,
        };
        let correlation_id = self.send(request, Completion::Subscribe { hash: hash.clone() });
        self.subscriptions.subscribe_sent(&hash, correlation_id);
    }

    // ── Inbound ────────────────────────────────────────────────

    /// Route one inbound frame (a single envelope or a batch).
    pub fn handle_frame(&mut self, epoch: u64, text: &str) {
        if epoch != self.epoch || self.state != ConnectionState::Connected {
            return;
        }
        let messages = match ServerMessage::parse_frame(text) {
            Ok(messages) => messages,
            Err(e) => {
                log::warn!("Dropping undecodable frame: {e}");
                return;
            }
        };
        // Result-set changes are staged per subscription so that a batch
        // is diffed once; errors and cancellations flush them first.
        let mut staged: Vec<(String, Change)> = Vec::new();
        for message in messages {
            match message {
                ServerMessage::Value { subscription_id, documents } => {
                    stage(&mut staged, subscription_id, Change::Full(documents));
                }
                ServerMessage::Update { subscription_id, documents } => {
                    stage(&mut staged, subscription_id, Change::Incremental(documents));
                }
                ServerMessage::Ack { .. } => self.handle_message(message),
                other => {
                    self.apply_staged(std::mem::take(&mut staged));
                    self.handle_message(other);
                }
            }
        }
        self.apply_staged(staged);
    }

    fn apply_staged(&mut self, staged: Vec<(String, Change)>) {
        for (subscription_id, change) in staged {
            let deliveries = self.subscriptions.apply(&subscription_id, change);
            self.deliver(deliveries);
        }
    }

    fn handle_message(&mut self, message: ServerMessage) {
        match message {
            ServerMessage::Ack { correlation_id, ack } => match self.pending.acknowledge(&correlation_id) {
                Some(entry) => self.resolve(entry, Ok(ack)),
                None => log::debug!("Dropping ack for unknown request {correlation_id}"),
            },
            ServerMessage::Error { correlation_id, error } => match self.pending.acknowledge(&correlation_id) {
                Some(entry) => self.resolve(entry, Err(error)),
                None => log::debug!("Dropping error for unknown request {correlation_id}: {error}"),
            },
            ServerMessage::Value { subscription_id, documents } => {
                let deliveries = self.subscriptions.apply(&subscription_id, Change::Full(documents));
                self.deliver(deliveries);
            }
            ServerMessage::Update { subscription_id, documents } => {
                let deliveries = self
                    .subscriptions
                    .apply(&subscription_id, Change::Incremental(documents));
                self.deliver(deliveries);
            }
            ServerMessage::SubscriptionCancelled { subscription_id, reason } => {
                let reason = reason.unwrap_or_else(|| "subscription cancelled by server".into());
                let deliveries = self
                    .subscriptions
                    .fail_by_id(&subscription_id, RapidError::PermissionDenied(reason));
                self.deliver(deliveries);
            }
        }
    }

    fn deliver(&mut self, deliveries: Vec<Delivery>) {
        self.effects.extend(deliveries.into_iter().map(Effect::Deliver));
    }

    // ── Completion ─────────────────────────────────────────────

    /// Timer expiry for a tracked request.
    pub fn expire(&mut self, correlation_id: &str) {
        if let Some(entry) = self.pending.expire(correlation_id) {
            self.outbound.withdraw(correlation_id);
            self.resolve(entry, Err(RapidError::Timeout));
        }
    }

    /// Cancel a tracked request; `false` if it already finished.
    pub fn cancel_request(&mut self, correlation_id: &str) -> bool {
        match self.pending.cancel(correlation_id) {
            Some(entry) => {
                self.outbound.withdraw(correlation_id);
                self.resolve(entry, Err(RapidError::Cancelled));
                true
            }
            None => false,
        }
    }

    /// Fail every outstanding request with `Timeout`, oldest first.
    pub fn timeout_all(&mut self) {
        for entry in self.pending.timeout_all() {
            self.outbound.withdraw(&entry.correlation_id);
            self.resolve(entry, Err(RapidError::Timeout));
        }
    }

    fn resolve(&mut self, entry: PendingRequest, result: Result<Ack>) {
        let PendingRequest { request, completion, .. } = entry;
        self.resolve_completion(completion, &request, result);
    }

    fn resolve_completion(&mut self, completion: Completion, request: &ClientRequest, result: Result<Ack>) {
        match completion {
            Completion::Caller(completion) => self.effects.push(Effect::Complete { completion, result }),
            Completion::Authorize { token, caller } => self.authorized(token, caller, result),
            Completion::Subscribe { hash } => {
                let current = matches!(
                    request,
                    ClientRequest::Subscribe { subscription_id, .. }
                        if self.subscriptions.subscription_id(&hash) == Some(subscription_id.as_str())
                );
                if !current {
                    return;
                }
                match result {
                    Ok(_) => self.subscriptions.subscribe_acknowledged(&hash),
                    Err(e) => {
                        let deliveries = self.subscriptions.fail(&hash, e);
                        self.deliver(deliveries);
                    }
                }
            }
            Completion::Unsubscribe { hash } => {
                let current = matches!(
                    request,
                    ClientRequest::Unsubscribe { subscription_id }
                        if self.subscriptions.subscription_id(&hash) == Some(subscription_id.as_str())
                );
                if let Err(e) = &result {
                    log::debug!("Unsubscribe of {hash} failed ({e}); treating it as done");
                }
                if current {
                    if let Some(resubscription) = self.subscriptions.unsubscribe_completed(&hash) {
                        self.send_subscribe(resubscription);
                    }
                }
            }
            Completion::ExecutionFetch { key } => {
                let steps = self.mutations.fetched(&key, result);
                self.apply_steps(steps);
            }
            Completion::ExecutionWrite { key } => {
                let steps = self.mutations.written(&key, result);
                self.apply_steps(steps);
            }
            Completion::OnConnectAction { action_id } => {
                if let Some(notice) = self.actions.on_connect_result(&action_id, &result) {
                    self.effects.push(Effect::Notify(notice));
                }
            }
            Completion::OnDisconnectAction { action_id } => {
                if let Err(e) = result {
                    if let Some(notice) = self.actions.on_disconnect_rejected(&action_id, e) {
                        self.effects.push(Effect::Notify(notice));
                    }
                }
            }
            Completion::Internal => {
                if let Err(e) = result {
                    log::warn!("{:?} failed: {e}", request.kind());
                }
            }
        }
    }

    fn authorized(&mut self, token: String, caller: Option<oneshot::Sender<Result<Ack>>>, result: Result<Ack>) {
        let current = self.token.as_deref() == Some(token.as_str());
        if let Err(RapidError::PermissionDenied(reason)) = &result {
            log::warn!("Authorization rejected: {reason}");
            if current {
                self.token = None;
            }
        }
        if current && !matches!(result, Err(RapidError::ConnectionLost)) {
            for waiter in std::mem::take(&mut self.auth_waiters) {
                self.effects.push(Effect::Complete {
                    completion: waiter,
                    result: result.clone(),
                });
            }
        }
        if let Some(completion) = caller {
            self.effects.push(Effect::Complete { completion, result });
        }
    }

    // ── Optimistic executions ──────────────────────────────────

    fn apply_steps(&mut self, steps: Vec<ExecutionStep>) {
        for step in steps {
            match step {
                ExecutionStep::Fetch { key, collection, doc_id } => {
                    self.send(
                        ClientRequest::Fetch {
                            query: Query::new(collection),
                            doc_id: Some(doc_id),
                        },
                        Completion::ExecutionFetch { key },
                    );
                }
                ExecutionStep::Transform { key, transform, snapshot } => {
                    self.effects.push(Effect::Transform { key, transform, snapshot });
                }
                ExecutionStep::Write { key, op } => {
                    self.send(ClientRequest::Write(op), Completion::ExecutionWrite { key });
                }
                ExecutionStep::Complete { completion, result } => {
                    self.effects.push(Effect::Complete { completion, result });
                }
                ExecutionStep::Release(transform) => self.effects.push(Effect::Release(transform)),
            }
        }
    }

    /// A transform handed out as [`Effect::Transform`] returned `outcome`.
    pub fn transform_finished(&mut self, key: &str, transform: Transform, outcome: ExecutionResult) {
        let steps = self.mutations.transformed(key, transform, outcome);
        self.apply_steps(steps);
    }

    pub fn execute(
        &mut self,
        collection: &str,
        doc_id: &str,
        transform: Transform,
        completion: oneshot::Sender<Result<Ack>>,
    ) {
        if let Err(e) = validate_identifier(collection).and_then(|_| validate_identifier(doc_id)) {
            self.effects.push(Effect::Complete { completion, result: Err(e) });
            self.effects.push(Effect::Release(transform));
            return;
        }
        let steps = self.mutations.execute(collection, doc_id, transform, completion);
        self.apply_steps(steps);
    }

    // ── Public operations ──────────────────────────────────────

    pub fn subscribe(
        &mut self,
        query: Query,
        events: mpsc::UnboundedSender<SubscriptionEvent>,
    ) -> Result<HandleId> {
        query.validate()?;
        let (handle, plan, deliveries) = self.subscriptions.subscribe(query, events);
        self.deliver(deliveries);
        match plan {
            SubscribePlan::Register { hash, subscription_id, query } => {
                self.send_subscribe(Resubscription { hash, subscription_id, query });
            }
            SubscribePlan::Attached => {}
            SubscribePlan::Revive { hash, unsubscribe_request } => {
                let withdrawn = self.outbound.withdraw(&unsubscribe_request);
                if withdrawn {
                    self.pending.cancel(&unsubscribe_request);
                    log::debug!("Withdrew queued unsubscribe for {hash}");
                }
                self.subscriptions.revived(&hash, withdrawn);
            }
        }
        Ok(handle)
    }

    pub fn unsubscribe(&mut self, handle: HandleId) {
        let UnsubscribePlan::LastHandleGone { hash, subscription_id, pending_subscribe } =
            self.subscriptions.unsubscribe(handle)
        else {
            return;
        };
        if let Some(request) = pending_subscribe {
            if self.outbound.withdraw(&request) {
                // The server never heard of it.
                self.pending.cancel(&request);
                self.subscriptions.remove(&hash);
                return;
            }
        }
        let correlation_id = self.send(
            ClientRequest::Unsubscribe { subscription_id },
            Completion::Unsubscribe { hash: hash.clone() },
        );
        self.subscriptions.unsubscribe_sent(&hash, correlation_id);
    }

    /// Queue a plain write; returns its correlation id.
    pub fn write(&mut self, op: WriteOp, completion: oneshot::Sender<Result<Ack>>) -> Option<String> {
        match plain_write(op) {
            Ok(op) => Some(self.send(ClientRequest::Write(op), Completion::Caller(completion))),
            Err(e) => {
                self.effects.push(Effect::Complete { completion, result: Err(e) });
                None
            }
        }
    }

    /// Queue a fetch; returns its correlation id.
    pub fn fetch(
        &mut self,
        query: Query,
        doc_id: Option<String>,
        completion: oneshot::Sender<Result<Ack>>,
    ) -> Option<String> {
        let valid = query
            .validate()
            .and_then(|_| doc_id.as_deref().map_or(Ok(()), validate_identifier));
        match valid {
            Ok(()) => Some(self.send(ClientRequest::Fetch { query, doc_id }, Completion::Caller(completion))),
            Err(e) => {
                self.effects.push(Effect::Complete { completion, result: Err(e) });
                None
            }
        }
    }

    pub fn register_on_connect(
        &mut self,
        write: WriteOp,
        persistent: bool,
        notifier: mpsc::UnboundedSender<ActionEvent>,
    ) -> Result<String> {
        write.validate()?;
        let action_id = self.actions.register_on_connect(write.clone(), persistent, notifier);
        if self.state == ConnectionState::Connected {
            self.send(
                ClientRequest::OnConnectAction { action_id: action_id.clone(), write },
                Completion::OnConnectAction { action_id: action_id.clone() },
            );
        }
        Ok(action_id)
    }

    pub fn register_on_disconnect(
        &mut self,
        write: WriteOp,
        notifier: mpsc::UnboundedSender<ActionEvent>,
    ) -> Result<String> {
        write.validate()?;
        let action_id = self.actions.register_on_disconnect(write.clone(), notifier);
        self.send(
            ClientRequest::OnDisconnectAction { action_id: action_id.clone(), write },
            Completion::OnDisconnectAction { action_id: action_id.clone() },
        );
        Ok(action_id)
    }

    pub fn cancel_action(&mut self, action_id: &str) -> bool {
        let Some((kind, notice)) = self.actions.cancel(action_id) else {
            return false;
        };
        self.effects.push(Effect::Notify(notice));
        if kind == ActionKind::OnDisconnect {
            self.send(
                ClientRequest::CancelOnDisconnect { action_id: action_id.to_string() },
                Completion::Internal,
            );
        }
        true
    }

    pub fn set_token(&mut self, token: Option<String>) {
        self.token = token;
    }

    /// Store `token` and authorize with it.
    ///
    /// While disconnected the caller is answered by the next handshake.
    pub fn authorize(&mut self, token: String, completion: oneshot::Sender<Result<Ack>>) {
        self.token = Some(token.clone());
        if self.state == ConnectionState::Connected {
            self.send(
                ClientRequest::Authorize { token: token.clone() },
                Completion::Authorize { token, caller: Some(completion) },
            );
        } else {
            self.auth_waiters.push(completion);
        }
    }

    pub fn deauthorize(&mut self, completion: oneshot::Sender<Result<Ack>>) -> String {
        self.token = None;
        for waiter in std::mem::take(&mut self.auth_waiters) {
            self.effects.push(Effect::Complete {
                completion: waiter,
                result: Err(RapidError::Cancelled),
            });
        }
        self.send(ClientRequest::Deauthorize, Completion::Caller(completion))
    }
}

fn stage(staged: &mut Vec<(String, Change)>, subscription_id: String, change: Change) {
    match staged.iter_mut().find(|(id, _)| *id == subscription_id) {
        Some((_, pending)) => {
            let earlier = std::mem::replace(pending, Change::Incremental(Vec::new()));
            *pending = earlier.absorb(change);
        }
        None => staged.push((subscription_id, change)),
    }
}
