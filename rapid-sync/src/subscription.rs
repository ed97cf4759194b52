//! Subscription manager: one server subscription per canonical query hash,
//! shared by any number of caller handles.
//!
//! ```text
//!                 subscribe ──► Registering ──ack──► Subscribed
//!                                    ▲                   │ last handle gone
//!   unsub ack with resubscribe flag  │                   ▼
//!                                    └────────────── Unsubscribing ──unsub ack──► (removed)
//! ```
//!
//! The manager only keeps bookkeeping. It tells the caller which frames to
//! send through [`SubscribePlan`] and [`UnsubscribePlan`], and it returns
//! [`Delivery`] values instead of sending on channels itself.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::mpsc;
use uuid::Uuid;

use crate::diff::{incorporate, Change, Diff};
use crate::document::DocumentSnapshot;
use crate::error::RapidError;
use crate::query::Query;

pub type HandleId = u64;

/// What a subscription handle receives.
#[derive(Debug, Clone)]
pub enum SubscriptionEvent {
    /// New result set and what changed; shared by all handles of the query
    Changed(Arc<Diff>),
    /// The subscription failed and was torn down
    Failed(RapidError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionState {
    Registering,
    Subscribed,
    Unsubscribing,
}

/// An event to hand to one listener once the client lock is released.
#[derive(Debug)]
pub struct Delivery {
    pub listener: mpsc::UnboundedSender<SubscriptionEvent>,
    pub event: SubscriptionEvent,
}

/// Frames required after a subscribe.
#[derive(Debug, Clone, PartialEq)]
pub enum SubscribePlan {
    /// A new server subscription must be requested.
    Register {
        hash: String,
        subscription_id: String,
        query: Query,
    },
    /// Joined a live subscription; nothing to send.
    Attached,
    /// Joined a subscription whose `unsub` is outstanding.
    Revive {
        hash: String,
        unsubscribe_request: String,
    },
}

/// Frames required after an unsubscribe.
#[derive(Debug, Clone, PartialEq)]
pub enum UnsubscribePlan {
    /// Other handles remain, or the handle was unknown.
    Retained,
    /// The last handle left.
    LastHandleGone {
        hash: String,
        subscription_id: String,
        /// `sub` that may still be waiting in the outbound queue
        pending_subscribe: Option<String>,
    },
}

struct Listener {
    handle: HandleId,
    events: mpsc::UnboundedSender<SubscriptionEvent>,
}

struct Subscription {
    subscription_id: String,
    query: Query,
    state: SubscriptionState,
    acknowledged: bool,
    listeners: Vec<Listener>,
    documents: Option<Vec<DocumentSnapshot>>,
    subscribe_request: Option<String>,
    unsubscribe_request: Option<String>,
    resubscribe_after_unsubscribe: bool,
}

impl Subscription {
    fn reset_to_registering(&mut self) {
        self.state = SubscriptionState::Registering;
        self.acknowledged = false;
        self.subscribe_request = None;
        self.unsubscribe_request = None;
        self.resubscribe_after_unsubscribe = false;
    }
}

/// Server subscription needed again, e.g. after reconnecting.
#[derive(Debug, Clone, PartialEq)]
pub struct Resubscription {
    pub hash: String,
    pub subscription_id: String,
    pub query: Query,
}

pub struct SubscriptionManager {
    subscriptions: HashMap<String, Subscription>,
    hash_by_id: HashMap<String, String>,
    hash_by_handle: HashMap<HandleId, String>,
    next_handle: HandleId,
    cache: Option<HashMap<String, Vec<DocumentSnapshot>>>,
}

impl SubscriptionManager {
    pub fn new(cache_enabled: bool) -> Self {
        Self {
            subscriptions: HashMap::new(),
            hash_by_id: HashMap::new(),
            hash_by_handle: HashMap::new(),
            next_handle: 1,
            cache: cache_enabled.then(HashMap::new),
        }
    }

    /// Attach a new handle for `query`.
    ///
    /// The returned deliveries carry the current result set for the new
    /// handle when one is already known.
    pub fn subscribe(
        &mut self,
        query: Query,
        events: mpsc::UnboundedSender<SubscriptionEvent>,
    ) -> (HandleId, SubscribePlan, Vec<Delivery>) {
        let hash = query.subscription_hash();
        let handle = self.next_handle;
        self.next_handle += 1;
        self.hash_by_handle.insert(handle, hash.clone());

        let mut deliveries = Vec::new();
        if let Some(sub) = self.subscriptions.get_mut(&hash) {
            if let Some(documents) = &sub.documents {
                deliveries.push(Delivery {
                    listener: events.clone(),
                    event: SubscriptionEvent::Changed(Arc::new(Diff::initial(documents.clone()))),
                });
            }
            sub.listeners.push(Listener { handle, events });
            let plan = match (&sub.state, &sub.unsubscribe_request) {
                (SubscriptionState::Unsubscribing, Some(request)) if !sub.resubscribe_after_unsubscribe => {
                    SubscribePlan::Revive {
                        hash,
                        unsubscribe_request: request.clone(),
                    }
                }
                _ => SubscribePlan::Attached,
            };
            log::debug!("Handle {handle} joined subscription {}", sub.subscription_id);
            return (handle, plan, deliveries);
        }

        let subscription_id = Uuid::new_v4().to_string();
        let cached = self.cache.as_mut().and_then(|cache| cache.remove(&hash));
        if let Some(documents) = &cached {
            deliveries.push(Delivery {
                listener: events.clone(),
                event: SubscriptionEvent::Changed(Arc::new(Diff::initial(documents.clone()))),
            });
        }
        self.subscriptions.insert(
            hash.clone(),
            Subscription {
                subscription_id: subscription_id.clone(),
                query: query.clone(),
                state: SubscriptionState::Registering,
                acknowledged: false,
                listeners: vec![Listener { handle, events }],
                documents: cached,
                subscribe_request: None,
                unsubscribe_request: None,
                resubscribe_after_unsubscribe: false,
            },
        );
        self.hash_by_id.insert(subscription_id.clone(), hash.clone());
        log::debug!("New subscription {subscription_id} for {hash}");
        (
            handle,
            SubscribePlan::Register {
                hash,
                subscription_id,
                query,
            },
            deliveries,
        )
    }

    /// Resolve a revive: `withdrawn` when the queued `unsub` was pulled back
    /// before transmission.
    pub fn revived(&mut self, hash: &str, withdrawn: bool) {
        let Some(sub) = self.subscriptions.get_mut(hash) else {
            return;
        };
        if withdrawn {
            sub.unsubscribe_request = None;
            sub.state = if sub.acknowledged {
                SubscriptionState::Subscribed
            } else {
                SubscriptionState::Registering
            };
        } else {
            sub.resubscribe_after_unsubscribe = true;
        }
    }

    pub fn subscribe_sent(&mut self, hash: &str, correlation_id: String) {
        if let Some(sub) = self.subscriptions.get_mut(hash) {
            sub.subscribe_request = Some(correlation_id);
        }
    }

    pub fn subscribe_acknowledged(&mut self, hash: &str) {
        if let Some(sub) = self.subscriptions.get_mut(hash) {
            sub.acknowledged = true;
            sub.subscribe_request = None;
            if sub.state == SubscriptionState::Registering {
                sub.state = SubscriptionState::Subscribed;
            }
        }
    }

    /// Detach a handle.
    pub fn unsubscribe(&mut self, handle: HandleId) -> UnsubscribePlan {
        let Some(hash) = self.hash_by_handle.remove(&handle) else {
            return UnsubscribePlan::Retained;
        };
        let Some(sub) = self.subscriptions.get_mut(&hash) else {
            return UnsubscribePlan::Retained;
        };
        sub.listeners.retain(|l| l.handle != handle);
        if !sub.listeners.is_empty() {
            return UnsubscribePlan::Retained;
        }
        if sub.state == SubscriptionState::Unsubscribing {
            // Revived while the unsub was in flight, then dropped again.
            sub.resubscribe_after_unsubscribe = false;
            return UnsubscribePlan::Retained;
        }
        UnsubscribePlan::LastHandleGone {
            subscription_id: sub.subscription_id.clone(),
            pending_subscribe: if sub.acknowledged { None } else { sub.subscribe_request.clone() },
            hash,
        }
    }

    pub fn unsubscribe_sent(&mut self, hash: &str, correlation_id: String) {
        if let Some(sub) = self.subscriptions.get_mut(hash) {
            sub.state = SubscriptionState::Unsubscribing;
            sub.unsubscribe_request = Some(correlation_id);
        }
    }

    /// The server confirmed (or refused) the `unsub`.
    ///
    /// Returns a registration when a handle re-joined in the meantime.
    pub fn unsubscribe_completed(&mut self, hash: &str) -> Option<Resubscription> {
        let sub = self.subscriptions.get_mut(hash)?;
        if !sub.resubscribe_after_unsubscribe {
            self.remove(hash);
            return None;
        }
        let old_id = std::mem::replace(&mut sub.subscription_id, Uuid::new_v4().to_string());
        sub.reset_to_registering();
        let resubscription = Resubscription {
            hash: hash.to_string(),
            subscription_id: sub.subscription_id.clone(),
            query: sub.query.clone(),
        };
        self.hash_by_id.remove(&old_id);
        self.hash_by_id
            .insert(resubscription.subscription_id.clone(), hash.to_string());
        Some(resubscription)
    }

    /// Drop a subscription with no handles left, caching its result set.
    pub fn remove(&mut self, hash: &str) {
        let Some(sub) = self.subscriptions.remove(hash) else {
            return;
        };
        self.hash_by_id.remove(&sub.subscription_id);
        if let (Some(cache), Some(documents)) = (self.cache.as_mut(), sub.documents) {
            cache.insert(hash.to_string(), documents);
        }
        log::debug!("Subscription {} removed", sub.subscription_id);
    }

    /// Apply a `val` or `upd` and produce one delivery per handle.
    ///
    /// The first result set is always delivered; later ones only when
    /// something changed.
    pub fn apply(&mut self, subscription_id: &str, change: Change) -> Vec<Delivery> {
        let Some(hash) = self.hash_by_id.get(subscription_id) else {
            log::debug!("Dropping update for unknown subscription {subscription_id}");
            return Vec::new();
        };
        let Some(sub) = self.subscriptions.get_mut(hash) else {
            return Vec::new();
        };
        let first = sub.documents.is_none();
        let diff = incorporate(&sub.query, sub.documents.as_deref(), change);
        sub.documents = Some(diff.documents.clone());
        if !first && !diff.has_changes() {
            return Vec::new();
        }
        let diff = Arc::new(diff);
        sub.listeners
            .iter()
            .map(|l| Delivery {
                listener: l.events.clone(),
                event: SubscriptionEvent::Changed(diff.clone()),
            })
            .collect()
    }

    /// Fail every handle of the subscription and tear it down.
    pub fn fail(&mut self, hash: &str, error: RapidError) -> Vec<Delivery> {
        let Some(sub) = self.subscriptions.remove(hash) else {
            return Vec::new();
        };
        self.hash_by_id.remove(&sub.subscription_id);
        log::warn!("Subscription {} failed: {error}", sub.subscription_id);
        sub.listeners
            .into_iter()
            .map(|l| {
                self.hash_by_handle.remove(&l.handle);
                Delivery {
                    listener: l.events,
                    event: SubscriptionEvent::Failed(error.clone()),
                }
            })
            .collect()
    }

    pub fn fail_by_id(&mut self, subscription_id: &str, error: RapidError) -> Vec<Delivery> {
        match self.hash_by_id.get(subscription_id).cloned() {
            Some(hash) => self.fail(&hash, error),
            None => Vec::new(),
        }
    }

    /// Reset after connection loss.
    ///
    /// `still_queued` tells whether a request never reached the lost
    /// connection; such subscriptions keep their queued frame. Everything
    /// else returns to `Registering` and is listed for re-sending, keeping
    /// its result set.
    pub fn connection_lost(&mut self, still_queued: impl Fn(&str) -> bool) -> Vec<Resubscription> {
        let mut resubscribe = Vec::new();
        let mut gone = Vec::new();
        for (hash, sub) in self.subscriptions.iter_mut() {
            match sub.state {
                SubscriptionState::Unsubscribing => {
                    if sub.unsubscribe_request.as_deref().is_some_and(&still_queued) {
                        continue;
                    }
                    if !sub.resubscribe_after_unsubscribe {
                        gone.push(hash.clone());
                        continue;
                    }
                }
                SubscriptionState::Registering | SubscriptionState::Subscribed => {
                    if sub.subscribe_request.as_deref().is_some_and(&still_queued) {
                        continue;
                    }
                }
            }
            sub.reset_to_registering();
            resubscribe.push(Resubscription {
                hash: hash.clone(),
                subscription_id: sub.subscription_id.clone(),
                query: sub.query.clone(),
            });
        }
        for hash in gone {
            self.remove(&hash);
        }
        resubscribe
    }

    pub fn state(&self, hash: &str) -> Option<SubscriptionState> {
        self.subscriptions.get(hash).map(|s| s.state)
    }

    pub fn listener_count(&self, hash: &str) -> usize {
        self.subscriptions.get(hash).map_or(0, |s| s.listeners.len())
    }

    pub fn documents(&self, hash: &str) -> Option<&[DocumentSnapshot]> {
        self.subscriptions.get(hash)?.documents.as_deref()
    }

    pub fn subscription_id(&self, hash: &str) -> Option<&str> {
        self.subscriptions.get(hash).map(|s| s.subscription_id.as_str())
    }

    pub fn len(&self) -> usize {
        self.subscriptions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscriptions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::{object, DocumentChange};
    use crate::query::Filter;
    use serde_json::json;

    fn query() -> Query {
        Query::new("tasks").filter(Filter::equal("done", false))
    }

    fn listener() -> (
        mpsc::UnboundedSender<SubscriptionEvent>,
        mpsc::UnboundedReceiver<SubscriptionEvent>,
    ) {
        mpsc::unbounded_channel()
    }

    fn register(manager: &mut SubscriptionManager) -> (HandleId, String, String) {
        let (tx, _rx) = listener();
        match manager.subscribe(query(), tx) {
            (handle, SubscribePlan::Register { hash, subscription_id, .. }, _) => {
                (handle, hash, subscription_id)
            }
            other => panic!("expected registration, got {:?}", other.1),
        }
    }

    fn open_task(id: &str) -> DocumentChange {
        DocumentChange::upsert(id, object(json!({"done": false})), None)
    }

    #[test]
    fn test_identical_queries_share_subscription() {
        let mut m = SubscriptionManager::new(false);
        let (_h1, hash, _) = register(&mut m);
        let (tx, _rx) = listener();
        let (_h2, plan, deliveries) = m.subscribe(query(), tx);
        assert_eq!(plan, SubscribePlan::Attached);
        assert!(deliveries.is_empty());
        assert_eq!(m.len(), 1);
        assert_eq!(m.listener_count(&hash), 2);
    }

    #[test]
    fn test_joiner_receives_current_documents() {
        let mut m = SubscriptionManager::new(false);
        let (_h1, _hash, sub_id) = register(&mut m);
        m.apply(&sub_id, Change::Full(vec![open_task("a")]));

        let (tx, _rx) = listener();
        let (_h2, _plan, deliveries) = m.subscribe(query(), tx);
        assert_eq!(deliveries.len(), 1);
        match &deliveries[0].event {
            SubscriptionEvent::Changed(diff) => assert_eq!(diff.documents.len(), 1),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_all_handles_get_same_diff() {
        let mut m = SubscriptionManager::new(false);
        let (_h1, _hash, sub_id) = register(&mut m);
        let (tx, _rx) = listener();
        m.subscribe(query(), tx);

        let deliveries = m.apply(&sub_id, Change::Full(vec![open_task("a")]));
        assert_eq!(deliveries.len(), 2);
        match (&deliveries[0].event, &deliveries[1].event) {
            (SubscriptionEvent::Changed(a), SubscriptionEvent::Changed(b)) => assert!(Arc::ptr_eq(a, b)),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_unchanged_update_not_delivered() {
        let mut m = SubscriptionManager::new(false);
        let (_h, _hash, sub_id) = register(&mut m);
        assert_eq!(m.apply(&sub_id, Change::Full(vec![])).len(), 1);
        assert!(m.apply(&sub_id, Change::Full(vec![])).is_empty());
    }

    #[test]
    fn test_last_handle_triggers_unsubscribe() {
        let mut m = SubscriptionManager::new(false);
        let (h1, hash, sub_id) = register(&mut m);
        let (tx, _rx) = listener();
        let (h2, _, _) = m.subscribe(query(), tx);
        m.subscribe_acknowledged(&hash);

        assert_eq!(m.unsubscribe(h1), UnsubscribePlan::Retained);
        assert_eq!(
            m.unsubscribe(h2),
            UnsubscribePlan::LastHandleGone {
                hash: hash.clone(),
                subscription_id: sub_id,
                pending_subscribe: None,
            }
        );
        m.unsubscribe_sent(&hash, "u1".into());
        assert_eq!(m.state(&hash), Some(SubscriptionState::Unsubscribing));
        assert!(m.unsubscribe_completed(&hash).is_none());
        assert!(m.is_empty());
    }

    #[test]
    fn test_unacknowledged_subscription_reports_pending_subscribe() {
        let mut m = SubscriptionManager::new(false);
        let (h, hash, _) = register(&mut m);
        m.subscribe_sent(&hash, "s1".into());
        match m.unsubscribe(h) {
            UnsubscribePlan::LastHandleGone { pending_subscribe, .. } => {
                assert_eq!(pending_subscribe.as_deref(), Some("s1"))
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_revive_with_withdrawn_unsubscribe() {
        let mut m = SubscriptionManager::new(false);
        let (h, hash, _) = register(&mut m);
        m.subscribe_acknowledged(&hash);
        m.unsubscribe(h);
        m.unsubscribe_sent(&hash, "u1".into());

        let (tx, _rx) = listener();
        let (_h2, plan, _) = m.subscribe(query(), tx);
        assert_eq!(
            plan,
            SubscribePlan::Revive { hash: hash.clone(), unsubscribe_request: "u1".into() }
        );
        m.revived(&hash, true);
        assert_eq!(m.state(&hash), Some(SubscriptionState::Subscribed));
    }

    #[test]
    fn test_revive_after_transmitted_unsubscribe_resubscribes() {
        let mut m = SubscriptionManager::new(false);
        let (h, hash, old_id) = register(&mut m);
        m.subscribe_acknowledged(&hash);
        m.unsubscribe(h);
        m.unsubscribe_sent(&hash, "u1".into());

        let (tx, _rx) = listener();
        m.subscribe(query(), tx);
        m.revived(&hash, false);
        assert_eq!(m.state(&hash), Some(SubscriptionState::Unsubscribing));

        let again = m.unsubscribe_completed(&hash).unwrap();
        assert_ne!(again.subscription_id, old_id);
        assert_eq!(m.state(&hash), Some(SubscriptionState::Registering));
        assert!(m.apply(&old_id, Change::Full(vec![])).is_empty());
    }

    #[test]
    fn test_fail_tears_down_and_notifies_everyone() {
        let mut m = SubscriptionManager::new(false);
        let (h1, hash, _) = register(&mut m);
        let (tx, _rx) = listener();
        m.subscribe(query(), tx);
        let deliveries = m.fail(&hash, RapidError::PermissionDenied("rules".into()));
        assert_eq!(deliveries.len(), 2);
        assert!(m.is_empty());
        assert_eq!(m.unsubscribe(h1), UnsubscribePlan::Retained);
    }

    #[test]
    fn test_connection_lost_resubscribes_and_keeps_documents() {
        let mut m = SubscriptionManager::new(false);
        let (_h, hash, sub_id) = register(&mut m);
        m.subscribe_sent(&hash, "s1".into());
        m.subscribe_acknowledged(&hash);
        m.apply(&sub_id, Change::Full(vec![open_task("a")]));

        let again = m.connection_lost(|_| false);
        assert_eq!(again.len(), 1);
        assert_eq!(again[0].subscription_id, sub_id);
        assert_eq!(m.state(&hash), Some(SubscriptionState::Registering));
        assert_eq!(m.documents(&hash).map(|d| d.len()), Some(1));
    }

    #[test]
    fn test_connection_lost_skips_still_queued() {
        let mut m = SubscriptionManager::new(false);
        let (_h, hash, _) = register(&mut m);
        m.subscribe_sent(&hash, "s1".into());
        assert!(m.connection_lost(|id| id == "s1").is_empty());
    }

    #[test]
    fn test_connection_lost_drops_unsubscribing() {
        let mut m = SubscriptionManager::new(false);
        let (h, hash, _) = register(&mut m);
        m.subscribe_acknowledged(&hash);
        m.unsubscribe(h);
        m.unsubscribe_sent(&hash, "u1".into());
        assert!(m.connection_lost(|_| false).is_empty());
        assert!(m.is_empty());
    }

    #[test]
    fn test_cache_serves_resubscription() {
        let mut m = SubscriptionManager::new(true);
        let (h, hash, sub_id) = register(&mut m);
        m.apply(&sub_id, Change::Full(vec![open_task("a")]));
        m.unsubscribe(h);
        m.remove(&hash);

        let (tx, _rx) = listener();
        let (_h2, plan, deliveries) = m.subscribe(query(), tx);
        assert!(matches!(plan, SubscribePlan::Register { .. }));
        assert_eq!(deliveries.len(), 1);
    }
}
