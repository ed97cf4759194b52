//! Pending request table.
//!
//! Every request that expects an `ack`/`err` is tracked here under its
//! correlation id until exactly one of these happens first:
//!
//! ```text
//!            ┌── acknowledge(id) ──► completion(Ok | server error)
//! track(id) ─┼── expire(id)      ──► completion(Timeout)
//!            └── cancel(id)      ──► completion(Cancelled)
//! ```
//!
//! Removing the entry is what completes it, so whichever call comes first
//! wins and the others find nothing. Entries own their timer through a
//! [`TimerGuard`]; dropping the entry aborts the timer.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::task::AbortHandle;

use crate::error::Result;
use crate::protocol::{Ack, ClientRequest};

/// Starts timers for tracked requests.
pub trait TimerScheduler: Send + Sync {
    /// Arrange for `correlation_id` to expire after `after`.
    fn schedule(&self, correlation_id: &str, after: Duration) -> TimerGuard;
}

/// Handle to a scheduled expiry; aborts the timer task when dropped.
#[derive(Debug, Default)]
pub struct TimerGuard {
    handle: Option<AbortHandle>,
}

impl TimerGuard {
    /// A guard with no timer behind it.
    pub fn inert() -> Self {
        Self { handle: None }
    }

    pub fn from_abort_handle(handle: AbortHandle) -> Self {
        Self { handle: Some(handle) }
    }

    pub fn is_armed(&self) -> bool {
        self.handle.is_some()
    }
}

impl Drop for TimerGuard {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

/// Scheduler that never fires; timeouts only happen through `expire`.
#[derive(Debug, Default, Clone, Copy)]
pub struct ManualTimers;

impl TimerScheduler for ManualTimers {
    fn schedule(&self, _correlation_id: &str, _after: Duration) -> TimerGuard {
        TimerGuard::inert()
    }
}

/// Who receives the outcome of a request.
#[derive(Debug)]
pub enum Completion {
    /// A caller awaiting a future
    Caller(oneshot::Sender<Result<Ack>>),
    /// The handshake (`caller: None`) or an explicit `authorize`
    Authorize {
        token: String,
        caller: Option<oneshot::Sender<Result<Ack>>>,
    },
    Subscribe { hash: String },
    Unsubscribe { hash: String },
    ExecutionFetch { key: String },
    ExecutionWrite { key: String },
    OnConnectAction { action_id: String },
    OnDisconnectAction { action_id: String },
    /// Nobody waits; failures are only logged
    Internal,
}

/// A tracked request.
#[derive(Debug)]
pub struct PendingRequest {
    pub correlation_id: String,
    pub request: ClientRequest,
    /// Encoded frame, kept for re-queueing after connection loss
    pub frame: String,
    pub completion: Completion,
    pub transmitted: bool,
    pub always_timeout: bool,
    sequence: u64,
    timer: Option<TimerGuard>,
}

impl PendingRequest {
    pub fn has_timer(&self) -> bool {
        self.timer.as_ref().is_some_and(TimerGuard::is_armed)
    }
}

/// Table of requests awaiting acknowledgement.
pub struct PendingTable {
    entries: HashMap<String, PendingRequest>,
    scheduler: Arc<dyn TimerScheduler>,
    next_sequence: u64,
}

impl PendingTable {
    pub fn new(scheduler: Arc<dyn TimerScheduler>) -> Self {
        Self {
            entries: HashMap::new(),
            scheduler,
            next_sequence: 0,
        }
    }

    /// Track a request. A timeout starts the clock immediately.
    pub fn track(
        &mut self,
        correlation_id: String,
        request: ClientRequest,
        frame: String,
        completion: Completion,
        timeout: Option<Duration>,
    ) {
        let timer = timeout.map(|after| self.scheduler.schedule(&correlation_id, after));
        let always_timeout = request.always_timeout();
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        self.entries.insert(
            correlation_id.clone(),
            PendingRequest {
                correlation_id,
                request,
                frame,
                completion,
                transmitted: false,
                always_timeout,
                sequence,
                timer,
            },
        );
    }

    /// Mark as written to the transport, starting `timeout` if no clock
    /// is running yet.
    pub fn mark_transmitted(&mut self, correlation_id: &str, timeout: Option<Duration>) -> bool {
        let Some(entry) = self.entries.get_mut(correlation_id) else {
            return false;
        };
        entry.transmitted = true;
        if entry.timer.is_none() {
            if let Some(after) = timeout {
                entry.timer = Some(self.scheduler.schedule(correlation_id, after));
            }
        }
        true
    }

    /// Remove on `ack`/`err`. `None` means the request already finished.
    pub fn acknowledge(&mut self, correlation_id: &str) -> Option<PendingRequest> {
        self.entries.remove(correlation_id)
    }

    /// Remove on timer expiry.
    pub fn expire(&mut self, correlation_id: &str) -> Option<PendingRequest> {
        let entry = self.entries.remove(correlation_id);
        if entry.is_some() {
            log::debug!("Request {correlation_id} timed out");
        }
        entry
    }

    /// Remove on explicit cancellation.
    pub fn cancel(&mut self, correlation_id: &str) -> Option<PendingRequest> {
        self.entries.remove(correlation_id)
    }

    /// Remove every entry, oldest first.
    pub fn timeout_all(&mut self) -> Vec<PendingRequest> {
        let mut all: Vec<PendingRequest> = self.entries.drain().map(|(_, e)| e).collect();
        all.sort_by_key(|e| e.sequence);
        all
    }

    /// Remove every entry already written to the lost connection, oldest first.
    ///
    /// Entries still waiting in the outbound queue stay tracked.
    pub fn fail_connection_lost(&mut self) -> Vec<PendingRequest> {
        let transmitted: Vec<String> = self
            .entries
            .values()
            .filter(|e| e.transmitted)
            .map(|e| e.correlation_id.clone())
            .collect();
        let mut removed: Vec<PendingRequest> = transmitted
            .iter()
            .filter_map(|id| self.entries.remove(id))
            .collect();
        removed.sort_by_key(|e| e.sequence);
        removed
    }

    /// Put back an entry that survives connection loss, keeping its clock.
    pub fn requeue(&mut self, mut entry: PendingRequest) {
        entry.transmitted = false;
        self.entries.insert(entry.correlation_id.clone(), entry);
    }

    pub fn get(&self, correlation_id: &str) -> Option<&PendingRequest> {
        self.entries.get(correlation_id)
    }

    pub fn contains(&self, correlation_id: &str) -> bool {
        self.entries.contains_key(correlation_id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RapidError;
    use proptest::prelude::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingTimers {
        scheduled: AtomicUsize,
    }

    impl TimerScheduler for CountingTimers {
        fn schedule(&self, _correlation_id: &str, _after: Duration) -> TimerGuard {
            self.scheduled.fetch_add(1, Ordering::SeqCst);
            TimerGuard::inert()
        }
    }

    fn table() -> PendingTable {
        PendingTable::new(Arc::new(ManualTimers))
    }

    fn track_caller(table: &mut PendingTable, id: &str) -> oneshot::Receiver<Result<Ack>> {
        let (tx, rx) = oneshot::channel();
        table.track(
            id.to_string(),
            ClientRequest::Deauthorize,
            String::new(),
            Completion::Caller(tx),
            None,
        );
        rx
    }

    fn complete(entry: PendingRequest, result: Result<Ack>) {
        if let Completion::Caller(tx) = entry.completion {
            let _ = tx.send(result);
        }
    }

    #[test]
    fn test_ack_wins_over_later_expiry() {
        let mut t = table();
        let mut rx = track_caller(&mut t, "c1");
        complete(t.acknowledge("c1").unwrap(), Ok(Ack::default()));
        assert!(t.expire("c1").is_none());
        assert!(t.cancel("c1").is_none());
        assert_eq!(rx.try_recv().unwrap(), Ok(Ack::default()));
    }

    #[test]
    fn test_timer_started_on_track_or_transmit() {
        let timers = Arc::new(CountingTimers::default());
        let mut t = PendingTable::new(timers.clone());
        t.track("a".into(), ClientRequest::Deauthorize, String::new(), Completion::Internal, Some(Duration::from_secs(1)));
        assert_eq!(timers.scheduled.load(Ordering::SeqCst), 1);

        // Already running: transmitting does not restart it.
        t.mark_transmitted("a", Some(Duration::from_secs(1)));
        assert_eq!(timers.scheduled.load(Ordering::SeqCst), 1);

        t.track("b".into(), ClientRequest::Deauthorize, String::new(), Completion::Internal, None);
        assert!(t.mark_transmitted("b", Some(Duration::from_secs(1))));
        assert_eq!(timers.scheduled.load(Ordering::SeqCst), 2);
        assert!(!t.mark_transmitted("zzz", None));
    }

    #[test]
    fn test_connection_lost_only_takes_transmitted() {
        let mut t = table();
        let _a = track_caller(&mut t, "a");
        let _b = track_caller(&mut t, "b");
        let _c = track_caller(&mut t, "c");
        t.mark_transmitted("c", None);
        t.mark_transmitted("a", None);

        let lost: Vec<String> = t.fail_connection_lost().into_iter().map(|e| e.correlation_id).collect();
        assert_eq!(lost, vec!["a", "c"]);
        assert!(t.contains("b"));
        assert_eq!(t.len(), 1);
    }

    #[test]
    fn test_requeue_resets_transmitted() {
        let mut t = table();
        let _rx = track_caller(&mut t, "a");
        t.mark_transmitted("a", None);
        let mut lost = t.fail_connection_lost();
        t.requeue(lost.remove(0));
        assert!(!t.get("a").unwrap().transmitted);
    }

    #[test]
    fn test_timeout_all_in_tracking_order() {
        let mut t = table();
        let _x = track_caller(&mut t, "x");
        let _y = track_caller(&mut t, "y");
        let ids: Vec<String> = t.timeout_all().into_iter().map(|e| e.correlation_id).collect();
        assert_eq!(ids, vec!["x", "y"]);
        assert!(t.is_empty());
    }

    #[tokio::test]
    async fn test_dropping_entry_aborts_timer() {
        let task = tokio::spawn(async {
            tokio::time::sleep(Duration::from_secs(60)).await;
        });
        let guard = TimerGuard::from_abort_handle(task.abort_handle());
        assert!(guard.is_armed());
        drop(guard);
        let err = task.await.unwrap_err();
        assert!(err.is_cancelled());
    }

    #[derive(Debug, Clone, Copy)]
    enum Race {
        Ack,
        Error,
        Expire,
        Cancel,
    }

    fn race_strategy() -> impl Strategy<Value = Race> {
        prop_oneof![Just(Race::Ack), Just(Race::Error), Just(Race::Expire), Just(Race::Cancel)]
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(256))]

        #[test]
        fn completion_fires_exactly_once(events in proptest::collection::vec(race_strategy(), 1..8)) {
            let mut t = table();
            let mut rx = track_caller(&mut t, "c");
            let mut completions = 0;
            let mut first = None;
            for event in &events {
                let (entry, result) = match event {
                    Race::Ack => (t.acknowledge("c"), Ok(Ack::default())),
                    Race::Error => (t.acknowledge("c"), Err(RapidError::Conflict)),
                    Race::Expire => (t.expire("c"), Err(RapidError::Timeout)),
                    Race::Cancel => (t.cancel("c"), Err(RapidError::Cancelled)),
                };
                if let Some(entry) = entry {
                    completions += 1;
                    first.get_or_insert(result.clone());
                    complete(entry, result);
                }
            }
            prop_assert_eq!(completions, 1);
            prop_assert_eq!(rx.try_recv().ok(), first);
            prop_assert!(t.is_empty());
        }
    }
}
