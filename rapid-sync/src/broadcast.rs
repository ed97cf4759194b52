//! Fan-out of document changes to server connections.
//!
//! Uses a tokio broadcast channel for O(1) send to every connection.
//! Each connection gets an independent receiver that buffers up to
//! `capacity` notices; a connection that falls further behind lags and
//! has to re-evaluate its subscriptions from the store.
//!
//! ```text
//!  write ──► ChangeFeed::publish ──┬──► connection A (re-evaluates its subscriptions)
//!                                  ├──► connection B
//!                                  └──► connection C
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::broadcast;

use crate::document::DocumentChange;

/// One applied write.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeNotice {
    pub collection: String,
    pub change: DocumentChange,
}

/// Statistics for monitoring feed health.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FeedStats {
    pub notices_sent: u64,
    pub notices_lagged: u64,
    pub receivers: usize,
}

/// Counters kept as atomics so that publishing never takes a lock.
#[derive(Default)]
struct AtomicFeedStats {
    notices_sent: AtomicU64,
    notices_lagged: AtomicU64,
}

/// Broadcast channel of [`ChangeNotice`]s shared by all connections.
#[derive(Clone)]
pub struct ChangeFeed {
    sender: broadcast::Sender<Arc<ChangeNotice>>,
    capacity: usize,
    stats: Arc<AtomicFeedStats>,
}

impl ChangeFeed {
    /// `capacity` is how many notices a receiver may fall behind before
    /// it lags.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            capacity,
            stats: Arc::new(AtomicFeedStats::default()),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Arc<ChangeNotice>> {
        self.sender.subscribe()
    }

    /// Publish a change; returns the number of receivers that got it.
    pub fn publish(&self, collection: impl Into<String>, change: DocumentChange) -> usize {
        let notice = Arc::new(ChangeNotice {
            collection: collection.into(),
            change,
        });
        let count = self.sender.send(notice).unwrap_or(0);
        self.stats.notices_sent.fetch_add(1, Ordering::Relaxed);
        count
    }

    /// Record that a receiver skipped `missed` notices.
    pub fn record_lag(&self, missed: u64) {
        self.stats.notices_lagged.fetch_add(missed, Ordering::Relaxed);
    }

    pub fn stats(&self) -> FeedStats {
        FeedStats {
            notices_sent: self.stats.notices_sent.load(Ordering::Relaxed),
            notices_lagged: self.stats.notices_lagged.load(Ordering::Relaxed),
            receivers: self.sender.receiver_count(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
