//! Connection state and the outbound queue.
//!
//! ```text
//! Disconnected ──connect──► Connecting ──transport open──► Connected
//!       ▲                        │                              │
//!       │                        │ failure                      │ disconnect / transport closed
//!       └────────────────────────┴──────── Disconnecting ◄──────┘
//! ```
//!
//! While not connected, frames wait in the [`OutboundQueue`] and are
//! flushed in FIFO order once the transport opens.

use std::collections::VecDeque;

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
}

/// Connection transitions published to callers.
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    Connecting,
    Connected,
    Disconnected { reason: Option<String> },
}

/// A frame waiting for a connected transport.
#[derive(Debug, Clone, PartialEq)]
pub struct Outbound {
    pub correlation_id: String,
    pub frame: String,
}

/// FIFO of frames queued while disconnected.
///
/// Entries can be withdrawn by correlation id before they are flushed,
/// e.g. when a queued request times out or a queued `unsub` is cancelled.
#[derive(Debug, Default)]
pub struct OutboundQueue {
    queue: VecDeque<Outbound>,
}

impl OutboundQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue(&mut self, correlation_id: String, frame: String) {
        self.queue.push_back(Outbound { correlation_id, frame });
    }

    /// Put frames ahead of everything already queued, keeping their order.
    pub fn prepend(&mut self, frames: Vec<Outbound>) {
        for outbound in frames.into_iter().rev() {
            self.queue.push_front(outbound);
        }
    }

    /// Remove a queued frame; `false` if it was not (or no longer) queued.
    pub fn withdraw(&mut self, correlation_id: &str) -> bool {
        match self.queue.iter().position(|o| o.correlation_id == correlation_id) {
            Some(index) => {
                self.queue.remove(index);
                true
            }
            None => false,
        }
    }

    /// Drain all queued frames for transmission.
    pub fn drain(&mut self) -> Vec<Outbound> {
        self.queue.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(queue: &mut OutboundQueue) -> Vec<String> {
        queue.drain().into_iter().map(|o| o.correlation_id).collect()
    }

    #[test]
    fn test_outbound_queue_fifo() {
        let mut queue = OutboundQueue::new();
        assert!(queue.is_empty());
        queue.enqueue("a".into(), "{1}".into());
        queue.enqueue("b".into(), "{22}".into());
        assert_eq!(queue.len(), 2);
        assert_eq!(ids(&mut queue), vec!["a", "b"]);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_prepend_keeps_order() {
        let mut queue = OutboundQueue::new();
        queue.enqueue("later".into(), String::new());
        queue.prepend(vec![
            Outbound { correlation_id: "first".into(), frame: String::new() },
            Outbound { correlation_id: "second".into(), frame: String::new() },
        ]);
        assert_eq!(ids(&mut queue), vec!["first", "second", "later"]);
    }

    #[test]
    fn test_withdraw() {
        let mut queue = OutboundQueue::new();
        queue.enqueue("a".into(), String::new());
        queue.enqueue("b".into(), String::new());
        assert!(queue.withdraw("a"));
        assert!(!queue.withdraw("a"));
        assert_eq!(ids(&mut queue), vec!["b"]);
    }

    #[test]
    fn test_connection_state_values() {
        assert_ne!(ConnectionState::Disconnected, ConnectionState::Connected);
        assert_ne!(ConnectionState::Connecting, ConnectionState::Disconnecting);
    }
}
