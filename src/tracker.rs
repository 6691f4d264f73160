//! Correlates outgoing requests with their eventual response.
//!
//! Keyed by `(command_kind, correlation_id)` rather than `correlation_id`
//! alone: the composite key lets each pending entry carry a payload shaped
//! for its own command, and defends against a server frame echoing the
//! wrong command for a given id.

use std::collections::HashMap;

use tokio::sync::{mpsc, oneshot};

use crate::codec::CommandKind;
use crate::connection::{BrokerEndpoint, StreamTopology};
use crate::error::{Error, Result};
use crate::subscription::OsirisChunk;

/// What the caller parked on a pending request will receive.
#[derive(Debug)]
pub enum Reply {
    Unit,
    PublisherId(u8),
    SubscriptionId(u8),
    Offset(i64),
    PublisherSequence(u64),
    Metadata {
        brokers: HashMap<u16, BrokerEndpoint>,
        streams: HashMap<String, StreamTopology>,
    },
}

/// Locally allocated state stashed alongside a waiter, returned to the
/// caller once the server confirms the request (e.g. the publisher id
/// `declare_publisher` allocates before the round trip completes). The
/// `Subscription` variant also carries the delivery sink so the actor can
/// register it in the subscription map the moment the OK response arrives.
#[derive(Debug)]
pub enum Payload {
    None,
    PublisherId(u8),
    Subscription { id: u8, sink: mpsc::Sender<OsirisChunk> },
    SubscriptionId(u8),
}

pub struct PendingEntry {
    pub waiter: oneshot::Sender<Result<Reply>>,
    pub payload: Payload,
}

/// Owns correlation-id allocation and the map of in-flight requests.
#[derive(Default)]
pub struct RequestTracker {
    next_correlation: u32,
    pending: HashMap<(CommandKind, u32), PendingEntry>,
}

impl RequestTracker {
    pub fn new() -> Self {
        RequestTracker {
            next_correlation: 1,
            pending: HashMap::new(),
        }
    }

    /// Allocates the next correlation id without registering a waiter, for
    /// handshake steps that consume the same monotonic sequence but resolve
    /// to `connect_waiters` rather than a tracked reply.
    pub fn allocate(&mut self) -> u32 {
        let id = self.next_correlation;
        self.next_correlation = self.next_correlation.wrapping_add(1);
        if self.next_correlation == 0 {
            self.next_correlation = 1;
        }
        id
    }

    /// Allocates the next correlation id, registers the waiter, and returns
    /// the id to embed in the outgoing frame.
    pub fn push(&mut self, kind: CommandKind, waiter: oneshot::Sender<Result<Reply>>, payload: Payload) -> u32 {
        let id = self.allocate();
        self.pending.insert((kind, id), PendingEntry { waiter, payload });
        id
    }

    /// Removes and returns the entry for `(kind, id)`, if any is pending.
    pub fn pop(&mut self, kind: CommandKind, id: u32) -> Option<PendingEntry> {
        self.pending.remove(&(kind, id))
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// Fails every pending waiter with `error` and clears the map. Called on
    /// transport loss or close so no caller is left parked forever.
    pub fn drain(&mut self, error: Error) {
        for (_, entry) in self.pending.drain() {
            let _ = entry.waiter.send(Err(error.clone()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn correlation_ids_are_unique_and_increasing() {
        let mut tracker = RequestTracker::new();
        let (tx1, _rx1) = oneshot::channel();
        let (tx2, _rx2) = oneshot::channel();
        let id1 = tracker.push(CommandKind::CreateStream, tx1, Payload::None);
        let id2 = tracker.push(CommandKind::CreateStream, tx2, Payload::None);
        assert!(id2 > id1);
    }

    #[tokio::test]
    async fn pop_returns_and_removes_entry() {
        let mut tracker = RequestTracker::new();
        let (tx, rx) = oneshot::channel();
        let id = tracker.push(CommandKind::DeclarePublisher, tx, Payload::PublisherId(3));
        let entry = tracker.pop(CommandKind::DeclarePublisher, id).expect("entry present");
        assert!(matches!(entry.payload, Payload::PublisherId(3)));
        assert!(tracker.pop(CommandKind::DeclarePublisher, id).is_none());
        let _ = entry.waiter.send(Ok(Reply::PublisherId(3)));
        assert!(matches!(rx.await, Ok(Ok(Reply::PublisherId(3)))));
    }

    #[tokio::test]
    async fn drain_fails_every_waiter_and_empties_the_map() {
        let mut tracker = RequestTracker::new();
        let (tx1, rx1) = oneshot::channel();
        let (tx2, rx2) = oneshot::channel();
        tracker.push(CommandKind::QueryOffset, tx1, Payload::None);
        tracker.push(CommandKind::QueryOffset, tx2, Payload::None);
        tracker.drain(Error::TcpClosed);
        assert!(tracker.is_empty());
        assert_eq!(rx1.await.unwrap().unwrap_err(), Error::TcpClosed);
        assert_eq!(rx2.await.unwrap().unwrap_err(), Error::TcpClosed);
    }
}
