//! The consumer-facing side of a `subscribe` call: a handle that yields
//! `deliver` frames pushed from the connection actor.

use tokio::sync::mpsc;

use crate::client::ClientHandle;
use crate::error::Result;

/// One delivery batch carried by a `deliver` frame.
#[derive(Debug, Clone)]
pub struct OsirisChunk {
    pub epoch: u64,
    pub first_offset: i64,
    pub record_count: u32,
    /// Raw, still-encoded record data; payload parsing is out of scope here.
    pub data: Vec<u8>,
}

/// Handed back to the caller on a successful `subscribe`. Delivery is
/// push-only and non-blocking from the actor's side: a full channel means
/// the consumer is behind and must slow its `credit` calls, not that the
/// actor should stall waiting on it (see [`mod@crate::connection`]).
#[derive(Debug)]
pub struct Subscription {
    pub subscription_id: u8,
    receiver: mpsc::Receiver<OsirisChunk>,
    client: ClientHandle,
}

impl Subscription {
    pub(crate) fn new(subscription_id: u8, receiver: mpsc::Receiver<OsirisChunk>, client: ClientHandle) -> Self {
        Subscription {
            subscription_id,
            receiver,
            client,
        }
    }

    /// Waits for the next chunk. Returns `None` once the connection has
    /// closed and no further chunks will arrive.
    pub async fn next_delivery(&mut self) -> Option<OsirisChunk> {
        self.receiver.recv().await
    }

    /// Grants `credit` additional chunks to the stream, the only way to keep
    /// `next_delivery` producing more than the initial subscribe credit.
    pub async fn credit(&self, credit: u16) -> Result<()> {
        self.client.credit(self.subscription_id, credit).await
    }

    pub async fn unsubscribe(self) -> Result<()> {
        self.client.unsubscribe(self.subscription_id).await
    }
}
