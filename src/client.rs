//! The public command API: one call per connection operation, each
//! synchronous to the caller (it waits for the server's reply, or for local
//! completion when the wire has no reply at all).

use tokio::sync::{mpsc, oneshot};

use crate::config::Config;
use crate::connection::{self, ActorCommand, BrokerEndpoint, OffsetSpec, PublishedMessage, StreamTopology};
use crate::error::{Error, Result};
use crate::subscription::{OsirisChunk, Subscription};
use crate::tracker::Reply;

/// Cheap, `Clone`-able handle to a connection's mailbox. [`Client`] wraps
/// one; [`Subscription`] keeps one too so it can call back into `credit`
/// and `unsubscribe` without holding a reference to the owning `Client`.
#[derive(Clone, Debug)]
pub struct ClientHandle {
    tx: mpsc::Sender<ActorCommand>,
}

/// Metadata returned by [`Client::query_metadata`].
#[derive(Debug, Clone)]
pub struct Metadata {
    pub brokers: std::collections::HashMap<u16, BrokerEndpoint>,
    pub streams: std::collections::HashMap<String, StreamTopology>,
}

async fn call<T>(tx: &mpsc::Sender<ActorCommand>, build: impl FnOnce(oneshot::Sender<Result<T>>) -> ActorCommand) -> Result<T> {
    let (reply_tx, reply_rx) = oneshot::channel();
    tx.send(build(reply_tx)).await.map_err(|_| Error::Closed)?;
    reply_rx.await.map_err(|_| Error::Closed)?
}

fn expect_unit(_reply: Reply) -> Result<()> {
    Ok(())
}

impl ClientHandle {
    pub async fn connect(&self) -> Result<()> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(ActorCommand::Connect { reply: reply_tx })
            .await
            .map_err(|_| Error::Closed)?;
        reply_rx.await.map_err(|_| Error::Closed)?
    }

    pub async fn close(&self) -> Result<()> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(ActorCommand::Close { reply: reply_tx })
            .await
            .map_err(|_| Error::Closed)?;
        reply_rx.await.map_err(|_| Error::Closed)?
    }

    pub async fn create_stream(&self, name: impl Into<String>, arguments: Vec<(String, String)>) -> Result<()> {
        call(&self.tx, |reply| ActorCommand::CreateStream { name: name.into(), arguments, reply })
            .await
            .and_then(expect_unit)
    }

    pub async fn delete_stream(&self, name: impl Into<String>) -> Result<()> {
        call(&self.tx, |reply| ActorCommand::DeleteStream { name: name.into(), reply })
            .await
            .and_then(expect_unit)
    }

    pub async fn declare_publisher(&self, stream: impl Into<String>, reference: impl Into<String>) -> Result<u8> {
        let reply = call(&self.tx, |reply| ActorCommand::DeclarePublisher {
            stream: stream.into(),
            reference: reference.into(),
            reply,
        })
        .await?;
        match reply {
            Reply::PublisherId(id) => Ok(id),
            _ => Err(Error::MalformedFrame),
        }
    }

    pub async fn delete_publisher(&self, publisher_id: u8) -> Result<()> {
        call(&self.tx, |reply| ActorCommand::DeletePublisher { publisher_id, reply })
            .await
            .and_then(expect_unit)
    }

    pub async fn store_offset(&self, stream: impl Into<String>, reference: impl Into<String>, offset: i64) -> Result<()> {
        call(&self.tx, |reply| ActorCommand::StoreOffset {
            stream: stream.into(),
            reference: reference.into(),
            offset,
            reply,
        })
        .await
        .and_then(expect_unit)
    }

    pub async fn query_offset(&self, stream: impl Into<String>, reference: impl Into<String>) -> Result<i64> {
        let reply = call(&self.tx, |reply| ActorCommand::QueryOffset {
            stream: stream.into(),
            reference: reference.into(),
            reply,
        })
        .await?;
        match reply {
            Reply::Offset(offset) => Ok(offset),
            _ => Err(Error::MalformedFrame),
        }
    }

    pub async fn query_publisher_sequence(&self, stream: impl Into<String>, reference: impl Into<String>) -> Result<u64> {
        let reply = call(&self.tx, |reply| ActorCommand::QueryPublisherSequence {
            stream: stream.into(),
            reference: reference.into(),
            reply,
        })
        .await?;
        match reply {
            Reply::PublisherSequence(seq) => Ok(seq),
            _ => Err(Error::MalformedFrame),
        }
    }

    pub async fn subscribe(
        &self,
        stream: impl Into<String>,
        offset: OffsetSpec,
        credit: u16,
        properties: Vec<(String, String)>,
        sink_capacity: usize,
    ) -> Result<Subscription> {
        let (sink_tx, sink_rx) = mpsc::channel::<OsirisChunk>(sink_capacity);
        let reply = call(&self.tx, |reply| ActorCommand::Subscribe {
            stream: stream.into(),
            offset,
            credit,
            properties,
            sink: sink_tx,
            reply,
        })
        .await?;
        match reply {
            Reply::SubscriptionId(id) => Ok(Subscription::new(id, sink_rx, self.clone())),
            _ => Err(Error::MalformedFrame),
        }
    }

    pub async fn unsubscribe(&self, subscription_id: u8) -> Result<()> {
        call(&self.tx, |reply| ActorCommand::Unsubscribe { subscription_id, reply })
            .await
            .and_then(expect_unit)
    }

    pub async fn credit(&self, subscription_id: u8, credit: u16) -> Result<()> {
        call(&self.tx, |reply| ActorCommand::Credit { subscription_id, credit, reply })
            .await
            .and_then(expect_unit)
    }

    pub async fn publish(&self, publisher_id: u8, messages: Vec<PublishedMessage>) -> Result<()> {
        call(&self.tx, |reply| ActorCommand::Publish { publisher_id, messages, reply })
            .await
            .and_then(expect_unit)
    }

    pub async fn query_metadata(&self, streams: Vec<String>) -> Result<Metadata> {
        let reply = call(&self.tx, |reply| ActorCommand::QueryMetadata { streams, reply }).await?;
        match reply {
            Reply::Metadata { brokers, streams } => Ok(Metadata { brokers, streams }),
            _ => Err(Error::MalformedFrame),
        }
    }
}

/// Owns a connection actor and exposes the command API over it. Build one
/// with [`crate::config::ClientBuilder`] or `Client::new(Config::default())`.
#[derive(Clone, Debug)]
pub struct Client {
    handle: ClientHandle,
}

impl Client {
    pub fn new(config: Config) -> Self {
        let tx = connection::spawn(config);
        Client { handle: ClientHandle { tx } }
    }

    pub fn handle(&self) -> ClientHandle {
        self.handle.clone()
    }

    pub async fn connect(&self) -> Result<()> {
        self.handle.connect().await
    }

    pub async fn close(&self) -> Result<()> {
        self.handle.close().await
    }

    pub async fn create_stream(&self, name: impl Into<String>, arguments: Vec<(String, String)>) -> Result<()> {
        self.handle.create_stream(name, arguments).await
    }

    pub async fn delete_stream(&self, name: impl Into<String>) -> Result<()> {
        self.handle.delete_stream(name).await
    }

    pub async fn declare_publisher(&self, stream: impl Into<String>, reference: impl Into<String>) -> Result<u8> {
        self.handle.declare_publisher(stream, reference).await
    }

    pub async fn delete_publisher(&self, publisher_id: u8) -> Result<()> {
        self.handle.delete_publisher(publisher_id).await
    }

    pub async fn store_offset(&self, stream: impl Into<String>, reference: impl Into<String>, offset: i64) -> Result<()> {
        self.handle.store_offset(stream, reference, offset).await
    }

    pub async fn query_offset(&self, stream: impl Into<String>, reference: impl Into<String>) -> Result<i64> {
        self.handle.query_offset(stream, reference).await
    }

    pub async fn query_publisher_sequence(&self, stream: impl Into<String>, reference: impl Into<String>) -> Result<u64> {
        self.handle.query_publisher_sequence(stream, reference).await
    }

    pub async fn subscribe(
        &self,
        stream: impl Into<String>,
        offset: OffsetSpec,
        credit: u16,
        properties: Vec<(String, String)>,
        sink_capacity: usize,
    ) -> Result<Subscription> {
        self.handle.subscribe(stream, offset, credit, properties, sink_capacity).await
    }

    pub async fn unsubscribe(&self, subscription_id: u8) -> Result<()> {
        self.handle.unsubscribe(subscription_id).await
    }

    pub async fn credit(&self, subscription_id: u8, credit: u16) -> Result<()> {
        self.handle.credit(subscription_id, credit).await
    }

    pub async fn publish(&self, publisher_id: u8, messages: Vec<PublishedMessage>) -> Result<()> {
        self.handle.publish(publisher_id, messages).await
    }

    pub async fn query_metadata(&self, streams: Vec<String>) -> Result<Metadata> {
        self.handle.query_metadata(streams).await
    }
}
