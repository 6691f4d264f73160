#![allow(clippy::cognitive_complexity, clippy::large_enum_variant)]
#![warn(missing_debug_implementations, rust_2018_idioms, unreachable_pub)]
#![doc(test(
  no_crate_inject,
  attr(deny(warnings, rust_2018_idioms), allow(dead_code, unused_variables))
))]

//! # rabbit-stream-client
//!
//! An async client core for the RabbitMQ Stream protocol: the connection
//! state machine and frame multiplexer that a [`Publisher`], [`Consumer`],
//! or super-stream consumer would be built on top of. This crate does not
//! provide those user-facing handles, message payload serialization, or
//! automatic reconnection — see the module docs on [`connection`] for the
//! exact boundary.
//!
//! [`Publisher`]: https://www.rabbitmq.com/docs/streams
//! [`Consumer`]: https://www.rabbitmq.com/docs/streams
//!
//! ## What it does
//!
//! - Speaks the binary framing described in [`codec`]: a 4-byte length
//!   prefix, a 2-byte command key, a 2-byte version.
//! - Drives one TCP connection through `closed → connecting →
//!   authenticating → tuning → opening → open → closing → closed`.
//! - Correlates every request with its response via [`tracker`], so many
//!   callers can share one connection safely.
//! - Delivers `deliver` frames to the right [`Subscription`] and merges
//!   `query_metadata` replies into a cached topology.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use rabbit_stream_client::{ClientBuilder, OffsetSpec};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ClientBuilder::new()
//!         .host("localhost")
//!         .port(5552)
//!         .credentials("guest", "guest")
//!         .build();
//!     let client = rabbit_stream_client::Client::new(config);
//!     client.connect().await?;
//!
//!     client.create_stream("orders", vec![]).await?;
//!     let publisher_id = client.declare_publisher("orders", "writer-1").await?;
//!
//!     let mut sub = client
//!         .subscribe("orders", OffsetSpec::Next, 10, vec![], 256)
//!         .await?;
//!     while let Some(chunk) = sub.next_delivery().await {
//!         println!("chunk with {} records", chunk.record_count);
//!         sub.credit(1).await?;
//!     }
//!
//!     client.delete_publisher(publisher_id).await?;
//!     client.close().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! A single actor task (see [`connection`]) owns the socket, the request
//! tracker, and the subscription registry. All mutation happens on that one
//! task; every other task reaches it only through a bounded mailbox and
//! waits on a `oneshot` reply.

pub mod client;
pub mod codec;
pub mod config;
pub mod connection;
pub mod error;
pub mod subscription;
pub mod tracker;

pub use client::{Client, ClientHandle, Metadata};
pub use codec::{CommandKind, ResponseCode};
pub use config::{ClientBuilder, Config};
pub use connection::{BrokerEndpoint, OffsetSpec, PublishedMessage, StreamTopology};
pub use error::{Error, Result};
pub use subscription::{OsirisChunk, Subscription};
