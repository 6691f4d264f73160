//! The connection actor: a single task that owns the TCP socket, the
//! handshake/tune/open state machine, the request tracker, and the
//! subscription registry. Every other part of the crate reaches it only
//! through [`crate::client::ClientHandle`]'s mailbox.
//!
//! The socket is split into a reader task and a writer task; a single
//! owning actor task processes events strictly in arrival order so wire
//! order and correlation order never diverge.

use std::collections::HashMap;
use std::time::Duration;

use log::{debug, info, warn};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::codec::{self, CommandKind, DecodedFrame, ResponseCode, Writer};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::subscription::OsirisChunk;
use crate::tracker::{Payload, Reply, RequestTracker};

/// A broker endpoint as reported by `query_metadata`.
#[derive(Debug, Clone)]
pub struct BrokerEndpoint {
    pub host: String,
    pub port: u32,
}

/// A stream's leader/replica layout as reported by `query_metadata`.
#[derive(Debug, Clone)]
pub struct StreamTopology {
    pub leader: u16,
    pub replicas: Vec<u16>,
}

/// Where a subscription should start reading from.
#[derive(Debug, Clone, Copy)]
pub enum OffsetSpec {
    First,
    Last,
    Next,
    Offset(i64),
    Timestamp(i64),
}

impl OffsetSpec {
    fn write(self, w: &mut Writer) {
        match self {
            OffsetSpec::First => w.write_u16(1),
            OffsetSpec::Last => w.write_u16(2),
            OffsetSpec::Next => w.write_u16(3),
            OffsetSpec::Offset(o) => {
                w.write_u16(4);
                w.write_i64(o);
            }
            OffsetSpec::Timestamp(t) => {
                w.write_u16(5);
                w.write_i64(t);
            }
        }
    }
}

/// A single message to publish; payload framing beyond the publishing id and
/// raw bytes is out of scope here (see the crate-level docs).
#[derive(Debug, Clone)]
pub struct PublishedMessage {
    pub publishing_id: u64,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnState {
    Closed,
    Connecting,
    Authenticating,
    Tuning,
    Opening,
    Open,
    Closing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HandshakeStep {
    PeerProperties,
    SaslHandshake,
    SaslAuthenticate,
}

/// Commands sent from [`crate::client::ClientHandle`] into the actor's
/// mailbox. Every variant that expects a server reply carries a
/// `oneshot::Sender<Result<Reply>>`; the client unwraps the variant it
/// expects to get back.
pub enum ActorCommand {
    Connect { reply: oneshot::Sender<Result<()>> },
    Close { reply: oneshot::Sender<Result<()>> },
    CreateStream {
        name: String,
        arguments: Vec<(String, String)>,
        reply: oneshot::Sender<Result<Reply>>,
    },
    DeleteStream { name: String, reply: oneshot::Sender<Result<Reply>> },
    DeclarePublisher {
        stream: String,
        reference: String,
        reply: oneshot::Sender<Result<Reply>>,
    },
    DeletePublisher { publisher_id: u8, reply: oneshot::Sender<Result<Reply>> },
    StoreOffset {
        stream: String,
        reference: String,
        offset: i64,
        reply: oneshot::Sender<Result<Reply>>,
    },
    QueryOffset {
        stream: String,
        reference: String,
        reply: oneshot::Sender<Result<Reply>>,
    },
    QueryPublisherSequence {
        stream: String,
        reference: String,
        reply: oneshot::Sender<Result<Reply>>,
    },
    Subscribe {
        stream: String,
        offset: OffsetSpec,
        credit: u16,
        properties: Vec<(String, String)>,
        sink: mpsc::Sender<OsirisChunk>,
        reply: oneshot::Sender<Result<Reply>>,
    },
    Unsubscribe { subscription_id: u8, reply: oneshot::Sender<Result<Reply>> },
    Credit { subscription_id: u8, credit: u16, reply: oneshot::Sender<Result<Reply>> },
    Publish {
        publisher_id: u8,
        messages: Vec<PublishedMessage>,
        reply: oneshot::Sender<Result<Reply>>,
    },
    QueryMetadata { streams: Vec<String>, reply: oneshot::Sender<Result<Reply>> },
}

/// Raised by the reader/writer tasks; folded into the actor's own event
/// stream alongside decoded frames.
enum ConnEvent {
    Frame(Vec<u8>),
    Failed(Error),
}

struct Actor {
    config: Config,
    state: ConnState,
    writer_tx: Option<mpsc::UnboundedSender<Vec<u8>>>,
    reader_task: Option<JoinHandle<()>>,
    writer_task: Option<JoinHandle<()>>,
    event_rx: Option<mpsc::Receiver<ConnEvent>>,
    tracker: RequestTracker,
    connect_waiters: Vec<oneshot::Sender<Result<()>>>,
    close_waiters: Vec<oneshot::Sender<Result<()>>>,
    subscriptions: HashMap<u8, mpsc::Sender<OsirisChunk>>,
    publisher_sequence: u8,
    subscription_sequence: u8,
    frame_max: u32,
    heartbeat_secs: u32,
    handshake: Option<(HandshakeStep, u32)>,
    open_corr: Option<u32>,
    brokers: HashMap<u16, BrokerEndpoint>,
    streams: HashMap<String, StreamTopology>,
    heartbeat: Option<tokio::time::Interval>,
    heartbeat_armed: bool,
}

/// Spawns the actor task and returns the mailbox callers send
/// [`ActorCommand`]s through.
pub fn spawn(config: Config) -> mpsc::Sender<ActorCommand> {
    let (command_tx, command_rx) = mpsc::channel(config.command_channel_capacity);
    let actor = Actor {
        config,
        state: ConnState::Closed,
        writer_tx: None,
        reader_task: None,
        writer_task: None,
        event_rx: None,
        tracker: RequestTracker::new(),
        connect_waiters: Vec::new(),
        close_waiters: Vec::new(),
        subscriptions: HashMap::new(),
        publisher_sequence: 1,
        subscription_sequence: 1,
        frame_max: 1_048_576,
        heartbeat_secs: 60,
        handshake: None,
        open_corr: None,
        brokers: HashMap::new(),
        streams: HashMap::new(),
        heartbeat: None,
        heartbeat_armed: false,
    };
    tokio::spawn(actor.run(command_rx));
    command_tx
}

impl Actor {
    async fn run(mut self, mut command_rx: mpsc::Receiver<ActorCommand>) {
        loop {
            let frame_event = async {
                match &mut self.event_rx {
                    Some(rx) => rx.recv().await,
                    None => std::future::pending().await,
                }
            };
            let heartbeat_tick = async {
                match &mut self.heartbeat {
                    Some(interval) => {
                        interval.tick().await;
                    }
                    None => std::future::pending::<()>().await,
                }
            };
            tokio::select! {
                cmd = command_rx.recv() => {
                    match cmd {
                        Some(cmd) => self.handle_command(cmd).await,
                        None => break,
                    }
                }
                ev = frame_event => {
                    match ev {
                        Some(ev) => self.handle_event(ev).await,
                        None => {
                            // the reader/writer pair for the current connection
                            // attempt tore down; nothing left to read until the
                            // next `connect()` rebuilds `event_rx`.
                            self.event_rx = None;
                        }
                    }
                }
                _ = heartbeat_tick, if self.heartbeat_armed => {
                    self.send_heartbeat().await;
                }
            }
        }
        self.teardown_tasks();
    }

    fn teardown_tasks(&mut self) {
        if let Some(h) = self.reader_task.take() {
            h.abort();
        }
        if let Some(h) = self.writer_task.take() {
            h.abort();
        }
    }

    async fn handle_command(&mut self, cmd: ActorCommand) {
        match cmd {
            ActorCommand::Connect { reply } => self.handle_connect(reply).await,
            ActorCommand::Close { reply } => self.handle_close(reply).await,
            ActorCommand::CreateStream { name, arguments, reply } => {
                self.handle_create_stream(name, arguments, reply).await
            }
            ActorCommand::DeleteStream { name, reply } => self.handle_delete_stream(name, reply).await,
            ActorCommand::DeclarePublisher { stream, reference, reply } => {
                self.handle_declare_publisher(stream, reference, reply).await
            }
            ActorCommand::DeletePublisher { publisher_id, reply } => {
                self.handle_delete_publisher(publisher_id, reply).await
            }
            ActorCommand::StoreOffset { stream, reference, offset, reply } => {
                self.handle_store_offset(stream, reference, offset, reply).await
            }
            ActorCommand::QueryOffset { stream, reference, reply } => {
                self.handle_query_offset(stream, reference, reply).await
            }
            ActorCommand::QueryPublisherSequence { stream, reference, reply } => {
                self.handle_query_publisher_sequence(stream, reference, reply).await
            }
            ActorCommand::Subscribe { stream, offset, credit, properties, sink, reply } => {
                self.handle_subscribe(stream, offset, credit, properties, sink, reply).await
            }
            ActorCommand::Unsubscribe { subscription_id, reply } => {
                self.handle_unsubscribe(subscription_id, reply).await
            }
            ActorCommand::Credit { subscription_id, credit, reply } => {
                self.handle_credit(subscription_id, credit, reply).await
            }
            ActorCommand::Publish { publisher_id, messages, reply } => {
                self.handle_publish(publisher_id, messages, reply).await
            }
            ActorCommand::QueryMetadata { streams, reply } => self.handle_query_metadata(streams, reply).await,
        }
    }

    async fn handle_connect(&mut self, reply: oneshot::Sender<Result<()>>) {
        match self.state {
            ConnState::Closed => {
                self.connect_waiters.push(reply);
                self.begin_connecting().await;
            }
            ConnState::Open => {
                let _ = reply.send(Ok(()));
            }
            ConnState::Closing => {
                let _ = reply.send(Err(Error::Closed));
            }
            _ => {
                // a handshake is already under way; queue behind it
                self.connect_waiters.push(reply);
            }
        }
    }

    async fn begin_connecting(&mut self) {
        self.state = ConnState::Connecting;
        let addr = format!("{}:{}", self.config.host, self.config.port);
        info!("connecting to {addr}");
        let connect_fut = TcpStream::connect(&addr);
        let stream = match tokio::time::timeout(self.config.connect_timeout, connect_fut).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                self.fail_connection(Error::from(e)).await;
                return;
            }
            Err(_) => {
                self.fail_connection(Error::Io("connect timed out".to_owned())).await;
                return;
            }
        };
        let _ = stream.set_nodelay(true);
        let (read_half, write_half) = stream.into_split();

        let (event_tx, event_rx) = mpsc::channel::<ConnEvent>(self.config.frame_channel_capacity);
        let (write_tx, write_rx) = mpsc::unbounded_channel::<Vec<u8>>();

        let reader_task = tokio::spawn(reader_loop(read_half, event_tx.clone()));
        let writer_task = tokio::spawn(writer_loop(write_half, write_rx, event_tx));

        self.reader_task = Some(reader_task);
        self.writer_task = Some(writer_task);
        self.writer_tx = Some(write_tx);
        self.event_rx = Some(event_rx);

        self.state = ConnState::Authenticating;
        self.send_peer_properties().await;
    }

    async fn send_peer_properties(&mut self) {
        let corr = self.tracker.allocate();
        self.handshake = Some((HandshakeStep::PeerProperties, corr));
        let mut w = Writer::new();
        w.write_u32(corr);
        w.write_u32(1); // one property
        w.write_string(Some("product"));
        w.write_string(Some("rabbit-stream-client"));
        self.send_request(CommandKind::PeerProperties, &w.into_vec()).await;
    }

    async fn send_sasl_handshake(&mut self) {
        let corr = self.tracker.allocate();
        self.handshake = Some((HandshakeStep::SaslHandshake, corr));
        let mut w = Writer::new();
        w.write_u32(corr);
        self.send_request(CommandKind::SaslHandshake, &w.into_vec()).await;
    }

    async fn send_sasl_authenticate(&mut self) {
        let corr = self.tracker.allocate();
        self.handshake = Some((HandshakeStep::SaslAuthenticate, corr));
        let mut w = Writer::new();
        w.write_u32(corr);
        w.write_string(Some("PLAIN"));
        let mut auth = Vec::new();
        auth.push(0u8);
        auth.extend_from_slice(self.config.username.as_bytes());
        auth.push(0u8);
        auth.extend_from_slice(self.config.password.as_bytes());
        w.write_bytes(&auth);
        self.send_request(CommandKind::SaslAuthenticate, &w.into_vec()).await;
    }

    /// Shared tail of both tuning paths: a server `tune` request, or a
    /// non-empty opaque body on the `sasl_authenticate` response (see
    /// DESIGN.md for why the latter is treated as an embedded tune payload).
    async fn negotiate_tune_and_open(&mut self, server_frame_max: u32, server_heartbeat: u32) {
        self.frame_max = self.config.requested_frame_max.min(server_frame_max).max(1);
        let heartbeat = self.config.requested_heartbeat.min(server_heartbeat);
        self.heartbeat_secs = heartbeat;
        self.state = ConnState::Tuning;

        let mut w = Writer::new();
        w.write_u32(self.frame_max);
        w.write_u32(heartbeat);
        self.send_request(CommandKind::Tune, &w.into_vec()).await;

        if heartbeat > 0 {
            let period = Duration::from_secs(heartbeat as u64);
            self.heartbeat = Some(tokio::time::interval_at(tokio::time::Instant::now() + period, period));
            self.heartbeat_armed = true;
        } else {
            self.heartbeat = None;
            self.heartbeat_armed = false;
        }

        let corr = self.tracker.allocate();
        self.open_corr = Some(corr);
        let mut ow = Writer::new();
        ow.write_u32(corr);
        ow.write_string(Some(&self.config.vhost));
        self.send_request(CommandKind::Open, &ow.into_vec()).await;
        self.state = ConnState::Opening;
    }

    async fn send_heartbeat(&mut self) {
        debug!("sending heartbeat");
        self.send_request(CommandKind::Heartbeat, &[]).await;
    }

    async fn send_request(&mut self, kind: CommandKind, body: &[u8]) {
        if let Some(tx) = &self.writer_tx {
            let frame = codec::encode_frame(kind.key(), 1, body);
            let _ = tx.send(frame);
        }
    }

    async fn send_response(&mut self, kind: CommandKind, body: &[u8]) {
        if let Some(tx) = &self.writer_tx {
            let frame = codec::encode_frame(kind.key() | codec::RESPONSE_FLAG, 1, body);
            let _ = tx.send(frame);
        }
    }

    async fn handle_event(&mut self, event: ConnEvent) {
        match event {
            ConnEvent::Frame(bytes) => self.handle_frame(bytes).await,
            ConnEvent::Failed(e) => self.fail_connection(e).await,
        }
    }

    async fn handle_frame(&mut self, bytes: Vec<u8>) {
        if bytes.len() > self.frame_max as usize {
            self.fail_connection(Error::FrameTooLarge).await;
            return;
        }
        let decoded = match codec::decode_frame(&bytes) {
            Ok(d) => d,
            Err(e) => {
                self.fail_connection(e).await;
                return;
            }
        };
        if decoded.is_response {
            self.handle_response(decoded).await;
        } else {
            self.handle_request_or_async(decoded).await;
        }
    }

    async fn handle_response(&mut self, mut decoded: DecodedFrame<'_>) {
        match decoded.kind {
            CommandKind::PeerProperties => {
                let Ok(corr) = decoded.reader.read_u32() else { return self.malformed().await };
                if self.handshake != Some((HandshakeStep::PeerProperties, corr)) {
                    warn!("unexpected peer_properties response");
                    return;
                }
                let Ok(code) = decoded.reader.read_u16() else { return self.malformed().await };
                match ResponseCode::from_u16(code) {
                    Some(ResponseCode::Ok) => self.send_sasl_handshake().await,
                    Some(other) => self.fail_connect(Error::Sasl(other)).await,
                    None => self.malformed().await,
                }
            }
            CommandKind::SaslHandshake => {
                let Ok(corr) = decoded.reader.read_u32() else { return self.malformed().await };
                if self.handshake != Some((HandshakeStep::SaslHandshake, corr)) {
                    warn!("unexpected sasl_handshake response");
                    return;
                }
                let Ok(code) = decoded.reader.read_u16() else { return self.malformed().await };
                match ResponseCode::from_u16(code) {
                    Some(ResponseCode::Ok) => self.send_sasl_authenticate().await,
                    Some(other) => self.fail_connect(Error::Sasl(other)).await,
                    None => self.malformed().await,
                }
            }
            CommandKind::SaslAuthenticate => {
                let Ok(corr) = decoded.reader.read_u32() else { return self.malformed().await };
                if self.handshake != Some((HandshakeStep::SaslAuthenticate, corr)) {
                    warn!("unexpected sasl_authenticate response");
                    return;
                }
                let Ok(code) = decoded.reader.read_u16() else { return self.malformed().await };
                match ResponseCode::from_u16(code) {
                    Some(ResponseCode::Ok) => {
                        let Ok(opaque) = decoded.reader.read_bytes() else { return self.malformed().await };
                        self.handshake = None;
                        if opaque.is_empty() {
                            // stay in `authenticating`, awaiting the server's tune request
                        } else {
                            let mut r = codec::Reader::new(&opaque);
                            let (Ok(frame_max), Ok(heartbeat)) = (r.read_u32(), r.read_u32()) else {
                                return self.malformed().await;
                            };
                            self.negotiate_tune_and_open(frame_max, heartbeat).await;
                        }
                    }
                    Some(other) => self.fail_connect(Error::Sasl(other)).await,
                    None => self.malformed().await,
                }
            }
            CommandKind::Open => {
                let Ok(corr) = decoded.reader.read_u32() else { return self.malformed().await };
                if self.open_corr != Some(corr) {
                    warn!("unexpected open response");
                    return;
                }
                let Ok(code) = decoded.reader.read_u16() else { return self.malformed().await };
                match ResponseCode::from_u16(code) {
                    Some(ResponseCode::Ok) => {
                        self.open_corr = None;
                        self.state = ConnState::Open;
                        info!("connection open");
                        for waiter in self.connect_waiters.drain(..) {
                            let _ = waiter.send(Ok(()));
                        }
                    }
                    Some(other) => self.fail_connect(Error::Command(other)).await,
                    None => self.malformed().await,
                }
            }
            CommandKind::Close => {
                let Ok(corr) = decoded.reader.read_u32() else { return self.malformed().await };
                let Ok(code) = decoded.reader.read_u16() else { return self.malformed().await };
                if let Some(entry) = self.tracker.pop(CommandKind::Close, corr) {
                    let result = match ResponseCode::from_u16(code) {
                        Some(ResponseCode::Ok) => Ok(Reply::Unit),
                        Some(other) => Err(Error::Command(other)),
                        None => Err(Error::MalformedFrame),
                    };
                    let _ = entry.waiter.send(result);
                }
                self.finish_close().await;
            }
            kind @ (CommandKind::CreateStream
            | CommandKind::DeleteStream
            | CommandKind::DeclarePublisher
            | CommandKind::DeletePublisher) => {
                let Ok(corr) = decoded.reader.read_u32() else { return self.malformed().await };
                let Ok(code) = decoded.reader.read_u16() else { return self.malformed().await };
                let Some(entry) = self.tracker.pop(kind, corr) else {
                    warn!("response for unknown correlation id {corr} ({kind:?})");
                    return;
                };
                let result = match ResponseCode::from_u16(code) {
                    Some(ResponseCode::Ok) => match entry.payload {
                        Payload::PublisherId(id) => Ok(Reply::PublisherId(id)),
                        _ => Ok(Reply::Unit),
                    },
                    Some(other) => Err(Error::Command(other)),
                    None => Err(Error::MalformedFrame),
                };
                let _ = entry.waiter.send(result);
            }
            CommandKind::Unsubscribe => {
                let Ok(corr) = decoded.reader.read_u32() else { return self.malformed().await };
                let Ok(code) = decoded.reader.read_u16() else { return self.malformed().await };
                let Some(entry) = self.tracker.pop(CommandKind::Unsubscribe, corr) else {
                    warn!("response for unknown correlation id {corr} (Unsubscribe)");
                    return;
                };
                let result = match ResponseCode::from_u16(code) {
                    Some(ResponseCode::Ok) => {
                        if let Payload::SubscriptionId(id) = entry.payload {
                            self.subscriptions.remove(&id);
                        }
                        Ok(Reply::Unit)
                    }
                    Some(other) => Err(Error::Command(other)),
                    None => Err(Error::MalformedFrame),
                };
                let _ = entry.waiter.send(result);
            }
            CommandKind::Subscribe => {
                let Ok(corr) = decoded.reader.read_u32() else { return self.malformed().await };
                let Ok(code) = decoded.reader.read_u16() else { return self.malformed().await };
                let Some(entry) = self.tracker.pop(CommandKind::Subscribe, corr) else {
                    warn!("subscribe response for unknown correlation id {corr}");
                    return;
                };
                match (ResponseCode::from_u16(code), entry.payload) {
                    (Some(ResponseCode::Ok), Payload::Subscription { id, sink }) => {
                        self.subscriptions.insert(id, sink);
                        let _ = entry.waiter.send(Ok(Reply::SubscriptionId(id)));
                    }
                    (Some(other), _) => {
                        let _ = entry.waiter.send(Err(Error::Command(other)));
                    }
                    (None, _) => {
                        let _ = entry.waiter.send(Err(Error::MalformedFrame));
                    }
                }
            }
            CommandKind::QueryOffset => {
                let Ok(corr) = decoded.reader.read_u32() else { return self.malformed().await };
                let Ok(code) = decoded.reader.read_u16() else { return self.malformed().await };
                let Some(entry) = self.tracker.pop(CommandKind::QueryOffset, corr) else {
                    return;
                };
                let result = match ResponseCode::from_u16(code) {
                    Some(ResponseCode::Ok) => decoded.reader.read_i64().map(Reply::Offset),
                    Some(other) => Err(Error::Command(other)),
                    None => Err(Error::MalformedFrame),
                };
                let _ = entry.waiter.send(result);
            }
            CommandKind::QueryPublisherSequence => {
                let Ok(corr) = decoded.reader.read_u32() else { return self.malformed().await };
                let Ok(code) = decoded.reader.read_u16() else { return self.malformed().await };
                let Some(entry) = self.tracker.pop(CommandKind::QueryPublisherSequence, corr) else {
                    return;
                };
                let result = match ResponseCode::from_u16(code) {
                    Some(ResponseCode::Ok) => decoded.reader.read_u64().map(Reply::PublisherSequence),
                    Some(other) => Err(Error::Command(other)),
                    None => Err(Error::MalformedFrame),
                };
                let _ = entry.waiter.send(result);
            }
            CommandKind::QueryMetadata => {
                let Ok(corr) = decoded.reader.read_u32() else { return self.malformed().await };
                let Ok(code) = decoded.reader.read_u16() else { return self.malformed().await };
                let waiter = self.tracker.pop(CommandKind::QueryMetadata, corr);
                if !matches!(ResponseCode::from_u16(code), Some(ResponseCode::Ok)) {
                    if let Some(entry) = waiter {
                        let _ = entry.waiter.send(Err(Error::MalformedFrame));
                    }
                    return;
                }
                if let Err(e) = self.merge_metadata(&mut decoded.reader) {
                    if let Some(entry) = waiter {
                        let _ = entry.waiter.send(Err(e));
                    }
                    return;
                }
                if let Some(entry) = waiter {
                    let _ = entry.waiter.send(Ok(Reply::Metadata {
                        brokers: self.brokers.clone(),
                        streams: self.streams.clone(),
                    }));
                }
            }
            other => {
                warn!("unexpected response frame for {other:?}");
            }
        }
    }

    fn merge_metadata(&mut self, reader: &mut codec::Reader<'_>) -> Result<()> {
        let broker_count = reader.read_u32()?;
        for _ in 0..broker_count {
            let reference = reader.read_u16()?;
            let host = reader.read_string()?.ok_or(Error::MalformedFrame)?;
            let port = reader.read_u32()?;
            self.brokers.insert(reference, BrokerEndpoint { host, port });
        }
        let stream_count = reader.read_u32()?;
        for _ in 0..stream_count {
            let name = reader.read_string()?.ok_or(Error::MalformedFrame)?;
            let code = reader.read_u16()?;
            if ResponseCode::from_u16(code) != Some(ResponseCode::Ok) {
                continue;
            }
            let leader = reader.read_u16()?;
            let replica_count = reader.read_u32()?;
            let mut replicas = Vec::with_capacity(replica_count as usize);
            for _ in 0..replica_count {
                replicas.push(reader.read_u16()?);
            }
            self.streams.insert(name, StreamTopology { leader, replicas });
        }
        Ok(())
    }

    async fn handle_request_or_async(&mut self, mut decoded: DecodedFrame<'_>) {
        match decoded.kind {
            CommandKind::Tune => {
                let Ok(frame_max) = decoded.reader.read_u32() else { return self.malformed().await };
                let Ok(heartbeat) = decoded.reader.read_u32() else { return self.malformed().await };
                self.negotiate_tune_and_open(frame_max, heartbeat).await;
            }
            CommandKind::Close => {
                let Ok(corr) = decoded.reader.read_u32() else { return self.malformed().await };
                let _reason_code = decoded.reader.read_u16();
                let _reason = decoded.reader.read_string();
                info!("server requested close");
                let mut w = Writer::new();
                w.write_u32(corr);
                w.write_u16(ResponseCode::Ok.to_u16());
                self.send_response(CommandKind::Close, &w.into_vec()).await;
                self.finish_close().await;
            }
            CommandKind::MetadataUpdate => {
                let Ok(stream) = decoded.reader.read_string() else { return self.malformed().await };
                let Some(stream) = stream else { return };
                debug!("metadata_update for {stream}");
                let (tx, _rx) = oneshot::channel();
                let id = self.tracker.push(CommandKind::QueryMetadata, tx, Payload::None);
                let mut w = Writer::new();
                w.write_u32(id);
                w.write_u32(1);
                w.write_string(Some(&stream));
                self.send_request(CommandKind::QueryMetadata, &w.into_vec()).await;
            }
            CommandKind::Heartbeat => {
                debug!("heartbeat received");
            }
            CommandKind::Deliver => {
                let Ok(subscription_id) = decoded.reader.read_u8() else { return self.malformed().await };
                let Ok(epoch) = decoded.reader.read_u64() else { return self.malformed().await };
                let Ok(first_offset) = decoded.reader.read_i64() else { return self.malformed().await };
                let Ok(record_count) = decoded.reader.read_u32() else { return self.malformed().await };
                let Ok(data) = decoded.reader.read_bytes() else { return self.malformed().await };
                if let Some(sink) = self.subscriptions.get(&subscription_id) {
                    let chunk = OsirisChunk { epoch, first_offset, record_count, data };
                    if sink.try_send(chunk).is_err() {
                        warn!("delivery sink for subscription {subscription_id} is behind; chunk dropped");
                    }
                } else {
                    debug!("deliver for unknown subscription {subscription_id} dropped");
                }
            }
            CommandKind::PublishConfirm | CommandKind::PublishError => {
                // confirmation fan-out belongs to the out-of-scope Publisher handle
            }
            other => {
                warn!("unexpected request frame for {other:?}");
            }
        }
    }

    async fn malformed(&mut self) {
        self.fail_connection(Error::MalformedFrame).await;
    }

    async fn fail_connect(&mut self, error: Error) {
        self.handshake = None;
        self.fail_connection(error).await;
    }

    async fn fail_connection(&mut self, error: Error) {
        if matches!(error, Error::TcpClosed) && matches!(self.state, ConnState::Connecting | ConnState::Authenticating) {
            warn!("socket closed during {:?}; the RabbitMQ Stream plugin may be inactive on this broker", self.state);
        } else {
            warn!("connection failed: {error}");
        }
        self.state = ConnState::Closed;
        self.heartbeat_armed = false;
        self.heartbeat = None;
        self.writer_tx = None;
        self.event_rx = None;
        self.teardown_tasks();
        self.tracker.drain(error.clone());
        for waiter in self.connect_waiters.drain(..) {
            let _ = waiter.send(Err(error.clone()));
        }
        for waiter in self.close_waiters.drain(..) {
            let _ = waiter.send(Err(error.clone()));
        }
        self.subscriptions.clear();
    }

    async fn finish_close(&mut self) {
        self.state = ConnState::Closed;
        self.heartbeat_armed = false;
        self.heartbeat = None;
        self.writer_tx = None;
        self.event_rx = None;
        self.teardown_tasks();
        self.tracker.drain(Error::Closed);
        self.subscriptions.clear();
        for waiter in self.connect_waiters.drain(..) {
            let _ = waiter.send(Err(Error::Closed));
        }
        for waiter in self.close_waiters.drain(..) {
            let _ = waiter.send(Ok(()));
        }
    }

    async fn handle_close(&mut self, reply: oneshot::Sender<Result<()>>) {
        match self.state {
            ConnState::Closed => {
                let _ = reply.send(Ok(()));
            }
            ConnState::Open => {
                self.state = ConnState::Closing;
                self.close_waiters.push(reply);
                let (tx, _rx) = oneshot::channel();
                let corr = self.tracker.push(CommandKind::Close, tx, Payload::None);
                let mut w = Writer::new();
                w.write_u32(corr);
                w.write_u16(ResponseCode::Ok.to_u16());
                w.write_string(Some("normal shutdown"));
                self.send_request(CommandKind::Close, &w.into_vec()).await;
            }
            _ => {
                self.close_waiters.push(reply);
                self.finish_close().await;
            }
        }
    }

    async fn handle_create_stream(&mut self, name: String, arguments: Vec<(String, String)>, reply: oneshot::Sender<Result<Reply>>) {
        let Some(reply) = self.ensure_open(reply) else { return };
        if let Err(e) = validate_stream_name(&name) {
            let _ = reply.send(Err(e));
            return;
        }
        let corr = self.tracker.push(CommandKind::CreateStream, reply, Payload::None);
        let mut w = Writer::new();
        w.write_u32(corr);
        w.write_string(Some(&name));
        w.write_u32(arguments.len() as u32);
        for (k, v) in &arguments {
            w.write_string(Some(k));
            w.write_string(Some(v));
        }
        self.send_request(CommandKind::CreateStream, &w.into_vec()).await;
    }

    async fn handle_delete_stream(&mut self, name: String, reply: oneshot::Sender<Result<Reply>>) {
        let Some(reply) = self.ensure_open(reply) else { return };
        if let Err(e) = validate_stream_name(&name) {
            let _ = reply.send(Err(e));
            return;
        }
        let corr = self.tracker.push(CommandKind::DeleteStream, reply, Payload::None);
        let mut w = Writer::new();
        w.write_u32(corr);
        w.write_string(Some(&name));
        self.send_request(CommandKind::DeleteStream, &w.into_vec()).await;
    }

    async fn handle_declare_publisher(&mut self, stream: String, reference: String, reply: oneshot::Sender<Result<Reply>>) {
        let Some(reply) = self.ensure_open(reply) else { return };
        if let Err(e) = validate_stream_name(&stream) {
            let _ = reply.send(Err(e));
            return;
        }
        let publisher_id = self.publisher_sequence;
        self.publisher_sequence = self.publisher_sequence.wrapping_add(1);
        let corr = self.tracker.push(CommandKind::DeclarePublisher, reply, Payload::PublisherId(publisher_id));
        let mut w = Writer::new();
        w.write_u32(corr);
        w.write_u8(publisher_id);
        w.write_string(Some(&reference));
        w.write_string(Some(&stream));
        self.send_request(CommandKind::DeclarePublisher, &w.into_vec()).await;
    }

    async fn handle_delete_publisher(&mut self, publisher_id: u8, reply: oneshot::Sender<Result<Reply>>) {
        let Some(reply) = self.ensure_open(reply) else { return };
        let corr = self.tracker.push(CommandKind::DeletePublisher, reply, Payload::None);
        let mut w = Writer::new();
        w.write_u32(corr);
        w.write_u8(publisher_id);
        self.send_request(CommandKind::DeletePublisher, &w.into_vec()).await;
    }

    async fn handle_store_offset(&mut self, stream: String, reference: String, offset: i64, reply: oneshot::Sender<Result<Reply>>) {
        let Some(reply) = self.ensure_open(reply) else { return };
        if let Err(e) = validate_stream_name(&stream) {
            let _ = reply.send(Err(e));
            return;
        }
        let mut w = Writer::new();
        w.write_string(Some(&reference));
        w.write_string(Some(&stream));
        w.write_i64(offset);
        self.send_request(CommandKind::StoreOffset, &w.into_vec()).await;
        let _ = reply.send(Ok(Reply::Unit));
    }

    async fn handle_query_offset(&mut self, stream: String, reference: String, reply: oneshot::Sender<Result<Reply>>) {
        let Some(reply) = self.ensure_open(reply) else { return };
        if let Err(e) = validate_stream_name(&stream) {
            let _ = reply.send(Err(e));
            return;
        }
        let corr = self.tracker.push(CommandKind::QueryOffset, reply, Payload::None);
        let mut w = Writer::new();
        w.write_u32(corr);
        w.write_string(Some(&reference));
        w.write_string(Some(&stream));
        self.send_request(CommandKind::QueryOffset, &w.into_vec()).await;
    }

    async fn handle_query_publisher_sequence(&mut self, stream: String, reference: String, reply: oneshot::Sender<Result<Reply>>) {
        let Some(reply) = self.ensure_open(reply) else { return };
        if let Err(e) = validate_stream_name(&stream) {
            let _ = reply.send(Err(e));
            return;
        }
        let corr = self.tracker.push(CommandKind::QueryPublisherSequence, reply, Payload::None);
        let mut w = Writer::new();
        w.write_u32(corr);
        w.write_string(Some(&reference));
        w.write_string(Some(&stream));
        self.send_request(CommandKind::QueryPublisherSequence, &w.into_vec()).await;
    }

    async fn handle_subscribe(
        &mut self,
        stream: String,
        offset: OffsetSpec,
        credit: u16,
        properties: Vec<(String, String)>,
        sink: mpsc::Sender<OsirisChunk>,
        reply: oneshot::Sender<Result<Reply>>,
    ) {
        let Some(reply) = self.ensure_open(reply) else { return };
        if let Err(e) = validate_stream_name(&stream) {
            let _ = reply.send(Err(e));
            return;
        }
        let subscription_id = self.subscription_sequence;
        self.subscription_sequence = self.subscription_sequence.wrapping_add(1);
        let corr = self.tracker.push(
            CommandKind::Subscribe,
            reply,
            Payload::Subscription { id: subscription_id, sink },
        );
        let mut w = Writer::new();
        w.write_u32(corr);
        w.write_u8(subscription_id);
        w.write_string(Some(&stream));
        offset.write(&mut w);
        w.write_u16(credit);
        w.write_u32(properties.len() as u32);
        for (k, v) in &properties {
            w.write_string(Some(k));
            w.write_string(Some(v));
        }
        self.send_request(CommandKind::Subscribe, &w.into_vec()).await;
    }

    async fn handle_unsubscribe(&mut self, subscription_id: u8, reply: oneshot::Sender<Result<Reply>>) {
        let Some(reply) = self.ensure_open(reply) else { return };
        let corr = self.tracker.push(CommandKind::Unsubscribe, reply, Payload::SubscriptionId(subscription_id));
        let mut w = Writer::new();
        w.write_u32(corr);
        w.write_u8(subscription_id);
        self.send_request(CommandKind::Unsubscribe, &w.into_vec()).await;
    }

    async fn handle_credit(&mut self, subscription_id: u8, credit: u16, reply: oneshot::Sender<Result<Reply>>) {
        let Some(reply) = self.ensure_open(reply) else { return };
        let mut w = Writer::new();
        w.write_u8(subscription_id);
        w.write_u16(credit);
        self.send_request(CommandKind::Credit, &w.into_vec()).await;
        let _ = reply.send(Ok(Reply::Unit));
    }

    async fn handle_publish(&mut self, publisher_id: u8, messages: Vec<PublishedMessage>, reply: oneshot::Sender<Result<Reply>>) {
        let Some(reply) = self.ensure_open(reply) else { return };
        let mut w = Writer::new();
        w.write_u8(publisher_id);
        w.write_u32(messages.len() as u32);
        for m in &messages {
            w.write_u64(m.publishing_id);
            w.write_bytes(&m.data);
        }
        self.send_request(CommandKind::Publish, &w.into_vec()).await;
        let _ = reply.send(Ok(Reply::Unit));
    }

    async fn handle_query_metadata(&mut self, streams: Vec<String>, reply: oneshot::Sender<Result<Reply>>) {
        let Some(reply) = self.ensure_open(reply) else { return };
        let corr = self.tracker.push(CommandKind::QueryMetadata, reply, Payload::None);
        let mut w = Writer::new();
        w.write_u32(corr);
        w.write_u32(streams.len() as u32);
        for s in &streams {
            w.write_string(Some(s));
        }
        self.send_request(CommandKind::QueryMetadata, &w.into_vec()).await;
    }

    /// Returns the reply sender back if the connection is open, otherwise
    /// completes it with `Closed` and returns `None`.
    fn ensure_open(&self, reply: oneshot::Sender<Result<Reply>>) -> Option<oneshot::Sender<Result<Reply>>> {
        if self.state != ConnState::Open {
            let _ = reply.send(Err(Error::Closed));
            None
        } else {
            Some(reply)
        }
    }
}

fn validate_stream_name(name: &str) -> Result<()> {
    if name.is_empty() || name.len() > 255 {
        return Err(Error::InvalidArgument(format!(
            "stream name must be 1..=255 bytes, got {}",
            name.len()
        )));
    }
    Ok(())
}

async fn reader_loop(mut read_half: tokio::net::tcp::OwnedReadHalf, events: mpsc::Sender<ConnEvent>) {
    let mut buf = Vec::with_capacity(8192);
    loop {
        while let Some(frame) = extract_frame(&mut buf) {
            if events.send(ConnEvent::Frame(frame)).await.is_err() {
                return;
            }
        }
        let mut chunk = [0u8; 8192];
        match read_half.read(&mut chunk).await {
            Ok(0) => {
                let _ = events.send(ConnEvent::Failed(Error::TcpClosed)).await;
                return;
            }
            Ok(n) => buf.extend_from_slice(&chunk[..n]),
            Err(e) => {
                let _ = events.send(ConnEvent::Failed(Error::from(e))).await;
                return;
            }
        }
    }
}

fn extract_frame(buf: &mut Vec<u8>) -> Option<Vec<u8>> {
    let length = codec::try_read_frame_length(buf)? as usize;
    if buf.len() < 4 + length {
        return None;
    }
    let frame = buf[4..4 + length].to_vec();
    buf.drain(0..4 + length);
    Some(frame)
}

async fn writer_loop(
    mut write_half: tokio::net::tcp::OwnedWriteHalf,
    mut frames: mpsc::UnboundedReceiver<Vec<u8>>,
    events: mpsc::Sender<ConnEvent>,
) {
    while let Some(frame) = frames.recv().await {
        if let Err(e) = write_half.write_all(&frame).await {
            let _ = events.send(ConnEvent::Failed(Error::from(e))).await;
            return;
        }
    }
}
