//! End-to-end scenarios for the connection actor, scripted against an
//! in-process mock broker rather than a real RabbitMQ node.

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use rabbit_stream_client::codec::{self, CommandKind, ResponseCode, Writer};
use rabbit_stream_client::{Client, ClientBuilder, Error};

async fn bind_mock() -> (TcpListener, String, u16) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    (listener, addr.ip().to_string(), addr.port())
}

async fn read_frame(stream: &mut TcpStream) -> Vec<u8> {
    let mut len_buf = [0u8; 4];
    stream.read_exact(&mut len_buf).await.unwrap();
    let len = u32::from_be_bytes(len_buf) as usize;
    let mut body = vec![0u8; len];
    stream.read_exact(&mut body).await.unwrap();
    body
}

async fn write_request(stream: &mut TcpStream, kind: CommandKind, body: &[u8]) {
    let frame = codec::encode_frame(kind.key(), 1, body);
    stream.write_all(&frame).await.unwrap();
}

async fn write_response(stream: &mut TcpStream, kind: CommandKind, body: &[u8]) {
    let frame = codec::encode_frame(kind.key() | codec::RESPONSE_FLAG, 1, body);
    stream.write_all(&frame).await.unwrap();
}

fn corr_of(frame: &[u8]) -> u32 {
    u32::from_be_bytes(frame[4..8].try_into().unwrap())
}

/// Drives peer_properties -> sasl_handshake -> sasl_authenticate(empty) ->
/// server-initiated tune -> open, matching the happy-path handshake scenario.
async fn handshake_to_open(stream: &mut TcpStream, frame_max: u32, heartbeat: u32) {
    let frame = read_frame(stream).await;
    let mut w = Writer::new();
    w.write_u32(corr_of(&frame));
    w.write_u16(ResponseCode::Ok.to_u16());
    w.write_u32(0);
    write_response(stream, CommandKind::PeerProperties, &w.into_vec()).await;

    let frame = read_frame(stream).await;
    let mut w = Writer::new();
    w.write_u32(corr_of(&frame));
    w.write_u16(ResponseCode::Ok.to_u16());
    w.write_u32(1);
    w.write_string(Some("PLAIN"));
    write_response(stream, CommandKind::SaslHandshake, &w.into_vec()).await;

    let frame = read_frame(stream).await;
    let mut w = Writer::new();
    w.write_u32(corr_of(&frame));
    w.write_u16(ResponseCode::Ok.to_u16());
    w.write_bytes(&[]);
    write_response(stream, CommandKind::SaslAuthenticate, &w.into_vec()).await;

    let mut w = Writer::new();
    w.write_u32(frame_max);
    w.write_u32(heartbeat);
    write_request(stream, CommandKind::Tune, &w.into_vec()).await;

    let _echoed_tune = read_frame(stream).await;

    let frame = read_frame(stream).await;
    let mut w = Writer::new();
    w.write_u32(corr_of(&frame));
    w.write_u16(ResponseCode::Ok.to_u16());
    w.write_u32(0);
    write_response(stream, CommandKind::Open, &w.into_vec()).await;
}

#[tokio::test]
async fn happy_handshake_opens_the_connection() {
    let (listener, host, port) = bind_mock().await;
    let server = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        handshake_to_open(&mut stream, 1_048_576, 60).await;
        stream
    });

    let client = Client::new(ClientBuilder::new().host(host).port(port).build());
    client.connect().await.expect("connect should succeed");

    server.await.unwrap();
}

#[tokio::test]
async fn sasl_failure_rejects_connect_and_closes() {
    let (listener, host, port) = bind_mock().await;
    let server = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();

        let frame = read_frame(&mut stream).await;
        let mut w = Writer::new();
        w.write_u32(corr_of(&frame));
        w.write_u16(ResponseCode::Ok.to_u16());
        w.write_u32(0);
        write_response(&mut stream, CommandKind::PeerProperties, &w.into_vec()).await;

        let frame = read_frame(&mut stream).await;
        let mut w = Writer::new();
        w.write_u32(corr_of(&frame));
        w.write_u16(ResponseCode::Ok.to_u16());
        w.write_u32(1);
        w.write_string(Some("PLAIN"));
        write_response(&mut stream, CommandKind::SaslHandshake, &w.into_vec()).await;

        let frame = read_frame(&mut stream).await;
        let mut w = Writer::new();
        w.write_u32(corr_of(&frame));
        w.write_u16(ResponseCode::AuthenticationFailure.to_u16());
        write_response(&mut stream, CommandKind::SaslAuthenticate, &w.into_vec()).await;
    });

    let client = Client::new(ClientBuilder::new().host(host).port(port).build());
    let err = client.connect().await.expect_err("authentication should fail");
    assert_eq!(err, Error::Sasl(ResponseCode::AuthenticationFailure));

    server.await.unwrap();
}

#[tokio::test]
async fn create_then_delete_stream() {
    let (listener, host, port) = bind_mock().await;
    let server = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        handshake_to_open(&mut stream, 1_048_576, 60).await;

        let frame = read_frame(&mut stream).await;
        let mut w = Writer::new();
        w.write_u32(corr_of(&frame));
        w.write_u16(ResponseCode::Ok.to_u16());
        write_response(&mut stream, CommandKind::CreateStream, &w.into_vec()).await;

        let frame = read_frame(&mut stream).await;
        let mut w = Writer::new();
        w.write_u32(corr_of(&frame));
        w.write_u16(ResponseCode::StreamDoesNotExist.to_u16());
        write_response(&mut stream, CommandKind::DeleteStream, &w.into_vec()).await;

        stream
    });

    let client = Client::new(ClientBuilder::new().host(host).port(port).build());
    client.connect().await.unwrap();

    client.create_stream("s1", vec![]).await.expect("create should succeed");
    let err = client.delete_stream("s1").await.expect_err("delete should fail");
    assert_eq!(err, Error::Command(ResponseCode::StreamDoesNotExist));

    server.await.unwrap();
}

#[tokio::test]
async fn declare_publisher_allocates_incrementing_ids() {
    let (listener, host, port) = bind_mock().await;
    let server = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        handshake_to_open(&mut stream, 1_048_576, 60).await;

        for _ in 0..2 {
            let frame = read_frame(&mut stream).await;
            let mut w = Writer::new();
            w.write_u32(corr_of(&frame));
            w.write_u16(ResponseCode::Ok.to_u16());
            write_response(&mut stream, CommandKind::DeclarePublisher, &w.into_vec()).await;
        }

        stream
    });

    let client = Client::new(ClientBuilder::new().host(host).port(port).build());
    client.connect().await.unwrap();

    let first = client.declare_publisher("s1", "ref1").await.unwrap();
    let second = client.declare_publisher("s1", "ref2").await.unwrap();
    assert_eq!(first, 1);
    assert_eq!(second, 2);

    server.await.unwrap();
}

#[tokio::test]
async fn socket_drop_fails_pending_calls() {
    let (listener, host, port) = bind_mock().await;
    let server = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        handshake_to_open(&mut stream, 1_048_576, 60).await;

        let _first = read_frame(&mut stream).await;
        let _second = read_frame(&mut stream).await;
        drop(stream);
    });

    let client = Client::new(ClientBuilder::new().host(host).port(port).build());
    client.connect().await.unwrap();

    let handle_a = client.handle();
    let handle_b = client.handle();
    let (a, b) = tokio::join!(
        handle_a.query_offset("s1", "ref1"),
        handle_b.query_offset("s1", "ref2"),
    );
    assert_eq!(a.unwrap_err(), Error::TcpClosed);
    assert_eq!(b.unwrap_err(), Error::TcpClosed);

    server.await.unwrap();
}

#[tokio::test]
async fn server_initiated_close_is_echoed_and_torn_down() {
    let (listener, host, port) = bind_mock().await;
    let server = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        handshake_to_open(&mut stream, 1_048_576, 60).await;

        let mut w = Writer::new();
        w.write_u32(9);
        w.write_u16(ResponseCode::Ok.to_u16());
        w.write_string(Some("bye"));
        write_request(&mut stream, CommandKind::Close, &w.into_vec()).await;

        let echoed = read_frame(&mut stream).await;
        assert_eq!(corr_of(&echoed), 9);
        stream
    });

    let client = Client::new(ClientBuilder::new().host(host).port(port).build());
    client.connect().await.unwrap();

    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    let err = client.query_offset("s1", "ref1").await.expect_err("connection should be closed");
    assert_eq!(err, Error::Closed);

    server.await.unwrap();
}
