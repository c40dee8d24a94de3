//! End-to-end tests: real sockets, both worker models, and the client.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::thread;

use bytes::BytesMut;

use wharf_ws::frame::{encode_frame, FrameHeader, OpCode};
use wharf_ws::handshake;
use wharf_ws::{
    ClientConfig, Client, Config, Conn, Error, Handler, HandshakeRequest, Message, MessageKind,
    Result, Server, WorkerMode,
};

struct Echo;

impl Handler for Echo {
    type Ctx = ();

    fn init(_req: &HandshakeRequest, _conn: &Conn, _ctx: &()) -> Result<Self> {
        Ok(Echo)
    }

    fn handle_message(&mut self, conn: &Conn, msg: Message<'_>) -> Result<()> {
        match msg.kind {
            MessageKind::Text => conn.write_text(msg.data),
            MessageKind::Binary => conn.write_bin(msg.data),
            _ => Ok(()),
        }
    }
}

struct Reject;

impl Handler for Reject {
    type Ctx = ();

    fn init(_req: &HandshakeRequest, _conn: &Conn, _ctx: &()) -> Result<Self> {
        Err(Error::HandshakeFailed("not welcome"))
    }

    fn handle_message(&mut self, _conn: &Conn, _msg: Message<'_>) -> Result<()> {
        Ok(())
    }

    fn handshake_error_response(_err: &Error) -> Option<Vec<u8>> {
        Some(b"HTTP/1.1 403 Forbidden\r\nContent-Length: 0\r\n\r\n".to_vec())
    }
}

struct Running {
    port: u16,
    handle: wharf_ws::server::ShutdownHandle,
    thread: thread::JoinHandle<Result<()>>,
}

fn start<H: Handler<Ctx = ()>>(config: Config) -> Running {
    let server = Server::<H>::bind(config, ()).unwrap();
    let port = server.local_addr().unwrap().port();
    let handle = server.shutdown_handle();
    let thread = thread::spawn(move || server.run());
    Running {
        port,
        handle,
        thread,
    }
}

fn stop(running: Running) {
    running.handle.shutdown();
    running.thread.join().unwrap().unwrap();
}

fn client_config() -> ClientConfig {
    let mut config = ClientConfig::new();
    config.handle_pong = true;
    config
}

fn echo_roundtrip(port: u16) {
    let mut client = Client::connect("127.0.0.1", port, "/echo", client_config()).unwrap();

    client.write_text(b"hello over the wire").unwrap();
    let msg = client.read_message().unwrap();
    assert_eq!(msg.kind, MessageKind::Text);
    assert_eq!(msg.as_text(), Some("hello over the wire"));

    client.write_bin(&[0u8, 1, 2, 255]).unwrap();
    let msg = client.read_message().unwrap();
    assert_eq!(msg.kind, MessageKind::Binary);
    assert_eq!(msg.data, vec![0u8, 1, 2, 255]);

    // Default server handler echoes pings as pongs.
    client.write_ping(b"tick").unwrap();
    let msg = client.read_message().unwrap();
    assert_eq!(msg.kind, MessageKind::Pong);
    assert_eq!(msg.data, b"tick");

    // Close handshake: server answers our close and tears down.
    client.close().unwrap();
    assert!(matches!(client.read_message(), Err(Error::Closed)));
}

#[test]
fn blocking_worker_echo() {
    let running = start::<Echo>(
        Config::builder()
            .port(0)
            .worker_mode(WorkerMode::Blocking)
            .build(),
    );
    echo_roundtrip(running.port);
    stop(running);
}

#[test]
fn nonblocking_worker_echo() {
    let running = start::<Echo>(
        Config::builder()
            .port(0)
            .worker_mode(WorkerMode::NonBlocking)
            .build(),
    );
    echo_roundtrip(running.port);
    stop(running);
}

#[test]
fn nonblocking_worker_many_sequential_connections() {
    let running = start::<Echo>(
        Config::builder()
            .port(0)
            .worker_mode(WorkerMode::NonBlocking)
            .thread_pool_count(2)
            .build(),
    );

    for i in 0..20 {
        let mut client =
            Client::connect("127.0.0.1", running.port, "/seq", client_config()).unwrap();
        let body = format!("message {}", i);
        client.write_text(body.as_bytes()).unwrap();
        let msg = client.read_message().unwrap();
        assert_eq!(msg.as_text(), Some(body.as_str()));
        client.close().ok();
    }

    stop(running);
}

#[test]
fn large_message_spills_and_echoes() {
    for mode in [WorkerMode::Blocking, WorkerMode::NonBlocking] {
        let running = start::<Echo>(
            Config::builder()
                .port(0)
                .worker_mode(mode)
                .max_message_size(1 << 20)
                .build(),
        );

        let mut config = client_config();
        config.max_size = 1 << 20;
        let mut client = Client::connect("127.0.0.1", running.port, "/big", config).unwrap();

        let payload: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
        client.write_bin(&payload).unwrap();
        let msg = client.read_message().unwrap();
        assert_eq!(msg.kind, MessageKind::Binary);
        assert_eq!(msg.data, payload);

        stop(running);
    }
}

/// Raw-socket handshake; returns the stream with the response consumed.
fn raw_upgrade(port: u16) -> TcpStream {
    let mut stream = TcpStream::connect(("127.0.0.1", port)).unwrap();
    let key = handshake::generate_key();
    stream
        .write_all(&handshake::build_request("127.0.0.1", "/raw", &key, &[]))
        .unwrap();

    let mut buf = Vec::new();
    let mut chunk = [0u8; 512];
    while !buf.windows(4).any(|w| w == b"\r\n\r\n") {
        let n = stream.read(&mut chunk).unwrap();
        assert!(n > 0, "server closed during handshake");
        buf.extend_from_slice(&chunk[..n]);
    }
    let text = String::from_utf8_lossy(&buf);
    assert!(text.starts_with("HTTP/1.1 101"), "unexpected reply: {}", text);
    stream
}

fn masked_frame(opcode: OpCode, payload: &[u8], fin: bool) -> Vec<u8> {
    let mut buf = BytesMut::new();
    encode_frame(&mut buf, opcode, payload, fin, Some([0x5A, 0x5B, 0x5C, 0x5D]));
    buf.to_vec()
}

/// Read one unmasked server frame off a raw socket.
fn read_server_frame(stream: &mut TcpStream) -> (OpCode, Vec<u8>) {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 512];
    loop {
        if let Some((header, consumed)) = FrameHeader::parse(&buf, false).unwrap() {
            let total = consumed + header.payload_len as usize;
            if buf.len() >= total {
                return (header.opcode, buf[consumed..total].to_vec());
            }
        }
        let n = stream.read(&mut chunk).unwrap();
        assert!(n > 0, "server closed mid-frame");
        buf.extend_from_slice(&chunk[..n]);
    }
}

#[test]
fn fragmented_message_with_interleaved_ping() {
    for mode in [WorkerMode::Blocking, WorkerMode::NonBlocking] {
        let running = start::<Echo>(Config::builder().port(0).worker_mode(mode).build());
        let mut stream = raw_upgrade(running.port);

        // Text split across three fragments with a ping in the middle; the
        // multi-byte é straddles the first fragment boundary.
        let text = "héllo fragmented".as_bytes();
        let mut wire = masked_frame(OpCode::Text, &text[..3], false);
        wire.extend(masked_frame(OpCode::Ping, b"mid", true));
        wire.extend(masked_frame(OpCode::Continuation, &text[3..8], false));
        wire.extend(masked_frame(OpCode::Continuation, &text[8..], true));
        stream.write_all(&wire).unwrap();

        let (opcode, payload) = read_server_frame(&mut stream);
        assert_eq!(opcode, OpCode::Pong);
        assert_eq!(payload, b"mid");

        let (opcode, payload) = read_server_frame(&mut stream);
        assert_eq!(opcode, OpCode::Text);
        assert_eq!(payload, text);

        stop(running);
    }
}

#[test]
fn oversized_control_frame_answered_with_1002() {
    let running = start::<Echo>(Config::builder().port(0).build());
    let mut stream = raw_upgrade(running.port);

    stream
        .write_all(&masked_frame(OpCode::Ping, &[0u8; 127], true))
        .unwrap();

    let (opcode, payload) = read_server_frame(&mut stream);
    assert_eq!(opcode, OpCode::Close);
    assert_eq!(payload, vec![0x03, 0xEA]);

    stop(running);
}

#[test]
fn close_code_1004_answered_with_1002() {
    let running = start::<Echo>(Config::builder().port(0).build());
    let mut stream = raw_upgrade(running.port);

    stream
        .write_all(&masked_frame(OpCode::Close, &[0x03, 0xEC], true))
        .unwrap();

    let (opcode, payload) = read_server_frame(&mut stream);
    assert_eq!(opcode, OpCode::Close);
    assert_eq!(payload, vec![0x03, 0xEA]);

    stop(running);
}

#[test]
fn close_code_1000_answered_with_1000() {
    let running = start::<Echo>(Config::builder().port(0).build());
    let mut stream = raw_upgrade(running.port);

    stream
        .write_all(&masked_frame(OpCode::Close, &[0x03, 0xE8], true))
        .unwrap();

    let (opcode, payload) = read_server_frame(&mut stream);
    assert_eq!(opcode, OpCode::Close);
    assert_eq!(payload, vec![0x03, 0xE8]);

    // The server shuts the connection down after the close exchange.
    let mut rest = Vec::new();
    stream.read_to_end(&mut rest).unwrap();
    assert!(rest.is_empty());

    stop(running);
}

#[test]
fn malformed_handshake_gets_400() {
    let running = start::<Echo>(Config::builder().port(0).build());

    let mut stream = TcpStream::connect(("127.0.0.1", running.port)).unwrap();
    stream
        .write_all(b"GET / HTTP/1.1\r\nHost: h\r\nUpgrade: h2c\r\nConnection: Upgrade\r\n\
            Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\nSec-WebSocket-Version: 13\r\n\r\n")
        .unwrap();

    let mut response = Vec::new();
    stream.read_to_end(&mut response).unwrap();
    let text = String::from_utf8_lossy(&response);
    assert!(text.starts_with("HTTP/1.1 400 Bad Request"), "{}", text);
    assert!(text.contains("Upgrade"));

    stop(running);
}

#[test]
fn rejected_upgrade_uses_custom_response() {
    let running = start::<Reject>(Config::builder().port(0).build());

    let mut stream = TcpStream::connect(("127.0.0.1", running.port)).unwrap();
    let key = handshake::generate_key();
    stream
        .write_all(&handshake::build_request("127.0.0.1", "/", &key, &[]))
        .unwrap();

    let mut response = Vec::new();
    stream.read_to_end(&mut response).unwrap();
    let text = String::from_utf8_lossy(&response);
    assert!(text.starts_with("HTTP/1.1 403 Forbidden"), "{}", text);

    stop(running);
}

#[test]
fn shutdown_notifies_connected_clients() {
    for mode in [WorkerMode::Blocking, WorkerMode::NonBlocking] {
        let running = start::<Echo>(Config::builder().port(0).worker_mode(mode).build());

        let mut client =
            Client::connect("127.0.0.1", running.port, "/", client_config()).unwrap();
        client.write_text(b"warmup").unwrap();
        assert_eq!(client.read_message().unwrap().data, b"warmup");

        running.handle.shutdown();

        // The drain sends close 1001; the client answers and reports closed.
        assert!(matches!(client.read_message(), Err(Error::Closed)));
        running.thread.join().unwrap().unwrap();
    }
}

#[test]
fn unix_socket_endpoint() {
    use std::os::unix::net::UnixStream;

    let path = std::env::temp_dir().join(format!("wharf-ws-test-{}.sock", std::process::id()));
    let config = Config::builder()
        .unix_path(&path)
        .worker_mode(WorkerMode::Blocking)
        .build();

    let server = Server::<Echo>::bind(config, ()).unwrap();
    let handle = server.shutdown_handle();
    let thread = thread::spawn(move || server.run());

    let stream = UnixStream::connect(&path).unwrap();
    let mut client =
        Client::handshake_over(stream, "localhost", "/unix", &[], client_config()).unwrap();
    client.write_text(b"over unix").unwrap();
    assert_eq!(client.read_message().unwrap().data, b"over unix");
    client.close().ok();

    handle.shutdown();
    thread.join().unwrap().unwrap();
    assert!(!path.exists());
}
