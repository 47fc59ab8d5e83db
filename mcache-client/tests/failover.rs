use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use bytes::BytesMut;
use mcache_client::{
    Client, ClientConfig, ClientError, ConnState, GetFields, LogSink, StoreParams, Timeouts,
};
use mcache_common::{decode_request, encode_response, Decode, Request, Response, Status};
use mcache_mock::{MockOptions, MockServer};
use tracing::Level;

const TIMEOUT: Option<Duration> = Some(Duration::from_secs(2));

/// Address of a loopback port nobody listens on.
fn closed_port() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
    let addr = listener.local_addr().expect("addr").to_string();
    drop(listener);
    addr
}

/// Accepts one connection and hands every decoded request to `handler`.
fn spawn_server(
    expected_requests: usize,
    handler: fn(usize, Request, &mut TcpStream),
) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
    let addr = listener.local_addr().expect("addr").to_string();

    thread::spawn(move || {
        let (mut stream, _) = listener.accept().expect("accept");
        let _ = stream.set_read_timeout(Some(Duration::from_secs(2)));
        let mut buffer = Vec::new();
        for idx in 0..expected_requests {
            let request = read_request(&mut stream, &mut buffer).expect("read request");
            handler(idx, request, &mut stream);
        }
        // Keep the socket open until the client is done with it.
        let mut sink = [0u8; 64];
        let _ = stream.read(&mut sink);
    });

    addr
}

fn read_request(stream: &mut TcpStream, buffer: &mut Vec<u8>) -> std::io::Result<Request> {
    let mut chunk = [0u8; 1024];
    loop {
        match decode_request(buffer) {
            Ok(Decode::Complete { frame, consumed }) => {
                buffer.drain(..consumed);
                return Ok(frame);
            }
            Ok(Decode::NeedMoreData) => {}
            Err(err) => {
                return Err(std::io::Error::new(std::io::ErrorKind::InvalidData, err));
            }
        }
        let n = stream.read(&mut chunk)?;
        if n == 0 {
            return Err(std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "eof"));
        }
        buffer.extend_from_slice(&chunk[..n]);
    }
}

fn write_response(stream: &mut TcpStream, response: &Response) {
    let mut out = BytesMut::new();
    encode_response(response, &mut out);
    let _ = stream.write_all(&out);
}

fn fast_retry_config(servers: String) -> ClientConfig {
    ClientConfig {
        servers: vec![servers],
        connect_timeout_ms: 500,
        reconnect_timeout_ms: 300,
        dead_timeout_ms: 50,
        io_timeout_ms: 1000,
        buffering: false,
    }
}

#[derive(Default)]
struct CaptureSink {
    events: Mutex<Vec<(Level, String)>>,
}

impl LogSink for CaptureSink {
    fn log(&self, level: Level, message: std::fmt::Arguments<'_>) {
        self.events.lock().unwrap().push((level, message.to_string()));
    }
}

#[test]
fn test_refused_connect_marks_dead_and_short_circuits() {
    let sink = Arc::new(CaptureSink::default());
    let mut client = Client::with_config(fast_retry_config(closed_port()))
        .unwrap()
        .with_log_sink(sink.clone());

    let err = client.get(b"k", GetFields::VALUE, TIMEOUT).unwrap_err();
    assert!(matches!(err, ClientError::Connection { .. }), "{:?}", err);
    assert!(err.is_retryable());
    let status = &client.server_status()[0];
    assert_eq!(status.state, ConnState::Dead);
    assert_eq!(status.connect_attempts, 1);
    assert!(status.last_failure.is_some());

    // Within the dead timeout: no new socket.
    let err = client.get(b"k", GetFields::VALUE, TIMEOUT).unwrap_err();
    assert!(matches!(err, ClientError::Connection { .. }));
    assert_eq!(client.server_status()[0].connect_attempts, 1);

    // Dead timeout over, reconnect timeout not yet.
    thread::sleep(Duration::from_millis(100));
    assert!(client.noop(0, TIMEOUT).is_err());
    assert_eq!(client.server_status()[0].connect_attempts, 1);

    // Both elapsed: a new attempt is made.
    thread::sleep(Duration::from_millis(300));
    assert!(client.noop(0, TIMEOUT).is_err());
    assert_eq!(client.server_status()[0].connect_attempts, 2);

    let events = sink.events.lock().unwrap();
    assert!(events
        .iter()
        .any(|(level, message)| *level == Level::WARN && message.contains("marked dead")));
}

#[test]
fn test_connect_timeout_marks_dead() {
    // Fill the accept queue so further handshakes never complete.
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
    let addr = listener.local_addr().expect("addr");
    let mut held = Vec::new();
    for _ in 0..1024 {
        match TcpStream::connect_timeout(&addr, Duration::from_millis(50)) {
            Ok(stream) => held.push(stream),
            Err(_) => break,
        }
    }

    let mut client = Client::with_config(ClientConfig {
        servers: vec![addr.to_string()],
        connect_timeout_ms: 200,
        reconnect_timeout_ms: 60_000,
        dead_timeout_ms: 60_000,
        io_timeout_ms: 2000,
        buffering: false,
    })
    .unwrap();

    let err = client.noop(0, TIMEOUT).unwrap_err();
    match &err {
        ClientError::Connection { reason, .. } => {
            assert!(reason.contains("connect timed out"), "{}", reason)
        }
        other => panic!("expected connection error, got {:?}", other),
    }
    let status = &client.server_status()[0];
    assert_eq!(status.state, ConnState::Dead);
    assert_eq!(status.connect_attempts, 1);

    let err = client.noop(0, TIMEOUT).unwrap_err();
    assert!(matches!(err, ClientError::Connection { .. }), "{:?}", err);
    assert_eq!(client.server_status()[0].connect_attempts, 1);
    drop(held);
}

#[test]
fn test_dead_server_fails_buffered_commands_at_issue() {
    let mut client = Client::with_config(fast_retry_config(closed_port())).unwrap();
    assert!(client.noop(0, TIMEOUT).is_err());

    client.set_buffering(true);
    let err = client
        .set(b"k", b"v", StoreParams::default(), TIMEOUT)
        .unwrap_err();
    assert!(err.is_retryable());
    assert!(client.flush(TIMEOUT).unwrap().is_empty());
}

#[test]
fn test_response_timeout_keeps_connection() {
    let server = MockServer::start_with(MockOptions { stall: true }).unwrap();
    let mut client = Client::connect(server.address()).unwrap();

    let short = Some(Duration::from_millis(100));
    let err = client.get(b"k", GetFields::VALUE, short).unwrap_err();
    assert!(matches!(err, ClientError::Timeout));
    assert!(err.is_retryable());

    let status = &client.server_status()[0];
    assert_eq!(status.state, ConnState::Connected);
    assert_eq!(status.pending, 0);
    assert!(status.last_failure.is_none());

    client.set_buffering(true);
    let _ = client.noop(0, None).unwrap();
    let completions = client.flush(short).unwrap();
    assert_eq!(completions.len(), 1);
    assert!(matches!(completions[0].result, Err(ClientError::Timeout)));
}

#[test]
fn test_silent_server_is_marked_dead_after_repeated_timeouts() {
    let server = MockServer::start_with(MockOptions { stall: true }).unwrap();
    let mut client = Client::connect(server.address()).unwrap();
    assert!(matches!(
        client.noop(0, Some(Duration::from_millis(500))),
        Err(ClientError::Timeout)
    ));

    let short = Some(Duration::from_millis(10));
    let mut timeouts = 1;
    while client.server_status()[0].state == ConnState::Connected && timeouts < 200 {
        let err = client.noop(0, short).unwrap_err();
        assert!(matches!(err, ClientError::Timeout), "{:?}", err);
        timeouts += 1;
    }
    assert_eq!(client.server_status()[0].state, ConnState::Dead);
    assert!(timeouts > 1, "shed after {} timeouts", timeouts);

    let err = client.noop(0, short).unwrap_err();
    assert!(matches!(err, ClientError::Connection { .. }), "{:?}", err);
}

#[test]
fn test_late_reply_is_drained_after_timeout() {
    let addr = spawn_server(2, |idx, request, stream| {
        if idx == 0 {
            // Answer the first request only after the client gave up on it.
            thread::sleep(Duration::from_millis(300));
            let late = Response::new(request.opcode, Status::NoError, request.opaque)
                .with_flags(0)
                .with_value(b"first");
            write_response(stream, &late);
        } else {
            let reply = Response::new(request.opcode, Status::NoError, request.opaque)
                .with_flags(0)
                .with_value(b"second");
            write_response(stream, &reply);
        }
    });
    let mut client = Client::connect(addr).unwrap();

    let err = client
        .get(b"one", GetFields::VALUE, Some(Duration::from_millis(100)))
        .unwrap_err();
    assert!(matches!(err, ClientError::Timeout));

    let item = client.get(b"two", GetFields::VALUE, TIMEOUT).unwrap().ready().unwrap();
    assert_eq!(item.value, b"second");
    assert_eq!(client.server_status()[0].state, ConnState::Connected);
}

#[test]
fn test_garbage_reply_is_protocol_error() {
    let addr = spawn_server(1, |_, _, stream| {
        let _ = stream.write_all(&[0u8; 24]);
    });
    let mut client = Client::connect(addr).unwrap();

    let err = client.get(b"k", GetFields::VALUE, TIMEOUT).unwrap_err();
    assert!(matches!(err, ClientError::Protocol(_)), "{:?}", err);
    assert_eq!(client.server_status()[0].state, ConnState::Dead);
}

#[test]
fn test_mismatched_opaque_is_protocol_error() {
    let addr = spawn_server(1, |_, request, stream| {
        let reply = Response::new(request.opcode, Status::NoError, request.opaque.wrapping_add(7));
        write_response(stream, &reply);
    });
    let mut client = Client::connect(addr).unwrap();

    let err = client.delete(b"k", TIMEOUT).unwrap_err();
    assert!(matches!(err, ClientError::Protocol(_)), "{:?}", err);
    assert_eq!(client.server_status()[0].state, ConnState::Dead);
}

#[test]
fn test_server_going_away_marks_dead() {
    let server = MockServer::start().unwrap();
    let mut client = Client::connect(server.address()).unwrap();
    assert_eq!(client.noop(0, TIMEOUT).unwrap().ready(), Some(()));

    server.shutdown();
    thread::sleep(Duration::from_millis(50));

    let err = client.noop(0, TIMEOUT).unwrap_err();
    assert!(matches!(err, ClientError::Connection { .. }), "{:?}", err);
    assert_eq!(client.server_status()[0].state, ConnState::Dead);
}

#[test]
fn test_timeouts_are_read_per_call() {
    let mut client = Client::with_config(fast_retry_config(closed_port())).unwrap();
    let timeouts = Timeouts {
        dead: Duration::from_secs(60),
        reconnect: Duration::from_secs(60),
        ..client.timeouts()
    };
    client.set_timeouts(timeouts).unwrap();
    assert!(client.noop(0, TIMEOUT).is_err());

    thread::sleep(Duration::from_millis(400));
    assert!(client.noop(0, TIMEOUT).is_err());
    assert_eq!(client.server_status()[0].connect_attempts, 1);
}
