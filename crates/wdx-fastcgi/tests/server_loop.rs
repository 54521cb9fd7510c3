//! Server loop behavior: dispatch of accepted connections and the
//! guaranteed minimum wait on idle polls.

use std::io::Write;
use std::os::unix::net::{UnixListener, UnixStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use wdx_core::SystemClock;
use wdx_fastcgi::{HttpResponse, Request, RequestHandler, Server, ServerError, SocketOptions};

struct CountingHandler {
    handled: AtomicUsize,
}

impl RequestHandler for CountingHandler {
    fn handle(&self, mut request: Request) {
        self.handled.fetch_add(1, Ordering::SeqCst);
        let response = HttpResponse::json(200, r#"{"status":"ok"}"#);
        request.respond(&response).unwrap();
        request.finish().unwrap();
    }
}

fn encode_pair(name: &str, value: &str) -> Vec<u8> {
    let mut out = vec![name.len() as u8, value.len() as u8];
    out.extend_from_slice(name.as_bytes());
    out.extend_from_slice(value.as_bytes());
    out
}

fn minimal_request_wire() -> Vec<u8> {
    let mut wire = Vec::new();
    // begin request, responder role
    wire.extend_from_slice(&[1, 1, 0, 1, 0, 8, 0, 0]);
    wire.extend_from_slice(&[0, 1, 0, 0, 0, 0, 0, 0]);
    // params
    let mut params = Vec::new();
    params.extend_from_slice(&encode_pair("REQUEST_METHOD", "GET"));
    params.extend_from_slice(&encode_pair("REQUEST_URI", "/health"));
    params.extend_from_slice(&encode_pair("REMOTE_ADDR", "127.0.0.1"));
    params.extend_from_slice(&encode_pair("REMOTE_PORT", "4711"));
    let length = (params.len() as u16).to_be_bytes();
    wire.extend_from_slice(&[1, 4, 0, 1, length[0], length[1], 0, 0]);
    wire.extend_from_slice(&params);
    wire.extend_from_slice(&[1, 4, 0, 1, 0, 0, 0, 0]);
    // empty stdin
    wire.extend_from_slice(&[1, 5, 0, 1, 0, 0, 0, 0]);
    wire
}

#[test]
fn receive_next_dispatches_an_incoming_request() {
    let dir = tempfile::tempdir().unwrap();
    let socket_path = dir.path().join("paramd.sock");
    let listener = UnixListener::bind(&socket_path).unwrap();
    let server = Server::from_listener(listener, Arc::new(SystemClock));
    let handler = CountingHandler {
        handled: AtomicUsize::new(0),
    };

    let client_path = socket_path.clone();
    let client = thread::spawn(move || {
        let mut stream = UnixStream::connect(&client_path).unwrap();
        stream.write_all(&minimal_request_wire()).unwrap();
        stream
    });

    let handled = server.receive_next(&handler, 2000);
    assert!(handled);
    assert_eq!(handler.handled.load(Ordering::SeqCst), 1);
    drop(client.join().unwrap());
}

#[test]
fn open_creates_a_socket_node_with_the_configured_mode() {
    use std::os::unix::fs::PermissionsExt;

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("api.sock");
    let options = SocketOptions {
        mode: 0o600,
        owner: None,
        backlog: 8,
    };
    let server = Server::open(path.to_str().unwrap(), &options, Arc::new(SystemClock)).unwrap();
    let mode = std::fs::metadata(&path).unwrap().permissions().mode() & 0o777;
    assert_eq!(mode, 0o600);
    drop(server);
}

#[test]
fn unknown_inherited_socket_name_is_rejected() {
    let error = Server::open(
        "no-such-inherited-socket",
        &SocketOptions::default(),
        Arc::new(SystemClock),
    )
    .unwrap_err();
    assert!(matches!(error, ServerError::UnknownSocketName(_)));
}

#[test]
fn receive_next_consumes_the_timeout_when_idle() {
    let dir = tempfile::tempdir().unwrap();
    let listener = UnixListener::bind(dir.path().join("idle.sock")).unwrap();
    let server = Server::from_listener(listener, Arc::new(SystemClock));
    let handler = CountingHandler {
        handled: AtomicUsize::new(0),
    };

    let started = Instant::now();
    let handled = server.receive_next(&handler, 100);
    assert!(!handled);
    assert!(started.elapsed() >= Duration::from_millis(100));
    assert_eq!(handler.handled.load(Ordering::SeqCst), 0);
}
