//! Client/Server Connector Integration Tests
//!
//! # Running with tracing
//!
//! Use TEST_LOG environment variable to control tracing verbosity (like -v, -vv, -vvv):
//!
//! ```bash
//! # Info level (equivalent to -v)
//! TEST_LOG=1 cargo test https_round_trip -- --nocapture
//!
//! # Debug level (equivalent to -vv)
//! TEST_LOG=2 cargo test https_round_trip -- --nocapture
//!
//! # Trace level (equivalent to -vvv)
//! TEST_LOG=3 cargo test https_round_trip -- --nocapture
//! ```

mod tls_test_helper;

use netway::prelude::*;
use std::io::{Read, Write};
use std::net::SocketAddr;
use std::sync::mpsc::channel;
use std::sync::{Arc, Once};
use std::thread;
use std::time::Duration;
use tls_test_helper::generate_test_tls_config;

static INIT: Once = Once::new();

// ============================================================================
// Tracing Initialization
// ============================================================================

/// Initialize tracing based on TEST_LOG environment variable
///
/// Verbosity levels (like -v, -vv, -vvv):
/// - TEST_LOG=1: Info level
/// - TEST_LOG=2: Debug level
/// - TEST_LOG=3: Trace level
///
/// Example: TEST_LOG=2 cargo test https_round_trip -- --nocapture
fn init_tracing() {
    INIT.call_once(|| {
        if let Ok(level_str) = std::env::var("TEST_LOG") {
            let verbosity = level_str.parse::<u8>().unwrap_or(0);

            if verbosity > 0 {
                let level = match verbosity {
                    1 => "info",
                    2 => "debug",
                    _ => "trace", // 3 or more
                };

                let filter = format!("netway={}", level);
                let _ = tracing_subscriber::fmt()
                    .with_env_filter(tracing_subscriber::EnvFilter::new(filter))
                    .with_target(true)
                    .with_writer(std::io::stderr)
                    .with_test_writer()
                    .try_init();
            }
        }
    });
}

// ============================================================================
// Helper Functions
// ============================================================================

fn build_config() -> config::Config {
    config::Config::builder()
        .set_default("controller_daemon", false)
        .unwrap()
        .set_default("initial_connections", 2i64)
        .unwrap()
        .build()
        .unwrap()
}

/// Echoes the request body back, with the request path and TLS protocol
/// (when present) in response headers.
fn echo(request: Request) -> Response {
    let mut response = Response::ok(request.body).with_header("X-Echo-Path", request.path);
    if let Some(tls) = &request.tls {
        if let Some(version) = tls.protocol_version {
            response = response.with_header("X-TLS-Protocol", format!("{version:?}"));
        }
    }
    response
}

fn ephemeral() -> SocketAddr {
    "127.0.0.1:0".parse().unwrap()
}

fn request_to(addr: SocketAddr, path: &str) -> Request {
    Request::get(Scheme::Http, addr.ip().to_string(), path).with_port(addr.port())
}

fn assert_ok(response: &Response) {
    assert_eq!(
        response.status.code, 200,
        "unexpected status: {}",
        response.status
    );
}

// ============================================================================
// Plain HTTP
// ============================================================================

#[test]
fn http_round_trip() {
    init_tracing();
    let config = build_config();

    let server = Server::new(&config, echo).expect("Failed to create server");
    let local = server.listen(ephemeral()).expect("Failed to listen");
    let client = Client::new(&config).expect("Failed to create client");

    let response = client.handle(request_to(local, "/hello"));
    assert_ok(&response);
    assert_eq!(response.header("X-Echo-Path"), Some("/hello"));
    assert!(response.tls.is_none());

    client.stop(true);
    server.stop(true);
}

#[test]
fn sequential_requests_reuse_the_connector() {
    init_tracing();
    let config = build_config();

    let server = Server::new(&config, echo).expect("Failed to create server");
    let local = server.listen(ephemeral()).expect("Failed to listen");
    let client = Client::new(&config).expect("Failed to create client");

    for i in 0..5 {
        let path = format!("/seq/{i}");
        let response = client.handle(request_to(local, &path));
        assert_ok(&response);
        assert_eq!(response.header("X-Echo-Path"), Some(path.as_str()));
    }

    client.stop(true);
    server.stop(true);
}

#[test]
fn post_body_round_trip() {
    init_tracing();
    let config = build_config();

    let server = Server::new(&config, echo).expect("Failed to create server");
    let local = server.listen(ephemeral()).expect("Failed to listen");
    let client = Client::new(&config).expect("Failed to create client");

    // Larger than the way and socket buffers, so the body is moved in
    // several partial writes and reads.
    let body: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
    let request = Request::new("POST", Scheme::Http, local.ip().to_string(), "/upload")
        .with_port(local.port())
        .with_body(body.clone());

    let response = client.handle(request);
    assert_ok(&response);
    assert_eq!(response.body, body);

    client.stop(true);
    server.stop(true);
}

#[test]
fn concurrent_clients_share_one_server() {
    init_tracing();
    let config = build_config();

    let server = Server::new(&config, echo).expect("Failed to create server");
    let local = server.listen(ephemeral()).expect("Failed to listen");
    let client = Arc::new(Client::new(&config).expect("Failed to create client"));

    let mut joins = Vec::new();
    for t in 0..4 {
        let client = Arc::clone(&client);
        joins.push(thread::spawn(move || {
            for i in 0..4 {
                let path = format!("/t{t}/r{i}");
                let response = client.handle(request_to(local, &path));
                assert_ok(&response);
                assert_eq!(response.header("X-Echo-Path"), Some(path.as_str()));
            }
        }));
    }
    for join in joins {
        join.join().expect("worker thread panicked");
    }

    Arc::try_unwrap(client)
        .unwrap_or_else(|_| panic!("client still shared"))
        .stop(true);
    server.stop(true);
}

#[test]
fn callback_delivery_fires_exactly_once() {
    init_tracing();
    let config = build_config();

    let server = Server::new(&config, echo).expect("Failed to create server");
    let local = server.listen(ephemeral()).expect("Failed to listen");
    let client = Client::new(&config).expect("Failed to create client");

    let (tx, rx) = channel();
    client.handle_with(request_to(local, "/async"), move |response| {
        tx.send(response).unwrap();
    });
    let response = rx
        .recv_timeout(Duration::from_secs(10))
        .expect("callback never fired");
    assert_ok(&response);
    assert_eq!(response.header("X-Echo-Path"), Some("/async"));

    client.stop(true);
    server.stop(true);
}

// ============================================================================
// HTTPS
// ============================================================================

#[test]
fn https_round_trip() {
    init_tracing();
    let (config, _guard) = generate_test_tls_config();

    let server = Server::new(&config, echo).expect("Failed to create server");
    let local = server.listen(ephemeral()).expect("Failed to listen");
    let client = Client::new(&config).expect("Failed to create client");

    let request = Request::get(Scheme::Https, local.ip().to_string(), "/secure")
        .with_port(local.port());
    let response = client.handle(request);
    assert_ok(&response);
    assert_eq!(response.header("X-Echo-Path"), Some("/secure"));
    // The server saw the request over TLS and the client kept the session
    // properties of the connection the response arrived on.
    assert!(response.header("X-TLS-Protocol").is_some());
    assert!(response.tls.is_some());

    client.stop(true);
    server.stop(true);
}

#[test]
fn https_large_body_round_trip() {
    init_tracing();
    let (config, _guard) = generate_test_tls_config();

    let server = Server::new(&config, echo).expect("Failed to create server");
    let local = server.listen(ephemeral()).expect("Failed to listen");
    let client = Client::new(&config).expect("Failed to create client");

    // Spans many TLS records and forces the wrap loop to flush the
    // ciphertext channel repeatedly.
    let body: Vec<u8> = (0..300_000u32).map(|i| (i % 239) as u8).collect();
    let request = Request::new("POST", Scheme::Https, local.ip().to_string(), "/bulk")
        .with_port(local.port())
        .with_body(body.clone());

    let response = client.handle(request);
    assert_ok(&response);
    assert_eq!(response.body, body);

    client.stop(true);
    server.stop(true);
}

#[test]
fn https_sequential_requests_reuse_the_session() {
    init_tracing();
    let (config, _guard) = generate_test_tls_config();

    let server = Server::new(&config, echo).expect("Failed to create server");
    let local = server.listen(ephemeral()).expect("Failed to listen");
    let client = Client::new(&config).expect("Failed to create client");

    for i in 0..3 {
        let path = format!("/secure/{i}");
        let request = Request::get(Scheme::Https, local.ip().to_string(), &path)
            .with_port(local.port());
        let response = client.handle(request);
        assert_ok(&response);
        assert_eq!(response.header("X-Echo-Path"), Some(path.as_str()));
    }

    client.stop(true);
    server.stop(true);
}

// ============================================================================
// Failure Paths
// ============================================================================

#[test]
fn refused_connect_resolves_with_a_connector_error() {
    init_tracing();
    // Grab an ephemeral port and release it so nobody listens there.
    let vacated = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap()
    };

    let client = Client::new(&build_config()).expect("Failed to create client");
    let response = client.handle(request_to(vacated, "/nobody"));
    assert!(
        response.status.is_connector_error(),
        "expected connector error, got {}",
        response.status
    );
    assert_eq!(response.status.code, 1000);

    client.stop(false);
}

#[test]
fn unresolvable_host_resolves_with_a_connector_error() {
    init_tracing();
    let client = Client::new(&build_config()).expect("Failed to create client");
    let response = client.handle(Request::get(Scheme::Http, "host.invalid", "/"));
    assert_eq!(response.status.code, 1000);
    client.stop(false);
}

#[test]
fn malformed_request_closes_the_connection() {
    init_tracing();
    let config = build_config();

    let server = Server::new(&config, echo).expect("Failed to create server");
    let local = server.listen(ephemeral()).expect("Failed to listen");

    let mut stream = std::net::TcpStream::connect(local).unwrap();
    stream
        .set_read_timeout(Some(Duration::from_secs(10)))
        .unwrap();
    stream.write_all(b"NONSENSE\r\n\r\n").unwrap();

    // The server closes the connection instead of answering.
    let mut leftovers = Vec::new();
    let result = stream.read_to_end(&mut leftovers);
    assert!(result.is_ok(), "expected EOF, got {result:?}");
    assert!(leftovers.is_empty());

    server.stop(false);
}

#[test]
fn requests_during_stop_resolve_instead_of_hanging() {
    init_tracing();
    let config = build_config();

    let server = Server::new(&config, echo).expect("Failed to create server");
    let local = server.listen(ephemeral()).expect("Failed to listen");
    let client = Client::new(&config).expect("Failed to create client");

    let response = client.handle(request_to(local, "/warmup"));
    assert_ok(&response);

    client.stop(true);

    // The controller thread has been joined; a fresh client still works
    // against the same server.
    let client = Client::new(&config).expect("Failed to create client");
    let response = client.handle(request_to(local, "/again"));
    assert_ok(&response);

    client.stop(true);
    server.stop(true);
}
