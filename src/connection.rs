//! A single client or server connection: the socket, its two ways, and
//! (for HTTPS) the TLS engine with its state machine and channels.
//!
//! Connections are owned and driven exclusively by the controller thread.
//! Readable and writable handlers return an [`IoOutcome`] describing what
//! the helper must do next (dispatch parsed requests, run delegated tasks,
//! clean up a closed connection); all sink resolution for the client side
//! happens in here so no completion path can be missed.

use std::io;
use std::net::SocketAddr;
use std::time::Instant;

use mio::net::TcpStream;
use mio::Interest;
use tracing::{debug, trace, warn};

use crate::buffer::Buffer;
use crate::error::Error;
use crate::message::{Exchange, Request, Response, Status};
use crate::state::{transition, ConnectionState, IoState};
use crate::tls::channel::{ReadableSslChannel, WritableSslChannel};
use crate::tls::engine::{DelegatedTask, TlsEngine};
use crate::tls::machine::{SslDirective, SslMachine};
use crate::tls::TlsInfo;
use crate::way::{InboundWay, OutboundMessage, OutboundWay};

/// Socket read chunk for plain connections.
const READ_CHUNK: usize = 16 * 1024;

/// Ciphertext staging capacity per SSL channel.
const SSL_CHANNEL_CAPACITY: usize = 18 * 1024;

/// TLS engine, state machine and ciphertext channels of one connection.
pub(crate) struct SslDuplex {
    pub(crate) engine: Box<dyn TlsEngine>,
    pub(crate) machine: SslMachine,
    readable: ReadableSslChannel,
    writable: WritableSslChannel,
}

impl SslDuplex {
    pub(crate) fn new(engine: Box<dyn TlsEngine>) -> Self {
        let mut machine = SslMachine::new();
        machine.engine_created();
        Self {
            engine,
            machine,
            readable: ReadableSslChannel::new(SSL_CHANNEL_CAPACITY),
            writable: WritableSslChannel::new(SSL_CHANNEL_CAPACITY),
        }
    }
}

/// What a readiness handler observed; the helper acts on it after the
/// borrow of the connection ends.
#[derive(Default)]
pub(crate) struct IoOutcome {
    /// The connection is done; deregister and recycle it.
    pub closed: bool,
    /// Status to report for the failure that closed the connection.
    pub failed: Option<Status>,
    pub handshake_finished: bool,
    /// Delegated TLS tasks are pending; ship them to the worker pool.
    pub need_tasks: bool,
    /// Server side: complete requests parsed from the inbound way.
    pub requests: Vec<Request>,
}

pub(crate) struct Connection {
    token: usize,
    stream: Option<TcpStream>,
    socket_address: Option<SocketAddr>,
    state: ConnectionState,
    tcp_established: bool,
    client_side: bool,
    inbound: InboundWay,
    outbound: OutboundWay,
    ssl: Option<SslDuplex>,
    pipelining: bool,
    persisting: bool,
    /// Interest currently registered with the poll, to skip no-op
    /// reregistrations.
    registered_interest: Option<Interest>,
    /// Client connect deadline; cleared once the transport establishes.
    connect_deadline: Option<Instant>,
    /// Graceful close: stop accepting work, close once drained.
    close_after_drain: bool,
    /// Both ways suspended while delegated TLS tasks run off-thread.
    tasks_pending: bool,
    /// Server: requests handed to handlers whose responses have not fully
    /// left the socket yet. Gates parsing of the next request.
    pending_server_responses: usize,
}

impl Connection {
    /// A pooled connection shell with no socket. Buffers are allocated
    /// once here and survive pool round trips.
    pub(crate) fn detached(
        inbound_capacity: usize,
        outbound_capacity: usize,
        client_side: bool,
    ) -> Self {
        Self {
            token: 0,
            stream: None,
            socket_address: None,
            state: ConnectionState::Closed,
            tcp_established: false,
            client_side,
            inbound: InboundWay::new(inbound_capacity),
            outbound: OutboundWay::new(outbound_capacity),
            ssl: None,
            pipelining: false,
            persisting: true,
            registered_interest: None,
            connect_deadline: None,
            close_after_drain: false,
            tasks_pending: false,
            pending_server_responses: 0,
        }
    }

    /// Attaches a connecting client socket. The transport is not yet
    /// established; the first writable event completes it.
    pub(crate) fn open_client(
        &mut self,
        token: usize,
        stream: TcpStream,
        address: SocketAddr,
        ssl: Option<SslDuplex>,
        pipelining: bool,
        persisting: bool,
        connect_deadline: Option<Instant>,
    ) {
        transition(&mut self.state, ConnectionState::Opening, "connection");
        self.token = token;
        self.stream = Some(stream);
        self.socket_address = Some(address);
        self.tcp_established = false;
        self.ssl = ssl;
        self.pipelining = pipelining;
        self.persisting = persisting;
        self.connect_deadline = connect_deadline;
        self.registered_interest = None;
        self.outbound.set_io_state(IoState::Interest);
    }

    /// Attaches an accepted server socket, which is established already.
    pub(crate) fn open_server(
        &mut self,
        token: usize,
        stream: TcpStream,
        address: SocketAddr,
        ssl: Option<SslDuplex>,
        pipelining: bool,
        persisting: bool,
    ) {
        transition(&mut self.state, ConnectionState::Opening, "connection");
        self.token = token;
        self.stream = Some(stream);
        self.socket_address = Some(address);
        self.ssl = ssl;
        self.pipelining = pipelining;
        self.persisting = persisting;
        self.registered_interest = None;
        self.establish();
        self.inbound.set_io_state(IoState::Interest);
    }

    pub(crate) fn token(&self) -> usize {
        self.token
    }

    pub(crate) fn state(&self) -> ConnectionState {
        self.state
    }

    pub(crate) fn connect_deadline(&self) -> Option<Instant> {
        self.connect_deadline
    }

    pub(crate) fn registered_interest(&self) -> Option<Interest> {
        self.registered_interest
    }

    pub(crate) fn set_registered_interest(&mut self, interest: Option<Interest>) {
        self.registered_interest = interest;
    }

    pub(crate) fn stream_mut(&mut self) -> &mut TcpStream {
        self.stream.as_mut().expect("connection has no socket")
    }

    /// Exchanges this connection is responsible for.
    pub(crate) fn load(&self) -> usize {
        self.outbound.load() + self.inbound.in_flight_len() + self.pending_server_responses
    }

    /// Whether new exchanges may still be routed here.
    pub(crate) fn is_candidate(&self, address: SocketAddr) -> bool {
        matches!(
            self.state,
            ConnectionState::Opening | ConnectionState::Open
        ) && self.socket_address == Some(address)
            && !self.close_after_drain
    }

    /// Candidate that can take an exchange right now: established, past
    /// any TLS handshake, and idle or pipelining. An `Opening` connection
    /// stays a candidate for the busy-queue fallback but is never
    /// available.
    pub(crate) fn is_available(&self, address: SocketAddr) -> bool {
        self.is_candidate(address)
            && self.state == ConnectionState::Open
            && !self.is_handshaking()
            && (self.pipelining || self.load() == 0)
    }

    fn is_handshaking(&self) -> bool {
        self.ssl
            .as_ref()
            .map(|ssl| ssl.machine.is_handshaking())
            .unwrap_or(false)
    }

    pub(crate) fn enqueue_request(&mut self, exchange: Exchange) {
        debug_assert!(self.client_side);
        self.outbound.enqueue(OutboundMessage::Request(exchange));
    }

    pub(crate) fn enqueue_response(&mut self, response: Response) {
        debug_assert!(!self.client_side);
        self.outbound.enqueue(OutboundMessage::Response(response));
    }

    pub(crate) fn session_info(&self) -> Option<TlsInfo> {
        self.ssl.as_ref().and_then(|ssl| ssl.engine.session_info())
    }

    /// The poll interest this connection currently needs, or `None` when
    /// it must not be registered (closed, or suspended for tasks).
    pub(crate) fn interest(&self) -> Option<Interest> {
        if self.state == ConnectionState::Closed || self.stream.is_none() || self.tasks_pending {
            return None;
        }
        if !self.tcp_established {
            return Some(Interest::WRITABLE);
        }
        let mut interest = Interest::READABLE;
        let ssl_wants_write = self
            .ssl
            .as_ref()
            .map(|ssl| ssl.engine.wants_write() || ssl.writable.has_staged())
            .unwrap_or(false);
        if self.outbound.load() > 0 || ssl_wants_write {
            interest |= Interest::WRITABLE;
        }
        Some(interest)
    }

    /// Handles a readable readiness event.
    pub(crate) fn handle_readable(&mut self) -> IoOutcome {
        let mut outcome = IoOutcome::default();
        if !self.tcp_established || self.state == ConnectionState::Closed {
            trace!(token = self.token, "spurious readable event");
            return outcome;
        }
        // Both ways stay suspended while delegated tasks run off-thread.
        if self.tasks_pending {
            trace!(token = self.token, "readable while tasks pending");
            return outcome;
        }
        if self.inbound.io_state() != IoState::Ready {
            self.inbound.set_io_state(IoState::Ready);
        }
        self.inbound.set_io_state(IoState::Processing);

        let mut eof = false;
        if let Some(mut ssl) = self.ssl.take() {
            let stream = self.stream.as_mut().expect("connection has no socket");
            let mut plaintext = Vec::new();
            match ssl.readable.read(
                stream,
                ssl.engine.as_mut(),
                &mut ssl.machine,
                self.client_side,
                &mut plaintext,
            ) {
                Ok(read) => {
                    self.inbound.append(&plaintext);
                    eof = read.socket_eof;
                    self.apply_directive(read.directive, &mut outcome);
                }
                Err(e) => {
                    debug!(token = self.token, error = %e, "inbound TLS failure");
                    outcome.failed =
                        Some(Status::connector_error_communication(e.to_string()));
                    outcome.closed = true;
                }
            }
            self.ssl = Some(ssl);
        } else {
            let stream = self.stream.as_mut().expect("connection has no socket");
            loop {
                match self.inbound.buffer_mut().fill_from(stream, READ_CHUNK) {
                    Ok(0) => {
                        eof = true;
                        break;
                    }
                    Ok(_) => continue,
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => {
                        debug!(token = self.token, error = %e, "read failed");
                        outcome.failed =
                            Some(Status::connector_error_communication(e.to_string()));
                        outcome.closed = true;
                        break;
                    }
                }
            }
        }

        if eof {
            self.inbound.mark_eof();
            outcome.closed = true;
        }

        if outcome.failed.is_none() {
            self.process_inbound(&mut outcome);
        }

        if !outcome.closed {
            self.inbound.set_io_state(if self.tasks_pending {
                IoState::Idle
            } else {
                IoState::Interest
            });
        }
        self.finish_if_drained(&mut outcome);
        outcome
    }

    /// Handles a writable readiness event.
    pub(crate) fn handle_writable(&mut self) -> IoOutcome {
        let mut outcome = IoOutcome::default();
        if self.state == ConnectionState::Closed {
            trace!(token = self.token, "spurious writable event");
            return outcome;
        }
        if self.tasks_pending {
            trace!(token = self.token, "writable while tasks pending");
            return outcome;
        }

        if !self.tcp_established {
            match self.check_connect() {
                Ok(true) => {}
                Ok(false) => return outcome,
                Err(e) => {
                    debug!(token = self.token, error = %e, "connect failed");
                    outcome.failed = Some(Status::connector_error_connection(e.to_string()));
                    outcome.closed = true;
                    return outcome;
                }
            }
        }

        if self.outbound.io_state() == IoState::Interest
            || self.outbound.io_state() == IoState::Idle
        {
            self.outbound.set_io_state(IoState::Ready);
        }
        self.outbound.set_io_state(IoState::Processing);

        if let Err(e) = self.write_pending(&mut outcome) {
            debug!(token = self.token, error = %e, "write failed");
            outcome.failed = Some(Status::connector_error_communication(e.to_string()));
            outcome.closed = true;
        }

        if !outcome.closed {
            let next = if self.tasks_pending || self.outbound.load() == 0 {
                IoState::Idle
            } else {
                IoState::Interest
            };
            self.outbound.set_io_state(next);
        }
        self.finish_if_drained(&mut outcome);
        outcome
    }

    /// Collects the engine's delegated tasks after a `NeedTask` result.
    pub(crate) fn take_delegated_tasks(&mut self) -> Vec<DelegatedTask> {
        let mut tasks = Vec::new();
        if let Some(ssl) = self.ssl.as_mut() {
            while let Some(task) = ssl.engine.take_delegated_task() {
                tasks.push(task);
            }
        }
        tasks
    }

    /// Resumes I/O after the delegated task batch completed.
    pub(crate) fn resume_after_tasks(&mut self) {
        self.tasks_pending = false;
        self.inbound.set_io_state(IoState::Interest);
        let wants_write = self
            .ssl
            .as_ref()
            .map(|ssl| ssl.engine.wants_write())
            .unwrap_or(false);
        if self.outbound.load() > 0 || wants_write {
            self.outbound.set_io_state(IoState::Interest);
        }
    }

    /// Requests a graceful close: no new work, close once drained.
    pub(crate) fn close_gracefully(&mut self) {
        if self.state == ConnectionState::Open {
            transition(&mut self.state, ConnectionState::Closing, "connection");
        }
        self.close_after_drain = true;
    }

    pub(crate) fn is_drained(&self) -> bool {
        self.load() == 0
    }

    /// Forced close: every queued and in-flight exchange resolves with
    /// `status` so no caller is left hanging.
    pub(crate) fn force_close(&mut self, status: &Status) {
        self.outbound.fail_all(status);
        self.inbound.fail_in_flight(status);
        self.pending_server_responses = 0;
        self.release();
    }

    /// Drops the socket and marks the connection closed. Pending work
    /// must be resolved or empty by now.
    pub(crate) fn release(&mut self) {
        if let Some(ssl) = self.ssl.as_mut() {
            if !ssl.machine.is_closed() {
                ssl.engine.send_close_notify();
                if let Some(stream) = self.stream.as_mut() {
                    // Best-effort close_notify; the peer may already be gone.
                    let mut empty = Buffer::with_capacity(0);
                    let _ = ssl.writable.write(
                        stream,
                        ssl.engine.as_mut(),
                        &mut ssl.machine,
                        self.client_side,
                        &mut empty,
                    );
                }
                ssl.machine.close();
            }
        }
        transition(&mut self.state, ConnectionState::Closed, "connection");
        self.stream = None;
        self.tcp_established = false;
        self.connect_deadline = None;
        self.registered_interest = None;
    }

    #[cfg(test)]
    pub(crate) fn inbound_buffer_ptr(&mut self) -> *const u8 {
        self.inbound.buffer_mut().storage_ptr()
    }

    /// Resets the connection for the pool, keeping buffer allocations.
    pub(crate) fn clear(&mut self) {
        debug_assert_eq!(self.state, ConnectionState::Closed);
        self.stream = None;
        self.socket_address = None;
        self.ssl = None;
        self.tcp_established = false;
        self.connect_deadline = None;
        self.registered_interest = None;
        self.close_after_drain = false;
        self.tasks_pending = false;
        self.pending_server_responses = 0;
        self.token = 0;
        self.inbound.clear();
        self.outbound.clear();
    }

    fn establish(&mut self) {
        self.tcp_established = true;
        self.connect_deadline = None;
        transition(&mut self.state, ConnectionState::Open, "connection");
        if let Some(ssl) = self.ssl.as_mut() {
            ssl.machine.handshake_started();
        }
        debug!(
            token = self.token,
            address = ?self.socket_address,
            secure = self.ssl.is_some(),
            "connection established"
        );
    }

    /// Checks whether a connecting socket finished. `Ok(false)` means the
    /// connect is still in progress.
    fn check_connect(&mut self) -> Result<bool, Error> {
        let stream = self.stream.as_mut().expect("connection has no socket");
        if let Some(e) = stream.take_error()? {
            return Err(Error::ConnectFailed(e.to_string()));
        }
        match stream.peer_addr() {
            Ok(_) => {
                self.establish();
                Ok(true)
            }
            Err(e) if e.kind() == io::ErrorKind::NotConnected => Ok(false),
            Err(e) => Err(Error::ConnectFailed(e.to_string())),
        }
    }

    /// Serializes and writes queued outbound messages (or handshake
    /// records) until the socket stops accepting bytes.
    fn write_pending(&mut self, outcome: &mut IoOutcome) -> Result<(), Error> {
        loop {
            let can_start_next = if self.client_side {
                self.pipelining || self.inbound.in_flight_len() == 0
            } else {
                true
            };
            self.outbound.fill(can_start_next);

            if let Some(mut ssl) = self.ssl.take() {
                let has_work = !self.outbound.buffer_mut().is_empty()
                    || ssl.engine.wants_write()
                    || ssl.writable.has_staged();
                if !has_work {
                    self.ssl = Some(ssl);
                    break;
                }
                let stream = self.stream.as_mut().expect("connection has no socket");
                let result = ssl.writable.write(
                    stream,
                    ssl.engine.as_mut(),
                    &mut ssl.machine,
                    self.client_side,
                    self.outbound.buffer_mut(),
                );
                let write = match result {
                    Ok(write) => write,
                    Err(e) => {
                        self.ssl = Some(ssl);
                        return Err(e);
                    }
                };
                let still_handshaking = ssl.machine.is_handshaking();
                self.ssl = Some(ssl);
                self.apply_directive(write.directive, outcome);
                self.complete_written_message();
                if !write.flushed || outcome.closed || self.tasks_pending {
                    break;
                }
                if still_handshaking {
                    // Our flight is out; nothing to do until peer bytes
                    // arrive on the inbound way.
                    break;
                }
                if self.outbound.is_drained() {
                    break;
                }
            } else {
                if self.outbound.buffer_mut().is_empty() {
                    break;
                }
                let stream = self.stream.as_mut().expect("connection has no socket");
                let mut blocked = false;
                loop {
                    if self.outbound.buffer_mut().is_empty() {
                        break;
                    }
                    match self.outbound.buffer_mut().drain_to(stream) {
                        Ok(0) => {
                            blocked = true;
                            break;
                        }
                        Ok(_) => continue,
                        Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                            blocked = true;
                            break;
                        }
                        Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                        Err(e) => return Err(e.into()),
                    }
                }
                self.complete_written_message();
                if blocked {
                    break;
                }
                if self.outbound.is_drained() {
                    break;
                }
            }
        }
        Ok(())
    }

    fn complete_written_message(&mut self) {
        while let Some(message) = self.outbound.take_completed() {
            match message {
                OutboundMessage::Request(exchange) => {
                    trace!(token = self.token, "request written, awaiting response");
                    self.inbound.push_in_flight(exchange);
                }
                OutboundMessage::Response(_) => {
                    trace!(token = self.token, "response written");
                    self.pending_server_responses =
                        self.pending_server_responses.saturating_sub(1);
                    if !self.persisting {
                        self.close_after_drain = true;
                    }
                }
            }
        }
    }

    /// Parses what the inbound buffer holds: responses on the client
    /// side (resolving sinks), requests on the server side.
    fn process_inbound(&mut self, outcome: &mut IoOutcome) {
        if self.client_side {
            let tls = self.session_info();
            match self.inbound.resolve_responses(tls.as_ref()) {
                Ok(resolved) => {
                    if resolved > 0 && !self.persisting {
                        self.close_gracefully();
                    }
                }
                Err(e) => {
                    warn!(token = self.token, error = %e, "inbound protocol violation");
                    outcome.failed =
                        Some(Status::connector_error_communication(e.to_string()));
                    outcome.closed = true;
                }
            }
        } else {
            // One request at a time: the next request is parsed only once
            // the previous response has fully left the socket. Handlers run
            // concurrently across connections, never within one, so
            // responses always come back in request order.
            if self.pending_server_responses > 0 {
                return;
            }
            let budget = 1;
            let secure = self.ssl.is_some();
            let tls = self.session_info();
            match self.inbound.parse_requests(secure, budget) {
                Ok(mut requests) => {
                    for request in &mut requests {
                        request.tls = tls.clone();
                    }
                    self.pending_server_responses += requests.len();
                    outcome.requests = requests;
                }
                Err(e) => {
                    warn!(token = self.token, error = %e, "malformed request");
                    outcome.failed =
                        Some(Status::connector_error_communication(e.to_string()));
                    outcome.closed = true;
                }
            }
        }
    }

    fn apply_directive(&mut self, directive: SslDirective, outcome: &mut IoOutcome) {
        match directive {
            SslDirective::Proceed => {}
            SslDirective::AwaitUnwrap => {
                if self.inbound.io_state() == IoState::Idle {
                    self.inbound.set_io_state(IoState::Interest);
                }
            }
            SslDirective::FlipToWrap | SslDirective::FlipToUnwrap => {
                // Interest recomputation covers the direction change.
            }
            SslDirective::RunTasks => {
                self.tasks_pending = true;
                outcome.need_tasks = true;
            }
            SslDirective::HandshakeFinished => {
                debug!(token = self.token, "TLS handshake finished");
                outcome.handshake_finished = true;
            }
            SslDirective::Close => {
                outcome.closed = true;
            }
        }
    }

    /// A closing connection with no remaining work finishes the close.
    fn finish_if_drained(&mut self, outcome: &mut IoOutcome) {
        if self.close_after_drain && self.load() == 0 && !outcome.closed {
            debug!(token = self.token, "drained, closing");
            outcome.closed = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{Request, ResponseSink, Scheme};
    use crate::tls::engine::{EngineResult, EngineStatus, HandshakeStatus};
    use std::net::TcpListener as StdTcpListener;
    use std::time::Duration;

    /// Engine stub pinned mid-handshake. With `needs_task` set, the first
    /// wrap reports a delegated task batch; any unwrap fails the test,
    /// since a suspended connection must not drive the engine.
    struct StalledEngine {
        needs_task: bool,
    }

    impl TlsEngine for StalledEngine {
        fn unwrap(
            &mut self,
            _packet: &mut Buffer,
            _plaintext: &mut Vec<u8>,
        ) -> Result<EngineResult, Error> {
            panic!("engine driven while the connection is suspended");
        }

        fn wrap(
            &mut self,
            _application: &mut Buffer,
            _packet: &mut Buffer,
        ) -> Result<EngineResult, Error> {
            let handshake = if self.needs_task {
                HandshakeStatus::NeedTask
            } else {
                HandshakeStatus::NeedUnwrap
            };
            Ok(EngineResult {
                status: EngineStatus::Ok,
                handshake,
                consumed: 0,
                produced: 0,
            })
        }

        fn take_delegated_task(&mut self) -> Option<DelegatedTask> {
            None
        }

        fn is_handshaking(&self) -> bool {
            true
        }

        fn wants_write(&self) -> bool {
            self.needs_task
        }

        fn session_info(&self) -> Option<TlsInfo> {
            None
        }

        fn send_close_notify(&mut self) {}
    }

    fn connected_pair() -> (TcpStream, std::net::TcpStream) {
        let listener = StdTcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).unwrap();
        let (server, _) = listener.accept().unwrap();
        (client, server)
    }

    fn open_client_connection() -> (Connection, std::net::TcpStream) {
        let (client_stream, server_stream) = connected_pair();
        let addr = server_stream.local_addr().unwrap();
        let mut conn = Connection::detached(1024, 1024, true);
        conn.open_client(1000, client_stream, addr, None, false, true, None);
        (conn, server_stream)
    }

    /// Drives writable events until the non-blocking connect completes.
    fn drive_writable(conn: &mut Connection) -> IoOutcome {
        for _ in 0..100 {
            let outcome = conn.handle_writable();
            if conn.state() != ConnectionState::Opening {
                return outcome;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        panic!("connect did not complete");
    }

    fn exchange(path: &str) -> (Exchange, std::sync::mpsc::Receiver<Response>) {
        let (sink, rx) = ResponseSink::latch();
        (
            Exchange::new(Request::get(Scheme::Http, "localhost", path), sink),
            rx,
        )
    }

    #[test]
    fn detached_connection_is_closed_and_unavailable() {
        let conn = Connection::detached(64, 64, true);
        assert_eq!(conn.state(), ConnectionState::Closed);
        assert_eq!(conn.interest(), None);
        assert_eq!(conn.load(), 0);
    }

    #[test]
    fn opening_connection_wants_writable_only() {
        let (conn, _server) = open_client_connection();
        assert_eq!(conn.state(), ConnectionState::Opening);
        assert_eq!(conn.interest(), Some(Interest::WRITABLE));
    }

    #[test]
    fn availability_tracks_load_and_pipelining() {
        let (mut conn, server) = open_client_connection();
        let addr = server.local_addr().unwrap();
        let other: SocketAddr = "10.0.0.1:80".parse().unwrap();

        drive_writable(&mut conn);
        assert!(conn.is_available(addr));
        assert!(!conn.is_available(other));

        let (ex, _rx) = exchange("/busy");
        conn.enqueue_request(ex);
        assert!(!conn.is_available(addr));
        assert!(conn.is_candidate(addr));

        conn.pipelining = true;
        assert!(conn.is_available(addr));
    }

    #[test]
    fn opening_connection_is_a_candidate_but_not_available() {
        let (conn, server) = open_client_connection();
        let addr = server.local_addr().unwrap();
        assert_eq!(conn.state(), ConnectionState::Opening);
        assert!(conn.is_candidate(addr));
        assert!(!conn.is_available(addr));
    }

    #[test]
    fn handshaking_connection_is_not_available() {
        let (client_stream, server) = connected_pair();
        let addr = server.local_addr().unwrap();
        let mut conn = Connection::detached(1024, 1024, true);
        let ssl = SslDuplex::new(Box::new(StalledEngine { needs_task: false }));
        conn.open_client(1000, client_stream, addr, Some(ssl), true, true, None);

        drive_writable(&mut conn);
        assert_eq!(conn.state(), ConnectionState::Open);
        assert!(conn.is_candidate(addr));
        assert!(!conn.is_available(addr));
    }

    #[test]
    fn readiness_is_ignored_while_delegated_tasks_run() {
        use std::io::Write as _;
        let (client_stream, mut server) = connected_pair();
        let addr = server.local_addr().unwrap();
        let mut conn = Connection::detached(1024, 1024, true);
        let ssl = SslDuplex::new(Box::new(StalledEngine { needs_task: true }));
        conn.open_client(1000, client_stream, addr, Some(ssl), false, true, None);

        let outcome = drive_writable(&mut conn);
        assert!(outcome.need_tasks);
        assert_eq!(conn.interest(), None);

        // Peer bytes arriving mid-suspension must not reach the engine;
        // the stub panics if an unwrap gets through.
        server.write_all(b"\x16\x03\x03junk").unwrap();
        std::thread::sleep(Duration::from_millis(200));
        let outcome = conn.handle_readable();
        assert!(!outcome.closed);
        assert!(outcome.failed.is_none());
        let outcome = conn.handle_writable();
        assert!(!outcome.closed);
    }

    #[test]
    fn writable_event_establishes_and_sends_the_request() {
        use std::io::Read as _;
        let (mut conn, mut server) = open_client_connection();
        let (ex, _rx) = exchange("/hello");
        conn.enqueue_request(ex);

        let outcome = drive_writable(&mut conn);
        assert!(!outcome.closed);
        assert_eq!(conn.state(), ConnectionState::Open);
        assert_eq!(conn.inbound.in_flight_len(), 1);

        let mut wire = vec![0u8; 256];
        let read = server.read(&mut wire).unwrap();
        assert!(std::str::from_utf8(&wire[..read])
            .unwrap()
            .starts_with("GET /hello HTTP/1.1"));
    }

    #[test]
    fn response_resolves_the_latch_and_frees_the_connection() {
        use std::io::Write as _;
        let (mut conn, mut server) = open_client_connection();
        let addr = server.local_addr().unwrap();
        let (ex, rx) = exchange("/get");
        conn.enqueue_request(ex);
        drive_writable(&mut conn);
        assert!(!conn.is_available(addr));

        server
            .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nhi")
            .unwrap();
        std::thread::sleep(Duration::from_millis(200));
        let outcome = conn.handle_readable();
        assert!(!outcome.closed);
        assert_eq!(rx.recv().unwrap().body, b"hi");
        assert_eq!(conn.load(), 0);
        assert!(conn.is_available(addr));
    }

    #[test]
    fn peer_close_fails_the_in_flight_exchange_via_force_close() {
        let (mut conn, server) = open_client_connection();
        let (ex, rx) = exchange("/doomed");
        conn.enqueue_request(ex);
        drive_writable(&mut conn);
        drop(server);

        std::thread::sleep(Duration::from_millis(200));
        let outcome = conn.handle_readable();
        assert!(outcome.closed);
        // The helper force-closes on `closed`; emulate it.
        conn.force_close(&Status::connector_error_communication("connection closed"));
        assert_eq!(rx.recv().unwrap().status.code, 1001);
        assert_eq!(conn.state(), ConnectionState::Closed);
    }

    #[test]
    fn non_persisting_connection_closes_after_the_exchange() {
        use std::io::Write as _;
        let (client_stream, mut server) = connected_pair();
        let addr = server.local_addr().unwrap();
        let mut conn = Connection::detached(1024, 1024, true);
        conn.open_client(1000, client_stream, addr, None, false, false, None);

        let (ex, rx) = exchange("/once");
        conn.enqueue_request(ex);
        drive_writable(&mut conn);
        server
            .write_all(b"HTTP/1.1 204 No Content\r\n\r\n")
            .unwrap();
        std::thread::sleep(Duration::from_millis(200));
        let outcome = conn.handle_readable();
        assert_eq!(rx.recv().unwrap().status.code, 204);
        assert!(outcome.closed);
    }

    #[test]
    fn server_side_parses_one_request_until_the_response_is_written() {
        use std::io::Write as _;
        let (mut client, server) = {
            let listener = StdTcpListener::bind("127.0.0.1:0").unwrap();
            let addr = listener.local_addr().unwrap();
            let client = std::net::TcpStream::connect(addr).unwrap();
            let (server, _) = listener.accept().unwrap();
            (client, server)
        };
        server.set_nonblocking(true).unwrap();
        let mio_server = TcpStream::from_std(server);
        let peer = mio_server.peer_addr().unwrap();
        let mut conn = Connection::detached(1024, 1024, false);
        conn.open_server(1001, mio_server, peer, None, false, true);

        client
            .write_all(
                b"GET /a HTTP/1.1\r\nHost: h\r\n\r\nGET /b HTTP/1.1\r\nHost: h\r\n\r\n",
            )
            .unwrap();
        std::thread::sleep(Duration::from_millis(200));
        let outcome = conn.handle_readable();
        assert_eq!(outcome.requests.len(), 1);
        assert_eq!(outcome.requests[0].path, "/a");
        assert_eq!(conn.load(), 1);

        // Second request is parsed only after the first response drains.
        conn.enqueue_response(Response::ok("done"));
        let outcome = conn.handle_writable();
        assert!(!outcome.closed);
        assert_eq!(conn.load(), 0);
        let outcome = conn.handle_readable();
        assert_eq!(outcome.requests.len(), 1);
        assert_eq!(outcome.requests[0].path, "/b");
    }

    #[test]
    fn graceful_close_waits_for_the_drain() {
        use std::io::Write as _;
        let (mut conn, mut server) = open_client_connection();
        let (ex, rx) = exchange("/last");
        conn.enqueue_request(ex);
        drive_writable(&mut conn);

        conn.close_gracefully();
        assert_eq!(conn.state(), ConnectionState::Closing);
        // Still waiting on the response, so not drained yet.
        assert!(!conn.is_drained());

        server
            .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n")
            .unwrap();
        std::thread::sleep(Duration::from_millis(200));
        let outcome = conn.handle_readable();
        assert_eq!(rx.recv().unwrap().status.code, 200);
        assert!(outcome.closed);
    }

    #[test]
    fn clear_keeps_way_buffer_allocations() {
        let (mut conn, _server) = open_client_connection();
        conn.force_close(&Status::connector_error_communication("test"));
        let before = conn.inbound.buffer_mut().storage_ptr();
        conn.clear();
        assert_eq!(conn.inbound.buffer_mut().storage_ptr(), before);
        assert_eq!(conn.state(), ConnectionState::Closed);
    }
}
