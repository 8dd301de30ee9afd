//! Connection helpers: the controller-thread engine behind the public
//! [`Client`] and [`Server`] connectors.
//!
//! A helper owns the poll loop, the connection registry, the pool and the
//! worker pool. Callers on other threads talk to it exclusively through
//! control requests; the synchronous `Client::handle` parks on a latch
//! that the controller thread is guaranteed to resolve exactly once.

use std::collections::HashMap;
use std::io;
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::mpsc::channel;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest};
use socket2::{Domain, Protocol, Socket, Type};
use tracing::{debug, error, info, instrument, trace, warn};

use crate::config::ConnectorOptions;
use crate::connection::{Connection, IoOutcome, SslDuplex};
use crate::controller::{ControlHandle, ControlRequest, ConnectionController, WAKE_TOKEN};
use crate::error::Error;
use crate::message::{Exchange, Request, Response, ResponseSink, Status};
use crate::pool::ConnectionPool;
use crate::state::ConnectionState;
use crate::tls::engine::RustlsEngine;
use crate::tls::{load_tls_client_config, load_tls_server_config, parse_server_name};
use crate::workers::WorkerPool;

/// First token handed to listeners and connections; below this only the
/// waker token exists.
pub(crate) const FIRST_CONNECTION_TOKEN: usize = 1000;

/// Listener accept backlog.
const LISTEN_BACKLOG: i32 = 1024;

type RequestHandler = dyn Fn(Request) -> Response + Send + Sync;

enum Role {
    Client {
        tls: Option<Arc<rustls::ClientConfig>>,
        server_name: Option<String>,
    },
    Server {
        listeners: HashMap<usize, TcpListener>,
        handler: Arc<RequestHandler>,
        tls: Option<Arc<rustls::ServerConfig>>,
    },
}

pub(crate) struct Helper {
    options: ConnectorOptions,
    controller: ConnectionController,
    connections: HashMap<usize, Connection>,
    next_token: usize,
    pool: ConnectionPool,
    workers: WorkerPool,
    role: Role,
    stopping: bool,
}

impl Helper {
    pub(crate) fn new_client(config: &config::Config, name: &str) -> Result<Self, Error> {
        let options = ConnectorOptions::client(config, name)?;
        let tls = match &options.tls_ca_cert {
            Some(path) => Some(Arc::new(load_tls_client_config(path)?)),
            None => None,
        };
        let role = Role::Client {
            tls,
            server_name: options.tls_server_name.clone(),
        };
        Self::new(options, role, "client")
    }

    pub(crate) fn new_server(
        config: &config::Config,
        name: &str,
        handler: Arc<RequestHandler>,
    ) -> Result<Self, Error> {
        let options = ConnectorOptions::server(config, name)?;
        let tls = match (&options.tls_server_cert, &options.tls_server_key) {
            (Some(cert), Some(key)) => Some(Arc::new(load_tls_server_config(cert, key)?)),
            (None, None) => None,
            _ => return Err(Error::TlsServerConfigMissing),
        };
        let role = Role::Server {
            listeners: HashMap::new(),
            handler,
            tls,
        };
        Self::new(options, role, "server")
    }

    fn new(options: ConnectorOptions, role: Role, kind: &str) -> Result<Self, Error> {
        let controller = ConnectionController::new()?;
        let client_side = matches!(role, Role::Client { .. });
        let pool = ConnectionPool::new(
            options.pooled_connections,
            options.initial_connections,
            options.inbound_buffer_size,
            options.outbound_buffer_size,
            client_side,
        );
        let workers = WorkerPool::new(options.worker_threads, &format!("netway-{kind}"));
        Ok(Self {
            options,
            controller,
            connections: HashMap::new(),
            next_token: FIRST_CONNECTION_TOKEN,
            pool,
            workers,
            role,
            stopping: false,
        })
    }

    pub(crate) fn control_handle(&self) -> ControlHandle {
        self.controller.handle()
    }

    pub(crate) fn daemon(&self) -> bool {
        self.options.controller_daemon
    }

    /// The controller loop. Consumes the helper; runs until a stop request
    /// has been honored and every connection is gone.
    pub(crate) fn run(mut self) {
        let mut events = Events::with_capacity(self.options.poll_capacity);
        info!(
            client = matches!(self.role, Role::Client { .. }),
            "connection controller running"
        );
        loop {
            self.control();
            if self.stopping && self.connections.is_empty() {
                break;
            }
            self.expire_overdue_connects();

            let timeout = self
                .next_connect_deadline()
                .map(|deadline| deadline.saturating_duration_since(Instant::now()));
            if let Err(e) = self.controller.poll(&mut events, timeout) {
                error!(error = %e, "poll failed, stopping controller");
                self.fail_all_connections(&Status::connector_error_internal(e.to_string()));
                break;
            }
            for event in events.iter() {
                if event.token() == WAKE_TOKEN {
                    continue;
                }
                self.process_event(event.token().0, event.is_readable(), event.is_writable());
            }
        }
        self.workers.shutdown();
        info!("connection controller stopped");
    }

    /// Drains and executes queued control requests.
    fn control(&mut self) {
        for request in self.controller.drain_requests() {
            match request {
                ControlRequest::Outbound(exchange) => {
                    if self.stopping {
                        let mut exchange = exchange;
                        exchange.sink.resolve(Response::new(
                            Status::connector_error_connection("connector is stopping"),
                        ));
                    } else {
                        self.handle_outbound(exchange);
                    }
                }
                ControlRequest::ServerResponse { token, response } => {
                    match self.connections.get_mut(&token) {
                        Some(conn) => {
                            conn.enqueue_response(response);
                            self.update_interest(token);
                        }
                        None => {
                            debug!(token, "dropping response for a closed connection")
                        }
                    }
                }
                ControlRequest::TaskDone { token } => {
                    if let Some(conn) = self.connections.get_mut(&token) {
                        conn.resume_after_tasks();
                        self.update_interest(token);
                    }
                }
                ControlRequest::TaskFailed { token, error } => {
                    warn!(token, error = %error, "delegated TLS task failed");
                    self.close_connection(
                        token,
                        Some(Status::connector_error_communication(error.to_string())),
                    );
                }
                ControlRequest::Listen { addr, reply } => {
                    let result = self.open_listener(addr);
                    let _ = reply.send(result);
                }
                ControlRequest::Stop { graceful } => self.begin_stop(graceful),
            }
        }
    }

    /// Routes one client exchange to the best connection, creating one if
    /// policy allows. Failures resolve the sink immediately with a
    /// connector error; the caller never hangs.
    #[instrument(skip(self, exchange))]
    fn handle_outbound(&mut self, mut exchange: Exchange) {
        match self.get_best_connection(&exchange.request) {
            Ok(token) => {
                let conn = self
                    .connections
                    .get_mut(&token)
                    .expect("best connection must exist");
                conn.enqueue_request(exchange);
                self.update_interest(token);
            }
            Err(e) => {
                debug!(error = %e, "request could not be routed");
                let status = match &e {
                    // Capacity exhaustion is a communication error; the
                    // target itself was never unreachable.
                    Error::CapacityReached(_) => {
                        Status::connector_error_communication(e.to_string())
                    }
                    _ => Status::connector_error_connection(e.to_string()),
                };
                exchange.sink.resolve(Response::new(status));
            }
        }
    }

    /// Best-connection policy:
    /// 1. an available connection to the target (least loaded first),
    /// 2. else a new connection while below the total and per-host ceilings,
    /// 3. else the least loaded busy candidate to the target.
    fn get_best_connection(&mut self, request: &Request) -> Result<usize, Error> {
        let address = self.socket_address(request)?;

        let available = self
            .connections
            .values()
            .filter(|conn| conn.is_available(address))
            .min_by_key(|conn| conn.load())
            .map(Connection::token);
        if let Some(token) = available {
            trace!(token, "reusing available connection");
            return Ok(token);
        }

        let host_count = self
            .connections
            .values()
            .filter(|conn| conn.is_candidate(address))
            .count() as i64;
        let total_count = self
            .connections
            .values()
            .filter(|conn| conn.state() != ConnectionState::Closed)
            .count() as i64;
        let below_total = self.options.max_total_connections < 0
            || total_count < self.options.max_total_connections;
        let below_host = self.options.max_connections_per_host < 0
            || host_count < self.options.max_connections_per_host;
        if below_total && below_host {
            return self.create_client_connection(request, address);
        }

        let busiest_fallback = self
            .connections
            .values()
            .filter(|conn| conn.is_candidate(address))
            .min_by_key(|conn| conn.load())
            .map(Connection::token);
        match busiest_fallback {
            Some(token) => {
                warn!(token, "connection capacity reached, queueing on busy connection");
                Ok(token)
            }
            None => {
                warn!(%address, "connection capacity reached, no candidate to queue on");
                Err(Error::CapacityReached(address.to_string()))
            }
        }
    }

    /// Resolves the request target, honoring the proxy settings.
    fn socket_address(&self, request: &Request) -> Result<SocketAddr, Error> {
        let (host, port) = match &self.options.proxy_host {
            Some(proxy) => (proxy.clone(), self.options.proxy_port),
            None => (request.host.clone(), request.effective_port()),
        };
        let bare = host.trim_start_matches('[').trim_end_matches(']');
        (bare, port)
            .to_socket_addrs()
            .map_err(|_| Error::HostResolution {
                host: host.clone(),
                port,
            })?
            .next()
            .ok_or(Error::HostResolution { host, port })
    }

    fn create_client_connection(
        &mut self,
        request: &Request,
        address: SocketAddr,
    ) -> Result<usize, Error> {
        let ssl = if request.scheme.is_confidential() {
            let Role::Client { tls, server_name } = &self.role else {
                return Err(Error::TlsClientConfigMissing);
            };
            let config = tls.clone().ok_or(Error::TlsClientConfigMissing)?;
            let sni = server_name
                .clone()
                .unwrap_or_else(|| request.host.clone());
            let engine = RustlsEngine::client(config, parse_server_name(&sni)?)?;
            Some(SslDuplex::new(Box::new(engine)))
        } else {
            None
        };

        let stream = self.connect_socket(address)?;
        let token = self.allocate_token();
        let deadline = match self.options.socket_connect_timeout_ms {
            0 => None,
            ms => Some(Instant::now() + Duration::from_millis(ms)),
        };
        let mut conn = self.pool.checkout();
        conn.open_client(
            token,
            stream,
            address,
            ssl,
            self.options.pipelining_connections,
            self.options.persisting_connections,
            deadline,
        );
        self.connections.insert(token, conn);
        self.update_interest(token);
        debug!(token, %address, "client connection opened");
        Ok(token)
    }

    /// Creates a tuned non-blocking socket and starts the connect.
    #[instrument(skip(self, address))]
    fn connect_socket(&self, address: SocketAddr) -> Result<TcpStream, Error> {
        let socket = Socket::new(Domain::for_address(address), Type::STREAM, Some(Protocol::TCP))?;
        socket.set_nonblocking(true)?;
        self.tune_socket(&socket)?;
        match socket.connect(&address.into()) {
            Ok(()) => {}
            // Non-blocking connect reports EINPROGRESS.
            #[cfg(unix)]
            Err(e) if e.raw_os_error() == Some(libc::EINPROGRESS) => {}
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
            Err(e) => return Err(e.into()),
        }
        Ok(TcpStream::from_std(socket.into()))
    }

    fn tune_socket(&self, socket: &Socket) -> io::Result<()> {
        socket.set_keepalive(self.options.socket_keep_alive)?;
        socket.set_nodelay(self.options.socket_no_delay)?;
        socket.set_reuse_address(self.options.socket_reuse_address)?;
        socket.set_recv_buffer_size(self.options.socket_receive_buffer_size)?;
        socket.set_send_buffer_size(self.options.socket_send_buffer_size)?;
        if self.options.socket_linger_time_ms >= 0 {
            socket.set_linger(Some(Duration::from_millis(
                self.options.socket_linger_time_ms as u64,
            )))?;
        }
        if self.options.socket_traffic_class != 0 {
            socket.set_tos(self.options.socket_traffic_class)?;
        }
        socket.set_out_of_band_inline(self.options.socket_oob_inline)?;
        Ok(())
    }

    #[instrument(skip(self, addr))]
    fn open_listener(&mut self, addr: SocketAddr) -> Result<(usize, SocketAddr), Error> {
        let Role::Server { .. } = self.role else {
            return Err(Error::ConnectFailed(
                "client connectors cannot listen".into(),
            ));
        };
        let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
        socket.set_reuse_address(self.options.socket_reuse_address)?;
        socket.set_nonblocking(true)?;
        socket.bind(&addr.into())?;
        socket.listen(LISTEN_BACKLOG)?;
        let mut listener = TcpListener::from_std(socket.into());
        let local = listener.local_addr()?;
        let token = self.allocate_token();
        self.controller
            .register(&mut listener, token, Interest::READABLE)?;
        if let Role::Server { listeners, .. } = &mut self.role {
            listeners.insert(token, listener);
        }
        info!(token, %local, "listening");
        Ok((token, local))
    }

    fn allocate_token(&mut self) -> usize {
        let token = self.next_token;
        self.next_token += 1;
        token
    }

    fn process_event(&mut self, token: usize, readable: bool, writable: bool) {
        if let Role::Server { listeners, .. } = &self.role {
            if listeners.contains_key(&token) {
                self.accept_connections(token);
                return;
            }
        }
        let Some(conn) = self.connections.get_mut(&token) else {
            trace!(token, "event for unknown token");
            return;
        };

        let mut outcome = IoOutcome::default();
        if writable {
            merge(&mut outcome, conn.handle_writable());
        }
        // A writable pass that suspended the connection for delegated
        // tasks also parks the readable side until `TaskDone` arrives.
        if readable && !outcome.closed && !outcome.need_tasks && outcome.failed.is_none() {
            merge(&mut outcome, conn.handle_readable());
        }
        self.apply_outcome(token, outcome);
    }

    fn apply_outcome(&mut self, token: usize, outcome: IoOutcome) {
        if !outcome.requests.is_empty() {
            self.dispatch_requests(token, outcome.requests);
        }
        if outcome.need_tasks {
            self.run_delegated_tasks(token);
            return;
        }
        if outcome.closed || outcome.failed.is_some() {
            self.close_connection(token, outcome.failed);
            return;
        }
        if outcome.handshake_finished {
            trace!(token, "handshake finished, resuming application traffic");
        }
        self.update_interest(token);
    }

    /// Ships parsed server requests to handler jobs on the worker pool.
    /// Each job posts its response back as a control request.
    fn dispatch_requests(&mut self, token: usize, requests: Vec<Request>) {
        let Role::Server { handler, .. } = &self.role else {
            warn!(token, "client connection produced requests");
            return;
        };
        for request in requests {
            let handler = Arc::clone(handler);
            let handle = self.controller.handle();
            self.workers.execute(Box::new(move || {
                let response = handler(request);
                if handle
                    .send(ControlRequest::ServerResponse { token, response })
                    .is_err()
                {
                    debug!(token, "controller gone, dropping response");
                }
            }));
        }
    }

    /// Runs the engine's delegated task batch on the worker pool. Both
    /// ways of the connection are suspended until `TaskDone` arrives; a
    /// failure comes back as `TaskFailed` and force-closes the connection.
    fn run_delegated_tasks(&mut self, token: usize) {
        let Some(conn) = self.connections.get_mut(&token) else {
            return;
        };
        let tasks = conn.take_delegated_tasks();
        self.update_interest(token);
        let handle = self.controller.handle();
        self.workers.execute(Box::new(move || {
            for task in tasks {
                if let Err(error) = task() {
                    let _ = handle.send(ControlRequest::TaskFailed { token, error });
                    return;
                }
            }
            let _ = handle.send(ControlRequest::TaskDone { token });
        }));
    }

    fn accept_connections(&mut self, listener_token: usize) {
        loop {
            let accepted = {
                let Role::Server { listeners, .. } = &mut self.role else {
                    return;
                };
                let Some(listener) = listeners.get_mut(&listener_token) else {
                    return;
                };
                listener.accept()
            };
            match accepted {
                Ok((stream, peer)) => {
                    if let Err(e) = self.install_server_connection(stream, peer) {
                        warn!(error = %e, "failed to install accepted connection");
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e)
                    if matches!(
                        e.kind(),
                        io::ErrorKind::ConnectionAborted | io::ErrorKind::ConnectionReset
                    ) =>
                {
                    // Peer vanished between readiness and accept.
                    debug!(error = %e, "connection aborted before accept");
                    continue;
                }
                Err(e) => {
                    error!(error = %e, "accept failed");
                    break;
                }
            }
        }
    }

    fn install_server_connection(
        &mut self,
        stream: TcpStream,
        peer: SocketAddr,
    ) -> Result<(), Error> {
        let tls = match &self.role {
            Role::Server { tls, .. } => tls.clone(),
            Role::Client { .. } => None,
        };
        let ssl = match tls {
            Some(config) => Some(SslDuplex::new(Box::new(RustlsEngine::server(config)?))),
            None => None,
        };
        let token = self.allocate_token();
        let mut conn = self.pool.checkout();
        conn.open_server(
            token,
            stream,
            peer,
            ssl,
            self.options.pipelining_connections,
            self.options.persisting_connections,
        );
        self.connections.insert(token, conn);
        self.update_interest(token);
        debug!(token, %peer, "accepted connection");
        Ok(())
    }

    /// Registers, reregisters or deregisters the connection to match the
    /// interest it currently wants.
    fn update_interest(&mut self, token: usize) {
        let Some(conn) = self.connections.get_mut(&token) else {
            return;
        };
        let desired = conn.interest();
        let current = conn.registered_interest();
        if desired == current {
            return;
        }
        let result = match (current, desired) {
            (None, Some(interest)) => self.controller.register(conn.stream_mut(), token, interest),
            (Some(_), Some(interest)) => {
                self.controller
                    .reregister(conn.stream_mut(), token, interest)
            }
            (Some(_), None) => self.controller.deregister(conn.stream_mut()),
            (None, None) => Ok(()),
        };
        match result {
            Ok(()) => conn.set_registered_interest(desired),
            Err(e) => {
                error!(token, error = %e, "poll registration failed");
                self.close_connection(
                    token,
                    Some(Status::connector_error_internal(e.to_string())),
                );
            }
        }
    }

    /// Removes a connection, resolving anything still pending on it, and
    /// recycles it through the pool.
    fn close_connection(&mut self, token: usize, failed: Option<Status>) {
        let Some(mut conn) = self.connections.remove(&token) else {
            return;
        };
        if conn.registered_interest().is_some() {
            if let Err(e) = self.controller.deregister(conn.stream_mut()) {
                debug!(token, error = %e, "deregister failed");
            }
        }
        let status = failed
            .unwrap_or_else(|| Status::connector_error_communication("connection closed"));
        debug!(token, status = status.code, "closing connection");
        conn.force_close(&status);
        self.pool.checkin(conn);
    }

    fn begin_stop(&mut self, graceful: bool) {
        info!(graceful, "stop requested");
        self.stopping = true;
        if let Role::Server { listeners, .. } = &mut self.role {
            for (_, mut listener) in listeners.drain() {
                let _ = self.controller.deregister(&mut listener);
            }
        }
        let tokens: Vec<usize> = self.connections.keys().copied().collect();
        if graceful {
            for token in tokens {
                if let Some(conn) = self.connections.get_mut(&token) {
                    conn.close_gracefully();
                    if conn.is_drained() {
                        self.close_connection(token, None);
                    }
                }
            }
        } else {
            let status = Status::connector_error_communication("connector stopped");
            for token in tokens {
                self.close_connection(token, Some(status.clone()));
            }
        }
    }

    fn fail_all_connections(&mut self, status: &Status) {
        let tokens: Vec<usize> = self.connections.keys().copied().collect();
        for token in tokens {
            self.close_connection(token, Some(status.clone()));
        }
        self.stopping = true;
    }

    fn next_connect_deadline(&self) -> Option<Instant> {
        self.connections
            .values()
            .filter_map(Connection::connect_deadline)
            .min()
    }

    /// Fails Opening connections whose connect deadline has passed.
    fn expire_overdue_connects(&mut self) {
        let now = Instant::now();
        let overdue: Vec<usize> = self
            .connections
            .iter()
            .filter(|(_, conn)| conn.connect_deadline().is_some_and(|d| d <= now))
            .map(|(token, _)| *token)
            .collect();
        for token in overdue {
            let elapsed = self.options.socket_connect_timeout_ms;
            warn!(token, elapsed_ms = elapsed, "connect timed out");
            self.close_connection(
                token,
                Some(Status::connector_error_connection(
                    Error::ConnectTimeout {
                        elapsed_ms: elapsed,
                    }
                    .to_string(),
                )),
            );
        }
    }
}

fn merge(into: &mut IoOutcome, from: IoOutcome) {
    into.closed |= from.closed;
    if into.failed.is_none() {
        into.failed = from.failed;
    }
    into.handshake_finished |= from.handshake_finished;
    into.need_tasks |= from.need_tasks;
    into.requests.extend(from.requests);
}

/// Non-blocking HTTP(S) client connector.
///
/// Requests are routed to pooled connections by the controller thread;
/// [`Client::handle`] blocks the calling thread until its response (or a
/// connector-error response) arrives, [`Client::handle_with`] delivers it
/// to a callback instead.
pub struct Client {
    handle: ControlHandle,
    join: Option<JoinHandle<()>>,
    daemon: bool,
    stopped: bool,
}

impl Client {
    pub fn new(config: &config::Config) -> Result<Self, Error> {
        Self::with_name(config, "")
    }

    /// Creates a named client; configuration keys prefixed `{name}.` take
    /// precedence over bare keys.
    pub fn with_name(config: &config::Config, name: &str) -> Result<Self, Error> {
        let helper = Helper::new_client(config, name)?;
        let handle = helper.control_handle();
        let daemon = helper.daemon();
        let join = thread::Builder::new()
            .name("netway-client-controller".into())
            .spawn(move || helper.run())?;
        Ok(Self {
            handle,
            join: Some(join),
            daemon,
            stopped: false,
        })
    }

    /// Sends the request and blocks until its response. Never hangs: every
    /// failure path resolves with a connector-error status (code 1000 for
    /// connect failures, 1001 for communication failures, 1002 for
    /// connector-internal ones).
    #[instrument(skip(self, request))]
    pub fn handle(&self, request: Request) -> Response {
        let (sink, rx) = ResponseSink::latch();
        if self
            .handle
            .send(ControlRequest::Outbound(Exchange::new(request, sink)))
            .is_err()
        {
            return Response::new(Status::connector_error_internal(
                "connection controller is not running",
            ));
        }
        rx.recv().unwrap_or_else(|_| {
            Response::new(Status::connector_error_internal(
                "controller dropped the exchange",
            ))
        })
    }

    /// Sends the request and delivers the response to `callback` on the
    /// controller thread. The callback fires exactly once, including when
    /// the controller is already gone.
    pub fn handle_with(
        &self,
        request: Request,
        callback: impl FnOnce(Response) + Send + 'static,
    ) {
        let sink = ResponseSink::callback(callback);
        let exchange = Exchange::new(request, sink);
        if let Err(ControlRequest::Outbound(mut exchange)) =
            self.handle.send(ControlRequest::Outbound(exchange))
        {
            exchange.sink.resolve(Response::new(
                Status::connector_error_internal("connection controller is not running"),
            ));
        }
    }

    /// Stops the connector. Graceful lets in-flight exchanges finish;
    /// forced resolves them with a communication error. Joins the
    /// controller thread unless `controller_daemon` is set.
    pub fn stop(mut self, graceful: bool) {
        let _ = self.handle.send(ControlRequest::Stop { graceful });
        self.stopped = true;
        if !self.daemon {
            if let Some(join) = self.join.take() {
                let _ = join.join();
            }
        }
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        if !self.stopped {
            let _ = self.handle.send(ControlRequest::Stop { graceful: false });
        }
    }
}

/// Non-blocking HTTP(S) server connector.
///
/// Every parsed request runs through the handler on the worker pool; the
/// controller thread only moves bytes.
pub struct Server {
    handle: ControlHandle,
    join: Option<JoinHandle<()>>,
    daemon: bool,
    stopped: bool,
}

impl Server {
    pub fn new(
        config: &config::Config,
        handler: impl Fn(Request) -> Response + Send + Sync + 'static,
    ) -> Result<Self, Error> {
        Self::with_name(config, "", handler)
    }

    pub fn with_name(
        config: &config::Config,
        name: &str,
        handler: impl Fn(Request) -> Response + Send + Sync + 'static,
    ) -> Result<Self, Error> {
        let helper = Helper::new_server(config, name, Arc::new(handler))?;
        let handle = helper.control_handle();
        let daemon = helper.daemon();
        let join = thread::Builder::new()
            .name("netway-server-controller".into())
            .spawn(move || helper.run())?;
        Ok(Self {
            handle,
            join: Some(join),
            daemon,
            stopped: false,
        })
    }

    /// Binds a listener and returns its local address (useful with an
    /// ephemeral port). Blocks until the controller has it registered.
    #[instrument(skip(self, addr))]
    pub fn listen(&self, addr: SocketAddr) -> Result<SocketAddr, Error> {
        let (reply, rx) = channel();
        self.handle
            .send(ControlRequest::Listen { addr, reply })
            .map_err(|_| Error::ControllerStopped)?;
        let (_token, local) = rx.recv().map_err(|_| Error::ControllerStopped)??;
        Ok(local)
    }

    /// Stops the connector; see [`Client::stop`].
    pub fn stop(mut self, graceful: bool) {
        let _ = self.handle.send(ControlRequest::Stop { graceful });
        self.stopped = true;
        if !self.daemon {
            if let Some(join) = self.join.take() {
                let _ = join.join();
            }
        }
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        if !self.stopped {
            let _ = self.handle.send(ControlRequest::Stop { graceful: false });
        }
    }
}
