use std::fmt;
use std::sync::mpsc::{channel, Receiver, Sender};

use tracing::warn;

use crate::tls::TlsInfo;

/// URI scheme the connector speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    Http,
    Https,
}

impl Scheme {
    pub fn default_port(self) -> u16 {
        match self {
            Scheme::Http => 80,
            Scheme::Https => 443,
        }
    }

    /// Whether the scheme requires a TLS channel.
    pub fn is_confidential(self) -> bool {
        matches!(self, Scheme::Https)
    }
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scheme::Http => f.write_str("http"),
            Scheme::Https => f.write_str("https"),
        }
    }
}

/// Response status line, plus the connector's own error codes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Status {
    pub code: u16,
    pub reason: String,
}

impl Status {
    pub fn new(code: u16, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.into(),
        }
    }

    pub fn ok() -> Self {
        Self::new(200, "OK")
    }

    /// The connection could not be established.
    pub fn connector_error_connection(reason: impl Into<String>) -> Self {
        Self::new(1000, reason.into())
    }

    /// The connection dropped or misbehaved mid-exchange.
    pub fn connector_error_communication(reason: impl Into<String>) -> Self {
        Self::new(1001, reason.into())
    }

    /// The connector itself failed (bug or unrecoverable internal error).
    pub fn connector_error_internal(reason: impl Into<String>) -> Self {
        Self::new(1002, reason.into())
    }

    /// Connector errors use the 1000-1002 range, outside HTTP's 100-599.
    pub fn is_connector_error(&self) -> bool {
        (1000..=1002).contains(&self.code)
    }

    pub fn is_informational(&self) -> bool {
        (100..200).contains(&self.code)
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.code)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.code, self.reason)
    }
}

/// An outbound HTTP request.
#[derive(Debug, Clone)]
pub struct Request {
    pub method: String,
    pub scheme: Scheme,
    pub host: String,
    /// Explicit port; `None` means the scheme default.
    pub port: Option<u16>,
    /// Origin-form target, path plus optional query.
    pub path: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
    /// Negotiated TLS session properties, filled in by the server
    /// connector for requests received over HTTPS.
    pub tls: Option<TlsInfo>,
}

impl Request {
    pub fn new(
        method: impl Into<String>,
        scheme: Scheme,
        host: impl Into<String>,
        path: impl Into<String>,
    ) -> Self {
        Self {
            method: method.into(),
            scheme,
            host: host.into(),
            port: None,
            path: path.into(),
            headers: Vec::new(),
            body: Vec::new(),
            tls: None,
        }
    }

    pub fn get(scheme: Scheme, host: impl Into<String>, path: impl Into<String>) -> Self {
        Self::new("GET", scheme, host, path)
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }

    /// The port requests to this target actually connect to.
    pub fn effective_port(&self) -> u16 {
        self.port.unwrap_or_else(|| self.scheme.default_port())
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// An HTTP response, or a synthesized connector-error response.
#[derive(Debug, Clone)]
pub struct Response {
    pub status: Status,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
    /// TLS session properties of the connection the response arrived on.
    pub tls: Option<TlsInfo>,
}

impl Response {
    pub fn new(status: Status) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: Vec::new(),
            tls: None,
        }
    }

    pub fn ok(body: impl Into<Vec<u8>>) -> Self {
        Self {
            status: Status::ok(),
            headers: Vec::new(),
            body: body.into(),
            tls: None,
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

enum SinkKind {
    /// Unblocks a caller parked on the paired receiver.
    Latch(Sender<Response>),
    /// Invoked inline on the controller or worker thread.
    Callback(Box<dyn FnOnce(Response) + Send + 'static>),
}

/// Exactly-once completion handle for an exchange.
///
/// Every request accepted by the connector carries one of these, and every
/// code path that finishes the exchange (response parsed, connect failure,
/// forced close, controller shutdown) resolves it exactly once. Resolving
/// twice is a bug; the second resolution is dropped with a warning instead
/// of reaching the caller.
pub struct ResponseSink {
    inner: Option<SinkKind>,
}

impl ResponseSink {
    /// A sink that unblocks a synchronous caller through the returned
    /// receiver. Dropping the sink unresolved makes `recv()` fail rather
    /// than hang.
    pub fn latch() -> (Self, Receiver<Response>) {
        let (tx, rx) = channel();
        (
            Self {
                inner: Some(SinkKind::Latch(tx)),
            },
            rx,
        )
    }

    pub fn callback(f: impl FnOnce(Response) + Send + 'static) -> Self {
        Self {
            inner: Some(SinkKind::Callback(Box::new(f))),
        }
    }

    /// Delivers the response. Subsequent calls are no-ops.
    pub fn resolve(&mut self, response: Response) {
        match self.inner.take() {
            Some(SinkKind::Latch(tx)) => {
                // The caller may have given up waiting; that is not an error.
                let _ = tx.send(response);
            }
            Some(SinkKind::Callback(f)) => f(response),
            None => {
                warn!(
                    status = response.status.code,
                    "dropping duplicate resolution of an exchange"
                );
            }
        }
    }

    pub fn is_resolved(&self) -> bool {
        self.inner.is_none()
    }
}

impl fmt::Debug for ResponseSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResponseSink")
            .field("resolved", &self.is_resolved())
            .finish()
    }
}

/// A request paired with its completion sink, owned by a connection's
/// outbound way until the response (or a connector error) resolves it.
#[derive(Debug)]
pub struct Exchange {
    pub request: Request,
    pub sink: ResponseSink,
}

impl Exchange {
    pub fn new(request: Request, sink: ResponseSink) -> Self {
        Self { request, sink }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn latch_sink_unblocks_receiver_once() {
        let (mut sink, rx) = ResponseSink::latch();
        assert!(!sink.is_resolved());
        sink.resolve(Response::ok("first"));
        assert!(sink.is_resolved());
        sink.resolve(Response::ok("second"));
        assert_eq!(rx.recv().unwrap().body, b"first");
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn callback_sink_fires_exactly_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = calls.clone();
        let mut sink = ResponseSink::callback(move |resp| {
            assert_eq!(resp.status.code, 1001);
            seen.fetch_add(1, Ordering::SeqCst);
        });
        sink.resolve(Response::new(Status::connector_error_communication(
            "peer reset",
        )));
        sink.resolve(Response::ok(""));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn dropped_latch_fails_recv_instead_of_hanging() {
        let (sink, rx) = ResponseSink::latch();
        drop(sink);
        assert!(rx.recv().is_err());
    }

    #[test]
    fn connector_error_codes_are_out_of_band() {
        assert!(Status::connector_error_connection("x").is_connector_error());
        assert!(Status::connector_error_communication("x").is_connector_error());
        assert!(Status::connector_error_internal("x").is_connector_error());
        assert!(!Status::ok().is_connector_error());
    }

    #[test]
    fn effective_port_falls_back_to_scheme_default() {
        let req = Request::get(Scheme::Https, "example.com", "/");
        assert_eq!(req.effective_port(), 443);
        assert_eq!(req.clone().with_port(8443).effective_port(), 8443);
    }
}
