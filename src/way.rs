//! Inbound and outbound ways.
//!
//! Each connection has one way per direction. A way owns its readiness
//! state, its plaintext buffer, and the message bookkeeping for its
//! direction: the outbound way serializes queued messages, the inbound
//! way parses arrived bytes and matches responses to in-flight exchanges
//! strictly first-in first-out.

use std::collections::VecDeque;

use tracing::debug;

use crate::buffer::Buffer;
use crate::error::Error;
use crate::http;
use crate::message::{Exchange, Request, Response, Scheme, Status};
use crate::state::{transition, IoState};
use crate::tls::TlsInfo;

/// A message queued for the wire: a client request with its sink, or a
/// server response.
#[derive(Debug)]
pub(crate) enum OutboundMessage {
    Request(Exchange),
    Response(Response),
}

pub(crate) struct OutboundWay {
    io_state: IoState,
    buffer: Buffer,
    queued: VecDeque<OutboundMessage>,
    /// The message whose bytes sit in `buffer`.
    current: Option<OutboundMessage>,
}

impl OutboundWay {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            io_state: IoState::Idle,
            buffer: Buffer::with_capacity(capacity),
            queued: VecDeque::new(),
            current: None,
        }
    }

    pub(crate) fn io_state(&self) -> IoState {
        self.io_state
    }

    pub(crate) fn set_io_state(&mut self, to: IoState) {
        transition(&mut self.io_state, to, "outbound way");
    }

    pub(crate) fn enqueue(&mut self, message: OutboundMessage) {
        self.queued.push_back(message);
        if self.io_state == IoState::Idle {
            self.set_io_state(IoState::Interest);
        }
    }

    /// Serializes the next queued message once the previous one has fully
    /// left the buffer. `can_start_next` gates pipelining: without it a
    /// new message is only started when the caller says the line is free.
    pub(crate) fn fill(&mut self, can_start_next: bool) {
        if self.current.is_some() || !self.buffer.is_empty() || !can_start_next {
            return;
        }
        if let Some(message) = self.queued.pop_front() {
            match &message {
                OutboundMessage::Request(exchange) => {
                    http::write_request(&exchange.request, &mut self.buffer)
                }
                OutboundMessage::Response(response) => {
                    http::write_response(response, &mut self.buffer)
                }
            }
            self.current = Some(message);
        }
    }

    pub(crate) fn buffer_mut(&mut self) -> &mut Buffer {
        &mut self.buffer
    }

    /// Returns the current message once all its bytes have been accepted
    /// by the channel below.
    pub(crate) fn take_completed(&mut self) -> Option<OutboundMessage> {
        if self.buffer.is_empty() {
            self.current.take()
        } else {
            None
        }
    }

    /// Messages queued or mid-write.
    pub(crate) fn load(&self) -> usize {
        self.queued.len() + usize::from(self.current.is_some())
    }

    pub(crate) fn is_drained(&self) -> bool {
        self.queued.is_empty() && self.current.is_none() && self.buffer.is_empty()
    }

    /// Resolves every queued and in-progress request with `status` and
    /// drops pending responses. Used on forced close.
    pub(crate) fn fail_all(&mut self, status: &Status) {
        for message in self
            .queued
            .drain(..)
            .chain(self.current.take().into_iter())
        {
            if let OutboundMessage::Request(mut exchange) = message {
                exchange.sink.resolve(Response::new(status.clone()));
            }
        }
        self.buffer.clear();
    }

    /// Clears the way for pool reuse, keeping buffer allocations.
    pub(crate) fn clear(&mut self) {
        debug_assert!(self.queued.is_empty() && self.current.is_none());
        self.queued.clear();
        self.current = None;
        self.buffer.clear();
        self.io_state = IoState::Idle;
    }
}

pub(crate) struct InboundWay {
    io_state: IoState,
    buffer: Buffer,
    /// Client exchanges whose requests are on the wire, in send order.
    in_flight: VecDeque<Exchange>,
    eof: bool,
}

impl InboundWay {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            io_state: IoState::Idle,
            buffer: Buffer::with_capacity(capacity),
            in_flight: VecDeque::new(),
            eof: false,
        }
    }

    pub(crate) fn io_state(&self) -> IoState {
        self.io_state
    }

    pub(crate) fn set_io_state(&mut self, to: IoState) {
        transition(&mut self.io_state, to, "inbound way");
    }

    pub(crate) fn buffer_mut(&mut self) -> &mut Buffer {
        &mut self.buffer
    }

    pub(crate) fn append(&mut self, bytes: &[u8]) {
        self.buffer.write(bytes);
    }

    pub(crate) fn push_in_flight(&mut self, exchange: Exchange) {
        self.in_flight.push_back(exchange);
    }

    pub(crate) fn in_flight_len(&self) -> usize {
        self.in_flight.len()
    }

    /// Marks that the peer's write side closed, which completes a
    /// close-delimited response body.
    pub(crate) fn mark_eof(&mut self) {
        self.eof = true;
    }

    /// Client side: parses complete responses and resolves in-flight
    /// exchanges in FIFO order. Informational responses are logged and
    /// skipped; a response with nothing in flight is a protocol violation.
    pub(crate) fn resolve_responses(&mut self, tls: Option<&TlsInfo>) -> Result<usize, Error> {
        let mut resolved = 0;
        loop {
            match http::parse_response(self.buffer.peek(), self.eof)? {
                Some((mut response, consumed)) => {
                    self.buffer.consume(consumed);
                    if response.status.is_informational() {
                        debug!(status = response.status.code, "skipping interim response");
                        continue;
                    }
                    let Some(mut exchange) = self.in_flight.pop_front() else {
                        return Err(Error::HttpParse(
                            "response received with no request in flight".into(),
                        ));
                    };
                    response.tls = tls.cloned();
                    exchange.sink.resolve(response);
                    resolved += 1;
                }
                None => break,
            }
        }
        Ok(resolved)
    }

    /// Server side: parses up to `max` complete requests. `secure`
    /// upgrades the scheme for requests that arrived over TLS.
    pub(crate) fn parse_requests(
        &mut self,
        secure: bool,
        max: usize,
    ) -> Result<Vec<Request>, Error> {
        let mut requests = Vec::new();
        while requests.len() < max {
            match http::parse_request(self.buffer.peek())? {
                Some((mut request, consumed)) => {
                    self.buffer.consume(consumed);
                    if secure {
                        request.scheme = Scheme::Https;
                    }
                    requests.push(request);
                }
                None => break,
            }
        }
        Ok(requests)
    }

    /// Resolves every in-flight exchange with `status`. Used on forced
    /// close and on controller shutdown.
    pub(crate) fn fail_in_flight(&mut self, status: &Status) {
        for mut exchange in self.in_flight.drain(..) {
            exchange.sink.resolve(Response::new(status.clone()));
        }
    }

    pub(crate) fn clear(&mut self) {
        debug_assert!(self.in_flight.is_empty());
        self.in_flight.clear();
        self.buffer.clear();
        self.io_state = IoState::Idle;
        self.eof = false;
    }
}
