//! The connection controller: a mio `Poll` with a waker, plus the control
//! channel other threads use to hand work to the controller thread.
//!
//! All sockets are owned and driven by the single controller thread; the
//! only cross-thread traffic is `ControlRequest`s through the channel,
//! made visible by a waker nudge.

use std::io;
use std::net::SocketAddr;
use std::sync::mpsc::{channel, Receiver, Sender, TryRecvError};
use std::sync::Arc;
use std::time::Duration;

use mio::event::Source;
use mio::{Events, Interest, Poll, Token, Waker};
use tracing::warn;

use crate::error::Error;
use crate::message::{Exchange, Response};

/// Token reserved for the waker. Connections and listeners get tokens
/// from [`crate::helper::FIRST_CONNECTION_TOKEN`] up.
pub(crate) const WAKE_TOKEN: Token = Token(0);

/// Work handed to the controller thread.
pub(crate) enum ControlRequest {
    /// Client: route a request to the best connection.
    Outbound(Exchange),
    /// Server: a handler finished; queue its response.
    ServerResponse { token: usize, response: Response },
    /// A delegated TLS task batch completed; resume the handshake.
    TaskDone { token: usize },
    /// A delegated TLS task failed; force-close the connection.
    TaskFailed { token: usize, error: Error },
    /// Server: open a listener and report its local address.
    Listen {
        addr: SocketAddr,
        reply: Sender<Result<(usize, SocketAddr), Error>>,
    },
    /// Shut the controller down, draining first when graceful.
    Stop { graceful: bool },
}

/// Cloneable sender half, held by `Client`/`Server` handles and by worker
/// jobs that report back.
#[derive(Clone)]
pub(crate) struct ControlHandle {
    sender: Sender<ControlRequest>,
    waker: Arc<Waker>,
}

impl ControlHandle {
    /// Sends a request and wakes the controller. When the controller
    /// thread has exited the request is handed back so the caller can
    /// resolve its completion sink.
    pub(crate) fn send(&self, request: ControlRequest) -> Result<(), ControlRequest> {
        match self.sender.send(request) {
            Ok(()) => {
                if let Err(e) = self.waker.wake() {
                    // Poll gone means the controller is gone; the queued
                    // request's latch will error out, not hang.
                    warn!(error = %e, "failed to wake controller");
                }
                Ok(())
            }
            Err(e) => Err(e.0),
        }
    }
}

pub(crate) struct ConnectionController {
    poll: Poll,
    waker: Arc<Waker>,
    sender: Sender<ControlRequest>,
    receiver: Receiver<ControlRequest>,
}

impl ConnectionController {
    pub(crate) fn new() -> Result<Self, Error> {
        let poll = Poll::new()?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKE_TOKEN)?);
        let (sender, receiver) = channel();
        Ok(Self {
            poll,
            waker,
            sender,
            receiver,
        })
    }

    pub(crate) fn handle(&self) -> ControlHandle {
        ControlHandle {
            sender: self.sender.clone(),
            waker: Arc::clone(&self.waker),
        }
    }

    pub(crate) fn register(
        &self,
        source: &mut impl Source,
        token: usize,
        interest: Interest,
    ) -> Result<(), Error> {
        self.poll.registry().register(source, Token(token), interest)?;
        Ok(())
    }

    pub(crate) fn reregister(
        &self,
        source: &mut impl Source,
        token: usize,
        interest: Interest,
    ) -> Result<(), Error> {
        self.poll
            .registry()
            .reregister(source, Token(token), interest)?;
        Ok(())
    }

    pub(crate) fn deregister(&self, source: &mut impl Source) -> Result<(), Error> {
        self.poll.registry().deregister(source)?;
        Ok(())
    }

    /// Blocks for readiness events, retrying interrupted polls.
    pub(crate) fn poll(
        &mut self,
        events: &mut Events,
        timeout: Option<Duration>,
    ) -> Result<(), Error> {
        loop {
            match self.poll.poll(events, timeout) {
                Ok(()) => return Ok(()),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Takes every control request currently queued.
    pub(crate) fn drain_requests(&mut self) -> Vec<ControlRequest> {
        let mut requests = Vec::new();
        loop {
            match self.receiver.try_recv() {
                Ok(request) => requests.push(request),
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    // Cannot happen while self.sender is alive.
                    warn!("control channel disconnected");
                    break;
                }
            }
        }
        requests
    }
}
