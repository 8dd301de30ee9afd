//! The TLS engine seam.
//!
//! The connection code never talks to rustls directly; it drives a
//! [`TlsEngine`] through `wrap`/`unwrap` calls and reacts to the combined
//! engine/handshake status the call reports. This keeps the SSL state
//! machine testable with a scripted engine and keeps rustls confined to
//! one adapter.

use std::io::{self, Read, Write};
use std::sync::Arc;

use rustls::pki_types::ServerName;
use rustls::{ClientConfig, ClientConnection, ServerConfig, ServerConnection};
use tracing::trace;

use crate::buffer::Buffer;
use crate::error::Error;
use crate::tls::TlsInfo;

/// Result status of a single wrap or unwrap call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineStatus {
    /// The call made progress.
    Ok,
    /// The destination buffer cannot hold the produced bytes; drain it and
    /// retry before treating the condition as fatal.
    BufferOverflow,
    /// Not enough source bytes to form a complete TLS record.
    BufferUnderflow,
    /// The engine is closed; no further application data will flow.
    Closed,
}

/// What the handshake needs next, reported alongside every engine result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeStatus {
    NotHandshaking,
    /// The engine has records to emit; drive the outbound side.
    NeedWrap,
    /// The engine needs peer records; drive the inbound side.
    NeedUnwrap,
    /// A long-running crypto task must run off the controller thread.
    NeedTask,
    /// The handshake completed during this call.
    Finished,
}

/// Outcome of one wrap or unwrap call.
#[derive(Debug, Clone, Copy)]
pub struct EngineResult {
    pub status: EngineStatus,
    pub handshake: HandshakeStatus,
    /// Source bytes consumed by this call.
    pub consumed: usize,
    /// Destination bytes produced by this call.
    pub produced: usize,
}

/// A deferred crypto computation, run on the worker pool while both ways
/// of the owning connection sit idle.
pub type DelegatedTask = Box<dyn FnOnce() -> Result<(), Error> + Send + 'static>;

/// Record-level TLS engine driven by the connection's SSL channels.
pub trait TlsEngine: Send {
    /// Decrypts records from `packet` into `plaintext`.
    fn unwrap(&mut self, packet: &mut Buffer, plaintext: &mut Vec<u8>)
        -> Result<EngineResult, Error>;

    /// Encrypts application bytes from `application` (and any pending
    /// handshake records) into `packet`.
    fn wrap(&mut self, application: &mut Buffer, packet: &mut Buffer)
        -> Result<EngineResult, Error>;

    /// Takes the next delegated task, if the engine reported `NeedTask`.
    /// Call until `None` before resuming the handshake.
    fn take_delegated_task(&mut self) -> Option<DelegatedTask>;

    fn is_handshaking(&self) -> bool;

    /// Whether the engine holds records waiting to be wrapped.
    fn wants_write(&self) -> bool;

    /// Session properties; `None` until the handshake completes.
    fn session_info(&self) -> Option<TlsInfo>;

    /// Queues a close_notify alert for the next wrap.
    fn send_close_notify(&mut self);
}

/// rustls-backed engine.
///
/// rustls runs its crypto inline, so this adapter never reports
/// `NeedTask`, and its destination buffers grow on demand, so it never
/// reports `BufferOverflow` either. Both paths stay live in the trait for
/// engines that do.
pub(crate) enum RustlsEngine {
    Client(ClientConnection),
    Server(ServerConnection),
}

impl RustlsEngine {
    pub(crate) fn client(
        config: Arc<ClientConfig>,
        server_name: ServerName<'static>,
    ) -> Result<Self, Error> {
        let conn = ClientConnection::new(config, server_name)
            .map_err(|e| Error::TlsClientConfigBuild(e.to_string()))?;
        Ok(Self::Client(conn))
    }

    pub(crate) fn server(config: Arc<ServerConfig>) -> Result<Self, Error> {
        let conn = ServerConnection::new(config)
            .map_err(|e| Error::TlsServerConfigBuild(e.to_string()))?;
        Ok(Self::Server(conn))
    }

    fn read_tls(&mut self, source: &mut dyn io::Read) -> io::Result<usize> {
        match self {
            Self::Client(c) => c.read_tls(source),
            Self::Server(c) => c.read_tls(source),
        }
    }

    fn write_tls(&mut self, sink: &mut dyn io::Write) -> io::Result<usize> {
        match self {
            Self::Client(c) => c.write_tls(sink),
            Self::Server(c) => c.write_tls(sink),
        }
    }

    fn process_new_packets(&mut self) -> Result<rustls::IoState, rustls::Error> {
        match self {
            Self::Client(c) => c.process_new_packets(),
            Self::Server(c) => c.process_new_packets(),
        }
    }

    fn read_plaintext(&mut self, out: &mut Vec<u8>) -> usize {
        let mut total = 0;
        let mut chunk = [0u8; 4096];
        loop {
            let read = match self {
                Self::Client(c) => c.reader().read(&mut chunk),
                Self::Server(c) => c.reader().read(&mut chunk),
            };
            match read {
                Ok(0) => break,
                Ok(n) => {
                    out.extend_from_slice(&chunk[..n]);
                    total += n;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                // UnexpectedEof surfaces when the peer closed without a
                // close_notify; the status computation reports Closed.
                Err(_) => break,
            }
        }
        total
    }

    fn write_plaintext(&mut self, data: &[u8]) -> usize {
        // rustls' Writer buffers unboundedly and never errors.
        let written = match self {
            Self::Client(c) => c.writer().write(data),
            Self::Server(c) => c.writer().write(data),
        };
        written.unwrap_or(0)
    }

    fn handshake_status(&self, was_handshaking: bool) -> HandshakeStatus {
        if self.is_handshaking() {
            if self.wants_write() {
                HandshakeStatus::NeedWrap
            } else {
                HandshakeStatus::NeedUnwrap
            }
        } else if was_handshaking {
            HandshakeStatus::Finished
        } else {
            HandshakeStatus::NotHandshaking
        }
    }
}

impl TlsEngine for RustlsEngine {
    fn unwrap(
        &mut self,
        packet: &mut Buffer,
        plaintext: &mut Vec<u8>,
    ) -> Result<EngineResult, Error> {
        let was_handshaking = self.is_handshaking();
        let mut consumed = 0;
        let mut produced = 0;
        let mut peer_closed = false;

        while !packet.is_empty() {
            let mut cursor = io::Cursor::new(packet.peek());
            let fed = self.read_tls(&mut cursor)?;
            if fed == 0 {
                break;
            }
            packet.consume(fed);
            consumed += fed;

            let state = self
                .process_new_packets()
                .map_err(|e| Error::TlsProtocol(e.to_string()))?;
            produced += self.read_plaintext(plaintext);
            if state.peer_has_closed() {
                peer_closed = true;
                break;
            }
        }

        let status = if peer_closed {
            EngineStatus::Closed
        } else if consumed == 0 && produced == 0 && self.is_handshaking() && !self.wants_write() {
            // A partial record sits in the packet buffer (or it is empty);
            // more peer bytes are required before anything can happen.
            EngineStatus::BufferUnderflow
        } else {
            EngineStatus::Ok
        };
        let result = EngineResult {
            status,
            handshake: self.handshake_status(was_handshaking),
            consumed,
            produced,
        };
        trace!(?result.status, ?result.handshake, consumed, produced, "tls unwrap");
        Ok(result)
    }

    fn wrap(
        &mut self,
        application: &mut Buffer,
        packet: &mut Buffer,
    ) -> Result<EngineResult, Error> {
        let was_handshaking = self.is_handshaking();
        let mut consumed = 0;

        // Application data is only accepted once the handshake is done;
        // during the handshake this call just flushes pending records.
        if !self.is_handshaking() {
            while !application.is_empty() {
                let accepted = self.write_plaintext(application.peek());
                if accepted == 0 {
                    break;
                }
                application.consume(accepted);
                consumed += accepted;
            }
        }

        let mut produced = 0;
        while self.wants_write() {
            let mut staged = Vec::new();
            let emitted = self.write_tls(&mut staged)?;
            if emitted == 0 {
                break;
            }
            packet.write(&staged);
            produced += emitted;
        }

        let result = EngineResult {
            status: EngineStatus::Ok,
            handshake: self.handshake_status(was_handshaking),
            consumed,
            produced,
        };
        trace!(?result.status, ?result.handshake, consumed, produced, "tls wrap");
        Ok(result)
    }

    fn take_delegated_task(&mut self) -> Option<DelegatedTask> {
        None
    }

    fn is_handshaking(&self) -> bool {
        match self {
            Self::Client(c) => c.is_handshaking(),
            Self::Server(c) => c.is_handshaking(),
        }
    }

    fn wants_write(&self) -> bool {
        match self {
            Self::Client(c) => c.wants_write(),
            Self::Server(c) => c.wants_write(),
        }
    }

    fn session_info(&self) -> Option<TlsInfo> {
        if self.is_handshaking() {
            return None;
        }
        let (protocol_version, cipher_suite, alpn, certs, sni) = match self {
            Self::Client(c) => (
                c.protocol_version(),
                c.negotiated_cipher_suite(),
                c.alpn_protocol().map(|p| p.to_vec()),
                c.peer_certificates().map(|cs| cs.to_vec()),
                None,
            ),
            Self::Server(c) => (
                c.protocol_version(),
                c.negotiated_cipher_suite(),
                c.alpn_protocol().map(|p| p.to_vec()),
                c.peer_certificates().map(|cs| cs.to_vec()),
                c.server_name().map(|s| s.to_string()),
            ),
        };
        Some(TlsInfo {
            protocol_version,
            cipher_suite,
            alpn_protocol: alpn,
            sni_hostname: sni,
            peer_certificates: certs,
        })
    }

    fn send_close_notify(&mut self) {
        match self {
            Self::Client(c) => c.send_close_notify(),
            Self::Server(c) => c.send_close_notify(),
        }
    }
}
