//! Readable and writable SSL channels.
//!
//! A TLS connection stages ciphertext in these channels: the readable
//! channel moves socket bytes into the engine's `unwrap`, the writable
//! channel moves `wrap` output to the socket. Both convert every engine
//! result into a way directive through the connection's [`SslMachine`].

use std::io;

use crate::buffer::Buffer;
use crate::error::Error;
use crate::tls::engine::TlsEngine;
use crate::tls::machine::{SslDirective, SslMachine};

/// Socket read chunk per fill. TLS records are at most 16 KiB plus
/// framing, so one chunk usually holds at least one complete record.
const RECORD_CHUNK: usize = 18 * 1024;

#[derive(Debug)]
pub(crate) struct ReadOutcome {
    /// Plaintext bytes appended to the destination.
    pub produced: usize,
    pub directive: SslDirective,
    /// The socket reported end of stream.
    pub socket_eof: bool,
}

#[derive(Debug)]
pub(crate) struct WriteOutcome {
    /// Application bytes accepted by the engine.
    pub consumed: usize,
    pub directive: SslDirective,
    /// All staged ciphertext reached the socket.
    pub flushed: bool,
}

/// Inbound half: socket ciphertext in, plaintext out.
pub(crate) struct ReadableSslChannel {
    packet: Buffer,
}

impl ReadableSslChannel {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            packet: Buffer::with_capacity(capacity),
        }
    }

    /// Drains the socket into the packet buffer, then unwraps as much as
    /// the engine will take. Plaintext is appended to `plaintext`.
    pub(crate) fn read(
        &mut self,
        stream: &mut impl io::Read,
        engine: &mut dyn TlsEngine,
        machine: &mut SslMachine,
        client_side: bool,
        plaintext: &mut Vec<u8>,
    ) -> Result<ReadOutcome, Error> {
        let mut socket_eof = false;
        loop {
            match self.packet.fill_from(stream, RECORD_CHUNK) {
                Ok(0) => {
                    socket_eof = true;
                    break;
                }
                Ok(_) => continue,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }

        let mut produced = 0;
        let mut directive;
        loop {
            let before = self.packet.len();
            let result = engine.unwrap(&mut self.packet, plaintext)?;
            produced += result.produced;
            directive = machine.handle_result(&result, client_side);
            let progressed = self.packet.len() < before;
            match directive {
                // Scripted engines may take one record per call; keep
                // feeding while the call consumes bytes.
                SslDirective::Proceed | SslDirective::FlipToUnwrap
                    if progressed && !self.packet.is_empty() =>
                {
                    continue
                }
                _ => break,
            }
        }

        // EOF without close_notify: nothing more can arrive, so a machine
        // that still expects peer bytes is done for.
        if socket_eof && !machine.is_closed() && self.packet.is_empty() {
            machine.close();
            directive = SslDirective::Close;
        }

        Ok(ReadOutcome {
            produced,
            directive,
            socket_eof,
        })
    }
}

/// Outbound half: plaintext in, socket ciphertext out.
pub(crate) struct WritableSslChannel {
    packet: Buffer,
}

impl WritableSslChannel {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            packet: Buffer::with_capacity(capacity),
        }
    }

    /// Wraps pending application bytes (and handshake records), then
    /// drains the staged ciphertext to the socket. Ciphertext the socket
    /// does not accept stays staged; the caller keeps write interest
    /// until `flushed` is reported.
    pub(crate) fn write(
        &mut self,
        stream: &mut impl io::Write,
        engine: &mut dyn TlsEngine,
        machine: &mut SslMachine,
        client_side: bool,
        application: &mut Buffer,
    ) -> Result<WriteOutcome, Error> {
        let mut consumed = 0;
        let mut directive;
        loop {
            let result = engine.wrap(application, &mut self.packet)?;
            consumed += result.consumed;
            directive = machine.handle_result(&result, client_side);
            if result.consumed == 0 && result.produced == 0 {
                break;
            }
            if !matches!(directive, SslDirective::Proceed | SslDirective::FlipToWrap) {
                break;
            }
            if application.is_empty() && !engine.wants_write() {
                break;
            }
        }

        loop {
            if self.packet.is_empty() {
                break;
            }
            match self.packet.drain_to(stream) {
                Ok(0) => break,
                Ok(_) => continue,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }

        Ok(WriteOutcome {
            consumed,
            directive,
            flushed: self.packet.is_empty(),
        })
    }

    pub(crate) fn has_staged(&self) -> bool {
        !self.packet.is_empty()
    }
}
