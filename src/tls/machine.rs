use std::fmt;

use tracing::{debug, error};

use crate::tls::engine::{EngineResult, EngineStatus, HandshakeStatus};

/// State of the SSL layer of one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SslState {
    /// No engine attached yet (plain connection, or pooled and cleared).
    Idle,
    /// Engine created, transport not yet established.
    Created,
    Handshaking,
    ReadingApplicationData,
    WritingApplicationData,
    Closed,
}

impl SslState {
    pub fn can_transition(self, to: SslState) -> bool {
        use SslState::*;
        if self == to {
            return true;
        }
        match (self, to) {
            (Idle, Created) => true,
            (Created, Handshaking) => true,
            // Application data states are only reachable through the
            // handshake, and flow freely between each other afterwards
            // (including back into Handshaking on renegotiation).
            (Handshaking, ReadingApplicationData) | (Handshaking, WritingApplicationData) => true,
            (ReadingApplicationData, WritingApplicationData)
            | (WritingApplicationData, ReadingApplicationData) => true,
            (ReadingApplicationData, Handshaking) | (WritingApplicationData, Handshaking) => true,
            (_, Closed) => true,
            (Closed, Idle) => true,
            _ => false,
        }
    }
}

impl fmt::Display for SslState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SslState::Idle => "IDLE",
            SslState::Created => "CREATED",
            SslState::Handshaking => "HANDSHAKING",
            SslState::ReadingApplicationData => "READING_APPLICATION_DATA",
            SslState::WritingApplicationData => "WRITING_APPLICATION_DATA",
            SslState::Closed => "CLOSED",
        };
        f.write_str(name)
    }
}

/// What the connection must do with its ways after an engine call,
/// derived from the engine result by [`SslMachine::handle_result`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SslDirective {
    /// Keep driving the current direction.
    Proceed,
    /// Not enough peer bytes; register inbound interest and wait.
    AwaitUnwrap,
    /// The engine has records to send; drive the outbound side.
    FlipToWrap,
    /// The engine needs peer records; drive the inbound side.
    FlipToUnwrap,
    /// Suspend both ways and run the delegated tasks on the worker pool.
    RunTasks,
    /// Handshake complete; resume application traffic.
    HandshakeFinished,
    /// The engine closed; close the connection.
    Close,
}

/// Tracks the SSL state of a connection and converts engine results into
/// way directives. One instance per TLS connection, owned alongside the
/// engine and reset when the connection returns to the pool.
#[derive(Debug)]
pub struct SslMachine {
    state: SslState,
}

impl SslMachine {
    pub fn new() -> Self {
        Self {
            state: SslState::Idle,
        }
    }

    pub fn state(&self) -> SslState {
        self.state
    }

    pub fn is_closed(&self) -> bool {
        self.state == SslState::Closed
    }

    pub fn is_handshaking(&self) -> bool {
        matches!(self.state, SslState::Created | SslState::Handshaking)
    }

    /// Applies a transition against the table. Illegal transitions panic
    /// in debug builds and are refused (with an error log) in release.
    pub fn set_state(&mut self, to: SslState) -> bool {
        if self.state.can_transition(to) {
            if self.state != to {
                debug!(from = %self.state, to = %to, "ssl state");
            }
            self.state = to;
            true
        } else {
            debug_assert!(false, "illegal ssl transition {} -> {}", self.state, to);
            error!("illegal ssl transition {} -> {}", self.state, to);
            false
        }
    }

    pub fn engine_created(&mut self) {
        self.set_state(SslState::Created);
    }

    pub fn handshake_started(&mut self) {
        self.set_state(SslState::Handshaking);
    }

    pub fn close(&mut self) {
        self.set_state(SslState::Closed);
    }

    /// Central dispatch over an engine result.
    ///
    /// `client_side` decides which way wakes up first once the handshake
    /// finishes: the client has a request to wrap, the server waits to
    /// unwrap one.
    pub fn handle_result(&mut self, result: &EngineResult, client_side: bool) -> SslDirective {
        match result.status {
            EngineStatus::BufferUnderflow => {
                if result.handshake == HandshakeStatus::NeedUnwrap {
                    SslDirective::AwaitUnwrap
                } else {
                    SslDirective::Proceed
                }
            }
            EngineStatus::BufferOverflow => {
                // The channels drain their buffers before every call, so an
                // overflow that reaches this point cannot resolve itself.
                error!(state = %self.state, "unresolvable TLS buffer overflow");
                self.close();
                SslDirective::Close
            }
            EngineStatus::Closed => {
                self.close();
                SslDirective::Close
            }
            EngineStatus::Ok => self.handle_handshake(result.handshake, client_side),
        }
    }

    fn handle_handshake(
        &mut self,
        handshake: HandshakeStatus,
        client_side: bool,
    ) -> SslDirective {
        match handshake {
            HandshakeStatus::NotHandshaking => SslDirective::Proceed,
            HandshakeStatus::NeedTask => SslDirective::RunTasks,
            HandshakeStatus::NeedWrap => {
                self.set_state(SslState::Handshaking);
                SslDirective::FlipToWrap
            }
            HandshakeStatus::NeedUnwrap => {
                self.set_state(SslState::Handshaking);
                SslDirective::FlipToUnwrap
            }
            HandshakeStatus::Finished => {
                let next = if client_side {
                    SslState::WritingApplicationData
                } else {
                    SslState::ReadingApplicationData
                };
                self.set_state(next);
                SslDirective::HandshakeFinished
            }
        }
    }
}

impl Default for SslMachine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(status: EngineStatus, handshake: HandshakeStatus) -> EngineResult {
        EngineResult {
            status,
            handshake,
            consumed: 0,
            produced: 0,
        }
    }

    fn handshaking_machine() -> SslMachine {
        let mut machine = SslMachine::new();
        machine.engine_created();
        machine.handshake_started();
        machine
    }

    #[test]
    fn transition_table_rejects_shortcuts() {
        use SslState::*;
        assert!(Idle.can_transition(Created));
        assert!(Created.can_transition(Handshaking));
        assert!(Handshaking.can_transition(ReadingApplicationData));
        assert!(ReadingApplicationData.can_transition(WritingApplicationData));
        assert!(WritingApplicationData.can_transition(Handshaking));
        assert!(Closed.can_transition(Idle));

        assert!(!Idle.can_transition(Handshaking));
        assert!(!Created.can_transition(ReadingApplicationData));
        assert!(!Closed.can_transition(Handshaking));
        assert!(!Idle.can_transition(ReadingApplicationData));
    }

    #[test]
    fn underflow_during_unwrap_awaits_more_data() {
        let mut machine = handshaking_machine();
        let directive = machine.handle_result(
            &result(EngineStatus::BufferUnderflow, HandshakeStatus::NeedUnwrap),
            true,
        );
        assert_eq!(directive, SslDirective::AwaitUnwrap);
        assert_eq!(machine.state(), SslState::Handshaking);
    }

    #[test]
    fn closed_engine_closes_the_machine() {
        let mut machine = handshaking_machine();
        let directive = machine.handle_result(
            &result(EngineStatus::Closed, HandshakeStatus::NeedUnwrap),
            true,
        );
        assert_eq!(directive, SslDirective::Close);
        assert!(machine.is_closed());
    }

    #[test]
    fn need_wrap_and_need_unwrap_flip_direction() {
        let mut machine = handshaking_machine();
        assert_eq!(
            machine.handle_result(&result(EngineStatus::Ok, HandshakeStatus::NeedWrap), true),
            SslDirective::FlipToWrap
        );
        assert_eq!(
            machine.handle_result(&result(EngineStatus::Ok, HandshakeStatus::NeedUnwrap), true),
            SslDirective::FlipToUnwrap
        );
        assert_eq!(machine.state(), SslState::Handshaking);
    }

    #[test]
    fn need_task_suspends_for_the_worker_pool() {
        let mut machine = handshaking_machine();
        assert_eq!(
            machine.handle_result(&result(EngineStatus::Ok, HandshakeStatus::NeedTask), true),
            SslDirective::RunTasks
        );
        assert_eq!(machine.state(), SslState::Handshaking);
    }

    #[test]
    fn finished_lands_on_the_side_specific_state() {
        let mut client = handshaking_machine();
        assert_eq!(
            client.handle_result(&result(EngineStatus::Ok, HandshakeStatus::Finished), true),
            SslDirective::HandshakeFinished
        );
        assert_eq!(client.state(), SslState::WritingApplicationData);

        let mut server = handshaking_machine();
        server.handle_result(&result(EngineStatus::Ok, HandshakeStatus::Finished), false);
        assert_eq!(server.state(), SslState::ReadingApplicationData);
    }

    #[test]
    fn closed_machine_can_return_to_idle() {
        let mut machine = handshaking_machine();
        machine.close();
        assert!(machine.set_state(SslState::Idle));
        assert_eq!(machine.state(), SslState::Idle);
    }
}
