use std::fmt;

use tracing::error;

/// Lifecycle of a connection's transport socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Socket created, connect or accept not yet completed.
    Opening,
    /// Transport established, exchanges may flow.
    Open,
    /// Graceful close requested, draining pending exchanges.
    Closing,
    /// Socket released. A pooled connection is reopened from here.
    Closed,
}

impl ConnectionState {
    /// Closed transition table. Anything not listed is a programming error.
    pub fn can_transition(self, to: ConnectionState) -> bool {
        use ConnectionState::*;
        matches!(
            (self, to),
            (Opening, Open)
                | (Opening, Closed)
                | (Open, Closing)
                | (Open, Closed)
                | (Closing, Closed)
                | (Closed, Opening)
        ) || self == to
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Opening => "OPENING",
            ConnectionState::Open => "OPEN",
            ConnectionState::Closing => "CLOSING",
            ConnectionState::Closed => "CLOSED",
        };
        f.write_str(name)
    }
}

/// Readiness state of one way (inbound or outbound) of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoState {
    /// Not registered for events and not processing.
    Idle,
    /// Registered interest with the controller, waiting for readiness.
    Interest,
    /// Readiness reported, work pending.
    Ready,
    /// Actively reading or writing on the controller thread.
    Processing,
}

impl IoState {
    /// Closed transition table. `Processing` is only entered from `Ready`;
    /// every state may fall back to `Idle` or re-arm to `Interest`.
    pub fn can_transition(self, to: IoState) -> bool {
        use IoState::*;
        if self == to {
            return true;
        }
        match (self, to) {
            (_, Processing) => self == Ready,
            (_, Idle) | (_, Interest) | (_, Ready) => true,
        }
    }
}

impl fmt::Display for IoState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            IoState::Idle => "IDLE",
            IoState::Interest => "INTEREST",
            IoState::Ready => "READY",
            IoState::Processing => "PROCESSING",
        };
        f.write_str(name)
    }
}

/// Applies a transition against the table.
///
/// Illegal transitions panic in debug builds; in release they are logged
/// and refused so the state machine never goes off-table.
pub(crate) fn transition<S>(current: &mut S, to: S, what: &str) -> bool
where
    S: Copy + PartialEq + fmt::Display + Transitions,
{
    if current.allows(to) {
        *current = to;
        true
    } else {
        debug_assert!(false, "illegal {what} transition {current} -> {to}");
        error!("illegal {} transition {} -> {}", what, current, to);
        false
    }
}

pub(crate) trait Transitions {
    fn allows(&self, to: Self) -> bool;
}

impl Transitions for ConnectionState {
    fn allows(&self, to: Self) -> bool {
        self.can_transition(to)
    }
}

impl Transitions for IoState {
    fn allows(&self, to: Self) -> bool {
        self.can_transition(to)
    }
}
