//! Netway - a non-blocking HTTP(S) connection engine for Rust
//!
//! Netway drives pooled client and server connections from a single
//! controller thread over a mio poll loop. TLS runs sans-io through
//! rustls, request handlers and delegated crypto tasks run on a worker
//! pool, and synchronous callers park on latches the controller resolves
//! exactly once. Connector failures come back as responses with the
//! reserved status codes 1000 (connection), 1001 (communication) and
//! 1002 (internal).

// Internal-only modules
pub(crate) mod buffer;
pub(crate) mod config;
pub(crate) mod connection;
pub(crate) mod controller;
pub(crate) mod error;
pub(crate) mod helper;
pub(crate) mod http;
pub(crate) mod message;
pub(crate) mod pool;
pub(crate) mod state;
pub(crate) mod tls;
pub(crate) mod way;
pub(crate) mod workers;

// These are the intended public API
pub use config::ConnectorOptions;
pub use error::Error;
pub use helper::{Client, Server};
pub use message::{Request, Response, Scheme, Status};
pub use tls::TlsInfo;

/// Convenient re-exports of commonly used types.
pub mod prelude {
    pub use crate::config::ConnectorOptions;
    pub use crate::error::Error;
    pub use crate::helper::{Client, Server};
    pub use crate::message::{Request, Response, Scheme, Status};
    pub use crate::tls::TlsInfo;
}
