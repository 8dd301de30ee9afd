//! TLS support: the engine abstraction over rustls, the SSL connection
//! state machine, and the readable/writable channels that sit between a
//! connection's ways and its socket.

pub(crate) mod channel;
mod config;
pub(crate) mod engine;
pub(crate) mod machine;

pub(crate) use config::{load_tls_client_config, load_tls_server_config, parse_server_name};
pub use engine::{EngineStatus, HandshakeStatus};

use rustls::pki_types::CertificateDer;
use rustls::{ProtocolVersion, SupportedCipherSuite};

/// Properties of a negotiated TLS session, exposed on requests and
/// responses that travelled over HTTPS.
#[derive(Debug, Clone)]
pub struct TlsInfo {
    pub protocol_version: Option<ProtocolVersion>,
    pub cipher_suite: Option<SupportedCipherSuite>,
    pub alpn_protocol: Option<Vec<u8>>,
    /// SNI host name, present on the server side only.
    pub sni_hostname: Option<String>,
    pub peer_certificates: Option<Vec<CertificateDer<'static>>>,
}
