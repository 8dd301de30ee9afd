use thiserror::Error;

/// The error type for netway operations.
///
/// This encompasses all errors that can occur when running a connector,
/// including socket operations, HTTP framing, and TLS.
///
/// Most errors are unrecoverable for the connection they occur on and are
/// handled by closing it; pending callers are unblocked with a connector-error
/// status rather than a panic or a hang.
#[derive(Error, Debug)]
pub enum Error {
    // ============================================================================
    // I/O and Networking Errors
    // ============================================================================

    /// Low-level I/O error from the operating system.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The request target could not be resolved to a socket address.
    #[error("Failed to resolve {host}:{port}")]
    HostResolution {
        /// The host name that failed to resolve.
        host: String,
        /// The port the resolution was attempted for.
        port: u16,
    },

    /// The connecting socket reported a failure when writability fired.
    #[error("Connect failed: {0}")]
    ConnectFailed(String),

    /// The connect deadline elapsed before the socket became writable.
    #[error("Connect timed out after {elapsed_ms} ms")]
    ConnectTimeout { elapsed_ms: u64 },

    /// Every connection to the target is busy and the configured ceilings
    /// block opening another one.
    #[error("Connection capacity reached for {0}")]
    CapacityReached(String),

    // ============================================================================
    // HTTP Framing Errors
    // ============================================================================

    /// Received bytes that do not form a valid HTTP/1.1 message head.
    #[error("Malformed HTTP message: {0}")]
    HttpParse(String),

    /// A message head grew past the inbound buffer limit without terminating.
    #[error("HTTP message head exceeds {limit} bytes")]
    HttpHeadTooLarge { limit: usize },

    // ============================================================================
    // TLS Errors
    // ============================================================================

    /// Failed to load TLS certificate file from disk.
    #[error("Failed to load certificate from {path}: {source}")]
    TlsCertificateLoad {
        path: String,
        source: std::io::Error,
    },

    /// Failed to load TLS private key file from disk.
    #[error("Failed to load private key from {path}: {source}")]
    TlsKeyLoad {
        path: String,
        source: std::io::Error,
    },

    /// Certificate file format is invalid or unsupported.
    #[error("Invalid certificate format: {0}")]
    TlsInvalidCertificate(String),

    /// Private key file format is invalid or unsupported.
    #[error("Invalid private key format: {0}")]
    TlsInvalidKey(String),

    /// Server name for TLS SNI is invalid.
    #[error("Invalid server name '{0}'")]
    TlsInvalidServerName(String),

    /// The TLS engine rejected peer data or the handshake failed.
    #[error("TLS protocol error: {0}")]
    TlsProtocol(String),

    /// Attempted to serve HTTPS but server TLS configuration is missing.
    ///
    /// An HTTPS server requires the `tls_server_cert` and `tls_server_key`
    /// configuration keys.
    #[error("TLS server configuration not provided - required for HTTPS")]
    TlsServerConfigMissing,

    /// Attempted an HTTPS request but client TLS configuration is missing.
    #[error("TLS client configuration not provided - required for HTTPS")]
    TlsClientConfigMissing,

    /// Failed to build TLS server configuration from provided settings.
    #[error("Failed to build TLS server config: {0}")]
    TlsServerConfigBuild(String),

    /// Failed to build TLS client configuration from provided settings.
    #[error("Failed to build TLS client config: {0}")]
    TlsClientConfigBuild(String),

    // ============================================================================
    // Configuration and Lifecycle Errors
    // ============================================================================

    /// Configuration file parsing or key lookup failed.
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    /// A configuration key held a value outside its documented range.
    #[error("Invalid value for '{key}': {message}")]
    InvalidConfigValue { key: String, message: String },

    /// The controller thread is no longer running.
    ///
    /// Calls made after `stop()`, or after the controller exited on an
    /// unrecoverable poll error, fail with this.
    #[error("Connection controller is not running")]
    ControllerStopped,
}
