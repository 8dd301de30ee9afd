use ::config::{Config, ConfigError};

use crate::error::Error;

pub(crate) fn get_namespaced_value<T, F>(
    config: &Config,
    name: &str,
    key: &str,
    getter: F,
) -> Result<T, ConfigError>
where
    F: Fn(&Config, &str) -> Result<T, ConfigError>,
{
    if name.is_empty() {
        getter(config, key)
    } else {
        getter(config, &format!("{name}.{key}")).or_else(|_| getter(config, key))
    }
}

pub(crate) fn get_namespaced_usize(
    config: &Config,
    name: &str,
    key: &str,
) -> Result<usize, ConfigError> {
    get_namespaced_value(config, name, key, |cfg, key| cfg.get::<usize>(key))
}

pub(crate) fn get_namespaced_i64(
    config: &Config,
    name: &str,
    key: &str,
) -> Result<i64, ConfigError> {
    get_namespaced_value(config, name, key, Config::get_int)
}

pub(crate) fn get_namespaced_u64(
    config: &Config,
    name: &str,
    key: &str,
) -> Result<u64, ConfigError> {
    get_namespaced_value(config, name, key, |cfg, key| cfg.get::<u64>(key))
}

pub(crate) fn get_namespaced_bool(
    config: &Config,
    name: &str,
    key: &str,
) -> Result<bool, ConfigError> {
    get_namespaced_value(config, name, key, Config::get_bool)
}

pub(crate) fn get_namespaced_string(
    config: &Config,
    name: &str,
    key: &str,
) -> Result<String, ConfigError> {
    get_namespaced_value(config, name, key, Config::get_string)
}

fn optional<T>(result: Result<T, ConfigError>) -> Result<Option<T>, ConfigError> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(ConfigError::NotFound(_)) => Ok(None),
        Err(e) => Err(e),
    }
}

/// Typed view over the connector's configuration surface.
///
/// Every key is read through the namespace fallback: `{name}.{key}` first
/// when the connector was given a name, then the bare `{key}`, then the
/// documented default. A missing key is never an error; a key of the wrong
/// type is.
#[derive(Debug, Clone)]
pub struct ConnectorOptions {
    /// Proxy host to route client requests through. No default.
    pub proxy_host: Option<String>,
    /// Proxy port, used when `proxy_host` is set. Default 3128.
    pub proxy_port: u16,
    /// Socket connect timeout in milliseconds. 0 disables the deadline.
    pub socket_connect_timeout_ms: u64,
    /// Ceiling on concurrent connections to one host address. -1 is unbounded.
    pub max_connections_per_host: i64,
    /// Ceiling on concurrent connections overall. -1 is unbounded.
    pub max_total_connections: i64,
    /// Number of cleared connections to preallocate in the pool. Default 100.
    pub initial_connections: usize,
    /// Keep connections open across exchanges. Default true.
    pub persisting_connections: bool,
    /// Allow several in-flight exchanges per connection. Default false.
    pub pipelining_connections: bool,
    /// Recycle closed connections through the pool. Default true.
    pub pooled_connections: bool,
    pub socket_keep_alive: bool,
    pub socket_no_delay: bool,
    pub socket_reuse_address: bool,
    pub socket_receive_buffer_size: usize,
    pub socket_send_buffer_size: usize,
    /// SO_LINGER in milliseconds. -1 leaves the OS default.
    pub socket_linger_time_ms: i64,
    /// IP type-of-service byte. 0 leaves the OS default.
    pub socket_traffic_class: u32,
    pub socket_oob_inline: bool,
    /// When true, `stop()` detaches the controller thread instead of
    /// joining it. Default true for clients, false for servers.
    pub controller_daemon: bool,
    /// Plaintext accumulation buffer per inbound way. Default 16 KiB.
    pub inbound_buffer_size: usize,
    /// Plaintext staging buffer per outbound way. Default 32 KiB.
    pub outbound_buffer_size: usize,
    /// Threads in the worker pool for handlers and delegated TLS tasks.
    pub worker_threads: usize,
    /// Capacity of the poll event batch. Default 1024.
    pub poll_capacity: usize,
    pub tls_server_cert: Option<String>,
    pub tls_server_key: Option<String>,
    pub tls_ca_cert: Option<String>,
    /// SNI name override for client TLS. Defaults to the request host.
    pub tls_server_name: Option<String>,
}

impl ConnectorOptions {
    /// Reads the option set for a client connector.
    pub fn client(config: &Config, name: &str) -> Result<Self, Error> {
        Self::read(config, name, true)
    }

    /// Reads the option set for a server connector.
    pub fn server(config: &Config, name: &str) -> Result<Self, Error> {
        Self::read(config, name, false)
    }

    fn read(config: &Config, name: &str, client_side: bool) -> Result<Self, Error> {
        let options = Self {
            proxy_host: optional(get_namespaced_string(config, name, "proxy_host"))?,
            proxy_port: optional(get_namespaced_usize(config, name, "proxy_port"))?
                .map(|p| u16::try_from(p))
                .transpose()
                .map_err(|_| Error::InvalidConfigValue {
                    key: "proxy_port".into(),
                    message: "port must fit in 16 bits".into(),
                })?
                .unwrap_or(3128),
            socket_connect_timeout_ms: optional(get_namespaced_u64(
                config,
                name,
                "socket_connect_timeout_ms",
            ))?
            .unwrap_or(0),
            max_connections_per_host: optional(get_namespaced_i64(
                config,
                name,
                "max_connections_per_host",
            ))?
            .unwrap_or(-1),
            max_total_connections: optional(get_namespaced_i64(
                config,
                name,
                "max_total_connections",
            ))?
            .unwrap_or(-1),
            initial_connections: optional(get_namespaced_usize(
                config,
                name,
                "initial_connections",
            ))?
            .unwrap_or(100),
            persisting_connections: optional(get_namespaced_bool(
                config,
                name,
                "persisting_connections",
            ))?
            .unwrap_or(true),
            pipelining_connections: optional(get_namespaced_bool(
                config,
                name,
                "pipelining_connections",
            ))?
            .unwrap_or(false),
            pooled_connections: optional(get_namespaced_bool(
                config,
                name,
                "pooled_connections",
            ))?
            .unwrap_or(true),
            socket_keep_alive: optional(get_namespaced_bool(config, name, "socket_keep_alive"))?
                .unwrap_or(true),
            socket_no_delay: optional(get_namespaced_bool(config, name, "socket_no_delay"))?
                .unwrap_or(false),
            socket_reuse_address: optional(get_namespaced_bool(
                config,
                name,
                "socket_reuse_address",
            ))?
            .unwrap_or(true),
            socket_receive_buffer_size: optional(get_namespaced_usize(
                config,
                name,
                "socket_receive_buffer_size",
            ))?
            .unwrap_or(8192),
            socket_send_buffer_size: optional(get_namespaced_usize(
                config,
                name,
                "socket_send_buffer_size",
            ))?
            .unwrap_or(8192),
            socket_linger_time_ms: optional(get_namespaced_i64(
                config,
                name,
                "socket_linger_time_ms",
            ))?
            .unwrap_or(-1),
            socket_traffic_class: optional(get_namespaced_usize(
                config,
                name,
                "socket_traffic_class",
            ))?
            .map(|v| v as u32)
            .unwrap_or(0),
            socket_oob_inline: optional(get_namespaced_bool(config, name, "socket_oob_inline"))?
                .unwrap_or(false),
            controller_daemon: optional(get_namespaced_bool(config, name, "controller_daemon"))?
                .unwrap_or(client_side),
            inbound_buffer_size: optional(get_namespaced_usize(
                config,
                name,
                "inbound_buffer_size",
            ))?
            .unwrap_or(16 * 1024),
            outbound_buffer_size: optional(get_namespaced_usize(
                config,
                name,
                "outbound_buffer_size",
            ))?
            .unwrap_or(32 * 1024),
            worker_threads: optional(get_namespaced_usize(config, name, "worker_threads"))?
                .unwrap_or(4),
            poll_capacity: optional(get_namespaced_usize(config, name, "poll_capacity"))?
                .unwrap_or(1024),
            tls_server_cert: optional(get_namespaced_string(config, name, "tls_server_cert"))?,
            tls_server_key: optional(get_namespaced_string(config, name, "tls_server_key"))?,
            tls_ca_cert: optional(get_namespaced_string(config, name, "tls_ca_cert"))?,
            tls_server_name: optional(get_namespaced_string(config, name, "tls_server_name"))?,
        };

        if options.worker_threads == 0 {
            return Err(Error::InvalidConfigValue {
                key: "worker_threads".into(),
                message: "at least one worker thread is required".into(),
            });
        }
        if options.poll_capacity == 0 {
            return Err(Error::InvalidConfigValue {
                key: "poll_capacity".into(),
                message: "poll capacity must be positive".into(),
            });
        }

        Ok(options)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build(pairs: &[(&str, &str)]) -> Config {
        let mut builder = Config::builder();
        for (key, value) in pairs {
            builder = builder.set_default(*key, *value).unwrap();
        }
        builder.build().unwrap()
    }

    #[test]
    fn defaults_apply_when_keys_absent() {
        let config = build(&[]);
        let options = ConnectorOptions::client(&config, "").unwrap();
        assert_eq!(options.proxy_host, None);
        assert_eq!(options.proxy_port, 3128);
        assert_eq!(options.max_connections_per_host, -1);
        assert_eq!(options.max_total_connections, -1);
        assert_eq!(options.initial_connections, 100);
        assert!(options.persisting_connections);
        assert!(!options.pipelining_connections);
        assert!(options.pooled_connections);
        assert_eq!(options.socket_receive_buffer_size, 8192);
        assert!(options.controller_daemon);
    }

    #[test]
    fn server_daemon_default_differs_from_client() {
        let config = build(&[]);
        let options = ConnectorOptions::server(&config, "").unwrap();
        assert!(!options.controller_daemon);
    }

    #[test]
    fn namespaced_key_shadows_bare_key() {
        let config = build(&[
            ("max_total_connections", "10"),
            ("edge.max_total_connections", "3"),
        ]);
        let named = ConnectorOptions::client(&config, "edge").unwrap();
        assert_eq!(named.max_total_connections, 3);
        let bare = ConnectorOptions::client(&config, "").unwrap();
        assert_eq!(bare.max_total_connections, 10);
    }

    #[test]
    fn bare_key_is_the_namespaced_fallback() {
        let config = build(&[("proxy_port", "8080")]);
        let options = ConnectorOptions::client(&config, "edge").unwrap();
        assert_eq!(options.proxy_port, 8080);
    }

    #[test]
    fn zero_worker_threads_is_rejected() {
        let config = build(&[("worker_threads", "0")]);
        assert!(matches!(
            ConnectorOptions::client(&config, ""),
            Err(Error::InvalidConfigValue { .. })
        ));
    }
}
