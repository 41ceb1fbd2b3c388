//! Engine configuration with builder pattern.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::crypt::{AeadCryptoProvider, CryptoProvider};
use crate::record::MAX_PLAINTEXT_LENGTH;
use crate::{CipherSuite, ConnectionEnd, ProtocolVersion};

/// QUIC version 1 (RFC 9000).
pub const QUIC_VERSION_1: u32 = 0x0000_0001;

/// How the engine relates to its peers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunningMode {
    Client,
    Server,
    /// Man in the middle: a server-side and a client-side connection.
    Mitm,
}

/// Byte transport underneath a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportType {
    #[default]
    Tcp,
    Udp,
}

/// Preset layer stacks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LayerStackType {
    /// Message over record.
    #[default]
    Tls,
    /// Message over DTLS fragment over record.
    Dtls,
    /// Message over QUIC frame over QUIC packet.
    Quic,
}

fn default_host() -> String {
    "127.0.0.1".into()
}

/// A named connection endpoint of a workflow trace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AliasedConnection {
    pub alias: String,
    pub local_end: ConnectionEnd,
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default)]
    pub port: u16,
    #[serde(default)]
    pub transport: TransportType,
    #[serde(default)]
    pub stack: LayerStackType,
    /// Receive timeout override, in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

impl AliasedConnection {
    pub fn new(alias: impl Into<String>, local_end: ConnectionEnd) -> Self {
        Self {
            alias: alias.into(),
            local_end,
            host: default_host(),
            port: 4433,
            transport: TransportType::Tcp,
            stack: LayerStackType::Tls,
            timeout_ms: None,
        }
    }

    pub fn with_endpoint(mut self, host: impl Into<String>, port: u16) -> Self {
        self.host = host.into();
        self.port = port;
        self
    }

    pub fn with_transport(mut self, transport: TransportType) -> Self {
        self.transport = transport;
        self
    }

    pub fn with_stack(mut self, stack: LayerStackType) -> Self {
        self.stack = stack;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = Some(timeout.as_millis() as u64);
        self
    }
}

/// Engine configuration.
#[derive(Clone)]
pub struct Config {
    pub running_mode: RunningMode,
    /// Alias given to actions of single-connection traces.
    pub default_connection_alias: String,
    pub default_client_connection: AliasedConnection,
    pub default_server_connection: AliasedConnection,
    pub default_protocol_version: ProtocolVersion,
    pub default_cipher_suite: CipherSuite,
    /// Largest record payload produced when splitting upper-layer data.
    pub max_record_length: usize,
    /// Largest DTLS handshake fragment produced by default.
    pub dtls_max_fragment_length: usize,
    pub quic_version: u32,
    /// Largest frame payload placed in one QUIC packet.
    pub quic_max_packet_payload: usize,
    pub receive_timeout: Duration,
    /// Stop executing actions once a fatal alert was received.
    pub stop_actions_after_fatal: bool,
    /// Stop executing actions once a transport failure was absorbed.
    pub stop_actions_after_io_exception: bool,
    /// Stop executing actions once an action was not executed as planned.
    pub stop_trace_after_unexpected: bool,
    pub crypto_provider: Arc<dyn CryptoProvider>,
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("running_mode", &self.running_mode)
            .field("default_connection_alias", &self.default_connection_alias)
            .field("default_protocol_version", &self.default_protocol_version)
            .field("default_cipher_suite", &self.default_cipher_suite)
            .field("receive_timeout", &self.receive_timeout)
            .finish_non_exhaustive()
    }
}

impl Config {
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::default()
    }

    /// The connection a trace uses when it names none.
    pub fn default_connection(&self) -> AliasedConnection {
        match self.running_mode {
            RunningMode::Server => self.default_server_connection.clone(),
            RunningMode::Client | RunningMode::Mitm => self.default_client_connection.clone(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::builder().build()
    }
}

/// Builder for `Config`.
pub struct ConfigBuilder {
    running_mode: RunningMode,
    default_connection_alias: String,
    default_client_connection: Option<AliasedConnection>,
    default_server_connection: Option<AliasedConnection>,
    default_protocol_version: ProtocolVersion,
    default_cipher_suite: CipherSuite,
    max_record_length: usize,
    dtls_max_fragment_length: usize,
    quic_version: u32,
    quic_max_packet_payload: usize,
    receive_timeout: Duration,
    stop_actions_after_fatal: bool,
    stop_actions_after_io_exception: bool,
    stop_trace_after_unexpected: bool,
    crypto_provider: Arc<dyn CryptoProvider>,
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self {
            running_mode: RunningMode::Client,
            default_connection_alias: "client".into(),
            default_client_connection: None,
            default_server_connection: None,
            default_protocol_version: ProtocolVersion::TLS12,
            default_cipher_suite: CipherSuite::TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256,
            max_record_length: MAX_PLAINTEXT_LENGTH,
            dtls_max_fragment_length: 1400,
            quic_version: QUIC_VERSION_1,
            quic_max_packet_payload: 1200,
            receive_timeout: Duration::from_millis(1000),
            stop_actions_after_fatal: false,
            stop_actions_after_io_exception: false,
            stop_trace_after_unexpected: false,
            crypto_provider: Arc::new(AeadCryptoProvider::new()),
        }
    }
}

impl fmt::Debug for ConfigBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConfigBuilder")
            .field("running_mode", &self.running_mode)
            .field("default_connection_alias", &self.default_connection_alias)
            .finish_non_exhaustive()
    }
}

impl ConfigBuilder {
    pub fn running_mode(mut self, mode: RunningMode) -> Self {
        self.running_mode = mode;
        self
    }

    pub fn default_connection_alias(mut self, alias: impl Into<String>) -> Self {
        self.default_connection_alias = alias.into();
        self
    }

    pub fn default_client_connection(mut self, connection: AliasedConnection) -> Self {
        self.default_client_connection = Some(connection);
        self
    }

    pub fn default_server_connection(mut self, connection: AliasedConnection) -> Self {
        self.default_server_connection = Some(connection);
        self
    }

    pub fn default_protocol_version(mut self, version: ProtocolVersion) -> Self {
        self.default_protocol_version = version;
        self
    }

    pub fn default_cipher_suite(mut self, suite: CipherSuite) -> Self {
        self.default_cipher_suite = suite;
        self
    }

    pub fn max_record_length(mut self, len: usize) -> Self {
        self.max_record_length = len.clamp(1, MAX_PLAINTEXT_LENGTH);
        self
    }

    pub fn dtls_max_fragment_length(mut self, len: usize) -> Self {
        self.dtls_max_fragment_length = len.max(1);
        self
    }

    pub fn quic_version(mut self, version: u32) -> Self {
        self.quic_version = version;
        self
    }

    pub fn quic_max_packet_payload(mut self, len: usize) -> Self {
        self.quic_max_packet_payload = len.max(1);
        self
    }

    pub fn receive_timeout(mut self, timeout: Duration) -> Self {
        self.receive_timeout = timeout;
        self
    }

    pub fn stop_actions_after_fatal(mut self, stop: bool) -> Self {
        self.stop_actions_after_fatal = stop;
        self
    }

    pub fn stop_actions_after_io_exception(mut self, stop: bool) -> Self {
        self.stop_actions_after_io_exception = stop;
        self
    }

    pub fn stop_trace_after_unexpected(mut self, stop: bool) -> Self {
        self.stop_trace_after_unexpected = stop;
        self
    }

    pub fn crypto_provider(mut self, provider: Arc<dyn CryptoProvider>) -> Self {
        self.crypto_provider = provider;
        self
    }

    pub fn build(self) -> Config {
        let alias = self.default_connection_alias;
        let client = self
            .default_client_connection
            .unwrap_or_else(|| AliasedConnection::new(alias.clone(), ConnectionEnd::Client));
        let server = self
            .default_server_connection
            .unwrap_or_else(|| AliasedConnection::new(alias.clone(), ConnectionEnd::Server));
        Config {
            running_mode: self.running_mode,
            default_connection_alias: alias,
            default_client_connection: client,
            default_server_connection: server,
            default_protocol_version: self.default_protocol_version,
            default_cipher_suite: self.default_cipher_suite,
            max_record_length: self.max_record_length,
            dtls_max_fragment_length: self.dtls_max_fragment_length,
            quic_version: self.quic_version,
            quic_max_packet_payload: self.quic_max_packet_payload,
            receive_timeout: self.receive_timeout,
            stop_actions_after_fatal: self.stop_actions_after_fatal,
            stop_actions_after_io_exception: self.stop_actions_after_io_exception,
            stop_trace_after_unexpected: self.stop_trace_after_unexpected,
            crypto_provider: self.crypto_provider,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_builder_defaults() {
        let config = Config::builder().build();
        assert_eq!(config.running_mode, RunningMode::Client);
        assert_eq!(config.default_connection_alias, "client");
        assert_eq!(config.default_client_connection.alias, "client");
        assert_eq!(config.default_client_connection.local_end, ConnectionEnd::Client);
        assert_eq!(config.default_server_connection.local_end, ConnectionEnd::Server);
        assert_eq!(config.max_record_length, MAX_PLAINTEXT_LENGTH);
        assert!(!config.stop_trace_after_unexpected);
    }

    #[test]
    fn test_config_default_connection_follows_mode() {
        let config = Config::builder()
            .running_mode(RunningMode::Server)
            .default_connection_alias("srv")
            .build();
        let conn = config.default_connection();
        assert_eq!(conn.alias, "srv");
        assert_eq!(conn.local_end, ConnectionEnd::Server);
    }

    #[test]
    fn test_config_builder_clamps_lengths() {
        let config = Config::builder()
            .max_record_length(1 << 20)
            .dtls_max_fragment_length(0)
            .build();
        assert_eq!(config.max_record_length, MAX_PLAINTEXT_LENGTH);
        assert_eq!(config.dtls_max_fragment_length, 1);
    }

    #[test]
    fn test_aliased_connection_serde() {
        let conn = AliasedConnection::new("mitm-server", ConnectionEnd::Server)
            .with_endpoint("0.0.0.0", 5555)
            .with_transport(TransportType::Udp)
            .with_stack(LayerStackType::Dtls)
            .with_timeout(Duration::from_millis(250));
        let json = serde_json::to_string(&conn).unwrap();
        assert!(json.contains("\"transport\":\"udp\""));
        let back: AliasedConnection = serde_json::from_str(&json).unwrap();
        assert_eq!(back, conn);

        let minimal: AliasedConnection =
            serde_json::from_str(r#"{"alias":"c","local_end":"client"}"#).unwrap();
        assert_eq!(minimal.stack, LayerStackType::Tls);
        assert_eq!(minimal.host, "127.0.0.1");
    }

    #[test]
    fn test_config_debug_is_concise() {
        let dbg = format!("{:?}", Config::default());
        assert!(dbg.starts_with("Config"));
        assert!(dbg.contains(".."));
    }
}
