#![forbid(unsafe_code)]
#![doc = "Scriptable TLS, DTLS and QUIC endpoint: actions, protocol layers and workflow execution."]

pub mod action;
pub mod alert;
pub mod config;
pub mod context;
pub mod crypt;
pub mod handshake;
pub mod layer;
pub mod message;
pub mod quic;
pub mod record;
pub mod transport;
pub mod workflow;

use serde::{Deserialize, Serialize};

pub use tlscript_types::{
    ActionError, CodecError, ConfigurationError, CryptoError, ErrorClass, TransportError,
    WorkflowError,
};

/// Protocol version wire value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProtocolVersion(pub u16);

impl ProtocolVersion {
    pub const SSL3: Self = Self(0x0300);
    pub const TLS10: Self = Self(0x0301);
    pub const TLS11: Self = Self(0x0302);
    pub const TLS12: Self = Self(0x0303);
    pub const TLS13: Self = Self(0x0304);
    pub const DTLS10: Self = Self(0xFEFF);
    pub const DTLS12: Self = Self(0xFEFD);
    pub const DTLS13: Self = Self(0xFEFC);

    pub fn is_dtls(self) -> bool {
        self.0 >> 8 == 0xFE
    }

    pub fn is_tls13(self) -> bool {
        self == Self::TLS13 || self == Self::DTLS13
    }

    /// Version written in the record header.
    ///
    /// TLS 1.3 records carry the legacy 1.2 version.
    pub fn record_version(self) -> Self {
        match self {
            Self::TLS13 => Self::TLS12,
            Self::DTLS13 => Self::DTLS12,
            other => other,
        }
    }

    pub fn to_be_bytes(self) -> [u8; 2] {
        self.0.to_be_bytes()
    }
}

impl std::fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match *self {
            Self::SSL3 => f.write_str("SSL3"),
            Self::TLS10 => f.write_str("TLS10"),
            Self::TLS11 => f.write_str("TLS11"),
            Self::TLS12 => f.write_str("TLS12"),
            Self::TLS13 => f.write_str("TLS13"),
            Self::DTLS10 => f.write_str("DTLS10"),
            Self::DTLS12 => f.write_str("DTLS12"),
            Self::DTLS13 => f.write_str("DTLS13"),
            Self(other) => write!(f, "0x{other:04x}"),
        }
    }
}

/// Cipher suite identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CipherSuite(pub u16);

impl CipherSuite {
    pub const TLS_NULL_WITH_NULL_NULL: Self = Self(0x0000);

    // TLS 1.3 cipher suites
    pub const TLS_AES_128_GCM_SHA256: Self = Self(0x1301);
    pub const TLS_AES_256_GCM_SHA384: Self = Self(0x1302);
    pub const TLS_CHACHA20_POLY1305_SHA256: Self = Self(0x1303);

    // TLS 1.2 cipher suites (representative)
    pub const TLS_RSA_WITH_AES_128_GCM_SHA256: Self = Self(0x009C);
    pub const TLS_RSA_WITH_AES_256_GCM_SHA384: Self = Self(0x009D);
    pub const TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256: Self = Self(0xC02F);
    pub const TLS_ECDHE_RSA_WITH_AES_256_GCM_SHA384: Self = Self(0xC030);
    pub const TLS_ECDHE_ECDSA_WITH_AES_128_GCM_SHA256: Self = Self(0xC02B);
    pub const TLS_ECDHE_ECDSA_WITH_AES_256_GCM_SHA384: Self = Self(0xC02C);
    pub const TLS_ECDHE_RSA_WITH_CHACHA20_POLY1305_SHA256: Self = Self(0xCCA8);
    pub const TLS_ECDHE_ECDSA_WITH_CHACHA20_POLY1305_SHA256: Self = Self(0xCCA9);

    // Signalling values
    pub const TLS_EMPTY_RENEGOTIATION_INFO_SCSV: Self = Self(0x00FF);
    pub const TLS_FALLBACK_SCSV: Self = Self(0x5600);
}

/// Which side of a connection a context plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionEnd {
    Client,
    Server,
}

impl ConnectionEnd {
    pub fn peer(self) -> Self {
        match self {
            ConnectionEnd::Client => ConnectionEnd::Server,
            ConnectionEnd::Server => ConnectionEnd::Client,
        }
    }
}

/// Record compression method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CompressionMethod(pub u8);

impl CompressionMethod {
    pub const NULL: Self = Self(0);
    pub const DEFLATE: Self = Self(1);
}

/// TLS extension type identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExtensionType(pub u16);

impl ExtensionType {
    pub const SERVER_NAME: Self = Self(0);
    pub const MAX_FRAGMENT_LENGTH: Self = Self(1);
    pub const STATUS_REQUEST: Self = Self(5);
    pub const SUPPORTED_GROUPS: Self = Self(10);
    pub const EC_POINT_FORMATS: Self = Self(11);
    pub const SIGNATURE_ALGORITHMS: Self = Self(13);
    pub const HEARTBEAT: Self = Self(15);
    pub const ALPN: Self = Self(16);
    pub const PADDING: Self = Self(21);
    pub const ENCRYPT_THEN_MAC: Self = Self(22);
    pub const EXTENDED_MASTER_SECRET: Self = Self(23);
    pub const SESSION_TICKET: Self = Self(35);
    pub const PRE_SHARED_KEY: Self = Self(41);
    pub const EARLY_DATA: Self = Self(42);
    pub const SUPPORTED_VERSIONS: Self = Self(43);
    pub const COOKIE: Self = Self(44);
    pub const PSK_KEY_EXCHANGE_MODES: Self = Self(45);
    pub const KEY_SHARE: Self = Self(51);
    pub const CONNECTION_ID: Self = Self(54);
    pub const QUIC_TRANSPORT_PARAMETERS: Self = Self(57);
    pub const RENEGOTIATION_INFO: Self = Self(0xFF01);
}
