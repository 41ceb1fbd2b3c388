//! Typed access to context fields by name.
//!
//! Actions that read or overwrite arbitrary context state name a
//! [`ContextField`] and carry a [`ContextValue`]. Each field accepts exactly
//! one value kind; anything else is a configuration error.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tlscript_types::ConfigurationError;
use zeroize::Zeroize;

use super::TlsContext;
use crate::{CipherSuite, CompressionMethod, ExtensionType, ProtocolVersion};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContextField {
    SelectedCipherSuite,
    SelectedProtocolVersion,
    SelectedCompression,
    ProposedCipherSuites,
    ProposedExtensions,
    NegotiatedExtensions,
    ClientRandom,
    ServerRandom,
    SessionId,
    PreMasterSecret,
    MasterSecret,
    Psk,
    DtlsCookie,
    ClientVerifyData,
    ServerVerifyData,
    ReadConnectionId,
    WriteConnectionId,
    ReadEpoch,
    WriteEpoch,
    DtlsWriteHandshakeSeq,
}

impl ContextField {
    pub const ALL: [ContextField; 20] = [
        ContextField::SelectedCipherSuite,
        ContextField::SelectedProtocolVersion,
        ContextField::SelectedCompression,
        ContextField::ProposedCipherSuites,
        ContextField::ProposedExtensions,
        ContextField::NegotiatedExtensions,
        ContextField::ClientRandom,
        ContextField::ServerRandom,
        ContextField::SessionId,
        ContextField::PreMasterSecret,
        ContextField::MasterSecret,
        ContextField::Psk,
        ContextField::DtlsCookie,
        ContextField::ClientVerifyData,
        ContextField::ServerVerifyData,
        ContextField::ReadConnectionId,
        ContextField::WriteConnectionId,
        ContextField::ReadEpoch,
        ContextField::WriteEpoch,
        ContextField::DtlsWriteHandshakeSeq,
    ];

    pub fn name(self) -> &'static str {
        match self {
            ContextField::SelectedCipherSuite => "selected_cipher_suite",
            ContextField::SelectedProtocolVersion => "selected_protocol_version",
            ContextField::SelectedCompression => "selected_compression",
            ContextField::ProposedCipherSuites => "proposed_cipher_suites",
            ContextField::ProposedExtensions => "proposed_extensions",
            ContextField::NegotiatedExtensions => "negotiated_extensions",
            ContextField::ClientRandom => "client_random",
            ContextField::ServerRandom => "server_random",
            ContextField::SessionId => "session_id",
            ContextField::PreMasterSecret => "pre_master_secret",
            ContextField::MasterSecret => "master_secret",
            ContextField::Psk => "psk",
            ContextField::DtlsCookie => "dtls_cookie",
            ContextField::ClientVerifyData => "client_verify_data",
            ContextField::ServerVerifyData => "server_verify_data",
            ContextField::ReadConnectionId => "read_connection_id",
            ContextField::WriteConnectionId => "write_connection_id",
            ContextField::ReadEpoch => "read_epoch",
            ContextField::WriteEpoch => "write_epoch",
            ContextField::DtlsWriteHandshakeSeq => "dtls_write_handshake_seq",
        }
    }

    /// The one value kind this field accepts.
    pub fn kind(self) -> ContextValueKind {
        match self {
            ContextField::SelectedCipherSuite => ContextValueKind::CipherSuite,
            ContextField::SelectedProtocolVersion => ContextValueKind::ProtocolVersion,
            ContextField::SelectedCompression => ContextValueKind::Compression,
            ContextField::ProposedCipherSuites => ContextValueKind::CipherSuites,
            ContextField::ProposedExtensions | ContextField::NegotiatedExtensions => {
                ContextValueKind::Extensions
            }
            ContextField::ReadEpoch
            | ContextField::WriteEpoch
            | ContextField::DtlsWriteHandshakeSeq => ContextValueKind::Number,
            _ => ContextValueKind::Bytes,
        }
    }

    /// Whether the field may hold [`ContextValue::Unset`].
    pub fn is_optional(self) -> bool {
        matches!(
            self,
            ContextField::SelectedCipherSuite | ContextField::SelectedProtocolVersion
        )
    }
}

impl fmt::Display for ContextField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ContextField {
    type Err = ConfigurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ContextField::ALL
            .into_iter()
            .find(|f| f.name() == s)
            .ok_or_else(|| ConfigurationError::UnknownField(s.to_string()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextValueKind {
    Bytes,
    CipherSuite,
    ProtocolVersion,
    Compression,
    CipherSuites,
    Extensions,
    Number,
    Unset,
}

/// A value stored in or read from a context field. Byte values are
/// zeroized on drop, since they may carry secrets.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum ContextValue {
    Bytes(Vec<u8>),
    CipherSuite(CipherSuite),
    ProtocolVersion(ProtocolVersion),
    Compression(CompressionMethod),
    CipherSuites(Vec<CipherSuite>),
    Extensions(Vec<ExtensionType>),
    Number(u16),
    /// An optional field without a value.
    Unset,
}

impl Zeroize for ContextValue {
    fn zeroize(&mut self) {
        if let ContextValue::Bytes(bytes) = self {
            bytes.zeroize();
        }
    }
}

impl Drop for ContextValue {
    fn drop(&mut self) {
        self.zeroize();
    }
}

impl ContextValue {
    pub fn kind(&self) -> ContextValueKind {
        match self {
            ContextValue::Bytes(_) => ContextValueKind::Bytes,
            ContextValue::CipherSuite(_) => ContextValueKind::CipherSuite,
            ContextValue::ProtocolVersion(_) => ContextValueKind::ProtocolVersion,
            ContextValue::Compression(_) => ContextValueKind::Compression,
            ContextValue::CipherSuites(_) => ContextValueKind::CipherSuites,
            ContextValue::Extensions(_) => ContextValueKind::Extensions,
            ContextValue::Number(_) => ContextValueKind::Number,
            ContextValue::Unset => ContextValueKind::Unset,
        }
    }
}

impl TlsContext {
    pub fn get_field(&self, field: ContextField) -> ContextValue {
        match field {
            ContextField::SelectedCipherSuite => self
                .selected_cipher_suite
                .map_or(ContextValue::Unset, ContextValue::CipherSuite),
            ContextField::SelectedProtocolVersion => self
                .selected_protocol_version
                .map_or(ContextValue::Unset, ContextValue::ProtocolVersion),
            ContextField::SelectedCompression => ContextValue::Compression(self.selected_compression),
            ContextField::ProposedCipherSuites => {
                ContextValue::CipherSuites(self.proposed_cipher_suites.clone())
            }
            ContextField::ProposedExtensions => {
                ContextValue::Extensions(self.proposed_extensions.iter().copied().collect())
            }
            ContextField::NegotiatedExtensions => {
                ContextValue::Extensions(self.negotiated_extensions.iter().copied().collect())
            }
            ContextField::ReadEpoch => ContextValue::Number(self.read_epoch),
            ContextField::WriteEpoch => ContextValue::Number(self.write_epoch),
            ContextField::DtlsWriteHandshakeSeq => ContextValue::Number(self.dtls_write_handshake_seq),
            bytes => ContextValue::Bytes(self.bytes_field(bytes).clone()),
        }
    }

    /// Install `value` into `field` and return the previous value.
    pub fn set_field(
        &mut self,
        field: ContextField,
        value: ContextValue,
    ) -> Result<ContextValue, ConfigurationError> {
        let accepted = value.kind() == field.kind()
            || (value.kind() == ContextValueKind::Unset && field.is_optional());
        if !accepted {
            return Err(ConfigurationError::IncompatibleValue {
                field: field.name().to_string(),
                found: format!("{:?}", value.kind()),
            });
        }
        let old = self.get_field(field);
        let mut value = value;
        match (field, &mut value) {
            (ContextField::SelectedCipherSuite, ContextValue::CipherSuite(s)) => {
                self.selected_cipher_suite = Some(*s)
            }
            (ContextField::SelectedProtocolVersion, ContextValue::ProtocolVersion(v)) => {
                self.selected_protocol_version = Some(*v)
            }
            (ContextField::SelectedCipherSuite, _) => self.selected_cipher_suite = None,
            (ContextField::SelectedProtocolVersion, _) => self.selected_protocol_version = None,
            (ContextField::SelectedCompression, ContextValue::Compression(c)) => {
                self.selected_compression = *c
            }
            (ContextField::ProposedCipherSuites, ContextValue::CipherSuites(s)) => {
                self.proposed_cipher_suites = std::mem::take(s)
            }
            (ContextField::ProposedExtensions, ContextValue::Extensions(e)) => {
                self.proposed_extensions = e.iter().copied().collect()
            }
            (ContextField::NegotiatedExtensions, ContextValue::Extensions(e)) => {
                self.negotiated_extensions = e.iter().copied().collect()
            }
            (ContextField::ReadEpoch, ContextValue::Number(n)) => self.read_epoch = *n,
            (ContextField::WriteEpoch, ContextValue::Number(n)) => self.write_epoch = *n,
            (ContextField::DtlsWriteHandshakeSeq, ContextValue::Number(n)) => {
                self.dtls_write_handshake_seq = *n
            }
            (bytes, ContextValue::Bytes(b)) => {
                let slot = self.bytes_field_mut(bytes);
                slot.zeroize();
                *slot = std::mem::take(b);
            }
            (field, other) => {
                return Err(ConfigurationError::IncompatibleValue {
                    field: field.name().to_string(),
                    found: format!("{:?}", other.kind()),
                })
            }
        }
        Ok(old)
    }

    /// Copy `field` from another context; returns the replaced value.
    pub fn copy_field_from(
        &mut self,
        source: &TlsContext,
        field: ContextField,
    ) -> Result<ContextValue, ConfigurationError> {
        self.set_field(field, source.get_field(field))
    }

    fn bytes_field(&self, field: ContextField) -> &Vec<u8> {
        match field {
            ContextField::ClientRandom => &self.client_random,
            ContextField::ServerRandom => &self.server_random,
            ContextField::SessionId => &self.session_id,
            ContextField::PreMasterSecret => &self.pre_master_secret,
            ContextField::MasterSecret => &self.master_secret,
            ContextField::Psk => &self.psk,
            ContextField::DtlsCookie => &self.dtls_cookie,
            ContextField::ClientVerifyData => &self.client_verify_data,
            ContextField::ServerVerifyData => &self.server_verify_data,
            ContextField::ReadConnectionId => &self.read_connection_id,
            _ => &self.write_connection_id,
        }
    }

    fn bytes_field_mut(&mut self, field: ContextField) -> &mut Vec<u8> {
        match field {
            ContextField::ClientRandom => &mut self.client_random,
            ContextField::ServerRandom => &mut self.server_random,
            ContextField::SessionId => &mut self.session_id,
            ContextField::PreMasterSecret => &mut self.pre_master_secret,
            ContextField::MasterSecret => &mut self.master_secret,
            ContextField::Psk => &mut self.psk,
            ContextField::DtlsCookie => &mut self.dtls_cookie,
            ContextField::ClientVerifyData => &mut self.client_verify_data,
            ContextField::ServerVerifyData => &mut self.server_verify_data,
            ContextField::ReadConnectionId => &mut self.read_connection_id,
            _ => &mut self.write_connection_id,
        }
    }
}
