//! Record layer units: TLS and DTLS record framing.
//!
//! TLS record header is 5 bytes:
//! `content_type(1) || version(2) || length(2)`
//!
//! DTLS record header is 13 bytes:
//! `content_type(1) || version(2) || epoch(2) || sequence_number(6) || length(2)`
//!
//! DTLS records carrying a connection ID use content type 25 and insert the
//! CID between the sequence number and the length (RFC 9146).

pub mod cipher;
pub mod epoch;

use serde::{Deserialize, Serialize};
use tlscript_types::CodecError;

use crate::ProtocolVersion;

/// TLS record header size.
pub const RECORD_HEADER_LEN: usize = 5;

/// DTLS record header size (without connection ID).
pub const DTLS_RECORD_HEADER_LEN: usize = 13;

/// Maximum plaintext fragment size (2^14 bytes).
pub const MAX_PLAINTEXT_LENGTH: usize = 16384;

/// Largest record body accepted on receive (TLS 1.2 ciphertext bound).
pub const MAX_CIPHERTEXT_LENGTH: usize = MAX_PLAINTEXT_LENGTH + 2048;

/// Maximum 48-bit DTLS sequence number.
pub const MAX_SEQ_48: u64 = (1u64 << 48) - 1;

/// Record content types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ContentType {
    ChangeCipherSpec,
    Alert,
    Handshake,
    ApplicationData,
    Heartbeat,
    Tls12Cid,
    Unknown(u8),
}

impl ContentType {
    pub fn from_u8(v: u8) -> Self {
        match v {
            20 => ContentType::ChangeCipherSpec,
            21 => ContentType::Alert,
            22 => ContentType::Handshake,
            23 => ContentType::ApplicationData,
            24 => ContentType::Heartbeat,
            25 => ContentType::Tls12Cid,
            other => ContentType::Unknown(other),
        }
    }

    pub fn as_u8(self) -> u8 {
        match self {
            ContentType::ChangeCipherSpec => 20,
            ContentType::Alert => 21,
            ContentType::Handshake => 22,
            ContentType::ApplicationData => 23,
            ContentType::Heartbeat => 24,
            ContentType::Tls12Cid => 25,
            ContentType::Unknown(v) => v,
        }
    }
}

/// A record as scripted or observed by the record layer.
///
/// Every field is optional. When an action configures a record, unset fields
/// are filled from the connection context at send time. A record without a
/// `fragment` is a template: it receives the next chunk of data coming from
/// the layer above, at most `max_fragment_length` bytes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<ContentType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<ProtocolVersion>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub epoch: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sequence_number: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_id: Option<Vec<u8>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_fragment_length: Option<usize>,
    /// Plaintext content of the record.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fragment: Option<Vec<u8>>,
    /// Bytes of the record body as they travelled on the wire.
    #[serde(skip)]
    pub protected_fragment: Option<Vec<u8>>,
    /// Whether decryption succeeded. `None` for sent records.
    #[serde(skip)]
    pub authenticated: Option<bool>,
}

impl Record {
    /// A record with every field left to the context.
    pub fn template() -> Self {
        Self::default()
    }

    /// A template that takes at most `max` bytes from the layer above.
    pub fn with_max_fragment_length(max: usize) -> Self {
        Self {
            max_fragment_length: Some(max),
            ..Self::default()
        }
    }

    /// A record sent verbatim regardless of the data coming from above.
    pub fn explicit(content_type: ContentType, fragment: impl Into<Vec<u8>>) -> Self {
        Self {
            content_type: Some(content_type),
            fragment: Some(fragment.into()),
            ..Self::default()
        }
    }

    pub fn is_template(&self) -> bool {
        self.fragment.is_none()
    }

    /// Strip everything that depends on the connection the record was seen on.
    pub fn detached(&self) -> Self {
        Self {
            content_type: self.content_type,
            version: self.version,
            fragment: self.fragment.clone(),
            ..Self::default()
        }
    }
}

/// A record header and body exactly as framed on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WireRecord {
    pub content_type: ContentType,
    pub version: u16,
    pub epoch: Option<u16>,
    pub sequence_number: Option<u64>,
    pub connection_id: Option<Vec<u8>>,
    pub fragment: Vec<u8>,
}

/// Parse one TLS or DTLS record from the front of `data`.
///
/// `cid_len` is the length of the connection ID the local end expects on
/// DTLS records of type `tls12_cid`. Returns `(record, bytes_consumed)`.
pub fn parse_record(
    data: &[u8],
    dtls: bool,
    cid_len: usize,
) -> Result<(WireRecord, usize), CodecError> {
    let header_len = if dtls {
        DTLS_RECORD_HEADER_LEN
    } else {
        RECORD_HEADER_LEN
    };
    if data.len() < header_len {
        return Err(CodecError::incomplete("record header", header_len, data.len()));
    }

    let content_type = ContentType::from_u8(data[0]);
    let version = u16::from_be_bytes([data[1], data[2]]);

    let (epoch, sequence_number, connection_id, length_at) = if dtls {
        let epoch = u16::from_be_bytes([data[3], data[4]]);
        let mut seq_bytes = [0u8; 8];
        seq_bytes[2..8].copy_from_slice(&data[5..11]);
        let seq = u64::from_be_bytes(seq_bytes);
        if content_type == ContentType::Tls12Cid {
            let need = DTLS_RECORD_HEADER_LEN + cid_len;
            if data.len() < need {
                return Err(CodecError::incomplete("record header", need, data.len()));
            }
            let cid = data[11..11 + cid_len].to_vec();
            (Some(epoch), Some(seq), Some(cid), 11 + cid_len)
        } else {
            (Some(epoch), Some(seq), None, 11)
        }
    } else {
        (None, None, None, 3)
    };

    let length = u16::from_be_bytes([data[length_at], data[length_at + 1]]) as usize;
    if length > MAX_CIPHERTEXT_LENGTH {
        return Err(CodecError::InvalidValue {
            what: "record length",
            value: length as u64,
        });
    }
    let body_at = length_at + 2;
    let total = body_at + length;
    if data.len() < total {
        return Err(CodecError::incomplete("record body", total, data.len()));
    }

    Ok((
        WireRecord {
            content_type,
            version,
            epoch,
            sequence_number,
            connection_id,
            fragment: data[body_at..total].to_vec(),
        },
        total,
    ))
}

/// Serialize a record to bytes.
///
/// A record with an epoch is written with the DTLS header. A fragment too
/// long for the 16-bit length field is rejected.
pub fn serialize_record(record: &WireRecord) -> Result<Vec<u8>, CodecError> {
    let length = u16::try_from(record.fragment.len())
        .map_err(|_| CodecError::LengthOverflow("record fragment"))?;
    let cid = record.connection_id.as_deref().unwrap_or_default();
    let mut buf = Vec::with_capacity(DTLS_RECORD_HEADER_LEN + cid.len() + record.fragment.len());
    buf.push(record.content_type.as_u8());
    buf.extend_from_slice(&record.version.to_be_bytes());
    if let Some(epoch) = record.epoch {
        buf.extend_from_slice(&epoch.to_be_bytes());
        // 48-bit sequence number → 6 bytes
        let seq_bytes = (record.sequence_number.unwrap_or(0) & MAX_SEQ_48).to_be_bytes();
        buf.extend_from_slice(&seq_bytes[2..8]);
        buf.extend_from_slice(cid);
    }
    buf.extend_from_slice(&length.to_be_bytes());
    buf.extend_from_slice(&record.fragment);
    Ok(buf)
}

/// Build an inner plaintext: content || content_type(1) || zeros[padding].
pub fn build_inner_plaintext(content_type: ContentType, plaintext: &[u8], padding_len: usize) -> Vec<u8> {
    let inner_len = plaintext.len() + 1 + padding_len;
    let mut inner = Vec::with_capacity(inner_len);
    inner.extend_from_slice(plaintext);
    inner.push(content_type.as_u8());
    inner.resize(inner_len, 0);
    inner
}

/// Parse inner plaintext: scan from end for first non-zero byte (the content type).
pub fn parse_inner_plaintext(inner: &[u8]) -> Result<(ContentType, &[u8]), CodecError> {
    match inner.iter().rposition(|&b| b != 0) {
        Some(i) => Ok((ContentType::from_u8(inner[i]), &inner[..i])),
        None => Err(CodecError::Malformed(
            "inner plaintext has no content type".into(),
        )),
    }
}
