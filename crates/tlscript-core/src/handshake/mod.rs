//! Handshake message framing shared by the message and fragment layers.

pub mod fragment;

use serde::{Deserialize, Serialize};
use tlscript_types::CodecError;

/// TLS handshake header: `msg_type(1) || length(3)`.
pub const HS_HEADER_LEN: usize = 4;

/// Largest 24-bit length.
pub const MAX_U24: u32 = 0x00FF_FFFF;

/// Handshake message types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HandshakeType {
    HelloRequest,
    ClientHello,
    ServerHello,
    HelloVerifyRequest,
    NewSessionTicket,
    EndOfEarlyData,
    EncryptedExtensions,
    Certificate,
    ServerKeyExchange,
    CertificateRequest,
    ServerHelloDone,
    CertificateVerify,
    ClientKeyExchange,
    Finished,
    CertificateStatus,
    KeyUpdate,
    MessageHash,
    Unknown(u8),
}

impl HandshakeType {
    pub fn from_u8(v: u8) -> Self {
        match v {
            0 => HandshakeType::HelloRequest,
            1 => HandshakeType::ClientHello,
            2 => HandshakeType::ServerHello,
            3 => HandshakeType::HelloVerifyRequest,
            4 => HandshakeType::NewSessionTicket,
            5 => HandshakeType::EndOfEarlyData,
            8 => HandshakeType::EncryptedExtensions,
            11 => HandshakeType::Certificate,
            12 => HandshakeType::ServerKeyExchange,
            13 => HandshakeType::CertificateRequest,
            14 => HandshakeType::ServerHelloDone,
            15 => HandshakeType::CertificateVerify,
            16 => HandshakeType::ClientKeyExchange,
            20 => HandshakeType::Finished,
            22 => HandshakeType::CertificateStatus,
            24 => HandshakeType::KeyUpdate,
            254 => HandshakeType::MessageHash,
            other => HandshakeType::Unknown(other),
        }
    }

    pub fn as_u8(self) -> u8 {
        match self {
            HandshakeType::HelloRequest => 0,
            HandshakeType::ClientHello => 1,
            HandshakeType::ServerHello => 2,
            HandshakeType::HelloVerifyRequest => 3,
            HandshakeType::NewSessionTicket => 4,
            HandshakeType::EndOfEarlyData => 5,
            HandshakeType::EncryptedExtensions => 8,
            HandshakeType::Certificate => 11,
            HandshakeType::ServerKeyExchange => 12,
            HandshakeType::CertificateRequest => 13,
            HandshakeType::ServerHelloDone => 14,
            HandshakeType::CertificateVerify => 15,
            HandshakeType::ClientKeyExchange => 16,
            HandshakeType::Finished => 20,
            HandshakeType::CertificateStatus => 22,
            HandshakeType::KeyUpdate => 24,
            HandshakeType::MessageHash => 254,
            HandshakeType::Unknown(v) => v,
        }
    }
}

pub(crate) fn read_u24(data: &[u8]) -> u32 {
    ((data[0] as u32) << 16) | ((data[1] as u32) << 8) | (data[2] as u32)
}

pub(crate) fn push_u24(buf: &mut Vec<u8>, val: u32) {
    buf.push((val >> 16) as u8);
    buf.push((val >> 8) as u8);
    buf.push(val as u8);
}

/// Parse a TLS handshake header.
///
/// Returns `(msg_type, body, total_consumed)`.
pub fn parse_handshake_header(data: &[u8]) -> Result<(HandshakeType, &[u8], usize), CodecError> {
    if data.len() < HS_HEADER_LEN {
        return Err(CodecError::incomplete("handshake header", HS_HEADER_LEN, data.len()));
    }
    let msg_type = HandshakeType::from_u8(data[0]);
    let total = HS_HEADER_LEN + read_u24(&data[1..4]) as usize;
    if data.len() < total {
        return Err(CodecError::incomplete("handshake body", total, data.len()));
    }
    Ok((msg_type, &data[HS_HEADER_LEN..total], total))
}

/// Wrap a handshake body with the 4-byte header.
pub fn wrap_handshake(msg_type: HandshakeType, body: &[u8]) -> Result<Vec<u8>, CodecError> {
    if body.len() > MAX_U24 as usize {
        return Err(CodecError::LengthOverflow("handshake body"));
    }
    let mut out = Vec::with_capacity(HS_HEADER_LEN + body.len());
    out.push(msg_type.as_u8());
    push_u24(&mut out, body.len() as u32);
    out.extend_from_slice(body);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handshake_type_codes() {
        for v in 0..=255u8 {
            assert_eq!(HandshakeType::from_u8(v).as_u8(), v);
        }
        assert_eq!(HandshakeType::from_u8(14), HandshakeType::ServerHelloDone);
        assert_eq!(HandshakeType::from_u8(99), HandshakeType::Unknown(99));
    }

    #[test]
    fn test_wrap_and_parse_header() {
        let msg = wrap_handshake(HandshakeType::Finished, &[0xAB; 12]).unwrap();
        assert_eq!(&msg[..4], &[20, 0, 0, 12]);
        let (ty, body, consumed) = parse_handshake_header(&msg).unwrap();
        assert_eq!(ty, HandshakeType::Finished);
        assert_eq!(body, &[0xAB; 12]);
        assert_eq!(consumed, 16);
    }

    #[test]
    fn test_parse_truncated_body() {
        let err = parse_handshake_header(&[2, 0, 0, 10, 1, 2]).unwrap_err();
        assert!(err.is_incomplete());
    }
}
