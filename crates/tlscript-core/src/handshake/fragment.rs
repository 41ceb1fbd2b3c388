//! DTLS handshake message fragmentation and reassembly (RFC 6347 §4.2.3).
//!
//! Each fragment carries a 12-byte DTLS handshake header:
//! `msg_type(1) || length(3) || message_seq(2) || fragment_offset(3) || fragment_length(3)`

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tlscript_types::CodecError;

use super::{push_u24, read_u24, wrap_handshake, HandshakeType};

/// DTLS handshake header length.
pub const DTLS_HS_HEADER_LEN: usize = 12;

/// A DTLS handshake fragment as scripted or observed.
///
/// A fragment without `content` is a template: the fragment layer fills it
/// with the next slice of the handshake message coming from above, at most
/// `max_fragment_length` bytes. Header fields left unset are computed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DtlsFragment {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub handshake_type: Option<HandshakeType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_length: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_seq: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fragment_offset: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fragment_length: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_fragment_length: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<Vec<u8>>,
}

impl DtlsFragment {
    pub fn template() -> Self {
        Self::default()
    }

    pub fn with_max_fragment_length(max: usize) -> Self {
        Self {
            max_fragment_length: Some(max),
            ..Self::default()
        }
    }

    pub fn is_template(&self) -> bool {
        self.content.is_none()
    }

    /// Header as it will be written, with unset fields derived from the content.
    pub fn header(&self) -> DtlsHandshakeHeader {
        let content_len = self.content.as_ref().map_or(0, |c| c.len()) as u32;
        DtlsHandshakeHeader {
            msg_type: self.handshake_type.unwrap_or(HandshakeType::Unknown(0xFF)),
            length: self.message_length.unwrap_or(content_len),
            message_seq: self.message_seq.unwrap_or(0),
            fragment_offset: self.fragment_offset.unwrap_or(0),
            fragment_length: self.fragment_length.unwrap_or(content_len),
        }
    }

    /// Serialize with the 12-byte header.
    pub fn to_bytes(&self) -> Vec<u8> {
        encode_fragment(&self.header(), self.content.as_deref().unwrap_or_default())
    }

    pub(crate) fn from_parsed(header: &DtlsHandshakeHeader, body: &[u8]) -> Self {
        Self {
            handshake_type: Some(header.msg_type),
            message_length: Some(header.length),
            message_seq: Some(header.message_seq),
            fragment_offset: Some(header.fragment_offset),
            fragment_length: Some(header.fragment_length),
            max_fragment_length: None,
            content: Some(body.to_vec()),
        }
    }
}

/// Parsed DTLS handshake header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DtlsHandshakeHeader {
    pub msg_type: HandshakeType,
    /// Total message length (24-bit).
    pub length: u32,
    pub message_seq: u16,
    /// Fragment offset (24-bit).
    pub fragment_offset: u32,
    /// Fragment length (24-bit).
    pub fragment_length: u32,
}

/// Parse a DTLS handshake fragment.
///
/// Returns `(header, fragment_body, bytes_consumed)`.
pub fn parse_dtls_handshake_header(
    data: &[u8],
) -> Result<(DtlsHandshakeHeader, &[u8], usize), CodecError> {
    if data.len() < DTLS_HS_HEADER_LEN {
        return Err(CodecError::incomplete(
            "DTLS handshake header",
            DTLS_HS_HEADER_LEN,
            data.len(),
        ));
    }
    let header = DtlsHandshakeHeader {
        msg_type: HandshakeType::from_u8(data[0]),
        length: read_u24(&data[1..4]),
        message_seq: u16::from_be_bytes([data[4], data[5]]),
        fragment_offset: read_u24(&data[6..9]),
        fragment_length: read_u24(&data[9..12]),
    };
    let total = DTLS_HS_HEADER_LEN + header.fragment_length as usize;
    if data.len() < total {
        return Err(CodecError::incomplete("DTLS handshake fragment", total, data.len()));
    }
    Ok((header, &data[DTLS_HS_HEADER_LEN..total], total))
}

/// Write a header and body. The header is written as given, even when it
/// disagrees with the body.
pub fn encode_fragment(header: &DtlsHandshakeHeader, body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(DTLS_HS_HEADER_LEN + body.len());
    out.push(header.msg_type.as_u8());
    push_u24(&mut out, header.length);
    out.extend_from_slice(&header.message_seq.to_be_bytes());
    push_u24(&mut out, header.fragment_offset);
    push_u24(&mut out, header.fragment_length);
    out.extend_from_slice(body);
    out
}

/// Tracks reassembly state for a single handshake message.
#[derive(Debug, Clone)]
pub struct ReassemblyBuffer {
    msg_type: HandshakeType,
    total_length: usize,
    buffer: Vec<u8>,
    received: Vec<bool>,
}

impl ReassemblyBuffer {
    pub fn new(msg_type: HandshakeType, total_length: usize) -> Self {
        Self {
            msg_type,
            total_length,
            buffer: vec![0u8; total_length],
            received: vec![false; total_length],
        }
    }

    /// Insert a fragment. Returns `true` if the message is now complete.
    pub fn insert_fragment(&mut self, offset: usize, data: &[u8]) -> Result<bool, CodecError> {
        let end = offset
            .checked_add(data.len())
            .filter(|&end| end <= self.total_length)
            .ok_or_else(|| {
                CodecError::Malformed("fragment exceeds total message length".into())
            })?;
        self.buffer[offset..end].copy_from_slice(data);
        self.received[offset..end].iter_mut().for_each(|r| *r = true);
        Ok(self.is_complete())
    }

    pub fn is_complete(&self) -> bool {
        self.received.iter().all(|&r| r)
    }

    /// The message with a TLS handshake header, once complete.
    pub fn tls_message(&self) -> Option<Vec<u8>> {
        if !self.is_complete() {
            return None;
        }
        wrap_handshake(self.msg_type, &self.buffer).ok()
    }
}

/// Reassembles fragments into whole messages, delivered in `message_seq` order.
#[derive(Debug, Clone, Default)]
pub struct ReassemblyManager {
    buffers: HashMap<u16, ReassemblyBuffer>,
    next_expected_seq: u16,
}

impl ReassemblyManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Process one fragment and return every message that became deliverable,
    /// TLS-framed and in sequence order. Fragments of already delivered
    /// messages are ignored.
    pub fn process_fragment(
        &mut self,
        header: &DtlsHandshakeHeader,
        fragment_body: &[u8],
    ) -> Result<Vec<Vec<u8>>, CodecError> {
        if header.message_seq < self.next_expected_seq {
            return Ok(Vec::new());
        }

        let buf = self
            .buffers
            .entry(header.message_seq)
            .or_insert_with(|| ReassemblyBuffer::new(header.msg_type, header.length as usize));
        if buf.total_length != header.length as usize {
            return Err(CodecError::Malformed(
                "fragment message length disagrees with earlier fragments".into(),
            ));
        }
        buf.insert_fragment(header.fragment_offset as usize, fragment_body)?;

        let mut completed = Vec::new();
        while let Some(msg) = self
            .buffers
            .get(&self.next_expected_seq)
            .and_then(ReassemblyBuffer::tls_message)
        {
            self.buffers.remove(&self.next_expected_seq);
            self.next_expected_seq = self.next_expected_seq.wrapping_add(1);
            completed.push(msg);
        }
        Ok(completed)
    }

    pub fn next_expected_seq(&self) -> u16 {
        self.next_expected_seq
    }

    /// Number of messages with fragments still missing.
    pub fn pending(&self) -> usize {
        self.buffers.len()
    }

    /// Reset for a new handshake.
    pub fn reset(&mut self) {
        self.buffers.clear();
        self.next_expected_seq = 0;
    }
}
