//! QUIC packet headers (RFC 9000 §17).
//!
//! Long header:
//! `flags(1) || version(4) || dcid_len(1) || dcid || scid_len(1) || scid
//!  || [token_len(v) || token] || length(v) || packet_number || payload`
//!
//! Short header:
//! `flags(1) || dcid || packet_number || payload`
//!
//! Packet numbers are written with 4 bytes and headers are not protected, so
//! the packet number is read directly from the header.

use serde::{Deserialize, Serialize};
use tlscript_types::CodecError;

use super::{decode_varint, encode_varint, PacketNumberSpace};

/// Packet number length used on send.
pub const PACKET_NUMBER_LEN: usize = 4;

const LONG_HEADER: u8 = 0x80;
const FIXED_BIT: u8 = 0x40;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum QuicPacketType {
    Initial,
    ZeroRtt,
    Handshake,
    Retry,
    OneRtt,
    VersionNegotiation,
}

impl QuicPacketType {
    pub fn space(self) -> PacketNumberSpace {
        match self {
            QuicPacketType::Initial => PacketNumberSpace::Initial,
            QuicPacketType::Handshake => PacketNumberSpace::Handshake,
            _ => PacketNumberSpace::ApplicationData,
        }
    }

    /// Key epoch protecting this packet type.
    pub fn epoch(self) -> u16 {
        match self {
            QuicPacketType::Initial | QuicPacketType::Retry | QuicPacketType::VersionNegotiation => 0,
            QuicPacketType::ZeroRtt => 1,
            QuicPacketType::Handshake => 2,
            QuicPacketType::OneRtt => 3,
        }
    }

    /// Packet type used when the active cipher belongs to `epoch`.
    pub fn for_epoch(epoch: u16) -> Self {
        match epoch {
            0 => QuicPacketType::Initial,
            1 => QuicPacketType::ZeroRtt,
            2 => QuicPacketType::Handshake,
            _ => QuicPacketType::OneRtt,
        }
    }

    pub fn is_long_header(self) -> bool {
        self != QuicPacketType::OneRtt
    }

    /// Whether the packet carries a packet number and a protected payload.
    pub fn has_packet_number(self) -> bool {
        !matches!(self, QuicPacketType::Retry | QuicPacketType::VersionNegotiation)
    }

    fn long_type_bits(self) -> u8 {
        match self {
            QuicPacketType::Initial => 0,
            QuicPacketType::ZeroRtt => 1,
            QuicPacketType::Handshake => 2,
            _ => 3,
        }
    }
}

/// A QUIC packet as scripted or observed by the packet layer.
///
/// Unset fields are filled from the connection context. A packet without a
/// `payload` is a template and carries the frames coming from above.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuicPacket {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub packet_type: Option<QuicPacketType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination_connection_id: Option<Vec<u8>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_connection_id: Option<Vec<u8>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<Vec<u8>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub packet_number: Option<u64>,
    /// Plaintext frame bytes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Vec<u8>>,
    #[serde(skip)]
    pub authenticated: Option<bool>,
}

impl QuicPacket {
    pub fn template() -> Self {
        Self::default()
    }

    pub fn of_type(packet_type: QuicPacketType) -> Self {
        Self {
            packet_type: Some(packet_type),
            ..Self::default()
        }
    }

    pub fn is_template(&self) -> bool {
        self.payload.is_none()
    }
}

/// Header fields of a packet on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PacketHeader {
    pub packet_type: QuicPacketType,
    pub version: u32,
    pub destination_connection_id: Vec<u8>,
    pub source_connection_id: Vec<u8>,
    pub token: Vec<u8>,
    pub packet_number: u64,
}

impl PacketHeader {
    /// Header bytes for a payload of `protected_len` bytes (tag included).
    /// These bytes are also the AEAD additional data.
    pub fn encode(&self, protected_len: usize) -> Result<Vec<u8>, CodecError> {
        let mut out = Vec::with_capacity(32 + self.token.len());
        let pn_bits = (PACKET_NUMBER_LEN - 1) as u8;
        if self.packet_type.is_long_header() {
            out.push(LONG_HEADER | FIXED_BIT | (self.packet_type.long_type_bits() << 4) | pn_bits);
            out.extend_from_slice(&self.version.to_be_bytes());
            push_cid(&mut out, &self.destination_connection_id)?;
            push_cid(&mut out, &self.source_connection_id)?;
            if self.packet_type == QuicPacketType::Initial {
                encode_varint(self.token.len() as u64, &mut out)?;
                out.extend_from_slice(&self.token);
            }
            encode_varint((PACKET_NUMBER_LEN + protected_len) as u64, &mut out)?;
        } else {
            out.push(FIXED_BIT | pn_bits);
            out.extend_from_slice(&self.destination_connection_id);
        }
        out.extend_from_slice(&(self.packet_number as u32).to_be_bytes());
        Ok(out)
    }
}

fn push_cid(out: &mut Vec<u8>, cid: &[u8]) -> Result<(), CodecError> {
    let len = u8::try_from(cid.len()).map_err(|_| CodecError::LengthOverflow("connection id"))?;
    if len > 20 {
        return Err(CodecError::InvalidValue {
            what: "connection id length",
            value: u64::from(len),
        });
    }
    out.push(len);
    out.extend_from_slice(cid);
    Ok(())
}

/// A packet split into header, header bytes and protected payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WirePacket {
    pub header: PacketHeader,
    /// Raw header bytes, packet number included.
    pub header_bytes: Vec<u8>,
    pub protected_payload: Vec<u8>,
}

struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn take(&mut self, n: usize, what: &'static str) -> Result<&'a [u8], CodecError> {
        let end = self
            .pos
            .checked_add(n)
            .ok_or(CodecError::LengthOverflow("QUIC packet"))?;
        if end > self.data.len() {
            return Err(CodecError::incomplete(what, end, self.data.len()));
        }
        let out = &self.data[self.pos..end];
        self.pos = end;
        Ok(out)
    }

    fn varint(&mut self) -> Result<u64, CodecError> {
        let (v, used) = decode_varint(&self.data[self.pos..])?;
        self.pos += used;
        Ok(v)
    }

    fn packet_number(&mut self, len: usize) -> Result<u64, CodecError> {
        Ok(self
            .take(len, "packet number")?
            .iter()
            .fold(0u64, |acc, b| (acc << 8) | u64::from(*b)))
    }
}

/// Parse one packet from the front of a datagram.
///
/// `short_dcid_len` is the length of the connection ID the local end issued;
/// short header packets do not carry it. Returns `(packet, bytes_consumed)`.
pub fn parse_packet(data: &[u8], short_dcid_len: usize) -> Result<(WirePacket, usize), CodecError> {
    let mut c = Cursor { data, pos: 0 };
    let flags = c.take(1, "packet flags")?[0];
    let pn_len = usize::from(flags & 0x03) + 1;

    if flags & LONG_HEADER == 0 {
        let dcid = c.take(short_dcid_len, "connection id")?.to_vec();
        let packet_number = c.packet_number(pn_len)?;
        let header_bytes = data[..c.pos].to_vec();
        let protected_payload = data[c.pos..].to_vec();
        return Ok((
            WirePacket {
                header: PacketHeader {
                    packet_type: QuicPacketType::OneRtt,
                    version: 0,
                    destination_connection_id: dcid,
                    source_connection_id: Vec::new(),
                    token: Vec::new(),
                    packet_number,
                },
                header_bytes,
                protected_payload,
            },
            data.len(),
        ));
    }

    let version = u32::from_be_bytes(
        c.take(4, "version")?
            .try_into()
            .map_err(|_| CodecError::Malformed("version".into()))?,
    );
    let dcid_len = usize::from(c.take(1, "connection id length")?[0]);
    let dcid = c.take(dcid_len, "connection id")?.to_vec();
    let scid_len = usize::from(c.take(1, "connection id length")?[0]);
    let scid = c.take(scid_len, "connection id")?.to_vec();

    let packet_type = if version == 0 {
        QuicPacketType::VersionNegotiation
    } else {
        match (flags >> 4) & 0x03 {
            0 => QuicPacketType::Initial,
            1 => QuicPacketType::ZeroRtt,
            2 => QuicPacketType::Handshake,
            _ => QuicPacketType::Retry,
        }
    };

    let mut header = PacketHeader {
        packet_type,
        version,
        destination_connection_id: dcid,
        source_connection_id: scid,
        token: Vec::new(),
        packet_number: 0,
    };

    if !packet_type.has_packet_number() {
        // Retry and Version Negotiation run to the end of the datagram.
        let rest = data[c.pos..].to_vec();
        if packet_type == QuicPacketType::Retry {
            header.token = rest.clone();
        }
        return Ok((
            WirePacket {
                header,
                header_bytes: data[..c.pos].to_vec(),
                protected_payload: rest,
            },
            data.len(),
        ));
    }

    if packet_type == QuicPacketType::Initial {
        let token_len = c.varint()? as usize;
        header.token = c.take(token_len, "token")?.to_vec();
    }
    let length = c.varint()? as usize;
    if length < pn_len {
        return Err(CodecError::InvalidValue {
            what: "packet length",
            value: length as u64,
        });
    }
    header.packet_number = c.packet_number(pn_len)?;
    let header_bytes = data[..c.pos].to_vec();
    let protected_payload = c.take(length - pn_len, "packet payload")?.to_vec();
    Ok((
        WirePacket {
            header,
            header_bytes,
            protected_payload,
        },
        c.pos,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header(packet_type: QuicPacketType) -> PacketHeader {
        PacketHeader {
            packet_type,
            version: 1,
            destination_connection_id: vec![0xD1; 8],
            source_connection_id: vec![0x51; 4],
            token: Vec::new(),
            packet_number: 7,
        }
    }

    #[test]
    fn test_initial_packet_layout() {
        let mut h = header(QuicPacketType::Initial);
        h.token = vec![0xAA, 0xBB];
        let mut bytes = h.encode(3).unwrap();
        assert_eq!(bytes[0], 0xC3);
        bytes.extend_from_slice(&[1, 2, 3]);
        bytes.extend_from_slice(&[9, 9]); // coalesced trailing data

        let (wire, used) = parse_packet(&bytes, 0).unwrap();
        assert_eq!(used, bytes.len() - 2);
        assert_eq!(wire.header, h);
        assert_eq!(wire.protected_payload, vec![1, 2, 3]);
        assert_eq!(wire.header_bytes, h.encode(3).unwrap());
    }

    #[test]
    fn test_short_header_packet() {
        let h = PacketHeader {
            source_connection_id: Vec::new(),
            version: 0,
            ..header(QuicPacketType::OneRtt)
        };
        let mut bytes = h.encode(2).unwrap();
        assert_eq!(bytes[0], 0x43);
        bytes.extend_from_slice(&[5, 6]);
        let (wire, used) = parse_packet(&bytes, 8).unwrap();
        assert_eq!(used, bytes.len());
        assert_eq!(wire.header.packet_type, QuicPacketType::OneRtt);
        assert_eq!(wire.header.packet_number, 7);
        assert_eq!(wire.protected_payload, vec![5, 6]);
    }

    #[test]
    fn test_handshake_packet_type_bits() {
        let bytes = header(QuicPacketType::Handshake).encode(0).unwrap();
        let (wire, _) = parse_packet(&bytes, 0).unwrap();
        assert_eq!(wire.header.packet_type, QuicPacketType::Handshake);
        assert_eq!(QuicPacketType::Handshake.epoch(), 2);
        assert_eq!(QuicPacketType::for_epoch(3), QuicPacketType::OneRtt);
    }

    #[test]
    fn test_truncated_packet() {
        let mut bytes = header(QuicPacketType::Handshake).encode(10).unwrap();
        bytes.extend_from_slice(&[0; 4]);
        assert!(parse_packet(&bytes, 0).unwrap_err().is_incomplete());
    }

    #[test]
    fn test_oversized_connection_id_rejected() {
        let mut h = header(QuicPacketType::Initial);
        h.destination_connection_id = vec![0; 21];
        assert!(h.encode(0).is_err());
    }
}
