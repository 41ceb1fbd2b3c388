//! QUIC framing primitives: variable-length integers, packet number spaces
//! and per-connection stream state.

pub mod frame;
pub mod packet;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tlscript_types::CodecError;

/// Largest value a variable-length integer can hold.
pub const MAX_VARINT: u64 = (1 << 62) - 1;

/// Encode a variable-length integer (RFC 9000 §16) using the shortest form.
pub fn encode_varint(v: u64, out: &mut Vec<u8>) -> Result<(), CodecError> {
    match v {
        0..=0x3F => out.push(v as u8),
        0x40..=0x3FFF => out.extend_from_slice(&((v as u16) | 0x4000).to_be_bytes()),
        0x4000..=0x3FFF_FFFF => out.extend_from_slice(&((v as u32) | 0x8000_0000).to_be_bytes()),
        0x4000_0000..=MAX_VARINT => out.extend_from_slice(&(v | 0xC000_0000_0000_0000).to_be_bytes()),
        _ => return Err(CodecError::LengthOverflow("varint")),
    }
    Ok(())
}

/// Decode a variable-length integer. Returns `(value, bytes_consumed)`.
pub fn decode_varint(data: &[u8]) -> Result<(u64, usize), CodecError> {
    let first = *data
        .first()
        .ok_or_else(|| CodecError::incomplete("varint", 1, 0))?;
    let len = 1usize << (first >> 6);
    if data.len() < len {
        return Err(CodecError::incomplete("varint", len, data.len()));
    }
    let mut v = u64::from(first & 0x3F);
    for b in &data[1..len] {
        v = (v << 8) | u64::from(*b);
    }
    Ok((v, len))
}

/// Packet number spaces (RFC 9000 §12.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PacketNumberSpace {
    Initial,
    Handshake,
    ApplicationData,
}

impl PacketNumberSpace {
    fn index(self) -> usize {
        match self {
            PacketNumberSpace::Initial => 0,
            PacketNumberSpace::Handshake => 1,
            PacketNumberSpace::ApplicationData => 2,
        }
    }
}

/// In-order delivery of one CRYPTO stream.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CryptoStreamBuffer {
    next_offset: u64,
    pending: BTreeMap<u64, Vec<u8>>,
}

impl CryptoStreamBuffer {
    /// Add data at `offset` and return the bytes that became contiguous.
    pub fn insert(&mut self, offset: u64, data: &[u8]) -> Vec<u8> {
        let end = offset + data.len() as u64;
        if end > self.next_offset {
            let skip = self.next_offset.saturating_sub(offset) as usize;
            let start = offset.max(self.next_offset);
            self.pending
                .entry(start)
                .and_modify(|existing| {
                    if existing.len() < data.len() - skip {
                        *existing = data[skip..].to_vec();
                    }
                })
                .or_insert_with(|| data[skip..].to_vec());
        }

        let mut out = Vec::new();
        while let Some((&start, _)) = self.pending.first_key_value() {
            if start > self.next_offset {
                break;
            }
            let chunk = self.pending.remove(&start).unwrap_or_default();
            let chunk_end = start + chunk.len() as u64;
            if chunk_end > self.next_offset {
                let skip = (self.next_offset - start) as usize;
                out.extend_from_slice(&chunk[skip..]);
                self.next_offset = chunk_end;
            }
        }
        out
    }

    pub fn next_offset(&self) -> u64 {
        self.next_offset
    }
}

/// Per-connection QUIC bookkeeping, one slot per packet number space.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QuicState {
    next_packet_number: [u64; 3],
    largest_received: [Option<u64>; 3],
    crypto_send_offset: [u64; 3],
    crypto_receive: [CryptoStreamBuffer; 3],
    /// Stream data offsets for STREAM frames we generate, by stream id.
    stream_send_offset: BTreeMap<u64, u64>,
}

impl QuicState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Next packet number of `space`, advancing the counter.
    pub fn next_packet_number(&mut self, space: PacketNumberSpace) -> u64 {
        let slot = &mut self.next_packet_number[space.index()];
        let pn = *slot;
        *slot += 1;
        pn
    }

    pub fn set_next_packet_number(&mut self, space: PacketNumberSpace, pn: u64) {
        self.next_packet_number[space.index()] = pn;
    }

    pub fn record_received(&mut self, space: PacketNumberSpace, pn: u64) {
        let slot = &mut self.largest_received[space.index()];
        *slot = Some(slot.map_or(pn, |l| l.max(pn)));
    }

    pub fn largest_received(&self, space: PacketNumberSpace) -> Option<u64> {
        self.largest_received[space.index()]
    }

    /// Reserve `len` bytes of the CRYPTO stream; returns their offset.
    pub fn reserve_crypto(&mut self, space: PacketNumberSpace, len: usize) -> u64 {
        let slot = &mut self.crypto_send_offset[space.index()];
        let offset = *slot;
        *slot += len as u64;
        offset
    }

    pub fn receive_crypto(&mut self, space: PacketNumberSpace, offset: u64, data: &[u8]) -> Vec<u8> {
        self.crypto_receive[space.index()].insert(offset, data)
    }

    /// Reserve `len` bytes of stream `id`; returns their offset.
    pub fn reserve_stream(&mut self, id: u64, len: usize) -> u64 {
        let slot = self.stream_send_offset.entry(id).or_insert(0);
        let offset = *slot;
        *slot += len as u64;
        offset
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_varint_rfc9000_examples() {
        // RFC 9000 Appendix A.1
        assert_eq!(
            decode_varint(&[0xc2, 0x19, 0x7c, 0x5e, 0xff, 0x14, 0xe8, 0x8c]).unwrap(),
            (151_288_809_941_952_652, 8)
        );
        assert_eq!(decode_varint(&[0x9d, 0x7f, 0x3e, 0x7d]).unwrap(), (494_878_333, 4));
        assert_eq!(decode_varint(&[0x7b, 0xbd]).unwrap(), (15_293, 2));
        assert_eq!(decode_varint(&[0x25]).unwrap(), (37, 1));
        assert_eq!(decode_varint(&[0x40, 0x25]).unwrap(), (37, 2));

        let mut out = Vec::new();
        encode_varint(15_293, &mut out).unwrap();
        assert_eq!(out, vec![0x7b, 0xbd]);
    }

    #[test]
    fn test_varint_limits() {
        let mut out = Vec::new();
        encode_varint(MAX_VARINT, &mut out).unwrap();
        assert_eq!(decode_varint(&out).unwrap(), (MAX_VARINT, 8));
        assert!(encode_varint(MAX_VARINT + 1, &mut out).is_err());
        assert!(decode_varint(&[0x80, 0x01]).unwrap_err().is_incomplete());
        assert!(decode_varint(&[]).is_err());
    }

    #[test]
    fn test_crypto_stream_reordering() {
        let mut buf = CryptoStreamBuffer::default();
        assert!(buf.insert(3, b"def").is_empty());
        assert_eq!(buf.insert(0, b"abc"), b"abcdef");
        assert_eq!(buf.next_offset(), 6);
        // Retransmitted overlap only yields new bytes.
        assert_eq!(buf.insert(4, b"efgh"), b"gh");
        assert!(buf.insert(0, b"ab").is_empty());
    }

    #[test]
    fn test_packet_numbers_per_space() {
        let mut state = QuicState::new();
        assert_eq!(state.next_packet_number(PacketNumberSpace::Initial), 0);
        assert_eq!(state.next_packet_number(PacketNumberSpace::Initial), 1);
        assert_eq!(state.next_packet_number(PacketNumberSpace::Handshake), 0);
        state.record_received(PacketNumberSpace::ApplicationData, 7);
        state.record_received(PacketNumberSpace::ApplicationData, 3);
        assert_eq!(state.largest_received(PacketNumberSpace::ApplicationData), Some(7));
        assert_eq!(state.reserve_crypto(PacketNumberSpace::Initial, 10), 0);
        assert_eq!(state.reserve_crypto(PacketNumberSpace::Initial, 5), 10);
        state.reset();
        assert_eq!(state.next_packet_number(PacketNumberSpace::Initial), 0);
    }
}
