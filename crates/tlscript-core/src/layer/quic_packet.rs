//! QUIC packet layer: packs frames into packets protected with the cipher of
//! the packet type's key epoch, and splits coalesced datagrams on receive.
//!
//! Header protection is not applied; the packet number is sent in the clear
//! with a fixed length of four bytes.

use std::collections::VecDeque;

use tlscript_types::ActionError;
use tracing::{debug, warn};

use super::{configured_units, DataUnit, LayerData, LayerOutput, LayerType, ProcessingHint, ProtocolLayer};
use crate::context::TlsContext;
use crate::quic::packet::{parse_packet, PacketHeader, QuicPacket, QuicPacketType, WirePacket};
use crate::record::cipher::RecordCryptoInput;
use crate::record::ContentType;
use crate::ProtocolVersion;

fn as_packet(unit: &DataUnit) -> Option<&QuicPacket> {
    match unit {
        DataUnit::QuicPacket(p) => Some(p),
        _ => None,
    }
}

fn crypto_input(packet_type: QuicPacketType, packet_number: u64, header: &[u8]) -> RecordCryptoInput<'_> {
    RecordCryptoInput {
        content_type: ContentType::ApplicationData,
        version: ProtocolVersion::TLS13,
        epoch: packet_type.epoch(),
        sequence_number: packet_number,
        dtls: false,
        header: Some(header),
    }
}

/// Take frames from the front of `frames` while they fit in `max` bytes.
/// The first frame is always taken.
fn pack(frames: &mut VecDeque<Vec<u8>>, max: usize) -> Vec<u8> {
    let mut payload = Vec::new();
    while let Some(frame) = frames.front() {
        if !payload.is_empty() && payload.len() + frame.len() > max {
            break;
        }
        payload.extend_from_slice(frame);
        frames.pop_front();
    }
    payload
}

#[derive(Debug, Default)]
pub struct QuicPacketLayer;

impl QuicPacketLayer {
    pub fn new() -> Self {
        Self
    }

    fn write_packet(
        ctx: &mut TlsContext,
        packet: &QuicPacket,
        payload: Vec<u8>,
    ) -> Result<(QuicPacket, Vec<u8>), ActionError> {
        let packet_type = packet
            .packet_type
            .unwrap_or_else(|| QuicPacketType::for_epoch(ctx.write_epoch));
        if !packet_type.has_packet_number() {
            return Err(ActionError::layer(
                LayerType::QuicPacket.name(),
                format!("cannot send {packet_type:?} packets"),
            ));
        }
        let packet_number = match packet.packet_number {
            Some(pn) => pn,
            None => ctx.quic.next_packet_number(packet_type.space()),
        };
        let header = PacketHeader {
            packet_type,
            version: packet.version.unwrap_or(ctx.quic_version),
            destination_connection_id: packet
                .destination_connection_id
                .clone()
                .unwrap_or_else(|| ctx.write_connection_id.clone()),
            source_connection_id: packet
                .source_connection_id
                .clone()
                .unwrap_or_else(|| ctx.read_connection_id.clone()),
            token: packet.token.clone().unwrap_or_default(),
            packet_number,
        };

        let cipher = &mut ctx.encryptor.cipher_for_epoch_or_current(packet_type.epoch()).cipher;
        let header_bytes = header.encode(payload.len() + cipher.tag_len())?;
        let protected = cipher.encrypt(&crypto_input(packet_type, packet_number, &header_bytes), &payload)?;

        let mut bytes = header_bytes;
        bytes.extend_from_slice(&protected.fragment);
        let sent = QuicPacket {
            packet_type: Some(packet_type),
            version: Some(header.version),
            destination_connection_id: Some(header.destination_connection_id),
            source_connection_id: Some(header.source_connection_id),
            token: (packet_type == QuicPacketType::Initial).then_some(header.token),
            packet_number: Some(packet_number),
            payload: Some(payload),
            authenticated: None,
        };
        Ok((sent, bytes))
    }

    fn read_packet(ctx: &mut TlsContext, wire: WirePacket) -> (QuicPacket, Option<LayerData>) {
        let header = wire.header;
        let packet_type = header.packet_type;
        let mut packet = QuicPacket {
            packet_type: Some(packet_type),
            version: Some(header.version),
            destination_connection_id: Some(header.destination_connection_id),
            source_connection_id: packet_type
                .is_long_header()
                .then_some(header.source_connection_id),
            token: (!header.token.is_empty()).then_some(header.token),
            packet_number: packet_type.has_packet_number().then_some(header.packet_number),
            payload: None,
            authenticated: None,
        };
        if !packet_type.has_packet_number() {
            packet.payload = Some(wire.protected_payload);
            return (packet, None);
        }

        let input = crypto_input(packet_type, header.packet_number, &wire.header_bytes);
        let opened = ctx
            .decryptor
            .cipher_for_epoch_or_current(packet_type.epoch())
            .cipher
            .decrypt(&input, &wire.protected_payload);
        match opened {
            Ok(plain) => {
                ctx.quic.record_received(packet_type.space(), header.packet_number);
                packet.authenticated = Some(true);
                packet.payload = Some(plain.fragment.clone());
                let data = LayerData {
                    hint: ProcessingHint::QuicPayload(packet_type),
                    bytes: plain.fragment,
                };
                (packet, Some(data))
            }
            Err(e) => {
                warn!(
                    alias = ctx.alias(),
                    ?packet_type,
                    pn = header.packet_number,
                    "packet could not be decrypted: {e}"
                );
                packet.authenticated = Some(false);
                (packet, None)
            }
        }
    }
}

impl ProtocolLayer for QuicPacketLayer {
    fn layer_type(&self) -> LayerType {
        LayerType::QuicPacket
    }

    fn send(
        &mut self,
        ctx: &mut TlsContext,
        configured: &[DataUnit],
        input: Vec<LayerData>,
    ) -> Result<LayerOutput, ActionError> {
        let configured = configured_units(LayerType::QuicPacket, configured, as_packet)?;
        let max = ctx.quic_max_packet_payload.max(1);
        let mut frames: VecDeque<Vec<u8>> = input.into_iter().map(|d| d.bytes).collect();
        let mut planned = Vec::new();
        let mut as_planned = true;

        for packet in configured {
            match &packet.payload {
                Some(payload) => planned.push((packet.clone(), payload.clone())),
                None if frames.is_empty() => {
                    warn!(alias = ctx.alias(), "packet template left without frames");
                    as_planned = false;
                }
                None => {
                    let payload = pack(&mut frames, max);
                    planned.push((packet.clone(), payload));
                }
            }
        }
        while !frames.is_empty() {
            let payload = pack(&mut frames, max);
            planned.push((QuicPacket::template(), payload));
        }

        let mut units = Vec::with_capacity(planned.len());
        let mut data = Vec::with_capacity(planned.len());
        for (packet, payload) in planned {
            let (sent, bytes) = Self::write_packet(ctx, &packet, payload)?;
            debug!(
                alias = ctx.alias(),
                packet_type = ?sent.packet_type,
                pn = ?sent.packet_number,
                "packet written"
            );
            units.push(DataUnit::QuicPacket(sent));
            data.push(LayerData::raw(bytes));
        }
        Ok(LayerOutput {
            units,
            data,
            executed_as_planned: as_planned,
        })
    }

    fn receive(&mut self, ctx: &mut TlsContext, input: Vec<LayerData>) -> Result<LayerOutput, ActionError> {
        let dcid_len = ctx.read_connection_id.len();
        let mut units = Vec::new();
        let mut data = Vec::new();
        for datagram in input {
            let mut rest = datagram.bytes.as_slice();
            while !rest.is_empty() {
                match parse_packet(rest, dcid_len) {
                    Ok((wire, used)) => {
                        rest = &rest[used..];
                        let (packet, payload) = Self::read_packet(ctx, wire);
                        units.push(DataUnit::QuicPacket(packet));
                        data.extend(payload);
                    }
                    Err(e) => {
                        warn!(alias = ctx.alias(), len = rest.len(), "unparseable packet data: {e}");
                        break;
                    }
                }
            }
        }
        Ok(LayerOutput::new(units, data))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::crypt::CipherDirection;
    use crate::quic::frame::QuicFrame;
    use crate::quic::PacketNumberSpace;
    use crate::ConnectionEnd;

    fn pair() -> (TlsContext, TlsContext) {
        let config = Config::builder()
            .default_protocol_version(ProtocolVersion::TLS13)
            .quic_max_packet_payload(64)
            .build();
        let mut client = TlsContext::new("client", ConnectionEnd::Client, &config);
        let mut server = TlsContext::new("server", ConnectionEnd::Server, &config);
        client.write_connection_id = vec![0x5E; 8];
        client.read_connection_id = vec![0xC1; 4];
        server.write_connection_id = vec![0xC1; 4];
        server.read_connection_id = vec![0x5E; 8];
        for ctx in [&mut client, &mut server] {
            ctx.client_random = vec![1; 32];
            ctx.server_random = vec![2; 32];
            ctx.master_secret = vec![3; 48];
        }
        (client, server)
    }

    fn frame(f: QuicFrame) -> LayerData {
        LayerData::raw(f.to_bytes().unwrap())
    }

    #[test]
    fn test_initial_packets_roundtrip_coalesced() {
        let (mut client, mut server) = pair();
        let input = vec![
            frame(QuicFrame::Crypto {
                offset: Some(0),
                data: vec![9; 40],
            }),
            frame(QuicFrame::Crypto {
                offset: Some(40),
                data: vec![8; 40],
            }),
        ];
        let out = QuicPacketLayer::new().send(&mut client, &[], input).unwrap();
        assert_eq!(out.units.len(), 2);
        let datagram: Vec<u8> = out.data.into_iter().flat_map(|d| d.bytes).collect();

        let back = QuicPacketLayer::new()
            .receive(&mut server, vec![LayerData::raw(datagram)])
            .unwrap();
        assert_eq!(back.units.len(), 2);
        let pns: Vec<_> = back
            .units
            .iter()
            .map(|u| match u {
                DataUnit::QuicPacket(p) => (p.packet_type, p.packet_number, p.authenticated),
                _ => unreachable!(),
            })
            .collect();
        assert_eq!(
            pns,
            vec![
                (Some(QuicPacketType::Initial), Some(0), Some(true)),
                (Some(QuicPacketType::Initial), Some(1), Some(true)),
            ]
        );
        assert_eq!(back.data[0].hint, ProcessingHint::QuicPayload(QuicPacketType::Initial));
        assert_eq!(server.quic.largest_received(PacketNumberSpace::Initial), Some(1));
    }

    #[test]
    fn test_handshake_packets_are_protected() {
        let (mut client, mut server) = pair();
        client.activate_cipher(CipherDirection::Encrypt, Some(2)).unwrap();
        server.activate_cipher(CipherDirection::Decrypt, Some(2)).unwrap();

        let payload = QuicFrame::HandshakeDone.to_bytes().unwrap();
        let out = QuicPacketLayer::new()
            .send(&mut client, &[], vec![LayerData::raw(payload.clone())])
            .unwrap();
        let sent = match &out.units[0] {
            DataUnit::QuicPacket(p) => p.clone(),
            _ => unreachable!(),
        };
        assert_eq!(sent.packet_type, Some(QuicPacketType::Handshake));
        assert!(out.data[0].bytes.len() > payload.len() + 16);

        let back = QuicPacketLayer::new().receive(&mut server, out.data).unwrap();
        assert_eq!(back.data[0].bytes, payload);
    }

    #[test]
    fn test_wrong_keys_mark_packet_unauthenticated() {
        let (mut client, mut server) = pair();
        client.activate_cipher(CipherDirection::Encrypt, Some(3)).unwrap();
        server.master_secret = vec![4; 48];
        server.activate_cipher(CipherDirection::Decrypt, Some(3)).unwrap();

        let out = QuicPacketLayer::new()
            .send(&mut client, &[], vec![frame(QuicFrame::Ping)])
            .unwrap();
        let back = QuicPacketLayer::new().receive(&mut server, out.data).unwrap();
        match &back.units[0] {
            DataUnit::QuicPacket(p) => {
                assert_eq!(p.packet_type, Some(QuicPacketType::OneRtt));
                assert_eq!(p.authenticated, Some(false));
            }
            _ => unreachable!(),
        }
        assert!(back.data.is_empty());
    }

    #[test]
    fn test_configured_packets() {
        let (mut client, _) = pair();
        let configured = vec![
            DataUnit::QuicPacket(QuicPacket {
                packet_number: Some(42),
                ..QuicPacket::of_type(QuicPacketType::Handshake)
            }),
            DataUnit::QuicPacket(QuicPacket::template()),
        ];
        let out = QuicPacketLayer::new()
            .send(&mut client, &configured, vec![frame(QuicFrame::Ping)])
            .unwrap();
        assert!(!out.executed_as_planned);
        match &out.units[0] {
            DataUnit::QuicPacket(p) => {
                assert_eq!(p.packet_number, Some(42));
                assert_eq!(p.packet_type, Some(QuicPacketType::Handshake));
            }
            _ => unreachable!(),
        }
    }
}
