//! QUIC frame layer: carries handshake content in CRYPTO frames and
//! application content in STREAM frames.
//!
//! Alerts are mapped to CONNECTION_CLOSE frames with the crypto error code
//! `0x100 + description` (RFC 9001 §4.8) and back.

use tlscript_types::ActionError;
use tracing::{debug, warn};

use super::{
    configured_units, DataUnit, LayerData, LayerOutput, LayerType, ProcessingHint, ProtocolLayer,
};
use crate::context::TlsContext;
use crate::quic::frame::{parse_frames, QuicFrame};
use crate::quic::packet::QuicPacketType;
use crate::quic::PacketNumberSpace;
use crate::record::ContentType;

/// Error code range reserved for TLS alerts.
const CRYPTO_ERROR_BASE: u64 = 0x100;

/// Room left in a packet payload for the frame type, offset and length.
const FRAME_OVERHEAD: usize = 16;

/// Stream used for application data.
const APPLICATION_STREAM: u64 = 0;

fn as_frame(unit: &DataUnit) -> Option<&QuicFrame> {
    match unit {
        DataUnit::QuicFrame(f) => Some(f),
        _ => None,
    }
}

#[derive(Debug, Default)]
pub struct QuicFrameLayer;

impl QuicFrameLayer {
    pub fn new() -> Self {
        Self
    }
}

/// Frames produced by one send, with CRYPTO offsets assigned.
struct FrameWriter<'c> {
    ctx: &'c mut TlsContext,
    space: PacketNumberSpace,
    max_data: usize,
    frames: Vec<QuicFrame>,
}

impl FrameWriter<'_> {
    fn crypto(&mut self, data: Vec<u8>) {
        let offset = self.ctx.quic.reserve_crypto(self.space, data.len());
        self.frames.push(QuicFrame::Crypto {
            offset: Some(offset),
            data,
        });
    }

    fn content(&mut self, content_type: ContentType, bytes: Vec<u8>) {
        match content_type {
            ContentType::Handshake => {
                for chunk in bytes.chunks(self.max_data) {
                    self.crypto(chunk.to_vec());
                }
            }
            ContentType::ApplicationData => {
                let offset = self.ctx.quic.reserve_stream(APPLICATION_STREAM, bytes.len());
                self.frames.push(QuicFrame::Stream {
                    stream_id: APPLICATION_STREAM,
                    offset: Some(offset),
                    data: bytes,
                    fin: false,
                });
            }
            ContentType::Alert if bytes.len() >= 2 => {
                self.frames.push(QuicFrame::ConnectionClose {
                    error_code: CRYPTO_ERROR_BASE + u64::from(bytes[1]),
                    frame_type: Some(0),
                    reason: Vec::new(),
                });
            }
            other => {
                debug!(alias = self.ctx.alias(), content_type = ?other, "content not carried over QUIC");
            }
        }
    }
}

impl ProtocolLayer for QuicFrameLayer {
    fn layer_type(&self) -> LayerType {
        LayerType::QuicFrame
    }

    fn send(
        &mut self,
        ctx: &mut TlsContext,
        configured: &[DataUnit],
        input: Vec<LayerData>,
    ) -> Result<LayerOutput, ActionError> {
        let configured = configured_units(LayerType::QuicFrame, configured, as_frame)?;
        let space = QuicPacketType::for_epoch(ctx.write_epoch).space();
        let max_data = ctx.quic_max_packet_payload.saturating_sub(FRAME_OVERHEAD).max(1);
        let mut writer = FrameWriter {
            ctx,
            space,
            max_data,
            frames: Vec::new(),
        };

        // Handshake bytes form one stream that CRYPTO templates slice.
        let mut handshake = Vec::new();
        let mut others = Vec::new();
        for chunk in input {
            match chunk.content_type() {
                ContentType::Handshake => handshake.extend_from_slice(&chunk.bytes),
                ct => others.push((ct, chunk.bytes)),
            }
        }

        let mut as_planned = true;
        let mut consumed = 0;
        for frame in configured {
            match frame {
                QuicFrame::Crypto { offset, data } if data.is_empty() => {
                    if consumed >= handshake.len() {
                        warn!(alias = writer.ctx.alias(), "CRYPTO template left without data");
                        as_planned = false;
                        continue;
                    }
                    let end = handshake.len().min(consumed + max_data);
                    let data = handshake[consumed..end].to_vec();
                    consumed = end;
                    match offset {
                        Some(offset) => writer.frames.push(QuicFrame::Crypto {
                            offset: Some(*offset),
                            data,
                        }),
                        None => writer.crypto(data),
                    }
                }
                QuicFrame::Crypto { offset: None, data } => writer.crypto(data.clone()),
                other => writer.frames.push(other.clone()),
            }
        }
        if consumed < handshake.len() {
            writer.content(ContentType::Handshake, handshake.split_off(consumed));
        }
        for (ct, bytes) in others {
            writer.content(ct, bytes);
        }

        let mut units = Vec::with_capacity(writer.frames.len());
        let mut data = Vec::with_capacity(writer.frames.len());
        for frame in writer.frames {
            data.push(LayerData::raw(frame.to_bytes()?));
            units.push(DataUnit::QuicFrame(frame));
        }
        Ok(LayerOutput {
            units,
            data,
            executed_as_planned: as_planned,
        })
    }

    fn receive(&mut self, ctx: &mut TlsContext, input: Vec<LayerData>) -> Result<LayerOutput, ActionError> {
        let mut units = Vec::new();
        let mut data = Vec::new();
        for chunk in input {
            let packet_type = match chunk.hint {
                ProcessingHint::QuicPayload(pt) => pt,
                _ => QuicPacketType::for_epoch(ctx.read_epoch),
            };
            let frames = match parse_frames(&chunk.bytes) {
                Ok(frames) => frames,
                Err(e) => {
                    warn!(alias = ctx.alias(), ?packet_type, "unparseable frames: {e}");
                    continue;
                }
            };
            for frame in frames {
                match &frame {
                    QuicFrame::Crypto { offset, data: bytes } => {
                        let ready = ctx
                            .quic
                            .receive_crypto(packet_type.space(), offset.unwrap_or(0), bytes);
                        if !ready.is_empty() {
                            data.push(LayerData::content(ContentType::Handshake, ready));
                        }
                    }
                    QuicFrame::Stream { data: bytes, .. } if !bytes.is_empty() => {
                        data.push(LayerData::content(ContentType::ApplicationData, bytes.clone()));
                    }
                    QuicFrame::ConnectionClose {
                        error_code,
                        frame_type: Some(_),
                        ..
                    } if (CRYPTO_ERROR_BASE..CRYPTO_ERROR_BASE + 0x100).contains(error_code) => {
                        let description = (error_code - CRYPTO_ERROR_BASE) as u8;
                        data.push(LayerData::content(ContentType::Alert, vec![2, description]));
                    }
                    _ => {}
                }
                units.push(DataUnit::QuicFrame(frame));
            }
        }
        Ok(LayerOutput::new(units, data))
    }
}
