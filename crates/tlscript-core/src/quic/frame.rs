//! QUIC frames (RFC 9000 §19), the subset a TLS handshake over QUIC uses.

use serde::{Deserialize, Serialize};
use tlscript_types::CodecError;

use super::{decode_varint, encode_varint};

const PADDING: u64 = 0x00;
const PING: u64 = 0x01;
const ACK: u64 = 0x02;
const ACK_ECN: u64 = 0x03;
const NEW_TOKEN: u64 = 0x07;
const CRYPTO: u64 = 0x06;
const STREAM_BASE: u64 = 0x08;
const STREAM_MAX: u64 = 0x0f;
const MAX_DATA: u64 = 0x10;
const CONNECTION_CLOSE: u64 = 0x1c;
const CONNECTION_CLOSE_APP: u64 = 0x1d;
const HANDSHAKE_DONE: u64 = 0x1e;

const STREAM_OFF: u64 = 0x04;
const STREAM_LEN: u64 = 0x02;
const STREAM_FIN: u64 = 0x01;

/// Frame kinds, used to match received frames against expectations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum QuicFrameType {
    Padding,
    Ping,
    Ack,
    Crypto,
    NewToken,
    Stream,
    MaxData,
    ConnectionClose,
    HandshakeDone,
}

/// One QUIC frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum QuicFrame {
    /// A run of padding bytes.
    Padding { length: usize },
    Ping,
    Ack {
        largest_acknowledged: u64,
        ack_delay: u64,
        first_ack_range: u64,
    },
    /// Handshake data. On send, a frame with empty `data` is a template that
    /// carries the next slice of the message stream.
    Crypto {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        offset: Option<u64>,
        #[serde(default)]
        data: Vec<u8>,
    },
    NewToken { token: Vec<u8> },
    Stream {
        stream_id: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        offset: Option<u64>,
        #[serde(default)]
        data: Vec<u8>,
        #[serde(default)]
        fin: bool,
    },
    MaxData { maximum: u64 },
    ConnectionClose {
        error_code: u64,
        /// Present for transport-level closes, absent for application closes.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        frame_type: Option<u64>,
        #[serde(default)]
        reason: Vec<u8>,
    },
    HandshakeDone,
}

impl QuicFrame {
    /// An empty CRYPTO frame, filled by the frame layer from the data above.
    pub fn crypto_template() -> Self {
        QuicFrame::Crypto {
            offset: None,
            data: Vec::new(),
        }
    }

    pub fn frame_type(&self) -> QuicFrameType {
        match self {
            QuicFrame::Padding { .. } => QuicFrameType::Padding,
            QuicFrame::Ping => QuicFrameType::Ping,
            QuicFrame::Ack { .. } => QuicFrameType::Ack,
            QuicFrame::Crypto { .. } => QuicFrameType::Crypto,
            QuicFrame::NewToken { .. } => QuicFrameType::NewToken,
            QuicFrame::Stream { .. } => QuicFrameType::Stream,
            QuicFrame::MaxData { .. } => QuicFrameType::MaxData,
            QuicFrame::ConnectionClose { .. } => QuicFrameType::ConnectionClose,
            QuicFrame::HandshakeDone => QuicFrameType::HandshakeDone,
        }
    }

    pub fn is_template(&self) -> bool {
        matches!(self, QuicFrame::Crypto { data, .. } if data.is_empty())
    }

    /// Whether the frame requires the peer to acknowledge it.
    pub fn is_ack_eliciting(&self) -> bool {
        !matches!(
            self,
            QuicFrame::Padding { .. } | QuicFrame::Ack { .. } | QuicFrame::ConnectionClose { .. }
        )
    }

    /// Append the wire encoding. Unset offsets are written as 0.
    pub fn encode(&self, out: &mut Vec<u8>) -> Result<(), CodecError> {
        match self {
            QuicFrame::Padding { length } => out.resize(out.len() + length, 0),
            QuicFrame::Ping => encode_varint(PING, out)?,
            QuicFrame::Ack {
                largest_acknowledged,
                ack_delay,
                first_ack_range,
            } => {
                encode_varint(ACK, out)?;
                encode_varint(*largest_acknowledged, out)?;
                encode_varint(*ack_delay, out)?;
                encode_varint(0, out)?;
                encode_varint(*first_ack_range, out)?;
            }
            QuicFrame::Crypto { offset, data } => {
                encode_varint(CRYPTO, out)?;
                encode_varint(offset.unwrap_or(0), out)?;
                encode_varint(data.len() as u64, out)?;
                out.extend_from_slice(data);
            }
            QuicFrame::NewToken { token } => {
                encode_varint(NEW_TOKEN, out)?;
                encode_varint(token.len() as u64, out)?;
                out.extend_from_slice(token);
            }
            QuicFrame::Stream {
                stream_id,
                offset,
                data,
                fin,
            } => {
                let mut ty = STREAM_BASE | STREAM_OFF | STREAM_LEN;
                if *fin {
                    ty |= STREAM_FIN;
                }
                encode_varint(ty, out)?;
                encode_varint(*stream_id, out)?;
                encode_varint(offset.unwrap_or(0), out)?;
                encode_varint(data.len() as u64, out)?;
                out.extend_from_slice(data);
            }
            QuicFrame::MaxData { maximum } => {
                encode_varint(MAX_DATA, out)?;
                encode_varint(*maximum, out)?;
            }
            QuicFrame::ConnectionClose {
                error_code,
                frame_type,
                reason,
            } => {
                match frame_type {
                    Some(ft) => {
                        encode_varint(CONNECTION_CLOSE, out)?;
                        encode_varint(*error_code, out)?;
                        encode_varint(*ft, out)?;
                    }
                    None => {
                        encode_varint(CONNECTION_CLOSE_APP, out)?;
                        encode_varint(*error_code, out)?;
                    }
                }
                encode_varint(reason.len() as u64, out)?;
                out.extend_from_slice(reason);
            }
            QuicFrame::HandshakeDone => encode_varint(HANDSHAKE_DONE, out)?,
        }
        Ok(())
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, CodecError> {
        let mut out = Vec::new();
        self.encode(&mut out)?;
        Ok(out)
    }

    /// Parse one frame from the front of `data`. Returns `(frame, bytes_consumed)`.
    pub fn parse(data: &[u8]) -> Result<(Self, usize), CodecError> {
        let mut r = VarReader { data, pos: 0 };
        let ty = r.varint()?;
        let frame = match ty {
            PADDING => {
                let run = data[r.pos..].iter().take_while(|&&b| b == 0).count();
                r.pos += run;
                QuicFrame::Padding { length: run + 1 }
            }
            PING => QuicFrame::Ping,
            ACK | ACK_ECN => {
                let largest_acknowledged = r.varint()?;
                let ack_delay = r.varint()?;
                let range_count = r.varint()?;
                let first_ack_range = r.varint()?;
                for _ in 0..range_count {
                    r.varint()?;
                    r.varint()?;
                }
                if ty == ACK_ECN {
                    for _ in 0..3 {
                        r.varint()?;
                    }
                }
                QuicFrame::Ack {
                    largest_acknowledged,
                    ack_delay,
                    first_ack_range,
                }
            }
            CRYPTO => {
                let offset = r.varint()?;
                let data = r.vec()?;
                QuicFrame::Crypto {
                    offset: Some(offset),
                    data,
                }
            }
            NEW_TOKEN => QuicFrame::NewToken { token: r.vec()? },
            STREAM_BASE..=STREAM_MAX => {
                let stream_id = r.varint()?;
                let offset = if ty & STREAM_OFF != 0 { r.varint()? } else { 0 };
                let data = if ty & STREAM_LEN != 0 {
                    r.vec()?
                } else {
                    r.rest()
                };
                QuicFrame::Stream {
                    stream_id,
                    offset: Some(offset),
                    data,
                    fin: ty & STREAM_FIN != 0,
                }
            }
            MAX_DATA => QuicFrame::MaxData { maximum: r.varint()? },
            CONNECTION_CLOSE | CONNECTION_CLOSE_APP => {
                let error_code = r.varint()?;
                let frame_type = if ty == CONNECTION_CLOSE {
                    Some(r.varint()?)
                } else {
                    None
                };
                QuicFrame::ConnectionClose {
                    error_code,
                    frame_type,
                    reason: r.vec()?,
                }
            }
            HANDSHAKE_DONE => QuicFrame::HandshakeDone,
            other => {
                return Err(CodecError::InvalidValue {
                    what: "QUIC frame type",
                    value: other,
                })
            }
        };
        Ok((frame, r.pos))
    }
}

/// Parse every frame of a packet payload.
pub fn parse_frames(mut payload: &[u8]) -> Result<Vec<QuicFrame>, CodecError> {
    let mut frames = Vec::new();
    while !payload.is_empty() {
        let (frame, used) = QuicFrame::parse(payload)?;
        frames.push(frame);
        payload = &payload[used..];
    }
    Ok(frames)
}

struct VarReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl VarReader<'_> {
    fn varint(&mut self) -> Result<u64, CodecError> {
        let (v, used) = decode_varint(&self.data[self.pos..])?;
        self.pos += used;
        Ok(v)
    }

    fn vec(&mut self) -> Result<Vec<u8>, CodecError> {
        let len = self.varint()? as usize;
        let end = self
            .pos
            .checked_add(len)
            .ok_or(CodecError::LengthOverflow("QUIC frame"))?;
        if end > self.data.len() {
            return Err(CodecError::incomplete("QUIC frame", end, self.data.len()));
        }
        let out = self.data[self.pos..end].to_vec();
        self.pos = end;
        Ok(out)
    }

    fn rest(&mut self) -> Vec<u8> {
        let out = self.data[self.pos..].to_vec();
        self.pos = self.data.len();
        out
    }
}
