//! Protocol messages and the codec service that frames them.
//!
//! Message bodies are opaque to the engine: a [`ProtocolMessage`] is a closed
//! kind plus its body bytes. Field-level parsing lives behind
//! [`MessageCodec`]; [`handler`] extracts the handful of fields the
//! connection context tracks.

pub mod handler;
pub mod hello;

use std::fmt;

use serde::{Deserialize, Serialize};
use tlscript_types::CodecError;

use crate::alert::{Alert, AlertLevel};
use crate::handshake::{parse_handshake_header, wrap_handshake, HandshakeType};
use crate::record::ContentType;

/// Closed set of message kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageKind {
    Handshake(HandshakeType),
    ChangeCipherSpec,
    Alert,
    ApplicationData,
    Heartbeat,
    /// Content of a record type the codec does not know.
    Unknown(u8),
}

impl MessageKind {
    pub fn content_type(self) -> ContentType {
        match self {
            MessageKind::Handshake(_) => ContentType::Handshake,
            MessageKind::ChangeCipherSpec => ContentType::ChangeCipherSpec,
            MessageKind::Alert => ContentType::Alert,
            MessageKind::ApplicationData => ContentType::ApplicationData,
            MessageKind::Heartbeat => ContentType::Heartbeat,
            MessageKind::Unknown(v) => ContentType::from_u8(v),
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageKind::Handshake(HandshakeType::Unknown(v)) => write!(f, "Handshake({v})"),
            MessageKind::Handshake(t) => write!(f, "{t:?}"),
            MessageKind::Unknown(v) => write!(f, "Unknown({v})"),
            other => write!(f, "{other:?}"),
        }
    }
}

fn default_required() -> bool {
    true
}

fn is_required(required: &bool) -> bool {
    *required
}

/// A message unit of the message layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtocolMessage {
    pub kind: MessageKind,
    /// Body bytes; for handshake messages, without the handshake header.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub payload: Vec<u8>,
    /// Whether an expected message must be present for a receive to be as planned.
    #[serde(default = "default_required", skip_serializing_if = "is_required")]
    pub required: bool,
}

impl ProtocolMessage {
    pub fn new(kind: MessageKind, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            kind,
            payload: payload.into(),
            required: true,
        }
    }

    pub fn handshake(msg_type: HandshakeType, body: impl Into<Vec<u8>>) -> Self {
        Self::new(MessageKind::Handshake(msg_type), body)
    }

    pub fn change_cipher_spec() -> Self {
        Self::new(MessageKind::ChangeCipherSpec, vec![1])
    }

    pub fn alert(alert: Alert) -> Self {
        Self::new(MessageKind::Alert, alert.to_bytes().to_vec())
    }

    pub fn application_data(data: impl Into<Vec<u8>>) -> Self {
        Self::new(MessageKind::ApplicationData, data)
    }

    /// Mark an expected message as allowed to be absent.
    pub fn optional(mut self) -> Self {
        self.required = false;
        self
    }

    pub fn handshake_type(&self) -> Option<HandshakeType> {
        match self.kind {
            MessageKind::Handshake(t) => Some(t),
            _ => None,
        }
    }

    pub fn as_alert(&self) -> Option<Alert> {
        match self.kind {
            MessageKind::Alert => Alert::parse(&self.payload).ok(),
            _ => None,
        }
    }

    /// True for an alert whose level byte is `warning`, known description or not.
    pub fn is_warning_alert(&self) -> bool {
        self.kind == MessageKind::Alert && self.payload.first() == Some(&(AlertLevel::Warning as u8))
    }

    pub fn is_fatal_alert(&self) -> bool {
        self.kind == MessageKind::Alert && self.payload.first() == Some(&(AlertLevel::Fatal as u8))
    }
}

/// Message serialization service.
pub trait MessageCodec: fmt::Debug + Send {
    fn serialize(&self, message: &ProtocolMessage) -> Result<Vec<u8>, CodecError>;

    /// Parse one message of `content_type` from the front of `data`.
    ///
    /// Returns `(message, bytes_consumed)`, or an incomplete error when the
    /// message continues in data not yet received.
    fn parse(
        &self,
        content_type: ContentType,
        data: &[u8],
    ) -> Result<(ProtocolMessage, usize), CodecError>;
}

/// Frames handshake messages with their 4-byte header and passes every other
/// kind through as its raw body.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultMessageCodec;

impl MessageCodec for DefaultMessageCodec {
    fn serialize(&self, message: &ProtocolMessage) -> Result<Vec<u8>, CodecError> {
        match message.kind {
            MessageKind::Handshake(t) => wrap_handshake(t, &message.payload),
            _ => Ok(message.payload.clone()),
        }
    }

    fn parse(
        &self,
        content_type: ContentType,
        data: &[u8],
    ) -> Result<(ProtocolMessage, usize), CodecError> {
        let fixed = |kind: MessageKind, len: usize, what: &'static str| {
            if data.len() < len {
                Err(CodecError::incomplete(what, len, data.len()))
            } else {
                Ok((ProtocolMessage::new(kind, data[..len].to_vec()), len))
            }
        };
        match content_type {
            ContentType::Handshake => {
                let (t, body, consumed) = parse_handshake_header(data)?;
                Ok((ProtocolMessage::handshake(t, body.to_vec()), consumed))
            }
            ContentType::ChangeCipherSpec => fixed(MessageKind::ChangeCipherSpec, 1, "change cipher spec"),
            ContentType::Alert => fixed(MessageKind::Alert, 2, "alert"),
            ContentType::ApplicationData => fixed(MessageKind::ApplicationData, data.len().max(1), "application data"),
            ContentType::Heartbeat => fixed(MessageKind::Heartbeat, data.len().max(1), "heartbeat"),
            other => fixed(MessageKind::Unknown(other.as_u8()), data.len().max(1), "message"),
        }
    }
}
