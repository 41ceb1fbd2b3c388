//! Protocol layers and the stack that chains them.
//!
//! A [`ProtocolLayer`] converts between its own unit type and the bytes of
//! the layer below. On send, data flows top-down as [`LayerData`] chunks; on
//! receive, bytes fetched from the transport flow bottom-up. Every layer
//! reports the units it produced in a [`LayerProcessingResult`].

pub mod config;
pub mod fragment;
pub mod message;
pub mod quic_frame;
pub mod quic_packet;
pub mod record;
pub mod result;
pub mod stack;

use std::fmt;

use serde::{Deserialize, Serialize};
use tlscript_types::ActionError;

use crate::context::TlsContext;
use crate::handshake::fragment::DtlsFragment;
use crate::handshake::HandshakeType;
use crate::message::{DefaultMessageCodec, MessageKind, ProtocolMessage};
use crate::quic::frame::{QuicFrame, QuicFrameType};
use crate::quic::packet::{QuicPacket, QuicPacketType};
use crate::record::{ContentType, Record};

pub use config::{LayerConfiguration, LayerDirective, MatchOptions};
pub use fragment::DtlsFragmentLayer;
pub use message::MessageLayer;
pub use quic_frame::QuicFrameLayer;
pub use quic_packet::QuicPacketLayer;
pub use record::RecordLayer;
pub use result::{LayerProcessingResult, LayerStackProcessingResult};
pub use stack::{LayerStack, ToggleMode};

/// Closed set of layer kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LayerType {
    Message,
    DtlsFragment,
    Record,
    QuicFrame,
    QuicPacket,
}

impl LayerType {
    pub fn name(self) -> &'static str {
        match self {
            LayerType::Message => "Message",
            LayerType::DtlsFragment => "DtlsFragment",
            LayerType::Record => "Record",
            LayerType::QuicFrame => "QuicFrame",
            LayerType::QuicPacket => "QuicPacket",
        }
    }

    /// A fresh layer of this kind.
    pub fn create(self) -> Box<dyn ProtocolLayer> {
        match self {
            LayerType::Message => Box::new(MessageLayer::new(Box::new(DefaultMessageCodec))),
            LayerType::DtlsFragment => Box::new(DtlsFragmentLayer::new()),
            LayerType::Record => Box::new(RecordLayer::new()),
            LayerType::QuicFrame => Box::new(QuicFrameLayer::new()),
            LayerType::QuicPacket => Box::new(QuicPacketLayer::new()),
        }
    }

    /// Layers that protect their units with the context's ciphers.
    pub fn is_cipher_bearing(self) -> bool {
        matches!(self, LayerType::Record | LayerType::QuicPacket)
    }
}

impl fmt::Display for LayerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// One structured unit of any layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DataUnit {
    Message(ProtocolMessage),
    Fragment(DtlsFragment),
    Record(Record),
    QuicFrame(QuicFrame),
    QuicPacket(QuicPacket),
}

impl DataUnit {
    pub fn kind(&self) -> UnitKind {
        match self {
            DataUnit::Message(m) => UnitKind::Message(m.kind),
            DataUnit::Fragment(f) => UnitKind::Fragment(f.handshake_type),
            DataUnit::Record(r) => UnitKind::Record(r.content_type),
            DataUnit::QuicFrame(f) => UnitKind::QuicFrame(f.frame_type()),
            DataUnit::QuicPacket(p) => UnitKind::QuicPacket(p.packet_type),
        }
    }

    /// The layer that produces and consumes this unit.
    pub fn layer_type(&self) -> LayerType {
        match self {
            DataUnit::Message(_) => LayerType::Message,
            DataUnit::Fragment(_) => LayerType::DtlsFragment,
            DataUnit::Record(_) => LayerType::Record,
            DataUnit::QuicFrame(_) => LayerType::QuicFrame,
            DataUnit::QuicPacket(_) => LayerType::QuicPacket,
        }
    }

    /// Whether an expected unit must be present. Only messages can be optional.
    pub fn is_required(&self) -> bool {
        match self {
            DataUnit::Message(m) => m.required,
            _ => true,
        }
    }

    pub fn as_message(&self) -> Option<&ProtocolMessage> {
        match self {
            DataUnit::Message(m) => Some(m),
            _ => None,
        }
    }

    pub fn as_record(&self) -> Option<&Record> {
        match self {
            DataUnit::Record(r) => Some(r),
            _ => None,
        }
    }

    pub fn is_warning_alert(&self) -> bool {
        self.as_message().is_some_and(ProtocolMessage::is_warning_alert)
    }
}

impl From<ProtocolMessage> for DataUnit {
    fn from(m: ProtocolMessage) -> Self {
        DataUnit::Message(m)
    }
}

impl From<Record> for DataUnit {
    fn from(r: Record) -> Self {
        DataUnit::Record(r)
    }
}

impl From<DtlsFragment> for DataUnit {
    fn from(f: DtlsFragment) -> Self {
        DataUnit::Fragment(f)
    }
}

impl From<QuicFrame> for DataUnit {
    fn from(f: QuicFrame) -> Self {
        DataUnit::QuicFrame(f)
    }
}

impl From<QuicPacket> for DataUnit {
    fn from(p: QuicPacket) -> Self {
        DataUnit::QuicPacket(p)
    }
}

/// Concrete variant kind of a unit. An unset inner kind matches any unit of
/// the same layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UnitKind {
    Message(MessageKind),
    Fragment(Option<HandshakeType>),
    Record(Option<ContentType>),
    QuicFrame(QuicFrameType),
    QuicPacket(Option<QuicPacketType>),
}

impl UnitKind {
    /// Whether an observed unit of kind `actual` satisfies `self`.
    pub fn matches(&self, actual: &UnitKind) -> bool {
        match (self, actual) {
            (UnitKind::Message(a), UnitKind::Message(b)) => a == b,
            (UnitKind::QuicFrame(a), UnitKind::QuicFrame(b)) => a == b,
            (UnitKind::Fragment(a), UnitKind::Fragment(b)) => a.is_none() || a == b,
            (UnitKind::Record(a), UnitKind::Record(b)) => a.is_none() || a == b,
            (UnitKind::QuicPacket(a), UnitKind::QuicPacket(b)) => a.is_none() || a == b,
            _ => false,
        }
    }

    pub fn layer_type(&self) -> LayerType {
        match self {
            UnitKind::Message(_) => LayerType::Message,
            UnitKind::Fragment(_) => LayerType::DtlsFragment,
            UnitKind::Record(_) => LayerType::Record,
            UnitKind::QuicFrame(_) => LayerType::QuicFrame,
            UnitKind::QuicPacket(_) => LayerType::QuicPacket,
        }
    }
}

/// How the layer below should treat a chunk of data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessingHint {
    /// Bytes with no framing information (transport data).
    Raw,
    /// Content of one record content type.
    Content(ContentType),
    /// Decrypted payload of a QUIC packet.
    QuicPayload(QuicPacketType),
}

/// A chunk of bytes passed between adjacent layers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayerData {
    pub hint: ProcessingHint,
    pub bytes: Vec<u8>,
}

impl LayerData {
    pub fn raw(bytes: Vec<u8>) -> Self {
        Self {
            hint: ProcessingHint::Raw,
            bytes,
        }
    }

    pub fn content(content_type: ContentType, bytes: Vec<u8>) -> Self {
        Self {
            hint: ProcessingHint::Content(content_type),
            bytes,
        }
    }

    /// Content type carried by the chunk; raw bytes are read as handshake data.
    pub fn content_type(&self) -> ContentType {
        match self.hint {
            ProcessingHint::Content(ct) => ct,
            ProcessingHint::Raw | ProcessingHint::QuicPayload(_) => ContentType::Handshake,
        }
    }
}

/// What one layer produced for one invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayerOutput {
    pub units: Vec<DataUnit>,
    /// Data for the next layer (below on send, above on receive).
    pub data: Vec<LayerData>,
    /// On send: every configured unit was used.
    pub executed_as_planned: bool,
}

impl LayerOutput {
    pub fn new(units: Vec<DataUnit>, data: Vec<LayerData>) -> Self {
        Self {
            units,
            data,
            executed_as_planned: true,
        }
    }
}

/// One protocol layer.
pub trait ProtocolLayer: fmt::Debug + Send {
    fn layer_type(&self) -> LayerType;

    /// Called when the layer joins a stack.
    fn initialize(&mut self, _ctx: &mut TlsContext) {}

    /// Turn `configured` units and the data from above into data for the
    /// layer below. Configured units are used first; data not consumed by
    /// them is framed with defaults.
    fn send(
        &mut self,
        ctx: &mut TlsContext,
        configured: &[DataUnit],
        input: Vec<LayerData>,
    ) -> Result<LayerOutput, ActionError>;

    /// Parse data from below. Incomplete units stay buffered in the layer
    /// until more data arrives.
    fn receive(&mut self, ctx: &mut TlsContext, input: Vec<LayerData>) -> Result<LayerOutput, ActionError>;

    /// Bytes buffered but not yet parsed into units.
    fn unread_bytes(&self) -> usize {
        0
    }

    /// Drop buffered state.
    fn clear(&mut self) {}
}

/// Select the configured units of one variant, rejecting the others.
pub(crate) fn configured_units<'a, T>(
    layer: LayerType,
    configured: &'a [DataUnit],
    select: impl Fn(&'a DataUnit) -> Option<&'a T>,
) -> Result<Vec<&'a T>, ActionError> {
    configured
        .iter()
        .map(|unit| {
            select(unit).ok_or_else(|| {
                ActionError::layer(
                    layer.name(),
                    format!("cannot send a unit of kind {:?}", unit.kind()),
                )
            })
        })
        .collect()
}
