//! Message layer: serializes protocol messages for the layer below and parses
//! content coming up from it, adjusting the context for every message.

use tlscript_types::ActionError;
use tracing::{debug, warn};

use super::{configured_units, DataUnit, LayerData, LayerOutput, LayerType, ProtocolLayer};
use crate::context::TlsContext;
use crate::message::handler::{adjust_context, MessageDirection};
use crate::message::{MessageCodec, MessageKind, ProtocolMessage};
use crate::record::ContentType;

#[derive(Debug)]
pub struct MessageLayer {
    codec: Box<dyn MessageCodec>,
    /// Start of a message whose remaining bytes have not arrived yet.
    pending: Option<(ContentType, Vec<u8>)>,
}

impl MessageLayer {
    pub fn new(codec: Box<dyn MessageCodec>) -> Self {
        Self {
            codec,
            pending: None,
        }
    }

    fn parse_chunk(&mut self, ctx: &mut TlsContext, chunk: LayerData, units: &mut Vec<DataUnit>) {
        let content_type = chunk.content_type();
        let mut buf = match self.pending.take() {
            Some((ct, mut partial)) if ct == content_type => {
                partial.extend_from_slice(&chunk.bytes);
                partial
            }
            Some((ct, partial)) => {
                warn!(
                    alias = ctx.alias(),
                    stale = ?ct,
                    len = partial.len(),
                    "dropping incomplete message interrupted by other content"
                );
                chunk.bytes
            }
            None => chunk.bytes,
        };

        let mut offset = 0;
        while offset < buf.len() {
            match self.codec.parse(content_type, &buf[offset..]) {
                Ok((message, used)) => {
                    if matches!(message.kind, MessageKind::Handshake(_)) {
                        ctx.digest.update(&buf[offset..offset + used]);
                    }
                    offset += used;
                    debug!(alias = ctx.alias(), kind = %message.kind, "message received");
                    adjust_context(ctx, &message, MessageDirection::Received);
                    units.push(DataUnit::Message(message));
                }
                Err(e) if e.is_incomplete() => break,
                Err(e) => {
                    warn!(alias = ctx.alias(), ?content_type, "unparseable message data: {e}");
                    offset = buf.len();
                }
            }
        }
        buf.drain(..offset);
        if !buf.is_empty() {
            self.pending = Some((content_type, buf));
        }
    }
}

impl ProtocolLayer for MessageLayer {
    fn layer_type(&self) -> LayerType {
        LayerType::Message
    }

    fn initialize(&mut self, _ctx: &mut TlsContext) {
        self.pending = None;
    }

    fn send(
        &mut self,
        ctx: &mut TlsContext,
        configured: &[DataUnit],
        input: Vec<LayerData>,
    ) -> Result<LayerOutput, ActionError> {
        let messages = configured_units(LayerType::Message, configured, DataUnit::as_message)?;
        let mut units = Vec::with_capacity(messages.len());
        let mut data = Vec::with_capacity(messages.len() + input.len());

        for message in messages {
            let bytes = self.codec.serialize(message)?;
            if matches!(message.kind, MessageKind::Handshake(_)) {
                ctx.digest.update(&bytes);
            }
            debug!(alias = ctx.alias(), kind = %message.kind, "message sent");
            adjust_context(ctx, message, MessageDirection::Sent);
            data.push(LayerData::content(message.kind.content_type(), bytes));
            units.push(DataUnit::Message(ProtocolMessage::clone(message)));
        }
        data.extend(input);
        Ok(LayerOutput::new(units, data))
    }

    fn receive(&mut self, ctx: &mut TlsContext, input: Vec<LayerData>) -> Result<LayerOutput, ActionError> {
        let mut units = Vec::new();
        for chunk in input {
            self.parse_chunk(ctx, chunk, &mut units);
        }
        Ok(LayerOutput::new(units, Vec::new()))
    }

    fn unread_bytes(&self) -> usize {
        self.pending.as_ref().map_or(0, |(_, bytes)| bytes.len())
    }

    fn clear(&mut self) {
        self.pending = None;
    }
}
