//! DTLS fragment layer: splits handshake messages into DTLS handshake
//! fragments on send and reassembles them on receive.

use std::collections::VecDeque;

use tlscript_types::ActionError;
use tracing::{debug, warn};

use super::{configured_units, DataUnit, LayerData, LayerOutput, LayerType, ProtocolLayer};
use crate::context::TlsContext;
use crate::handshake::fragment::{
    encode_fragment, parse_dtls_handshake_header, DtlsFragment, DtlsHandshakeHeader,
};
use crate::handshake::{parse_handshake_header, HandshakeType};
use crate::record::ContentType;

fn as_fragment(unit: &DataUnit) -> Option<&DtlsFragment> {
    match unit {
        DataUnit::Fragment(f) => Some(f),
        _ => None,
    }
}

#[derive(Debug, Default)]
pub struct DtlsFragmentLayer {
    /// Handshake bytes of a fragment cut short by the end of a chunk.
    pending: Vec<u8>,
}

impl DtlsFragmentLayer {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Builds the fragments of one handshake message.
struct Fragmenter<'a> {
    templates: VecDeque<&'a DtlsFragment>,
    default_max: usize,
    units: Vec<DataUnit>,
    data: Vec<LayerData>,
}

impl Fragmenter<'_> {
    fn emit(&mut self, header: DtlsHandshakeHeader, body: &[u8]) {
        self.data
            .push(LayerData::content(ContentType::Handshake, encode_fragment(&header, body)));
        self.units
            .push(DataUnit::Fragment(DtlsFragment::from_parsed(&header, body)));
    }

    /// Explicit fragments waiting at the front of the configuration go out
    /// unchanged.
    fn flush_explicit(&mut self) {
        while let Some(fragment) = self.templates.front().filter(|f| !f.is_template()) {
            let header = fragment.header();
            let body = fragment.content.clone().unwrap_or_default();
            self.templates.pop_front();
            self.emit(header, &body);
        }
    }

    fn fragment_message(&mut self, msg_type: HandshakeType, body: &[u8], message_seq: u16) {
        let total = body.len() as u32;
        let mut offset = 0usize;
        loop {
            self.flush_explicit();
            let template = self.templates.pop_front();
            let max = template
                .and_then(|t| t.max_fragment_length)
                .unwrap_or(self.default_max)
                .max(1);
            let end = body.len().min(offset + max);
            let slice = &body[offset..end];
            let header = DtlsHandshakeHeader {
                msg_type: template.and_then(|t| t.handshake_type).unwrap_or(msg_type),
                length: template.and_then(|t| t.message_length).unwrap_or(total),
                message_seq: template.and_then(|t| t.message_seq).unwrap_or(message_seq),
                fragment_offset: template
                    .and_then(|t| t.fragment_offset)
                    .unwrap_or(offset as u32),
                fragment_length: template
                    .and_then(|t| t.fragment_length)
                    .unwrap_or(slice.len() as u32),
            };
            self.emit(header, slice);
            offset = end;
            if offset >= body.len() {
                break;
            }
        }
    }
}

impl ProtocolLayer for DtlsFragmentLayer {
    fn layer_type(&self) -> LayerType {
        LayerType::DtlsFragment
    }

    fn initialize(&mut self, _ctx: &mut TlsContext) {
        self.pending.clear();
    }

    fn send(
        &mut self,
        ctx: &mut TlsContext,
        configured: &[DataUnit],
        input: Vec<LayerData>,
    ) -> Result<LayerOutput, ActionError> {
        let configured = configured_units(LayerType::DtlsFragment, configured, as_fragment)?;
        let mut fragmenter = Fragmenter {
            templates: configured.into_iter().collect(),
            default_max: ctx.dtls_max_fragment_length,
            units: Vec::new(),
            data: Vec::new(),
        };

        for chunk in input {
            if chunk.content_type() != ContentType::Handshake {
                fragmenter.data.push(chunk);
                continue;
            }
            let mut rest = chunk.bytes.as_slice();
            while !rest.is_empty() {
                let (msg_type, body, used) = parse_handshake_header(rest)?;
                let message_seq = ctx.dtls_write_handshake_seq;
                ctx.dtls_write_handshake_seq = message_seq.wrapping_add(1);
                debug!(alias = ctx.alias(), ?msg_type, message_seq, "fragmenting handshake message");
                fragmenter.fragment_message(msg_type, body, message_seq);
                rest = &rest[used..];
            }
        }
        fragmenter.flush_explicit();

        let unused = fragmenter.templates.len();
        if unused > 0 {
            warn!(alias = ctx.alias(), unused, "fragment templates left without data");
        }
        Ok(LayerOutput {
            units: fragmenter.units,
            data: fragmenter.data,
            executed_as_planned: unused == 0,
        })
    }

    fn receive(&mut self, ctx: &mut TlsContext, input: Vec<LayerData>) -> Result<LayerOutput, ActionError> {
        let mut units = Vec::new();
        let mut data = Vec::new();
        for chunk in input {
            if chunk.content_type() != ContentType::Handshake {
                data.push(chunk);
                continue;
            }
            self.pending.extend_from_slice(&chunk.bytes);
            let mut offset = 0;
            loop {
                match parse_dtls_handshake_header(&self.pending[offset..]) {
                    Ok((header, body, used)) => {
                        units.push(DataUnit::Fragment(DtlsFragment::from_parsed(&header, body)));
                        match ctx.fragment_reassembly.process_fragment(&header, body) {
                            Ok(messages) => data.extend(
                                messages
                                    .into_iter()
                                    .map(|m| LayerData::content(ContentType::Handshake, m)),
                            ),
                            Err(e) => warn!(
                                alias = ctx.alias(),
                                message_seq = header.message_seq,
                                "fragment rejected by reassembly: {e}"
                            ),
                        }
                        offset += used;
                    }
                    Err(e) if e.is_incomplete() => break,
                    Err(e) => {
                        warn!(alias = ctx.alias(), "unparseable fragment data: {e}");
                        offset = self.pending.len();
                        break;
                    }
                }
            }
            self.pending.drain(..offset);
        }
        Ok(LayerOutput::new(units, data))
    }

    fn unread_bytes(&self) -> usize {
        self.pending.len()
    }

    fn clear(&mut self) {
        self.pending.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::handshake::wrap_handshake;
    use crate::{ConnectionEnd, ProtocolVersion};

    fn ctx() -> TlsContext {
        let config = Config::builder()
            .default_protocol_version(ProtocolVersion::DTLS12)
            .dtls_max_fragment_length(4)
            .build();
        TlsContext::new("client", ConnectionEnd::Client, &config)
    }

    fn certificate() -> Vec<u8> {
        wrap_handshake(HandshakeType::Certificate, &[1, 2, 3, 4, 5, 6, 7, 8, 9, 10]).unwrap()
    }

    #[test]
    fn test_default_fragmentation() {
        let mut ctx = ctx();
        let input = vec![LayerData::content(ContentType::Handshake, certificate())];
        let out = DtlsFragmentLayer::new().send(&mut ctx, &[], input).unwrap();
        let offsets: Vec<_> = out
            .units
            .iter()
            .map(|u| match u {
                DataUnit::Fragment(f) => (f.fragment_offset.unwrap(), f.fragment_length.unwrap()),
                _ => unreachable!(),
            })
            .collect();
        assert_eq!(offsets, vec![(0, 4), (4, 4), (8, 2)]);
        assert_eq!(out.data.len(), 3);
        assert_eq!(ctx.dtls_write_handshake_seq, 1);
    }

    #[test]
    fn test_templates_and_explicit_fragments() {
        let mut ctx = ctx();
        let configured = vec![
            DataUnit::Fragment(DtlsFragment::with_max_fragment_length(7)),
            DataUnit::Fragment(DtlsFragment {
                handshake_type: Some(HandshakeType::HelloRequest),
                content: Some(Vec::new()),
                ..DtlsFragment::default()
            }),
            DataUnit::Fragment(DtlsFragment::template()),
            DataUnit::Fragment(DtlsFragment::template()),
        ];
        let input = vec![LayerData::content(ContentType::Handshake, certificate())];
        let out = DtlsFragmentLayer::new().send(&mut ctx, &configured, input).unwrap();
        assert!(!out.executed_as_planned);
        let kinds: Vec<_> = out
            .units
            .iter()
            .map(|u| match u {
                DataUnit::Fragment(f) => (f.handshake_type.unwrap(), f.content.as_ref().unwrap().len()),
                _ => unreachable!(),
            })
            .collect();
        assert_eq!(
            kinds,
            vec![
                (HandshakeType::Certificate, 7),
                (HandshakeType::HelloRequest, 0),
                (HandshakeType::Certificate, 3),
            ]
        );
    }

    #[test]
    fn test_reassembly_out_of_order() {
        let mut sender = ctx();
        let input = vec![LayerData::content(ContentType::Handshake, certificate())];
        let sent = DtlsFragmentLayer::new().send(&mut sender, &[], input).unwrap();

        let mut receiver = ctx();
        let mut layer = DtlsFragmentLayer::new();
        let mut chunks = sent.data;
        chunks.swap(0, 2);
        let out = layer.receive(&mut receiver, chunks).unwrap();
        assert_eq!(out.units.len(), 3);
        assert_eq!(out.data, vec![LayerData::content(ContentType::Handshake, certificate())]);
    }

    #[test]
    fn test_non_handshake_passes_through() {
        let mut ctx = ctx();
        let alert = LayerData::content(ContentType::Alert, vec![1, 0]);
        let out = DtlsFragmentLayer::new().send(&mut ctx, &[], vec![alert.clone()]).unwrap();
        assert_eq!(out.data, vec![alert.clone()]);
        let out = DtlsFragmentLayer::new().receive(&mut ctx, vec![alert.clone()]).unwrap();
        assert_eq!(out.data, vec![alert]);
    }
}
