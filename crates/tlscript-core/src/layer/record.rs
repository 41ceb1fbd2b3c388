//! Record layer: frames upper-layer content into TLS or DTLS records and
//! protects them with the cipher of the record's epoch.

use std::collections::VecDeque;

use tlscript_types::ActionError;
use tracing::{debug, warn};

use super::{configured_units, DataUnit, LayerData, LayerOutput, LayerType, ProtocolLayer};
use crate::context::TlsContext;
use crate::record::cipher::RecordCryptoInput;
use crate::record::{
    build_inner_plaintext, parse_inner_plaintext, parse_record, serialize_record, ContentType,
    Record, WireRecord,
};
use crate::ProtocolVersion;

#[derive(Debug, Default)]
pub struct RecordLayer {
    /// Received bytes not yet forming a whole record.
    pending: Vec<u8>,
}

impl RecordLayer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Protect and frame one record, filling unset fields from the context.
    fn write_record(ctx: &mut TlsContext, record: &Record) -> Result<(Record, Vec<u8>), ActionError> {
        let dtls = ctx.is_dtls();
        let negotiated = ctx.effective_protocol_version();
        let version = record
            .version
            .unwrap_or_else(|| negotiated.record_version());
        let epoch = record.epoch.unwrap_or(ctx.write_epoch);
        let sequence_number = match record.sequence_number {
            Some(seq) => seq,
            None => ctx.next_write_sequence(epoch),
        };
        let content_type = record.content_type.unwrap_or(ContentType::ApplicationData);
        let plaintext = record.fragment.clone().unwrap_or_default();
        let connection_id = if dtls {
            record.connection_id.clone().or_else(|| {
                (!ctx.write_connection_id.is_empty()).then(|| ctx.write_connection_id.clone())
            })
        } else {
            None
        };

        let (input_type, body) = match connection_id {
            Some(_) => (
                ContentType::Tls12Cid,
                build_inner_plaintext(content_type, &plaintext, 0),
            ),
            None => (content_type, plaintext.clone()),
        };
        let input = RecordCryptoInput {
            content_type: input_type,
            version: if negotiated.is_tls13() { negotiated } else { version },
            epoch,
            sequence_number,
            dtls,
            header: None,
        };
        let protected = ctx
            .encryptor
            .cipher_for_epoch_or_current(epoch)
            .cipher
            .encrypt(&input, &body)?;

        let wire = WireRecord {
            content_type: protected.content_type,
            version: version.0,
            epoch: dtls.then_some(epoch),
            sequence_number: dtls.then_some(sequence_number),
            connection_id: connection_id.clone(),
            fragment: protected.fragment,
        };
        let bytes = serialize_record(&wire)?;
        let sent = Record {
            content_type: Some(content_type),
            version: Some(version),
            epoch: Some(epoch),
            sequence_number: Some(sequence_number),
            connection_id,
            max_fragment_length: record.max_fragment_length,
            fragment: Some(plaintext),
            protected_fragment: Some(wire.fragment),
            authenticated: None,
        };
        ctx.record_sent(sent.clone());
        Ok((sent, bytes))
    }

    /// Decrypt one received record. Returns the observed record and the
    /// plaintext for the layer above, if decryption succeeded.
    fn read_record(ctx: &mut TlsContext, wire: WireRecord) -> (Record, Option<LayerData>) {
        let epoch = wire.epoch.unwrap_or(ctx.read_epoch);
        let sequence_number = match wire.sequence_number {
            Some(seq) => {
                ctx.observe_read_sequence(epoch, seq);
                seq
            }
            None => ctx.next_read_sequence(epoch),
        };
        let version = ProtocolVersion(wire.version);
        let negotiated = ctx.effective_protocol_version();
        let mut record = Record {
            content_type: Some(wire.content_type),
            version: Some(version),
            epoch: Some(epoch),
            sequence_number: Some(sequence_number),
            connection_id: wire.connection_id.clone(),
            protected_fragment: Some(wire.fragment.clone()),
            ..Record::default()
        };

        // TLS 1.3 middlebox compatibility records are never protected.
        if negotiated.is_tls13() && wire.content_type == ContentType::ChangeCipherSpec {
            record.fragment = Some(wire.fragment.clone());
            record.authenticated = Some(true);
            return (record, Some(LayerData::content(wire.content_type, wire.fragment)));
        }

        let input = RecordCryptoInput {
            content_type: wire.content_type,
            version: if negotiated.is_tls13() { negotiated } else { version },
            epoch,
            sequence_number,
            dtls: wire.epoch.is_some(),
            header: None,
        };
        let opened = ctx
            .decryptor
            .cipher_for_epoch_or_current(epoch)
            .cipher
            .decrypt(&input, &wire.fragment);
        let opened = opened.and_then(|p| {
            if p.content_type == ContentType::Tls12Cid {
                parse_inner_plaintext(&p.fragment)
                    .map(|(ct, body)| (ct, body.to_vec()))
                    .map_err(|e| tlscript_types::CryptoError::Record(e.to_string()))
            } else {
                Ok((p.content_type, p.fragment))
            }
        });
        match opened {
            Ok((content_type, plaintext)) => {
                record.content_type = Some(content_type);
                record.fragment = Some(plaintext.clone());
                record.authenticated = Some(true);
                (record, Some(LayerData::content(content_type, plaintext)))
            }
            Err(e) => {
                warn!(
                    alias = ctx.alias(),
                    epoch,
                    seq = sequence_number,
                    "record could not be decrypted: {e}"
                );
                record.authenticated = Some(false);
                (record, None)
            }
        }
    }
}

/// Queue upper-layer chunks by content type. Stream transports merge
/// adjacent chunks of one type; datagram transports keep chunk boundaries.
fn content_stream(input: Vec<LayerData>, merge: bool) -> VecDeque<(ContentType, Vec<u8>)> {
    let mut stream: VecDeque<(ContentType, Vec<u8>)> = VecDeque::new();
    for data in input {
        let ct = data.content_type();
        match stream.back_mut() {
            Some((last, bytes)) if merge && *last == ct => bytes.extend_from_slice(&data.bytes),
            _ => stream.push_back((ct, data.bytes)),
        }
    }
    stream
}

impl ProtocolLayer for RecordLayer {
    fn layer_type(&self) -> LayerType {
        LayerType::Record
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
        let configured = configured_units(LayerType::Record, configured, DataUnit::as_record)?;
        let max_len = ctx.max_record_length.max(1);
        let mut stream = content_stream(input, !ctx.is_dtls());
        let mut planned = Vec::new();
        let mut as_planned = true;

        for cfg in configured {
            if !cfg.is_template() {
                planned.push(cfg.clone());
                continue;
            }
            let Some((ct, bytes)) = stream.front_mut() else {
                warn!(alias = ctx.alias(), "record template left without data");
                as_planned = false;
                continue;
            };
            let take = bytes.len().min(cfg.max_fragment_length.unwrap_or(max_len));
            let chunk: Vec<u8> = bytes.drain(..take).collect();
            let mut record = cfg.clone();
            record.content_type.get_or_insert(*ct);
            record.fragment = Some(chunk);
            if bytes.is_empty() {
                stream.pop_front();
            }
            planned.push(record);
        }
        for (ct, bytes) in stream {
            if bytes.is_empty() {
                planned.push(Record::explicit(ct, Vec::new()));
            }
            for chunk in bytes.chunks(max_len) {
                planned.push(Record::explicit(ct, chunk.to_vec()));
            }
        }

        let mut units = Vec::with_capacity(planned.len());
        let mut data = Vec::with_capacity(planned.len());
        for record in &planned {
            let (sent, bytes) = Self::write_record(ctx, record)?;
            debug!(
                alias = ctx.alias(),
                content_type = ?sent.content_type,
                epoch = ?sent.epoch,
                seq = ?sent.sequence_number,
                "record written"
            );
            units.push(DataUnit::Record(sent));
            data.push(LayerData::raw(bytes));
        }
        Ok(LayerOutput {
            units,
            data,
            executed_as_planned: as_planned,
        })
    }

    fn receive(&mut self, ctx: &mut TlsContext, input: Vec<LayerData>) -> Result<LayerOutput, ActionError> {
        let dtls = ctx.is_dtls();
        let cid_len = ctx.read_connection_id.len();
        let mut units = Vec::new();
        let mut data = Vec::new();

        for chunk in input {
            self.pending.extend_from_slice(&chunk.bytes);
            let mut offset = 0;
            loop {
                match parse_record(&self.pending[offset..], dtls, cid_len) {
                    Ok((wire, used)) => {
                        offset += used;
                        let (record, plaintext) = Self::read_record(ctx, wire);
                        units.push(DataUnit::Record(record));
                        data.extend(plaintext);
                    }
                    Err(e) if e.is_incomplete() => break,
                    Err(e) => {
                        warn!(alias = ctx.alias(), "unparseable record data: {e}");
                        if dtls {
                            // Datagrams carry whole records; drop the rest.
                            offset = self.pending.len();
                        }
                        break;
                    }
                }
            }
            self.pending.drain(..offset);
            if dtls && !self.pending.is_empty() {
                warn!(alias = ctx.alias(), len = self.pending.len(), "truncated record in datagram");
                self.pending.clear();
            }
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
    use crate::crypt::CipherDirection;
    use crate::ConnectionEnd;

    fn pair(version: ProtocolVersion) -> (TlsContext, TlsContext) {
        let config = Config::builder().default_protocol_version(version).build();
        let mut client = TlsContext::new("client", ConnectionEnd::Client, &config);
        let mut server = TlsContext::new("server", ConnectionEnd::Server, &config);
        for ctx in [&mut client, &mut server] {
            ctx.client_random = vec![1; 32];
            ctx.server_random = vec![2; 32];
            ctx.master_secret = vec![3; 48];
        }
        (client, server)
    }

    fn send(ctx: &mut TlsContext, configured: &[DataUnit], input: Vec<LayerData>) -> (Vec<Record>, Vec<u8>) {
        let out = RecordLayer::new().send(ctx, configured, input).unwrap();
        let records = out.units.iter().filter_map(DataUnit::as_record).cloned().collect();
        let bytes = out.data.into_iter().flat_map(|d| d.bytes).collect();
        (records, bytes)
    }

    #[test]
    fn test_dynamic_records_split_by_max_length() {
        let (mut client, _) = pair(ProtocolVersion::TLS12);
        client.max_record_length = 4;
        let input = vec![
            LayerData::content(ContentType::Handshake, vec![1; 3]),
            LayerData::content(ContentType::Handshake, vec![2; 3]),
            LayerData::content(ContentType::Alert, vec![1, 0]),
        ];
        let (records, bytes) = send(&mut client, &[], input);
        let sizes: Vec<_> = records.iter().map(|r| r.fragment.as_ref().unwrap().len()).collect();
        assert_eq!(sizes, vec![4, 2, 2]);
        assert_eq!(records[2].content_type, Some(ContentType::Alert));
        assert_eq!(bytes.len(), 3 * 5 + 8);
        assert_eq!(records[1].sequence_number, Some(1));
    }

    #[test]
    fn test_templates_take_data_then_explicit_records_pass() {
        let (mut client, _) = pair(ProtocolVersion::TLS12);
        let configured = vec![
            DataUnit::Record(Record::with_max_fragment_length(2)),
            DataUnit::Record(Record::explicit(ContentType::Heartbeat, vec![9])),
            DataUnit::Record(Record::template()),
            DataUnit::Record(Record::template()),
        ];
        let input = vec![LayerData::content(ContentType::Handshake, vec![7; 5])];
        let out = RecordLayer::new().send(&mut client, &configured, input).unwrap();
        assert!(!out.executed_as_planned);
        let fragments: Vec<_> = out
            .units
            .iter()
            .filter_map(DataUnit::as_record)
            .map(|r| (r.content_type.unwrap(), r.fragment.clone().unwrap()))
            .collect();
        assert_eq!(
            fragments,
            vec![
                (ContentType::Handshake, vec![7; 2]),
                (ContentType::Heartbeat, vec![9]),
                (ContentType::Handshake, vec![7; 3]),
            ]
        );
    }

    #[test]
    fn test_encrypted_roundtrip_and_epoch_fallback() {
        let (mut client, mut server) = pair(ProtocolVersion::TLS12);
        client.activate_cipher(CipherDirection::Encrypt, None).unwrap();
        server.activate_cipher(CipherDirection::Decrypt, None).unwrap();

        let input = vec![LayerData::content(ContentType::ApplicationData, b"secret".to_vec())];
        let (records, bytes) = send(&mut client, &[], input);
        assert_eq!(records[0].epoch, Some(1));
        assert_ne!(records[0].protected_fragment.as_deref(), Some(&b"secret"[..]));

        let mut layer = RecordLayer::new();
        let out = layer.receive(&mut server, vec![LayerData::raw(bytes)]).unwrap();
        let record = out.units[0].as_record().unwrap();
        assert_eq!(record.authenticated, Some(true));
        assert_eq!(out.data, vec![LayerData::content(ContentType::ApplicationData, b"secret".to_vec())]);
    }

    #[test]
    fn test_decrypt_failure_marks_record() {
        let (mut client, mut server) = pair(ProtocolVersion::TLS12);
        client.activate_cipher(CipherDirection::Encrypt, None).unwrap();
        server.master_secret = vec![4; 48];
        server.activate_cipher(CipherDirection::Decrypt, None).unwrap();

        let (_, bytes) = send(&mut client, &[], vec![LayerData::content(ContentType::Alert, vec![2, 20])]);
        let out = RecordLayer::new().receive(&mut server, vec![LayerData::raw(bytes)]).unwrap();
        assert_eq!(out.units.len(), 1);
        assert_eq!(out.units[0].as_record().unwrap().authenticated, Some(false));
        assert!(out.data.is_empty());
    }

    #[test]
    fn test_partial_record_buffered_across_fetches() {
        let (mut client, mut server) = pair(ProtocolVersion::TLS12);
        let (_, bytes) = send(
            &mut client,
            &[],
            vec![LayerData::content(ContentType::Handshake, vec![14, 0, 0, 0])],
        );
        let mut layer = RecordLayer::new();
        let first = layer.receive(&mut server, vec![LayerData::raw(bytes[..6].to_vec())]).unwrap();
        assert!(first.units.is_empty());
        assert_eq!(layer.unread_bytes(), 6);
        let second = layer.receive(&mut server, vec![LayerData::raw(bytes[6..].to_vec())]).unwrap();
        assert_eq!(second.units.len(), 1);
        assert_eq!(layer.unread_bytes(), 0);
    }

    #[test]
    fn test_dtls_connection_id_records() {
        let (mut client, mut server) = pair(ProtocolVersion::DTLS12);
        client.write_connection_id = vec![0xC1, 0xD0];
        server.read_connection_id = vec![0xC1, 0xD0];
        let (records, bytes) = send(
            &mut client,
            &[],
            vec![LayerData::content(ContentType::ApplicationData, b"x".to_vec())],
        );
        assert_eq!(bytes[0], ContentType::Tls12Cid.as_u8());
        assert_eq!(records[0].connection_id, Some(vec![0xC1, 0xD0]));

        let out = RecordLayer::new().receive(&mut server, vec![LayerData::raw(bytes)]).unwrap();
        let record = out.units[0].as_record().unwrap();
        assert_eq!(record.content_type, Some(ContentType::ApplicationData));
        assert_eq!(record.fragment.as_deref(), Some(&b"x"[..]));
    }

    #[test]
    fn test_dtls_keeps_chunk_boundaries() {
        let (mut client, _) = pair(ProtocolVersion::DTLS12);
        let input = vec![
            LayerData::content(ContentType::Handshake, vec![1; 3]),
            LayerData::content(ContentType::Handshake, vec![2; 3]),
        ];
        let (records, bytes) = send(&mut client, &[], input);
        assert_eq!(records.len(), 2);
        assert_eq!(bytes.len(), 2 * (13 + 3));
        assert_eq!(client.last_flight().len(), 2);
    }
}
