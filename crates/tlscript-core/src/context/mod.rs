//! Per-connection state.
//!
//! [`TlsContext`] holds everything actions and layers read and mutate:
//! negotiated parameters, secrets, epochs and sequence numbers, buffers and
//! the cipher histories. [`ConnectionContext`] binds it to a layer stack and
//! a transport; the three parts are separate fields so a layer can borrow the
//! context mutably while the stack drives the transport.

pub mod field;

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

use indexmap::IndexSet;
use tlscript_types::{ActionError, CryptoError, TransportError};
use tracing::debug;
use zeroize::Zeroize;

use crate::config::{AliasedConnection, Config, LayerStackType};
use crate::crypt::{CipherDirection, CryptoProvider, TranscriptDigest};
use crate::handshake::fragment::ReassemblyManager;
use crate::layer::{
    LayerConfiguration, LayerStack, LayerStackProcessingResult, LayerType, ProtocolLayer,
};
use crate::message::ProtocolMessage;
use crate::quic::QuicState;
use crate::record::epoch::CipherEpochState;
use crate::record::Record;
use crate::transport::Transport;
use crate::{CipherSuite, CompressionMethod, ConnectionEnd, ExtensionType, ProtocolVersion};

pub use field::{ContextField, ContextValue, ContextValueKind};

/// Protocol state of one connection.
#[derive(Debug)]
pub struct TlsContext {
    alias: String,
    pub connection_end: ConnectionEnd,

    // Negotiation
    pub selected_cipher_suite: Option<CipherSuite>,
    pub selected_protocol_version: Option<ProtocolVersion>,
    pub selected_compression: CompressionMethod,
    pub proposed_cipher_suites: Vec<CipherSuite>,
    pub proposed_extensions: IndexSet<ExtensionType>,
    pub negotiated_extensions: IndexSet<ExtensionType>,

    // Randoms and secrets
    pub client_random: Vec<u8>,
    pub server_random: Vec<u8>,
    pub session_id: Vec<u8>,
    pub pre_master_secret: Vec<u8>,
    pub master_secret: Vec<u8>,
    pub psk: Vec<u8>,
    pub dtls_cookie: Vec<u8>,
    pub client_verify_data: Vec<u8>,
    pub server_verify_data: Vec<u8>,

    // Sequencing
    pub read_epoch: u16,
    pub write_epoch: u16,
    read_sequence: BTreeMap<u16, u64>,
    write_sequence: BTreeMap<u16, u64>,
    /// Connection ID the peer puts on records and packets sent to us.
    pub read_connection_id: Vec<u8>,
    /// Connection ID we put on records and packets sent to the peer.
    pub write_connection_id: Vec<u8>,
    pub dtls_write_handshake_seq: u16,
    pub fragment_reassembly: ReassemblyManager,
    pub quic: QuicState,

    // Buffers
    pub message_buffer: VecDeque<ProtocolMessage>,
    pub record_buffer: VecDeque<Record>,

    pub digest: TranscriptDigest,
    pub encryptor: CipherEpochState,
    pub decryptor: CipherEpochState,
    last_flight: Vec<Record>,
    flight_open: bool,

    pub received_fatal_alert: bool,
    pub transport_failed: bool,

    // Defaults taken from the configuration
    pub default_protocol_version: ProtocolVersion,
    pub default_cipher_suite: CipherSuite,
    pub max_record_length: usize,
    pub dtls_max_fragment_length: usize,
    pub quic_version: u32,
    pub quic_max_packet_payload: usize,
    pub crypto: Arc<dyn CryptoProvider>,
}

impl TlsContext {
    pub fn new(alias: impl Into<String>, connection_end: ConnectionEnd, config: &Config) -> Self {
        Self {
            alias: alias.into(),
            connection_end,
            selected_cipher_suite: None,
            selected_protocol_version: None,
            selected_compression: CompressionMethod::NULL,
            proposed_cipher_suites: Vec::new(),
            proposed_extensions: IndexSet::new(),
            negotiated_extensions: IndexSet::new(),
            client_random: Vec::new(),
            server_random: Vec::new(),
            session_id: Vec::new(),
            pre_master_secret: Vec::new(),
            master_secret: Vec::new(),
            psk: Vec::new(),
            dtls_cookie: Vec::new(),
            client_verify_data: Vec::new(),
            server_verify_data: Vec::new(),
            read_epoch: 0,
            write_epoch: 0,
            read_sequence: BTreeMap::new(),
            write_sequence: BTreeMap::new(),
            read_connection_id: Vec::new(),
            write_connection_id: Vec::new(),
            dtls_write_handshake_seq: 0,
            fragment_reassembly: ReassemblyManager::new(),
            quic: QuicState::new(),
            message_buffer: VecDeque::new(),
            record_buffer: VecDeque::new(),
            digest: TranscriptDigest::new(),
            encryptor: CipherEpochState::new(),
            decryptor: CipherEpochState::new(),
            last_flight: Vec::new(),
            flight_open: false,
            received_fatal_alert: false,
            transport_failed: false,
            default_protocol_version: config.default_protocol_version,
            default_cipher_suite: config.default_cipher_suite,
            max_record_length: config.max_record_length,
            dtls_max_fragment_length: config.dtls_max_fragment_length,
            quic_version: config.quic_version,
            quic_max_packet_payload: config.quic_max_packet_payload,
            crypto: Arc::clone(&config.crypto_provider),
        }
    }

    pub fn alias(&self) -> &str {
        &self.alias
    }

    pub fn effective_cipher_suite(&self) -> CipherSuite {
        self.selected_cipher_suite.unwrap_or(self.default_cipher_suite)
    }

    pub fn effective_protocol_version(&self) -> ProtocolVersion {
        self.selected_protocol_version
            .unwrap_or(self.default_protocol_version)
    }

    pub fn is_dtls(&self) -> bool {
        self.effective_protocol_version().is_dtls()
    }

    // ---------------------------------------------------------------
    // Sequence numbers
    // ---------------------------------------------------------------

    /// Sequence number for the next record written in `epoch`, advancing it.
    pub fn next_write_sequence(&mut self, epoch: u16) -> u64 {
        let slot = self.write_sequence.entry(epoch).or_insert(0);
        let seq = *slot;
        *slot = slot.wrapping_add(1);
        seq
    }

    /// Sequence number expected next on a record read in `epoch`, advancing it.
    pub fn next_read_sequence(&mut self, epoch: u16) -> u64 {
        let slot = self.read_sequence.entry(epoch).or_insert(0);
        let seq = *slot;
        *slot = slot.wrapping_add(1);
        seq
    }

    /// Note an explicit sequence number seen on a received DTLS record.
    pub fn observe_read_sequence(&mut self, epoch: u16, seq: u64) {
        let slot = self.read_sequence.entry(epoch).or_insert(0);
        *slot = (*slot).max(seq.saturating_add(1));
    }

    pub fn write_sequence(&self, epoch: u16) -> u64 {
        self.write_sequence.get(&epoch).copied().unwrap_or(0)
    }

    pub fn read_sequence(&self, epoch: u16) -> u64 {
        self.read_sequence.get(&epoch).copied().unwrap_or(0)
    }

    pub fn set_write_sequence(&mut self, epoch: u16, seq: u64) {
        self.write_sequence.insert(epoch, seq);
    }

    pub fn set_read_sequence(&mut self, epoch: u16, seq: u64) {
        self.read_sequence.insert(epoch, seq);
    }

    // ---------------------------------------------------------------
    // Ciphers
    // ---------------------------------------------------------------

    /// Derive keys for the effective suite and push a new cipher for
    /// `direction`. Without an explicit epoch the direction's epoch counter
    /// is stepped by one. Returns the epoch of the new cipher.
    pub fn activate_cipher(
        &mut self,
        direction: CipherDirection,
        epoch: Option<u16>,
    ) -> Result<u16, CryptoError> {
        let suite = self.effective_cipher_suite();
        let crypto = Arc::clone(&self.crypto);
        let keys = crypto.derive_keys(self)?;
        let cipher = crypto.build_cipher(
            suite,
            keys.for_direction(self.connection_end, direction),
            direction,
        )?;
        let epoch = match direction {
            CipherDirection::Encrypt => {
                let epoch = epoch.unwrap_or(self.write_epoch.wrapping_add(1));
                self.encryptor.activate(epoch, cipher);
                self.write_epoch = epoch;
                self.write_sequence.insert(epoch, 0);
                epoch
            }
            CipherDirection::Decrypt => {
                let epoch = epoch.unwrap_or(self.read_epoch.wrapping_add(1));
                self.decryptor.activate(epoch, cipher);
                self.read_epoch = epoch;
                self.read_sequence.insert(epoch, 0);
                epoch
            }
        };
        debug!(
            alias = %self.alias,
            ?direction,
            epoch,
            suite = suite.0,
            "cipher activated"
        );
        Ok(epoch)
    }

    /// Push a null cipher at the direction's current epoch.
    pub fn deactivate_cipher(&mut self, direction: CipherDirection) {
        let state = match direction {
            CipherDirection::Encrypt => &mut self.encryptor,
            CipherDirection::Decrypt => &mut self.decryptor,
        };
        let epoch = state.current_epoch();
        state.deactivate(epoch);
        debug!(alias = %self.alias, ?direction, epoch, "cipher deactivated");
    }

    /// Rebuild the active non-null ciphers of both directions for the
    /// effective suite, keeping their epochs.
    pub fn rederive_current_ciphers(&mut self) -> Result<(), CryptoError> {
        if self.encryptor.current().cipher.is_null() && self.decryptor.current().cipher.is_null() {
            return Ok(());
        }
        let suite = self.effective_cipher_suite();
        let crypto = Arc::clone(&self.crypto);
        let keys = crypto.derive_keys(self)?;
        for direction in [CipherDirection::Encrypt, CipherDirection::Decrypt] {
            let state = match direction {
                CipherDirection::Encrypt => &mut self.encryptor,
                CipherDirection::Decrypt => &mut self.decryptor,
            };
            if state.current().cipher.is_null() {
                continue;
            }
            let cipher = crypto.build_cipher(
                suite,
                keys.for_direction(self.connection_end, direction),
                direction,
            )?;
            state.replace_current(cipher);
        }
        Ok(())
    }

    // ---------------------------------------------------------------
    // Buffers
    // ---------------------------------------------------------------

    /// Remove the buffered message at `index`, or the oldest one.
    pub fn pop_buffered_message(&mut self, index: Option<usize>) -> Result<ProtocolMessage, ActionError> {
        pop_at(&mut self.message_buffer, index)
    }

    /// Remove the buffered record at `index`, or the oldest one.
    pub fn pop_buffered_record(&mut self, index: Option<usize>) -> Result<Record, ActionError> {
        pop_at(&mut self.record_buffer, index)
    }

    pub fn clear_buffers(&mut self) {
        self.message_buffer.clear();
        self.record_buffer.clear();
    }

    // ---------------------------------------------------------------
    // Flights
    // ---------------------------------------------------------------

    /// Remember a record sent by the record layer. The first record sent
    /// after something was received starts a new flight.
    pub fn record_sent(&mut self, record: Record) {
        if !self.flight_open {
            self.last_flight.clear();
            self.flight_open = true;
        }
        self.last_flight.push(record);
    }

    /// End the current flight; called when data arrives from the peer.
    pub fn close_flight(&mut self) {
        self.flight_open = false;
    }

    pub fn last_flight(&self) -> &[Record] {
        &self.last_flight
    }

    // ---------------------------------------------------------------
    // Lifecycle
    // ---------------------------------------------------------------

    /// Prepare for a renegotiation handshake on the same connection.
    pub fn renegotiate(&mut self, reset_verify_data: bool) {
        self.digest.reset();
        self.fragment_reassembly.reset();
        self.dtls_write_handshake_seq = 0;
        if reset_verify_data {
            self.client_verify_data.clear();
            self.server_verify_data.clear();
        }
    }

    /// Forget everything bound to the current connection: ciphers, epochs,
    /// sequence numbers, secrets and handshake bookkeeping.
    pub fn reset_for_new_connection(&mut self) {
        self.encryptor.reset();
        self.decryptor.reset();
        self.read_epoch = 0;
        self.write_epoch = 0;
        self.read_sequence.clear();
        self.write_sequence.clear();
        self.pre_master_secret.zeroize();
        self.master_secret.zeroize();
        self.psk.zeroize();
        self.dtls_cookie.clear();
        self.client_verify_data.clear();
        self.server_verify_data.clear();
        self.digest.reset();
        self.fragment_reassembly.reset();
        self.dtls_write_handshake_seq = 0;
        self.quic.reset();
        self.last_flight.clear();
        self.flight_open = false;
        self.received_fatal_alert = false;
        self.transport_failed = false;
    }
}

impl Drop for TlsContext {
    fn drop(&mut self) {
        self.pre_master_secret.zeroize();
        self.master_secret.zeroize();
        self.psk.zeroize();
    }
}

fn pop_at<T>(buffer: &mut VecDeque<T>, index: Option<usize>) -> Result<T, ActionError> {
    if buffer.is_empty() {
        return Err(ActionError::EmptyBuffer);
    }
    let index = index.unwrap_or(0);
    let len = buffer.len();
    buffer
        .remove(index)
        .ok_or(ActionError::IndexOutOfRange { index, len })
}

/// A [`TlsContext`] bound to its layer stack and transport.
#[derive(Debug)]
pub struct ConnectionContext {
    pub tls: TlsContext,
    pub layer_stack: LayerStack,
    pub transport: Box<dyn Transport>,
    connection: AliasedConnection,
}

impl ConnectionContext {
    /// Build a context with the preset layer stack of `connection`.
    pub fn new(connection: AliasedConnection, config: &Config, transport: Box<dyn Transport>) -> Self {
        let mut tls = TlsContext::new(connection.alias.clone(), connection.local_end, config);
        if connection.stack == LayerStackType::Dtls && !tls.default_protocol_version.is_dtls() {
            tls.default_protocol_version = ProtocolVersion::DTLS12;
        }
        if connection.stack == LayerStackType::Quic {
            tls.default_protocol_version = ProtocolVersion::TLS13;
        }
        let layer_stack = LayerStack::preset(connection.stack, &mut tls);
        Self {
            tls,
            layer_stack,
            transport,
            connection,
        }
    }

    pub fn alias(&self) -> &str {
        self.tls.alias()
    }

    pub fn connection(&self) -> &AliasedConnection {
        &self.connection
    }

    pub fn send_data(
        &mut self,
        configs: &[LayerConfiguration],
    ) -> Result<LayerStackProcessingResult, ActionError> {
        self.layer_stack
            .send_data(&mut self.tls, self.transport.as_mut(), configs)
    }

    pub fn receive_data(
        &mut self,
        configs: &[LayerConfiguration],
    ) -> Result<LayerStackProcessingResult, ActionError> {
        self.layer_stack
            .receive_data(&mut self.tls, self.transport.as_mut(), configs)
    }

    pub fn insert_layer(&mut self, position: usize, layer: Box<dyn ProtocolLayer>) {
        self.layer_stack.insert_layer(position, layer, &mut self.tls);
    }

    pub fn remove_layer(&mut self, layer_type: LayerType) -> Option<Box<dyn ProtocolLayer>> {
        self.layer_stack.remove_layer(layer_type)
    }

    pub fn initialize_transport(&mut self) -> Result<(), TransportError> {
        if !self.transport.is_initialized() {
            self.transport.initialize()?;
        }
        Ok(())
    }

    /// Reset the connection state, then close and reopen the transport.
    ///
    /// The state is reset first: if reopening fails, the context is left
    /// with null ciphers at epoch 0 over a closed transport.
    pub fn reset_connection(&mut self) -> Result<(), TransportError> {
        self.tls.reset_for_new_connection();
        self.layer_stack.clear_all();
        self.transport.close_connection()?;
        self.transport.initialize()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::handshake::HandshakeType;

    fn ctx() -> TlsContext {
        let mut ctx = TlsContext::new("client", ConnectionEnd::Client, &Config::default());
        ctx.client_random = vec![1; 32];
        ctx.server_random = vec![2; 32];
        ctx.master_secret = vec![3; 48];
        ctx
    }

    #[test]
    fn test_activate_steps_epoch_per_direction() {
        let mut ctx = ctx();
        assert_eq!(ctx.activate_cipher(CipherDirection::Encrypt, None).unwrap(), 1);
        assert_eq!(ctx.write_epoch, 1);
        assert_eq!(ctx.encryptor.current_epoch(), 1);
        assert!(!ctx.encryptor.current().cipher.is_null());

        assert_eq!(ctx.activate_cipher(CipherDirection::Decrypt, Some(4)).unwrap(), 4);
        assert_eq!(ctx.read_epoch, 4);
        assert_eq!(ctx.write_epoch, 1);
    }

    #[test]
    fn test_activate_resets_sequence_of_new_epoch() {
        let mut ctx = ctx();
        ctx.set_write_sequence(1, 99);
        ctx.activate_cipher(CipherDirection::Encrypt, None).unwrap();
        assert_eq!(ctx.next_write_sequence(1), 0);
        assert_eq!(ctx.next_write_sequence(1), 1);
        assert_eq!(ctx.write_sequence(0), 0);
    }

    #[test]
    fn test_unsupported_suite_leaves_state() {
        let mut ctx = ctx();
        ctx.selected_cipher_suite = Some(CipherSuite::TLS_NULL_WITH_NULL_NULL);
        assert!(ctx.activate_cipher(CipherDirection::Encrypt, None).is_err());
        assert_eq!(ctx.encryptor.len(), 1);
        assert_eq!(ctx.write_epoch, 0);
    }

    #[test]
    fn test_deactivate_pushes_null_at_current_epoch() {
        let mut ctx = ctx();
        ctx.activate_cipher(CipherDirection::Decrypt, None).unwrap();
        ctx.deactivate_cipher(CipherDirection::Decrypt);
        assert_eq!(ctx.decryptor.len(), 3);
        assert_eq!(ctx.decryptor.current_epoch(), 1);
        assert!(ctx.decryptor.current().cipher.is_null());
    }

    #[test]
    fn test_rederive_uses_new_suite() {
        let mut ctx = ctx();
        ctx.activate_cipher(CipherDirection::Encrypt, None).unwrap();
        ctx.selected_cipher_suite = Some(CipherSuite::TLS_CHACHA20_POLY1305_SHA256);
        ctx.rederive_current_ciphers().unwrap();
        assert_eq!(
            ctx.encryptor.current().cipher.suite(),
            Some(CipherSuite::TLS_CHACHA20_POLY1305_SHA256)
        );
        assert!(ctx.decryptor.current().cipher.is_null());
        assert_eq!(ctx.encryptor.len(), 2);
    }

    #[test]
    fn test_pop_buffers() {
        let mut ctx = ctx();
        assert!(matches!(ctx.pop_buffered_message(None), Err(ActionError::EmptyBuffer)));
        ctx.message_buffer
            .push_back(ProtocolMessage::handshake(HandshakeType::ClientHello, vec![]));
        ctx.message_buffer
            .push_back(ProtocolMessage::handshake(HandshakeType::Finished, vec![]));
        assert!(matches!(
            ctx.pop_buffered_message(Some(2)),
            Err(ActionError::IndexOutOfRange { index: 2, len: 2 })
        ));
        let popped = ctx.pop_buffered_message(Some(1)).unwrap();
        assert_eq!(popped.handshake_type(), Some(HandshakeType::Finished));
        assert_eq!(ctx.message_buffer.len(), 1);
        assert!(matches!(ctx.pop_buffered_record(None), Err(ActionError::EmptyBuffer)));
    }

    #[test]
    fn test_flights() {
        let mut ctx = ctx();
        ctx.record_sent(Record::template());
        ctx.record_sent(Record::template());
        assert_eq!(ctx.last_flight().len(), 2);
        ctx.close_flight();
        assert_eq!(ctx.last_flight().len(), 2);
        ctx.record_sent(Record::template());
        assert_eq!(ctx.last_flight().len(), 1);
    }

    #[test]
    fn test_reset_for_new_connection() {
        let mut ctx = ctx();
        ctx.psk = vec![7; 16];
        ctx.dtls_cookie = vec![1];
        ctx.activate_cipher(CipherDirection::Encrypt, None).unwrap();
        ctx.next_write_sequence(1);
        ctx.digest.update(b"hello");
        ctx.reset_for_new_connection();
        assert_eq!(ctx.encryptor.len(), 1);
        assert_eq!(ctx.write_epoch, 0);
        assert_eq!(ctx.write_sequence(1), 0);
        assert!(ctx.master_secret.is_empty());
        assert!(ctx.psk.is_empty());
        assert!(ctx.dtls_cookie.is_empty());
        assert!(ctx.digest.is_empty());
    }

    #[test]
    fn test_renegotiate_optionally_keeps_verify_data() {
        let mut ctx = ctx();
        ctx.client_verify_data = vec![1; 12];
        ctx.digest.update(b"x");
        ctx.renegotiate(false);
        assert!(ctx.digest.is_empty());
        assert_eq!(ctx.client_verify_data.len(), 12);
        ctx.renegotiate(true);
        assert!(ctx.client_verify_data.is_empty());
    }

    #[test]
    fn test_dtls_stack_defaults_to_dtls_version() {
        use crate::transport::MemoryTransport;
        let (a, _b) = MemoryTransport::pair();
        let conn = AliasedConnection::new("d", ConnectionEnd::Client).with_stack(LayerStackType::Dtls);
        let ctx = ConnectionContext::new(conn, &Config::default(), Box::new(a));
        assert!(ctx.tls.is_dtls());
        assert_eq!(
            ctx.layer_stack.layer_types(),
            vec![LayerType::Message, LayerType::DtlsFragment, LayerType::Record]
        );
    }
}
