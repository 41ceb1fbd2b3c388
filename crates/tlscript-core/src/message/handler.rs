//! Context adjustment for sent and received messages.
//!
//! Handlers record negotiated values in the connection context. They never
//! change cipher state: record protection only changes through explicit
//! cipher actions, so a ChangeCipherSpec is recorded and nothing more.
//! Bodies that fail to parse are logged and leave the context untouched.

use tracing::{debug, warn};

use super::hello::{ClientHello, HelloVerifyRequest, ServerHello};
use super::{MessageKind, ProtocolMessage};
use crate::context::TlsContext;
use crate::handshake::HandshakeType;
use crate::ConnectionEnd;

/// Whether the local end sent or received a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageDirection {
    Sent,
    Received,
}

impl MessageDirection {
    /// The connection end that produced the message.
    fn sender(self, local: ConnectionEnd) -> ConnectionEnd {
        match self {
            MessageDirection::Sent => local,
            MessageDirection::Received => local.peer(),
        }
    }
}

pub fn adjust_context(ctx: &mut TlsContext, message: &ProtocolMessage, direction: MessageDirection) {
    match message.kind {
        MessageKind::Handshake(HandshakeType::ClientHello) => adjust_client_hello(ctx, message),
        MessageKind::Handshake(HandshakeType::ServerHello) => adjust_server_hello(ctx, message),
        MessageKind::Handshake(HandshakeType::HelloVerifyRequest) => {
            match HelloVerifyRequest::parse(&message.payload) {
                Ok(hvr) => ctx.dtls_cookie = hvr.cookie,
                Err(e) => warn!(alias = ctx.alias(), "unparseable HelloVerifyRequest: {e}"),
            }
        }
        MessageKind::Handshake(HandshakeType::Finished) => {
            match direction.sender(ctx.connection_end) {
                ConnectionEnd::Client => ctx.client_verify_data = message.payload.clone(),
                ConnectionEnd::Server => ctx.server_verify_data = message.payload.clone(),
            }
        }
        MessageKind::Alert => {
            if direction == MessageDirection::Received && message.is_fatal_alert() {
                debug!(alias = ctx.alias(), "received fatal alert");
                ctx.received_fatal_alert = true;
            }
        }
        _ => {}
    }
}

fn adjust_client_hello(ctx: &mut TlsContext, message: &ProtocolMessage) {
    let ch = match ClientHello::parse(&message.payload, ctx.is_dtls()) {
        Ok(ch) => ch,
        Err(e) => {
            warn!(alias = ctx.alias(), "unparseable ClientHello: {e}");
            return;
        }
    };
    ctx.client_random = ch.random;
    ctx.session_id = ch.session_id;
    if let Some(cookie) = ch.cookie.filter(|c| !c.is_empty()) {
        ctx.dtls_cookie = cookie;
    }
    ctx.proposed_cipher_suites = ch.cipher_suites;
    ctx.proposed_extensions = ch.extensions.iter().map(|(ty, _)| *ty).collect();
}

fn adjust_server_hello(ctx: &mut TlsContext, message: &ProtocolMessage) {
    let sh = match ServerHello::parse(&message.payload) {
        Ok(sh) => sh,
        Err(e) => {
            warn!(alias = ctx.alias(), "unparseable ServerHello: {e}");
            return;
        }
    };
    let version = sh.selected_version();
    debug!(
        alias = ctx.alias(),
        suite = sh.cipher_suite.0,
        version = %version,
        "server hello negotiated"
    );
    ctx.server_random = sh.random;
    ctx.session_id = sh.session_id;
    ctx.selected_cipher_suite = Some(sh.cipher_suite);
    ctx.selected_compression = sh.compression_method;
    ctx.selected_protocol_version = Some(version);
    ctx.negotiated_extensions = sh.extensions.iter().map(|(ty, _)| *ty).collect();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alert::{Alert, AlertDescription};
    use crate::config::Config;
    use crate::{CipherSuite, ExtensionType, ProtocolVersion};

    fn ctx(end: ConnectionEnd) -> TlsContext {
        TlsContext::new("client", end, &Config::default())
    }

    #[test]
    fn test_server_hello_sets_negotiated_values() {
        let mut ctx = ctx(ConnectionEnd::Client);
        let mut sh = ServerHello::new(
            ProtocolVersion::TLS12,
            [9; 32],
            CipherSuite::TLS_ECDHE_ECDSA_WITH_AES_256_GCM_SHA384,
        );
        sh.extensions.push((ExtensionType::RENEGOTIATION_INFO, vec![0]));
        adjust_context(&mut ctx, &sh.to_message(), MessageDirection::Received);

        assert_eq!(
            ctx.selected_cipher_suite,
            Some(CipherSuite::TLS_ECDHE_ECDSA_WITH_AES_256_GCM_SHA384)
        );
        assert_eq!(ctx.selected_protocol_version, Some(ProtocolVersion::TLS12));
        assert_eq!(ctx.server_random, vec![9; 32]);
        assert!(ctx.negotiated_extensions.contains(&ExtensionType::RENEGOTIATION_INFO));
    }

    #[test]
    fn test_client_hello_sets_proposals() {
        let mut ctx = ctx(ConnectionEnd::Server);
        let mut ch = ClientHello::new(
            ProtocolVersion::TLS12,
            [3; 32],
            vec![CipherSuite::TLS_AES_128_GCM_SHA256],
        );
        ch.extensions.push((ExtensionType::SUPPORTED_GROUPS, vec![0, 2, 0, 29]));
        ch.extensions.push((ExtensionType::KEY_SHARE, vec![]));
        adjust_context(&mut ctx, &ch.to_message(), MessageDirection::Received);

        assert_eq!(ctx.client_random, vec![3; 32]);
        assert_eq!(ctx.proposed_cipher_suites, vec![CipherSuite::TLS_AES_128_GCM_SHA256]);
        let order: Vec<_> = ctx.proposed_extensions.iter().copied().collect();
        assert_eq!(order, vec![ExtensionType::SUPPORTED_GROUPS, ExtensionType::KEY_SHARE]);
    }

    #[test]
    fn test_finished_verify_data_by_sender() {
        let mut ctx = ctx(ConnectionEnd::Client);
        let fin = ProtocolMessage::handshake(HandshakeType::Finished, vec![0xAA; 12]);
        adjust_context(&mut ctx, &fin, MessageDirection::Sent);
        assert_eq!(ctx.client_verify_data, vec![0xAA; 12]);
        let fin = ProtocolMessage::handshake(HandshakeType::Finished, vec![0xBB; 12]);
        adjust_context(&mut ctx, &fin, MessageDirection::Received);
        assert_eq!(ctx.server_verify_data, vec![0xBB; 12]);
    }

    #[test]
    fn test_fatal_alert_flag_only_on_receive() {
        let mut ctx = ctx(ConnectionEnd::Client);
        let alert = ProtocolMessage::alert(Alert::fatal(AlertDescription::BadRecordMac));
        adjust_context(&mut ctx, &alert, MessageDirection::Sent);
        assert!(!ctx.received_fatal_alert);
        adjust_context(&mut ctx, &alert, MessageDirection::Received);
        assert!(ctx.received_fatal_alert);
    }

    #[test]
    fn test_garbage_server_hello_ignored() {
        let mut ctx = ctx(ConnectionEnd::Client);
        let bogus = ProtocolMessage::handshake(HandshakeType::ServerHello, vec![3, 3, 1]);
        adjust_context(&mut ctx, &bogus, MessageDirection::Received);
        assert_eq!(ctx.selected_cipher_suite, None);
    }

    #[test]
    fn test_change_cipher_spec_leaves_ciphers() {
        let mut ctx = ctx(ConnectionEnd::Client);
        adjust_context(&mut ctx, &ProtocolMessage::change_cipher_spec(), MessageDirection::Received);
        assert_eq!(ctx.decryptor.len(), 1);
        assert_eq!(ctx.read_epoch, 0);
    }
}
