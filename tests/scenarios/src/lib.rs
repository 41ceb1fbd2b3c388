//! End-to-end workflow scenarios for tlscript.
//! Whole traces run through the executor against in-process and loopback peers.

#[cfg(test)]
mod tests {
    use std::net::TcpListener;
    use std::time::Duration;

    use tlscript_core::action::context::ConnectionIdSide;
    use tlscript_core::action::{
        ActivateDecryptionAction, ActivateEncryptionAction, Action, BufferedGenericReceiveAction,
        ChangeCipherSuiteAction, ChangeConnectionIdAction, ChangeMasterSecretAction,
        ClearBuffersAction, ForwardMessagesAction, ForwardRecordsAction, PopAndSendAction,
        ReceiveAction, ResendLastFlightAction, SendAction, TlsAction, ToggleLayerAction,
        WaitAction,
    };
    use tlscript_core::config::{AliasedConnection, Config, LayerStackType};
    use tlscript_core::context::ConnectionContext;
    use tlscript_core::handshake::HandshakeType;
    use tlscript_core::layer::{LayerType, ToggleMode};
    use tlscript_core::message::hello::{ClientHello, ServerHello};
    use tlscript_core::message::{MessageKind, ProtocolMessage};
    use tlscript_core::transport::{MemoryControl, MemoryTransport, TcpTransport};
    use tlscript_core::workflow::{State, TraceSerializer, WorkflowExecutor, WorkflowTrace};
    use tlscript_core::{CipherSuite, ConnectionEnd, ProtocolVersion, WorkflowError};

    const SUITE: CipherSuite = CipherSuite::TLS_ECDHE_RSA_WITH_AES_256_GCM_SHA384;

    fn init_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    }

    fn hs(ty: HandshakeType) -> ProtocolMessage {
        ProtocolMessage::handshake(ty, vec![])
    }

    fn client_hello(version: ProtocolVersion) -> ProtocolMessage {
        ClientHello::new(version, [0xC1; 32], vec![SUITE, CipherSuite::TLS_AES_128_GCM_SHA256]).to_message()
    }

    fn server_flight(version: ProtocolVersion) -> Vec<ProtocolMessage> {
        vec![
            ServerHello::new(version, [0x5E; 32], SUITE).to_message(),
            ProtocolMessage::handshake(HandshakeType::Certificate, vec![0, 0, 3, 0, 0, 0]),
            hs(HandshakeType::ServerHelloDone),
        ]
    }

    /// A client and a server context wired back to back.
    fn peers(config: Config, stack: LayerStackType) -> (State, MemoryControl) {
        let (a, b) = MemoryTransport::pair();
        let client_side = a.control();
        let contexts = vec![
            ConnectionContext::new(
                AliasedConnection::new("client", ConnectionEnd::Client).with_stack(stack),
                &config,
                Box::new(a),
            ),
            ConnectionContext::new(
                AliasedConnection::new("server", ConnectionEnd::Server).with_stack(stack),
                &config,
                Box::new(b),
            ),
        ];
        (State::with_contexts(config, contexts).unwrap(), client_side)
    }

    fn hello_exchange(trace: &mut WorkflowTrace, version: ProtocolVersion) {
        trace.push(SendAction::new("client", vec![client_hello(version)]));
        trace.push(ReceiveAction::new("server", vec![hs(HandshakeType::ClientHello)]));
        trace.push(SendAction::new("server", server_flight(version)));
        trace.push(ReceiveAction::new(
            "client",
            vec![
                hs(HandshakeType::ServerHello),
                hs(HandshakeType::Certificate),
                hs(HandshakeType::ServerHelloDone),
            ],
        ));
    }

    /// Both ends agree on a master secret, then switch to protected records.
    fn key_exchange(trace: &mut WorkflowTrace) {
        for alias in ["client", "server"] {
            trace.push(ChangeMasterSecretAction::new(alias, vec![0x33; 48]));
        }
        trace.push(SendAction::new(
            "client",
            vec![
                ProtocolMessage::handshake(HandshakeType::ClientKeyExchange, vec![0; 4]),
                ProtocolMessage::change_cipher_spec(),
            ],
        ));
        trace.push(ActivateEncryptionAction::new("client"));
        trace.push(SendAction::new(
            "client",
            vec![ProtocolMessage::handshake(HandshakeType::Finished, vec![0xF1; 12])],
        ));
        trace.push(ReceiveAction::new(
            "server",
            vec![hs(HandshakeType::ClientKeyExchange), ProtocolMessage::change_cipher_spec()],
        ));
        trace.push(ActivateDecryptionAction::new("server"));
        trace.push(ReceiveAction::new("server", vec![hs(HandshakeType::Finished)]));
    }

    // -------------------------------------------------------
    // 1. Hello exchange negotiates the ServerHello suite
    // -------------------------------------------------------
    #[test]
    fn test_hello_exchange_selects_server_suite() {
        init_tracing();
        let (state, _) = peers(Config::default(), LayerStackType::Tls);
        let mut executor = WorkflowExecutor::from_state(state);
        let mut trace = WorkflowTrace::new();
        hello_exchange(&mut trace, ProtocolVersion::TLS12);
        executor.execute(&mut trace).unwrap();

        assert!(trace.executed_as_planned());
        let client = executor.state().context("client").unwrap();
        assert_eq!(client.tls.selected_cipher_suite, Some(SUITE));
        assert_eq!(client.tls.client_random, vec![0xC1; 32]);
        let server = executor.state().context("server").unwrap();
        assert_eq!(server.tls.proposed_cipher_suites[0], SUITE);
        assert_eq!(server.tls.server_random, vec![0x5E; 32]);
        assert!(trace.did_receive(MessageKind::Handshake(HandshakeType::ServerHelloDone)));
    }

    // -------------------------------------------------------
    // 2. Out-of-order server flight is not as planned
    // -------------------------------------------------------
    #[test]
    fn test_wrong_order_is_not_as_planned() {
        let (state, _) = peers(Config::default(), LayerStackType::Tls);
        let mut executor = WorkflowExecutor::from_state(state);
        let mut trace = WorkflowTrace::new();
        let mut flight = server_flight(ProtocolVersion::TLS12);
        flight.swap(1, 2);
        trace.push(SendAction::new("server", flight));
        trace.push(ReceiveAction::new(
            "client",
            vec![
                hs(HandshakeType::ServerHello),
                hs(HandshakeType::Certificate),
                hs(HandshakeType::ServerHelloDone),
            ],
        ));
        executor.execute(&mut trace).unwrap();
        assert!(trace.actions[0].executed_as_planned());
        assert!(trace.actions[1].is_executed());
        assert!(!trace.actions[1].executed_as_planned());
    }

    // -------------------------------------------------------
    // 3. Full exchange with protected Finished
    // -------------------------------------------------------
    #[test]
    fn test_protected_finished_after_key_exchange() {
        init_tracing();
        let (state, _) = peers(Config::default(), LayerStackType::Tls);
        let mut executor = WorkflowExecutor::from_state(state);
        let mut trace = WorkflowTrace::new();
        hello_exchange(&mut trace, ProtocolVersion::TLS12);
        key_exchange(&mut trace);
        executor.execute(&mut trace).unwrap();

        assert!(trace.executed_as_planned());
        let finished = trace
            .first_received_message(MessageKind::Handshake(HandshakeType::Finished))
            .unwrap();
        assert_eq!(finished.payload, vec![0xF1; 12]);
        let server = executor.state().context("server").unwrap();
        assert_eq!(server.tls.client_verify_data, vec![0xF1; 12]);
        assert_eq!(server.tls.read_epoch, 1);
        assert_eq!(server.tls.write_epoch, 0);
    }

    // -------------------------------------------------------
    // 4. ChangeCipherSuite re-derives for the new suite
    // -------------------------------------------------------
    #[test]
    fn test_change_cipher_suite_then_activate() {
        let (state, _) = peers(Config::default(), LayerStackType::Tls);
        let mut executor = WorkflowExecutor::from_state(state);
        let mut trace = WorkflowTrace::new();
        hello_exchange(&mut trace, ProtocolVersion::TLS12);
        for alias in ["client", "server"] {
            trace.push(ChangeCipherSuiteAction::new(alias, CipherSuite::TLS_CHACHA20_POLY1305_SHA256));
            trace.push(ChangeMasterSecretAction::new(alias, vec![0x44; 48]));
        }
        trace.push(ActivateEncryptionAction::new("client"));
        trace.push(ActivateDecryptionAction::new("server"));
        let data = ProtocolMessage::application_data(b"over chacha".to_vec());
        trace.push(SendAction::new("client", vec![data.clone()]));
        trace.push(ReceiveAction::new("server", vec![data]));
        executor.execute(&mut trace).unwrap();

        assert!(trace.executed_as_planned());
        let client = executor.state().context("client").unwrap();
        assert_eq!(
            client.tls.encryptor.current().cipher.suite(),
            Some(CipherSuite::TLS_CHACHA20_POLY1305_SHA256)
        );
        let server = executor.state().context("server").unwrap();
        assert_eq!(
            server.tls.decryptor.current().cipher.suite(),
            Some(CipherSuite::TLS_CHACHA20_POLY1305_SHA256)
        );
    }

    // -------------------------------------------------------
    // 5. DTLS: fragmented flight, epochs per direction
    // -------------------------------------------------------
    #[test]
    fn test_dtls_fragmented_exchange() {
        init_tracing();
        let config = Config::builder()
            .default_protocol_version(ProtocolVersion::DTLS12)
            .dtls_max_fragment_length(16)
            .build();
        let (state, _) = peers(config, LayerStackType::Dtls);
        let mut executor = WorkflowExecutor::from_state(state);
        let mut trace = WorkflowTrace::new();
        trace.push(SendAction::new("client", vec![client_hello(ProtocolVersion::DTLS12)]));
        trace.push(ReceiveAction::new("server", vec![hs(HandshakeType::ClientHello)]));
        key_exchange(&mut trace);
        executor.execute(&mut trace).unwrap();

        assert!(trace.executed_as_planned());
        match &trace.actions[0] {
            Action::Send(send) => assert!(send.sent_records().len() > 1),
            other => panic!("unexpected action {other:?}"),
        }
        let client = executor.state().context("client").unwrap();
        assert_eq!(client.tls.write_epoch, 1);
        assert_eq!(client.tls.read_epoch, 0);
        let server = executor.state().context("server").unwrap();
        assert_eq!(server.tls.client_random, vec![0xC1; 32]);
    }

    // -------------------------------------------------------
    // 6. DTLS retransmission reuses the original epoch
    // -------------------------------------------------------
    #[test]
    fn test_dtls_resend_last_flight() {
        let config = Config::builder()
            .default_protocol_version(ProtocolVersion::DTLS12)
            .build();
        let (mut state, _) = peers(config, LayerStackType::Dtls);
        for ctx in state.contexts_mut() {
            ctx.tls.client_random = vec![1; 32];
            ctx.tls.server_random = vec![2; 32];
            ctx.tls.master_secret = vec![3; 48];
        }
        let mut executor = WorkflowExecutor::from_state(state);
        let mut trace = WorkflowTrace::new();
        trace.push(SendAction::new("client", vec![client_hello(ProtocolVersion::DTLS12)]));
        trace.push(ActivateEncryptionAction::new("client"));
        trace.push(ResendLastFlightAction::new("client"));
        executor.execute(&mut trace).unwrap();
        assert!(trace.actions[2].executed_as_planned());

        let first = trace.actions[0].sent_records();
        let resent = trace.actions[2].sent_records();
        assert_eq!(first.len(), resent.len());
        for (a, b) in first.iter().zip(&resent) {
            assert_eq!(a.epoch, Some(0));
            assert_eq!(b.epoch, Some(0));
            assert_eq!(a.fragment, b.fragment);
            assert!(b.sequence_number > a.sequence_number);
        }
    }

    // -------------------------------------------------------
    // 7. QUIC: ClientHello in Initial packets
    // -------------------------------------------------------
    #[test]
    fn test_quic_client_hello() {
        init_tracing();
        let config = Config::builder().quic_max_packet_payload(120).build();
        let (state, _) = peers(config, LayerStackType::Quic);
        let mut executor = WorkflowExecutor::from_state(state);
        let mut trace = WorkflowTrace::new();
        trace.push(ChangeConnectionIdAction::new("client", vec![0x5E; 8], ConnectionIdSide::Write));
        trace.push(ChangeConnectionIdAction::new("client", vec![0xC1; 4], ConnectionIdSide::Read));
        trace.push(ChangeConnectionIdAction::new("server", vec![0xC1; 4], ConnectionIdSide::Write));
        trace.push(ChangeConnectionIdAction::new("server", vec![0x5E; 8], ConnectionIdSide::Read));
        trace.push(SendAction::new("client", vec![client_hello(ProtocolVersion::TLS13)]));
        trace.push(ReceiveAction::new("server", vec![hs(HandshakeType::ClientHello)]));
        executor.execute(&mut trace).unwrap();

        assert!(trace.executed_as_planned());
        let server = executor.state().context("server").unwrap();
        assert_eq!(server.tls.client_random, vec![0xC1; 32]);
        assert_eq!(server.tls.proposed_cipher_suites.len(), 2);
    }

    // -------------------------------------------------------
    // 8. Man in the middle: records and messages forwarded
    // -------------------------------------------------------
    #[test]
    fn test_mitm_forwarding() {
        init_tracing();
        let config = Config::default();
        let (client, mitm_server) = MemoryTransport::pair();
        let (mitm_client, server) = MemoryTransport::pair();
        let contexts = vec![
            ConnectionContext::new(AliasedConnection::new("client", ConnectionEnd::Client), &config, Box::new(client)),
            ConnectionContext::new(
                AliasedConnection::new("mitm-server", ConnectionEnd::Server),
                &config,
                Box::new(mitm_server),
            ),
            ConnectionContext::new(
                AliasedConnection::new("mitm-client", ConnectionEnd::Client),
                &config,
                Box::new(mitm_client),
            ),
            ConnectionContext::new(AliasedConnection::new("server", ConnectionEnd::Server), &config, Box::new(server)),
        ];
        let state = State::with_contexts(config, contexts).unwrap();
        let mut executor = WorkflowExecutor::from_state(state);

        let mut trace = WorkflowTrace::new();
        trace.push(SendAction::new("client", vec![client_hello(ProtocolVersion::TLS12)]));
        trace.push(ForwardMessagesAction::new(
            "mitm-server",
            "mitm-client",
            vec![hs(HandshakeType::ClientHello)],
        ));
        trace.push(ReceiveAction::new("server", vec![hs(HandshakeType::ClientHello)]));
        trace.push(SendAction::new("server", server_flight(ProtocolVersion::TLS12)));
        trace.push(ForwardRecordsAction::new("mitm-client", "mitm-server"));
        trace.push(ReceiveAction::new(
            "client",
            vec![
                hs(HandshakeType::ServerHello),
                hs(HandshakeType::Certificate),
                hs(HandshakeType::ServerHelloDone),
            ],
        ));
        executor.execute(&mut trace).unwrap();

        assert!(trace.executed_as_planned());
        let forwarded = trace.actions[4].received_records();
        assert_eq!(forwarded.len(), trace.actions[4].sent_records().len());
        let mitm = executor.state().context("mitm-server").unwrap();
        assert_eq!(mitm.tls.client_random, vec![0xC1; 32]);
        let client = executor.state().context("client").unwrap();
        assert_eq!(client.tls.selected_cipher_suite, Some(SUITE));
    }

    // -------------------------------------------------------
    // 9. Buffered receive, selective replay
    // -------------------------------------------------------
    #[test]
    fn test_buffer_and_replay() {
        let (state, _) = peers(Config::default(), LayerStackType::Tls);
        let mut executor = WorkflowExecutor::from_state(state);
        let mut trace = WorkflowTrace::new();
        trace.push(SendAction::new("server", server_flight(ProtocolVersion::TLS12)));
        trace.push(BufferedGenericReceiveAction::new("client"));
        trace.push(PopAndSendAction::new("client").at(2));
        trace.push(ReceiveAction::new("server", vec![hs(HandshakeType::ServerHelloDone)]));
        executor.execute(&mut trace).unwrap();
        assert!(trace.executed_as_planned());
        let client = executor.state().context("client").unwrap();
        assert_eq!(client.tls.message_buffer.len(), 2);

        let mut clear = WorkflowTrace::new();
        clear.push(ClearBuffersAction::new("client"));
        executor.execute_actions(&mut clear).unwrap();
        let client = executor.state().context("client").unwrap();
        assert!(client.tls.message_buffer.is_empty());
        assert!(client.tls.record_buffer.is_empty());
    }

    // -------------------------------------------------------
    // 10. Traces survive persistence; executed traces need a reset
    // -------------------------------------------------------
    #[test]
    fn test_persisted_trace_replays() {
        let config = Config::default();
        let serializer = TraceSerializer::new(&config);
        let mut trace = WorkflowTrace::new();
        hello_exchange(&mut trace, ProtocolVersion::TLS12);
        trace.push(ToggleLayerAction::new("client", LayerType::QuicFrame, ToggleMode::Enable));
        let text = serializer.to_string(&trace).unwrap();
        let mut loaded = serializer.from_str(&text).unwrap();
        assert_eq!(loaded.actions, trace.actions);

        let (state, _) = peers(config.clone(), LayerStackType::Tls);
        let mut executor = WorkflowExecutor::from_state(state);
        executor.execute(&mut loaded).unwrap();
        assert!(loaded.actions[..4].iter().all(|a| a.executed_as_planned()));
        assert!(loaded.actions[4].is_executed());
        assert!(!loaded.actions[4].executed_as_planned());

        let err = executor.execute_actions(&mut loaded).unwrap_err();
        assert!(matches!(err, WorkflowError::Action { index: 0, .. }));

        loaded.reset_all();
        let (state, _) = peers(config, LayerStackType::Tls);
        let mut executor = WorkflowExecutor::from_state(state);
        executor.execute(&mut loaded).unwrap();
        assert!(loaded.actions[3].executed_as_planned());
    }

    // -------------------------------------------------------
    // 11. Loopback TCP hello exchange
    // -------------------------------------------------------
    #[test]
    fn test_tcp_loopback_hello() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let timeout = Duration::from_millis(500);
        let config = Config::builder().receive_timeout(timeout).build();

        let client_conn = AliasedConnection::new("client", ConnectionEnd::Client)
            .with_endpoint(addr.ip().to_string(), addr.port());
        let client_transport = TcpTransport::new(ConnectionEnd::Client, addr.to_string(), timeout);
        let mut client = ConnectionContext::new(client_conn, &config, Box::new(client_transport));
        client.initialize_transport().unwrap();
        let (accepted, _) = listener.accept().unwrap();
        let server = ConnectionContext::new(
            AliasedConnection::new("server", ConnectionEnd::Server),
            &config,
            Box::new(TcpTransport::from_stream(accepted, timeout).unwrap()),
        );

        let state = State::with_contexts(config, vec![client, server]).unwrap();
        let mut executor = WorkflowExecutor::from_state(state);
        let mut trace = WorkflowTrace::new();
        hello_exchange(&mut trace, ProtocolVersion::TLS12);
        trace.push(WaitAction::new(1));
        executor.execute(&mut trace).unwrap();
        assert!(trace.executed_as_planned());
        assert!(executor
            .state()
            .contexts()
            .iter()
            .all(|c| c.transport.is_closed()));
    }

    // -------------------------------------------------------
    // 12. Send failure under MAY_FAIL keeps the trace going
    // -------------------------------------------------------
    #[test]
    fn test_may_fail_send_continues() {
        let (state, client_side) = peers(Config::default(), LayerStackType::Tls);
        client_side.set_fail_sends(true);
        let mut executor = WorkflowExecutor::from_state(state);
        let mut trace = WorkflowTrace::new();
        let mut send = SendAction::new("client", vec![client_hello(ProtocolVersion::TLS12)]);
        send.base = send.base.with_option(tlscript_core::action::ActionOption::MayFail);
        trace.push(send);
        trace.push(WaitAction::new(0));
        executor.execute(&mut trace).unwrap();
        assert!(!trace.actions[0].executed_as_planned());
        assert!(trace.actions[1].executed_as_planned());
        assert!(executor.state().context("client").unwrap().tls.transport_failed);
    }
}
