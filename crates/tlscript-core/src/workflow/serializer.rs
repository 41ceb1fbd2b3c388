//! JSON persistence of workflow traces.
//!
//! Only configuration is written; observed values and execution status are
//! not. Traces are filtered before writing and normalized after reading, so
//! a single-connection trace on the default connection stays terse on disk.

use std::io;

use super::WorkflowTrace;
use crate::config::Config;

#[derive(Debug, thiserror::Error)]
pub enum TraceError {
    #[error("malformed trace: {0}")]
    Format(#[from] serde_json::Error),
    #[error("trace i/o: {0}")]
    Io(#[from] io::Error),
}

/// Reads and writes traces against one configuration.
#[derive(Debug, Clone, Copy)]
pub struct TraceSerializer<'a> {
    config: &'a Config,
}

impl<'a> TraceSerializer<'a> {
    pub fn new(config: &'a Config) -> Self {
        Self { config }
    }

    fn filtered(&self, trace: &WorkflowTrace) -> WorkflowTrace {
        let mut copy = trace.clone();
        copy.filter(self.config);
        copy
    }

    pub fn to_string(&self, trace: &WorkflowTrace) -> Result<String, TraceError> {
        Ok(serde_json::to_string_pretty(&self.filtered(trace))?)
    }

    pub fn from_str(&self, s: &str) -> Result<WorkflowTrace, TraceError> {
        let mut trace: WorkflowTrace = serde_json::from_str(s)?;
        trace.normalize(self.config);
        Ok(trace)
    }

    pub fn write_to<W: io::Write>(&self, trace: &WorkflowTrace, writer: W) -> Result<(), TraceError> {
        serde_json::to_writer_pretty(writer, &self.filtered(trace))?;
        Ok(())
    }

    pub fn read_from<R: io::Read>(&self, reader: R) -> Result<WorkflowTrace, TraceError> {
        let mut trace: WorkflowTrace = serde_json::from_reader(reader)?;
        trace.normalize(self.config);
        Ok(trace)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::compare::ComparisonStrategy;
    use crate::action::{
        Action, ActionOption, ChangeContextValueAction, ForwardRecordsAction, ReceiveAction,
        SendAction, TlsAction, ToggleLayerAction, WaitAction,
    };
    use crate::config::AliasedConnection;
    use crate::context::{ContextField, ContextValue};
    use crate::handshake::HandshakeType;
    use crate::layer::{LayerType, ToggleMode};
    use crate::message::ProtocolMessage;
    use crate::{CipherSuite, ConnectionEnd};

    fn mixed_trace() -> WorkflowTrace {
        let mut trace = WorkflowTrace::new();
        trace.name = Some("handshake".into());
        trace.push(SendAction::new(
            "client",
            vec![ProtocolMessage::handshake(HandshakeType::ClientHello, vec![1, 2, 3])],
        ));
        let mut receive = ReceiveAction::new(
            "client",
            vec![
                ProtocolMessage::handshake(HandshakeType::ServerHello, vec![]),
                ProtocolMessage::handshake(HandshakeType::CertificateRequest, vec![]).optional(),
            ],
        )
        .with_strategy(ComparisonStrategy::Content);
        receive.base = receive.base.with_option(ActionOption::IgnoreUnexpectedWarnings);
        trace.push(receive);
        trace.push(ChangeContextValueAction::new(
            "client",
            ContextField::SelectedCipherSuite,
            ContextValue::CipherSuite(CipherSuite::TLS_AES_128_GCM_SHA256),
        ));
        trace.push(ToggleLayerAction::new("client", LayerType::Message, ToggleMode::Disable));
        trace.push(WaitAction::new(10));
        trace
    }

    #[test]
    fn test_round_trip_keeps_configuration() {
        let config = Config::default();
        let serializer = TraceSerializer::new(&config);
        let mut trace = mixed_trace();
        trace.normalize(&config);

        let text = serializer.to_string(&trace).unwrap();
        let loaded = serializer.from_str(&text).unwrap();
        assert_eq!(loaded, trace);
        assert!(loaded.actions.iter().all(|a| !a.is_executed()));
    }

    #[test]
    fn test_default_connection_is_filtered() {
        let config = Config::default();
        let serializer = TraceSerializer::new(&config);
        let mut trace = mixed_trace();
        trace.normalize(&config);

        let json: serde_json::Value = serde_json::from_str(&serializer.to_string(&trace).unwrap()).unwrap();
        assert!(json.get("connections").is_none());
        assert!(json["actions"][0].get("connection_alias").is_none());
        assert_eq!(json["actions"][0]["action"], "Send");
        assert_eq!(json["actions"][4]["time_to_wait_ms"], 10);
    }

    #[test]
    fn test_mitm_trace_keeps_aliases() {
        let config = Config::default();
        let serializer = TraceSerializer::new(&config);
        let mut trace = WorkflowTrace::with_connections(vec![
            AliasedConnection::new("to-client", ConnectionEnd::Server),
            AliasedConnection::new("to-server", ConnectionEnd::Client),
        ]);
        trace.push(ForwardRecordsAction::new("to-client", "to-server"));

        let mut buf = Vec::new();
        serializer.write_to(&trace, &mut buf).unwrap();
        let loaded = serializer.read_from(buf.as_slice()).unwrap();
        assert_eq!(loaded, trace);
        match &loaded.actions[0] {
            Action::ForwardRecords(f) => {
                assert_eq!(f.receive_from_alias.as_deref(), Some("to-client"));
                assert_eq!(f.forward_to_alias.as_deref(), Some("to-server"));
            }
            other => panic!("unexpected action {other:?}"),
        }
    }

    #[test]
    fn test_executed_trace_persists_unexecuted() {
        let config = Config::default();
        let serializer = TraceSerializer::new(&config);
        let mut trace = WorkflowTrace::new();
        trace.push(WaitAction::new(0));
        trace.normalize(&config);
        let fresh = trace.clone();

        let (transport, _peer) = crate::transport::MemoryTransport::pair();
        let ctx = crate::context::ConnectionContext::new(config.default_connection(), &config, Box::new(transport));
        let mut state = super::super::State::with_contexts(config.clone(), vec![ctx]).unwrap();
        trace.actions[0].execute(&mut state).unwrap();
        assert!(trace.actions[0].is_executed());

        let loaded = serializer.from_str(&serializer.to_string(&trace).unwrap()).unwrap();
        assert_eq!(loaded, fresh);
    }

    #[test]
    fn test_unknown_action_rejected() {
        let config = Config::default();
        let serializer = TraceSerializer::new(&config);
        let err = serializer
            .from_str(r#"{"actions":[{"action":"Teleport"}]}"#)
            .unwrap_err();
        assert!(matches!(err, TraceError::Format(_)));
    }
}
