//! Actions on the message and record buffers of a context.

use serde::{Deserialize, Serialize};
use tlscript_types::ActionError;
use tracing::{debug, info};

use super::{summarize, ActionBase, Capability, TlsAction, CONNECTION_BOUND, RECEIVING, SENDING};
use crate::layer::{DataUnit, LayerConfiguration, LayerStackProcessingResult, LayerType};
use crate::message::handler::{adjust_context, MessageDirection};
use crate::message::ProtocolMessage;
use crate::record::Record;
use crate::workflow::State;

macro_rules! buffer_action_common {
    ($name:literal, $caps:expr) => {
        fn name(&self) -> &'static str {
            $name
        }

        fn base(&self) -> &ActionBase {
            &self.base
        }

        fn base_mut(&mut self) -> &mut ActionBase {
            &mut self.base
        }

        fn capabilities(&self) -> &'static [Capability] {
            $caps
        }
    };
}

/// Send every buffered message, oldest first, emptying the message buffer.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BufferedSendAction {
    #[serde(flatten)]
    pub base: ActionBase,
    #[serde(skip)]
    result: Option<LayerStackProcessingResult>,
}

impl BufferedSendAction {
    pub fn new(alias: impl Into<String>) -> Self {
        Self {
            base: ActionBase::new(alias),
            result: None,
        }
    }
}

impl TlsAction for BufferedSendAction {
    buffer_action_common!("BufferedSend", SENDING);

    fn run(&mut self, state: &mut State) -> Result<(), ActionError> {
        let alias = self.base.alias("BufferedSend")?;
        let ctx = state.context_mut(alias)?;
        if ctx.tls.message_buffer.is_empty() {
            return Err(ActionError::EmptyBuffer);
        }
        let units: Vec<DataUnit> = ctx.tls.message_buffer.drain(..).map(DataUnit::from).collect();
        let result = ctx.send_data(&[LayerConfiguration::send(LayerType::Message, units)])?;
        info!(alias, "sending buffered {}", summarize(&result.messages()));
        self.result = Some(result);
        Ok(())
    }

    fn clear_observed(&mut self) {
        self.result = None;
    }

    fn outcome_as_planned(&self) -> bool {
        self.result.as_ref().is_some_and(|r| r.executed_as_planned())
    }

    fn sent_messages(&self) -> Vec<ProtocolMessage> {
        self.result.as_ref().map(|r| r.messages()).unwrap_or_default()
    }
}

/// Receive generically and append what arrived to the buffers.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BufferedGenericReceiveAction {
    #[serde(flatten)]
    pub base: ActionBase,
    #[serde(skip)]
    result: Option<LayerStackProcessingResult>,
}

impl BufferedGenericReceiveAction {
    pub fn new(alias: impl Into<String>) -> Self {
        Self {
            base: ActionBase::new(alias),
            result: None,
        }
    }
}

impl TlsAction for BufferedGenericReceiveAction {
    buffer_action_common!("BufferedGenericReceive", RECEIVING);

    fn run(&mut self, state: &mut State) -> Result<(), ActionError> {
        let alias = self.base.alias("BufferedGenericReceive")?;
        let ctx = state.context_mut(alias)?;
        let result = ctx.receive_data(&[LayerConfiguration::generic(LayerType::Message)])?;
        let messages = result.messages();
        info!(alias, "buffering {}", summarize(&messages));
        ctx.tls.message_buffer.extend(messages);
        ctx.tls.record_buffer.extend(result.records());
        self.result = Some(result);
        Ok(())
    }

    fn clear_observed(&mut self) {
        self.result = None;
    }

    fn outcome_as_planned(&self) -> bool {
        self.result.is_some()
    }

    fn received_messages(&self) -> Vec<ProtocolMessage> {
        self.result.as_ref().map(|r| r.messages()).unwrap_or_default()
    }

    fn received_records(&self) -> Vec<Record> {
        self.result.as_ref().map(|r| r.records()).unwrap_or_default()
    }
}

/// Remove one buffered message and send it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PopAndSendAction {
    #[serde(flatten)]
    pub base: ActionBase,
    /// Buffer position; the oldest message when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index: Option<usize>,
    #[serde(skip)]
    result: Option<LayerStackProcessingResult>,
}

impl PopAndSendAction {
    pub fn new(alias: impl Into<String>) -> Self {
        Self {
            base: ActionBase::new(alias),
            ..Self::default()
        }
    }

    pub fn at(mut self, index: usize) -> Self {
        self.index = Some(index);
        self
    }
}

impl TlsAction for PopAndSendAction {
    buffer_action_common!("PopAndSend", SENDING);

    fn run(&mut self, state: &mut State) -> Result<(), ActionError> {
        let alias = self.base.alias("PopAndSend")?;
        let ctx = state.context_mut(alias)?;
        let message = ctx.tls.pop_buffered_message(self.index)?;
        debug!(alias, kind = %message.kind, left = ctx.tls.message_buffer.len(), "popped message");
        let result = ctx.send_data(&[LayerConfiguration::send(LayerType::Message, vec![message.into()])])?;
        info!(alias, "sending {}", summarize(&result.messages()));
        self.result = Some(result);
        Ok(())
    }

    fn clear_observed(&mut self) {
        self.result = None;
    }

    fn outcome_as_planned(&self) -> bool {
        self.result.as_ref().is_some_and(|r| r.executed_as_planned())
    }

    fn sent_messages(&self) -> Vec<ProtocolMessage> {
        self.result.as_ref().map(|r| r.messages()).unwrap_or_default()
    }
}

/// Remove one buffered record and send its content as a fresh record.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PopAndSendRecordAction {
    #[serde(flatten)]
    pub base: ActionBase,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index: Option<usize>,
    #[serde(skip)]
    result: Option<LayerStackProcessingResult>,
}

impl PopAndSendRecordAction {
    pub fn new(alias: impl Into<String>) -> Self {
        Self {
            base: ActionBase::new(alias),
            ..Self::default()
        }
    }
}

impl TlsAction for PopAndSendRecordAction {
    buffer_action_common!("PopAndSendRecord", SENDING);

    fn run(&mut self, state: &mut State) -> Result<(), ActionError> {
        let alias = self.base.alias("PopAndSendRecord")?;
        let ctx = state.context_mut(alias)?;
        let record = ctx.tls.pop_buffered_record(self.index)?.detached();
        if record.is_template() {
            return Err(ActionError::MissingUnits {
                action: "PopAndSendRecord",
                what: "record content",
            });
        }
        let result = ctx.send_data(&[LayerConfiguration::send(LayerType::Record, vec![record.into()])])?;
        info!(alias, records = result.records().len(), "sending buffered record");
        self.result = Some(result);
        Ok(())
    }

    fn clear_observed(&mut self) {
        self.result = None;
    }

    fn outcome_as_planned(&self) -> bool {
        self.result
            .as_ref()
            .is_some_and(|r| r.executed_as_planned() && r.records().len() == 1)
    }

    fn sent_records(&self) -> Vec<Record> {
        self.result.as_ref().map(|r| r.records()).unwrap_or_default()
    }
}

/// Remove one buffered message without sending it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PopBufferedMessageAction {
    #[serde(flatten)]
    pub base: ActionBase,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index: Option<usize>,
    #[serde(skip)]
    popped: Option<ProtocolMessage>,
}

impl PopBufferedMessageAction {
    pub fn new(alias: impl Into<String>) -> Self {
        Self {
            base: ActionBase::new(alias),
            ..Self::default()
        }
    }

    pub fn popped(&self) -> Option<&ProtocolMessage> {
        self.popped.as_ref()
    }
}

impl TlsAction for PopBufferedMessageAction {
    buffer_action_common!("PopBufferedMessage", CONNECTION_BOUND);

    fn run(&mut self, state: &mut State) -> Result<(), ActionError> {
        let alias = self.base.alias("PopBufferedMessage")?;
        let ctx = state.context_mut(alias)?;
        self.popped = Some(ctx.tls.pop_buffered_message(self.index)?);
        Ok(())
    }

    fn clear_observed(&mut self) {
        self.popped = None;
    }

    fn outcome_as_planned(&self) -> bool {
        self.popped.is_some()
    }
}

/// Remove one buffered record without sending it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PopBufferedRecordAction {
    #[serde(flatten)]
    pub base: ActionBase,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index: Option<usize>,
    #[serde(skip)]
    popped: Option<Record>,
}

impl PopBufferedRecordAction {
    pub fn new(alias: impl Into<String>) -> Self {
        Self {
            base: ActionBase::new(alias),
            ..Self::default()
        }
    }

    pub fn popped(&self) -> Option<&Record> {
        self.popped.as_ref()
    }
}

impl TlsAction for PopBufferedRecordAction {
    buffer_action_common!("PopBufferedRecord", CONNECTION_BOUND);

    fn run(&mut self, state: &mut State) -> Result<(), ActionError> {
        let alias = self.base.alias("PopBufferedRecord")?;
        let ctx = state.context_mut(alias)?;
        self.popped = Some(ctx.tls.pop_buffered_record(self.index)?);
        Ok(())
    }

    fn clear_observed(&mut self) {
        self.popped = None;
    }

    fn outcome_as_planned(&self) -> bool {
        self.popped.is_some()
    }
}

/// Empty both buffers.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClearBuffersAction {
    #[serde(flatten)]
    pub base: ActionBase,
}

impl ClearBuffersAction {
    pub fn new(alias: impl Into<String>) -> Self {
        Self {
            base: ActionBase::new(alias),
        }
    }
}

impl TlsAction for ClearBuffersAction {
    buffer_action_common!("ClearBuffers", CONNECTION_BOUND);

    fn run(&mut self, state: &mut State) -> Result<(), ActionError> {
        let alias = self.base.alias("ClearBuffers")?;
        state.context_mut(alias)?.tls.clear_buffers();
        Ok(())
    }

    fn clear_observed(&mut self) {}

    fn outcome_as_planned(&self) -> bool {
        true
    }
}

/// Append the buffers of one context to the buffers of another.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CopyBuffersAction {
    #[serde(flatten)]
    pub base: ActionBase,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from_alias: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to_alias: Option<String>,
}

impl CopyBuffersAction {
    pub fn new(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            base: ActionBase::default(),
            from_alias: Some(from.into()),
            to_alias: Some(to.into()),
        }
    }
}

impl TlsAction for CopyBuffersAction {
    buffer_action_common!("CopyBuffers", CONNECTION_BOUND);

    fn alias_slots(&self) -> Vec<Option<&str>> {
        vec![self.from_alias.as_deref(), self.to_alias.as_deref()]
    }

    fn alias_slots_mut(&mut self) -> Vec<&mut Option<String>> {
        vec![&mut self.from_alias, &mut self.to_alias]
    }

    fn run(&mut self, state: &mut State) -> Result<(), ActionError> {
        let from = super::checked_alias(self.from_alias.as_deref(), "CopyBuffers")?;
        let to = super::checked_alias(self.to_alias.as_deref(), "CopyBuffers")?;
        let (src, dst) = state.context_pair_mut(from, to)?;
        dst.tls.message_buffer.extend(src.tls.message_buffer.iter().cloned());
        dst.tls.record_buffer.extend(src.tls.record_buffer.iter().cloned());
        debug!(from, to, messages = dst.tls.message_buffer.len(), "buffers copied");
        Ok(())
    }

    fn clear_observed(&mut self) {}

    fn outcome_as_planned(&self) -> bool {
        true
    }
}

/// Run the context adjustment of every buffered message as if it had just
/// been received. The buffer is left as it is.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ApplyBufferedMessagesAction {
    #[serde(flatten)]
    pub base: ActionBase,
    #[serde(skip)]
    applied: usize,
}

impl ApplyBufferedMessagesAction {
    pub fn new(alias: impl Into<String>) -> Self {
        Self {
            base: ActionBase::new(alias),
            applied: 0,
        }
    }
}

impl TlsAction for ApplyBufferedMessagesAction {
    buffer_action_common!("ApplyBufferedMessages", CONNECTION_BOUND);

    fn run(&mut self, state: &mut State) -> Result<(), ActionError> {
        let alias = self.base.alias("ApplyBufferedMessages")?;
        let ctx = state.context_mut(alias)?;
        let messages: Vec<ProtocolMessage> = ctx.tls.message_buffer.iter().cloned().collect();
        for message in &messages {
            adjust_context(&mut ctx.tls, message, MessageDirection::Received);
        }
        self.applied = messages.len();
        Ok(())
    }

    fn clear_observed(&mut self) {
        self.applied = 0;
    }

    fn outcome_as_planned(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::testing::peers;
    use crate::action::{ReceiveAction, SendAction};
    use crate::config::LayerStackType;
    use crate::handshake::HandshakeType;
    use crate::message::hello::ServerHello;
    use crate::record::ContentType;
    use crate::{CipherSuite, ProtocolVersion};

    fn hs(t: HandshakeType) -> ProtocolMessage {
        ProtocolMessage::handshake(t, vec![])
    }

    fn fill(state: &mut State, alias: &str, messages: Vec<ProtocolMessage>) {
        let ctx = state.context_mut(alias).unwrap();
        ctx.tls.message_buffer.extend(messages);
        ctx.tls
            .record_buffer
            .push_back(Record::explicit(ContentType::Alert, vec![1, 0]));
    }

    #[test]
    fn test_clear_buffers_empties_both() {
        let mut p = peers(LayerStackType::Tls);
        fill(&mut p.state, "client", vec![hs(HandshakeType::Finished)]);
        ClearBuffersAction::new("client").execute(&mut p.state).unwrap();
        let ctx = p.state.context("client").unwrap();
        assert!(ctx.tls.message_buffer.is_empty());
        assert!(ctx.tls.record_buffer.is_empty());
    }

    #[test]
    fn test_pop_and_send_shrinks_buffer_by_one() {
        let mut p = peers(LayerStackType::Tls);
        fill(
            &mut p.state,
            "client",
            vec![hs(HandshakeType::Certificate), hs(HandshakeType::Finished)],
        );
        let mut action = PopAndSendAction::new("client").at(1);
        action.execute(&mut p.state).unwrap();
        assert!(action.executed_as_planned());
        assert_eq!(p.state.context("client").unwrap().tls.message_buffer.len(), 1);
        assert_eq!(p.client.pending_outbound().unwrap(), 1);

        let mut receive = ReceiveAction::new("server", vec![hs(HandshakeType::Finished)]);
        receive.execute(&mut p.state).unwrap();
        assert!(receive.executed_as_planned());
    }

    #[test]
    fn test_pop_errors_are_execution_errors() {
        let mut p = peers(LayerStackType::Tls);
        let mut empty = PopAndSendAction::new("client");
        assert!(matches!(empty.execute(&mut p.state), Err(ActionError::EmptyBuffer)));
        assert!(empty.is_executed());

        fill(&mut p.state, "client", vec![hs(HandshakeType::Finished)]);
        let mut out_of_range = PopBufferedMessageAction {
            index: Some(3),
            ..PopBufferedMessageAction::new("client")
        };
        assert!(matches!(
            out_of_range.execute(&mut p.state),
            Err(ActionError::IndexOutOfRange { index: 3, len: 1 })
        ));
        assert_eq!(p.client.pending_outbound().unwrap(), 0);
    }

    #[test]
    fn test_pop_buffered_units() {
        let mut p = peers(LayerStackType::Tls);
        fill(&mut p.state, "client", vec![hs(HandshakeType::Finished)]);
        let mut pop = PopBufferedMessageAction::new("client");
        pop.execute(&mut p.state).unwrap();
        assert_eq!(pop.popped().and_then(|m| m.handshake_type()), Some(HandshakeType::Finished));

        let mut pop = PopBufferedRecordAction::new("client");
        pop.execute(&mut p.state).unwrap();
        assert_eq!(pop.popped().and_then(|r| r.content_type), Some(ContentType::Alert));
        assert!(p.state.context("client").unwrap().tls.record_buffer.is_empty());
    }

    #[test]
    fn test_pop_and_send_record() {
        let mut p = peers(LayerStackType::Tls);
        fill(&mut p.state, "client", vec![]);
        let mut action = PopAndSendRecordAction::new("client");
        action.execute(&mut p.state).unwrap();
        assert!(action.executed_as_planned());
        assert_eq!(action.sent_records()[0].fragment, Some(vec![1, 0]));
    }

    #[test]
    fn test_buffered_receive_then_send() {
        let mut p = peers(LayerStackType::Tls);
        SendAction::new("server", vec![hs(HandshakeType::ServerHelloDone)])
            .execute(&mut p.state)
            .unwrap();
        let mut receive = BufferedGenericReceiveAction::new("client");
        receive.execute(&mut p.state).unwrap();
        let ctx = p.state.context("client").unwrap();
        assert_eq!(ctx.tls.message_buffer.len(), 1);
        assert_eq!(ctx.tls.record_buffer.len(), 1);

        let mut send = BufferedSendAction::new("client");
        send.execute(&mut p.state).unwrap();
        assert!(send.executed_as_planned());
        assert!(p.state.context("client").unwrap().tls.message_buffer.is_empty());

        let mut again = BufferedSendAction::new("client");
        assert!(matches!(again.execute(&mut p.state), Err(ActionError::EmptyBuffer)));
    }

    #[test]
    fn test_copy_buffers_between_contexts() {
        let mut p = peers(LayerStackType::Tls);
        fill(&mut p.state, "client", vec![hs(HandshakeType::Finished)]);
        let mut copy = CopyBuffersAction::new("client", "server");
        copy.execute(&mut p.state).unwrap();
        let server = p.state.context("server").unwrap();
        assert_eq!(server.tls.message_buffer.len(), 1);
        assert_eq!(server.tls.record_buffer.len(), 1);
        assert_eq!(p.state.context("client").unwrap().tls.message_buffer.len(), 1);

        let mut missing = CopyBuffersAction {
            to_alias: None,
            ..CopyBuffersAction::new("client", "server")
        };
        assert!(missing.assert_aliases_set_properly().is_err());
        assert!(missing.execute(&mut p.state).is_err());
    }

    #[test]
    fn test_apply_buffered_messages_adjusts_context() {
        let mut p = peers(LayerStackType::Tls);
        let sh = ServerHello::new(ProtocolVersion::TLS12, [4; 32], CipherSuite::TLS_RSA_WITH_AES_256_GCM_SHA384);
        fill(&mut p.state, "client", vec![sh.to_message()]);
        ApplyBufferedMessagesAction::new("client")
            .execute(&mut p.state)
            .unwrap();
        let ctx = p.state.context("client").unwrap();
        assert_eq!(
            ctx.tls.selected_cipher_suite,
            Some(CipherSuite::TLS_RSA_WITH_AES_256_GCM_SHA384)
        );
        assert_eq!(ctx.tls.message_buffer.len(), 1);
    }
}
