//! Forwarding between two connections, as a man in the middle does.
//!
//! Every forward receives on `receive_from_alias` and sends what arrived on
//! `forward_to_alias`. A transport failure on either leg is not retried: the
//! action ends executed and not as planned, and the trace goes on.

use serde::{Deserialize, Serialize};
use tlscript_types::ActionError;
use tracing::{info, warn};

use super::compare::{same_kinds, ComparisonStrategy};
use super::{checked_alias, summarize, ActionBase, Capability, LayerUnits, TlsAction, SEND_RECEIVE};
use crate::context::TlsContext;
use crate::layer::{DataUnit, LayerConfiguration, LayerType};
use crate::message::ProtocolMessage;
use crate::record::Record;
use crate::workflow::State;

/// Turn a transport failure of one leg into `None`.
fn leg<T>(
    result: Result<T, ActionError>,
    ctx: &mut TlsContext,
    failed: &mut bool,
) -> Result<Option<T>, ActionError> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(err) if err.is_transport() => {
            warn!(alias = ctx.alias(), "forwarding leg failed: {err}");
            ctx.transport_failed = true;
            *failed = true;
            Ok(None)
        }
        Err(err) => Err(err),
    }
}

fn units<T: Clone + Into<DataUnit>>(items: &[T]) -> Vec<DataUnit> {
    items.iter().cloned().map(Into::into).collect()
}

macro_rules! forward_common {
    ($name:literal) => {
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
            SEND_RECEIVE
        }

        fn alias_slots(&self) -> Vec<Option<&str>> {
            vec![self.receive_from_alias.as_deref(), self.forward_to_alias.as_deref()]
        }

        fn alias_slots_mut(&mut self) -> Vec<&mut Option<String>> {
            vec![&mut self.receive_from_alias, &mut self.forward_to_alias]
        }
    };
}

/// Receive messages on one connection and send them on the other.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ForwardMessagesAction {
    #[serde(flatten)]
    pub base: ActionBase,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub receive_from_alias: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub forward_to_alias: Option<String>,
    /// Messages the receiving leg waits for; a generic receive when empty.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub expected_messages: Vec<ProtocolMessage>,
    #[serde(skip)]
    received: Option<Vec<ProtocolMessage>>,
    #[serde(skip)]
    sent: Option<Vec<ProtocolMessage>>,
    #[serde(skip)]
    receive_as_planned: bool,
}

impl ForwardMessagesAction {
    pub fn new(from: impl Into<String>, to: impl Into<String>, expected: Vec<ProtocolMessage>) -> Self {
        Self {
            receive_from_alias: Some(from.into()),
            forward_to_alias: Some(to.into()),
            expected_messages: expected,
            ..Self::default()
        }
    }
}

impl TlsAction for ForwardMessagesAction {
    forward_common!("ForwardMessages");

    fn run(&mut self, state: &mut State) -> Result<(), ActionError> {
        let from = checked_alias(self.receive_from_alias.as_deref(), "ForwardMessages")?;
        let to = checked_alias(self.forward_to_alias.as_deref(), "ForwardMessages")?;
        let (src, dst) = state.context_pair_mut(from, to)?;

        let configs = LayerUnits::messages(self.expected_messages.clone())
            .receive_configurations(ComparisonStrategy::Kind, self.base.match_options());
        let received = src.receive_data(&configs);
        let Some(received) = leg(received, &mut src.tls, &mut self.base.failed)? else {
            return Ok(());
        };
        let messages = received.messages();
        self.receive_as_planned = received.executed_as_planned();
        info!(from, to, "forwarding {}", summarize(&messages));
        self.received = Some(messages.clone());

        if messages.is_empty() {
            self.sent = Some(Vec::new());
            return Ok(());
        }
        let sent = dst.send_data(&[LayerConfiguration::send(LayerType::Message, units(&messages))]);
        if let Some(sent) = leg(sent, &mut dst.tls, &mut self.base.failed)? {
            self.sent = Some(sent.messages());
        }
        Ok(())
    }

    fn clear_observed(&mut self) {
        self.received = None;
        self.sent = None;
        self.receive_as_planned = false;
    }

    fn outcome_as_planned(&self) -> bool {
        let received = self.received.as_ref().map(|m| units(m));
        let sent = self.sent.as_ref().map(|m| units(m));
        self.receive_as_planned && same_kinds(received.as_deref(), sent.as_deref())
    }

    fn sent_messages(&self) -> Vec<ProtocolMessage> {
        self.sent.clone().unwrap_or_default()
    }

    fn received_messages(&self) -> Vec<ProtocolMessage> {
        self.received.clone().unwrap_or_default()
    }
}

/// Receive records on one connection and send their content as records on
/// the other, one record out per record in. Messages are not parsed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ForwardRecordsAction {
    #[serde(flatten)]
    pub base: ActionBase,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub receive_from_alias: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub forward_to_alias: Option<String>,
    #[serde(skip)]
    received: Option<Vec<Record>>,
    #[serde(skip)]
    sent: Option<Vec<Record>>,
}

impl ForwardRecordsAction {
    pub fn new(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            receive_from_alias: Some(from.into()),
            forward_to_alias: Some(to.into()),
            ..Self::default()
        }
    }
}

impl TlsAction for ForwardRecordsAction {
    forward_common!("ForwardRecords");

    fn run(&mut self, state: &mut State) -> Result<(), ActionError> {
        let from = checked_alias(self.receive_from_alias.as_deref(), "ForwardRecords")?;
        let to = checked_alias(self.forward_to_alias.as_deref(), "ForwardRecords")?;
        let (src, dst) = state.context_pair_mut(from, to)?;

        let configs = [
            LayerConfiguration::ignore(LayerType::Message),
            LayerConfiguration::ignore(LayerType::DtlsFragment),
            LayerConfiguration::generic(LayerType::Record),
        ];
        let received = src.receive_data(&configs);
        let Some(received) = leg(received, &mut src.tls, &mut self.base.failed)? else {
            return Ok(());
        };
        let records = received.records();
        info!(from, to, records = records.len(), "forwarding records");
        let outgoing: Vec<DataUnit> = records
            .iter()
            .map(|r| {
                DataUnit::Record(Record {
                    fragment: r.fragment.clone().or_else(|| r.protected_fragment.clone()),
                    ..r.detached()
                })
            })
            .collect();
        self.received = Some(records);

        if outgoing.is_empty() {
            self.sent = Some(Vec::new());
            return Ok(());
        }
        let sent = dst.send_data(&[LayerConfiguration::send(LayerType::Record, outgoing)]);
        if let Some(sent) = leg(sent, &mut dst.tls, &mut self.base.failed)? {
            self.sent = Some(sent.records());
        }
        Ok(())
    }

    fn clear_observed(&mut self) {
        self.received = None;
        self.sent = None;
    }

    fn outcome_as_planned(&self) -> bool {
        let received = self.received.as_ref().map(|r| units(r));
        let sent = self.sent.as_ref().map(|r| units(r));
        same_kinds(received.as_deref(), sent.as_deref())
    }

    fn sent_records(&self) -> Vec<Record> {
        self.sent.clone().unwrap_or_default()
    }

    fn received_records(&self) -> Vec<Record> {
        self.received.clone().unwrap_or_default()
    }
}

/// Copy one chunk of raw transport data from one connection to the other,
/// bypassing both layer stacks.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ForwardDataAction {
    #[serde(flatten)]
    pub base: ActionBase,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub receive_from_alias: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub forward_to_alias: Option<String>,
    #[serde(skip)]
    forwarded: Option<Vec<u8>>,
}

impl ForwardDataAction {
    pub fn new(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            receive_from_alias: Some(from.into()),
            forward_to_alias: Some(to.into()),
            ..Self::default()
        }
    }

    pub fn forwarded(&self) -> Option<&[u8]> {
        self.forwarded.as_deref()
    }
}

impl TlsAction for ForwardDataAction {
    forward_common!("ForwardData");

    fn run(&mut self, state: &mut State) -> Result<(), ActionError> {
        let from = checked_alias(self.receive_from_alias.as_deref(), "ForwardData")?;
        let to = checked_alias(self.forward_to_alias.as_deref(), "ForwardData")?;
        let (src, dst) = state.context_pair_mut(from, to)?;

        let fetched = src.transport.fetch_data().map_err(ActionError::from);
        let Some(data) = leg(fetched, &mut src.tls, &mut self.base.failed)? else {
            return Ok(());
        };
        if data.is_empty() {
            warn!(from, "nothing to forward");
            return Ok(());
        }
        let sent = dst.transport.send_data(&data).map_err(ActionError::from);
        if leg(sent, &mut dst.tls, &mut self.base.failed)?.is_some() {
            info!(from, to, len = data.len(), "forwarded raw data");
            self.forwarded = Some(data);
        }
        Ok(())
    }

    fn clear_observed(&mut self) {
        self.forwarded = None;
    }

    fn outcome_as_planned(&self) -> bool {
        self.forwarded.as_ref().is_some_and(|d| !d.is_empty())
    }
}
