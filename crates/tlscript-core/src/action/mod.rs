//! Scripted actions.
//!
//! Every action kind is a variant of the closed [`Action`] enum and
//! implements [`TlsAction`]. An action carries configuration fields, which
//! persist, and observed fields, which are skipped by serialization and
//! cleared by [`TlsAction::reset`].
//!
//! Executing an action moves it to *executed*, which is terminal until reset.
//! Whether it ran *as planned* is a separate predicate: a receive that got the
//! wrong messages is executed but not as planned.

pub mod buffer;
pub mod cipher;
pub mod compare;
pub mod context;
pub mod control;
pub mod forward;
pub mod layer;
pub mod receive;
pub mod send;

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use tlscript_types::{ActionError, ConfigurationError, ErrorClass};
use tracing::warn;

use crate::handshake::fragment::DtlsFragment;
use crate::layer::{DataUnit, LayerConfiguration, LayerDirective, LayerType, MatchOptions};
use crate::message::ProtocolMessage;
use crate::quic::frame::QuicFrame;
use crate::quic::packet::QuicPacket;
use crate::record::Record;
use crate::workflow::State;

pub use buffer::{
    ApplyBufferedMessagesAction, BufferedGenericReceiveAction, BufferedSendAction,
    ClearBuffersAction, CopyBuffersAction, PopAndSendAction, PopAndSendRecordAction,
    PopBufferedMessageAction, PopBufferedRecordAction,
};
pub use cipher::{
    ActivateDecryptionAction, ActivateEncryptionAction, ChangeCipherSuiteAction,
    ChangeReadEpochAction, ChangeReadSequenceNumberAction, ChangeWriteEpochAction,
    ChangeWriteSequenceNumberAction, DeactivateDecryptionAction, DeactivateEncryptionAction,
    ResetRecordCipherListsAction,
};
pub use compare::{ComparisonStrategy, MatchOutcome};
pub use context::{
    ChangeClientRandomAction, ChangeCompressionAction, ChangeConnectionIdAction,
    ChangeContextValueAction, ChangeMasterSecretAction, ChangePreMasterSecretAction,
    ChangeProtocolVersionAction, ChangeServerRandomAction, CopyContextFieldAction,
};
pub use control::{RenegotiationAction, ResetConnectionAction, WaitAction};
pub use forward::{ForwardDataAction, ForwardMessagesAction, ForwardRecordsAction};
pub use layer::{InsertLayerAction, RemoveLayerAction, ToggleLayerAction};
pub use receive::{GenericReceiveAction, MultiReceiveAction, ReceiveAction, ReceiveTillAction};
pub use send::{ResendLastFlightAction, SendAction};

/// Per-action behavior switches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActionOption {
    /// A transport failure marks the action not as planned instead of
    /// aborting the trace.
    MayFail,
    /// Received units beyond the expected ones do not spoil the match.
    CheckOnlyExpected,
    /// Unexpected warning alerts are skipped while matching.
    IgnoreUnexpectedWarnings,
}

/// What an action can do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capability {
    /// Operates on the connections it names by alias.
    ConnectionBound,
    /// Touches no connection.
    Contextless,
    Sending,
    Receiving,
}

/// State shared by every action: its alias, its options and its status.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionBase {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_alias: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub options: BTreeSet<ActionOption>,
    #[serde(skip)]
    executed: bool,
    /// A transport failure was absorbed.
    #[serde(skip)]
    failed: bool,
}

impl ActionBase {
    pub fn new(alias: impl Into<String>) -> Self {
        Self {
            connection_alias: Some(alias.into()),
            ..Self::default()
        }
    }

    pub fn with_option(mut self, option: ActionOption) -> Self {
        self.options.insert(option);
        self
    }

    pub fn has_option(&self, option: ActionOption) -> bool {
        self.options.contains(&option)
    }

    pub fn is_executed(&self) -> bool {
        self.executed
    }

    pub fn is_failed(&self) -> bool {
        self.failed
    }

    pub fn match_options(&self) -> MatchOptions {
        MatchOptions {
            check_only_expected: self.has_option(ActionOption::CheckOnlyExpected),
            ignore_unexpected_warnings: self.has_option(ActionOption::IgnoreUnexpectedWarnings),
        }
    }

    /// The alias the action runs on.
    pub fn alias(&self, action: &'static str) -> Result<&str, ConfigurationError> {
        checked_alias(self.connection_alias.as_deref(), action)
    }
}

fn checked_alias<'a>(alias: Option<&'a str>, action: &'static str) -> Result<&'a str, ConfigurationError> {
    match alias {
        None => Err(ConfigurationError::MissingAlias(action.to_string())),
        Some("") => Err(ConfigurationError::EmptyAlias(action.to_string())),
        Some(alias) => Ok(alias),
    }
}

/// Lifecycle and introspection contract of an action.
///
/// Implementors provide [`run`](Self::run) and the observed-state hooks;
/// [`execute`](Self::execute) wraps `run` with the status bookkeeping and the
/// failure policy shared by every action.
pub trait TlsAction {
    fn name(&self) -> &'static str;

    fn base(&self) -> &ActionBase;

    fn base_mut(&mut self) -> &mut ActionBase;

    fn capabilities(&self) -> &'static [Capability];

    /// Perform the action once.
    fn run(&mut self, state: &mut State) -> Result<(), ActionError>;

    /// Forget observed values.
    fn clear_observed(&mut self);

    /// Action-specific part of the as-planned predicate.
    fn outcome_as_planned(&self) -> bool;

    /// Alias fields of the action, in declaration order.
    fn alias_slots(&self) -> Vec<Option<&str>> {
        vec![self.base().connection_alias.as_deref()]
    }

    fn alias_slots_mut(&mut self) -> Vec<&mut Option<String>> {
        vec![&mut self.base_mut().connection_alias]
    }

    fn sent_messages(&self) -> Vec<ProtocolMessage> {
        Vec::new()
    }

    fn received_messages(&self) -> Vec<ProtocolMessage> {
        Vec::new()
    }

    fn sent_records(&self) -> Vec<Record> {
        Vec::new()
    }

    fn received_records(&self) -> Vec<Record> {
        Vec::new()
    }

    fn has_capability(&self, capability: Capability) -> bool {
        self.capabilities().contains(&capability)
    }

    fn is_executed(&self) -> bool {
        self.base().is_executed()
    }

    fn executed_as_planned(&self) -> bool {
        let base = self.base();
        base.is_executed() && !base.is_failed() && self.outcome_as_planned()
    }

    /// Every alias the action needs is set and non-empty.
    fn assert_aliases_set_properly(&self) -> Result<(), ConfigurationError> {
        let name = self.name();
        self.alias_slots()
            .into_iter()
            .try_for_each(|slot| checked_alias(slot, name).map(|_| ()))
    }

    /// Run the action.
    ///
    /// Configuration errors leave the action unexecuted. Any other outcome
    /// marks it executed. Transport errors mark it failed and are absorbed
    /// under [`ActionOption::MayFail`].
    fn execute(&mut self, state: &mut State) -> Result<(), ActionError> {
        if self.is_executed() {
            return Err(ActionError::AlreadyExecuted(self.name()));
        }
        self.assert_aliases_set_properly()?;
        let err = match self.run(state) {
            Ok(()) => {
                self.base_mut().executed = true;
                return Ok(());
            }
            Err(err) => err,
        };
        match err.class() {
            ErrorClass::Configuration => Err(err),
            ErrorClass::ActionExecution => {
                self.base_mut().executed = true;
                Err(err)
            }
            ErrorClass::Transport => {
                let aliases: Vec<String> = self
                    .alias_slots()
                    .into_iter()
                    .flatten()
                    .map(str::to_string)
                    .collect();
                for alias in &aliases {
                    if let Ok(ctx) = state.context_mut(alias) {
                        ctx.tls.transport_failed = true;
                    }
                }
                let name = self.name();
                let base = self.base_mut();
                base.executed = true;
                base.failed = true;
                if base.has_option(ActionOption::MayFail) {
                    warn!(action = name, "transport failure absorbed: {err}");
                    Ok(())
                } else {
                    Err(err)
                }
            }
        }
    }

    /// Back to not executed, with observed values cleared.
    fn reset(&mut self) {
        let base = self.base_mut();
        base.executed = false;
        base.failed = false;
        self.clear_observed();
    }
}

const SEND_RECEIVE: &[Capability] = &[Capability::ConnectionBound, Capability::Sending, Capability::Receiving];
const SENDING: &[Capability] = &[Capability::ConnectionBound, Capability::Sending];
const RECEIVING: &[Capability] = &[Capability::ConnectionBound, Capability::Receiving];
const CONNECTION_BOUND: &[Capability] = &[Capability::ConnectionBound];
const CONTEXTLESS: &[Capability] = &[Capability::Contextless];

/// Units an action sends or expects, per layer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayerUnits {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub messages: Vec<ProtocolMessage>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub fragments: Vec<DtlsFragment>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub records: Vec<Record>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub quic_frames: Vec<QuicFrame>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub quic_packets: Vec<QuicPacket>,
}

impl LayerUnits {
    pub fn messages(messages: Vec<ProtocolMessage>) -> Self {
        Self {
            messages,
            ..Self::default()
        }
    }

    pub fn records(records: Vec<Record>) -> Self {
        Self {
            records,
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.per_layer().is_empty()
    }

    fn per_layer(&self) -> Vec<(LayerType, Vec<DataUnit>)> {
        fn units<T: Clone + Into<DataUnit>>(items: &[T]) -> Vec<DataUnit> {
            items.iter().cloned().map(Into::into).collect()
        }
        [
            (LayerType::Message, units(&self.messages)),
            (LayerType::DtlsFragment, units(&self.fragments)),
            (LayerType::Record, units(&self.records)),
            (LayerType::QuicFrame, units(&self.quic_frames)),
            (LayerType::QuicPacket, units(&self.quic_packets)),
        ]
        .into_iter()
        .filter(|(_, units)| !units.is_empty())
        .collect()
    }

    pub fn send_configurations(&self) -> Vec<LayerConfiguration> {
        self.per_layer()
            .into_iter()
            .map(|(layer, units)| LayerConfiguration::send(layer, units))
            .collect()
    }

    /// Receive directives for every layer with expected units; a generic
    /// receive on the message layer when nothing is expected.
    pub fn receive_configurations(
        &self,
        strategy: ComparisonStrategy,
        options: MatchOptions,
    ) -> Vec<LayerConfiguration> {
        let configs: Vec<_> = self
            .per_layer()
            .into_iter()
            .map(|(layer, expected)| {
                LayerConfiguration::new(
                    layer,
                    LayerDirective::Receive {
                        expected,
                        strategy,
                        options,
                    },
                )
            })
            .collect();
        if configs.is_empty() {
            vec![LayerConfiguration::generic(LayerType::Message)]
        } else {
            configs
        }
    }
}

/// Comma-separated kinds, for log lines.
pub(crate) fn summarize(messages: &[ProtocolMessage]) -> String {
    if messages.is_empty() {
        return "nothing".into();
    }
    messages
        .iter()
        .map(|m| m.kind.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

macro_rules! actions {
    ($($variant:ident($ty:ty)),+ $(,)?) => {
        /// Every action kind. Persisted with an `action` tag per kind.
        #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
        #[serde(tag = "action")]
        pub enum Action {
            $($variant($ty),)+
        }

        impl TlsAction for Action {
            fn name(&self) -> &'static str {
                match self { $(Action::$variant(a) => a.name(),)+ }
            }

            fn base(&self) -> &ActionBase {
                match self { $(Action::$variant(a) => a.base(),)+ }
            }

            fn base_mut(&mut self) -> &mut ActionBase {
                match self { $(Action::$variant(a) => a.base_mut(),)+ }
            }

            fn capabilities(&self) -> &'static [Capability] {
                match self { $(Action::$variant(a) => a.capabilities(),)+ }
            }

            fn run(&mut self, state: &mut State) -> Result<(), ActionError> {
                match self { $(Action::$variant(a) => a.run(state),)+ }
            }

            fn clear_observed(&mut self) {
                match self { $(Action::$variant(a) => a.clear_observed(),)+ }
            }

            fn outcome_as_planned(&self) -> bool {
                match self { $(Action::$variant(a) => a.outcome_as_planned(),)+ }
            }

            fn alias_slots(&self) -> Vec<Option<&str>> {
                match self { $(Action::$variant(a) => a.alias_slots(),)+ }
            }

            fn alias_slots_mut(&mut self) -> Vec<&mut Option<String>> {
                match self { $(Action::$variant(a) => a.alias_slots_mut(),)+ }
            }

            fn sent_messages(&self) -> Vec<ProtocolMessage> {
                match self { $(Action::$variant(a) => a.sent_messages(),)+ }
            }

            fn received_messages(&self) -> Vec<ProtocolMessage> {
                match self { $(Action::$variant(a) => a.received_messages(),)+ }
            }

            fn sent_records(&self) -> Vec<Record> {
                match self { $(Action::$variant(a) => a.sent_records(),)+ }
            }

            fn received_records(&self) -> Vec<Record> {
                match self { $(Action::$variant(a) => a.received_records(),)+ }
            }
        }

        $(
            impl From<$ty> for Action {
                fn from(action: $ty) -> Self {
                    Action::$variant(action)
                }
            }
        )+
    };
}

actions! {
    Send(SendAction),
    ResendLastFlight(ResendLastFlightAction),
    Receive(ReceiveAction),
    GenericReceive(GenericReceiveAction),
    ReceiveTill(ReceiveTillAction),
    MultiReceive(MultiReceiveAction),
    BufferedSend(BufferedSendAction),
    BufferedGenericReceive(BufferedGenericReceiveAction),
    PopAndSend(PopAndSendAction),
    PopAndSendRecord(PopAndSendRecordAction),
    PopBufferedMessage(PopBufferedMessageAction),
    PopBufferedRecord(PopBufferedRecordAction),
    ClearBuffers(ClearBuffersAction),
    CopyBuffers(CopyBuffersAction),
    ApplyBufferedMessages(ApplyBufferedMessagesAction),
    ForwardMessages(ForwardMessagesAction),
    ForwardRecords(ForwardRecordsAction),
    ForwardData(ForwardDataAction),
    ActivateEncryption(ActivateEncryptionAction),
    ActivateDecryption(ActivateDecryptionAction),
    DeactivateEncryption(DeactivateEncryptionAction),
    DeactivateDecryption(DeactivateDecryptionAction),
    ChangeCipherSuite(ChangeCipherSuiteAction),
    ResetRecordCipherLists(ResetRecordCipherListsAction),
    ChangeReadEpoch(ChangeReadEpochAction),
    ChangeWriteEpoch(ChangeWriteEpochAction),
    ChangeReadSequenceNumber(ChangeReadSequenceNumberAction),
    ChangeWriteSequenceNumber(ChangeWriteSequenceNumberAction),
    ChangeContextValue(ChangeContextValueAction),
    ChangeProtocolVersion(ChangeProtocolVersionAction),
    ChangeCompression(ChangeCompressionAction),
    ChangeMasterSecret(ChangeMasterSecretAction),
    ChangePreMasterSecret(ChangePreMasterSecretAction),
    ChangeClientRandom(ChangeClientRandomAction),
    ChangeServerRandom(ChangeServerRandomAction),
    ChangeConnectionId(ChangeConnectionIdAction),
    CopyContextField(CopyContextFieldAction),
    ToggleLayer(ToggleLayerAction),
    InsertLayer(InsertLayerAction),
    RemoveLayer(RemoveLayerAction),
    Wait(WaitAction),
    Renegotiation(RenegotiationAction),
    ResetConnection(ResetConnectionAction),
}

#[cfg(test)]
pub(crate) mod testing {
    //! Two connected contexts in one state.

    use crate::config::{AliasedConnection, Config, LayerStackType};
    use crate::context::ConnectionContext;
    use crate::transport::{MemoryControl, MemoryTransport};
    use crate::workflow::State;
    use crate::ConnectionEnd;

    pub(crate) struct Peers {
        pub state: State,
        pub client: MemoryControl,
        pub server: MemoryControl,
    }

    pub(crate) fn peers(stack: LayerStackType) -> Peers {
        let config = Config::default();
        let (a, b) = MemoryTransport::pair();
        let client = a.control();
        let server = b.control();
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
        let state = State::with_contexts(config, contexts).unwrap();
        Peers {
            state,
            client,
            server,
        }
    }

    /// Give both ends the same secrets so their ciphers interoperate.
    pub(crate) fn share_secrets(state: &mut State) {
        for ctx in state.contexts_mut() {
            ctx.tls.client_random = vec![1; 32];
            ctx.tls.server_random = vec![2; 32];
            ctx.tls.master_secret = vec![3; 48];
        }
    }
}
