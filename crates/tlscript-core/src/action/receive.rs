//! Receiving actions.

use serde::{Deserialize, Serialize};
use tlscript_types::ActionError;
use tracing::{debug, info};

use super::compare::{evaluate_receive, ComparisonStrategy, MatchOutcome};
use super::{summarize, ActionBase, Capability, LayerUnits, TlsAction, RECEIVING};
use crate::layer::{DataUnit, LayerConfiguration, LayerStackProcessingResult, LayerType, UnitKind};
use crate::message::ProtocolMessage;
use crate::record::Record;
use crate::workflow::State;

fn is_default_strategy(strategy: &ComparisonStrategy) -> bool {
    *strategy == ComparisonStrategy::default()
}

/// Receive until the expected units arrived, the match failed, or no more
/// data came.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReceiveAction {
    #[serde(flatten)]
    pub base: ActionBase,
    #[serde(flatten)]
    pub expected: LayerUnits,
    #[serde(default, skip_serializing_if = "is_default_strategy")]
    pub strategy: ComparisonStrategy,
    #[serde(skip)]
    result: Option<LayerStackProcessingResult>,
}

impl ReceiveAction {
    pub fn new(alias: impl Into<String>, expected: Vec<ProtocolMessage>) -> Self {
        Self::with_units(alias, LayerUnits::messages(expected))
    }

    pub fn with_units(alias: impl Into<String>, expected: LayerUnits) -> Self {
        Self {
            base: ActionBase::new(alias),
            expected,
            ..Self::default()
        }
    }

    pub fn with_strategy(mut self, strategy: ComparisonStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn result(&self) -> Option<&LayerStackProcessingResult> {
        self.result.as_ref()
    }
}

impl TlsAction for ReceiveAction {
    fn name(&self) -> &'static str {
        "Receive"
    }

    fn base(&self) -> &ActionBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut ActionBase {
        &mut self.base
    }

    fn capabilities(&self) -> &'static [Capability] {
        RECEIVING
    }

    fn run(&mut self, state: &mut State) -> Result<(), ActionError> {
        let alias = self.base.alias("Receive")?;
        let configs = self
            .expected
            .receive_configurations(self.strategy, self.base.match_options());
        let ctx = state.context_mut(alias)?;
        let result = ctx.receive_data(&configs)?;
        info!(
            alias,
            expected = %summarize(&self.expected.messages),
            "received {}",
            summarize(&result.messages())
        );
        self.result = Some(result);
        Ok(())
    }

    fn clear_observed(&mut self) {
        self.result = None;
    }

    fn outcome_as_planned(&self) -> bool {
        self.result.as_ref().is_some_and(|r| r.executed_as_planned())
    }

    fn received_messages(&self) -> Vec<ProtocolMessage> {
        self.result.as_ref().map(|r| r.messages()).unwrap_or_default()
    }

    fn received_records(&self) -> Vec<Record> {
        self.result.as_ref().map(|r| r.records()).unwrap_or_default()
    }
}

/// Receive whatever arrives until the transport runs dry.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GenericReceiveAction {
    #[serde(flatten)]
    pub base: ActionBase,
    #[serde(skip)]
    result: Option<LayerStackProcessingResult>,
}

impl GenericReceiveAction {
    pub fn new(alias: impl Into<String>) -> Self {
        Self {
            base: ActionBase::new(alias),
            result: None,
        }
    }
}

impl TlsAction for GenericReceiveAction {
    fn name(&self) -> &'static str {
        "GenericReceive"
    }

    fn base(&self) -> &ActionBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut ActionBase {
        &mut self.base
    }

    fn capabilities(&self) -> &'static [Capability] {
        RECEIVING
    }

    fn run(&mut self, state: &mut State) -> Result<(), ActionError> {
        let alias = self.base.alias("GenericReceive")?;
        let ctx = state.context_mut(alias)?;
        let result = ctx.receive_data(&[LayerConfiguration::generic(LayerType::Message)])?;
        info!(alias, "received {}", summarize(&result.messages()));
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

/// Receive until a unit of one kind appears or the unit cap is reached.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReceiveTillAction {
    #[serde(flatten)]
    pub base: ActionBase,
    pub wait_till: UnitKind,
    /// Stop after this many units of the target layer even without a match.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_units: Option<usize>,
    #[serde(skip)]
    result: Option<LayerStackProcessingResult>,
}

impl ReceiveTillAction {
    pub fn new(alias: impl Into<String>, wait_till: UnitKind) -> Self {
        Self {
            base: ActionBase::new(alias),
            wait_till,
            max_units: None,
            result: None,
        }
    }

    pub fn with_max_units(mut self, max: usize) -> Self {
        self.max_units = Some(max);
        self
    }
}

impl TlsAction for ReceiveTillAction {
    fn name(&self) -> &'static str {
        "ReceiveTill"
    }

    fn base(&self) -> &ActionBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut ActionBase {
        &mut self.base
    }

    fn capabilities(&self) -> &'static [Capability] {
        RECEIVING
    }

    fn run(&mut self, state: &mut State) -> Result<(), ActionError> {
        let alias = self.base.alias("ReceiveTill")?;
        let ctx = state.context_mut(alias)?;
        let config = LayerConfiguration::receive_till(self.wait_till, self.max_units);
        let result = ctx.receive_data(&[config])?;
        info!(alias, till = ?self.wait_till, "received {}", summarize(&result.messages()));
        self.result = Some(result);
        Ok(())
    }

    fn clear_observed(&mut self) {
        self.result = None;
    }

    fn outcome_as_planned(&self) -> bool {
        self.result.as_ref().is_some_and(|r| {
            r.units(self.wait_till.layer_type())
                .iter()
                .any(|u| self.wait_till.matches(&u.kind()))
        })
    }

    fn received_messages(&self) -> Vec<ProtocolMessage> {
        self.result.as_ref().map(|r| r.messages()).unwrap_or_default()
    }

    fn received_records(&self) -> Vec<Record> {
        self.result.as_ref().map(|r| r.records()).unwrap_or_default()
    }
}

/// Receive and accept the first of several expected message sequences that
/// matches exactly.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MultiReceiveAction {
    #[serde(flatten)]
    pub base: ActionBase,
    pub candidates: Vec<Vec<ProtocolMessage>>,
    #[serde(skip)]
    result: Option<LayerStackProcessingResult>,
    #[serde(skip)]
    matched: Option<usize>,
}

impl MultiReceiveAction {
    pub fn new(alias: impl Into<String>, candidates: Vec<Vec<ProtocolMessage>>) -> Self {
        Self {
            base: ActionBase::new(alias),
            candidates,
            ..Self::default()
        }
    }

    /// Index of the candidate that matched.
    pub fn matched(&self) -> Option<usize> {
        self.matched
    }
}

impl TlsAction for MultiReceiveAction {
    fn name(&self) -> &'static str {
        "MultiReceive"
    }

    fn base(&self) -> &ActionBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut ActionBase {
        &mut self.base
    }

    fn capabilities(&self) -> &'static [Capability] {
        RECEIVING
    }

    fn run(&mut self, state: &mut State) -> Result<(), ActionError> {
        if self.candidates.is_empty() {
            return Err(ActionError::MissingUnits {
                action: "MultiReceive",
                what: "candidate message sequences",
            });
        }
        let alias = self.base.alias("MultiReceive")?;
        let options = self.base.match_options();
        let ctx = state.context_mut(alias)?;
        let result = ctx.receive_data(&[LayerConfiguration::generic(LayerType::Message)])?;
        let received = result.units(LayerType::Message);
        self.matched = self.candidates.iter().position(|candidate| {
            let expected: Vec<DataUnit> = candidate.iter().cloned().map(DataUnit::from).collect();
            evaluate_receive(&expected, received, ComparisonStrategy::Kind, options)
                == MatchOutcome::Complete
        });
        debug!(alias, matched = ?self.matched, "candidates evaluated");
        info!(alias, "received {}", summarize(&result.messages()));
        self.result = Some(result);
        Ok(())
    }

    fn clear_observed(&mut self) {
        self.result = None;
        self.matched = None;
    }

    fn outcome_as_planned(&self) -> bool {
        self.matched.is_some()
    }

    fn received_messages(&self) -> Vec<ProtocolMessage> {
        self.result.as_ref().map(|r| r.messages()).unwrap_or_default()
    }
}
