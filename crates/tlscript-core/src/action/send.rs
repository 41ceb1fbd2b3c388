//! Sending actions.

use serde::{Deserialize, Serialize};
use tlscript_types::ActionError;
use tracing::info;

use super::{summarize, ActionBase, Capability, LayerUnits, TlsAction, SENDING};
use crate::layer::{DataUnit, LayerConfiguration, LayerStackProcessingResult, LayerType};
use crate::message::ProtocolMessage;
use crate::record::Record;
use crate::workflow::State;

/// Send configured units through the layer stack in one transport write.
///
/// Message-layer units are the usual payload; units configured for lower
/// layers act as templates or explicit units of those layers.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SendAction {
    #[serde(flatten)]
    pub base: ActionBase,
    #[serde(flatten)]
    pub units: LayerUnits,
    #[serde(skip)]
    result: Option<LayerStackProcessingResult>,
}

impl SendAction {
    pub fn new(alias: impl Into<String>, messages: Vec<ProtocolMessage>) -> Self {
        Self::with_units(alias, LayerUnits::messages(messages))
    }

    pub fn with_units(alias: impl Into<String>, units: LayerUnits) -> Self {
        Self {
            base: ActionBase::new(alias),
            units,
            result: None,
        }
    }

    pub fn result(&self) -> Option<&LayerStackProcessingResult> {
        self.result.as_ref()
    }
}

impl TlsAction for SendAction {
    fn name(&self) -> &'static str {
        "Send"
    }

    fn base(&self) -> &ActionBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut ActionBase {
        &mut self.base
    }

    fn capabilities(&self) -> &'static [Capability] {
        SENDING
    }

    fn run(&mut self, state: &mut State) -> Result<(), ActionError> {
        if self.units.is_empty() {
            return Err(ActionError::MissingUnits {
                action: "Send",
                what: "units to send",
            });
        }
        let alias = self.base.alias("Send")?;
        let ctx = state.context_mut(alias)?;
        let result = ctx.send_data(&self.units.send_configurations())?;
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

    fn sent_records(&self) -> Vec<Record> {
        self.result.as_ref().map(|r| r.records()).unwrap_or_default()
    }
}

/// Retransmit the records of the last flight, each protected with the
/// cipher of the epoch it was first sent in.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResendLastFlightAction {
    #[serde(flatten)]
    pub base: ActionBase,
    #[serde(skip)]
    result: Option<LayerStackProcessingResult>,
    #[serde(skip)]
    flight_len: usize,
}

impl ResendLastFlightAction {
    pub fn new(alias: impl Into<String>) -> Self {
        Self {
            base: ActionBase::new(alias),
            ..Self::default()
        }
    }
}

impl TlsAction for ResendLastFlightAction {
    fn name(&self) -> &'static str {
        "ResendLastFlight"
    }

    fn base(&self) -> &ActionBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut ActionBase {
        &mut self.base
    }

    fn capabilities(&self) -> &'static [Capability] {
        SENDING
    }

    fn run(&mut self, state: &mut State) -> Result<(), ActionError> {
        let alias = self.base.alias("ResendLastFlight")?;
        let ctx = state.context_mut(alias)?;
        let flight: Vec<DataUnit> = ctx
            .tls
            .last_flight()
            .iter()
            .map(|sent| {
                DataUnit::Record(Record {
                    epoch: sent.epoch,
                    ..sent.detached()
                })
            })
            .collect();
        if flight.is_empty() {
            return Err(ActionError::MissingUnits {
                action: "ResendLastFlight",
                what: "a previously sent flight",
            });
        }
        self.flight_len = flight.len();
        // The retransmission becomes the last flight.
        ctx.tls.close_flight();
        let result = ctx.send_data(&[LayerConfiguration::send(LayerType::Record, flight)])?;
        info!(alias, records = self.flight_len, "resent last flight");
        self.result = Some(result);
        Ok(())
    }

    fn clear_observed(&mut self) {
        self.result = None;
        self.flight_len = 0;
    }

    fn outcome_as_planned(&self) -> bool {
        self.result
            .as_ref()
            .is_some_and(|r| r.executed_as_planned() && r.records().len() == self.flight_len)
    }

    fn sent_records(&self) -> Vec<Record> {
        self.result.as_ref().map(|r| r.records()).unwrap_or_default()
    }
}
