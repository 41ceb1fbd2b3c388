//! Per-invocation layer directives.

use crate::action::compare::{evaluate_receive, ComparisonStrategy, MatchOutcome};

use super::{DataUnit, LayerType, UnitKind};

/// Receive matching options, taken from the action options.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MatchOptions {
    /// Extra received units between and after the expected ones are fine.
    pub check_only_expected: bool,
    /// Warning alerts that were not expected are skipped.
    pub ignore_unexpected_warnings: bool,
}

/// What a layer is asked to do for one send or receive.
#[derive(Debug, Clone, PartialEq)]
pub enum LayerDirective {
    /// Send these units (units of this layer only).
    Send(Vec<DataUnit>),
    /// Receive until the expected units arrived or the match failed.
    Receive {
        expected: Vec<DataUnit>,
        strategy: ComparisonStrategy,
        options: MatchOptions,
    },
    /// Receive until a unit of `target` kind arrived or `max_units` units did.
    ReceiveTill {
        target: UnitKind,
        max_units: Option<usize>,
    },
    /// Receive whatever arrives until the transport times out.
    GenericReceive,
    /// Do not process; data reaching this layer is dropped.
    Ignore,
}

/// A directive bound to one layer of the stack.
#[derive(Debug, Clone, PartialEq)]
pub struct LayerConfiguration {
    pub layer_type: LayerType,
    pub directive: LayerDirective,
}

impl LayerConfiguration {
    pub fn new(layer_type: LayerType, directive: LayerDirective) -> Self {
        Self {
            layer_type,
            directive,
        }
    }

    pub fn send(layer_type: LayerType, units: Vec<DataUnit>) -> Self {
        Self::new(layer_type, LayerDirective::Send(units))
    }

    pub fn receive(layer_type: LayerType, expected: Vec<DataUnit>, options: MatchOptions) -> Self {
        Self::new(
            layer_type,
            LayerDirective::Receive {
                expected,
                strategy: ComparisonStrategy::default(),
                options,
            },
        )
    }

    pub fn receive_till(target: UnitKind, max_units: Option<usize>) -> Self {
        Self::new(
            target.layer_type(),
            LayerDirective::ReceiveTill { target, max_units },
        )
    }

    pub fn generic(layer_type: LayerType) -> Self {
        Self::new(layer_type, LayerDirective::GenericReceive)
    }

    pub fn ignore(layer_type: LayerType) -> Self {
        Self::new(layer_type, LayerDirective::Ignore)
    }

    /// Whether a receive can stop waiting for more data.
    pub fn is_satisfied(&self, received: &[DataUnit]) -> bool {
        match &self.directive {
            LayerDirective::Receive {
                expected,
                strategy,
                options,
            } => evaluate_receive(expected, received, *strategy, *options) != MatchOutcome::Incomplete,
            LayerDirective::ReceiveTill { target, max_units } => {
                received.iter().any(|u| target.matches(&u.kind()))
                    || max_units.is_some_and(|max| received.len() >= max)
            }
            LayerDirective::GenericReceive | LayerDirective::Send(_) | LayerDirective::Ignore => false,
        }
    }

    /// Whether the units received satisfy the directive.
    pub fn executed_as_planned(&self, received: &[DataUnit]) -> bool {
        match &self.directive {
            LayerDirective::Receive {
                expected,
                strategy,
                options,
            } => evaluate_receive(expected, received, *strategy, *options) == MatchOutcome::Complete,
            LayerDirective::ReceiveTill { target, .. } => {
                received.iter().any(|u| target.matches(&u.kind()))
            }
            LayerDirective::GenericReceive | LayerDirective::Send(_) | LayerDirective::Ignore => true,
        }
    }

    /// Directives that drive a receive loop.
    pub fn is_receive(&self) -> bool {
        matches!(
            self.directive,
            LayerDirective::Receive { .. }
                | LayerDirective::ReceiveTill { .. }
                | LayerDirective::GenericReceive
        )
    }
}
