//! Matching of received units against expected ones.

use serde::{Deserialize, Serialize};

use crate::layer::{DataUnit, MatchOptions};

/// How an expected unit is compared with a received one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComparisonStrategy {
    /// Same concrete kind.
    #[default]
    Kind,
    /// Same kind, and every content field the expected unit sets is equal.
    Content,
}

impl ComparisonStrategy {
    pub fn unit_matches(self, expected: &DataUnit, actual: &DataUnit) -> bool {
        if !expected.kind().matches(&actual.kind()) {
            return false;
        }
        match self {
            ComparisonStrategy::Kind => true,
            ComparisonStrategy::Content => content_matches(expected, actual),
        }
    }
}

fn content_matches(expected: &DataUnit, actual: &DataUnit) -> bool {
    fn set_and_equal<T: PartialEq>(expected: &Option<T>, actual: &Option<T>) -> bool {
        expected.is_none() || expected == actual
    }
    match (expected, actual) {
        (DataUnit::Message(e), DataUnit::Message(a)) => e.payload.is_empty() || e.payload == a.payload,
        (DataUnit::Record(e), DataUnit::Record(a)) => {
            set_and_equal(&e.fragment, &a.fragment)
                && set_and_equal(&e.version, &a.version)
                && set_and_equal(&e.epoch, &a.epoch)
        }
        (DataUnit::Fragment(e), DataUnit::Fragment(a)) => {
            set_and_equal(&e.content, &a.content) && set_and_equal(&e.message_seq, &a.message_seq)
        }
        (DataUnit::QuicFrame(e), DataUnit::QuicFrame(a)) => e == a,
        (DataUnit::QuicPacket(e), DataUnit::QuicPacket(a)) => set_and_equal(&e.payload, &a.payload),
        _ => false,
    }
}

/// State of a receive measured against its expectation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchOutcome {
    /// Every required unit arrived in order.
    Complete,
    /// So far consistent; more units are needed.
    Incomplete,
    /// A received unit contradicts the expectation.
    Failed,
}

/// Walk `expected` and `received` in order.
///
/// Optional expected units may be absent. Unexpected warning alerts are
/// skipped with `ignore_unexpected_warnings`; any unexpected unit is skipped
/// with `check_only_expected`.
pub fn evaluate_receive(
    expected: &[DataUnit],
    received: &[DataUnit],
    strategy: ComparisonStrategy,
    options: MatchOptions,
) -> MatchOutcome {
    let skippable = |unit: &DataUnit| {
        options.check_only_expected || (options.ignore_unexpected_warnings && unit.is_warning_alert())
    };

    let (mut i, mut j) = (0, 0);
    while let Some(exp) = expected.get(i) {
        match received.get(j) {
            Some(actual) if strategy.unit_matches(exp, actual) => {
                i += 1;
                j += 1;
            }
            Some(actual) if options.ignore_unexpected_warnings && actual.is_warning_alert() => j += 1,
            _ if !exp.is_required() => i += 1,
            Some(_) if options.check_only_expected => j += 1,
            Some(_) => return MatchOutcome::Failed,
            None => return MatchOutcome::Incomplete,
        }
    }
    if received[j..].iter().all(skippable) {
        MatchOutcome::Complete
    } else {
        MatchOutcome::Failed
    }
}

/// Both lists are present, of equal length, and pairwise of the same kind.
pub fn same_kinds(a: Option<&[DataUnit]>, b: Option<&[DataUnit]>) -> bool {
    match (a, b) {
        (Some(a), Some(b)) => {
            a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.kind() == y.kind())
        }
        _ => false,
    }
}
