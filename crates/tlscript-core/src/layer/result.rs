//! Results of one pass through the layer stack.

use super::{DataUnit, LayerType};
use crate::message::ProtocolMessage;
use crate::record::Record;

/// Units one layer produced and whether its directive was satisfied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayerProcessingResult {
    pub layer_type: LayerType,
    pub units: Vec<DataUnit>,
    pub executed_as_planned: bool,
    /// Bytes the layer buffered without completing a unit.
    pub unread_bytes: usize,
    /// False when the layer was disabled and passed data through.
    pub enabled: bool,
}

impl LayerProcessingResult {
    pub fn new(layer_type: LayerType, units: Vec<DataUnit>, executed_as_planned: bool) -> Self {
        Self {
            layer_type,
            units,
            executed_as_planned,
            unread_bytes: 0,
            enabled: true,
        }
    }

    pub fn disabled(layer_type: LayerType) -> Self {
        Self {
            enabled: false,
            ..Self::new(layer_type, Vec::new(), true)
        }
    }
}

/// Per-layer results of one send or receive, top layer first.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LayerStackProcessingResult {
    pub results: Vec<LayerProcessingResult>,
    /// The receive ended because no more data arrived.
    pub timed_out: bool,
}

impl LayerStackProcessingResult {
    pub fn result(&self, layer_type: LayerType) -> Option<&LayerProcessingResult> {
        self.results.iter().find(|r| r.layer_type == layer_type)
    }

    pub fn units(&self, layer_type: LayerType) -> &[DataUnit] {
        self.result(layer_type)
            .map(|r| r.units.as_slice())
            .unwrap_or_default()
    }

    pub fn messages(&self) -> Vec<ProtocolMessage> {
        self.units(LayerType::Message)
            .iter()
            .filter_map(DataUnit::as_message)
            .cloned()
            .collect()
    }

    pub fn records(&self) -> Vec<Record> {
        self.units(LayerType::Record)
            .iter()
            .filter_map(DataUnit::as_record)
            .cloned()
            .collect()
    }

    /// Every layer satisfied its directive.
    pub fn executed_as_planned(&self) -> bool {
        self.results.iter().all(|r| r.executed_as_planned)
    }

    pub fn unread_bytes(&self) -> usize {
        self.results.iter().map(|r| r.unread_bytes).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::ContentType;

    #[test]
    fn test_accessors() {
        let result = LayerStackProcessingResult {
            results: vec![
                LayerProcessingResult::new(
                    LayerType::Message,
                    vec![ProtocolMessage::application_data(b"hi".to_vec()).into()],
                    true,
                ),
                LayerProcessingResult {
                    unread_bytes: 3,
                    ..LayerProcessingResult::new(
                        LayerType::Record,
                        vec![Record::explicit(ContentType::ApplicationData, b"hi".to_vec()).into()],
                        false,
                    )
                },
            ],
            timed_out: true,
        };
        assert_eq!(result.messages().len(), 1);
        assert_eq!(result.records().len(), 1);
        assert!(result.units(LayerType::QuicFrame).is_empty());
        assert!(!result.executed_as_planned());
        assert_eq!(result.unread_bytes(), 3);
        assert!(LayerProcessingResult::disabled(LayerType::Record).executed_as_planned);
    }
}
