//! The ordered layer stack of one connection.

use serde::{Deserialize, Serialize};
use tlscript_types::ActionError;
use tracing::{debug, warn};

use super::config::{LayerConfiguration, LayerDirective};
use super::result::{LayerProcessingResult, LayerStackProcessingResult};
use super::{DataUnit, LayerData, LayerType, ProtocolLayer};
use crate::config::LayerStackType;
use crate::context::TlsContext;
use crate::transport::Transport;

/// How a toggle action changes a layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToggleMode {
    Enable,
    Disable,
    #[default]
    Toggle,
}

#[derive(Debug)]
struct LayerSlot {
    layer: Box<dyn ProtocolLayer>,
    enabled: bool,
}

/// Layers ordered top (index 0) to bottom.
#[derive(Debug, Default)]
pub struct LayerStack {
    slots: Vec<LayerSlot>,
}

impl LayerStack {
    pub fn new() -> Self {
        Self::default()
    }

    /// The preset stack for a connection kind.
    pub fn preset(kind: LayerStackType, ctx: &mut TlsContext) -> Self {
        let types: &[LayerType] = match kind {
            LayerStackType::Tls => &[LayerType::Message, LayerType::Record],
            LayerStackType::Dtls => &[LayerType::Message, LayerType::DtlsFragment, LayerType::Record],
            LayerStackType::Quic => &[LayerType::Message, LayerType::QuicFrame, LayerType::QuicPacket],
        };
        let mut stack = Self::new();
        for layer_type in types {
            stack.insert_layer(stack.len(), layer_type.create(), ctx);
        }
        stack
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn layer_types(&self) -> Vec<LayerType> {
        self.slots.iter().map(|s| s.layer.layer_type()).collect()
    }

    pub fn contains(&self, layer_type: LayerType) -> bool {
        self.position(layer_type).is_some()
    }

    pub fn position(&self, layer_type: LayerType) -> Option<usize> {
        self.slots
            .iter()
            .position(|s| s.layer.layer_type() == layer_type)
    }

    /// Whether the stack holds a layer that protects units with ciphers.
    pub fn has_cipher_layer(&self) -> bool {
        self.slots
            .iter()
            .any(|s| s.layer.layer_type().is_cipher_bearing())
    }

    pub fn is_enabled(&self, layer_type: LayerType) -> Option<bool> {
        self.position(layer_type).map(|i| self.slots[i].enabled)
    }

    /// Apply `mode` to the layer. Returns the new state, or `None` when the
    /// stack has no such layer.
    pub fn set_enabled(&mut self, layer_type: LayerType, mode: ToggleMode) -> Option<bool> {
        let i = self.position(layer_type)?;
        let slot = &mut self.slots[i];
        slot.enabled = match mode {
            ToggleMode::Enable => true,
            ToggleMode::Disable => false,
            ToggleMode::Toggle => !slot.enabled,
        };
        debug!(layer = %layer_type, enabled = slot.enabled, "layer toggled");
        Some(slot.enabled)
    }

    /// Insert `layer` at `position` (clamped to the bottom) and initialize it.
    pub fn insert_layer(&mut self, position: usize, mut layer: Box<dyn ProtocolLayer>, ctx: &mut TlsContext) {
        layer.initialize(ctx);
        let position = position.min(self.slots.len());
        self.slots.insert(
            position,
            LayerSlot {
                layer,
                enabled: true,
            },
        );
    }

    pub fn remove_layer(&mut self, layer_type: LayerType) -> Option<Box<dyn ProtocolLayer>> {
        let i = self.position(layer_type)?;
        Some(self.slots.remove(i).layer)
    }

    /// Drop every layer's buffered state.
    pub fn clear_all(&mut self) {
        for slot in &mut self.slots {
            slot.layer.clear();
        }
    }

    /// Serialize configured units top-down and hand the result to the
    /// transport in one write.
    pub fn send_data(
        &mut self,
        ctx: &mut TlsContext,
        transport: &mut dyn Transport,
        configs: &[LayerConfiguration],
    ) -> Result<LayerStackProcessingResult, ActionError> {
        let mut data: Vec<LayerData> = Vec::new();
        let mut results = Vec::with_capacity(self.slots.len());

        for slot in &mut self.slots {
            let layer_type = slot.layer.layer_type();
            if !slot.enabled {
                results.push(LayerProcessingResult::disabled(layer_type));
                continue;
            }
            let directive = configs
                .iter()
                .find(|c| c.layer_type == layer_type)
                .map(|c| &c.directive);
            let configured: &[DataUnit] = match directive {
                Some(LayerDirective::Send(units)) => units,
                Some(LayerDirective::Ignore) => {
                    data.clear();
                    results.push(LayerProcessingResult::new(layer_type, Vec::new(), true));
                    continue;
                }
                _ => &[],
            };
            let out = slot.layer.send(ctx, configured, std::mem::take(&mut data))?;
            debug!(
                alias = ctx.alias(),
                layer = %layer_type,
                units = out.units.len(),
                as_planned = out.executed_as_planned,
                "layer sent"
            );
            results.push(LayerProcessingResult::new(
                layer_type,
                out.units,
                out.executed_as_planned,
            ));
            data = out.data;
        }

        let bytes: Vec<u8> = data.into_iter().flat_map(|d| d.bytes).collect();
        if !bytes.is_empty() {
            transport.send_data(&bytes)?;
        }
        Ok(LayerStackProcessingResult {
            results,
            timed_out: false,
        })
    }

    /// Fetch and parse bottom-up until the topmost layer with a receive
    /// directive is satisfied, or until no more data arrives.
    pub fn receive_data(
        &mut self,
        ctx: &mut TlsContext,
        transport: &mut dyn Transport,
        configs: &[LayerConfiguration],
    ) -> Result<LayerStackProcessingResult, ActionError> {
        let directives: Vec<Option<&LayerConfiguration>> = self
            .slots
            .iter()
            .map(|s| configs.iter().find(|c| c.layer_type == s.layer.layer_type()))
            .collect();
        let governing = self
            .slots
            .iter()
            .zip(&directives)
            .position(|(slot, cfg)| slot.enabled && cfg.is_some_and(|c| c.is_receive()));
        if governing.is_none() && !configs.is_empty() {
            warn!(alias = ctx.alias(), "no enabled layer takes the receive directive");
        }

        let mut collected: Vec<Vec<DataUnit>> = vec![Vec::new(); self.slots.len()];
        let mut timed_out = false;
        loop {
            if let Some(i) = governing {
                if directives[i].is_some_and(|c| c.is_satisfied(&collected[i])) {
                    break;
                }
            }
            let bytes = transport.fetch_data()?;
            if bytes.is_empty() {
                timed_out = true;
                break;
            }
            ctx.close_flight();
            debug!(alias = ctx.alias(), len = bytes.len(), "fetched data");

            let mut data = vec![LayerData::raw(bytes)];
            for (i, slot) in self.slots.iter_mut().enumerate().rev() {
                if !slot.enabled {
                    continue;
                }
                if directives[i].is_some_and(|c| matches!(c.directive, LayerDirective::Ignore)) {
                    data.clear();
                    continue;
                }
                if data.is_empty() {
                    break;
                }
                let out = slot.layer.receive(ctx, std::mem::take(&mut data))?;
                collected[i].extend(out.units);
                data = out.data;
            }
        }

        let results = self
            .slots
            .iter()
            .zip(directives)
            .zip(collected)
            .map(|((slot, cfg), units)| {
                let layer_type = slot.layer.layer_type();
                if !slot.enabled {
                    return LayerProcessingResult::disabled(layer_type);
                }
                let executed_as_planned = cfg.map_or(true, |c| c.executed_as_planned(&units));
                LayerProcessingResult {
                    unread_bytes: slot.layer.unread_bytes(),
                    ..LayerProcessingResult::new(layer_type, units, executed_as_planned)
                }
            })
            .collect();
        Ok(LayerStackProcessingResult { results, timed_out })
    }
}
