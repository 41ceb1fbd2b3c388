//! Actions that reshape a connection's layer stack.

use serde::{Deserialize, Serialize};
use tlscript_types::ActionError;
use tracing::{info, warn};

use super::{ActionBase, Capability, TlsAction, CONNECTION_BOUND};
use crate::layer::{LayerType, ToggleMode};
use crate::workflow::State;

macro_rules! layer_common {
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
            CONNECTION_BOUND
        }
    };
}

/// Enable, disable or flip one layer. A disabled layer passes data through
/// untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToggleLayerAction {
    #[serde(flatten)]
    pub base: ActionBase,
    pub layer_type: LayerType,
    #[serde(default)]
    pub mode: ToggleMode,
    #[serde(skip)]
    enabled: Option<bool>,
}

impl ToggleLayerAction {
    pub fn new(alias: impl Into<String>, layer_type: LayerType, mode: ToggleMode) -> Self {
        Self {
            base: ActionBase::new(alias),
            layer_type,
            mode,
            enabled: None,
        }
    }

    /// Layer state after the action; `None` if the layer was absent.
    pub fn enabled(&self) -> Option<bool> {
        self.enabled
    }
}

impl TlsAction for ToggleLayerAction {
    layer_common!("ToggleLayer");

    fn run(&mut self, state: &mut State) -> Result<(), ActionError> {
        let alias = self.base.alias("ToggleLayer")?;
        let ctx = state.context_mut(alias)?;
        self.enabled = ctx.layer_stack.set_enabled(self.layer_type, self.mode);
        match self.enabled {
            Some(enabled) => info!(alias, layer = %self.layer_type, enabled, "layer toggled"),
            None => warn!(alias, layer = %self.layer_type, "no such layer to toggle"),
        }
        Ok(())
    }

    fn clear_observed(&mut self) {
        self.enabled = None;
    }

    fn outcome_as_planned(&self) -> bool {
        self.enabled.is_some()
    }
}

/// Insert a fresh layer of `layer_type` at `position` (0 is the top).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InsertLayerAction {
    #[serde(flatten)]
    pub base: ActionBase,
    pub layer_type: LayerType,
    #[serde(default)]
    pub position: usize,
    #[serde(skip)]
    inserted: bool,
}

impl InsertLayerAction {
    pub fn new(alias: impl Into<String>, layer_type: LayerType, position: usize) -> Self {
        Self {
            base: ActionBase::new(alias),
            layer_type,
            position,
            inserted: false,
        }
    }
}

impl TlsAction for InsertLayerAction {
    layer_common!("InsertLayer");

    fn run(&mut self, state: &mut State) -> Result<(), ActionError> {
        let alias = self.base.alias("InsertLayer")?;
        let ctx = state.context_mut(alias)?;
        if ctx.layer_stack.contains(self.layer_type) {
            return Err(ActionError::layer(self.layer_type.name(), "already in the stack"));
        }
        ctx.insert_layer(self.position, self.layer_type.create());
        info!(alias, layer = %self.layer_type, position = self.position, "layer inserted");
        self.inserted = true;
        Ok(())
    }

    fn clear_observed(&mut self) {
        self.inserted = false;
    }

    fn outcome_as_planned(&self) -> bool {
        self.inserted
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoveLayerAction {
    #[serde(flatten)]
    pub base: ActionBase,
    pub layer_type: LayerType,
    #[serde(skip)]
    removed: bool,
}

impl RemoveLayerAction {
    pub fn new(alias: impl Into<String>, layer_type: LayerType) -> Self {
        Self {
            base: ActionBase::new(alias),
            layer_type,
            removed: false,
        }
    }
}

impl TlsAction for RemoveLayerAction {
    layer_common!("RemoveLayer");

    fn run(&mut self, state: &mut State) -> Result<(), ActionError> {
        let alias = self.base.alias("RemoveLayer")?;
        let ctx = state.context_mut(alias)?;
        self.removed = ctx.remove_layer(self.layer_type).is_some();
        if self.removed {
            info!(alias, layer = %self.layer_type, "layer removed");
        } else {
            warn!(alias, layer = %self.layer_type, "no such layer to remove");
        }
        Ok(())
    }

    fn clear_observed(&mut self) {
        self.removed = false;
    }

    fn outcome_as_planned(&self) -> bool {
        self.removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::testing::peers;
    use crate::action::{LayerUnits, ReceiveAction, SendAction};
    use crate::config::LayerStackType;
    use crate::handshake::HandshakeType;
    use crate::message::ProtocolMessage;
    use crate::record::{ContentType, Record};

    #[test]
    fn test_toggle_absent_layer_not_as_planned() {
        let mut p = peers(LayerStackType::Tls);
        let mut action = ToggleLayerAction::new("client", LayerType::QuicFrame, ToggleMode::Disable);
        action.execute(&mut p.state).unwrap();
        assert!(action.is_executed());
        assert!(!action.executed_as_planned());
    }

    #[test]
    fn test_toggle_flips_state() {
        let mut p = peers(LayerStackType::Tls);
        let mut off = ToggleLayerAction::new("client", LayerType::Message, ToggleMode::Toggle);
        off.execute(&mut p.state).unwrap();
        assert_eq!(off.enabled(), Some(false));
        let stack = &p.state.context("client").unwrap().layer_stack;
        assert_eq!(stack.is_enabled(LayerType::Message), Some(false));

        let mut on = ToggleLayerAction::new("client", LayerType::Message, ToggleMode::Toggle);
        on.execute(&mut p.state).unwrap();
        assert_eq!(on.enabled(), Some(true));
    }

    #[test]
    fn test_disabled_message_layer_is_transparent() {
        let mut p = peers(LayerStackType::Tls);
        ToggleLayerAction::new("client", LayerType::Message, ToggleMode::Disable)
            .execute(&mut p.state)
            .unwrap();
        let mut send = SendAction::with_units(
            "client",
            LayerUnits::records(vec![Record::explicit(ContentType::Handshake, vec![14, 0, 0, 0])]),
        );
        send.execute(&mut p.state).unwrap();
        assert!(send.sent_messages().is_empty());

        let mut receive = ReceiveAction::new(
            "server",
            vec![ProtocolMessage::handshake(HandshakeType::ServerHelloDone, vec![])],
        );
        receive.execute(&mut p.state).unwrap();
        assert!(receive.executed_as_planned());
    }

    #[test]
    fn test_insert_and_remove() {
        let mut p = peers(LayerStackType::Tls);
        let mut remove = RemoveLayerAction::new("client", LayerType::Message);
        remove.execute(&mut p.state).unwrap();
        assert!(remove.executed_as_planned());
        let mut again = RemoveLayerAction::new("client", LayerType::Message);
        again.execute(&mut p.state).unwrap();
        assert!(!again.executed_as_planned());

        let mut insert = InsertLayerAction::new("client", LayerType::Message, 0);
        insert.execute(&mut p.state).unwrap();
        assert!(insert.executed_as_planned());
        let stack = &p.state.context("client").unwrap().layer_stack;
        assert_eq!(stack.layer_types(), vec![LayerType::Message, LayerType::Record]);

        let mut duplicate = InsertLayerAction::new("client", LayerType::Record, 5);
        assert!(matches!(
            duplicate.execute(&mut p.state),
            Err(ActionError::Layer { .. })
        ));
    }
}
