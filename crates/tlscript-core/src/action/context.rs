//! Actions that overwrite negotiated or secret context state.
//!
//! All of them go through the typed field registry, so a value of the wrong
//! kind is a configuration error and leaves the action unexecuted. Each
//! action remembers the value it replaced.

use serde::{Deserialize, Serialize};
use tlscript_types::ActionError;
use tracing::info;

use super::{checked_alias, ActionBase, Capability, TlsAction, CONNECTION_BOUND};
use crate::context::{ContextField, ContextValue};
use crate::workflow::State;
use crate::{CompressionMethod, ProtocolVersion};

macro_rules! context_common {
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

        fn clear_observed(&mut self) {
            self.old_value = None;
        }

        fn outcome_as_planned(&self) -> bool {
            true
        }
    };
}

fn install(
    state: &mut State,
    alias: &str,
    field: ContextField,
    value: ContextValue,
) -> Result<ContextValue, ActionError> {
    let ctx = state.context_mut(alias)?;
    let old = ctx.tls.set_field(field, value)?;
    info!(alias, %field, "context value changed");
    Ok(old)
}

/// Install any value into any context field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeContextValueAction {
    #[serde(flatten)]
    pub base: ActionBase,
    pub field: ContextField,
    pub value: ContextValue,
    #[serde(skip)]
    old_value: Option<ContextValue>,
}

impl ChangeContextValueAction {
    pub fn new(alias: impl Into<String>, field: ContextField, value: ContextValue) -> Self {
        Self {
            base: ActionBase::new(alias),
            field,
            value,
            old_value: None,
        }
    }

    pub fn old_value(&self) -> Option<&ContextValue> {
        self.old_value.as_ref()
    }
}

impl TlsAction for ChangeContextValueAction {
    context_common!("ChangeContextValue");

    fn run(&mut self, state: &mut State) -> Result<(), ActionError> {
        let alias = self.base.alias("ChangeContextValue")?;
        self.old_value = Some(install(state, alias, self.field, self.value.clone())?);
        Ok(())
    }
}

macro_rules! typed_change {
    (
        $(#[$doc:meta])*
        $ty:ident, $name:literal, $value:ident: $vty:ty, $field:expr, $wrap:expr
    ) => {
        $(#[$doc])*
        #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
        pub struct $ty {
            #[serde(flatten)]
            pub base: ActionBase,
            pub $value: $vty,
            #[serde(skip)]
            old_value: Option<ContextValue>,
        }

        impl $ty {
            pub fn new(alias: impl Into<String>, $value: $vty) -> Self {
                Self {
                    base: ActionBase::new(alias),
                    $value,
                    old_value: None,
                }
            }

            pub fn old_value(&self) -> Option<&ContextValue> {
                self.old_value.as_ref()
            }
        }

        impl TlsAction for $ty {
            context_common!($name);

            fn run(&mut self, state: &mut State) -> Result<(), ActionError> {
                let alias = self.base.alias($name)?;
                let wrap: fn($vty) -> ContextValue = $wrap;
                self.old_value = Some(install(state, alias, $field, wrap(self.$value.clone()))?);
                Ok(())
            }
        }
    };
}

typed_change!(
    /// Select the protocol version used for records from now on.
    ChangeProtocolVersionAction,
    "ChangeProtocolVersion",
    protocol_version: ProtocolVersion,
    ContextField::SelectedProtocolVersion,
    ContextValue::ProtocolVersion
);
typed_change!(
    ChangeCompressionAction,
    "ChangeCompression",
    compression: CompressionMethod,
    ContextField::SelectedCompression,
    ContextValue::Compression
);
typed_change!(
    /// Replace the master secret. Active ciphers are not rebuilt.
    ChangeMasterSecretAction,
    "ChangeMasterSecret",
    new_value: Vec<u8>,
    ContextField::MasterSecret,
    ContextValue::Bytes
);
typed_change!(
    ChangePreMasterSecretAction,
    "ChangePreMasterSecret",
    new_value: Vec<u8>,
    ContextField::PreMasterSecret,
    ContextValue::Bytes
);
typed_change!(
    ChangeClientRandomAction,
    "ChangeClientRandom",
    new_value: Vec<u8>,
    ContextField::ClientRandom,
    ContextValue::Bytes
);
typed_change!(
    ChangeServerRandomAction,
    "ChangeServerRandom",
    new_value: Vec<u8>,
    ContextField::ServerRandom,
    ContextValue::Bytes
);

/// Which connection ID a [`ChangeConnectionIdAction`] replaces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionIdSide {
    /// The ID the peer writes on records sent to us.
    Read,
    /// The ID written on records we send.
    #[default]
    Write,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeConnectionIdAction {
    #[serde(flatten)]
    pub base: ActionBase,
    pub connection_id: Vec<u8>,
    #[serde(default)]
    pub side: ConnectionIdSide,
    #[serde(skip)]
    old_value: Option<ContextValue>,
}

impl ChangeConnectionIdAction {
    pub fn new(alias: impl Into<String>, connection_id: Vec<u8>, side: ConnectionIdSide) -> Self {
        Self {
            base: ActionBase::new(alias),
            connection_id,
            side,
            old_value: None,
        }
    }

    pub fn old_value(&self) -> Option<&ContextValue> {
        self.old_value.as_ref()
    }
}

impl TlsAction for ChangeConnectionIdAction {
    context_common!("ChangeConnectionId");

    fn run(&mut self, state: &mut State) -> Result<(), ActionError> {
        let alias = self.base.alias("ChangeConnectionId")?;
        let field = match self.side {
            ConnectionIdSide::Read => ContextField::ReadConnectionId,
            ConnectionIdSide::Write => ContextField::WriteConnectionId,
        };
        let value = ContextValue::Bytes(self.connection_id.clone());
        self.old_value = Some(install(state, alias, field, value)?);
        Ok(())
    }
}

/// Copy one field from the context of `src_alias` into `dst_alias`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CopyContextFieldAction {
    #[serde(flatten)]
    pub base: ActionBase,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub src_alias: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dst_alias: Option<String>,
    pub field: ContextField,
    #[serde(skip)]
    old_value: Option<ContextValue>,
}

impl CopyContextFieldAction {
    pub fn new(src: impl Into<String>, dst: impl Into<String>, field: ContextField) -> Self {
        Self {
            base: ActionBase::default(),
            src_alias: Some(src.into()),
            dst_alias: Some(dst.into()),
            field,
            old_value: None,
        }
    }

    pub fn old_value(&self) -> Option<&ContextValue> {
        self.old_value.as_ref()
    }
}

impl TlsAction for CopyContextFieldAction {
    context_common!("CopyContextField");

    fn alias_slots(&self) -> Vec<Option<&str>> {
        vec![self.src_alias.as_deref(), self.dst_alias.as_deref()]
    }

    fn alias_slots_mut(&mut self) -> Vec<&mut Option<String>> {
        vec![&mut self.src_alias, &mut self.dst_alias]
    }

    fn run(&mut self, state: &mut State) -> Result<(), ActionError> {
        let src = checked_alias(self.src_alias.as_deref(), "CopyContextField")?;
        let dst = checked_alias(self.dst_alias.as_deref(), "CopyContextField")?;
        let (from, to) = state.context_pair_mut(src, dst)?;
        self.old_value = Some(to.tls.copy_field_from(&from.tls, self.field)?);
        info!(src, dst, field = %self.field, "context field copied");
        Ok(())
    }
}
