//! Actions that change record protection: cipher activation, suite changes,
//! epochs and sequence numbers.

use serde::{Deserialize, Serialize};
use tlscript_types::ActionError;
use tracing::{info, warn};

use super::{ActionBase, Capability, TlsAction, CONNECTION_BOUND};
use crate::crypt::CipherDirection;
use crate::workflow::State;
use crate::CipherSuite;

macro_rules! cipher_common {
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

/// Activation and deactivation share one shape; only the direction and
/// whether a real cipher is derived differ.
macro_rules! cipher_toggle {
    ($(#[$doc:meta])* $ty:ident, $name:literal, $direction:expr, activate) => {
        $(#[$doc])*
        #[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
        pub struct $ty {
            #[serde(flatten)]
            pub base: ActionBase,
            /// Epoch of the new cipher; the direction's next epoch when unset.
            #[serde(default, skip_serializing_if = "Option::is_none")]
            pub epoch: Option<u16>,
            #[serde(skip)]
            activated: Option<u16>,
        }

        impl $ty {
            pub fn new(alias: impl Into<String>) -> Self {
                Self {
                    base: ActionBase::new(alias),
                    ..Self::default()
                }
            }

            pub fn at_epoch(mut self, epoch: u16) -> Self {
                self.epoch = Some(epoch);
                self
            }

            /// Epoch the cipher was installed at.
            pub fn activated(&self) -> Option<u16> {
                self.activated
            }
        }

        impl TlsAction for $ty {
            cipher_common!($name);

            fn run(&mut self, state: &mut State) -> Result<(), ActionError> {
                let alias = self.base.alias($name)?;
                let ctx = state.context_mut(alias)?;
                let epoch = ctx.tls.activate_cipher($direction, self.epoch)?;
                info!(alias, epoch, suite = ctx.tls.effective_cipher_suite().0, "{} activated", $name);
                self.activated = Some(epoch);
                Ok(())
            }

            fn clear_observed(&mut self) {
                self.activated = None;
            }

            fn outcome_as_planned(&self) -> bool {
                self.activated.is_some()
            }
        }
    };
    ($(#[$doc:meta])* $ty:ident, $name:literal, $direction:expr, deactivate) => {
        $(#[$doc])*
        #[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
        pub struct $ty {
            #[serde(flatten)]
            pub base: ActionBase,
        }

        impl $ty {
            pub fn new(alias: impl Into<String>) -> Self {
                Self {
                    base: ActionBase::new(alias),
                }
            }
        }

        impl TlsAction for $ty {
            cipher_common!($name);

            fn run(&mut self, state: &mut State) -> Result<(), ActionError> {
                let alias = self.base.alias($name)?;
                let ctx = state.context_mut(alias)?;
                ctx.tls.deactivate_cipher($direction);
                info!(alias, "{}", $name);
                Ok(())
            }

            fn clear_observed(&mut self) {}

            fn outcome_as_planned(&self) -> bool {
                true
            }
        }
    };
}

cipher_toggle!(
    /// Derive keys for the effective suite and protect outgoing records.
    ActivateEncryptionAction,
    "ActivateEncryption",
    CipherDirection::Encrypt,
    activate
);
cipher_toggle!(
    /// Derive keys for the effective suite and unprotect incoming records.
    ActivateDecryptionAction,
    "ActivateDecryption",
    CipherDirection::Decrypt,
    activate
);
cipher_toggle!(
    /// Send records unprotected from now on, keeping the write epoch.
    DeactivateEncryptionAction,
    "DeactivateEncryption",
    CipherDirection::Encrypt,
    deactivate
);
cipher_toggle!(
    DeactivateDecryptionAction,
    "DeactivateDecryption",
    CipherDirection::Decrypt,
    deactivate
);

/// Select a cipher suite and rebuild the active ciphers for it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeCipherSuiteAction {
    #[serde(flatten)]
    pub base: ActionBase,
    pub cipher_suite: CipherSuite,
    #[serde(skip)]
    old_value: Option<Option<CipherSuite>>,
}

impl ChangeCipherSuiteAction {
    pub fn new(alias: impl Into<String>, cipher_suite: CipherSuite) -> Self {
        Self {
            base: ActionBase::new(alias),
            cipher_suite,
            old_value: None,
        }
    }

    /// Suite selected before the change; `Some(None)` if none was.
    pub fn old_value(&self) -> Option<Option<CipherSuite>> {
        self.old_value
    }
}

impl TlsAction for ChangeCipherSuiteAction {
    cipher_common!("ChangeCipherSuite");

    fn run(&mut self, state: &mut State) -> Result<(), ActionError> {
        let alias = self.base.alias("ChangeCipherSuite")?;
        let ctx = state.context_mut(alias)?;
        self.old_value = Some(ctx.tls.selected_cipher_suite.replace(self.cipher_suite));
        info!(alias, suite = self.cipher_suite.0, "cipher suite changed");
        ctx.tls.rederive_current_ciphers()?;
        Ok(())
    }

    fn clear_observed(&mut self) {
        self.old_value = None;
    }

    fn outcome_as_planned(&self) -> bool {
        true
    }
}

/// Drop the most recent ciphers of each direction; the epochs fall back to
/// those of the ciphers left active.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResetRecordCipherListsAction {
    #[serde(flatten)]
    pub base: ActionBase,
    #[serde(default)]
    pub to_remove_encryptor: usize,
    #[serde(default)]
    pub to_remove_decryptor: usize,
    #[serde(skip)]
    removed: Option<(usize, usize)>,
}

impl ResetRecordCipherListsAction {
    pub fn new(alias: impl Into<String>, to_remove_encryptor: usize, to_remove_decryptor: usize) -> Self {
        Self {
            base: ActionBase::new(alias),
            to_remove_encryptor,
            to_remove_decryptor,
            removed: None,
        }
    }

    /// Entries actually removed, `(encryptor, decryptor)`.
    pub fn removed(&self) -> Option<(usize, usize)> {
        self.removed
    }
}

impl TlsAction for ResetRecordCipherListsAction {
    cipher_common!("ResetRecordCipherLists");

    fn run(&mut self, state: &mut State) -> Result<(), ActionError> {
        let alias = self.base.alias("ResetRecordCipherLists")?;
        let ctx = state.context_mut(alias)?;
        if !ctx.layer_stack.has_cipher_layer() {
            warn!(alias, "no cipher-bearing layer, nothing to reset");
            return Ok(());
        }
        let tls = &mut ctx.tls;
        let enc = tls.encryptor.rollback(self.to_remove_encryptor);
        let dec = tls.decryptor.rollback(self.to_remove_decryptor);
        tls.write_epoch = tls.encryptor.current_epoch();
        tls.read_epoch = tls.decryptor.current_epoch();
        info!(alias, enc, dec, "cipher lists reset");
        self.removed = Some((enc, dec));
        Ok(())
    }

    fn clear_observed(&mut self) {
        self.removed = None;
    }

    fn outcome_as_planned(&self) -> bool {
        true
    }
}

macro_rules! epoch_change {
    ($(#[$doc:meta])* $ty:ident, $name:literal, $field:ident) => {
        $(#[$doc])*
        #[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
        pub struct $ty {
            #[serde(flatten)]
            pub base: ActionBase,
            pub epoch: u16,
            #[serde(skip)]
            old_value: Option<u16>,
        }

        impl $ty {
            pub fn new(alias: impl Into<String>, epoch: u16) -> Self {
                Self {
                    base: ActionBase::new(alias),
                    epoch,
                    old_value: None,
                }
            }

            pub fn old_value(&self) -> Option<u16> {
                self.old_value
            }
        }

        impl TlsAction for $ty {
            cipher_common!($name);

            fn run(&mut self, state: &mut State) -> Result<(), ActionError> {
                let alias = self.base.alias($name)?;
                let ctx = state.context_mut(alias)?;
                self.old_value = Some(std::mem::replace(&mut ctx.tls.$field, self.epoch));
                info!(alias, epoch = self.epoch, "{}", $name);
                Ok(())
            }

            fn clear_observed(&mut self) {
                self.old_value = None;
            }

            fn outcome_as_planned(&self) -> bool {
                true
            }
        }
    };
}

epoch_change!(
    /// Overwrite the epoch incoming records are expected in.
    ChangeReadEpochAction,
    "ChangeReadEpoch",
    read_epoch
);
epoch_change!(
    /// Overwrite the epoch written on outgoing records.
    ChangeWriteEpochAction,
    "ChangeWriteEpoch",
    write_epoch
);

macro_rules! sequence_change {
    ($ty:ident, $name:literal, $epoch:ident, $get:ident, $set:ident) => {
        #[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
        pub struct $ty {
            #[serde(flatten)]
            pub base: ActionBase,
            /// Epoch whose counter changes; the current one when unset.
            #[serde(default, skip_serializing_if = "Option::is_none")]
            pub epoch: Option<u16>,
            pub sequence_number: u64,
            #[serde(skip)]
            old_value: Option<u64>,
        }

        impl $ty {
            pub fn new(alias: impl Into<String>, sequence_number: u64) -> Self {
                Self {
                    base: ActionBase::new(alias),
                    epoch: None,
                    sequence_number,
                    old_value: None,
                }
            }

            pub fn in_epoch(mut self, epoch: u16) -> Self {
                self.epoch = Some(epoch);
                self
            }

            pub fn old_value(&self) -> Option<u64> {
                self.old_value
            }
        }

        impl TlsAction for $ty {
            cipher_common!($name);

            fn run(&mut self, state: &mut State) -> Result<(), ActionError> {
                let alias = self.base.alias($name)?;
                let ctx = state.context_mut(alias)?;
                let epoch = self.epoch.unwrap_or(ctx.tls.$epoch);
                self.old_value = Some(ctx.tls.$get(epoch));
                ctx.tls.$set(epoch, self.sequence_number);
                info!(alias, epoch, seq = self.sequence_number, "{}", $name);
                Ok(())
            }

            fn clear_observed(&mut self) {
                self.old_value = None;
            }

            fn outcome_as_planned(&self) -> bool {
                true
            }
        }
    };
}

sequence_change!(
    ChangeReadSequenceNumberAction,
    "ChangeReadSequenceNumber",
    read_epoch,
    read_sequence,
    set_read_sequence
);
sequence_change!(
    ChangeWriteSequenceNumberAction,
    "ChangeWriteSequenceNumber",
    write_epoch,
    write_sequence,
    set_write_sequence
);
