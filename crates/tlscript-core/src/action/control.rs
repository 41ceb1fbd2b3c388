//! Connection lifecycle and pacing actions.

use std::thread;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tlscript_types::ActionError;
use tracing::{info, warn};

use super::{ActionBase, Capability, TlsAction, CONNECTION_BOUND, CONTEXTLESS};
use crate::workflow::State;

/// Block the trace for a fixed time. Bound to no connection.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WaitAction {
    #[serde(flatten)]
    pub base: ActionBase,
    pub time_to_wait_ms: u64,
    #[serde(skip)]
    waited: bool,
}

impl WaitAction {
    pub fn new(time_to_wait_ms: u64) -> Self {
        Self {
            time_to_wait_ms,
            ..Self::default()
        }
    }
}

impl TlsAction for WaitAction {
    fn name(&self) -> &'static str {
        "Wait"
    }

    fn base(&self) -> &ActionBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut ActionBase {
        &mut self.base
    }

    fn capabilities(&self) -> &'static [Capability] {
        CONTEXTLESS
    }

    fn alias_slots(&self) -> Vec<Option<&str>> {
        Vec::new()
    }

    fn alias_slots_mut(&mut self) -> Vec<&mut Option<String>> {
        Vec::new()
    }

    fn run(&mut self, _state: &mut State) -> Result<(), ActionError> {
        info!(ms = self.time_to_wait_ms, "waiting");
        thread::sleep(Duration::from_millis(self.time_to_wait_ms));
        self.waited = true;
        Ok(())
    }

    fn clear_observed(&mut self) {
        self.waited = false;
    }

    fn outcome_as_planned(&self) -> bool {
        self.waited
    }
}

/// Prepare the context for a new handshake on the same connection. Ciphers
/// and epochs stay as they are.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RenegotiationAction {
    #[serde(flatten)]
    pub base: ActionBase,
    #[serde(default)]
    pub reset_last_verify_data: bool,
}

impl RenegotiationAction {
    pub fn new(alias: impl Into<String>, reset_last_verify_data: bool) -> Self {
        Self {
            base: ActionBase::new(alias),
            reset_last_verify_data,
        }
    }
}

impl TlsAction for RenegotiationAction {
    fn name(&self) -> &'static str {
        "Renegotiation"
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

    fn run(&mut self, state: &mut State) -> Result<(), ActionError> {
        let alias = self.base.alias("Renegotiation")?;
        let ctx = state.context_mut(alias)?;
        ctx.tls.renegotiate(self.reset_last_verify_data);
        info!(alias, reset_verify_data = self.reset_last_verify_data, "renegotiation prepared");
        Ok(())
    }

    fn clear_observed(&mut self) {}

    fn outcome_as_planned(&self) -> bool {
        true
    }
}

/// Start over with null ciphers at epoch 0, then close and reopen the
/// transport. Negotiated values and buffered units survive. The connection
/// state is reset before the transport is touched, so a failed reopen leaves
/// null ciphers over a closed transport.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResetConnectionAction {
    #[serde(flatten)]
    pub base: ActionBase,
    #[serde(skip)]
    reopened: bool,
}

impl ResetConnectionAction {
    pub fn new(alias: impl Into<String>) -> Self {
        Self {
            base: ActionBase::new(alias),
            reopened: false,
        }
    }
}

impl TlsAction for ResetConnectionAction {
    fn name(&self) -> &'static str {
        "ResetConnection"
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

    fn run(&mut self, state: &mut State) -> Result<(), ActionError> {
        let alias = self.base.alias("ResetConnection")?;
        let ctx = state.context_mut(alias)?;
        if let Err(err) = ctx.reset_connection() {
            warn!(alias, "connection reset failed: {err}");
            return Err(err.into());
        }
        info!(alias, "connection reset");
        self.reopened = true;
        Ok(())
    }

    fn clear_observed(&mut self) {
        self.reopened = false;
    }

    fn outcome_as_planned(&self) -> bool {
        self.reopened
    }
}
