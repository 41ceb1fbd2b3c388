//! Sequential execution of a workflow trace.

use tlscript_types::{ErrorClass, WorkflowError};
use tracing::{debug, info, warn};

use super::{State, WorkflowTrace};
use crate::action::TlsAction;
use crate::config::Config;

/// Runs the actions of a trace one after another against one [`State`].
///
/// Configuration and execution errors abort the trace. A transport failure
/// aborts it unless the action absorbed it. The configuration decides
/// whether a fatal alert, an absorbed transport failure or an action that
/// did not go as planned also stops the remaining actions.
#[derive(Debug)]
pub struct WorkflowExecutor {
    state: State,
}

impl WorkflowExecutor {
    /// Normalize `trace` and create a context for each of its connections.
    pub fn new(config: Config, trace: &mut WorkflowTrace) -> Result<Self, WorkflowError> {
        trace.normalize(&config);
        let state = State::new(config, trace)?;
        Ok(Self { state })
    }

    pub fn from_state(state: State) -> Self {
        Self { state }
    }

    pub fn state(&self) -> &State {
        &self.state
    }

    pub fn state_mut(&mut self) -> &mut State {
        &mut self.state
    }

    pub fn into_state(self) -> State {
        self.state
    }

    /// Initialize every transport, run the actions in order and close the
    /// transports again, whether the actions succeeded or not.
    pub fn execute(&mut self, trace: &mut WorkflowTrace) -> Result<(), WorkflowError> {
        for ctx in self.state.contexts_mut() {
            ctx.initialize_transport()?;
        }
        let outcome = self.execute_actions(trace);
        for ctx in self.state.contexts_mut() {
            if let Err(err) = ctx.transport.close_connection() {
                warn!(alias = ctx.alias(), "closing transport failed: {err}");
            }
        }
        outcome
    }

    /// Run the actions without touching the transports' lifecycle.
    pub fn execute_actions(&mut self, trace: &mut WorkflowTrace) -> Result<(), WorkflowError> {
        let total = trace.actions.len();
        for (index, action) in trace.actions.iter_mut().enumerate() {
            if let Some(reason) = self.stop_reason() {
                info!(index, total, "stopping trace: {reason}");
                break;
            }
            debug!(index, action = action.name(), "executing action");
            if let Err(source) = action.execute(&mut self.state) {
                match source.class() {
                    ErrorClass::Configuration => warn!(index, "configuration error: {source}"),
                    _ => warn!(index, action = action.name(), "action failed: {source}"),
                }
                return Err(WorkflowError::Action {
                    index,
                    action: action.name(),
                    source,
                });
            }
            if self.state.config().stop_trace_after_unexpected && !action.executed_as_planned() {
                info!(index, action = action.name(), "stopping trace after unexpected result");
                break;
            }
        }
        Ok(())
    }

    fn stop_reason(&self) -> Option<&'static str> {
        let config = self.state.config();
        let contexts = self.state.contexts();
        if config.stop_actions_after_fatal && contexts.iter().any(|c| c.tls.received_fatal_alert) {
            return Some("fatal alert received");
        }
        if config.stop_actions_after_io_exception && contexts.iter().any(|c| c.tls.transport_failed) {
            return Some("transport failed");
        }
        None
    }
}
