//! Workflow traces and their execution.
//!
//! A [`WorkflowTrace`] is an ordered list of [`Action`]s plus the connections
//! they run on. [`WorkflowExecutor`] drives a trace against a [`State`];
//! [`TraceSerializer`] persists it.

mod executor;
mod serializer;
mod state;

use serde::{Deserialize, Serialize};

use crate::action::{Action, Capability, TlsAction};
use crate::config::{AliasedConnection, Config};
use crate::message::{MessageKind, ProtocolMessage};

pub use executor::WorkflowExecutor;
pub use serializer::{TraceError, TraceSerializer};
pub use state::State;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkflowTrace {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub connections: Vec<AliasedConnection>,
    #[serde(default)]
    pub actions: Vec<Action>,
}

impl WorkflowTrace {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_connections(connections: Vec<AliasedConnection>) -> Self {
        Self {
            connections,
            ..Self::default()
        }
    }

    pub fn push(&mut self, action: impl Into<Action>) -> &mut Self {
        self.actions.push(action.into());
        self
    }

    pub fn add_connection(&mut self, connection: AliasedConnection) -> &mut Self {
        self.connections.push(connection);
        self
    }

    /// Make implicit aliases explicit: a trace without connections gets the
    /// configured default one, and in a single-connection trace every unset
    /// alias names that connection. Idempotent.
    pub fn normalize(&mut self, config: &Config) {
        if self.connections.is_empty() {
            self.connections.push(config.default_connection());
        }
        let [only] = self.connections.as_slice() else {
            return;
        };
        let alias = only.alias.clone();
        for action in &mut self.actions {
            for slot in action.alias_slots_mut() {
                if slot.is_none() {
                    *slot = Some(alias.clone());
                }
            }
        }
    }

    /// Inverse of [`normalize`](Self::normalize): drop aliases that name the
    /// only connection, and the connection itself if it is the default one.
    pub fn filter(&mut self, config: &Config) {
        let [only] = self.connections.as_slice() else {
            return;
        };
        let alias = only.alias.clone();
        let is_default = *only == config.default_connection();
        for action in &mut self.actions {
            for slot in action.alias_slots_mut() {
                if slot.as_deref() == Some(alias.as_str()) {
                    *slot = None;
                }
            }
        }
        if is_default {
            self.connections.clear();
        }
    }

    /// Every action back to not executed.
    pub fn reset_all(&mut self) {
        for action in &mut self.actions {
            action.reset();
        }
    }

    pub fn executed_as_planned(&self) -> bool {
        self.actions.iter().all(|a| a.executed_as_planned())
    }

    pub fn received_messages(&self) -> Vec<ProtocolMessage> {
        self.actions.iter().flat_map(|a| a.received_messages()).collect()
    }

    pub fn sent_messages(&self) -> Vec<ProtocolMessage> {
        self.actions.iter().flat_map(|a| a.sent_messages()).collect()
    }

    pub fn first_received_message(&self, kind: MessageKind) -> Option<ProtocolMessage> {
        self.actions
            .iter()
            .flat_map(|a| a.received_messages())
            .find(|m| m.kind == kind)
    }

    pub fn did_receive(&self, kind: MessageKind) -> bool {
        self.first_received_message(kind).is_some()
    }

    pub fn last_receiving_action(&self) -> Option<&Action> {
        self.actions
            .iter()
            .rev()
            .find(|a| a.has_capability(Capability::Receiving))
    }
}
