//! Runtime state of a trace: the configuration and one context per
//! connection alias.

use tlscript_types::ConfigurationError;

use super::WorkflowTrace;
use crate::config::Config;
use crate::context::ConnectionContext;
use crate::transport::create_transport;

#[derive(Debug)]
pub struct State {
    config: Config,
    contexts: Vec<ConnectionContext>,
}

impl State {
    /// One context per connection of `trace`, each over the transport its
    /// connection definition asks for. Transports are not initialized yet.
    pub fn new(config: Config, trace: &WorkflowTrace) -> Result<Self, ConfigurationError> {
        let contexts = trace
            .connections
            .iter()
            .map(|conn| {
                let transport = create_transport(conn, config.receive_timeout);
                ConnectionContext::new(conn.clone(), &config, transport)
            })
            .collect();
        Self::with_contexts(config, contexts)
    }

    /// State over contexts built by the caller.
    pub fn with_contexts(
        config: Config,
        contexts: Vec<ConnectionContext>,
    ) -> Result<Self, ConfigurationError> {
        if contexts.is_empty() {
            return Err(ConfigurationError::NoConnections);
        }
        let mut state = Self {
            config,
            contexts: Vec::with_capacity(contexts.len()),
        };
        for ctx in contexts {
            state.add_context(ctx)?;
        }
        Ok(state)
    }

    pub fn add_context(&mut self, ctx: ConnectionContext) -> Result<(), ConfigurationError> {
        if ctx.alias().is_empty() {
            return Err(ConfigurationError::EmptyAlias("connection".into()));
        }
        if self.index_of(ctx.alias()).is_ok() {
            return Err(ConfigurationError::DuplicateAlias(ctx.alias().to_string()));
        }
        self.contexts.push(ctx);
        Ok(())
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn contexts(&self) -> &[ConnectionContext] {
        &self.contexts
    }

    pub fn contexts_mut(&mut self) -> &mut [ConnectionContext] {
        &mut self.contexts
    }

    fn index_of(&self, alias: &str) -> Result<usize, ConfigurationError> {
        self.contexts
            .iter()
            .position(|c| c.alias() == alias)
            .ok_or_else(|| ConfigurationError::UnknownAlias(alias.to_string()))
    }

    pub fn context(&self, alias: &str) -> Result<&ConnectionContext, ConfigurationError> {
        let i = self.index_of(alias)?;
        Ok(&self.contexts[i])
    }

    pub fn context_mut(&mut self, alias: &str) -> Result<&mut ConnectionContext, ConfigurationError> {
        let i = self.index_of(alias)?;
        Ok(&mut self.contexts[i])
    }

    /// Two distinct contexts borrowed at once, in argument order.
    pub fn context_pair_mut(
        &mut self,
        first: &str,
        second: &str,
    ) -> Result<(&mut ConnectionContext, &mut ConnectionContext), ConfigurationError> {
        if first == second {
            return Err(ConfigurationError::Invalid(format!(
                "alias {first} names both connections"
            )));
        }
        let i = self.index_of(first)?;
        let j = self.index_of(second)?;
        if i < j {
            let (low, high) = self.contexts.split_at_mut(j);
            Ok((&mut low[i], &mut high[0]))
        } else {
            let (low, high) = self.contexts.split_at_mut(i);
            Ok((&mut high[0], &mut low[j]))
        }
    }
}
