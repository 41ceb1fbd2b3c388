/// Which propagation class an error belongs to.
///
/// The executor uses this to decide whether a failure aborts the trace,
/// is absorbed by `MAY_FAIL`, or is handled by the action itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    ActionExecution,
    Configuration,
    Transport,
}

/// Transport (I/O) failures.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("transport not initialized")]
    NotInitialized,
    #[error("connection closed by peer")]
    ConnectionClosed,
    #[error("transport failure: {0}")]
    Failed(String),
}

/// Misconfigured traces or actions. Always aborts execution.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigurationError {
    #[error("{0}: connection alias is not set")]
    MissingAlias(String),
    #[error("{0}: connection alias is empty")]
    EmptyAlias(String),
    #[error("unknown connection alias: {0}")]
    UnknownAlias(String),
    #[error("duplicate connection alias: {0}")]
    DuplicateAlias(String),
    #[error("workflow trace defines no connections")]
    NoConnections,
    #[error("unknown context field: {0}")]
    UnknownField(String),
    #[error("field {field} does not accept a value of kind {found}")]
    IncompatibleValue { field: String, found: String },
    #[error("layer {0} cannot be created")]
    UnsupportedLayer(String),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Record protection and key derivation failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CryptoError {
    #[error("unsupported cipher suite: 0x{0:04x}")]
    UnsupportedSuite(u16),
    #[error("invalid key length: expected {expected}, got {got}")]
    InvalidKeyLength { expected: usize, got: usize },
    #[error("invalid iv length")]
    InvalidIvLength,
    #[error("key derivation failed")]
    KeyDerivation,
    #[error("aead: encryption failed")]
    EncryptFailed,
    #[error("aead: tag verification failed")]
    AeadTagVerifyFail,
    #[error("record: {0}")]
    Record(String),
}

/// Wire-format parse and serialization failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    #[error("incomplete {what}: need {need} bytes, got {got}")]
    Incomplete {
        what: &'static str,
        need: usize,
        got: usize,
    },
    #[error("invalid {what}: {value}")]
    InvalidValue { what: &'static str, value: u64 },
    #[error("length field overflow: {0}")]
    LengthOverflow(&'static str),
    #[error("decode: {0}")]
    Malformed(String),
}

impl CodecError {
    pub fn incomplete(what: &'static str, need: usize, got: usize) -> Self {
        CodecError::Incomplete { what, need, got }
    }

    /// True when more input could complete the unit.
    pub fn is_incomplete(&self) -> bool {
        matches!(self, CodecError::Incomplete { .. })
    }
}

/// Errors raised while executing an action.
#[derive(Debug, thiserror::Error)]
pub enum ActionError {
    #[error("action {0} has already been executed")]
    AlreadyExecuted(&'static str),
    #[error("action {action} requires units that are absent: {what}")]
    MissingUnits {
        action: &'static str,
        what: &'static str,
    },
    #[error("buffer is empty")]
    EmptyBuffer,
    #[error("buffer index {index} out of range (len {len})")]
    IndexOutOfRange { index: usize, len: usize },
    #[error("layer {layer}: {reason}")]
    Layer { layer: &'static str, reason: String },
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Crypto(#[from] CryptoError),
    #[error(transparent)]
    Codec(#[from] CodecError),
}

impl ActionError {
    pub fn layer(layer: &'static str, reason: impl Into<String>) -> Self {
        ActionError::Layer {
            layer,
            reason: reason.into(),
        }
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            ActionError::Configuration(_) => ErrorClass::Configuration,
            ActionError::Transport(_) => ErrorClass::Transport,
            _ => ErrorClass::ActionExecution,
        }
    }

    pub fn is_transport(&self) -> bool {
        self.class() == ErrorClass::Transport
    }
}

/// A failure that stopped a workflow trace.
#[derive(Debug, thiserror::Error)]
pub enum WorkflowError {
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("action #{index} ({action}) failed: {source}")]
    Action {
        index: usize,
        action: &'static str,
        #[source]
        source: ActionError,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_class() {
        let err: ActionError = ConfigurationError::UnknownAlias("mitm".into()).into();
        assert_eq!(err.class(), ErrorClass::Configuration);

        let err: ActionError = TransportError::ConnectionClosed.into();
        assert!(err.is_transport());

        let err = ActionError::EmptyBuffer;
        assert_eq!(err.class(), ErrorClass::ActionExecution);

        let err: ActionError = CryptoError::AeadTagVerifyFail.into();
        assert_eq!(err.class(), ErrorClass::ActionExecution);
    }

    #[test]
    fn test_error_display() {
        let err = ActionError::IndexOutOfRange { index: 4, len: 2 };
        assert_eq!(err.to_string(), "buffer index 4 out of range (len 2)");

        let err = CodecError::incomplete("record header", 5, 3);
        assert!(err.is_incomplete());
        assert_eq!(
            err.to_string(),
            "incomplete record header: need 5 bytes, got 3"
        );

        let err = CryptoError::UnsupportedSuite(0x1304);
        assert_eq!(err.to_string(), "unsupported cipher suite: 0x1304");
    }

    #[test]
    fn test_workflow_error_source() {
        use std::error::Error;
        let err = WorkflowError::Action {
            index: 3,
            action: "PopAndSend",
            source: ActionError::EmptyBuffer,
        };
        assert_eq!(err.to_string(), "action #3 (PopAndSend) failed: buffer is empty");
        assert!(err.source().is_some());
    }
}
