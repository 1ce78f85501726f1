//! Error types for card communication and analysis

use std::time::Duration;

use thiserror::Error;

use crate::workflow::WorkflowState;

/// Failure to get any response out of the card
///
/// Only these abort a workflow. A card answering with an error status word is
/// not a transport error.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("card disconnected")]
    Disconnected,

    #[error("no response within {0:?}")]
    Timeout(Duration),

    #[error("no response from card")]
    NoResponse,

    #[error("response of {0} byte(s) has no status word")]
    ShortResponse(usize),

    #[error("workflow cancelled")]
    Cancelled,

    #[error("reader frame error: {0}")]
    Frame(String),

    #[error("{length} bytes of command data exceed the {limit}-byte length field")]
    CommandTooLong { length: usize, limit: usize },

    #[error("mock transport has no response for {0}")]
    ScriptExhausted(String),

    #[error("PC/SC error: {0}")]
    Pcsc(#[from] pcsc::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl TransportError {
    /// The card went away rather than failing one exchange
    pub fn is_disconnect(&self) -> bool {
        matches!(
            self,
            TransportError::Disconnected
                | TransportError::Pcsc(pcsc::Error::RemovedCard)
                | TransportError::Pcsc(pcsc::Error::ResetCard)
                | TransportError::Pcsc(pcsc::Error::NoSmartcard)
        )
    }
}

/// Reasons a workflow ended in the `Failed` state
#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error("transport failure during {state:?}: {source}")]
    Transport {
        state: WorkflowState,
        #[source]
        source: TransportError,
    },

    #[error("workflow cancelled during {state:?}")]
    Cancelled { state: WorkflowState },

    #[error("overall deadline of {deadline:?} exceeded during {state:?}")]
    DeadlineExceeded {
        state: WorkflowState,
        deadline: Duration,
    },

    #[error("workflow already finished in state {0:?}")]
    Finished(WorkflowState),
}

/// Security analysis could not be applied to the data at hand
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AnalysisError {
    #[error("modulus is zero")]
    NonPositiveModulus,

    #[error("no public key available: {0}")]
    NoPublicKey(String),

    #[error("certificate recovery failed: {0}")]
    Certificate(String),
}

/// Reader configuration that cannot be loaded
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid {field}: {reason}")]
    Invalid { field: String, reason: String },
}
