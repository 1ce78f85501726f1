//! Error types for fuzzing sessions

use thiserror::Error;
use uuid::Uuid;

use crate::model::SessionStatus;

#[derive(Debug, Error)]
pub enum FuzzError {
    #[error("unknown session {0}")]
    UnknownSession(Uuid),

    #[error("unknown anomaly {0}")]
    UnknownAnomaly(Uuid),

    #[error("unknown terminal {0}")]
    UnknownTerminal(String),

    #[error("unknown strategy {0}")]
    UnknownStrategy(String),

    #[error("unknown preset {0}")]
    UnknownPreset(String),

    #[error("terminal {0} is referenced by existing sessions")]
    TerminalInUse(String),

    #[error("session cannot move from {from} to {to}")]
    InvalidTransition { from: SessionStatus, to: SessionStatus },

    #[error("invalid preset {name}: {reason}")]
    InvalidPreset { name: String, reason: String },

    #[error("export I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
