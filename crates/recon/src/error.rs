use thiserror::Error;

use crate::lock::RunKey;
use crate::model::GroupId;
use crate::run::RunState;

/// Failure reported by an external store (ledger or statement persistence).
#[derive(Debug, Clone, Error)]
#[error("{0}")]
pub struct StoreError(pub String);

impl StoreError {
    pub fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }
}

#[derive(Debug, Error)]
pub enum ReconError {
    /// TOML parse / deserialization error.
    #[error("config parse error: {0}")]
    ConfigParse(String),
    /// Config validation error (bad tolerance, empty fee marker, etc.).
    #[error("config validation error: {0}")]
    ConfigValidation(String),
    /// Missing card, malformed bill month, and similar request errors.
    #[error("invalid input: {0}")]
    InvalidInput(String),
    /// Another run already holds the (card, month) slot.
    #[error("run already active for {key} (held by '{holder}')")]
    RunConflict { key: RunKey, holder: String },
    /// A run phase was requested out of order.
    #[error("cannot {action} while run is {from}")]
    InvalidTransition { from: RunState, action: &'static str },
    /// A collected line belongs to a different (card, month).
    #[error("statement line '{line_id}' is outside run {key}")]
    LineOutOfScope { line_id: String, key: RunKey },
    #[error("unknown candidate group: {0}")]
    UnknownGroup(GroupId),
    #[error("candidate group already consumed: {0}")]
    GroupConsumed(GroupId),
    /// Ledger or statement store failure.
    #[error("collaborator I/O error: {0}")]
    CollaboratorIo(#[from] StoreError),
}
