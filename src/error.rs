//! Error types for the sync engine.
//!
//! [`SyncError`] is what crosses the engine's public API. Ledger failures
//! are wrapped as [`SyncError::SourceUnavailable`] with the operation that
//! was in flight; inside the poll loop they are logged rather than returned.

use crate::ledger::LedgerError;
use crate::types::TxHash;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SyncError {
    /// A ledger read or write failed.
    #[error("ledger unavailable during {operation}: {source}")]
    SourceUnavailable {
        operation: String,
        #[source]
        source: LedgerError,
    },

    /// No signing identity has been selected yet.
    #[error("no signing identity selected")]
    IdentityUnavailable,

    /// Hook pattern is not `Contract.Event` or `Contract.Event:field`.
    #[error("malformed hook pattern '{0}'")]
    MalformedHook(String),

    #[error("unknown model: {0}")]
    UnknownModel(String),

    #[error("model {model} has no {kind} named '{name}'")]
    UnknownMethod {
        model: String,
        kind: &'static str,
        name: String,
    },

    #[error("invalid model {model}: {reason}")]
    InvalidModel { model: String, reason: String },

    /// Watch registered without hook patterns while unhooked watches are rejected.
    #[error("watch has no hook patterns")]
    MissingHooks,

    /// The completion handle lost its sender (re-registered hash or engine shutdown).
    #[error("transaction {0:?} was dropped before completion")]
    TransactionDropped(TxHash),

    #[error("sync engine stopped")]
    EngineStopped,
}

impl SyncError {
    pub(crate) fn unavailable(operation: impl Into<String>, source: LedgerError) -> Self {
        Self::SourceUnavailable {
            operation: operation.into(),
            source,
        }
    }
}

pub type SyncResult<T> = Result<T, SyncError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unavailable_keeps_operation_and_cause() {
        let err = SyncError::unavailable("get_logs(Registry)", LedgerError::Rpc("timeout".into()));
        let msg = err.to_string();
        assert!(msg.contains("get_logs(Registry)"));
        assert!(msg.contains("timeout"));
        assert!(std::error::Error::source(&err).is_some());
    }
}
