// ABOUTME: Classified error type for a replication run
// ABOUTME: Maps every failure onto the EXCEPTION / ERROR outcome persisted in the run status

use std::fmt;

use thiserror::Error;

use crate::status::RunOutcome;

/// Result type for replication runs.
pub type SyncResult<T> = Result<T, SyncError>;

/// Which end of the replication a failure happened on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Source,
    Destination,
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Source => f.write_str("source"),
            Side::Destination => f.write_str("destination"),
        }
    }
}

/// Errors that can end a replication run.
///
/// A column mismatch between source and destination is not an error; it
/// forces a retroactive run instead of aborting one.
#[derive(Error, Debug)]
pub enum SyncError {
    /// Profile missing, malformed, or inconsistent with the tables.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Could not open a connection.
    #[error("could not connect to {side} database: {error:#}")]
    Connectivity { side: Side, error: anyhow::Error },

    /// A read against an open connection failed.
    #[error("query against {side} database failed: {error:#}")]
    Query { side: Side, error: anyhow::Error },

    /// Applying changes failed; the destination transaction was rolled back.
    #[error("transaction rolled back: {0:#}")]
    Transaction(anyhow::Error),

    /// Internal state that must never occur, e.g. an incremental run without
    /// a previous successful timestamp.
    #[error("invariant violated: {0}")]
    InvariantViolation(String),

    /// The status store could not be read or written.
    #[error("status store failure: {0:#}")]
    Status(anyhow::Error),

    /// Anything not anticipated above.
    #[error("unexpected failure: {0:#}")]
    Unexpected(anyhow::Error),
}

impl SyncError {
    pub fn configuration(message: impl Into<String>) -> Self {
        SyncError::Configuration(message.into())
    }

    pub fn connectivity(side: Side, error: anyhow::Error) -> Self {
        SyncError::Connectivity { side, error }
    }

    pub fn query(side: Side, error: anyhow::Error) -> Self {
        SyncError::Query { side, error }
    }

    /// Outcome tag recorded in the run status for this failure.
    ///
    /// Classified failures are EXCEPTION; broken invariants and anything
    /// unanticipated are ERROR.
    pub fn outcome(&self) -> RunOutcome {
        match self {
            SyncError::Configuration(_)
            | SyncError::Connectivity { .. }
            | SyncError::Query { .. }
            | SyncError::Transaction(_)
            | SyncError::Status(_) => RunOutcome::Exception,
            SyncError::InvariantViolation(_) | SyncError::Unexpected(_) => RunOutcome::Error,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classified_errors_are_exceptions() {
        let errors = [
            SyncError::configuration("missing table"),
            SyncError::connectivity(Side::Source, anyhow::anyhow!("refused")),
            SyncError::query(Side::Destination, anyhow::anyhow!("syntax")),
            SyncError::Transaction(anyhow::anyhow!("deadlock")),
        ];
        for err in errors {
            assert_eq!(err.outcome(), RunOutcome::Exception, "{}", err);
        }
    }

    #[test]
    fn test_invariant_and_unexpected_are_errors() {
        assert_eq!(
            SyncError::InvariantViolation("no threshold".into()).outcome(),
            RunOutcome::Error
        );
        assert_eq!(
            SyncError::Unexpected(anyhow::anyhow!("boom")).outcome(),
            RunOutcome::Error
        );
    }

    #[test]
    fn test_display_includes_context_chain() {
        let source = anyhow::anyhow!("connection refused").context("Failed to connect");
        let err = SyncError::connectivity(Side::Destination, source);
        let text = err.to_string();
        assert!(text.contains("destination"));
        assert!(text.contains("Failed to connect"));
        assert!(text.contains("connection refused"));
    }
}
