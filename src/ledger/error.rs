//! Error types for the processed-asset ledger.

use std::path::PathBuf;

use thiserror::Error;

/// Errors that can occur while persisting the ledger.
///
/// Callers treat every variant as "ledger unchanged": the in-memory set is
/// only updated after the file write succeeded.
#[derive(Error, Debug)]
pub enum LedgerError {
    /// Failed to append identifiers to the ledger file.
    #[error("Failed to append to ledger at {path}: {source}")]
    Append {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Failed to remove the ledger file during a reset.
    #[error("Failed to remove ledger at {path}: {source}")]
    Remove {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Failed to create the directory holding the ledger.
    #[error("Failed to create ledger directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        source: std::io::Error,
    },
}
