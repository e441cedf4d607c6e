// 🚨 Import Errors - fatal conditions that abort a run
// Everything recoverable (soft fetch failures, bad rows, failed batches)
// is carried as a value in the stage reports instead.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for pipeline entry points
pub type ImportResult<T> = std::result::Result<T, ImportError>;

#[derive(Error, Debug)]
pub enum ImportError {
    /// Download failed and the ledger has no usable previous file
    #[error("no CSV available: {reason}")]
    NoCsvAvailable { reason: String },

    /// Backup or atomic replace failed while sanitizing
    #[error("failed to sanitize {}: {source:#}", path.display())]
    Sanitize {
        path: PathBuf,
        #[source]
        source: anyhow::Error,
    },

    /// Parsing or reconciliation aborted
    #[error("failed to process the CSV file: {0:#}")]
    Reconcile(#[source] anyhow::Error),

    #[error("ledger error: {0:#}")]
    Ledger(#[source] anyhow::Error),

    /// Catalog store could not be opened
    #[error("catalog store error: {0:#}")]
    Store(#[source] anyhow::Error),

    #[error("invalid configuration: {0}")]
    Config(String),

    /// Another run holds the lock for the same configuration
    #[error("an import is already running for configuration {0}")]
    AlreadyRunning(String),
}

impl ImportError {
    /// True for the "nothing to import" failure, reported apart from the rest
    pub fn is_no_csv(&self) -> bool {
        matches!(self, ImportError::NoCsvAvailable { .. })
    }
}
