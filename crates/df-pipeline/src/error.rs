//! Datapath error types.

use thiserror::Error;

/// A pipeline mutation was not applied.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DatapathError {
    #[error("datapath is not connected")]
    NotConnected,

    #[error("datapath rejected flow: {0}")]
    Rejected(String),

    #[error("datapath I/O error: {0}")]
    Io(String),
}

/// Result type for datapath operations.
pub type Result<T> = std::result::Result<T, DatapathError>;
