//! Northbound error types and error classification.

use df_model::{DecodeError, EncodeError, EntityKind};
use thiserror::Error;

/// Errors raised by a key-value backend.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BackendError {
    /// The backend call (or long-poll) ended without a result.
    #[error("backend request timed out")]
    Timeout,

    /// A local collaborator is not ready yet; the same work can be retried.
    #[error("not ready: {0}")]
    NotReady(String),

    /// The backend no longer retains history at the requested cursor.
    #[error("watch cursor expired, backend is at index {current_index}")]
    CursorExpired { current_index: u64 },

    /// A conditional write found a different modification index.
    #[error("compare-and-swap failed on '{key}'")]
    Conflict { key: String },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("protocol error: {0}")]
    Protocol(String),
}

/// Errors raised by the northbound API.
#[derive(Debug, Error)]
pub enum NbError {
    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error(transparent)]
    Encode(#[from] EncodeError),

    /// Fields supplied to `create`/`update` do not form a valid entity.
    #[error("invalid fields for {kind} '{id}': {source}")]
    InvalidFields {
        kind: EntityKind,
        id: String,
        #[source]
        source: DecodeError,
    },

    #[error("{kind} '{id}' not found")]
    NotFound { kind: EntityKind, id: String },

    /// A nested edit targeted a parent entity that does not exist.
    #[error("parent {kind} '{id}' does not exist")]
    MissingParent { kind: EntityKind, id: String },

    /// Compare-and-swap kept failing under concurrent writers.
    #[error("update of {kind} '{id}' conflicted {attempts} times")]
    UpdateConflict {
        kind: EntityKind,
        id: String,
        attempts: u32,
    },
}

/// Result type for northbound operations.
pub type Result<T> = std::result::Result<T, NbError>;

/// How the watch loop reacts to an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Log and retry from the unchanged cursor.
    Retryable,
    /// Recover with a full resynchronization.
    CursorExpired,
    /// Stop the loop and report the error.
    Fatal,
}

/// Classifies an error for the watch loop.
///
/// Only backend timeouts and not-ready conditions are retryable. Every other
/// error, including any variant added later, is fatal unless listed here.
pub fn classify(err: &NbError) -> ErrorClass {
    match err {
        NbError::Backend(BackendError::Timeout) | NbError::Backend(BackendError::NotReady(_)) => {
            ErrorClass::Retryable
        }
        NbError::Backend(BackendError::CursorExpired { .. }) => ErrorClass::CursorExpired,
        _ => ErrorClass::Fatal,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify() {
        assert_eq!(
            classify(&BackendError::Timeout.into()),
            ErrorClass::Retryable
        );
        assert_eq!(
            classify(&BackendError::NotReady("port tap0".into()).into()),
            ErrorClass::Retryable
        );
        assert_eq!(
            classify(&BackendError::CursorExpired { current_index: 9 }.into()),
            ErrorClass::CursorExpired
        );
        assert_eq!(
            classify(&BackendError::Transport("connection refused".into()).into()),
            ErrorClass::Fatal
        );
        assert_eq!(
            classify(&BackendError::Protocol("bad json".into()).into()),
            ErrorClass::Fatal
        );
    }

    #[test]
    fn test_decode_errors_are_not_retryable() {
        let err = NbError::Decode(DecodeError::NotAnObject {
            kind: EntityKind::LogicalPort,
        });
        assert_eq!(classify(&err), ErrorClass::Fatal);
    }
}
