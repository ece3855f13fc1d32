//! Controller error types.

use std::fmt;

use df_model::{ConfigurationError, EntityKind, EventKind};
use df_nb::NbError;
use df_pipeline::DatapathError;
use thiserror::Error;

/// A single handler failed to process an event.
#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("datapath mutation failed after {attempts} attempts: {source}")]
    Datapath {
        attempts: u32,
        #[source]
        source: DatapathError,
    },

    #[error("northbound lookup failed: {0}")]
    Nb(#[from] NbError),

    /// Something the rule needs is not known locally.
    #[error("cannot resolve {0}")]
    Unresolved(String),

    #[error("unexpected payload for {kind} {event}")]
    UnexpectedPayload { kind: EntityKind, event: EventKind },
}

/// A handler failure with the subscription it happened in.
#[derive(Debug)]
pub struct HandlerFailure {
    pub handler: String,
    pub kind: EntityKind,
    pub event: EventKind,
    pub error: HandlerError,
}

impl fmt::Display for HandlerFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "handler '{}' failed on {} {}: {}",
            self.handler, self.kind, self.event, self.error
        )
    }
}

/// Every handler failure of one dispatch, in handler order.
#[derive(Debug, Error)]
#[error("{} handler(s) failed", .failures.len())]
pub struct DispatchError {
    pub failures: Vec<HandlerFailure>,
}

/// Invalid or unreadable configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {message}")]
    Parse { path: String, message: String },

    #[error("invalid value for {field}: {message}")]
    Invalid { field: String, message: String },
}

/// Errors that stop the controller.
#[derive(Debug, Error)]
pub enum ControllerError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Model(#[from] ConfigurationError),

    #[error(transparent)]
    Nb(#[from] NbError),

    #[error("app '{app}' failed to attach: {source}")]
    Attach {
        app: String,
        #[source]
        source: HandlerError,
    },
}

/// Result type for handler operations.
pub type Result<T> = std::result::Result<T, HandlerError>;
