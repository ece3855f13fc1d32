//! Model framework error types.

use thiserror::Error;

use crate::field_types::ParseError;
use crate::kinds::EntityKind;

/// A stored value could not be decoded into a valid entity.
///
/// Decode errors describe the record itself, so retrying the same bytes never
/// succeeds.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("{kind}: malformed record: {message}")]
    Malformed { kind: EntityKind, message: String },

    #[error("{kind}: record is not a structured object")]
    NotAnObject { kind: EntityKind },

    #[error("{kind}: missing required field '{field}'")]
    MissingField { kind: EntityKind, field: String },

    #[error("{kind}: field '{field}' expected {expected}")]
    TypeMismatch {
        kind: EntityKind,
        field: String,
        expected: &'static str,
    },

    #[error("{kind}: field '{field}': {source}")]
    InvalidValue {
        kind: EntityKind,
        field: String,
        #[source]
        source: ParseError,
    },

    #[error("{kind}: delimited record has {found} fields, expected {expected}")]
    FieldCount {
        kind: EntityKind,
        expected: usize,
        found: usize,
    },

    #[error("{kind}: record id '{record_id}' does not match key id '{key_id}'")]
    IdMismatch {
        kind: EntityKind,
        key_id: String,
        record_id: String,
    },

    #[error("{kind}: no model registered")]
    UnknownKind { kind: EntityKind },
}

/// An entity could not be encoded for the backend.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EncodeError {
    #[error("{kind}: field '{field}' contains the record delimiter '{delimiter}'")]
    DelimiterInValue {
        kind: EntityKind,
        field: String,
        delimiter: char,
    },

    #[error("{kind}: field '{field}' cannot be stored in a delimited record")]
    NotScalar { kind: EntityKind, field: String },

    #[error("{kind}: serialization failed: {message}")]
    Serialize { kind: EntityKind, message: String },

    #[error("{kind}: no model registered")]
    UnknownKind { kind: EntityKind },
}

/// The model registry was set up inconsistently. Fatal at startup.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigurationError {
    #[error("model '{0}' is already registered")]
    DuplicateKind(EntityKind),

    #[error("schema for '{kind}' has no id field '{id_field}'")]
    MissingIdField {
        kind: EntityKind,
        id_field: &'static str,
    },
}
