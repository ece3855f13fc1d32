//! Northbound data model for the Dragonflow MPLS controller.
//!
//! Entity types, field schemas and the registry that maps each entity kind
//! to its storage codec.

pub mod error;
pub mod field_types;
pub mod kinds;
pub mod models;
pub mod registry;
pub mod schema;

pub use error::{ConfigurationError, DecodeError, EncodeError};
pub use field_types::{MacAddress, ParseError, MAX_MPLS_LABEL};
pub use kinds::{EntityKind, EventKind};
pub use models::{
    Chassis, Entity, LocalLabeledRoute, LogicalPort, LogicalRouter, LogicalRouterPort,
    LogicalSwitch, RemoteLabeledRoute, Subnet,
};
pub use registry::{Codec, ModelEntry, ModelRegistry};
pub use schema::{FieldSpec, FieldType, Record, Schema};
