//! Field schemas and record validation.
//!
//! A [`Schema`] is a static list of [`FieldSpec`]s. Validation walks a raw
//! record, checks presence and type of every declared field, fills defaults,
//! and rewrites parsed values into their canonical string form. Fields that
//! the schema does not declare are carried through untouched so that records
//! written by newer peers survive a read-modify-write cycle.

use serde_json::{Map, Number, Value};

use crate::error::DecodeError;
use crate::field_types::{check_mpls_label, parse_ip_address, parse_ip_network, MacAddress};
use crate::kinds::EntityKind;

/// A stored record: field name to raw value.
pub type Record = Map<String, Value>;

/// Type of a schema field.
#[derive(Debug, Clone, Copy)]
pub enum FieldType {
    /// Unsigned integer. Numeric strings are accepted and normalized.
    Int,
    Str,
    Bool,
    IpAddress,
    /// CIDR network; bare addresses are rejected.
    IpNetwork,
    MacAddress,
    /// Integer within the 20-bit MPLS label range.
    MplsLabel,
    List(&'static FieldType),
    Record(&'static [FieldSpec]),
}

impl FieldType {
    fn expected(&self) -> &'static str {
        match self {
            FieldType::Int => "an integer",
            FieldType::Str => "a string",
            FieldType::Bool => "a boolean",
            FieldType::IpAddress => "an IP address string",
            FieldType::IpNetwork => "a CIDR string",
            FieldType::MacAddress => "a MAC address string",
            FieldType::MplsLabel => "an MPLS label",
            FieldType::List(_) => "a list",
            FieldType::Record(_) => "an object",
        }
    }

    /// True for types that fit in a single delimited column.
    pub fn is_scalar(&self) -> bool {
        !matches!(self, FieldType::List(_) | FieldType::Record(_))
    }
}

/// Value filled in when an optional field is absent.
#[derive(Debug, Clone, Copy)]
pub enum DefaultValue {
    Int(u64),
    Str(&'static str),
    Bool(bool),
    EmptyList,
}

impl DefaultValue {
    fn to_value(self) -> Value {
        match self {
            DefaultValue::Int(n) => Value::Number(n.into()),
            DefaultValue::Str(s) => Value::String(s.to_string()),
            DefaultValue::Bool(b) => Value::Bool(b),
            DefaultValue::EmptyList => Value::Array(Vec::new()),
        }
    }
}

/// Declaration of one field.
#[derive(Debug, Clone, Copy)]
pub struct FieldSpec {
    pub name: &'static str,
    pub ty: FieldType,
    pub required: bool,
    pub default: Option<DefaultValue>,
}

impl FieldSpec {
    pub const fn required(name: &'static str, ty: FieldType) -> Self {
        Self {
            name,
            ty,
            required: true,
            default: None,
        }
    }

    pub const fn optional(name: &'static str, ty: FieldType) -> Self {
        Self {
            name,
            ty,
            required: false,
            default: None,
        }
    }

    pub const fn with_default(name: &'static str, ty: FieldType, default: DefaultValue) -> Self {
        Self {
            name,
            ty,
            required: false,
            default: Some(default),
        }
    }
}

/// Field schema of one entity kind.
#[derive(Debug)]
pub struct Schema {
    /// Field holding the entity id (the last segment of its store key).
    pub id_field: &'static str,
    pub fields: &'static [FieldSpec],
}

impl Schema {
    pub fn field(&self, name: &str) -> Option<&FieldSpec> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Validates and normalizes a record in place.
    pub fn validate(&self, kind: EntityKind, record: Record) -> Result<Record, DecodeError> {
        validate_fields(kind, self.fields, record, "")
    }
}

fn validate_fields(
    kind: EntityKind,
    fields: &[FieldSpec],
    mut record: Record,
    prefix: &str,
) -> Result<Record, DecodeError> {
    for spec in fields {
        let path = format!("{}{}", prefix, spec.name);
        match record.remove(spec.name) {
            Some(Value::Null) | None => {
                if spec.required {
                    return Err(DecodeError::MissingField { kind, field: path });
                }
                if let Some(default) = spec.default {
                    record.insert(spec.name.to_string(), default.to_value());
                }
            }
            Some(value) => {
                let value = validate_value(kind, &spec.ty, value, &path)?;
                record.insert(spec.name.to_string(), value);
            }
        }
    }
    Ok(record)
}

fn validate_value(
    kind: EntityKind,
    ty: &FieldType,
    value: Value,
    path: &str,
) -> Result<Value, DecodeError> {
    let mismatch = || DecodeError::TypeMismatch {
        kind,
        field: path.to_string(),
        expected: ty.expected(),
    };
    let invalid = |source| DecodeError::InvalidValue {
        kind,
        field: path.to_string(),
        source,
    };

    match ty {
        FieldType::Int => as_u64(&value).map(|n| Value::Number(n.into())).ok_or_else(mismatch),
        FieldType::MplsLabel => {
            let n = as_u64(&value).ok_or_else(mismatch)?;
            let label = check_mpls_label(n).map_err(invalid)?;
            Ok(Value::Number(Number::from(label)))
        }
        FieldType::Str => match value {
            Value::String(_) => Ok(value),
            _ => Err(mismatch()),
        },
        FieldType::Bool => match value {
            Value::Bool(_) => Ok(value),
            _ => Err(mismatch()),
        },
        FieldType::IpAddress => {
            let s = value.as_str().ok_or_else(mismatch)?;
            let ip = parse_ip_address(s).map_err(invalid)?;
            Ok(Value::String(ip.to_string()))
        }
        FieldType::IpNetwork => {
            let s = value.as_str().ok_or_else(mismatch)?;
            let net = parse_ip_network(s).map_err(invalid)?;
            Ok(Value::String(net.to_string()))
        }
        FieldType::MacAddress => {
            let s = value.as_str().ok_or_else(mismatch)?;
            let mac: MacAddress = s.parse().map_err(invalid)?;
            Ok(Value::String(mac.to_string()))
        }
        FieldType::List(inner) => match value {
            Value::Array(items) => items
                .into_iter()
                .enumerate()
                .map(|(i, item)| validate_value(kind, inner, item, &format!("{}[{}]", path, i)))
                .collect::<Result<Vec<_>, _>>()
                .map(Value::Array),
            _ => Err(mismatch()),
        },
        FieldType::Record(fields) => match value {
            Value::Object(map) => {
                validate_fields(kind, fields, map, &format!("{}.", path)).map(Value::Object)
            }
            _ => Err(mismatch()),
        },
    }
}

// Legacy writers stored integers as strings; both forms are accepted.
fn as_u64(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}
