//! The model registry.
//!
//! Maps every entity kind to its schema and storage codec. A registry is
//! built once at startup and shared by reference; there is no process-wide
//! instance.

use log::debug;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::error::{ConfigurationError, DecodeError, EncodeError};
use crate::kinds::EntityKind;
use crate::models::{
    builtin_schema, Chassis, Entity, LocalLabeledRoute, LogicalPort, LogicalRouter,
    LogicalSwitch, RemoteLabeledRoute,
};
use crate::schema::{Record, Schema};

/// How records of a kind are laid out in the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Codec {
    /// A JSON object.
    Json,
    /// Scalar fields in schema order, joined by a separator.
    Delimited { separator: char },
}

/// Registration of one entity kind.
#[derive(Debug, Clone, Copy)]
pub struct ModelEntry {
    pub kind: EntityKind,
    pub schema: &'static Schema,
    pub codec: Codec,
}

/// Registered entity kinds, in registration order.
#[derive(Debug, Default)]
pub struct ModelRegistry {
    entries: Vec<ModelEntry>,
}

impl ModelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry holding every built-in kind. Chassis use the delimited
    /// codec; everything else is stored as JSON.
    pub fn with_builtin_models() -> Result<Self, ConfigurationError> {
        let mut registry = Self::new();
        for kind in EntityKind::ALL {
            let codec = match kind {
                EntityKind::Chassis => Codec::Delimited { separator: ',' },
                _ => Codec::Json,
            };
            registry.register(kind, builtin_schema(kind), codec)?;
        }
        Ok(registry)
    }

    /// Registers a kind. Registering the same kind twice is a configuration
    /// error.
    pub fn register(
        &mut self,
        kind: EntityKind,
        schema: &'static Schema,
        codec: Codec,
    ) -> Result<(), ConfigurationError> {
        if self.entry(kind).is_some() {
            return Err(ConfigurationError::DuplicateKind(kind));
        }
        if schema.field(schema.id_field).is_none() {
            return Err(ConfigurationError::MissingIdField {
                kind,
                id_field: schema.id_field,
            });
        }
        debug!("Registered model {} ({:?})", kind, codec);
        self.entries.push(ModelEntry {
            kind,
            schema,
            codec,
        });
        Ok(())
    }

    pub fn entry(&self, kind: EntityKind) -> Option<&ModelEntry> {
        self.entries.iter().find(|e| e.kind == kind)
    }

    /// Registered kinds in registration order.
    pub fn kinds(&self) -> impl Iterator<Item = EntityKind> + '_ {
        self.entries.iter().map(|e| e.kind)
    }

    fn require(&self, kind: EntityKind) -> Result<&ModelEntry, DecodeError> {
        self.entry(kind).ok_or(DecodeError::UnknownKind { kind })
    }

    /// Parses raw stored bytes into an unvalidated record.
    pub fn raw_to_record(&self, kind: EntityKind, raw: &[u8]) -> Result<Record, DecodeError> {
        let entry = self.require(kind)?;
        let text = std::str::from_utf8(raw).map_err(|e| DecodeError::Malformed {
            kind,
            message: e.to_string(),
        })?;

        match entry.codec {
            Codec::Json => match serde_json::from_str::<Value>(text) {
                Ok(Value::Object(map)) => Ok(map),
                Ok(_) => Err(DecodeError::NotAnObject { kind }),
                Err(e) => Err(DecodeError::Malformed {
                    kind,
                    message: e.to_string(),
                }),
            },
            Codec::Delimited { separator } => {
                let parts: Vec<&str> = text.split(separator).collect();
                let fields = entry.schema.fields;
                if parts.len() != fields.len() {
                    return Err(DecodeError::FieldCount {
                        kind,
                        expected: fields.len(),
                        found: parts.len(),
                    });
                }
                Ok(fields
                    .iter()
                    .zip(parts)
                    .map(|(spec, part)| (spec.name.to_string(), Value::String(part.to_string())))
                    .collect())
            }
        }
    }

    /// Serializes a record into the kind's storage layout.
    pub fn record_to_raw(&self, kind: EntityKind, record: &Record) -> Result<Vec<u8>, EncodeError> {
        let entry = self
            .entry(kind)
            .ok_or(EncodeError::UnknownKind { kind })?;

        match entry.codec {
            Codec::Json => serde_json::to_vec(record).map_err(|e| EncodeError::Serialize {
                kind,
                message: e.to_string(),
            }),
            Codec::Delimited { separator } => {
                let mut columns = Vec::with_capacity(entry.schema.fields.len());
                for spec in entry.schema.fields {
                    if !spec.ty.is_scalar() {
                        return Err(EncodeError::NotScalar {
                            kind,
                            field: spec.name.to_string(),
                        });
                    }
                    let column = match record.get(spec.name) {
                        None | Some(Value::Null) => String::new(),
                        Some(Value::String(s)) => s.clone(),
                        Some(other) => other.to_string(),
                    };
                    if column.contains(separator) {
                        return Err(EncodeError::DelimiterInValue {
                            kind,
                            field: spec.name.to_string(),
                            delimiter: separator,
                        });
                    }
                    columns.push(column);
                }
                Ok(columns.join(&separator.to_string()).into_bytes())
            }
        }
    }

    /// Parses and validates raw bytes into a normalized record.
    pub fn decode_record(&self, kind: EntityKind, raw: &[u8]) -> Result<Record, DecodeError> {
        let record = self.raw_to_record(kind, raw)?;
        self.require(kind)?.schema.validate(kind, record)
    }

    /// Decodes raw bytes into a typed entity.
    pub fn decode(&self, kind: EntityKind, raw: &[u8]) -> Result<Entity, DecodeError> {
        let record = self.decode_record(kind, raw)?;
        entity_from_record(kind, record)
    }

    /// Converts an entity into its validated record form.
    pub fn to_record(&self, entity: &Entity) -> Result<Record, EncodeError> {
        let kind = entity.kind();
        let value = match entity {
            Entity::Chassis(v) => to_value(kind, v),
            Entity::LogicalSwitch(v) => to_value(kind, v),
            Entity::LogicalPort(v) => to_value(kind, v),
            Entity::LogicalRouter(v) => to_value(kind, v),
            Entity::LocalLabeledRoute(v) => to_value(kind, v),
            Entity::RemoteLabeledRoute(v) => to_value(kind, v),
        }?;
        match value {
            Value::Object(map) => Ok(map),
            _ => Err(EncodeError::Serialize {
                kind,
                message: "entity did not serialize to an object".to_string(),
            }),
        }
    }

    /// Encodes an entity into raw stored bytes.
    pub fn encode(&self, entity: &Entity) -> Result<Vec<u8>, EncodeError> {
        let record = self.to_record(entity)?;
        self.record_to_raw(entity.kind(), &record)
    }
}

fn to_value<T: Serialize>(kind: EntityKind, value: &T) -> Result<Value, EncodeError> {
    serde_json::to_value(value).map_err(|e| EncodeError::Serialize {
        kind,
        message: e.to_string(),
    })
}

fn from_record<T: DeserializeOwned>(kind: EntityKind, record: Record) -> Result<T, DecodeError> {
    serde_json::from_value(Value::Object(record)).map_err(|e| DecodeError::Malformed {
        kind,
        message: e.to_string(),
    })
}

/// Builds a typed entity from a validated record.
pub fn entity_from_record(kind: EntityKind, record: Record) -> Result<Entity, DecodeError> {
    Ok(match kind {
        EntityKind::Chassis => Entity::Chassis(from_record::<Chassis>(kind, record)?),
        EntityKind::LogicalSwitch => {
            Entity::LogicalSwitch(from_record::<LogicalSwitch>(kind, record)?)
        }
        EntityKind::LogicalPort => Entity::LogicalPort(from_record::<LogicalPort>(kind, record)?),
        EntityKind::LogicalRouter => {
            Entity::LogicalRouter(from_record::<LogicalRouter>(kind, record)?)
        }
        EntityKind::LocalLabeledRoute => {
            Entity::LocalLabeledRoute(from_record::<LocalLabeledRoute>(kind, record)?)
        }
        EntityKind::RemoteLabeledRoute => {
            Entity::RemoteLabeledRoute(from_record::<RemoteLabeledRoute>(kind, record)?)
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::field_types::ParseError;
    use crate::models::CHASSIS_SCHEMA;
    use pretty_assertions::assert_eq;

    fn registry() -> ModelRegistry {
        ModelRegistry::with_builtin_models().unwrap()
    }

    #[test]
    fn test_builtin_registration_order() {
        let kinds: Vec<_> = registry().kinds().collect();
        assert_eq!(kinds, EntityKind::ALL.to_vec());
    }

    #[test]
    fn test_duplicate_registration_is_rejected() {
        let mut registry = registry();
        let err = registry
            .register(EntityKind::Chassis, &CHASSIS_SCHEMA, Codec::Json)
            .unwrap_err();
        assert_eq!(err, ConfigurationError::DuplicateKind(EntityKind::Chassis));
    }

    #[test]
    fn test_missing_id_field_is_rejected() {
        static NO_ID: Schema = Schema {
            id_field: "uuid",
            fields: &[],
        };
        let mut registry = ModelRegistry::new();
        assert_eq!(
            registry.register(EntityKind::Chassis, &NO_ID, Codec::Json),
            Err(ConfigurationError::MissingIdField {
                kind: EntityKind::Chassis,
                id_field: "uuid"
            })
        );
    }

    #[test]
    fn test_chassis_round_trip() {
        let registry = registry();
        let cases = [
            ("node-1", "192.0.2.10", "vxlan"),
            ("node-2", "2001:db8::1", "geneve"),
            ("node-3", "192.0.2.11", ""),
        ];
        for (name, ip, tunnel_type) in cases {
            let raw = format!("{name},{ip},{tunnel_type}");
            let entity = registry
                .decode(EntityKind::Chassis, raw.as_bytes())
                .unwrap();
            assert_eq!(
                entity,
                Entity::Chassis(Chassis {
                    name: name.to_string(),
                    ip: ip.parse().unwrap(),
                    tunnel_type: tunnel_type.to_string(),
                })
            );
            assert_eq!(registry.encode(&entity).unwrap(), raw.into_bytes(), "{name}");
        }
    }

    #[test]
    fn test_chassis_field_count() {
        let err = registry()
            .decode(EntityKind::Chassis, b"node-1,192.0.2.10")
            .unwrap_err();
        assert_eq!(
            err,
            DecodeError::FieldCount {
                kind: EntityKind::Chassis,
                expected: 3,
                found: 2
            }
        );
    }

    #[test]
    fn test_chassis_delimiter_in_value() {
        let chassis = Entity::Chassis(Chassis {
            name: "node,1".to_string(),
            ip: "192.0.2.10".parse().unwrap(),
            tunnel_type: "vxlan".to_string(),
        });
        assert_eq!(
            registry().encode(&chassis),
            Err(EncodeError::DelimiterInValue {
                kind: EntityKind::Chassis,
                field: "name".to_string(),
                delimiter: ',',
            })
        );
    }

    #[test]
    fn test_decode_logical_port() {
        let raw = br#"{"name": "p1", "lswitch": "sw1", "tunnel_key": "5",
                      "macs": ["FA:16:3E:00:00:01"], "ips": ["10.0.0.5"], "chassis": "node-1"}"#;
        let entity = registry().decode(EntityKind::LogicalPort, raw).unwrap();
        let Entity::LogicalPort(port) = entity else {
            panic!("expected a logical port");
        };
        assert_eq!(port.id, "p1");
        assert_eq!(port.tunnel_key, 5);
        assert_eq!(port.mac().unwrap().to_string(), "fa:16:3e:00:00:01");
        assert_eq!(port.chassis.as_deref(), Some("node-1"));
        assert_eq!(port.device_owner, None);
    }

    #[test]
    fn test_decode_switch_with_subnets() {
        let raw = br#"{"name": "sw1", "unique_key": 3,
                      "subnets": [{"id": "s1", "cidr": "10.0.0.0/24", "gateway_ip": "10.0.0.1"}]}"#;
        let Entity::LogicalSwitch(switch) =
            registry().decode(EntityKind::LogicalSwitch, raw).unwrap()
        else {
            panic!("expected a logical switch");
        };
        assert_eq!(switch.unique_key, 3);
        assert_eq!(switch.subnets.len(), 1);
        assert!(!switch.subnets[0].dhcp_enabled);
        assert_eq!(
            switch.subnets[0].gateway_ip,
            Some("10.0.0.1".parse().unwrap())
        );
    }

    #[test]
    fn test_decode_rejects_bad_label() {
        let raw = br#"{"id": "r1", "dest_ip": "10.0.0.0/24", "port": "p1", "label": 2000000}"#;
        assert_eq!(
            registry().decode(EntityKind::LocalLabeledRoute, raw),
            Err(DecodeError::InvalidValue {
                kind: EntityKind::LocalLabeledRoute,
                field: "label".to_string(),
                source: ParseError::InvalidMplsLabel(2_000_000),
            })
        );
    }

    #[test]
    fn test_decode_rejects_non_object() {
        assert_eq!(
            registry().decode(EntityKind::LogicalRouter, b"[1, 2]"),
            Err(DecodeError::NotAnObject {
                kind: EntityKind::LogicalRouter
            })
        );
        assert!(matches!(
            registry().decode(EntityKind::LogicalRouter, b"{not json"),
            Err(DecodeError::Malformed { .. })
        ));
    }

    #[test]
    fn test_unknown_kind() {
        let registry = ModelRegistry::new();
        assert_eq!(
            registry.decode(EntityKind::LogicalPort, b"{}"),
            Err(DecodeError::UnknownKind {
                kind: EntityKind::LogicalPort
            })
        );
    }
}
