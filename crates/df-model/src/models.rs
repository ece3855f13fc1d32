//! Northbound entities and their schemas.
//!
//! Relationships between entities are carried as ids (`lswitch`, `port`,
//! `helper_port`) and resolved by explicit lookups against the store. No
//! entity embeds another addressable entity; subnets and router ports are
//! owned records embedded in their parent.

use std::collections::BTreeMap;
use std::net::IpAddr;

use ipnet::IpNet;
use serde::{Deserialize, Serialize};

use crate::field_types::MacAddress;
use crate::kinds::EntityKind;
use crate::schema::{DefaultValue, FieldSpec, FieldType, Schema};

// ---------------------------------------------------------------------------
// Schemas
// ---------------------------------------------------------------------------

const SUBNET_FIELDS: &[FieldSpec] = &[
    FieldSpec::required("id", FieldType::Str),
    FieldSpec::required("cidr", FieldType::IpNetwork),
    FieldSpec::optional("gateway_ip", FieldType::IpAddress),
    FieldSpec::with_default("enable_dhcp", FieldType::Bool, DefaultValue::Bool(false)),
    FieldSpec::optional("dhcp_ip", FieldType::IpAddress),
];
const SUBNET_RECORD: FieldType = FieldType::Record(SUBNET_FIELDS);
const SUBNET_LIST: FieldType = FieldType::List(&SUBNET_RECORD);

const ROUTER_PORT_FIELDS: &[FieldSpec] = &[
    FieldSpec::required("name", FieldType::Str),
    FieldSpec::required("lswitch", FieldType::Str),
    FieldSpec::required("mac", FieldType::MacAddress),
    FieldSpec::required("network", FieldType::IpNetwork),
    FieldSpec::required("tunnel_key", FieldType::Int),
];
const ROUTER_PORT_RECORD: FieldType = FieldType::Record(ROUTER_PORT_FIELDS);
const ROUTER_PORT_LIST: FieldType = FieldType::List(&ROUTER_PORT_RECORD);

const MAC_LIST: FieldType = FieldType::List(&FieldType::MacAddress);
const IP_LIST: FieldType = FieldType::List(&FieldType::IpAddress);

/// `name,ip,tunnel_type`
pub static CHASSIS_SCHEMA: Schema = Schema {
    id_field: "name",
    fields: &[
        FieldSpec::required("name", FieldType::Str),
        FieldSpec::required("ip", FieldType::IpAddress),
        FieldSpec::required("tunnel_type", FieldType::Str),
    ],
};

pub static LOGICAL_SWITCH_SCHEMA: Schema = Schema {
    id_field: "name",
    fields: &[
        FieldSpec::required("name", FieldType::Str),
        FieldSpec::required("unique_key", FieldType::Int),
        FieldSpec::with_default("subnets", SUBNET_LIST, DefaultValue::EmptyList),
    ],
};

pub static LOGICAL_PORT_SCHEMA: Schema = Schema {
    id_field: "name",
    fields: &[
        FieldSpec::required("name", FieldType::Str),
        FieldSpec::required("lswitch", FieldType::Str),
        FieldSpec::required("tunnel_key", FieldType::Int),
        FieldSpec::with_default("macs", MAC_LIST, DefaultValue::EmptyList),
        FieldSpec::with_default("ips", IP_LIST, DefaultValue::EmptyList),
        FieldSpec::optional("chassis", FieldType::Str),
        FieldSpec::optional("device_owner", FieldType::Str),
    ],
};

pub static LOGICAL_ROUTER_SCHEMA: Schema = Schema {
    id_field: "name",
    fields: &[
        FieldSpec::required("name", FieldType::Str),
        FieldSpec::with_default("ports", ROUTER_PORT_LIST, DefaultValue::EmptyList),
    ],
};

pub static LOCAL_LABELED_ROUTE_SCHEMA: Schema = Schema {
    id_field: "id",
    fields: &[
        FieldSpec::required("id", FieldType::Str),
        FieldSpec::required("dest_ip", FieldType::IpNetwork),
        FieldSpec::required("port", FieldType::Str),
        FieldSpec::required("label", FieldType::MplsLabel),
    ],
};

pub static REMOTE_LABELED_ROUTE_SCHEMA: Schema = Schema {
    id_field: "id",
    fields: &[
        FieldSpec::required("id", FieldType::Str),
        FieldSpec::required("destination", FieldType::IpNetwork),
        FieldSpec::required("nexthop", FieldType::IpAddress),
        FieldSpec::required("label", FieldType::MplsLabel),
        FieldSpec::required("helper_port", FieldType::Str),
    ],
};

/// Built-in schema for a kind.
pub fn builtin_schema(kind: EntityKind) -> &'static Schema {
    match kind {
        EntityKind::Chassis => &CHASSIS_SCHEMA,
        EntityKind::LogicalSwitch => &LOGICAL_SWITCH_SCHEMA,
        EntityKind::LogicalPort => &LOGICAL_PORT_SCHEMA,
        EntityKind::LogicalRouter => &LOGICAL_ROUTER_SCHEMA,
        EntityKind::LocalLabeledRoute => &LOCAL_LABELED_ROUTE_SCHEMA,
        EntityKind::RemoteLabeledRoute => &REMOTE_LABELED_ROUTE_SCHEMA,
    }
}

// ---------------------------------------------------------------------------
// Entities
// ---------------------------------------------------------------------------

/// A forwarding node. Owned by chassis management; read-only to the core.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chassis {
    pub name: String,
    pub ip: IpAddr,
    pub tunnel_type: String,
}

/// A subnet embedded in exactly one logical switch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subnet {
    pub id: String,
    pub cidr: IpNet,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gateway_ip: Option<IpAddr>,
    #[serde(rename = "enable_dhcp", default)]
    pub dhcp_enabled: bool,
    #[serde(rename = "dhcp_ip", default, skip_serializing_if = "Option::is_none")]
    pub dhcp_server_address: Option<IpAddr>,
}

/// A virtual L2 segment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogicalSwitch {
    #[serde(rename = "name")]
    pub id: String,
    /// Network key used as the pipeline metadata tag. Stable for the
    /// switch's lifetime.
    pub unique_key: u64,
    #[serde(default)]
    pub subnets: Vec<Subnet>,
}

/// An attachment point on a logical switch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogicalPort {
    #[serde(rename = "name")]
    pub id: String,
    /// Id of the owning switch, resolved through the store.
    pub lswitch: String,
    /// Port key, unique within the local forwarding fabric.
    pub tunnel_key: u32,
    #[serde(default)]
    pub macs: Vec<MacAddress>,
    #[serde(default)]
    pub ips: Vec<IpAddr>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chassis: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_owner: Option<String>,
    /// Local, non-authoritative annotations. Never written to the store.
    #[serde(skip)]
    pub external: BTreeMap<String, String>,
}

impl LogicalPort {
    pub fn mac(&self) -> Option<MacAddress> {
        self.macs.first().copied()
    }

    pub fn ip(&self) -> Option<IpAddr> {
        self.ips.first().copied()
    }

    pub fn set_external_value(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.external.insert(key.into(), value.into());
    }

    pub fn external_value(&self, key: &str) -> Option<&str> {
        self.external.get(key).map(String::as_str)
    }
}

/// A router interface attached to a logical switch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogicalRouterPort {
    pub name: String,
    pub lswitch: String,
    pub mac: MacAddress,
    /// Interface address with prefix length (`10.0.0.1/24`).
    pub network: IpNet,
    pub tunnel_key: u32,
}

impl LogicalRouterPort {
    pub fn ip(&self) -> IpAddr {
        self.network.addr()
    }

    pub fn cidr_network(&self) -> IpAddr {
        self.network.network()
    }

    pub fn cidr_netmask(&self) -> IpAddr {
        self.network.netmask()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogicalRouter {
    pub name: String,
    #[serde(default)]
    pub ports: Vec<LogicalRouterPort>,
}

/// A label bound to traffic for a port hosted on this node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalLabeledRoute {
    pub id: String,
    #[serde(rename = "dest_ip")]
    pub destination: IpNet,
    /// Id of the bound logical port.
    pub port: String,
    pub label: u32,
}

/// A label bound to traffic leaving through a remote node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteLabeledRoute {
    pub id: String,
    pub destination: IpNet,
    pub nexthop: IpAddr,
    pub label: u32,
    /// Port used only to find the owning network.
    pub helper_port: String,
}

/// Any decoded northbound entity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Entity {
    Chassis(Chassis),
    LogicalSwitch(LogicalSwitch),
    LogicalPort(LogicalPort),
    LogicalRouter(LogicalRouter),
    LocalLabeledRoute(LocalLabeledRoute),
    RemoteLabeledRoute(RemoteLabeledRoute),
}

impl Entity {
    pub fn kind(&self) -> EntityKind {
        match self {
            Entity::Chassis(_) => EntityKind::Chassis,
            Entity::LogicalSwitch(_) => EntityKind::LogicalSwitch,
            Entity::LogicalPort(_) => EntityKind::LogicalPort,
            Entity::LogicalRouter(_) => EntityKind::LogicalRouter,
            Entity::LocalLabeledRoute(_) => EntityKind::LocalLabeledRoute,
            Entity::RemoteLabeledRoute(_) => EntityKind::RemoteLabeledRoute,
        }
    }

    pub fn id(&self) -> &str {
        match self {
            Entity::Chassis(c) => &c.name,
            Entity::LogicalSwitch(s) => &s.id,
            Entity::LogicalPort(p) => &p.id,
            Entity::LogicalRouter(r) => &r.name,
            Entity::LocalLabeledRoute(r) => &r.id,
            Entity::RemoteLabeledRoute(r) => &r.id,
        }
    }
}

macro_rules! entity_conversions {
    ($($variant:ident),* $(,)?) => {
        $(
            impl From<$variant> for Entity {
                fn from(value: $variant) -> Self {
                    Entity::$variant(value)
                }
            }

            impl TryFrom<Entity> for $variant {
                type Error = Entity;

                fn try_from(entity: Entity) -> Result<Self, Self::Error> {
                    match entity {
                        Entity::$variant(value) => Ok(value),
                        other => Err(other),
                    }
                }
            }
        )*
    };
}

entity_conversions!(
    Chassis,
    LogicalSwitch,
    LogicalPort,
    LogicalRouter,
    LocalLabeledRoute,
    RemoteLabeledRoute,
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_id_fields_exist_in_schemas() {
        for kind in EntityKind::ALL {
            let schema = builtin_schema(kind);
            assert!(schema.field(schema.id_field).is_some(), "{kind}");
        }
    }

    #[test]
    fn test_router_port_addressing() {
        let port = LogicalRouterPort {
            name: "lrp1".to_string(),
            lswitch: "sw1".to_string(),
            mac: "fa:16:3e:00:00:01".parse().unwrap(),
            network: "10.0.0.1/24".parse().unwrap(),
            tunnel_key: 3,
        };
        assert_eq!(port.ip().to_string(), "10.0.0.1");
        assert_eq!(port.cidr_network().to_string(), "10.0.0.0");
        assert_eq!(port.cidr_netmask().to_string(), "255.255.255.0");
    }

    #[test]
    fn test_external_values_are_not_serialized() {
        let mut port = LogicalPort {
            id: "p1".to_string(),
            lswitch: "sw1".to_string(),
            tunnel_key: 5,
            macs: vec![],
            ips: vec![],
            chassis: None,
            device_owner: None,
            external: BTreeMap::new(),
        };
        port.set_external_value("ofport", "18");
        assert_eq!(port.external_value("ofport"), Some("18"));

        let json = serde_json::to_value(&port).unwrap();
        assert!(json.get("external").is_none());
        assert_eq!(json["name"], "p1");
    }

    #[test]
    fn test_entity_conversions() {
        let route = LocalLabeledRoute {
            id: "r1".to_string(),
            destination: "10.0.0.0/24".parse().unwrap(),
            port: "p1".to_string(),
            label: 16,
        };
        let entity = Entity::from(route.clone());
        assert_eq!(entity.kind(), EntityKind::LocalLabeledRoute);
        assert_eq!(entity.id(), "r1");
        assert_eq!(LocalLabeledRoute::try_from(entity), Ok(route));
    }
}
