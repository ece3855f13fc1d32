//! Key-value-backed implementation of [`NbApi`].
//!
//! Entities live at `<namespace>/<id>`. Updates and nested edits (subnets,
//! router ports) read the current record, apply the change and write the
//! whole record back. Under [`UpdatePolicy::CompareAndSwap`] the write is
//! conditional on the record not having changed since the read, and the
//! edit is retried on conflict. Under [`UpdatePolicy::ReadModifyWrite`] the
//! write is unconditional: two concurrent updates of the same id can lose
//! one of them (last writer wins for the whole record), so callers must keep
//! a single writer per id.

use std::net::IpAddr;
use std::sync::Arc;

use async_trait::async_trait;
use df_model::{
    Chassis, EncodeError, Entity, EntityKind, LogicalPort, LogicalRouter, LogicalRouterPort,
    LogicalSwitch, ModelRegistry, Record, Subnet,
};
use log::{debug, warn};
use serde::Serialize;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::api::{NbApi, NbEventSink};
use crate::backend::KvBackend;
use crate::error::{BackendError, NbError, Result};
use crate::watch::WatchLoop;

/// Write discipline for updates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UpdatePolicy {
    /// Conditional write on the read modification index, retried on conflict.
    #[default]
    CompareAndSwap,
    /// Unconditional write of the merged record. Concurrent updates of the
    /// same id may lose one update.
    ReadModifyWrite,
}

/// Driver settings.
#[derive(Debug, Clone)]
pub struct DriverConfig {
    pub update_policy: UpdatePolicy,
    /// Compare-and-swap attempts before giving up.
    pub max_update_attempts: u32,
    /// List the whole store before watching.
    pub initial_sync: bool,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            update_policy: UpdatePolicy::CompareAndSwap,
            max_update_attempts: 5,
            initial_sync: true,
        }
    }
}

/// Northbound driver over a [`KvBackend`].
pub struct KvNbDriver {
    backend: Arc<dyn KvBackend>,
    registry: Arc<ModelRegistry>,
    config: DriverConfig,
}

fn entity_key(kind: EntityKind, id: &str) -> String {
    format!("{}/{}", kind.namespace(), id)
}

fn to_record_value<T: Serialize>(kind: EntityKind, value: &T) -> Result<Value> {
    serde_json::to_value(value).map_err(|e| {
        NbError::Encode(EncodeError::Serialize {
            kind,
            message: e.to_string(),
        })
    })
}

fn list_field<'a>(
    kind: EntityKind,
    id: &str,
    record: &'a mut Record,
    field: &str,
) -> Result<&'a mut Vec<Value>> {
    record
        .entry(field.to_string())
        .or_insert_with(|| Value::Array(Vec::new()))
        .as_array_mut()
        .ok_or_else(|| NbError::InvalidFields {
            kind,
            id: id.to_string(),
            source: df_model::DecodeError::TypeMismatch {
                kind,
                field: field.to_string(),
                expected: "a list",
            },
        })
}

impl KvNbDriver {
    pub fn new(backend: Arc<dyn KvBackend>, registry: Arc<ModelRegistry>) -> Self {
        Self::with_config(backend, registry, DriverConfig::default())
    }

    pub fn with_config(
        backend: Arc<dyn KvBackend>,
        registry: Arc<ModelRegistry>,
        config: DriverConfig,
    ) -> Self {
        Self {
            backend,
            registry,
            config,
        }
    }

    pub fn registry(&self) -> &Arc<ModelRegistry> {
        &self.registry
    }

    /// A watch loop over this driver's backend, configured per the driver.
    pub async fn watch_loop(&self) -> Result<WatchLoop> {
        let watch = WatchLoop::new(self.backend.clone(), self.registry.clone());
        if self.config.initial_sync {
            return Ok(watch);
        }
        let index = self.backend.list("").await?.index;
        Ok(watch.starting_at(index + 1))
    }

    /// Validates a record and serializes it for the backend.
    fn encode_record(&self, kind: EntityKind, id: &str, record: Record) -> Result<Vec<u8>> {
        let entry = self
            .registry
            .entry(kind)
            .ok_or(EncodeError::UnknownKind { kind })?;
        let record = entry
            .schema
            .validate(kind, record)
            .map_err(|source| NbError::InvalidFields {
                kind,
                id: id.to_string(),
                source,
            })?;
        df_model::registry::entity_from_record(kind, record.clone()).map_err(|source| {
            NbError::InvalidFields {
                kind,
                id: id.to_string(),
                source,
            }
        })?;
        Ok(self.registry.record_to_raw(kind, &record)?)
    }

    fn with_id(&self, kind: EntityKind, id: &str, mut record: Record) -> Result<Record> {
        let entry = self
            .registry
            .entry(kind)
            .ok_or(EncodeError::UnknownKind { kind })?;
        record.insert(entry.schema.id_field.to_string(), Value::String(id.to_string()));
        Ok(record)
    }

    /// Applies `edit` to the stored record of `kind/id` and writes it back
    /// according to the update policy.
    async fn modify<F>(&self, kind: EntityKind, id: &str, mut edit: F) -> Result<()>
    where
        F: FnMut(&mut Record) -> Result<()> + Send,
    {
        let key = entity_key(kind, id);
        let attempts = match self.config.update_policy {
            UpdatePolicy::CompareAndSwap => self.config.max_update_attempts.max(1),
            UpdatePolicy::ReadModifyWrite => 1,
        };

        for attempt in 1..=attempts {
            let Some(current) = self.backend.read(&key).await? else {
                return Err(NbError::NotFound {
                    kind,
                    id: id.to_string(),
                });
            };
            let mut record = self.registry.raw_to_record(kind, &current.value)?;
            edit(&mut record)?;
            let record = self.with_id(kind, id, record)?;
            let raw = self.encode_record(kind, id, record)?;

            match self.config.update_policy {
                UpdatePolicy::ReadModifyWrite => {
                    self.backend.write(&key, raw).await?;
                    return Ok(());
                }
                UpdatePolicy::CompareAndSwap => {
                    match self
                        .backend
                        .compare_and_swap(&key, raw, current.modified_index)
                        .await
                    {
                        Ok(_) => return Ok(()),
                        Err(BackendError::Conflict { .. }) => {
                            debug!("Update of {} conflicted (attempt {})", key, attempt);
                        }
                        Err(e) => return Err(e.into()),
                    }
                }
            }
        }

        warn!("Giving up on update of {} after {} attempts", key, attempts);
        Err(NbError::UpdateConflict {
            kind,
            id: id.to_string(),
            attempts,
        })
    }

    /// Like [`modify`](Self::modify), but a missing record is reported as a
    /// missing parent.
    async fn modify_parent<F>(&self, kind: EntityKind, id: &str, edit: F) -> Result<()>
    where
        F: FnMut(&mut Record) -> Result<()> + Send,
    {
        self.modify(kind, id, edit).await.map_err(|e| match e {
            NbError::NotFound { kind, id } => NbError::MissingParent { kind, id },
            other => other,
        })
    }

    async fn list_typed<T>(&self, kind: EntityKind) -> Result<Vec<T>>
    where
        T: TryFrom<Entity> + Send,
    {
        Ok(self
            .list(kind)
            .await?
            .into_iter()
            .filter_map(|e| T::try_from(e).ok())
            .collect())
    }

    // Chassis.

    pub async fn add_chassis(&self, name: &str, ip: IpAddr, tunnel_type: &str) -> Result<()> {
        let entity = Entity::Chassis(Chassis {
            name: name.to_string(),
            ip,
            tunnel_type: tunnel_type.to_string(),
        });
        let raw = self.registry.encode(&entity)?;
        self.backend
            .write(&entity_key(EntityKind::Chassis, name), raw)
            .await?;
        Ok(())
    }

    pub async fn get_chassis(&self, name: &str) -> Result<Option<Chassis>> {
        Ok(self
            .get(EntityKind::Chassis, name)
            .await?
            .and_then(|e| Chassis::try_from(e).ok()))
    }

    pub async fn list_chassis(&self) -> Result<Vec<Chassis>> {
        self.list_typed(EntityKind::Chassis).await
    }

    // Logical switches and subnets.

    pub async fn create_lswitch(&self, name: &str, fields: Record) -> Result<()> {
        self.create(EntityKind::LogicalSwitch, name, fields).await
    }

    pub async fn update_lswitch(&self, name: &str, fields: Record) -> Result<()> {
        self.update(EntityKind::LogicalSwitch, name, fields).await
    }

    pub async fn delete_lswitch(&self, name: &str) -> Result<()> {
        self.delete(EntityKind::LogicalSwitch, name).await
    }

    pub async fn list_lswitches(&self) -> Result<Vec<LogicalSwitch>> {
        self.list_typed(EntityKind::LogicalSwitch).await
    }

    /// Adds a subnet to a switch, replacing any subnet with the same id.
    pub async fn add_subnet(&self, lswitch: &str, subnet: &Subnet) -> Result<()> {
        let kind = EntityKind::LogicalSwitch;
        let value = to_record_value(kind, subnet)?;
        let subnet_id = Value::String(subnet.id.clone());
        self.modify_parent(kind, lswitch, |record| {
            let subnets = list_field(kind, lswitch, record, "subnets")?;
            subnets.retain(|s| s.get("id") != Some(&subnet_id));
            subnets.push(value.clone());
            Ok(())
        })
        .await
    }

    /// Removes a subnet from a switch. An absent subnet is not an error.
    pub async fn delete_subnet(&self, lswitch: &str, subnet_id: &str) -> Result<()> {
        let kind = EntityKind::LogicalSwitch;
        self.modify_parent(kind, lswitch, |record| {
            let subnets = list_field(kind, lswitch, record, "subnets")?;
            subnets.retain(|s| s.get("id").and_then(Value::as_str) != Some(subnet_id));
            Ok(())
        })
        .await
    }

    // Logical ports.

    pub async fn create_lport(&self, name: &str, lswitch: &str, mut fields: Record) -> Result<()> {
        fields.insert("lswitch".to_string(), Value::String(lswitch.to_string()));
        self.create(EntityKind::LogicalPort, name, fields).await
    }

    pub async fn update_lport(&self, name: &str, fields: Record) -> Result<()> {
        self.update(EntityKind::LogicalPort, name, fields).await
    }

    pub async fn delete_lport(&self, name: &str) -> Result<()> {
        self.delete(EntityKind::LogicalPort, name).await
    }

    pub async fn get_lport(&self, name: &str) -> Result<Option<LogicalPort>> {
        self.get_logical_port(name).await
    }

    /// Ports bound to a chassis. Unbound ports are skipped.
    pub async fn list_bound_logical_ports(&self) -> Result<Vec<LogicalPort>> {
        Ok(self
            .list_typed::<LogicalPort>(EntityKind::LogicalPort)
            .await?
            .into_iter()
            .filter(|p| p.chassis.is_some())
            .collect())
    }

    // Logical routers.

    pub async fn create_lrouter(&self, name: &str, fields: Record) -> Result<()> {
        self.create(EntityKind::LogicalRouter, name, fields).await
    }

    pub async fn delete_lrouter(&self, name: &str) -> Result<()> {
        self.delete(EntityKind::LogicalRouter, name).await
    }

    pub async fn list_routers(&self) -> Result<Vec<LogicalRouter>> {
        self.list_typed(EntityKind::LogicalRouter).await
    }

    /// Adds a router port, replacing any port with the same name.
    pub async fn add_lrouter_port(&self, lrouter: &str, port: &LogicalRouterPort) -> Result<()> {
        let kind = EntityKind::LogicalRouter;
        let value = to_record_value(kind, port)?;
        let port_name = Value::String(port.name.clone());
        self.modify_parent(kind, lrouter, |record| {
            let ports = list_field(kind, lrouter, record, "ports")?;
            ports.retain(|p| p.get("name") != Some(&port_name));
            ports.push(value.clone());
            Ok(())
        })
        .await
    }

    /// Removes every port of the router attached to `lswitch`.
    pub async fn delete_lrouter_port(&self, lrouter: &str, lswitch: &str) -> Result<()> {
        let kind = EntityKind::LogicalRouter;
        self.modify_parent(kind, lrouter, |record| {
            let ports = list_field(kind, lrouter, record, "ports")?;
            ports.retain(|p| p.get("lswitch").and_then(Value::as_str) != Some(lswitch));
            Ok(())
        })
        .await
    }
}

#[async_trait]
impl NbApi for KvNbDriver {
    async fn get(&self, kind: EntityKind, id: &str) -> Result<Option<Entity>> {
        match self.backend.read(&entity_key(kind, id)).await? {
            Some(entry) => Ok(Some(self.registry.decode(kind, &entry.value)?)),
            None => Ok(None),
        }
    }

    async fn list(&self, kind: EntityKind) -> Result<Vec<Entity>> {
        let prefix = format!("{}/", kind.namespace());
        let listing = self.backend.list(&prefix).await?;
        listing
            .entries
            .iter()
            .map(|entry| self.registry.decode(kind, &entry.value).map_err(NbError::from))
            .collect()
    }

    async fn create(&self, kind: EntityKind, id: &str, fields: Record) -> Result<()> {
        let record = self.with_id(kind, id, fields)?;
        let raw = self.encode_record(kind, id, record)?;
        self.backend.write(&entity_key(kind, id), raw).await?;
        debug!("Created {} {}", kind, id);
        Ok(())
    }

    async fn update(&self, kind: EntityKind, id: &str, fields: Record) -> Result<()> {
        self.modify(kind, id, |record| {
            for (name, value) in &fields {
                record.insert(name.clone(), value.clone());
            }
            Ok(())
        })
        .await
    }

    async fn delete(&self, kind: EntityKind, id: &str) -> Result<()> {
        self.backend.delete(&entity_key(kind, id)).await?;
        debug!("Deleted {} {}", kind, id);
        Ok(())
    }

    async fn watch(&self, sink: &dyn NbEventSink, shutdown: CancellationToken) -> Result<()> {
        let mut watch = self.watch_loop().await?;
        watch.run(sink, shutdown).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryBackend;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn record(value: Value) -> Record {
        match value {
            Value::Object(map) => map,
            _ => unreachable!(),
        }
    }

    fn driver(backend: Arc<MemoryBackend>) -> KvNbDriver {
        let registry = Arc::new(ModelRegistry::with_builtin_models().unwrap());
        KvNbDriver::new(backend, registry)
    }

    #[tokio::test]
    async fn test_create_get_and_partial_update() {
        let driver = driver(Arc::new(MemoryBackend::new()));
        driver
            .create_lswitch("sw1", record(json!({"unique_key": 3})))
            .await
            .unwrap();
        driver
            .create_lport("p1", "sw1", record(json!({"tunnel_key": 5, "macs": ["fa:16:3e:00:00:01"]})))
            .await
            .unwrap();

        driver
            .update_lport("p1", record(json!({"chassis": "host1"})))
            .await
            .unwrap();

        let port = driver.get_lport("p1").await.unwrap().unwrap();
        assert_eq!(port.lswitch, "sw1");
        assert_eq!(port.tunnel_key, 5);
        assert_eq!(port.chassis.as_deref(), Some("host1"));
        assert_eq!(port.mac().unwrap().to_string(), "fa:16:3e:00:00:01");
    }

    #[tokio::test]
    async fn test_get_absent_is_none() {
        let driver = driver(Arc::new(MemoryBackend::new()));
        assert_eq!(driver.get(EntityKind::LogicalPort, "nope").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_delete_is_idempotent() {
        let driver = driver(Arc::new(MemoryBackend::new()));
        driver.delete_lport("ghost").await.unwrap();
        driver.delete_lport("ghost").await.unwrap();
    }

    #[tokio::test]
    async fn test_update_missing_is_not_found() {
        let driver = driver(Arc::new(MemoryBackend::new()));
        let err = driver
            .update_lport("p1", record(json!({"chassis": "h"})))
            .await
            .unwrap_err();
        assert!(matches!(err, NbError::NotFound { kind: EntityKind::LogicalPort, .. }));
    }

    #[tokio::test]
    async fn test_create_rejects_invalid_fields() {
        let driver = driver(Arc::new(MemoryBackend::new()));
        let err = driver
            .create_lport("p1", "sw1", record(json!({"tunnel_key": "five"})))
            .await
            .unwrap_err();
        assert!(matches!(err, NbError::InvalidFields { .. }));
    }

    #[tokio::test]
    async fn test_subnets() {
        let driver = driver(Arc::new(MemoryBackend::new()));
        driver
            .create_lswitch("sw1", record(json!({"unique_key": 1})))
            .await
            .unwrap();

        let subnet = Subnet {
            id: "s1".to_string(),
            cidr: "10.0.0.0/24".parse().unwrap(),
            gateway_ip: Some("10.0.0.1".parse().unwrap()),
            dhcp_enabled: true,
            dhcp_server_address: None,
        };
        driver.add_subnet("sw1", &subnet).await.unwrap();
        driver.add_subnet("sw1", &subnet).await.unwrap();

        let switches = driver.list_lswitches().await.unwrap();
        assert_eq!(switches[0].subnets, vec![subnet]);

        driver.delete_subnet("sw1", "s1").await.unwrap();
        driver.delete_subnet("sw1", "s1").await.unwrap();
        let switch = driver.get_logical_switch("sw1").await.unwrap().unwrap();
        assert!(switch.subnets.is_empty());

        let err = driver.delete_subnet("sw9", "s1").await.unwrap_err();
        assert!(matches!(err, NbError::MissingParent { .. }));
    }

    #[tokio::test]
    async fn test_router_ports() {
        let driver = driver(Arc::new(MemoryBackend::new()));
        driver
            .create_lrouter("r1", Record::new())
            .await
            .unwrap();
        for (name, lswitch, network) in [("a", "sw1", "10.0.0.1/24"), ("b", "sw2", "10.0.1.1/24")] {
            let port = LogicalRouterPort {
                name: name.to_string(),
                lswitch: lswitch.to_string(),
                mac: "fa:16:3e:00:00:aa".parse().unwrap(),
                network: network.parse().unwrap(),
                tunnel_key: 7,
            };
            driver.add_lrouter_port("r1", &port).await.unwrap();
        }

        driver.delete_lrouter_port("r1", "sw1").await.unwrap();
        let routers = driver.list_routers().await.unwrap();
        let names: Vec<_> = routers[0].ports.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["b"]);
    }

    #[tokio::test]
    async fn test_chassis_and_bound_ports() {
        let driver = driver(Arc::new(MemoryBackend::new()));
        driver
            .add_chassis("host1", "192.0.2.1".parse().unwrap(), "vxlan")
            .await
            .unwrap();
        assert_eq!(driver.list_chassis().await.unwrap().len(), 1);
        assert_eq!(
            driver.get_chassis("host1").await.unwrap().unwrap().tunnel_type,
            "vxlan"
        );

        driver
            .create_lport("p1", "sw1", record(json!({"tunnel_key": 1, "chassis": "host1"})))
            .await
            .unwrap();
        driver
            .create_lport("p2", "sw1", record(json!({"tunnel_key": 2})))
            .await
            .unwrap();
        let bound = driver.list_bound_logical_ports().await.unwrap();
        assert_eq!(bound.len(), 1);
        assert_eq!(bound[0].id, "p1");
    }

    #[tokio::test]
    async fn test_update_keeps_unknown_fields() {
        let backend = Arc::new(MemoryBackend::new());
        backend
            .write(
                "lswitch/sw1",
                br#"{"name":"sw1","unique_key":1,"topic":"tenant-a"}"#.to_vec(),
            )
            .await
            .unwrap();
        let driver = driver(backend.clone());
        driver
            .update_lswitch("sw1", record(json!({"unique_key": 2})))
            .await
            .unwrap();

        let raw = backend.read("lswitch/sw1").await.unwrap().unwrap().value;
        let stored: Value = serde_json::from_slice(&raw).unwrap();
        assert_eq!(stored["topic"], json!("tenant-a"));
        assert_eq!(stored["unique_key"], json!(2));
    }
}
