//! Backend-agnostic northbound API and the controller-facing event sink.

use async_trait::async_trait;
use df_model::{
    Chassis, Entity, EntityKind, LocalLabeledRoute, LogicalPort, LogicalRouter, LogicalSwitch,
    Record, RemoteLabeledRoute,
};
use tokio_util::sync::CancellationToken;

use crate::error::{BackendError, Result};

/// Typed access to the northbound store.
#[async_trait]
pub trait NbApi: Send + Sync {
    /// Reads one entity. Absence is `Ok(None)`, not an error.
    async fn get(&self, kind: EntityKind, id: &str) -> Result<Option<Entity>>;

    /// Lists every entity of a kind, in no particular order.
    async fn list(&self, kind: EntityKind) -> Result<Vec<Entity>>;

    /// Stores a new entity built from `fields`. The id field is set from `id`.
    async fn create(&self, kind: EntityKind, id: &str, fields: Record) -> Result<()>;

    /// Changes only the supplied fields of an existing entity.
    async fn update(&self, kind: EntityKind, id: &str, fields: Record) -> Result<()>;

    /// Removes an entity. Removing an absent id succeeds.
    async fn delete(&self, kind: EntityKind, id: &str) -> Result<()>;

    /// Delivers every store change to `sink`, in backend order, until a fatal
    /// error or until `shutdown` is cancelled.
    async fn watch(&self, sink: &dyn NbEventSink, shutdown: CancellationToken) -> Result<()>;

    async fn get_logical_port(&self, id: &str) -> Result<Option<LogicalPort>> {
        Ok(self
            .get(EntityKind::LogicalPort, id)
            .await?
            .and_then(|e| LogicalPort::try_from(e).ok()))
    }

    async fn get_logical_switch(&self, id: &str) -> Result<Option<LogicalSwitch>> {
        Ok(self
            .get(EntityKind::LogicalSwitch, id)
            .await?
            .and_then(|e| LogicalSwitch::try_from(e).ok()))
    }
}

/// Receiver of decoded lifecycle events.
///
/// Callbacks do not return errors: the receiver reports its own handler
/// failures, and the watch loop keeps running regardless.
#[async_trait]
pub trait NbEventSink: Send + Sync {
    /// Called before each mutation is handled. A [`BackendError::NotReady`]
    /// makes the loop retry the same mutation.
    async fn sync(&self) -> std::result::Result<(), BackendError> {
        Ok(())
    }

    async fn chassis_created(&self, chassis: Chassis);
    async fn chassis_deleted(&self, id: &str);

    async fn logical_switch_updated(&self, lswitch: LogicalSwitch);
    async fn logical_switch_deleted(&self, id: &str);

    async fn logical_port_updated(&self, lport: LogicalPort);
    async fn logical_port_deleted(&self, id: &str);

    async fn router_updated(&self, lrouter: LogicalRouter);
    async fn router_deleted(&self, id: &str);

    async fn local_labeled_route_created(&self, route: LocalLabeledRoute);
    async fn local_labeled_route_deleted(&self, id: &str);

    async fn remote_labeled_route_created(&self, route: RemoteLabeledRoute);
    async fn remote_labeled_route_deleted(&self, id: &str);
}

/// Invokes the upsert callback matching the entity's kind.
pub async fn deliver_upsert(sink: &dyn NbEventSink, entity: Entity) {
    match entity {
        Entity::Chassis(c) => sink.chassis_created(c).await,
        Entity::LogicalSwitch(s) => sink.logical_switch_updated(s).await,
        Entity::LogicalPort(p) => sink.logical_port_updated(p).await,
        Entity::LogicalRouter(r) => sink.router_updated(r).await,
        Entity::LocalLabeledRoute(r) => sink.local_labeled_route_created(r).await,
        Entity::RemoteLabeledRoute(r) => sink.remote_labeled_route_created(r).await,
    }
}

/// Invokes the delete callback for a kind.
pub async fn deliver_delete(sink: &dyn NbEventSink, kind: EntityKind, id: &str) {
    match kind {
        EntityKind::Chassis => sink.chassis_deleted(id).await,
        EntityKind::LogicalSwitch => sink.logical_switch_deleted(id).await,
        EntityKind::LogicalPort => sink.logical_port_deleted(id).await,
        EntityKind::LogicalRouter => sink.router_deleted(id).await,
        EntityKind::LocalLabeledRoute => sink.local_labeled_route_deleted(id).await,
        EntityKind::RemoteLabeledRoute => sink.remote_labeled_route_deleted(id).await,
    }
}
