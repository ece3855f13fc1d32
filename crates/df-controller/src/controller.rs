//! The controller: receives store callbacks and dispatches them to apps.

use std::sync::Arc;

use async_trait::async_trait;
use df_model::{
    Chassis, Entity, EntityKind, LocalLabeledRoute, LogicalPort, LogicalRouter, LogicalSwitch,
    RemoteLabeledRoute,
};
use df_nb::{BackendError, NbEventSink};
use log::{error, info, warn};

use crate::app::DfApp;
use crate::dispatcher::{EventDispatcher, NbEvent};
use crate::error::ControllerError;
use crate::port_resolver::PortResolver;

/// Local controller. Owns the subscription table and the set of apps.
pub struct Controller {
    dispatcher: EventDispatcher,
    ports: Arc<dyn PortResolver>,
    apps: Vec<Arc<dyn DfApp>>,
}

impl Controller {
    pub fn new(ports: Arc<dyn PortResolver>) -> Self {
        Self {
            dispatcher: EventDispatcher::new(),
            ports,
            apps: Vec::new(),
        }
    }

    /// Adds an app and subscribes it to its events.
    pub fn add_app<A: DfApp + 'static>(&mut self, app: Arc<A>) {
        info!("Registering app '{}'", app.name());
        self.dispatcher.register_app(app.clone());
        self.apps.push(app);
    }

    pub fn dispatcher(&self) -> &EventDispatcher {
        &self.dispatcher
    }

    /// Tells every app the forwarding device is reachable. Every app is
    /// attached; the first failure is returned.
    pub async fn attach_datapath(&self) -> Result<(), ControllerError> {
        let mut first_failure = None;
        for app in &self.apps {
            match app.on_datapath_attached().await {
                Ok(()) => info!("App '{}' attached", app.name()),
                Err(source) => {
                    error!("App '{}' failed to attach: {}", app.name(), source);
                    first_failure.get_or_insert(ControllerError::Attach {
                        app: app.name().to_string(),
                        source,
                    });
                }
            }
        }
        first_failure.map_or(Ok(()), Err)
    }

    async fn dispatch(&self, event: NbEvent) {
        // Failures are already logged per handler.
        if let Err(err) = self.dispatcher.dispatch(&event).await {
            warn!("{} {} '{}': {}", event.kind, event.event, event.id(), err);
        }
    }

    async fn upserted(&self, entity: Entity) {
        self.dispatch(NbEvent::upserted(entity)).await;
    }

    async fn deleted(&self, kind: EntityKind, id: &str) {
        self.dispatch(NbEvent::deleted(kind, id)).await;
    }
}

#[async_trait]
impl NbEventSink for Controller {
    async fn sync(&self) -> Result<(), BackendError> {
        self.ports.sync().await
    }

    async fn chassis_created(&self, chassis: Chassis) {
        self.upserted(chassis.into()).await;
    }

    async fn chassis_deleted(&self, id: &str) {
        self.deleted(EntityKind::Chassis, id).await;
    }

    async fn logical_switch_updated(&self, lswitch: LogicalSwitch) {
        self.upserted(lswitch.into()).await;
    }

    async fn logical_switch_deleted(&self, id: &str) {
        self.deleted(EntityKind::LogicalSwitch, id).await;
    }

    async fn logical_port_updated(&self, lport: LogicalPort) {
        self.upserted(lport.into()).await;
    }

    async fn logical_port_deleted(&self, id: &str) {
        self.deleted(EntityKind::LogicalPort, id).await;
    }

    async fn router_updated(&self, lrouter: LogicalRouter) {
        self.upserted(lrouter.into()).await;
    }

    async fn router_deleted(&self, id: &str) {
        self.deleted(EntityKind::LogicalRouter, id).await;
    }

    async fn local_labeled_route_created(&self, route: LocalLabeledRoute) {
        self.upserted(route.into()).await;
    }

    async fn local_labeled_route_deleted(&self, id: &str) {
        self.deleted(EntityKind::LocalLabeledRoute, id).await;
    }

    async fn remote_labeled_route_created(&self, route: RemoteLabeledRoute) {
        self.upserted(route.into()).await;
    }

    async fn remote_labeled_route_deleted(&self, id: &str) {
        self.deleted(EntityKind::RemoteLabeledRoute, id).await;
    }
}
