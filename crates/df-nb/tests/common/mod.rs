#![allow(dead_code)]

use std::sync::Arc;

use async_trait::async_trait;
use df_model::{
    Chassis, LocalLabeledRoute, LogicalPort, LogicalRouter, LogicalSwitch, ModelRegistry,
    RemoteLabeledRoute,
};
use df_nb::{BackendError, NbEventSink};
use parking_lot::Mutex;

pub fn registry() -> Arc<ModelRegistry> {
    Arc::new(ModelRegistry::with_builtin_models().unwrap())
}

/// Sink that records every callback as `"<callback> <id>"`.
#[derive(Default)]
pub struct RecordingSink {
    pub events: Mutex<Vec<String>>,
    /// Number of upcoming `sync` calls that report not-ready.
    pub not_ready: Mutex<u32>,
}

impl RecordingSink {
    pub fn events(&self) -> Vec<String> {
        self.events.lock().clone()
    }

    fn push(&self, callback: &str, id: &str) {
        self.events.lock().push(format!("{callback} {id}"));
    }
}

#[async_trait]
impl NbEventSink for RecordingSink {
    async fn sync(&self) -> Result<(), BackendError> {
        let mut not_ready = self.not_ready.lock();
        if *not_ready > 0 {
            *not_ready -= 1;
            return Err(BackendError::NotReady("uplink".to_string()));
        }
        Ok(())
    }

    async fn chassis_created(&self, chassis: Chassis) {
        self.push("chassis_created", &chassis.name);
    }

    async fn chassis_deleted(&self, id: &str) {
        self.push("chassis_deleted", id);
    }

    async fn logical_switch_updated(&self, lswitch: LogicalSwitch) {
        self.push("logical_switch_updated", &lswitch.id);
    }

    async fn logical_switch_deleted(&self, id: &str) {
        self.push("logical_switch_deleted", id);
    }

    async fn logical_port_updated(&self, lport: LogicalPort) {
        self.push("logical_port_updated", &lport.id);
    }

    async fn logical_port_deleted(&self, id: &str) {
        self.push("logical_port_deleted", id);
    }

    async fn router_updated(&self, lrouter: LogicalRouter) {
        self.push("router_updated", &lrouter.name);
    }

    async fn router_deleted(&self, id: &str) {
        self.push("router_deleted", id);
    }

    async fn local_labeled_route_created(&self, route: LocalLabeledRoute) {
        self.push("local_labeled_route_created", &route.id);
    }

    async fn local_labeled_route_deleted(&self, id: &str) {
        self.push("local_labeled_route_deleted", id);
    }

    async fn remote_labeled_route_created(&self, route: RemoteLabeledRoute) {
        self.push("remote_labeled_route_created", &route.id);
    }

    async fn remote_labeled_route_deleted(&self, id: &str) {
        self.push("remote_labeled_route_deleted", id);
    }
}
