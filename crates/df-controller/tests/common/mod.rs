#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use df_controller::{
    Controller, ControllerConfig, DfApp, EventHandler, MplsApp, MutationRetry, NbEvent,
    RetryPolicy, StaticPortResolver,
};
use df_model::{EntityKind, EventKind, ModelRegistry, Record};
use df_nb::{KvNbDriver, MemoryBackend, WatchLoop};
use df_pipeline::FlowPipeline;
use parking_lot::Mutex;
use serde_json::Value;

pub const UPLINK_PORT: u32 = 18;
pub const NEXTHOP_IP: &str = "192.0.2.254";
pub const NEXTHOP_MAC: &str = "2c:6b:f5:61:dd:94";

pub fn record(value: Value) -> Record {
    serde_json::from_value(value).unwrap()
}

/// Records every event it is subscribed to as `"<kind> <event> <id>"`.
pub struct RecordingApp {
    subscriptions: Vec<(EntityKind, EventKind)>,
    events: Mutex<Vec<String>>,
}

impl RecordingApp {
    pub fn new(subscriptions: Vec<(EntityKind, EventKind)>) -> Self {
        Self {
            subscriptions,
            events: Mutex::new(Vec::new()),
        }
    }

    pub fn events(&self) -> Vec<String> {
        self.events.lock().clone()
    }
}

#[async_trait]
impl EventHandler for RecordingApp {
    fn name(&self) -> &str {
        "recorder"
    }

    async fn handle(&self, event: &NbEvent) -> df_controller::Result<()> {
        self.events
            .lock()
            .push(format!("{} {} {}", event.kind, event.event, event.id()));
        Ok(())
    }
}

#[async_trait]
impl DfApp for RecordingApp {
    fn subscriptions(&self) -> Vec<(EntityKind, EventKind)> {
        self.subscriptions.clone()
    }
}

/// Store, watch loop, controller, label switching app and pipeline wired
/// together the way the daemon wires them.
pub struct Harness {
    pub backend: Arc<MemoryBackend>,
    pub driver: Arc<KvNbDriver>,
    pub pipeline: Arc<FlowPipeline>,
    pub mpls: Arc<MplsApp>,
    pub controller: Controller,
    pub watch: WatchLoop,
}

impl Harness {
    pub async fn new() -> Self {
        Self::with_apps(Vec::new()).await
    }

    /// Extra apps are registered before the label switching app.
    pub async fn with_apps(apps: Vec<Arc<RecordingApp>>) -> Self {
        let registry = Arc::new(ModelRegistry::with_builtin_models().unwrap());
        let backend =
            Arc::new(MemoryBackend::new().with_watch_timeout(Duration::from_millis(20)));
        let driver = Arc::new(KvNbDriver::new(backend.clone(), registry.clone()));
        let pipeline = Arc::new(FlowPipeline::new());
        let ports = Arc::new(StaticPortResolver::new(HashMap::from([(
            "eth1".to_string(),
            UPLINK_PORT,
        )])));

        let mut settings = ControllerConfig::default().mpls_settings().unwrap();
        settings
            .nexthop_macs
            .insert(NEXTHOP_IP.parse().unwrap(), NEXTHOP_MAC.parse().unwrap());
        let retry = MutationRetry::new(RetryPolicy {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(1),
            multiplier: 2,
        });
        let mpls = Arc::new(MplsApp::new(
            driver.clone(),
            pipeline.clone(),
            ports.clone(),
            settings,
            retry,
        ));

        let mut controller = Controller::new(ports);
        for app in apps {
            controller.add_app(app);
        }
        controller.add_app(mpls.clone());
        controller.attach_datapath().await.unwrap();

        let watch = WatchLoop::new(backend.clone(), registry).starting_at(1);
        Self {
            backend,
            driver,
            pipeline,
            mpls,
            controller,
            watch,
        }
    }

    /// Handles the next `count` store mutations.
    pub async fn poll(&mut self, count: usize) {
        for _ in 0..count {
            self.watch.poll_once(&self.controller).await.unwrap();
        }
    }

    /// Creates switch `sw1` (network key 7) with port `p1` (tunnel key 5).
    pub async fn seed_port(&self) {
        self.driver
            .create_lswitch("sw1", record(serde_json::json!({"unique_key": 7})))
            .await
            .unwrap();
        self.driver
            .create_lport(
                "p1",
                "sw1",
                record(serde_json::json!({
                    "tunnel_key": 5,
                    "macs": ["fa:16:3e:00:00:01"],
                    "ips": ["10.0.0.5"],
                })),
            )
            .await
            .unwrap();
    }
}
