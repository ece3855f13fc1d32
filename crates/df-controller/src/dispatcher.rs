//! Event dispatch to registered handlers.
//!
//! Handlers subscribe to one (entity kind, event kind) pair per call. All
//! handlers of a pair run in registration order; a failing handler does not
//! stop the ones after it, and every failure is reported once all have run.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use df_model::{Entity, EntityKind, EventKind};
use log::{debug, error};

use crate::error::{DispatchError, HandlerFailure, Result};

/// What an event carries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    /// The new state of a created or updated entity.
    Entity(Entity),
    /// Id of a deleted entity.
    Id(String),
}

/// A lifecycle event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NbEvent {
    pub kind: EntityKind,
    pub event: EventKind,
    pub payload: Payload,
}

impl NbEvent {
    /// Event for a created or updated entity.
    pub fn upserted(entity: Entity) -> Self {
        let kind = entity.kind();
        Self {
            kind,
            event: kind.upsert_event(),
            payload: Payload::Entity(entity),
        }
    }

    pub fn deleted(kind: EntityKind, id: impl Into<String>) -> Self {
        Self {
            kind,
            event: EventKind::Deleted,
            payload: Payload::Id(id.into()),
        }
    }

    pub fn id(&self) -> &str {
        match &self.payload {
            Payload::Entity(entity) => entity.id(),
            Payload::Id(id) => id,
        }
    }

    pub fn entity(&self) -> Option<&Entity> {
        match &self.payload {
            Payload::Entity(entity) => Some(entity),
            Payload::Id(_) => None,
        }
    }
}

#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Name used when reporting failures.
    fn name(&self) -> &str;

    async fn handle(&self, event: &NbEvent) -> Result<()>;
}

/// Subscription table built during application setup.
#[derive(Default)]
pub struct EventDispatcher {
    subscriptions: HashMap<(EntityKind, EventKind), Vec<Arc<dyn EventHandler>>>,
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, kind: EntityKind, event: EventKind, handler: Arc<dyn EventHandler>) {
        debug!("Handler '{}' subscribed to {} {}", handler.name(), kind, event);
        self.subscriptions
            .entry((kind, event))
            .or_default()
            .push(handler);
    }

    /// Number of handlers subscribed to a pair.
    pub fn handler_count(&self, kind: EntityKind, event: EventKind) -> usize {
        self.subscriptions
            .get(&(kind, event))
            .map_or(0, Vec::len)
    }

    /// Runs every handler subscribed to the event's pair.
    pub async fn dispatch(&self, event: &NbEvent) -> std::result::Result<(), DispatchError> {
        let Some(handlers) = self.subscriptions.get(&(event.kind, event.event)) else {
            return Ok(());
        };

        let mut failures = Vec::new();
        for handler in handlers {
            if let Err(err) = handler.handle(event).await {
                error!(
                    "Handler '{}' failed on {} {} '{}': {}",
                    handler.name(),
                    event.kind,
                    event.event,
                    event.id(),
                    err
                );
                failures.push(HandlerFailure {
                    handler: handler.name().to_string(),
                    kind: event.kind,
                    event: event.event,
                    error: err,
                });
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(DispatchError { failures })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::HandlerError;
    use df_model::Chassis;
    use parking_lot::Mutex;
    use pretty_assertions::assert_eq;

    struct Recorder {
        name: String,
        log: Arc<Mutex<Vec<String>>>,
        fail: bool,
    }

    #[async_trait]
    impl EventHandler for Recorder {
        fn name(&self) -> &str {
            &self.name
        }

        async fn handle(&self, event: &NbEvent) -> Result<()> {
            self.log
                .lock()
                .push(format!("{}:{}:{}", self.name, event.event, event.id()));
            if self.fail {
                return Err(HandlerError::Unresolved("test".to_string()));
            }
            Ok(())
        }
    }

    fn recorder(name: &str, log: &Arc<Mutex<Vec<String>>>, fail: bool) -> Arc<dyn EventHandler> {
        Arc::new(Recorder {
            name: name.to_string(),
            log: log.clone(),
            fail,
        })
    }

    fn chassis_event() -> NbEvent {
        NbEvent::upserted(Entity::Chassis(Chassis {
            name: "host1".to_string(),
            ip: "192.0.2.1".parse().unwrap(),
            tunnel_type: "vxlan".to_string(),
        }))
    }

    #[tokio::test]
    async fn test_handlers_run_in_registration_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut dispatcher = EventDispatcher::new();
        dispatcher.register(EntityKind::Chassis, EventKind::Created, recorder("a", &log, false));
        dispatcher.register(EntityKind::Chassis, EventKind::Created, recorder("b", &log, false));
        dispatcher.register(EntityKind::Chassis, EventKind::Deleted, recorder("c", &log, false));

        dispatcher.dispatch(&chassis_event()).await.unwrap();
        assert_eq!(
            *log.lock(),
            vec!["a:created:host1".to_string(), "b:created:host1".to_string()]
        );
        assert_eq!(dispatcher.handler_count(EntityKind::Chassis, EventKind::Created), 2);
    }

    #[tokio::test]
    async fn test_failures_are_collected_and_do_not_stop_others() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut dispatcher = EventDispatcher::new();
        dispatcher.register(EntityKind::Chassis, EventKind::Created, recorder("a", &log, true));
        dispatcher.register(EntityKind::Chassis, EventKind::Created, recorder("b", &log, false));
        dispatcher.register(EntityKind::Chassis, EventKind::Created, recorder("c", &log, true));

        let err = dispatcher.dispatch(&chassis_event()).await.unwrap_err();
        assert_eq!(log.lock().len(), 3);
        let failed: Vec<_> = err.failures.iter().map(|f| f.handler.as_str()).collect();
        assert_eq!(failed, vec!["a", "c"]);
        assert_eq!(err.failures[0].kind, EntityKind::Chassis);
        assert_eq!(err.failures[0].event, EventKind::Created);
    }

    #[tokio::test]
    async fn test_unsubscribed_pair_is_ok() {
        let dispatcher = EventDispatcher::new();
        dispatcher
            .dispatch(&NbEvent::deleted(EntityKind::LogicalPort, "p1"))
            .await
            .unwrap();
    }
}
