//! Entity kinds and lifecycle event kinds.

use std::fmt;

/// A kind of northbound entity. Each kind owns one key namespace in the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EntityKind {
    Chassis,
    LogicalSwitch,
    LogicalPort,
    LogicalRouter,
    LocalLabeledRoute,
    RemoteLabeledRoute,
}

impl EntityKind {
    /// All kinds, in dependency order (a kind only references kinds before it).
    pub const ALL: [EntityKind; 6] = [
        EntityKind::Chassis,
        EntityKind::LogicalSwitch,
        EntityKind::LogicalPort,
        EntityKind::LogicalRouter,
        EntityKind::LocalLabeledRoute,
        EntityKind::RemoteLabeledRoute,
    ];

    /// Store namespace for this kind (`<namespace>/<id>`).
    pub const fn namespace(&self) -> &'static str {
        match self {
            EntityKind::Chassis => "chassis",
            EntityKind::LogicalSwitch => "lswitch",
            EntityKind::LogicalPort => "lport",
            EntityKind::LogicalRouter => "lrouter",
            EntityKind::LocalLabeledRoute => "llroutes",
            EntityKind::RemoteLabeledRoute => "rlroutes",
        }
    }

    /// Resolves a namespace by exact match.
    pub fn from_namespace(namespace: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.namespace() == namespace)
    }

    /// The event raised when an entry of this kind is written.
    ///
    /// Chassis and labeled routes are reported as created; switches, ports and
    /// routers as updated, since a write may replace an existing record.
    pub const fn upsert_event(&self) -> EventKind {
        match self {
            EntityKind::Chassis
            | EntityKind::LocalLabeledRoute
            | EntityKind::RemoteLabeledRoute => EventKind::Created,
            EntityKind::LogicalSwitch | EntityKind::LogicalPort | EntityKind::LogicalRouter => {
                EventKind::Updated
            }
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.namespace())
    }
}

/// Lifecycle event kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EventKind {
    Created,
    Updated,
    Deleted,
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventKind::Created => f.write_str("created"),
            EventKind::Updated => f.write_str("updated"),
            EventKind::Deleted => f.write_str("deleted"),
        }
    }
}
