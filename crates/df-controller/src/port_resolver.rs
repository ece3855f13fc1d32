//! Interface name to device port number lookup.

use std::collections::HashMap;

use async_trait::async_trait;
use df_nb::BackendError;
use parking_lot::RwLock;

/// Maps local interface names to datapath port numbers.
#[async_trait]
pub trait PortResolver: Send + Sync {
    /// Refreshes the resolver's view of the local switch. Called before
    /// each store mutation is handled. A port that is still coming up is
    /// reported as [`BackendError::NotReady`].
    async fn sync(&self) -> Result<(), BackendError>;

    fn port_number(&self, interface: &str) -> Option<u32>;
}

/// Resolver backed by a fixed table, optionally requiring some interfaces
/// to be present before events are handled.
#[derive(Debug, Default)]
pub struct StaticPortResolver {
    ports: RwLock<HashMap<String, u32>>,
    required: Vec<String>,
}

impl StaticPortResolver {
    pub fn new(ports: HashMap<String, u32>) -> Self {
        Self {
            ports: RwLock::new(ports),
            required: Vec::new(),
        }
    }

    /// Interfaces that must resolve before `sync` succeeds.
    pub fn requiring(mut self, interfaces: impl IntoIterator<Item = String>) -> Self {
        self.required = interfaces.into_iter().collect();
        self
    }

    pub fn set_port(&self, interface: impl Into<String>, number: u32) {
        self.ports.write().insert(interface.into(), number);
    }

    pub fn remove_port(&self, interface: &str) {
        self.ports.write().remove(interface);
    }
}

#[async_trait]
impl PortResolver for StaticPortResolver {
    async fn sync(&self) -> Result<(), BackendError> {
        let ports = self.ports.read();
        match self.required.iter().find(|name| !ports.contains_key(*name)) {
            Some(missing) => Err(BackendError::NotReady(format!(
                "interface {missing} has no port number"
            ))),
            None => Ok(()),
        }
    }

    fn port_number(&self, interface: &str) -> Option<u32> {
        self.ports.read().get(interface).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_required_interface_gates_sync() {
        let resolver =
            StaticPortResolver::new(HashMap::new()).requiring(["eth1".to_string()]);
        assert!(matches!(resolver.sync().await, Err(BackendError::NotReady(_))));

        resolver.set_port("eth1", 18);
        resolver.sync().await.unwrap();
        assert_eq!(resolver.port_number("eth1"), Some(18));
        assert_eq!(resolver.port_number("eth2"), None);
    }
}
